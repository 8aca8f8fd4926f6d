// ============================================================================
// Load plans: immutable descriptions of the object graph a load produces
// ============================================================================

pub mod builder;
pub mod influencers;
pub mod strategy;

use std::fmt;

pub use builder::{
    AliasGenerator, AssociationAttribute, FetchStrategySelector, LoadPlanBuilder, cascade_selector, standard_selector,
};
pub use influencers::LoadQueryInfluencers;
pub use strategy::{FetchStrategy, FetchStyle, FetchTiming};

/// Table alias of a joined space and its unique id within the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSpace {
    pub uid: usize,
    pub alias: String,
}

/// Entity space holding the elements of a one-to-many collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementEntity {
    pub entity: String,
    pub uid: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityReturn {
    pub entity: String,
    pub space: JoinSpace,
    pub fetches: Vec<Fetch>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionReturn {
    pub role: String,
    pub space: JoinSpace,
    pub element: Option<ElementEntity>,
    pub fetches: Vec<Fetch>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Return {
    Entity(EntityReturn),
    Collection(CollectionReturn),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityFetch {
    pub attribute: String,
    /// Property path from the owning entity, e.g. `address.country`
    pub path: String,
    pub entity: String,
    pub strategy: FetchStrategy,
    pub depth: usize,
    /// Present iff the fetch is joined into the load statement
    pub join: Option<JoinSpace>,
    pub fetches: Vec<Fetch>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionFetch {
    pub attribute: String,
    pub path: String,
    pub role: String,
    pub strategy: FetchStrategy,
    pub depth: usize,
    pub join: Option<JoinSpace>,
    pub element: Option<ElementEntity>,
    pub fetches: Vec<Fetch>,
}

/// Component attribute whose parts contain associations.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeFetch {
    pub attribute: String,
    pub path: String,
    pub fetches: Vec<Fetch>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Fetch {
    Entity(EntityFetch),
    Collection(CollectionFetch),
    Composite(CompositeFetch),
}

impl Fetch {
    pub fn path(&self) -> &str {
        match self {
            Fetch::Entity(f) => &f.path,
            Fetch::Collection(f) => &f.path,
            Fetch::Composite(f) => &f.path,
        }
    }

    pub fn strategy(&self) -> Option<FetchStrategy> {
        match self {
            Fetch::Entity(f) => Some(f.strategy),
            Fetch::Collection(f) => Some(f.strategy),
            Fetch::Composite(_) => None,
        }
    }

    pub fn fetches(&self) -> &[Fetch] {
        match self {
            Fetch::Entity(f) => &f.fetches,
            Fetch::Collection(f) => &f.fetches,
            Fetch::Composite(f) => &f.fetches,
        }
    }
}

/// Immutable plan with exactly one root return.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadPlan {
    root: Return,
}

impl LoadPlan {
    pub(crate) fn new(root: Return) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Return {
        &self.root
    }

    pub fn root_alias(&self) -> &str {
        match &self.root {
            Return::Entity(r) => &r.space.alias,
            Return::Collection(r) => &r.space.alias,
        }
    }

    pub fn root_fetches(&self) -> &[Fetch] {
        match &self.root {
            Return::Entity(r) => &r.fetches,
            Return::Collection(r) => &r.fetches,
        }
    }

    /// All fetches, depth first.
    pub fn all_fetches(&self) -> Vec<&Fetch> {
        fn walk<'a>(fetches: &'a [Fetch], out: &mut Vec<&'a Fetch>) {
            for fetch in fetches {
                out.push(fetch);
                walk(fetch.fetches(), out);
            }
        }
        let mut out = Vec::new();
        walk(self.root_fetches(), &mut out);
        out
    }

    /// First fetch whose path from its owner matches, searching depth first.
    pub fn find_fetch(&self, path: &str) -> Option<&Fetch> {
        self.all_fetches().into_iter().find(|f| f.path() == path)
    }

    pub fn joined_collection_count(&self) -> usize {
        let root_join = usize::from(matches!(self.root, Return::Collection(_)));
        root_join
            + self
                .all_fetches()
                .iter()
                .filter(|f| matches!(f, Fetch::Collection(c) if c.join.is_some()))
                .count()
    }
}

impl fmt::Display for LoadPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.root {
            Return::Entity(r) => writeln!(f, "EntityReturn({}) [{}]", r.entity, r.space.alias)?,
            Return::Collection(r) => writeln!(f, "CollectionReturn({}) [{}]", r.role, r.space.alias)?,
        }
        write_fetches(f, self.root_fetches(), 1)
    }
}

fn write_fetches(f: &mut fmt::Formatter<'_>, fetches: &[Fetch], indent: usize) -> fmt::Result {
    for fetch in fetches {
        let pad = "  ".repeat(indent);
        match fetch {
            Fetch::Entity(e) => {
                write!(f, "{}EntityFetch({}) -> {} {} depth={}", pad, e.path, e.entity, e.strategy, e.depth)?;
                if let Some(join) = &e.join {
                    write!(f, " [{}]", join.alias)?;
                }
                writeln!(f)?;
            }
            Fetch::Collection(c) => {
                write!(f, "{}CollectionFetch({}) -> {} {} depth={}", pad, c.path, c.role, c.strategy, c.depth)?;
                if let Some(join) = &c.join {
                    write!(f, " [{}]", join.alias)?;
                }
                writeln!(f)?;
            }
            Fetch::Composite(c) => writeln!(f, "{}CompositeFetch({})", pad, c.path)?,
        }
        write_fetches(f, fetch.fetches(), indent + 1)?;
    }
    Ok(())
}
