use std::collections::HashSet;

use log::debug;

use crate::core::{Column, OrmError, Result};
use crate::persister::{AttributeDefinition, AttributeKind, CascadingAction, EntityPersister, PersisterRegistry};

use super::{
    CollectionFetch, CollectionReturn, CompositeFetch, ElementEntity, EntityFetch, EntityReturn, Fetch, FetchStrategy,
    FetchStyle, JoinSpace, LoadPlan, LoadQueryInfluencers, Return,
};

/// Association being considered by the walk.
#[derive(Debug, Clone, Copy)]
pub struct AssociationAttribute<'a> {
    pub owner_entity: &'a str,
    pub attribute: &'a AttributeDefinition,
    /// Path from the owning entity
    pub path: &'a str,
    pub depth: usize,
}

/// Fetch decision for one association, supplied per builder use case.
pub type FetchStrategySelector<'a> = dyn Fn(&AssociationAttribute<'_>) -> FetchStrategy + 'a;

/// Profile overrides first, then the mapping default.
pub fn standard_selector<'a>(
    registry: &'a PersisterRegistry,
    influencers: &'a LoadQueryInfluencers,
) -> Box<FetchStrategySelector<'a>> {
    Box::new(move |association: &AssociationAttribute<'_>| {
        for name in influencers.enabled_profiles() {
            let Ok(profile) = registry.profile(name) else {
                continue;
            };
            if let Some(style) = profile.style_for(association.owner_entity, association.path) {
                return match style {
                    FetchStyle::Join => FetchStrategy::immediate_join(),
                    other => FetchStrategy::new(association.attribute.fetch.timing, other),
                };
            }
        }
        association.attribute.fetch
    })
}

/// Eagerly join associations the action cascades to; delay everything else.
pub fn cascade_selector<'a>(action: CascadingAction) -> Box<FetchStrategySelector<'a>> {
    Box::new(move |association: &AssociationAttribute<'_>| {
        if association.attribute.cascade.does_cascade(action) {
            FetchStrategy::immediate_join()
        } else {
            FetchStrategy::delayed_select()
        }
    })
}

/// Hands out space uids and table aliases such as `orders0_`.
#[derive(Debug, Default)]
pub struct AliasGenerator {
    next_uid: usize,
}

impl AliasGenerator {
    pub fn next(&mut self, table: &str) -> JoinSpace {
        let uid = self.next_uid;
        self.next_uid += 1;
        let stem: String = table
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .take(10)
            .collect();
        let stem = if stem.is_empty() { "t".to_string() } else { stem };
        JoinSpace {
            uid,
            alias: format!("{}{}_", stem, uid),
        }
    }

    /// Uid for a space sharing an alias with another one.
    pub fn next_uid(&mut self) -> usize {
        let uid = self.next_uid;
        self.next_uid += 1;
        uid
    }
}

/// Identifies an association by the table and columns its join uses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AssociationKey {
    table: String,
    columns: Vec<String>,
}

impl AssociationKey {
    fn new(table: &str, columns: &[Column]) -> Self {
        Self {
            table: table.to_string(),
            columns: columns.iter().map(|c| c.name.clone()).collect(),
        }
    }
}

/// Walks the association graph from a single root and builds a [`LoadPlan`].
///
/// The walk and alias generation are shared by every use case; only the
/// selector changes.
pub struct LoadPlanBuilder<'a> {
    registry: &'a PersisterRegistry,
    max_fetch_depth: Option<usize>,
    selector: Box<FetchStrategySelector<'a>>,
    aliases: AliasGenerator,
    root: Option<Return>,
    joined_collection: bool,
    visited: HashSet<AssociationKey>,
}

impl<'a> LoadPlanBuilder<'a> {
    pub fn new(
        registry: &'a PersisterRegistry,
        max_fetch_depth: Option<usize>,
        selector: Box<FetchStrategySelector<'a>>,
    ) -> Self {
        Self {
            registry,
            max_fetch_depth,
            selector,
            aliases: AliasGenerator::default(),
            root: None,
            joined_collection: false,
            visited: HashSet::new(),
        }
    }

    /// Plan for loading entities of `entity` with the standard strategy.
    pub fn entity_plan(
        registry: &'a PersisterRegistry,
        influencers: &'a LoadQueryInfluencers,
        max_fetch_depth: Option<usize>,
        entity: &str,
    ) -> Result<LoadPlan> {
        let mut builder = Self::new(registry, max_fetch_depth, standard_selector(registry, influencers));
        builder.add_entity_root(entity)?;
        builder.finish()
    }

    /// Plan for initializing the collection `role`.
    pub fn collection_plan(
        registry: &'a PersisterRegistry,
        influencers: &'a LoadQueryInfluencers,
        max_fetch_depth: Option<usize>,
        role: &str,
    ) -> Result<LoadPlan> {
        let mut builder = Self::new(registry, max_fetch_depth, standard_selector(registry, influencers));
        builder.add_collection_root(role)?;
        builder.finish()
    }

    /// Plan for loading `entity` while cascading `action`.
    pub fn cascade_plan(
        registry: &'a PersisterRegistry,
        max_fetch_depth: Option<usize>,
        action: CascadingAction,
        entity: &str,
    ) -> Result<LoadPlan> {
        let mut builder = Self::new(registry, max_fetch_depth, cascade_selector(action));
        builder.add_entity_root(entity)?;
        builder.finish()
    }

    fn check_single_root(&self) -> Result<()> {
        if self.root.is_some() {
            return Err(OrmError::IllegalState(
                "Load plan already has a root return; only one is allowed".into(),
            ));
        }
        Ok(())
    }

    pub fn add_entity_root(&mut self, entity: &str) -> Result<()> {
        self.check_single_root()?;
        let persister = self.registry.entity(entity)?.clone();
        let space = self.aliases.next(persister.table());
        let fetches = self.walk_entity(&persister, 1)?;
        self.root = Some(Return::Entity(EntityReturn {
            entity: entity.to_string(),
            space,
            fetches,
        }));
        Ok(())
    }

    pub fn add_collection_root(&mut self, role: &str) -> Result<()> {
        self.check_single_root()?;
        let collection = self.registry.collection(role)?.clone();
        let space = self.aliases.next(collection.table());
        self.joined_collection = true;
        self.visited
            .insert(AssociationKey::new(collection.table(), collection.key_columns()));

        let (element, fetches) = match collection.element_entity() {
            Some(target) => {
                let persister = self.registry.entity(target)?.clone();
                let uid = self.aliases.next_uid();
                let fetches = self.walk_entity(&persister, 1)?;
                (
                    Some(ElementEntity {
                        entity: target.to_string(),
                        uid,
                    }),
                    fetches,
                )
            }
            None => (None, Vec::new()),
        };
        self.root = Some(Return::Collection(CollectionReturn {
            role: role.to_string(),
            space,
            element,
            fetches,
        }));
        Ok(())
    }

    pub fn finish(self) -> Result<LoadPlan> {
        let root = self
            .root
            .ok_or_else(|| OrmError::IllegalState("Load plan has no root return".into()))?;
        Ok(LoadPlan::new(root))
    }

    fn walk_entity(&mut self, persister: &EntityPersister, depth: usize) -> Result<Vec<Fetch>> {
        self.walk_attributes(persister, persister.attributes(), "", depth)
    }

    fn walk_attributes(
        &mut self,
        owner: &EntityPersister,
        attributes: &[AttributeDefinition],
        prefix: &str,
        depth: usize,
    ) -> Result<Vec<Fetch>> {
        let mut fetches = Vec::new();
        for attribute in attributes {
            let path = if prefix.is_empty() {
                attribute.name.clone()
            } else {
                format!("{}.{}", prefix, attribute.name)
            };
            match &attribute.kind {
                AttributeKind::Basic { .. } => {}
                AttributeKind::Component { parts } => {
                    let nested = self.walk_attributes(owner, parts, &path, depth)?;
                    if !nested.is_empty() {
                        fetches.push(Fetch::Composite(CompositeFetch {
                            attribute: attribute.name.clone(),
                            path,
                            fetches: nested,
                        }));
                    }
                }
                AttributeKind::ToOne { target, columns, .. } => {
                    let key = AssociationKey::new(owner.table(), columns);
                    let strategy = self.decide(owner, attribute, &path, depth, &key, false);
                    let target_persister = self.registry.entity(target)?.clone();
                    let (join, nested) = if strategy.is_join() {
                        let space = self.aliases.next(target_persister.table());
                        let nested = self.walk_entity(&target_persister, depth + 1)?;
                        (Some(space), nested)
                    } else {
                        (None, Vec::new())
                    };
                    fetches.push(Fetch::Entity(EntityFetch {
                        attribute: attribute.name.clone(),
                        path,
                        entity: target.clone(),
                        strategy,
                        depth,
                        join,
                        fetches: nested,
                    }));
                }
                AttributeKind::Collection { role } => {
                    let collection = self.registry.collection(role)?.clone();
                    let key = AssociationKey::new(collection.table(), collection.key_columns());
                    let strategy = self.decide(owner, attribute, &path, depth, &key, true);
                    let (join, element, nested) = if strategy.is_join() {
                        let space = self.aliases.next(collection.table());
                        match collection.element_entity() {
                            Some(target) => {
                                let persister = self.registry.entity(target)?.clone();
                                let uid = self.aliases.next_uid();
                                let nested = self.walk_entity(&persister, depth + 1)?;
                                (
                                    Some(space),
                                    Some(ElementEntity {
                                        entity: target.to_string(),
                                        uid,
                                    }),
                                    nested,
                                )
                            }
                            None => (Some(space), None, Vec::new()),
                        }
                    } else {
                        (None, None, Vec::new())
                    };
                    fetches.push(Fetch::Collection(CollectionFetch {
                        attribute: attribute.name.clone(),
                        path,
                        role: role.clone(),
                        strategy,
                        depth,
                        join,
                        element,
                        fetches: nested,
                    }));
                }
            }
        }
        Ok(fetches)
    }

    /// Selector result, then the depth, cycle and single-collection guards.
    fn decide(
        &mut self,
        owner: &EntityPersister,
        attribute: &AttributeDefinition,
        path: &str,
        depth: usize,
        key: &AssociationKey,
        is_collection: bool,
    ) -> FetchStrategy {
        let strategy = (self.selector)(&AssociationAttribute {
            owner_entity: owner.name(),
            attribute,
            path,
            depth,
        });
        if !strategy.is_join() {
            return strategy;
        }
        if let Some(max) = self.max_fetch_depth {
            if depth > max {
                debug!(
                    "{}.{}: depth {} exceeds max fetch depth {}, using a subsequent select",
                    owner.name(),
                    path,
                    depth,
                    max
                );
                return strategy.downgraded();
            }
        }
        if self.visited.contains(key) {
            debug!("{}.{}: association already joined, using a subsequent select", owner.name(), path);
            return strategy.downgraded();
        }
        if is_collection {
            if self.joined_collection {
                debug!(
                    "{}.{}: another collection is already joined, using a subsequent select",
                    owner.name(),
                    path
                );
                return strategy.downgraded();
            }
            self.joined_collection = true;
        }
        self.visited.insert(key.clone());
        strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::core::SqlType;
    use crate::loadplan::FetchTiming;
    use crate::metadata::{AttributeMapping, CascadeType, EntityMapping, IdentifierMapping, MappingModel};
    use crate::sql::AnsiDialect;

    fn registry(model: MappingModel) -> PersisterRegistry {
        PersisterRegistry::build(&model, &Settings::default(), &AnsiDialect).unwrap()
    }

    fn chain() -> PersisterRegistry {
        let id = || IdentifierMapping::single("id", "id", SqlType::Integer);
        registry(MappingModel {
            entities: vec![
                EntityMapping::new("A", "a", id())
                    .attribute(AttributeMapping::many_to_one("b", "B", "b_id").fetch(FetchTiming::Immediate, FetchStyle::Join)),
                EntityMapping::new("B", "b", id())
                    .attribute(AttributeMapping::many_to_one("c", "C", "c_id").fetch(FetchTiming::Immediate, FetchStyle::Join)),
                EntityMapping::new("C", "c", id())
                    .attribute(AttributeMapping::many_to_one("d", "D", "d_id").fetch(FetchTiming::Immediate, FetchStyle::Join)),
                EntityMapping::new("D", "d", id()),
            ],
            fetch_profiles: Vec::new(),
        })
    }

    fn strategy_of(plan: &LoadPlan, path: &str) -> FetchStrategy {
        plan.find_fetch(path).and_then(Fetch::strategy).unwrap()
    }

    #[test]
    fn test_depth_guard_downgrades_beyond_max() {
        let registry = chain();
        let influencers = LoadQueryInfluencers::new();
        let plan = LoadPlanBuilder::entity_plan(&registry, &influencers, Some(2), "A").unwrap();
        assert!(strategy_of(&plan, "b").is_join());
        assert!(strategy_of(&plan, "c").is_join());
        // D sits at depth 3
        assert_eq!(
            strategy_of(&plan, "d"),
            FetchStrategy::new(FetchTiming::Immediate, FetchStyle::Select)
        );

        let unlimited = LoadPlanBuilder::entity_plan(&registry, &influencers, None, "A").unwrap();
        assert!(strategy_of(&unlimited, "d").is_join());
    }

    #[test]
    fn test_zero_depth_disables_joins() {
        let registry = chain();
        let influencers = LoadQueryInfluencers::new();
        let plan = LoadPlanBuilder::entity_plan(&registry, &influencers, Some(0), "A").unwrap();
        assert_eq!(plan.all_fetches().len(), 1);
        assert!(!strategy_of(&plan, "b").is_join());
    }

    #[test]
    fn test_second_root_is_rejected() {
        let registry = chain();
        let influencers = LoadQueryInfluencers::new();
        let mut builder = LoadPlanBuilder::new(&registry, None, standard_selector(&registry, &influencers));
        builder.add_entity_root("A").unwrap();
        assert!(matches!(builder.add_entity_root("B"), Err(OrmError::IllegalState(_))));
    }

    #[test]
    fn test_cascade_selector() {
        let id = || IdentifierMapping::single("id", "id", SqlType::Integer);
        let registry = registry(MappingModel {
            entities: vec![
                EntityMapping::new("Order", "orders", id())
                    .attribute(AttributeMapping::one_to_many("lines", "Line", "order_id").cascade(&[CascadeType::Remove]))
                    .attribute(AttributeMapping::many_to_one("customer", "Customer", "customer_id")),
                EntityMapping::new("Line", "lines", id()),
                EntityMapping::new("Customer", "customers", id()),
            ],
            fetch_profiles: Vec::new(),
        });
        let plan = LoadPlanBuilder::cascade_plan(&registry, None, CascadingAction::Delete, "Order").unwrap();
        assert_eq!(strategy_of(&plan, "lines"), FetchStrategy::immediate_join());
        assert_eq!(strategy_of(&plan, "customer"), FetchStrategy::delayed_select());

        let refresh = LoadPlanBuilder::cascade_plan(&registry, None, CascadingAction::Refresh, "Order").unwrap();
        assert_eq!(strategy_of(&refresh, "lines"), FetchStrategy::delayed_select());
    }

    #[test]
    fn test_aliases() {
        let mut aliases = AliasGenerator::default();
        assert_eq!(aliases.next("orders").alias, "orders0_");
        assert_eq!(aliases.next_uid(), 1);
        assert_eq!(aliases.next("Line-Items").alias, "lineitems2_");
    }
}
