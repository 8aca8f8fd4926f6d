// ============================================================================
// Session factory: boot-time state shared by every session
// ============================================================================

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use log::{debug, info};
use lru::LruCache;
use tracing::info_span;

use crate::cache::{DomainDataAccess, RegionFactory, build_access};
use crate::config::Settings;
use crate::core::{OrmError, Result};
use crate::jdbc::{ConnectionProvider, JdbcConnection, SqlExceptionConverter, StandardSqlExceptionConverter};
use crate::loadplan::{LoadPlan, LoadPlanBuilder, LoadQueryInfluencers};
use crate::metadata::MappingModel;
use crate::persister::{CascadingAction, PersisterRegistry};
use crate::result::InstantiationRegistry;
use crate::sql::{
    AnsiDialect, CollectionMutationSql, Dialect, EntityMutationSql, KeyRestriction, LoadQuery, LoadQueryBuilder,
    MutationSqlBuilder, ProcedureWrapper, RenderedStatement,
};
use crate::transaction::{
    ExceptionMapper, JtaPlatform, ManagedFlushChecker, StandardExceptionMapper, StandardManagedFlushChecker,
};

use super::entity::EntityHandle;
use super::session::Session;
use super::statistics::Statistics;

/// What a load plan is rooted at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LoadTarget {
    Entity(String),
    Collection(String),
    Cascade(String, CascadingAction),
}

/// Shape of the root key restriction; part of the plan cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestrictionShape {
    None,
    Id,
    Batch(usize),
}

impl RestrictionShape {
    fn restriction(self) -> KeyRestriction {
        match self {
            RestrictionShape::None => KeyRestriction::None,
            RestrictionShape::Id => KeyRestriction::Id,
            RestrictionShape::Batch(n) => KeyRestriction::Batch(n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PlanKey {
    target: LoadTarget,
    influencers: LoadQueryInfluencers,
    shape: RestrictionShape,
}

/// A load plan with the statement that executes it.
#[derive(Debug)]
pub struct PreparedLoad {
    pub plan: Arc<LoadPlan>,
    pub query: LoadQuery,
}

pub(crate) struct FactoryInner {
    pub settings: Settings,
    pub registry: PersisterRegistry,
    pub dialect: Arc<dyn Dialect>,
    pub provider: Arc<dyn ConnectionProvider>,
    pub exception_converter: Arc<dyn SqlExceptionConverter>,
    pub exception_mapper: Arc<dyn ExceptionMapper>,
    pub flush_checker: Arc<dyn ManagedFlushChecker>,
    pub jta_platform: Option<Arc<dyn JtaPlatform>>,
    pub instantiations: InstantiationRegistry,
    pub statistics: Statistics,
    pub regions: Arc<RegionFactory>,
    entity_sql: HashMap<String, EntityMutationSql>,
    collection_sql: HashMap<String, CollectionMutationSql>,
    entity_caches: HashMap<String, Arc<dyn DomainDataAccess>>,
    collection_caches: HashMap<String, Arc<dyn DomainDataAccess>>,
    plans: Mutex<LruCache<PlanKey, Arc<PreparedLoad>>>,
    procedures: Option<ProcedureWrapper>,
}

impl FactoryInner {
    pub fn entity_sql(&self, entity: &str) -> Result<&EntityMutationSql> {
        self.entity_sql
            .get(entity)
            .ok_or_else(|| OrmError::UnknownEntity(entity.to_string()))
    }

    /// `None` for inverse collections.
    pub fn collection_sql(&self, role: &str) -> Option<&CollectionMutationSql> {
        self.collection_sql.get(role)
    }

    pub fn entity_cache(&self, entity: &str) -> Option<&Arc<dyn DomainDataAccess>> {
        self.entity_caches.get(entity)
    }

    pub fn collection_cache(&self, role: &str) -> Option<&Arc<dyn DomainDataAccess>> {
        self.collection_caches.get(role)
    }

    /// Cached plan and statement for a target and restriction shape.
    pub fn prepared_load(
        &self,
        target: &LoadTarget,
        influencers: &LoadQueryInfluencers,
        shape: RestrictionShape,
    ) -> Result<Arc<PreparedLoad>> {
        let key = PlanKey {
            target: target.clone(),
            influencers: influencers.clone(),
            shape,
        };
        if let Some(prepared) = self.plans.lock()?.get(&key) {
            return Ok(prepared.clone());
        }
        let prepared = Arc::new(self.build_load(target, influencers, shape.restriction())?);
        self.plans.lock()?.put(key, prepared.clone());
        Ok(prepared)
    }

    /// Build a plan and statement without caching them.
    pub fn build_load(
        &self,
        target: &LoadTarget,
        influencers: &LoadQueryInfluencers,
        restriction: KeyRestriction,
    ) -> Result<PreparedLoad> {
        let _span = info_span!("build_load_plan", target = ?target).entered();
        let depth = self.settings.max_fetch_depth;
        let plan = match target {
            LoadTarget::Entity(entity) => LoadPlanBuilder::entity_plan(&self.registry, influencers, depth, entity)?,
            LoadTarget::Collection(role) => {
                LoadPlanBuilder::collection_plan(&self.registry, influencers, depth, role)?
            }
            LoadTarget::Cascade(entity, action) => {
                LoadPlanBuilder::cascade_plan(&self.registry, depth, *action, entity)?
            }
        };
        let query = LoadQueryBuilder::new(&self.registry, self.dialect.as_ref()).build(&plan, restriction)?;
        debug!("Load plan for {:?}:\n{}", target, plan);
        Ok(PreparedLoad {
            plan: Arc::new(plan),
            query,
        })
    }

    pub fn cached_plan_count(&self) -> Result<usize> {
        Ok(self.plans.lock()?.len())
    }

    /// The statement to send: a routine call when wrapping is enabled.
    /// The first user of a routine emits its DDL on `connection` before any
    /// other session can call it.
    pub fn wrap(
        &self,
        connection: &mut dyn JdbcConnection,
        rendered: &Arc<RenderedStatement>,
    ) -> Result<Arc<RenderedStatement>> {
        let Some(wrapper) = &self.procedures else {
            return Ok(rendered.clone());
        };
        let outcome = wrapper.wrap_with(rendered, |definition| connection.create_routine(definition))?;
        Ok(outcome.routine.call.clone())
    }
}

/// Entry point of the engine: immutable metadata plus shared caches.
#[derive(Clone)]
pub struct SessionFactory {
    inner: Arc<FactoryInner>,
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("dialect", &self.inner.dialect.name())
            .field("entities", &self.inner.registry.entities().count())
            .finish()
    }
}

impl SessionFactory {
    pub fn builder(model: MappingModel) -> SessionFactoryBuilder {
        SessionFactoryBuilder::new(model)
    }

    pub fn open_session(&self) -> Result<Session> {
        self.inner.statistics.session_opened();
        Session::open(self.inner.clone())
    }

    pub fn registry(&self) -> &PersisterRegistry {
        &self.inner.registry
    }

    /// New transient instance of `entity`.
    pub fn instantiate(&self, entity: &str) -> Result<EntityHandle> {
        Ok(self.inner.registry.entity(entity)?.instantiate())
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.inner.dialect
    }

    pub fn statistics(&self) -> &Statistics {
        &self.inner.statistics
    }

    pub fn region_factory(&self) -> &Arc<RegionFactory> {
        &self.inner.regions
    }

    pub fn entity_cache(&self, entity: &str) -> Option<Arc<dyn DomainDataAccess>> {
        self.inner.entity_cache(entity).cloned()
    }

    pub fn collection_cache(&self, role: &str) -> Option<Arc<dyn DomainDataAccess>> {
        self.inner.collection_cache(role).cloned()
    }

    /// Load plan for `target` under `influencers`, from the plan cache.
    pub fn load_plan(&self, target: &LoadTarget, influencers: &LoadQueryInfluencers) -> Result<Arc<PreparedLoad>> {
        self.inner.prepared_load(target, influencers, RestrictionShape::Id)
    }

    pub fn cached_plan_count(&self) -> Result<usize> {
        self.inner.cached_plan_count()
    }

    pub fn entity_sql(&self, entity: &str) -> Result<EntityMutationSql> {
        self.inner.entity_sql(entity).cloned()
    }

    /// Drop every second-level cache entry.
    pub fn evict_all_regions(&self) -> Result<()> {
        self.inner.regions.evict_all()
    }
}

/// Boot configuration of a [`SessionFactory`].
pub struct SessionFactoryBuilder {
    model: MappingModel,
    settings: Settings,
    dialect: Arc<dyn Dialect>,
    provider: Option<Arc<dyn ConnectionProvider>>,
    instantiations: InstantiationRegistry,
    jta_platform: Option<Arc<dyn JtaPlatform>>,
    exception_mapper: Arc<dyn ExceptionMapper>,
    flush_checker: Arc<dyn ManagedFlushChecker>,
}

impl SessionFactoryBuilder {
    pub fn new(model: MappingModel) -> Self {
        Self {
            model,
            settings: Settings::default(),
            dialect: Arc::new(AnsiDialect),
            provider: None,
            instantiations: InstantiationRegistry::new(),
            jta_platform: None,
            exception_mapper: Arc::new(StandardExceptionMapper),
            flush_checker: Arc::new(StandardManagedFlushChecker),
        }
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn dialect(mut self, dialect: Arc<dyn Dialect>) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn connection_provider(mut self, provider: Arc<dyn ConnectionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn instantiations(mut self, instantiations: InstantiationRegistry) -> Self {
        self.instantiations = instantiations;
        self
    }

    pub fn jta_platform(mut self, platform: Arc<dyn JtaPlatform>) -> Self {
        self.jta_platform = Some(platform);
        self
    }

    pub fn exception_mapper(mut self, mapper: Arc<dyn ExceptionMapper>) -> Self {
        self.exception_mapper = mapper;
        self
    }

    pub fn managed_flush_checker(mut self, checker: Arc<dyn ManagedFlushChecker>) -> Self {
        self.flush_checker = checker;
        self
    }

    pub fn build(self) -> Result<SessionFactory> {
        let _span = info_span!("build_session_factory", dialect = self.dialect.name()).entered();
        self.settings.validate().map_err(OrmError::Configuration)?;
        let provider = self
            .provider
            .ok_or_else(|| OrmError::Configuration("No connection provider configured".into()))?;

        let registry = PersisterRegistry::build(&self.model, &self.settings, self.dialect.as_ref())?;

        let mutations = MutationSqlBuilder::new(self.dialect.as_ref());
        let mut entity_sql = HashMap::new();
        for persister in registry.entities() {
            entity_sql.insert(persister.name().to_string(), mutations.entity(persister)?);
        }
        let mut collection_sql = HashMap::new();
        for persister in registry.collections() {
            if let Some(sql) = mutations.collection(persister, &registry)? {
                collection_sql.insert(persister.role().to_string(), sql);
            }
        }

        let regions = Arc::new(RegionFactory::new(
            self.settings.cache_region_size,
            self.settings.cache_lock_timeout,
        ));
        let mut entity_caches = HashMap::new();
        let mut collection_caches = HashMap::new();
        if self.settings.use_second_level_cache {
            for persister in registry.entities() {
                if let Some(access_type) = persister.cache_access() {
                    let storage = regions.build_region(persister.name())?;
                    entity_caches.insert(
                        persister.name().to_string(),
                        build_access(access_type, storage, regions.clone()),
                    );
                }
            }
            for persister in registry.collections() {
                if let Some(access_type) = persister.cache_access() {
                    let storage = regions.build_region(persister.role())?;
                    collection_caches.insert(
                        persister.role().to_string(),
                        build_access(access_type, storage, regions.clone()),
                    );
                }
            }
        }

        let procedures = if self.settings.use_stored_procedures {
            Some(ProcedureWrapper::new(self.dialect.clone(), "orm")?)
        } else {
            None
        };

        let capacity = NonZeroUsize::new(self.settings.plan_cache_size).unwrap_or(NonZeroUsize::MIN);
        info!(
            "Built session factory: {} entities, {} collections, {} cached regions",
            registry.entities().count(),
            registry.collections().count(),
            entity_caches.len() + collection_caches.len()
        );

        Ok(SessionFactory {
            inner: Arc::new(FactoryInner {
                settings: self.settings,
                registry,
                dialect: self.dialect,
                provider,
                exception_converter: Arc::new(StandardSqlExceptionConverter),
                exception_mapper: self.exception_mapper,
                flush_checker: self.flush_checker,
                jta_platform: self.jta_platform,
                instantiations: self.instantiations,
                statistics: Statistics::new(),
                regions,
                entity_sql,
                collection_sql,
                entity_caches,
                collection_caches,
                plans: Mutex::new(LruCache::new(capacity)),
                procedures,
            }),
        })
    }
}
