// ============================================================================
// Loading: turning load-query rows into managed instances
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, trace};

use crate::cache::{CacheKey, CacheValue, CachedElement, EntityCacheEntry};
use crate::core::{OrmError, Result, Row, Value};
use crate::id::{CollectionKey, EntityKey, Identifier};
use crate::loadplan::{FetchStrategy, FetchStyle, FetchTiming, LoadQueryInfluencers};
use crate::persister::{AttributeDefinition, AttributeKind, CascadingAction, CollectionPersister, EntityPersister};
use crate::sql::{
    AttributeLayout, ComparisonOperator, ElementLayout, EntitySpaceLayout, Expr, KeyRestriction, LoadQuery,
    LoadQueryBuilder, ParameterBindings, PredicateBuilder, SelectionLayout, Statement, key_subquery,
};

use super::batch::SubselectFetch;
use super::context::{CollectionEntry, EntityEntry, EntityStatus};
use super::entity::{AttributeValue, CollectionHandle, Element, EntityHandle, StateValue};
use super::factory::{LoadTarget, RestrictionShape};
use super::flush::cached_elements;
use super::query::Restriction;
use super::session::SessionState;

/// Restriction of a multi-row load, replayed when a SUBSELECT collection of
/// its results is initialized.
#[derive(Debug, Clone)]
pub(super) struct SubselectSource {
    alias: String,
    selection: Option<Expr>,
    bindings: ParameterBindings,
}

#[derive(Debug, Clone, Default)]
pub(super) struct LoadMode {
    /// Re-hydrate instances that are already initialized
    refresh: bool,
    subselect: Option<SubselectSource>,
    /// Collections the load was issued for
    collections: Vec<CollectionKey>,
}

#[derive(Debug, Default)]
pub(super) struct LoadOutcome {
    pub roots: Vec<EntityHandle>,
    pub hydrated: Vec<EntityKey>,
}

struct LoadingEntity {
    handle: EntityHandle,
    persister: Arc<EntityPersister>,
    uid: usize,
    raw: Vec<Value>,
    row: Arc<Row>,
    hydrate: bool,
    created: bool,
}

/// Working state of one load.
#[derive(Default)]
pub(super) struct LoadContext {
    entities: IndexMap<EntityKey, LoadingEntity>,
    collections: IndexMap<CollectionKey, Vec<Element>>,
    root_keys: Vec<EntityKey>,
    subselect_owners: IndexMap<String, Vec<EntityKey>>,
    immediate_entities: Vec<EntityHandle>,
    immediate_collections: Vec<CollectionHandle>,
}

/// Offsets of every column an entity space reads, for duplicate detection.
fn space_offsets(space: &EntitySpaceLayout) -> Vec<usize> {
    fn walk(layouts: &[AttributeLayout], out: &mut Vec<usize>) {
        for layout in layouts {
            match layout {
                AttributeLayout::Basic(offset) => out.push(*offset),
                AttributeLayout::Composite(parts) => walk(parts, out),
                AttributeLayout::ToOne { columns, .. } => out.extend(columns),
                AttributeLayout::Collection { .. } => {}
            }
        }
    }
    let mut out = space.id.clone();
    out.extend(space.version);
    walk(&space.attributes, &mut out);
    out
}

fn cell(row: &Row, offset: usize) -> Result<Value> {
    row.get(offset)
        .cloned()
        .ok_or_else(|| OrmError::IllegalState(format!("Row has no column at offset {}", offset)))
}

fn cells(row: &Row, offsets: &[usize]) -> Result<Vec<Value>> {
    offsets.iter().map(|&o| cell(row, o)).collect()
}

pub(super) fn bind_ids<'a>(ids: impl IntoIterator<Item = &'a Identifier>) -> ParameterBindings {
    let mut bindings = ParameterBindings::new();
    for id in ids {
        for value in id.values() {
            bindings.push(value);
        }
    }
    bindings
}

fn shape_for(count: usize) -> RestrictionShape {
    if count == 1 {
        RestrictionShape::Id
    } else {
        RestrictionShape::Batch(count)
    }
}

fn not_found(entity: &str, id: &Identifier) -> OrmError {
    OrmError::ObjectNotFound(format!("[{}#{}]", entity, id))
}

impl SessionState {
    // ========================================================================
    // Operations
    // ========================================================================

    pub(super) fn get(&mut self, entity: &str, id: Identifier) -> Result<Option<EntityHandle>> {
        let persister = self.factory.registry.entity(entity)?.clone();
        let key = EntityKey::new(persister.name(), id.clone());
        if let Some(entry) = self.context.entity(&key) {
            if matches!(entry.status, EntityStatus::Deleted | EntityStatus::Gone) {
                return Ok(None);
            }
            let handle = entry.handle.clone();
            if handle.is_initialized()? {
                return Ok(Some(handle));
            }
            return match self.initialize_entity(&handle) {
                Ok(()) => Ok(Some(handle)),
                Err(OrmError::ObjectNotFound(_)) => {
                    self.context.remove_entity(&key);
                    Ok(None)
                }
                Err(err) => Err(err),
            };
        }
        if let Some(handle) = self.load_from_cache(&persister, &id, None)? {
            return Ok(Some(handle));
        }
        let ids = self.batch.entity_batch(persister.name(), &id, persister.batch_size());
        self.load_entities(&persister, ids)?;
        Ok(self.context.entity(&key).map(|entry| entry.handle.clone()))
    }

    pub(super) fn load(&mut self, entity: &str, id: Identifier) -> Result<EntityHandle> {
        let persister = self.factory.registry.entity(entity)?.clone();
        self.proxy_for(&persister, id, FetchStrategy::delayed_select(), None)
    }

    pub(super) fn initialize_entity(&mut self, handle: &EntityHandle) -> Result<()> {
        if handle.is_initialized()? {
            return Ok(());
        }
        let key = self
            .context
            .key_of(handle)
            .ok_or_else(|| OrmError::LazyInitialization("proxy is not associated with this session".into()))?;
        let persister = self.factory.registry.entity(&key.entity)?.clone();
        self.factory.statistics.entity_fetched();
        if self.load_from_cache(&persister, &key.id, Some(handle))?.is_some() {
            return Ok(());
        }
        let ids = self.batch.entity_batch(&key.entity, &key.id, persister.batch_size());
        self.load_entities(&persister, ids)?;
        if !handle.is_initialized()? {
            return Err(not_found(&key.entity, &key.id));
        }
        Ok(())
    }

    pub(super) fn initialize_collection(&mut self, collection: &CollectionHandle) -> Result<()> {
        if collection.is_initialized()? {
            return Ok(());
        }
        let key = self.context.collection_key_of(collection).ok_or_else(|| {
            OrmError::LazyInitialization("collection is not associated with this session".into())
        })?;
        let (persister, owner) = match self.context.collection(&key) {
            Some(entry) => (entry.persister.clone(), entry.owner.clone()),
            None => return Err(OrmError::UnknownCollection(key.to_string())),
        };
        self.factory.statistics.collection_fetched();
        if self.load_collection_from_cache(&key, &persister)? {
            return Ok(());
        }

        if let Some(fetch) = self.batch.subselect(&key.role, &owner) {
            self.batch.remove_subselect(&fetch);
            let mut keys = vec![key.clone()];
            keys.extend(
                fetch
                    .owners
                    .iter()
                    .map(|id| CollectionKey::new(&key.role, id.clone()))
                    .filter(|k| k != &key && self.is_uninitialized_collection(k)),
            );
            debug!("Initializing {} collection(s) of {} by subselect", keys.len(), key.role);
            let prepared = self.factory.build_load(
                &LoadTarget::Collection(key.role.clone()),
                &self.influencers,
                KeyRestriction::Subselect(Box::new(fetch.owner_query.clone())),
            )?;
            return self.load_collections(&prepared.query, fetch.bindings.clone(), keys);
        }

        let owners = self.batch.collection_batch(&key.role, &key.owner, persister.batch_size());
        let keys: Vec<CollectionKey> = owners
            .iter()
            .map(|id| CollectionKey::new(&key.role, id.clone()))
            .collect();
        let prepared = self.factory.prepared_load(
            &LoadTarget::Collection(key.role.clone()),
            &self.influencers,
            shape_for(owners.len()),
        )?;
        self.load_collections(&prepared.query, bind_ids(&owners), keys)
    }

    pub(super) fn find_all(&mut self, entity: &str, restrictions: &[Restriction]) -> Result<Vec<EntityHandle>> {
        self.auto_flush_if_required()?;
        let persister = self.factory.registry.entity(entity)?.clone();
        let base = self.factory.prepared_load(
            &LoadTarget::Entity(persister.name().to_string()),
            &self.influencers,
            RestrictionShape::None,
        )?;
        let alias = base.plan.root_alias().to_string();
        let (query, bindings) = if restrictions.is_empty() {
            (base.query.clone(), ParameterBindings::new())
        } else {
            let mut predicate = PredicateBuilder::conjunction();
            for restriction in restrictions {
                let (column, sql_type) = restriction.column(&persister)?;
                predicate.add_where_with_param(
                    Some(&alias),
                    &column,
                    ComparisonOperator::Equal,
                    restriction.value.clone(),
                    sql_type,
                );
            }
            let (selection, bindings) = predicate.build();
            let restriction = selection.map_or(KeyRestriction::None, KeyRestriction::Filter);
            let query = LoadQueryBuilder::new(&self.factory.registry, self.factory.dialect.as_ref())
                .build(&base.plan, restriction)?;
            (query, bindings)
        };
        let selection = match query.rendered.statement.as_ref() {
            Statement::Select(spec) => spec.selection.clone(),
            _ => None,
        };
        let mode = LoadMode {
            subselect: Some(SubselectSource {
                alias,
                selection,
                bindings: bindings.clone(),
            }),
            ..LoadMode::default()
        };
        self.factory.statistics.query_executed();
        Ok(self.run_load(&query, bindings, mode)?.roots)
    }

    /// Reload `handle` with its refresh-cascaded associations joined.
    pub(super) fn refresh_one(&mut self, handle: &EntityHandle) -> Result<LoadOutcome> {
        let key = self
            .context
            .key_of(handle)
            .ok_or_else(|| OrmError::IllegalState("Cannot refresh an instance that is not managed".into()))?;
        if let Some(access) = self.factory.entity_cache(&key.entity) {
            access.evict(&CacheKey::Entity(key.clone()))?;
        }
        let prepared = self.factory.prepared_load(
            &LoadTarget::Cascade(key.entity.clone(), CascadingAction::Refresh),
            &LoadQueryInfluencers::new(),
            RestrictionShape::Id,
        )?;
        let mode = LoadMode {
            refresh: true,
            ..LoadMode::default()
        };
        let outcome = self.run_load(&prepared.query, bind_ids([&key.id]), mode)?;
        if outcome.roots.is_empty() {
            return Err(not_found(&key.entity, &key.id));
        }
        Ok(outcome)
    }

    // ========================================================================
    // Internal loading
    // ========================================================================

    /// Managed instance for `id`, or a new proxy registered for batch loading.
    pub(super) fn proxy_for(
        &mut self,
        persister: &Arc<EntityPersister>,
        id: Identifier,
        strategy: FetchStrategy,
        ctx: Option<&mut LoadContext>,
    ) -> Result<EntityHandle> {
        let key = EntityKey::new(persister.name(), id.clone());
        if let Some(entry) = self.context.entity(&key) {
            return Ok(entry.handle.clone());
        }
        let proxy = persister.create_proxy(id.clone());
        self.context.add_entity(
            key,
            EntityEntry {
                handle: proxy.clone(),
                persister: persister.clone(),
                status: EntityStatus::Managed,
                loaded_state: None,
                version: None,
                exists_in_database: true,
            },
        )?;
        if persister.batch_size() > 1 || strategy.style == FetchStyle::Batch {
            self.batch.add_batch_loadable_entity(persister.name(), id);
        }
        if strategy.timing == FetchTiming::Immediate {
            if let Some(ctx) = ctx {
                ctx.immediate_entities.push(proxy.clone());
            }
        }
        Ok(proxy)
    }

    /// Instance for `id`, initialized from the database when needed.
    pub(super) fn internal_load(&mut self, entity: &str, id: Identifier) -> Result<EntityHandle> {
        let persister = self.factory.registry.entity(entity)?.clone();
        let handle = self.proxy_for(&persister, id.clone(), FetchStrategy::delayed_select(), None)?;
        self.initialize_entity(&handle)?;
        Ok(handle)
    }

    fn load_entities(&mut self, persister: &Arc<EntityPersister>, ids: Vec<Identifier>) -> Result<LoadOutcome> {
        let prepared = self.factory.prepared_load(
            &LoadTarget::Entity(persister.name().to_string()),
            &self.influencers,
            shape_for(ids.len()),
        )?;
        let bindings = bind_ids(&ids);
        let mode = if ids.len() > 1 {
            let alias = prepared.plan.root_alias().to_string();
            let selection = match prepared.query.rendered.statement.as_ref() {
                Statement::Select(spec) => spec.selection.clone(),
                _ => None,
            };
            LoadMode {
                subselect: Some(SubselectSource {
                    alias,
                    selection,
                    bindings: bindings.clone(),
                }),
                ..LoadMode::default()
            }
        } else {
            LoadMode::default()
        };
        let outcome = self.run_load(&prepared.query, bindings, mode)?;
        for id in &ids {
            self.batch.remove_batch_loadable_entity(persister.name(), id);
        }
        Ok(outcome)
    }

    fn load_collections(
        &mut self,
        query: &LoadQuery,
        bindings: ParameterBindings,
        keys: Vec<CollectionKey>,
    ) -> Result<()> {
        let mode = LoadMode {
            collections: keys,
            ..LoadMode::default()
        };
        self.run_load(query, bindings, mode)?;
        Ok(())
    }

    fn is_uninitialized_collection(&self, key: &CollectionKey) -> bool {
        self.context
            .collection(key)
            .is_some_and(|entry| !entry.handle.is_initialized().unwrap_or(true))
    }

    /// Execute a load query and process every row.
    pub(super) fn run_load(
        &mut self,
        query: &LoadQuery,
        bindings: ParameterBindings,
        mode: LoadMode,
    ) -> Result<LoadOutcome> {
        let mut ctx = LoadContext::default();
        match self.process_rows(query, bindings, &mode, &mut ctx) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.abandon(&ctx);
                Err(err)
            }
        }
    }

    fn process_rows(
        &mut self,
        query: &LoadQuery,
        bindings: ParameterBindings,
        mode: &LoadMode,
        ctx: &mut LoadContext,
    ) -> Result<LoadOutcome> {
        let layout = query.layout.clone();
        let mut cursor = self.query(&query.rendered, bindings)?;
        let root_uid = match &query.layout.entities.values().next() {
            Some(space) if query.layout.collections.values().all(|c| c.owner_uid.is_some()) => Some(space.uid),
            _ => None,
        };
        let offsets: HashMap<usize, Vec<usize>> =
            layout.entities.values().map(|s| (s.uid, space_offsets(s))).collect();

        let mut rows = 0usize;
        while cursor.next_row()? {
            rows += 1;
            let row: Row = layout
                .column_types
                .iter()
                .enumerate()
                .map(|(i, t)| cursor.get(i, *t))
                .collect::<Result<_>>()?;
            let row = Arc::new(row);
            let keys = self.read_entity_spaces(&layout, &offsets, &row, root_uid, mode, ctx)?;
            self.read_collection_spaces(&layout, &row, &keys, ctx)?;
        }
        trace!("Processed {} row(s)", rows);

        let hydrated: Vec<EntityKey> = ctx
            .entities
            .iter()
            .filter(|(_, l)| l.hydrate)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &hydrated {
            self.hydrate(&layout, key, root_uid, mode, ctx)?;
        }
        self.finish_collections(ctx, &mode.collections)?;
        self.register_subselects(mode, ctx)?;

        let roots: Vec<EntityHandle> = ctx
            .root_keys
            .iter()
            .filter_map(|k| ctx.entities.get(k).map(|l| l.handle.clone()))
            .collect();

        for proxy in std::mem::take(&mut ctx.immediate_entities) {
            if !proxy.is_initialized()? {
                self.initialize_entity(&proxy)?;
            }
        }
        for collection in std::mem::take(&mut ctx.immediate_collections) {
            self.initialize_collection(&collection)?;
        }
        Ok(LoadOutcome { roots, hydrated })
    }

    /// Resolve the entity of every non-null space of one row.
    fn read_entity_spaces(
        &mut self,
        layout: &SelectionLayout,
        offsets: &HashMap<usize, Vec<usize>>,
        row: &Arc<Row>,
        root_uid: Option<usize>,
        mode: &LoadMode,
        ctx: &mut LoadContext,
    ) -> Result<HashMap<usize, EntityKey>> {
        let mut keys = HashMap::new();
        for space in layout.entities.values() {
            let persister = self.factory.registry.entity(&space.entity_name)?.clone();
            let Some(id) = persister.identifier_mapper().id_from_values(cells(row, &space.id)?)? else {
                continue;
            };
            let key = EntityKey::new(persister.name(), id.clone());
            let raw = cells(row, offsets.get(&space.uid).map_or(&[][..], Vec::as_slice))?;
            let is_root = root_uid == Some(space.uid);

            if let Some(existing) = ctx.entities.get(&key) {
                if existing.uid == space.uid && existing.raw != raw {
                    return Err(OrmError::DuplicateRow(format!("[{}] read with differing state", key)));
                }
                if is_root && ctx.root_keys.contains(&key) && !layout.has_joined_collection() {
                    return Err(OrmError::DuplicateRow(format!("[{}]", key)));
                }
                if is_root && !ctx.root_keys.contains(&key) {
                    ctx.root_keys.push(key.clone());
                }
                keys.insert(space.uid, key);
                continue;
            }

            let (handle, hydrate, created) = match self.context.entity_mut(&key) {
                Some(entry) => {
                    let initialized = entry.handle.is_initialized()?;
                    let hydrate = !initialized || mode.refresh;
                    if hydrate {
                        entry.status = EntityStatus::Loading;
                    }
                    (entry.handle.clone(), hydrate, false)
                }
                None => {
                    let handle = persister.instantiate();
                    handle.set_identifier(Some(id))?;
                    self.context.add_entity(
                        key.clone(),
                        EntityEntry {
                            handle: handle.clone(),
                            persister: persister.clone(),
                            status: EntityStatus::Loading,
                            loaded_state: None,
                            version: None,
                            exists_in_database: true,
                        },
                    )?;
                    (handle, true, true)
                }
            };
            if is_root {
                ctx.root_keys.push(key.clone());
            }
            ctx.entities.insert(
                key.clone(),
                LoadingEntity {
                    handle,
                    persister,
                    uid: space.uid,
                    raw,
                    row: row.clone(),
                    hydrate,
                    created,
                },
            );
            keys.insert(space.uid, key);
        }
        Ok(keys)
    }

    fn read_collection_spaces(
        &mut self,
        layout: &SelectionLayout,
        row: &Row,
        keys: &HashMap<usize, EntityKey>,
        ctx: &mut LoadContext,
    ) -> Result<()> {
        for space in layout.collections.values() {
            let owner = match space.owner_uid {
                Some(owner_uid) => keys.get(&owner_uid).map(|k| k.id.clone()),
                None => {
                    let persister = self.factory.registry.collection(&space.role)?;
                    let owner = self.factory.registry.entity(persister.owner_entity())?;
                    owner.identifier_mapper().id_from_values(cells(row, &space.key)?)?
                }
            };
            let Some(owner) = owner else {
                continue;
            };
            let elements = ctx
                .collections
                .entry(CollectionKey::new(&space.role, owner))
                .or_default();
            match &space.element {
                ElementLayout::Entity { uid } => {
                    if let Some(loading) = keys.get(uid).and_then(|k| ctx.entities.get(k)) {
                        let element = Element::Entity(loading.handle.clone());
                        if !elements.contains(&element) {
                            elements.push(element);
                        }
                    }
                }
                ElementLayout::Basic(offset) => {
                    let value = cell(row, *offset)?;
                    if !value.is_null() {
                        elements.push(Element::Value(value));
                    }
                }
            }
        }
        Ok(())
    }

    fn hydrate(
        &mut self,
        layout: &SelectionLayout,
        key: &EntityKey,
        root_uid: Option<usize>,
        mode: &LoadMode,
        ctx: &mut LoadContext,
    ) -> Result<()> {
        let Some(loading) = ctx.entities.get(key) else {
            return Ok(());
        };
        let handle = loading.handle.clone();
        let persister = loading.persister.clone();
        let row = loading.row.clone();
        let uid = loading.uid;
        let space = layout.entity(uid)?;
        let is_root = root_uid == Some(uid);

        let attributes = self.build_attributes(
            ctx,
            key,
            persister.attributes(),
            &space.attributes,
            &row,
            mode.refresh,
            is_root,
        )?;
        let version = match space.version {
            Some(offset) => Some(cell(&row, offset)?),
            None => None,
        };
        handle.hydrate(attributes, version.clone())?;
        let state = handle.state()?;
        if let Some(entry) = self.context.entity_mut(key) {
            entry.status = EntityStatus::Managed;
            entry.loaded_state = Some(state.clone());
            entry.version = version.clone();
            entry.exists_in_database = true;
        }
        self.batch.remove_batch_loadable_entity(&key.entity, &key.id);
        self.factory.statistics.entity_loaded();

        if let Some(access) = self.factory.entity_cache(&key.entity) {
            let value = CacheValue::Entity(EntityCacheEntry {
                state,
                version: version.clone(),
            });
            if access.put_from_load(CacheKey::Entity(key.clone()), value, self.tx_timestamp, version.as_ref(), false)? {
                self.factory.statistics.cache_put();
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn build_attributes(
        &mut self,
        ctx: &mut LoadContext,
        owner: &EntityKey,
        definitions: &[AttributeDefinition],
        layouts: &[AttributeLayout],
        row: &Row,
        refresh: bool,
        is_root: bool,
    ) -> Result<Vec<AttributeValue>> {
        let mut values = Vec::with_capacity(definitions.len());
        for (definition, layout) in definitions.iter().zip(layouts) {
            let value = match (&definition.kind, layout) {
                (AttributeKind::Basic { .. }, AttributeLayout::Basic(offset)) => AttributeValue::Basic(cell(row, *offset)?),
                (AttributeKind::Component { parts }, AttributeLayout::Composite(nested)) => AttributeValue::Component(
                    self.build_attributes(ctx, owner, parts, nested, row, refresh, is_root)?,
                ),
                (
                    AttributeKind::ToOne {
                        target, back_reference, ..
                    },
                    AttributeLayout::ToOne { columns, strategy, .. },
                ) => {
                    let persister = self.factory.registry.entity(target)?.clone();
                    let target = match persister.identifier_mapper().id_from_values(cells(row, columns)?)? {
                        Some(id) => {
                            let key = EntityKey::new(persister.name(), id.clone());
                            match ctx.entities.get(&key) {
                                Some(loading) => Some(loading.handle.clone()),
                                None => Some(self.proxy_for(&persister, id, *strategy, Some(&mut *ctx))?),
                            }
                        }
                        None => None,
                    };
                    match back_reference {
                        Some(_) => AttributeValue::BackReference(target.as_ref().map(EntityHandle::downgrade)),
                        None => AttributeValue::ToOne(target),
                    }
                }
                (AttributeKind::Collection { role }, AttributeLayout::Collection { strategy, joined }) => {
                    AttributeValue::Collection(self.collection_for_owner(
                        ctx,
                        role,
                        owner,
                        *strategy,
                        joined.is_some(),
                        refresh,
                        is_root,
                    )?)
                }
                _ => {
                    return Err(OrmError::IllegalState(format!(
                        "Selection layout does not match attribute {}.{}",
                        owner.entity, definition.name
                    )));
                }
            };
            values.push(value);
        }
        Ok(values)
    }

    /// Collection wrapper for an owner being hydrated.
    #[allow(clippy::too_many_arguments)]
    fn collection_for_owner(
        &mut self,
        ctx: &mut LoadContext,
        role: &str,
        owner: &EntityKey,
        strategy: FetchStrategy,
        joined: bool,
        refresh: bool,
        owner_is_root: bool,
    ) -> Result<CollectionHandle> {
        let persister = self.factory.registry.collection(role)?.clone();
        let key = CollectionKey::new(role, owner.id.clone());
        let handle = match self.context.collection_mut(&key) {
            Some(entry) if !refresh => return Ok(entry.handle.clone()),
            Some(entry) => {
                entry.handle.begin_load()?;
                entry.snapshot = None;
                entry.handle.clone()
            }
            None => {
                let handle = CollectionHandle::uninitialized(role, owner.id.clone());
                self.context.add_collection(
                    key,
                    CollectionEntry {
                        handle: handle.clone(),
                        persister: persister.clone(),
                        owner: owner.clone(),
                        snapshot: None,
                    },
                );
                handle
            }
        };
        if !joined {
            self.register_lazy_collection(ctx, &persister, owner, &handle, strategy, owner_is_root);
        }
        Ok(handle)
    }

    fn register_lazy_collection(
        &mut self,
        ctx: &mut LoadContext,
        persister: &CollectionPersister,
        owner: &EntityKey,
        handle: &CollectionHandle,
        strategy: FetchStrategy,
        owner_is_root: bool,
    ) {
        if strategy.style == FetchStyle::Subselect && owner_is_root {
            ctx.subselect_owners
                .entry(persister.role().to_string())
                .or_default()
                .push(owner.clone());
        }
        if persister.batch_size() > 1 || strategy.style == FetchStyle::Batch {
            self.batch.add_batch_loadable_collection(persister.role(), owner.id.clone());
        }
        if strategy.timing == FetchTiming::Immediate {
            ctx.immediate_collections.push(handle.clone());
        }
    }

    /// Populate every collection read by this load that is still uninitialized.
    fn finish_collections(&mut self, ctx: &mut LoadContext, requested: &[CollectionKey]) -> Result<()> {
        for (key, elements) in std::mem::take(&mut ctx.collections) {
            if self.is_uninitialized_collection(&key) {
                self.finish_collection_load(&key, elements)?;
            }
        }
        for key in requested {
            if self.is_uninitialized_collection(key) {
                self.finish_collection_load(key, Vec::new())?;
            }
        }
        Ok(())
    }

    fn finish_collection_load(&mut self, key: &CollectionKey, elements: Vec<Element>) -> Result<()> {
        let Some(entry) = self.context.collection_mut(key) else {
            return Ok(());
        };
        entry.handle.begin_load()?;
        for element in &elements {
            entry.handle.push_loaded(element.clone())?;
        }
        entry.handle.finish_load()?;
        entry.snapshot = Some(elements.clone());
        self.batch.remove_batch_loadable_collection(&key.role, &key.owner);
        self.factory.statistics.collection_loaded();

        if let Some(access) = self.factory.collection_cache(&key.role) {
            let value = CacheValue::Collection(cached_elements(&elements)?);
            let cache_key = CacheKey::collection(&key.role, key.owner.clone());
            if access.put_from_load(cache_key, value, self.tx_timestamp, None, false)? {
                self.factory.statistics.cache_put();
            }
        }
        Ok(())
    }

    fn register_subselects(&mut self, mode: &LoadMode, ctx: &mut LoadContext) -> Result<()> {
        let Some(source) = &mode.subselect else {
            return Ok(());
        };
        for (role, owners) in std::mem::take(&mut ctx.subselect_owners) {
            if owners.len() < 2 {
                continue;
            }
            let Some(first) = owners.first() else {
                continue;
            };
            let owner_persister = self.factory.registry.entity(&first.entity)?;
            let fetch = Arc::new(SubselectFetch {
                role: role.clone(),
                owner_query: key_subquery(owner_persister, &source.alias, source.selection.clone()),
                bindings: source.bindings.clone(),
                owners: owners.iter().map(|k| k.id.clone()).collect(),
            });
            for owner in owners {
                self.batch.add_subselect(owner, fetch.clone());
            }
        }
        Ok(())
    }

    /// Undo the context changes of a failed load.
    fn abandon(&mut self, ctx: &LoadContext) {
        for (key, loading) in &ctx.entities {
            if !loading.hydrate {
                continue;
            }
            if loading.created {
                self.context.remove_entity(key);
            } else if let Some(entry) = self.context.entity_mut(key) {
                if entry.status == EntityStatus::Loading {
                    entry.status = EntityStatus::Managed;
                }
            }
        }
    }

    // ========================================================================
    // Second-level cache
    // ========================================================================

    fn load_from_cache(
        &mut self,
        persister: &Arc<EntityPersister>,
        id: &Identifier,
        target: Option<&EntityHandle>,
    ) -> Result<Option<EntityHandle>> {
        let Some(access) = self.factory.entity_cache(persister.name()).cloned() else {
            return Ok(None);
        };
        let key = EntityKey::new(persister.name(), id.clone());
        let entry = match access.get(&CacheKey::Entity(key.clone()), self.tx_timestamp)? {
            Some(CacheValue::Entity(entry)) => {
                self.factory.statistics.cache_hit();
                entry
            }
            _ => {
                self.factory.statistics.cache_miss();
                return Ok(None);
            }
        };
        debug!("Resolved [{}] from the second-level cache", key);

        let handle = match target {
            Some(handle) => handle.clone(),
            None => {
                let handle = persister.instantiate();
                handle.set_identifier(Some(id.clone()))?;
                self.context.add_entity(
                    key.clone(),
                    EntityEntry {
                        handle: handle.clone(),
                        persister: persister.clone(),
                        status: EntityStatus::Loading,
                        loaded_state: None,
                        version: None,
                        exists_in_database: true,
                    },
                )?;
                handle
            }
        };

        let mut ctx = LoadContext::default();
        let attributes = match self.assemble_cached(&mut ctx, &key, persister.attributes(), &entry.state) {
            Ok(attributes) => attributes,
            Err(err) => {
                if target.is_none() {
                    self.context.remove_entity(&key);
                }
                return Err(err);
            }
        };
        handle.hydrate(attributes, entry.version.clone())?;
        if let Some(managed) = self.context.entity_mut(&key) {
            managed.status = EntityStatus::Managed;
            managed.loaded_state = Some(entry.state.clone());
            managed.version = entry.version.clone();
        }
        self.batch.remove_batch_loadable_entity(persister.name(), id);

        for proxy in std::mem::take(&mut ctx.immediate_entities) {
            if !proxy.is_initialized()? {
                self.initialize_entity(&proxy)?;
            }
        }
        for collection in std::mem::take(&mut ctx.immediate_collections) {
            self.initialize_collection(&collection)?;
        }
        Ok(Some(handle))
    }

    fn assemble_cached(
        &mut self,
        ctx: &mut LoadContext,
        owner: &EntityKey,
        definitions: &[AttributeDefinition],
        state: &[StateValue],
    ) -> Result<Vec<AttributeValue>> {
        let mut values = Vec::with_capacity(definitions.len());
        for (definition, value) in definitions.iter().zip(state) {
            let attribute = match (&definition.kind, value) {
                (AttributeKind::Basic { .. }, StateValue::Basic(v)) => AttributeValue::Basic(v.clone()),
                (AttributeKind::Component { parts }, StateValue::Component(nested)) => {
                    AttributeValue::Component(self.assemble_cached(ctx, owner, parts, nested)?)
                }
                (
                    AttributeKind::ToOne {
                        target, back_reference, ..
                    },
                    StateValue::Reference(id),
                ) => {
                    let target = match id {
                        Some(id) => {
                            let persister = self.factory.registry.entity(target)?.clone();
                            Some(self.proxy_for(&persister, id.clone(), definition.fetch.downgraded(), Some(&mut *ctx))?)
                        }
                        None => None,
                    };
                    match back_reference {
                        Some(_) => AttributeValue::BackReference(target.as_ref().map(EntityHandle::downgrade)),
                        None => AttributeValue::ToOne(target),
                    }
                }
                (AttributeKind::Collection { role }, StateValue::Collection) => AttributeValue::Collection(
                    self.collection_for_owner(ctx, role, owner, definition.fetch.downgraded(), false, false, false)?,
                ),
                _ => {
                    return Err(OrmError::Cache(format!(
                        "Cached state of [{}] does not match attribute {}",
                        owner, definition.name
                    )));
                }
            };
            values.push(attribute);
        }
        Ok(values)
    }

    fn load_collection_from_cache(&mut self, key: &CollectionKey, persister: &CollectionPersister) -> Result<bool> {
        let Some(access) = self.factory.collection_cache(&key.role).cloned() else {
            return Ok(false);
        };
        let cached = match access.get(&CacheKey::collection(&key.role, key.owner.clone()), self.tx_timestamp)? {
            Some(CacheValue::Collection(entry)) => {
                self.factory.statistics.cache_hit();
                entry
            }
            _ => {
                self.factory.statistics.cache_miss();
                return Ok(false);
            }
        };
        let mut elements = Vec::with_capacity(cached.elements.len());
        for element in cached.elements {
            elements.push(match element {
                CachedElement::Entity(id) => {
                    let target = persister.element_entity().ok_or_else(|| {
                        OrmError::Cache(format!("Cached entity element for value collection {}", key.role))
                    })?;
                    let target = self.factory.registry.entity(target)?.clone();
                    Element::Entity(self.proxy_for(&target, id, FetchStrategy::delayed_select(), None)?)
                }
                CachedElement::Value(value) => Element::Value(value),
            });
        }
        let Some(entry) = self.context.collection_mut(key) else {
            return Ok(false);
        };
        entry.handle.begin_load()?;
        for element in &elements {
            entry.handle.push_loaded(element.clone())?;
        }
        entry.handle.finish_load()?;
        entry.snapshot = Some(elements);
        self.batch.remove_batch_loadable_collection(&key.role, &key.owner);
        Ok(true)
    }
}
