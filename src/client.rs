//! Engine assembly, clients and transactions.
//!
//! [`EngineBuilder`] validates the entity graph once at startup and produces a
//! [`Client`]. A client is a cheap handle (engine + executor); a transaction
//! client is the same handle pointed at an open [`Transaction`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use entgraph_types::{EntityId, Predicate, Row, TableRef, Value, ID_COLUMN};

use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::descriptor::{DefaultFn, DefaultValue, EntityDescriptor};
use crate::edge::EdgeStorage;
use crate::entity::Entity;
use crate::error::{EntError, Result, StoreError};
use crate::executor::{
    DeleteSpec, Executor, InsertSpec, LinkSpec, QuerySpec, StoreResult, TableSchema, Transaction, UpdateSpec,
};
use crate::history::{self, HistoryClock, HistoryQuery};
use crate::hook::{Hook, Op};
use crate::interceptor::{Interceptor, SoftDeleteFilter};
use crate::migrate;
use crate::mutation::{Create, CreateBulk, Delete, DeleteOne, Update, UpdateOne};
use crate::policy::{Policy, PolicyRegistry};
use crate::predicate;
use crate::query::Query;
use crate::schema::{SchemaConfig, SchemaPerTenant, SingleSchema, TenantProvider};

// ============================================================================
// BUILDER
// ============================================================================

/// Collects descriptors, policies, interceptors and hooks, then validates the
/// whole graph in [`EngineBuilder::build`].
pub struct EngineBuilder {
    config: EngineConfig,
    entities: Vec<EntityDescriptor>,
    policies: Vec<Policy>,
    interceptors: Vec<(Option<String>, Arc<dyn Interceptor>)>,
    hooks: Vec<(Option<String>, Arc<dyn Hook>)>,
    providers: HashMap<String, DefaultFn>,
    tenants: Option<Arc<dyn TenantProvider>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            entities: Vec::new(),
            policies: Vec::new(),
            interceptors: Vec::new(),
            hooks: Vec::new(),
            providers: HashMap::new(),
            tenants: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn entity(mut self, desc: EntityDescriptor) -> Self {
        self.entities.push(desc);
        self
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policies.push(policy);
        self
    }

    /// Interceptor for every entity type.
    pub fn interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push((None, Arc::new(interceptor)));
        self
    }

    pub fn entity_interceptor(mut self, entity: &str, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors
            .push((Some(entity.to_string()), Arc::new(interceptor)));
        self
    }

    /// Hook for every entity type.
    pub fn hook(mut self, hook: impl Hook + 'static) -> Self {
        self.hooks.push((None, Arc::new(hook)));
        self
    }

    pub fn entity_hook(mut self, entity: &str, hook: impl Hook + 'static) -> Self {
        self.hooks.push((Some(entity.to_string()), Arc::new(hook)));
        self
    }

    /// Named default used by fields declared with `default_provider(name)`.
    pub fn default_provider<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&RequestContext) -> Value + Send + Sync + 'static,
    {
        self.providers.insert(name.to_string(), Arc::new(f));
        self
    }

    pub fn tenants(mut self, provider: impl TenantProvider + 'static) -> Self {
        self.tenants = Some(Arc::new(provider));
        self
    }

    pub fn build(self, executor: Arc<dyn Executor>) -> Result<Client> {
        self.config.validate()?;

        let mut entities: HashMap<String, Arc<EntityDescriptor>> = HashMap::new();
        let mut order = Vec::new();
        let mut tables = HashSet::new();
        for desc in self.entities {
            if !tables.insert(desc.table.clone()) {
                return Err(EntError::config(format!("table '{}' is used by two entities", desc.table)));
            }
            if entities.contains_key(&desc.name) {
                return Err(EntError::config(format!("entity '{}' registered twice", desc.name)));
            }
            order.push(desc.name.clone());
            entities.insert(desc.name.clone(), Arc::new(desc));
        }

        let mut policies = PolicyRegistry::new();
        for policy in self.policies {
            if !entities.contains_key(policy.entity()) {
                return Err(EntError::config(format!("policy for unknown entity '{}'", policy.entity())));
            }
            policies.register(policy)?;
        }
        for name in &order {
            policies.get(name)?;
        }

        let scoped = self
            .interceptors
            .iter()
            .filter_map(|(e, _)| e.as_deref())
            .chain(self.hooks.iter().filter_map(|(e, _)| e.as_deref()));
        for name in scoped {
            if !entities.contains_key(name) {
                return Err(EntError::config(format!(
                    "interceptor or hook registered for unknown entity '{}'",
                    name
                )));
            }
        }

        for name in &order {
            validate_entity(&entities[name], &entities, &tables, &self.providers)?;
        }

        let tenants: Arc<dyn TenantProvider> = match self.tenants {
            Some(t) => t,
            None => match &self.config.schema_per_tenant_prefix {
                Some(prefix) => Arc::new(
                    SchemaPerTenant::new(prefix.clone()).shared(SchemaConfig::new(self.config.default_schema.clone())),
                ),
                None => Arc::new(SingleSchema::new(SchemaConfig::new(self.config.default_schema.clone()))),
            },
        };

        tracing::info!(entities = order.len(), "entity engine built");
        let inner = EngineInner {
            config: self.config,
            entities,
            order,
            policies,
            interceptors: self.interceptors,
            hooks: self.hooks,
            providers: self.providers,
            tenants,
            clock: HistoryClock::default(),
        };
        Ok(Client {
            inner: Arc::new(inner),
            pool: executor,
            tx: None,
        })
    }
}

fn validate_entity(
    desc: &EntityDescriptor,
    entities: &HashMap<String, Arc<EntityDescriptor>>,
    tables: &HashSet<String>,
    providers: &HashMap<String, DefaultFn>,
) -> Result<()> {
    let fail = |msg: String| Err(EntError::config(format!("{}: {}", desc.name, msg)));

    for field in &desc.fields {
        for default in [&field.default, &field.update_default].into_iter().flatten() {
            if let DefaultValue::Provider(name) = default {
                if !providers.contains_key(name) {
                    return fail(format!("field '{}' uses unknown default provider '{}'", field.name, name));
                }
            }
        }
    }

    for edge in &desc.edges {
        let Some(target) = entities.get(&edge.target) else {
            return fail(format!("edge '{}' targets unknown entity '{}'", edge.name, edge.target));
        };
        match &edge.storage {
            EdgeStorage::SourceColumn(col) => {
                if desc.column_type(col) != Some(target.id_field_type()) || col == ID_COLUMN {
                    return fail(format!(
                        "edge '{}' needs a {} field '{}' holding the {} id",
                        edge.name,
                        target.id_field_type(),
                        col,
                        target.name
                    ));
                }
            }
            EdgeStorage::TargetColumn(col) => {
                if target.column_type(col) != Some(desc.id_field_type()) || col == ID_COLUMN {
                    return fail(format!(
                        "edge '{}' needs a {} field '{}' on {} holding this id",
                        edge.name,
                        desc.id_field_type(),
                        col,
                        target.name
                    ));
                }
            }
            EdgeStorage::Junction {
                table,
                owner_column,
                target_column,
            } => {
                if tables.contains(table) {
                    return fail(format!("junction '{}' of edge '{}' is an entity table", table, edge.name));
                }
                if owner_column == target_column {
                    return fail(format!("junction '{}' uses '{}' for both ends", table, owner_column));
                }
            }
        }
        if let Some(inverse) = &edge.inverse_of {
            match target.edge(inverse) {
                Some(owner) if owner.target == desc.name && owner.mirrors(edge) => {}
                Some(_) => {
                    return fail(format!(
                        "edge '{}' does not mirror {}.{}",
                        edge.name, target.name, inverse
                    ))
                }
                None => return fail(format!("inverse edge {}.{} does not exist", target.name, inverse)),
            }
        }
    }

    if desc.tracked {
        for reserved in history::RESERVED {
            if desc.has_column(reserved) {
                return fail(format!("tracked entity cannot declare field '{}'", reserved));
            }
        }
    }
    Ok(())
}

/// Shared, immutable engine state.
pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) entities: HashMap<String, Arc<EntityDescriptor>>,
    /// Registration order.
    pub(crate) order: Vec<String>,
    pub(crate) policies: PolicyRegistry,
    interceptors: Vec<(Option<String>, Arc<dyn Interceptor>)>,
    hooks: Vec<(Option<String>, Arc<dyn Hook>)>,
    pub(crate) providers: HashMap<String, DefaultFn>,
    pub(crate) tenants: Arc<dyn TenantProvider>,
    pub(crate) clock: HistoryClock,
}

impl EngineInner {
    pub(crate) fn descriptor(&self, name: &str) -> Result<Arc<EntityDescriptor>> {
        self.entities
            .get(name)
            .cloned()
            .ok_or_else(|| EntError::config(format!("unknown entity '{}'", name)))
    }

    /// Soft-delete filter first, then registrations in order.
    pub(crate) fn interceptors_for(&self, desc: &EntityDescriptor) -> Vec<Arc<dyn Interceptor>> {
        let mut out: Vec<Arc<dyn Interceptor>> = Vec::new();
        if desc.soft_delete {
            out.push(Arc::new(SoftDeleteFilter));
        }
        out.extend(
            self.interceptors
                .iter()
                .filter(|(e, _)| e.as_deref().map_or(true, |e| e == desc.name))
                .map(|(_, i)| i.clone()),
        );
        out
    }

    pub(crate) fn hooks_for(&self, entity: &str) -> Vec<Arc<dyn Hook>> {
        self.hooks
            .iter()
            .filter(|(e, _)| e.as_deref().map_or(true, |e| e == entity))
            .map(|(_, h)| h.clone())
            .collect()
    }
}

// ============================================================================
// CLIENT
// ============================================================================

#[derive(Clone)]
pub struct Client {
    inner: Arc<EngineInner>,
    pool: Arc<dyn Executor>,
    tx: Option<Arc<TxConn>>,
}

impl Client {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Handle for one entity type.
    pub fn entity(&self, name: &str) -> Result<EntityClient> {
        Ok(EntityClient {
            client: self.clone(),
            desc: self.inner.descriptor(name)?,
        })
    }

    pub(crate) fn query_for(&self, name: &str) -> Result<Query> {
        Ok(Query::new(self.clone(), self.inner.descriptor(name)?))
    }

    /// Executor for statements: the transaction when bound to one.
    pub fn exec(&self) -> &dyn Executor {
        match &self.tx {
            Some(tx) => tx.as_ref(),
            None => self.pool.as_ref(),
        }
    }

    pub fn pool(&self) -> Arc<dyn Executor> {
        self.pool.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub(crate) fn inner(&self) -> &EngineInner {
        &self.inner
    }

    pub fn in_tx(&self) -> bool {
        self.tx.is_some()
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        match &self.tx {
            Some(tx) if tx.is_closed() => Err(EntError::TxClosed),
            _ => Ok(()),
        }
    }

    /// The same client without its transaction binding.
    pub fn unwrapped(&self) -> Client {
        Client {
            inner: self.inner.clone(),
            pool: self.pool.clone(),
            tx: None,
        }
    }

    /// Open a transaction. Nested transactions are rejected.
    pub async fn tx(&self, ctx: &RequestContext) -> Result<Tx> {
        self.check_open()?;
        if self.in_tx() {
            return Err(EntError::config("nested transactions are not supported"));
        }
        ctx.check("store")?;
        let tx = self.pool.begin().await.map_err(EntError::Store)?;
        tracing::debug!("transaction opened");
        let conn = Arc::new(TxConn {
            tx,
            closed: AtomicBool::new(false),
        });
        Ok(Tx {
            client: Client {
                inner: self.inner.clone(),
                pool: self.pool.clone(),
                tx: Some(conn.clone()),
            },
            conn,
        })
    }

    /// Create every entity, junction and history table that does not exist.
    pub async fn migrate(&self, ctx: &RequestContext) -> Result<()> {
        migrate::run(self, ctx).await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("entities", &self.inner.order)
            .field("in_tx", &self.in_tx())
            .finish()
    }
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

/// An open transaction shared by the clients and entities bound to it.
pub(crate) struct TxConn {
    tx: Arc<dyn Transaction>,
    closed: AtomicBool,
}

impl TxConn {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn guard(&self) -> StoreResult<&dyn Transaction> {
        if self.is_closed() {
            return Err(StoreError::TxDone);
        }
        Ok(self.tx.as_ref())
    }
}

#[async_trait]
impl Executor for TxConn {
    async fn ensure_table(&self, table: &TableRef, schema: &TableSchema) -> StoreResult<()> {
        self.guard()?.ensure_table(table, schema).await
    }

    async fn query(&self, spec: &QuerySpec) -> StoreResult<Vec<Row>> {
        self.guard()?.query(spec).await
    }

    async fn count(&self, spec: &QuerySpec) -> StoreResult<usize> {
        self.guard()?.count(spec).await
    }

    async fn insert(&self, spec: &InsertSpec) -> StoreResult<Vec<Row>> {
        self.guard()?.insert(spec).await
    }

    async fn update(&self, spec: &UpdateSpec) -> StoreResult<Vec<Row>> {
        self.guard()?.update(spec).await
    }

    async fn delete(&self, spec: &DeleteSpec) -> StoreResult<usize> {
        self.guard()?.delete(spec).await
    }

    async fn link(&self, spec: &LinkSpec) -> StoreResult<()> {
        self.guard()?.link(spec).await
    }

    async fn unlink(&self, spec: &LinkSpec) -> StoreResult<usize> {
        self.guard()?.unlink(spec).await
    }

    async fn begin(&self) -> StoreResult<Arc<dyn Transaction>> {
        Err(StoreError::Backend(anyhow::anyhow!("nested transactions are not supported")))
    }
}

/// A transaction handle. Dropping it without committing discards the work.
pub struct Tx {
    client: Client,
    conn: Arc<TxConn>,
}

impl Tx {
    /// Client whose queries and mutations run inside this transaction.
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn commit(self) -> Result<()> {
        if self.conn.closed.swap(true, Ordering::SeqCst) {
            return Err(EntError::TxClosed);
        }
        self.conn.tx.commit().await.map_err(EntError::Store)?;
        tracing::debug!("transaction committed");
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        if self.conn.closed.swap(true, Ordering::SeqCst) {
            return Err(EntError::TxClosed);
        }
        self.conn.tx.rollback().await.map_err(EntError::Store)?;
        tracing::debug!("transaction rolled back");
        Ok(())
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        if !self.conn.closed.swap(true, Ordering::SeqCst) {
            tracing::warn!("transaction dropped without commit or rollback");
        }
    }
}

// ============================================================================
// ENTITY CLIENT
// ============================================================================

/// Entry point for reads and writes of one entity type.
#[derive(Clone)]
pub struct EntityClient {
    client: Client,
    desc: Arc<EntityDescriptor>,
}

impl EntityClient {
    pub fn descriptor(&self) -> &Arc<EntityDescriptor> {
        &self.desc
    }

    pub fn query(&self) -> Query {
        Query::new(self.client.clone(), self.desc.clone())
    }

    /// Load one entity by id through the full query pipeline.
    pub async fn get(&self, ctx: &RequestContext, id: impl Into<EntityId>) -> Result<Entity> {
        self.query()
            .filter(Predicate::Eq(ID_COLUMN.to_string(), id.into().to_value()))
            .only(ctx)
            .await
    }

    pub fn create(&self) -> Create {
        Create::new(self.client.clone(), self.desc.clone())
    }

    pub fn create_bulk(&self, items: Vec<Create>) -> CreateBulk {
        CreateBulk::new(self.client.clone(), self.desc.clone(), items)
    }

    pub fn update_one_id(&self, id: impl Into<EntityId>) -> UpdateOne {
        UpdateOne::new(self.client.clone(), self.desc.clone(), Op::UpdateOne, id.into())
    }

    pub fn update_one(&self, entity: &Entity) -> UpdateOne {
        self.update_one_id(entity.id().clone())
    }

    pub fn update(&self) -> Update {
        Update::new(self.client.clone(), self.desc.clone(), Op::Update)
    }

    pub fn delete_one_id(&self, id: impl Into<EntityId>) -> DeleteOne {
        DeleteOne::new(self.client.clone(), self.desc.clone(), id.into())
    }

    pub fn delete_one(&self, entity: &Entity) -> DeleteOne {
        self.delete_one_id(entity.id().clone())
    }

    pub fn delete(&self) -> Delete {
        Delete::new(self.client.clone(), self.desc.clone())
    }

    fn require_soft_delete(&self) -> Result<()> {
        if self.desc.soft_delete {
            Ok(())
        } else {
            Err(EntError::config(format!("{} does not support soft delete", self.desc.name)))
        }
    }

    pub fn soft_delete_one_id(&self, id: impl Into<EntityId>) -> Result<UpdateOne> {
        self.require_soft_delete()?;
        Ok(UpdateOne::new(
            self.client.clone(),
            self.desc.clone(),
            Op::SoftDeleteOne,
            id.into(),
        ))
    }

    pub fn soft_delete(&self) -> Result<Update> {
        self.require_soft_delete()?;
        Ok(Update::new(self.client.clone(), self.desc.clone(), Op::SoftDelete))
    }

    /// Read-back of the shadow history.
    pub fn history(&self) -> Result<HistoryQuery> {
        if !self.desc.tracked {
            return Err(EntError::config(format!("{} is not tracked", self.desc.name)));
        }
        Ok(HistoryQuery::new(self.client.clone(), self.desc.clone()))
    }

    /// Filter: at least one target exists across `edge`.
    pub fn has_edge(&self, edge: &str) -> Result<Predicate> {
        self.edge_predicate(edge, None)
    }

    /// Filter: at least one target across `edge` matches `filter`.
    pub fn has_edge_with(&self, edge: &str, filter: Predicate) -> Result<Predicate> {
        self.edge_predicate(edge, Some(filter))
    }

    fn edge_predicate(&self, edge: &str, filter: Option<Predicate>) -> Result<Predicate> {
        let e = self
            .desc
            .edge(edge)
            .ok_or_else(|| EntError::config(format!("{} has no edge '{}'", self.desc.name, edge)))?;
        let target = self.client.inner().descriptor(&e.target)?;
        if let Some(f) = &filter {
            predicate::check_columns(&target, [f], &[], None)?;
        }
        Ok(Predicate::HasEdge {
            step: predicate::edge_step(e, &target.table),
            filter: filter.map(Box::new),
        })
    }
}

impl std::fmt::Debug for EntityClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityClient")
            .field("entity", &self.desc.name)
            .field("in_tx", &self.client.in_tx())
            .finish()
    }
}
