//! The query pipeline.
//!
//! A [`Query`] is a plain, cloneable description of a read. Executing it runs
//! the entity's interceptors in order (soft-delete filter first, then global
//! and entity-scoped registrations, then query-local ones), evaluates the
//! policy last, resolves the schema snapshot, issues one statement and then
//! resolves eager-loaded edges.

use std::sync::Arc;

use entgraph_types::{EntityId, Order, Predicate, Value, ID_COLUMN};
use futures::future::{BoxFuture, FutureExt};

use crate::client::Client;
use crate::context::RequestContext;
use crate::descriptor::EntityDescriptor;
use crate::edge;
use crate::entity::Entity;
use crate::error::{EntError, Result};
use crate::executor::{JunctionJoin, QuerySpec};
use crate::interceptor::Interceptor;
use crate::predicate;
use crate::schema::{self, SchemaSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOp {
    All,
    First,
    FirstId,
    Only,
    OnlyId,
    Ids,
    Count,
    Exist,
}

/// The part of a query interceptors and policies may inspect and rewrite.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub entity: String,
    pub op: QueryOp,
    /// Conjunctive filters.
    pub predicates: Vec<Predicate>,
    pub order: Vec<Order>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub unique: bool,
    /// Projection; `None` materializes every field.
    pub fields: Option<Vec<String>>,
}

impl QueryPlan {
    pub fn new(entity: impl Into<String>, op: QueryOp) -> Self {
        Self {
            entity: entity.into(),
            op,
            predicates: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            unique: false,
            fields: None,
        }
    }

    pub fn filter(&mut self, predicate: Predicate) {
        self.predicates.push(predicate);
    }
}

#[derive(Clone)]
pub(crate) struct EdgeLoad {
    pub edge: String,
    pub alias: Option<String>,
    pub query: Query,
}

/// Junction restriction for M2M edge loads; tables are routed at execution.
#[derive(Debug, Clone)]
pub(crate) struct Through {
    pub table: String,
    pub owner_column: String,
    pub target_column: String,
    pub owners: Vec<Value>,
}

/// Builder errors surfaced when the query executes.
#[derive(Debug, Clone)]
enum Deferred {
    Config(String),
}

#[derive(Clone)]
pub struct Query {
    client: Client,
    desc: Arc<EntityDescriptor>,
    plan: QueryPlan,
    edges: Vec<EdgeLoad>,
    local: Vec<Arc<dyn Interceptor>>,
    through: Option<Through>,
    deferred: Option<Deferred>,
}

impl Query {
    pub(crate) fn new(client: Client, desc: Arc<EntityDescriptor>) -> Self {
        let plan = QueryPlan::new(desc.name.clone(), QueryOp::All);
        Self {
            client,
            desc,
            plan,
            edges: Vec::new(),
            local: Vec::new(),
            through: None,
            deferred: None,
        }
    }

    pub fn entity_name(&self) -> &str {
        &self.desc.name
    }

    // ── Builder ──

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.plan.filter(predicate);
        self
    }

    pub fn order_by(mut self, order: Order) -> Self {
        self.plan.order.push(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.plan.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.plan.offset = Some(offset);
        self
    }

    /// Return distinct rows.
    pub fn unique(mut self, unique: bool) -> Self {
        self.plan.unique = unique;
        self
    }

    /// Materialize only these fields (the id is always included).
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plan.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Add a query-local interceptor, run after the registered ones.
    pub fn intercept(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.local.push(Arc::new(interceptor));
        self
    }

    /// Eager-load `edge` with the target's default query.
    pub fn with_edge(self, edge: &str) -> Self {
        self.add_edge(edge, None, |q| q)
    }

    /// Eager-load `edge`, configuring the target query with `f`.
    pub fn with_edge_query<F>(self, edge: &str, f: F) -> Self
    where
        F: FnOnce(Query) -> Query,
    {
        self.add_edge(edge, None, f)
    }

    /// A second, independently filtered load of `edge` kept under `alias`.
    pub fn with_named_edge<F>(self, alias: &str, edge: &str, f: F) -> Self
    where
        F: FnOnce(Query) -> Query,
    {
        if self.edges.iter().any(|l| l.alias.as_deref() == Some(alias)) {
            return self.defer(format!("named edge '{}' loaded twice", alias));
        }
        self.add_edge(edge, Some(alias.to_string()), f)
    }

    fn add_edge<F>(mut self, edge: &str, alias: Option<String>, f: F) -> Self
    where
        F: FnOnce(Query) -> Query,
    {
        let Some(desc) = self.desc.edge(edge) else {
            let msg = format!("{} has no edge '{}'", self.desc.name, edge);
            return self.defer(msg);
        };
        match self.client.query_for(&desc.target) {
            Ok(target) => {
                self.edges.push(EdgeLoad {
                    edge: edge.to_string(),
                    alias,
                    query: f(target),
                });
                self
            }
            Err(e) => self.defer(e.to_string()),
        }
    }

    fn defer(mut self, message: String) -> Self {
        if self.deferred.is_none() {
            self.deferred = Some(Deferred::Config(message));
        }
        self
    }

    pub(crate) fn through(mut self, through: Through) -> Self {
        self.through = Some(through);
        self
    }

    /// Make sure `field` is materialized even under a narrow `select`.
    pub(crate) fn ensure_selected(mut self, field: &str) -> Self {
        if let Some(fields) = &mut self.plan.fields {
            if !fields.iter().any(|f| f == field) {
                fields.push(field.to_string());
            }
        }
        self
    }

    // ── Execution ──

    /// Every matching entity; empty when nothing matches.
    pub async fn all(&self, ctx: &RequestContext) -> Result<Vec<Entity>> {
        self.fetch(ctx, QueryOp::All).await
    }

    /// First entity under the ordering; `NotFound` when nothing matches.
    pub async fn first(&self, ctx: &RequestContext) -> Result<Entity> {
        let mut rows = self.fetch(ctx, QueryOp::First).await?;
        if rows.is_empty() {
            return Err(self.not_found());
        }
        Ok(rows.swap_remove(0))
    }

    pub async fn first_id(&self, ctx: &RequestContext) -> Result<EntityId> {
        let ids = self.fetch_ids(ctx, QueryOp::FirstId).await?;
        ids.into_iter().next().ok_or_else(|| self.not_found())
    }

    /// The single match: `NotFound` on zero rows, `NotSingular` on more.
    pub async fn only(&self, ctx: &RequestContext) -> Result<Entity> {
        let mut rows = self.fetch(ctx, QueryOp::Only).await?;
        match rows.len() {
            0 => Err(self.not_found()),
            1 => Ok(rows.swap_remove(0)),
            _ => Err(self.not_singular()),
        }
    }

    pub async fn only_id(&self, ctx: &RequestContext) -> Result<EntityId> {
        let mut ids = self.fetch_ids(ctx, QueryOp::OnlyId).await?;
        match ids.len() {
            0 => Err(self.not_found()),
            1 => Ok(ids.swap_remove(0)),
            _ => Err(self.not_singular()),
        }
    }

    pub async fn ids(&self, ctx: &RequestContext) -> Result<Vec<EntityId>> {
        self.fetch_ids(ctx, QueryOp::Ids).await
    }

    pub async fn count(&self, ctx: &RequestContext) -> Result<usize> {
        self.count_rows(ctx, QueryOp::Count).await
    }

    pub async fn exist(&self, ctx: &RequestContext) -> Result<bool> {
        Ok(self.count_rows(ctx, QueryOp::Exist).await? > 0)
    }

    // ── Panicking wrappers ──

    /// Like [`Query::all`], panicking on error.
    pub async fn all_x(&self, ctx: &RequestContext) -> Vec<Entity> {
        match self.all(ctx).await {
            Ok(v) => v,
            Err(e) => panic!("{} all: {}", self.desc.name, e),
        }
    }

    /// Like [`Query::first`], panicking on error.
    pub async fn first_x(&self, ctx: &RequestContext) -> Entity {
        match self.first(ctx).await {
            Ok(v) => v,
            Err(e) => panic!("{} first: {}", self.desc.name, e),
        }
    }

    /// Like [`Query::only`], panicking on error.
    pub async fn only_x(&self, ctx: &RequestContext) -> Entity {
        match self.only(ctx).await {
            Ok(v) => v,
            Err(e) => panic!("{} only: {}", self.desc.name, e),
        }
    }

    /// Like [`Query::ids`], panicking on error.
    pub async fn ids_x(&self, ctx: &RequestContext) -> Vec<EntityId> {
        match self.ids(ctx).await {
            Ok(v) => v,
            Err(e) => panic!("{} ids: {}", self.desc.name, e),
        }
    }

    /// Like [`Query::count`], panicking on error.
    pub async fn count_x(&self, ctx: &RequestContext) -> usize {
        match self.count(ctx).await {
            Ok(v) => v,
            Err(e) => panic!("{} count: {}", self.desc.name, e),
        }
    }

    /// Like [`Query::exist`], panicking on error.
    pub async fn exist_x(&self, ctx: &RequestContext) -> bool {
        match self.exist(ctx).await {
            Ok(v) => v,
            Err(e) => panic!("{} exist: {}", self.desc.name, e),
        }
    }

    // ── Internals ──

    fn not_found(&self) -> EntError {
        EntError::NotFound {
            entity: self.desc.name.clone(),
        }
    }

    fn not_singular(&self) -> EntError {
        EntError::NotSingular {
            entity: self.desc.name.clone(),
        }
    }

    #[tracing::instrument(skip_all, fields(entity = %self.desc.name, op = ?op))]
    async fn prepare(&self, ctx: &RequestContext, op: QueryOp) -> Result<(QueryPlan, Arc<SchemaSnapshot>)> {
        self.client.check_open()?;
        if let Some(Deferred::Config(msg)) = &self.deferred {
            return Err(EntError::config(msg.clone()));
        }

        let inner = self.client.inner();
        let mut plan = self.plan.clone();
        plan.op = op;

        let registered = inner.interceptors_for(&self.desc);
        for interceptor in registered.iter().chain(self.local.iter()) {
            ctx.check("interceptor")?;
            interceptor.intercept(ctx, &mut plan).await?;
        }
        inner.policies.get(&self.desc.name)?.eval_query(ctx, &mut plan).await?;

        predicate::check_columns(&self.desc, &plan.predicates, &plan.order, plan.fields.as_deref())?;
        let snap = schema::snapshot(inner.tenants.as_ref(), ctx).await?;
        Ok((plan, snap))
    }

    fn spec(&self, plan: &QueryPlan, snap: &SchemaSnapshot) -> QuerySpec {
        let mut spec = QuerySpec::new(snap.table(&self.desc.table), ID_COLUMN);
        spec.predicate = Predicate::all(plan.predicates.clone()).map(|p| predicate::route(p, snap));
        spec.order = plan.order.clone();
        spec.offset = plan.offset;
        spec.unique = plan.unique;
        spec.limit = match plan.op {
            QueryOp::First | QueryOp::FirstId | QueryOp::Exist => Some(1),
            QueryOp::Only | QueryOp::OnlyId => Some(2),
            _ => plan.limit,
        };
        spec.columns = match plan.op {
            QueryOp::FirstId | QueryOp::OnlyId | QueryOp::Ids => Some(vec![ID_COLUMN.to_string()]),
            QueryOp::Count | QueryOp::Exist => None,
            _ => plan.fields.as_ref().map(|fields| {
                let mut cols = vec![ID_COLUMN.to_string()];
                let fk_columns = self.edges.iter().filter_map(|l| {
                    match self.desc.edge(&l.edge).map(|e| &e.storage) {
                        Some(crate::edge::EdgeStorage::SourceColumn(c)) => Some(c.clone()),
                        _ => None,
                    }
                });
                for f in fields.iter().cloned().chain(fk_columns) {
                    if !cols.contains(&f) {
                        cols.push(f);
                    }
                }
                cols
            }),
        };
        spec.through = self.through.as_ref().map(|t| JunctionJoin {
            table: snap.table(&t.table),
            owner_column: t.owner_column.clone(),
            target_column: t.target_column.clone(),
            owners: t.owners.clone(),
        });
        spec
    }

    /// Materialize entities and resolve edge loads.
    ///
    /// Boxed because edge loads recurse into the target's query.
    pub(crate) fn fetch<'a>(&'a self, ctx: &'a RequestContext, op: QueryOp) -> BoxFuture<'a, Result<Vec<Entity>>> {
        async move {
            let (plan, snap) = self.prepare(ctx, op).await?;
            let spec = self.spec(&plan, &snap);

            ctx.check("store")?;
            let rows = self
                .client
                .exec()
                .query(&spec)
                .await
                .map_err(|e| EntError::from_store(&self.desc.name, e))?;
            tracing::debug!(entity = %self.desc.name, op = ?op, rows = rows.len(), "query executed");

            let mut entities = rows
                .into_iter()
                .map(|row| Entity::from_row(&self.desc, row, Some(self.client.clone())))
                .collect::<Result<Vec<_>>>()?;

            for load in &self.edges {
                edge::resolve(ctx, &self.desc, &mut entities, load).await?;
            }
            Ok(entities)
        }
        .boxed()
    }

    async fn fetch_ids(&self, ctx: &RequestContext, op: QueryOp) -> Result<Vec<EntityId>> {
        let (plan, snap) = self.prepare(ctx, op).await?;
        let spec = self.spec(&plan, &snap);
        ctx.check("store")?;
        let rows = self
            .client
            .exec()
            .query(&spec)
            .await
            .map_err(|e| EntError::from_store(&self.desc.name, e))?;
        rows.iter()
            .map(|row| {
                let v = row.get(ID_COLUMN).cloned().unwrap_or_default();
                EntityId::try_from(&v).map_err(|e| {
                    EntError::Store(crate::error::StoreError::Backend(anyhow::anyhow!(
                        "{} id column: {}",
                        self.desc.name,
                        e
                    )))
                })
            })
            .collect()
    }

    async fn count_rows(&self, ctx: &RequestContext, op: QueryOp) -> Result<usize> {
        let (plan, snap) = self.prepare(ctx, op).await?;
        let spec = self.spec(&plan, &snap);
        ctx.check("store")?;
        let n = self
            .client
            .exec()
            .count(&spec)
            .await
            .map_err(|e| EntError::from_store(&self.desc.name, e))?;
        tracing::debug!(entity = %self.desc.name, op = ?op, count = n, "count executed");
        Ok(n)
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("entity", &self.desc.name)
            .field("plan", &self.plan)
            .field("edges", &self.edges.iter().map(|l| l.alias.as_ref().unwrap_or(&l.edge)).collect::<Vec<_>>())
            .finish()
    }
}
