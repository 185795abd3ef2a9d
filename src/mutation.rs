//! The mutation pipeline and its builders.
//!
//! Every builder funnels into [`execute`]: defaults and edge folding happen
//! first, then the entity's hook chain runs around the store write. The
//! store write evaluates the policy, validates, and issues the statements
//! (inside a local transaction when edge rows have to change alongside).
//! History is written after the primary change has committed.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use entgraph_types::{EntityId, IdType, Predicate, Row, Value, ID_COLUMN};

use crate::client::{Client, EngineInner};
use crate::context::RequestContext;
use crate::descriptor::{DefaultValue, EntityDescriptor, DELETED_AT, DELETED_BY, TAGS};
use crate::edge::EdgeStorage;
use crate::entity::Entity;
use crate::error::{EntError, Result};
use crate::executor::{DeleteSpec, InsertSpec, LinkSpec, UpdateSpec};
use crate::history::{self, HistoryOp};
use crate::hook::{EdgeChange, Mutation, MutationOutput, Next, Op, Terminal};
use crate::predicate;
use crate::schema::{self, SchemaSnapshot};

// ============================================================================
// PIPELINE
// ============================================================================

#[tracing::instrument(skip_all, fields(entity = %desc.name, op = %mutation.op))]
pub(crate) async fn execute(
    client: &Client,
    desc: &Arc<EntityDescriptor>,
    ctx: &RequestContext,
    mut mutation: Mutation,
) -> Result<MutationOutput> {
    client.check_open()?;
    ctx.check("mutation")?;
    if mutation.op == Op::Create && mutation.creates.is_empty() {
        return Ok(MutationOutput::Entities(Vec::new()));
    }
    prepare(client.inner(), desc, ctx, &mut mutation)?;

    let hooks = client.inner().hooks_for(&desc.name);
    let terminal = StoreWrite {
        client: client.clone(),
        desc: desc.clone(),
    };
    let out = Next::new(&hooks, &terminal).run(ctx, &mut mutation).await?;

    let config = client.config();
    if let Some(op) = HistoryOp::for_op(mutation.op) {
        if desc.tracked && config.history.enabled && !mutation.committed.is_empty() {
            if let Err(e) = history::record(client, desc, ctx, op, &mutation.committed).await {
                tracing::warn!(entity = %desc.name, error = %e, "history write failed after commit");
                return Err(EntError::HistoryWrite {
                    committed: mutation.committed,
                    source: Box::new(e),
                });
            }
        }
    }
    Ok(out)
}

/// Everything that happens before hooks see the mutation.
fn prepare(inner: &EngineInner, desc: &EntityDescriptor, ctx: &RequestContext, m: &mut Mutation) -> Result<()> {
    if m.op == Op::Create && m.creates.len() > inner.config.max_batch_size {
        return Err(EntError::validation(
            &desc.name,
            "batch",
            format!(
                "{} items exceed the batch limit of {}",
                m.creates.len(),
                inner.config.max_batch_size
            ),
        ));
    }

    match m.op {
        Op::Create => {
            for row in &mut m.creates {
                if !row.contains_key(ID_COLUMN) && desc.generated_id && desc.id_type == IdType::String {
                    row.insert(ID_COLUMN.to_string(), EntityId::new_uuid().to_value());
                }
                for field in &desc.fields {
                    if row.contains_key(&field.name) {
                        continue;
                    }
                    if let Some(default) = &field.default {
                        row.insert(field.name.clone(), resolve_default(inner, ctx, default)?);
                    }
                }
            }
        }
        op if op.is_update() => {
            if op.is_soft_delete() {
                m.set.insert(DELETED_AT.to_string(), Value::Time(Utc::now()));
                m.set
                    .insert(DELETED_BY.to_string(), Value::from(ctx.actor().map(str::to_string)));
            }
            for field in &desc.fields {
                if m.set.contains_key(&field.name) {
                    continue;
                }
                if let Some(default) = &field.update_default {
                    m.set.insert(field.name.clone(), resolve_default(inner, ctx, default)?);
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn resolve_default(inner: &EngineInner, ctx: &RequestContext, default: &DefaultValue) -> Result<Value> {
    match default {
        DefaultValue::Value(v) => Ok(v.clone()),
        DefaultValue::Func(f) => Ok(f(ctx)),
        DefaultValue::Provider(name) => inner
            .providers
            .get(name)
            .map(|f| f(ctx))
            .ok_or_else(|| EntError::config(format!("default provider '{}' is not registered", name))),
    }
}

/// Edges stored in this entity's own column become plain field assignments.
///
/// Runs after the hooks so edge changes they push are folded too.
fn fold_source_edges(desc: &EntityDescriptor, m: &mut Mutation) -> Result<()> {
    let changes = std::mem::take(&mut m.edges);
    for change in changes {
        let edge = desc
            .edge(&change.edge)
            .ok_or_else(|| EntError::validation(&desc.name, &change.edge, "unknown edge"))?;
        let EdgeStorage::SourceColumn(col) = &edge.storage else {
            if m.op == Op::Create && change.item >= m.creates.len() {
                return Err(EntError::validation(&desc.name, &change.edge, "edge change for missing item"));
            }
            m.edges.push(change);
            continue;
        };

        let value = if change.add {
            match change.ids.as_slice() {
                [id] => id.to_value(),
                _ => {
                    return Err(EntError::validation(
                        &desc.name,
                        &change.edge,
                        format!("to-one edge takes exactly one id, got {}", change.ids.len()),
                    )
                    .at_item(change.item))
                }
            }
        } else {
            if m.op == Op::Create {
                return Err(EntError::validation(&desc.name, &change.edge, "cannot remove edges on create"));
            }
            Value::Null
        };

        if m.op == Op::Create {
            let row = m
                .creates
                .get_mut(change.item)
                .ok_or_else(|| EntError::validation(&desc.name, &change.edge, "edge change for missing item"))?;
            row.insert(col.clone(), value);
        } else {
            m.set.insert(col.clone(), value);
        }
    }
    Ok(())
}

// ── Validation ──

fn check_create_row(desc: &EntityDescriptor, row: &mut Row) -> Result<()> {
    for key in row.keys() {
        if key != ID_COLUMN && desc.field(key).is_none() {
            return Err(EntError::validation(&desc.name, key, "unknown field"));
        }
    }
    match row.get(ID_COLUMN) {
        Some(v) if v.is_null() || !v.fits(desc.id_field_type()) => {
            return Err(EntError::validation(
                &desc.name,
                ID_COLUMN,
                format!("expected {} id, got {}", desc.id_field_type(), v),
            ))
        }
        None if !desc.generated_id => {
            return Err(EntError::validation(&desc.name, ID_COLUMN, "id must be assigned by the caller"))
        }
        _ => {}
    }
    for field in &desc.fields {
        match row.remove(&field.name) {
            None | Some(Value::Null) if field.required => {
                return Err(EntError::validation(&desc.name, &field.name, "required field is missing"))
            }
            None => {}
            Some(v) => {
                field
                    .check_value(&v)
                    .map_err(|reason| EntError::validation(&desc.name, &field.name, reason))?;
                row.insert(field.name.clone(), field.coerce(v));
            }
        }
    }
    Ok(())
}

fn check_update(desc: &EntityDescriptor, m: &mut Mutation) -> Result<()> {
    if m.set.contains_key(ID_COLUMN) {
        return Err(EntError::validation(&desc.name, ID_COLUMN, "id cannot be changed"));
    }
    let set = std::mem::take(&mut m.set);
    for (name, value) in set {
        let field = desc
            .field(&name)
            .ok_or_else(|| EntError::validation(&desc.name, &name, "unknown field"))?;
        if field.immutable {
            return Err(EntError::validation(&desc.name, &name, "field is immutable"));
        }
        if field.required && value.is_null() {
            return Err(EntError::validation(&desc.name, &name, "required field cannot be cleared"));
        }
        field
            .check_value(&value)
            .map_err(|reason| EntError::validation(&desc.name, &name, reason))?;
        m.set.insert(name, field.coerce(value));
    }
    if !m.append_tags.is_empty() && !desc.has_column(TAGS) {
        return Err(EntError::validation(&desc.name, TAGS, "entity has no tags"));
    }
    Ok(())
}

fn check(desc: &EntityDescriptor, m: &mut Mutation) -> Result<()> {
    match m.op {
        Op::Create => {
            let bulk = m.creates.len() > 1;
            for (i, row) in m.creates.iter_mut().enumerate() {
                check_create_row(desc, row).map_err(|e| if bulk { e.at_item(i) } else { e })?;
            }
        }
        op if op.is_update() => check_update(desc, m)?,
        _ => {}
    }
    if m.op.is_one() && m.id.is_none() {
        return Err(EntError::config(format!("{} on {} without an id", m.op, desc.name)));
    }
    predicate::check_columns(desc, &m.predicates, &[], None)
}

// ============================================================================
// STORE WRITE
// ============================================================================

struct StoreWrite {
    client: Client,
    desc: Arc<EntityDescriptor>,
}

#[async_trait]
impl Terminal for StoreWrite {
    async fn apply(&self, ctx: &RequestContext, m: &mut Mutation) -> Result<MutationOutput> {
        let inner = self.client.inner();
        fold_source_edges(&self.desc, m)?;
        inner.policies.get(&self.desc.name)?.eval_mutation(ctx, m).await?;
        check(&self.desc, m)?;
        let snap = schema::snapshot(inner.tenants.as_ref(), ctx).await?;

        if self.client.in_tx() || m.edges.is_empty() {
            return write(&self.client, &self.desc, &snap, ctx, m).await;
        }

        // Edge rows live outside the entity table: write both atomically.
        let tx = self.client.tx(ctx).await?;
        match write(tx.client(), &self.desc, &snap, ctx, m).await {
            Ok(out) => {
                tx.commit().await?;
                m.committed = std::mem::take(&mut m.committed).into_iter().map(Entity::unwrap).collect();
                Ok(match out {
                    MutationOutput::Entities(v) => MutationOutput::Entities(v.into_iter().map(Entity::unwrap).collect()),
                    count => count,
                })
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(entity = %self.desc.name, error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }
}

async fn write(
    client: &Client,
    desc: &EntityDescriptor,
    snap: &SchemaSnapshot,
    ctx: &RequestContext,
    m: &mut Mutation,
) -> Result<MutationOutput> {
    let table = snap.table(&desc.table);
    let store_err = |e| EntError::from_store(&desc.name, e);

    match m.op {
        Op::Create => {
            ctx.check("store")?;
            let spec = InsertSpec {
                table,
                id_column: ID_COLUMN.to_string(),
                rows: m.creates.clone(),
            };
            let rows = client.exec().insert(&spec).await.map_err(store_err)?;
            let entities = to_entities(client, desc, rows)?;
            for change in &m.edges {
                let owner = entities.get(change.item).ok_or_else(|| {
                    EntError::Store(crate::error::StoreError::Backend(anyhow::anyhow!(
                        "insert returned fewer rows than items"
                    )))
                })?;
                apply_edge(client, desc, snap, ctx, owner.id(), change).await?;
            }
            tracing::debug!(entity = %desc.name, rows = entities.len(), "created");
            m.committed = entities.clone();
            Ok(MutationOutput::Entities(entities))
        }

        op if op.is_update() => {
            let mut preds = scoped_predicates(m);
            if desc.soft_delete && !ctx.soft_delete_skipped() {
                preds.push(Predicate::is_null(DELETED_AT));
            }
            let mut append = BTreeMap::new();
            if !m.append_tags.is_empty() {
                append.insert(TAGS.to_string(), m.append_tags.clone());
            }
            let spec = UpdateSpec {
                table,
                predicate: Predicate::all(preds).map(|p| predicate::route(p, snap)),
                set: m.set.clone(),
                append,
            };
            ctx.check("store")?;
            let rows = client.exec().update(&spec).await.map_err(store_err)?;
            if op.is_one() && rows.is_empty() {
                return Err(EntError::NotFound {
                    entity: desc.name.clone(),
                });
            }
            let entities = to_entities(client, desc, rows)?;
            for entity in &entities {
                for change in &m.edges {
                    apply_edge(client, desc, snap, ctx, entity.id(), change).await?;
                }
            }
            tracing::debug!(entity = %desc.name, rows = entities.len(), "updated");
            m.committed = entities.clone();
            Ok(if op.is_one() {
                MutationOutput::Entities(entities)
            } else {
                MutationOutput::Count(entities.len())
            })
        }

        op => {
            let spec = DeleteSpec {
                table,
                predicate: Predicate::all(scoped_predicates(m)).map(|p| predicate::route(p, snap)),
            };
            ctx.check("store")?;
            let n = client.exec().delete(&spec).await.map_err(store_err)?;
            if op.is_one() && n == 0 {
                return Err(EntError::NotFound {
                    entity: desc.name.clone(),
                });
            }
            tracing::debug!(entity = %desc.name, rows = n, "deleted");
            Ok(MutationOutput::Count(n))
        }
    }
}

fn scoped_predicates(m: &Mutation) -> Vec<Predicate> {
    let mut preds = m.predicates.clone();
    if let (true, Some(id)) = (m.op.is_one(), &m.id) {
        preds.push(Predicate::Eq(ID_COLUMN.to_string(), id.to_value()));
    }
    preds
}

fn to_entities(client: &Client, desc: &EntityDescriptor, rows: Vec<Row>) -> Result<Vec<Entity>> {
    rows.into_iter()
        .map(|row| Entity::from_row(desc, row, Some(client.clone())))
        .collect()
}

/// Write one edge change owned by `owner`.
async fn apply_edge(
    client: &Client,
    desc: &EntityDescriptor,
    snap: &SchemaSnapshot,
    ctx: &RequestContext,
    owner: &EntityId,
    change: &EdgeChange,
) -> Result<()> {
    if change.ids.is_empty() {
        return Ok(());
    }
    let edge = desc
        .edge(&change.edge)
        .ok_or_else(|| EntError::validation(&desc.name, &change.edge, "unknown edge"))?;
    let target = client.inner().descriptor(&edge.target)?;
    let ids: Vec<Value> = change.ids.iter().map(EntityId::to_value).collect();
    ctx.check("store")?;

    match &edge.storage {
        // Folded into the row before the write.
        EdgeStorage::SourceColumn(_) => Ok(()),

        EdgeStorage::TargetColumn(col) => {
            let table = snap.table(&target.table);
            if change.add {
                let mut set = Row::new();
                set.insert(col.clone(), owner.to_value());
                let spec = UpdateSpec {
                    table,
                    predicate: Some(Predicate::In(ID_COLUMN.to_string(), ids)),
                    set,
                    append: BTreeMap::new(),
                };
                let rows = client
                    .exec()
                    .update(&spec)
                    .await
                    .map_err(|e| EntError::from_store(&target.name, e))?;
                let wanted: HashSet<&EntityId> = change.ids.iter().collect();
                if rows.len() < wanted.len() {
                    return Err(EntError::NotFound {
                        entity: target.name.clone(),
                    });
                }
            } else {
                let mut set = Row::new();
                set.insert(col.clone(), Value::Null);
                let spec = UpdateSpec {
                    table,
                    predicate: Some(Predicate::In(ID_COLUMN.to_string(), ids).and(Predicate::Eq(
                        col.clone(),
                        owner.to_value(),
                    ))),
                    set,
                    append: BTreeMap::new(),
                };
                client
                    .exec()
                    .update(&spec)
                    .await
                    .map_err(|e| EntError::from_store(&target.name, e))?;
            }
            Ok(())
        }

        EdgeStorage::Junction {
            table,
            owner_column,
            target_column,
        } => {
            let spec = LinkSpec {
                table: snap.table(table),
                owner_column: owner_column.clone(),
                target_column: target_column.clone(),
                pairs: ids.into_iter().map(|t| (owner.to_value(), t)).collect(),
            };
            let result = if change.add {
                client.exec().link(&spec).await
            } else {
                client.exec().unlink(&spec).await.map(|_| ())
            };
            result.map_err(|e| EntError::from_store(&desc.name, e))
        }
    }
}

// ============================================================================
// BUILDERS
// ============================================================================

fn edge_change<I, T>(edge: &str, add: bool, ids: I) -> EdgeChange
where
    I: IntoIterator<Item = T>,
    T: Into<EntityId>,
{
    EdgeChange {
        item: 0,
        edge: edge.to_string(),
        add,
        ids: ids.into_iter().map(Into::into).collect(),
    }
}

fn entity_ids(entities: &[Entity]) -> Vec<EntityId> {
    entities.iter().map(|e| e.id().clone()).collect()
}

fn single(desc: &EntityDescriptor, out: MutationOutput) -> Result<Entity> {
    out.into_entities().into_iter().next().ok_or_else(|| EntError::NotFound {
        entity: desc.name.clone(),
    })
}

/// Builder for one new entity.
#[derive(Clone)]
pub struct Create {
    client: Client,
    desc: Arc<EntityDescriptor>,
    row: Row,
    edges: Vec<EdgeChange>,
}

impl Create {
    pub(crate) fn new(client: Client, desc: Arc<EntityDescriptor>) -> Self {
        Self {
            client,
            desc,
            row: Row::new(),
            edges: Vec::new(),
        }
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.row.insert(field.to_string(), value.into());
        self
    }

    /// Set `field` only when `value` is `Some`.
    pub fn set_opt<V: Into<Value>>(self, field: &str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.set(field, v),
            None => self,
        }
    }

    /// Assign the id instead of letting the engine generate one.
    pub fn set_id(mut self, id: impl Into<EntityId>) -> Self {
        self.row.insert(ID_COLUMN.to_string(), id.into().to_value());
        self
    }

    pub fn add_edge_ids<I, T>(mut self, edge: &str, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EntityId>,
    {
        self.edges.push(edge_change(edge, true, ids));
        self
    }

    pub fn add_edge_entities(self, edge: &str, entities: &[Entity]) -> Self {
        self.add_edge_ids(edge, entity_ids(entities))
    }

    fn into_mutation(self) -> Mutation {
        let mut m = Mutation::new(self.desc.name.clone(), Op::Create);
        m.creates.push(self.row);
        m.edges = self.edges;
        m
    }

    pub async fn save(self, ctx: &RequestContext) -> Result<Entity> {
        let (client, desc) = (self.client.clone(), self.desc.clone());
        let out = execute(&client, &desc, ctx, self.into_mutation()).await?;
        single(&desc, out)
    }

    /// Like [`Create::save`], panicking on error.
    pub async fn save_x(self, ctx: &RequestContext) -> Entity {
        let entity = self.desc.name.clone();
        match self.save(ctx).await {
            Ok(v) => v,
            Err(e) => panic!("{} create: {}", entity, e),
        }
    }

    pub async fn exec(self, ctx: &RequestContext) -> Result<()> {
        self.save(ctx).await.map(|_| ())
    }
}

/// Builder for a batch of creates written with one insert.
pub struct CreateBulk {
    client: Client,
    desc: Arc<EntityDescriptor>,
    items: Vec<Create>,
}

impl CreateBulk {
    pub(crate) fn new(client: Client, desc: Arc<EntityDescriptor>, items: Vec<Create>) -> Self {
        Self { client, desc, items }
    }

    pub async fn save(self, ctx: &RequestContext) -> Result<Vec<Entity>> {
        let mut m = Mutation::new(self.desc.name.clone(), Op::Create);
        for (i, item) in self.items.into_iter().enumerate() {
            if item.desc.name != self.desc.name {
                return Err(EntError::config(format!(
                    "bulk create of {} got a {} item at {}",
                    self.desc.name, item.desc.name, i
                )));
            }
            m.creates.push(item.row);
            m.edges.extend(item.edges.into_iter().map(|mut c| {
                c.item = i;
                c
            }));
        }
        let out = execute(&self.client, &self.desc, ctx, m).await?;
        Ok(out.into_entities())
    }

    /// Like [`CreateBulk::save`], panicking on error.
    pub async fn save_x(self, ctx: &RequestContext) -> Vec<Entity> {
        let entity = self.desc.name.clone();
        match self.save(ctx).await {
            Ok(v) => v,
            Err(e) => panic!("{} bulk create: {}", entity, e),
        }
    }

    pub async fn exec(self, ctx: &RequestContext) -> Result<()> {
        self.save(ctx).await.map(|_| ())
    }
}

/// Builder for updating (or soft-deleting) one entity by id.
pub struct UpdateOne {
    client: Client,
    desc: Arc<EntityDescriptor>,
    op: Op,
    id: EntityId,
    set: Row,
    append: Vec<String>,
    edges: Vec<EdgeChange>,
}

impl UpdateOne {
    pub(crate) fn new(client: Client, desc: Arc<EntityDescriptor>, op: Op, id: EntityId) -> Self {
        Self {
            client,
            desc,
            op,
            id,
            set: Row::new(),
            append: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set.insert(field.to_string(), value.into());
        self
    }

    pub fn set_opt<V: Into<Value>>(self, field: &str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.set(field, v),
            None => self,
        }
    }

    /// Set `field` to null.
    pub fn clear(mut self, field: &str) -> Self {
        self.set.insert(field.to_string(), Value::Null);
        self
    }

    pub fn append_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.append.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn add_edge_ids<I, T>(mut self, edge: &str, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EntityId>,
    {
        self.edges.push(edge_change(edge, true, ids));
        self
    }

    pub fn remove_edge_ids<I, T>(mut self, edge: &str, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EntityId>,
    {
        self.edges.push(edge_change(edge, false, ids));
        self
    }

    pub fn add_edge_entities(self, edge: &str, entities: &[Entity]) -> Self {
        self.add_edge_ids(edge, entity_ids(entities))
    }

    pub fn remove_edge_entities(self, edge: &str, entities: &[Entity]) -> Self {
        self.remove_edge_ids(edge, entity_ids(entities))
    }

    /// Apply the update and return the fresh entity.
    pub async fn save(self, ctx: &RequestContext) -> Result<Entity> {
        let mut m = Mutation::new(self.desc.name.clone(), self.op);
        m.id = Some(self.id);
        m.set = self.set;
        m.append_tags = self.append;
        m.edges = self.edges;
        let out = execute(&self.client, &self.desc, ctx, m).await?;
        single(&self.desc, out)
    }

    /// Like [`UpdateOne::save`], panicking on error.
    pub async fn save_x(self, ctx: &RequestContext) -> Entity {
        let entity = self.desc.name.clone();
        match self.save(ctx).await {
            Ok(v) => v,
            Err(e) => panic!("{} update: {}", entity, e),
        }
    }

    pub async fn exec(self, ctx: &RequestContext) -> Result<()> {
        self.save(ctx).await.map(|_| ())
    }
}

/// Builder for updating (or soft-deleting) every entity matching a filter.
pub struct Update {
    client: Client,
    desc: Arc<EntityDescriptor>,
    op: Op,
    predicates: Vec<Predicate>,
    set: Row,
    append: Vec<String>,
}

impl Update {
    pub(crate) fn new(client: Client, desc: Arc<EntityDescriptor>, op: Op) -> Self {
        Self {
            client,
            desc,
            op,
            predicates: Vec::new(),
            set: Row::new(),
            append: Vec::new(),
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set.insert(field.to_string(), value.into());
        self
    }

    pub fn set_opt<V: Into<Value>>(self, field: &str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.set(field, v),
            None => self,
        }
    }

    pub fn clear(mut self, field: &str) -> Self {
        self.set.insert(field.to_string(), Value::Null);
        self
    }

    pub fn append_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.append.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Apply the update; returns the number of affected rows.
    pub async fn save(self, ctx: &RequestContext) -> Result<usize> {
        let mut m = Mutation::new(self.desc.name.clone(), self.op);
        m.predicates = self.predicates;
        m.set = self.set;
        m.append_tags = self.append;
        let out = execute(&self.client, &self.desc, ctx, m).await?;
        Ok(out.count())
    }

    /// Like [`Update::save`], panicking on error.
    pub async fn save_x(self, ctx: &RequestContext) -> usize {
        let entity = self.desc.name.clone();
        match self.save(ctx).await {
            Ok(v) => v,
            Err(e) => panic!("{} update: {}", entity, e),
        }
    }

    pub async fn exec(self, ctx: &RequestContext) -> Result<()> {
        self.save(ctx).await.map(|_| ())
    }
}

/// Physical delete of one entity by id.
pub struct DeleteOne {
    client: Client,
    desc: Arc<EntityDescriptor>,
    id: EntityId,
}

impl DeleteOne {
    pub(crate) fn new(client: Client, desc: Arc<EntityDescriptor>, id: EntityId) -> Self {
        Self { client, desc, id }
    }

    pub async fn exec(self, ctx: &RequestContext) -> Result<()> {
        let mut m = Mutation::new(self.desc.name.clone(), Op::DeleteOne);
        m.id = Some(self.id);
        execute(&self.client, &self.desc, ctx, m).await.map(|_| ())
    }

    /// Like [`DeleteOne::exec`], panicking on error.
    pub async fn exec_x(self, ctx: &RequestContext) {
        let entity = self.desc.name.clone();
        if let Err(e) = self.exec(ctx).await {
            panic!("{} delete: {}", entity, e);
        }
    }
}

/// Physical delete of every entity matching a filter.
pub struct Delete {
    client: Client,
    desc: Arc<EntityDescriptor>,
    predicates: Vec<Predicate>,
}

impl Delete {
    pub(crate) fn new(client: Client, desc: Arc<EntityDescriptor>) -> Self {
        Self {
            client,
            desc,
            predicates: Vec::new(),
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Returns the number of deleted rows.
    pub async fn exec(self, ctx: &RequestContext) -> Result<usize> {
        let mut m = Mutation::new(self.desc.name.clone(), Op::Delete);
        m.predicates = self.predicates;
        let out = execute(&self.client, &self.desc, ctx, m).await?;
        Ok(out.count())
    }

    /// Like [`Delete::exec`], panicking on error.
    pub async fn exec_x(self, ctx: &RequestContext) -> usize {
        let entity = self.desc.name.clone();
        match self.exec(ctx).await {
            Ok(v) => v,
            Err(e) => panic!("{} delete: {}", entity, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Field;
    use crate::edge::EdgeDescriptor;
    use crate::validate;

    fn note() -> EntityDescriptor {
        EntityDescriptor::builder("note")
            .audited()
            .field(Field::string("title").required().validate(validate::max_len(5)))
            .field(Field::string("slug").immutable())
            .field(Field::float("score"))
            .field(Field::string("owner_id"))
            .edge(EdgeDescriptor::many_to_one("owner", "organization", "owner_id"))
            .edge(EdgeDescriptor::one_to_many("files", "file", "note_id"))
            .build()
            .unwrap()
    }

    fn row(title: &str) -> Row {
        let mut r = Row::new();
        r.insert("title".into(), Value::from(title));
        r
    }

    #[test]
    fn create_rows_are_checked_and_coerced() {
        let d = note();
        let mut r = row("hi");
        r.insert("score".into(), Value::Int(3));
        check_create_row(&d, &mut r).unwrap();
        assert_eq!(r["score"], Value::Float(3.0));

        let err = check_create_row(&d, &mut row("too long")).unwrap_err();
        assert!(matches!(err, EntError::Validation { ref field, .. } if field == "title"));

        let err = check_create_row(&d, &mut Row::new()).unwrap_err();
        assert!(err.to_string().contains("required"));

        let mut r = row("hi");
        r.insert("color".into(), Value::from("red"));
        assert!(check_create_row(&d, &mut r).unwrap_err().is_validation());
    }

    #[test]
    fn bulk_errors_name_the_item() {
        let d = note();
        let mut m = Mutation::new("note", Op::Create);
        m.creates = vec![row("ok"), row("way too long")];
        match check(&d, &mut m).unwrap_err() {
            EntError::Validation { item, field, .. } => {
                assert_eq!(item, Some(1));
                assert_eq!(field, "title");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn updates_reject_immutable_and_cleared_required_fields() {
        let d = note();
        let mut m = Mutation::new("note", Op::UpdateOne);
        m.id = Some(EntityId::from("n1"));
        m.set.insert("slug".into(), Value::from("x"));
        assert!(check(&d, &mut m).unwrap_err().to_string().contains("immutable"));

        let mut m = Mutation::new("note", Op::Update);
        m.set.insert("title".into(), Value::Null);
        assert!(check(&d, &mut m).unwrap_err().to_string().contains("cleared"));

        let mut m = Mutation::new("note", Op::Update);
        m.set.insert("id".into(), Value::from("other"));
        assert!(check(&d, &mut m).is_err());
    }

    #[test]
    fn source_column_edges_fold_into_fields() {
        let d = note();
        let mut m = Mutation::new("note", Op::Create);
        m.creates.push(row("hi"));
        m.edges.push(edge_change("owner", true, ["org1"]));
        m.edges.push(edge_change("files", true, ["f1"]));
        fold_source_edges(&d, &mut m).unwrap();
        assert_eq!(m.creates[0]["owner_id"], Value::from("org1"));
        assert_eq!(m.edges.len(), 1);
        assert_eq!(m.edges[0].edge, "files");

        let mut m = Mutation::new("note", Op::UpdateOne);
        m.edges.push(edge_change("owner", false, ["org1"]));
        fold_source_edges(&d, &mut m).unwrap();
        assert_eq!(m.set["owner_id"], Value::Null);

        let mut m = Mutation::new("note", Op::UpdateOne);
        m.edges.push(edge_change("owner", true, ["a", "b"]));
        assert!(fold_source_edges(&d, &mut m).unwrap_err().is_validation());

        let mut m = Mutation::new("note", Op::UpdateOne);
        m.edges.push(edge_change::<_, &str>("nope", true, []));
        assert!(fold_source_edges(&d, &mut m).unwrap_err().is_validation());
    }
}
