//! Shadow history for tracked entities.
//!
//! Each committed mutation of a tracked entity appends one row per affected
//! entity to `{table}{suffix}`: the post-mutation field values, the operation,
//! a change reference grouping rows written by one call, and a `history_time`
//! strictly greater than the previous record for the same entity.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Timelike, Utc};
use entgraph_types::{EntityId, Order, Predicate, Row, Value, ID_COLUMN};
use serde::{Deserialize, Serialize};

use crate::client::Client;
use crate::context::RequestContext;
use crate::descriptor::EntityDescriptor;
use crate::entity::Entity;
use crate::error::{EntError, Result, StoreError};
use crate::executor::{InsertSpec, QuerySpec};
use crate::hook::Op;
use crate::query::{QueryOp, QueryPlan};
use crate::schema;

pub const ENTITY_ID: &str = "entity_id";
pub const HISTORY_TIME: &str = "history_time";
pub const REF: &str = "ref";
pub const OPERATION: &str = "operation";

/// Column names a tracked entity may not use for its own fields.
pub(crate) const RESERVED: [&str; 4] = [ENTITY_ID, HISTORY_TIME, REF, OPERATION];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOp {
    Create,
    Update,
    Delete,
}

impl HistoryOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryOp::Create => "create",
            HistoryOp::Update => "update",
            HistoryOp::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(HistoryOp::Create),
            "update" => Some(HistoryOp::Update),
            "delete" => Some(HistoryOp::Delete),
            _ => None,
        }
    }

    /// Physical deletes leave no history.
    pub fn for_op(op: Op) -> Option<Self> {
        match op {
            Op::Create => Some(HistoryOp::Create),
            Op::UpdateOne | Op::Update => Some(HistoryOp::Update),
            Op::SoftDeleteOne | Op::SoftDelete => Some(HistoryOp::Delete),
            Op::DeleteOne | Op::Delete => None,
        }
    }
}

impl fmt::Display for HistoryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CLOCK
// ============================================================================

/// Monotonic microsecond clock shared by one engine.
#[derive(Debug, Default)]
pub(crate) struct HistoryClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

fn truncate_micros(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_nanosecond(t.nanosecond() / 1_000 * 1_000).unwrap_or(t)
}

impl HistoryClock {
    /// Next timestamp, strictly after both the last one handed out and `floor`.
    pub(crate) fn next_after(&self, floor: Option<DateTime<Utc>>) -> DateTime<Utc> {
        let tick = Duration::microseconds(1);
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = truncate_micros(Utc::now());
        for bound in [*last, floor].into_iter().flatten() {
            let bound = truncate_micros(bound) + tick;
            if next < bound {
                next = bound;
            }
        }
        *last = Some(next);
        next
    }
}

// ============================================================================
// WRITER
// ============================================================================

/// Append one history row per committed entity.
pub(crate) async fn record(
    client: &Client,
    desc: &EntityDescriptor,
    ctx: &RequestContext,
    op: HistoryOp,
    entities: &[Entity],
) -> Result<()> {
    let inner = client.inner();
    let snap = schema::snapshot(inner.tenants.as_ref(), ctx).await?;
    let table = snap.table(&inner.config.history_table(&desc.table));
    let store_err = |e| EntError::from_store(&desc.name, e);

    let ids: Vec<Value> = entities.iter().map(|e| e.id().to_value()).collect();
    let mut latest = QuerySpec::new(table.clone(), ID_COLUMN);
    latest.columns = Some(vec![ENTITY_ID.to_string(), HISTORY_TIME.to_string()]);
    latest.predicate = Some(Predicate::In(ENTITY_ID.to_string(), ids));
    ctx.check("store")?;
    let previous = client.exec().query(&latest).await.map_err(store_err)?;

    let mut floors: HashMap<EntityId, DateTime<Utc>> = HashMap::new();
    for row in previous {
        let (Some(id), Some(t)) = (
            row.get(ENTITY_ID).and_then(|v| EntityId::try_from(v).ok()),
            row.get(HISTORY_TIME).and_then(Value::as_time),
        ) else {
            continue;
        };
        let floor = floors.entry(id).or_insert(t);
        if t > *floor {
            *floor = t;
        }
    }

    let change_ref = ctx
        .change_ref()
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let rows: Vec<Row> = entities
        .iter()
        .map(|entity| {
            let mut row = Row::new();
            row.insert(ID_COLUMN.to_string(), Value::from(uuid::Uuid::new_v4().to_string()));
            row.insert(ENTITY_ID.to_string(), entity.id().to_value());
            let time = inner.clock.next_after(floors.get(entity.id()).copied());
            row.insert(HISTORY_TIME.to_string(), Value::Time(time));
            row.insert(REF.to_string(), Value::from(change_ref.clone()));
            row.insert(OPERATION.to_string(), Value::from(op.as_str()));
            for field in &desc.fields {
                let value = entity.get(&field.name).cloned().unwrap_or_default();
                row.insert(field.name.clone(), value);
            }
            row
        })
        .collect();

    ctx.check("store")?;
    client
        .exec()
        .insert(&InsertSpec {
            table,
            id_column: ID_COLUMN.to_string(),
            rows,
        })
        .await
        .map_err(store_err)?;
    tracing::debug!(entity = %desc.name, op = %op, rows = entities.len(), change_ref = %change_ref, "history recorded");
    Ok(())
}

// ============================================================================
// READ-BACK
// ============================================================================

/// One shadow row.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub id: String,
    pub entity_id: EntityId,
    pub history_time: DateTime<Utc>,
    pub change_ref: Option<String>,
    pub operation: HistoryOp,
    /// The entity's field values after the change.
    pub values: Row,
}

impl HistoryRecord {
    fn from_row(desc: &EntityDescriptor, mut row: Row) -> Result<Self> {
        let bad = |what: &str| {
            EntError::Store(StoreError::Backend(anyhow::anyhow!(
                "{} history row has no usable {}",
                desc.name,
                what
            )))
        };
        let id = row
            .remove(ID_COLUMN)
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| bad(ID_COLUMN))?;
        let entity_id = row
            .remove(ENTITY_ID)
            .and_then(|v| EntityId::try_from(&v).ok())
            .ok_or_else(|| bad(ENTITY_ID))?;
        let history_time = row
            .remove(HISTORY_TIME)
            .and_then(|v| v.as_time())
            .ok_or_else(|| bad(HISTORY_TIME))?;
        let change_ref = row.remove(REF).and_then(|v| v.as_str().map(str::to_string));
        let operation = row
            .remove(OPERATION)
            .and_then(|v| v.as_str().and_then(HistoryOp::parse))
            .ok_or_else(|| bad(OPERATION))?;
        Ok(Self {
            id,
            entity_id,
            history_time,
            change_ref,
            operation,
            values: row,
        })
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field).filter(|v| !v.is_null())
    }
}

/// Reads the history of one tracked entity type.
///
/// The entity's query policy applies (its injected filters are evaluated
/// against the history rows); interceptors do not.
#[derive(Clone)]
pub struct HistoryQuery {
    client: Client,
    desc: Arc<EntityDescriptor>,
}

impl HistoryQuery {
    pub(crate) fn new(client: Client, desc: Arc<EntityDescriptor>) -> Self {
        Self { client, desc }
    }

    /// Every record for `id`, oldest first.
    pub async fn of(&self, ctx: &RequestContext, id: impl Into<EntityId>) -> Result<Vec<HistoryRecord>> {
        self.fetch(ctx, id.into(), None).await
    }

    /// The latest record for `id` at or before `at`.
    pub async fn as_of(
        &self,
        ctx: &RequestContext,
        id: impl Into<EntityId>,
        at: DateTime<Utc>,
    ) -> Result<Option<HistoryRecord>> {
        let mut records = self.fetch(ctx, id.into(), Some(at)).await?;
        Ok(records.pop())
    }

    async fn fetch(
        &self,
        ctx: &RequestContext,
        id: EntityId,
        at: Option<DateTime<Utc>>,
    ) -> Result<Vec<HistoryRecord>> {
        self.client.check_open()?;
        let inner = self.client.inner();
        let mut plan = QueryPlan::new(self.desc.name.clone(), QueryOp::All);
        inner.policies.get(&self.desc.name)?.eval_query(ctx, &mut plan).await?;

        let mut preds = plan.predicates;
        preds.push(Predicate::Eq(ENTITY_ID.to_string(), id.to_value()));
        if let Some(at) = at {
            preds.push(Predicate::lte(HISTORY_TIME, at));
        }

        let snap = schema::snapshot(inner.tenants.as_ref(), ctx).await?;
        let mut spec = QuerySpec::new(snap.table(&inner.config.history_table(&self.desc.table)), ID_COLUMN);
        spec.predicate = Predicate::all(preds);
        spec.order = vec![Order::asc(HISTORY_TIME)];

        ctx.check("store")?;
        let rows = self
            .client
            .exec()
            .query(&spec)
            .await
            .map_err(|e| EntError::from_store(&self.desc.name, e))?;
        rows.into_iter()
            .map(|row| HistoryRecord::from_row(&self.desc, row))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_map_to_tags() {
        assert_eq!(HistoryOp::for_op(Op::Create), Some(HistoryOp::Create));
        assert_eq!(HistoryOp::for_op(Op::Update), Some(HistoryOp::Update));
        assert_eq!(HistoryOp::for_op(Op::SoftDeleteOne), Some(HistoryOp::Delete));
        assert_eq!(HistoryOp::for_op(Op::Delete), None);
        assert_eq!(HistoryOp::parse("update"), Some(HistoryOp::Update));
        assert_eq!(HistoryOp::parse("upsert"), None);
    }

    #[test]
    fn clock_is_strictly_monotonic() {
        let clock = HistoryClock::default();
        let a = clock.next_after(None);
        let b = clock.next_after(None);
        assert!(b > a);
        assert_eq!(b.nanosecond() % 1_000, 0);
    }

    #[test]
    fn clock_respects_future_floor() {
        let clock = HistoryClock::default();
        let floor = Utc::now() + Duration::hours(1);
        let t = clock.next_after(Some(floor));
        assert!(t > floor);
        assert!(clock.next_after(None) > t);
    }

    #[test]
    fn records_parse_store_rows() {
        let desc = EntityDescriptor::builder("note")
            .field(crate::descriptor::Field::string("title"))
            .build()
            .unwrap();
        let mut row = Row::new();
        row.insert("id".into(), Value::from("h1"));
        row.insert(ENTITY_ID.into(), Value::from("n1"));
        row.insert(HISTORY_TIME.into(), Value::Time(Utc::now()));
        row.insert(REF.into(), Value::Null);
        row.insert(OPERATION.into(), Value::from("create"));
        row.insert("title".into(), Value::from("hello"));
        let rec = HistoryRecord::from_row(&desc, row).unwrap();
        assert_eq!(rec.entity_id, EntityId::from("n1"));
        assert_eq!(rec.operation, HistoryOp::Create);
        assert_eq!(rec.change_ref, None);
        assert_eq!(rec.get("title"), Some(&Value::from("hello")));
    }
}
