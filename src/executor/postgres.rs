//! PostgreSQL executor.
//!
//! Statement specs are rendered with `sqlx::QueryBuilder`; every value is a
//! bind parameter and every identifier is quoted. Rows come back as `jsonb`
//! and are decoded with the column types registered through `ensure_table`.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use entgraph_types::{Direction, EdgeLink, FieldType, Predicate, Row, TableRef, Value, ID_COLUMN};
use sqlx::error::ErrorKind;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use tokio::sync::Mutex;

use super::{
    DeleteSpec, Executor, InsertSpec, LinkSpec, OnDelete, QuerySpec, StoreResult, TableSchema, Transaction,
    UpdateSpec, EDGE_OWNER_COLUMN,
};
use crate::error::{ConstraintKind, StoreError};

type Builder = QueryBuilder<'static, Postgres>;
type Schemas = Arc<RwLock<HashMap<TableRef, TableSchema>>>;

// ============================================================================
// RENDERING
// ============================================================================

fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn table_sql(table: &TableRef) -> String {
    match &table.schema {
        Some(schema) => format!("{}.{}", ident(schema), ident(&table.name)),
        None => ident(&table.name),
    }
}

fn column_sql(alias: &str, column: &str) -> String {
    format!("{}.{}", alias, ident(column))
}

fn sql_type(ty: FieldType) -> &'static str {
    match ty {
        FieldType::Bool => "BOOLEAN",
        FieldType::Int => "BIGINT",
        FieldType::Float => "DOUBLE PRECISION",
        FieldType::String => "TEXT",
        FieldType::Time => "TIMESTAMPTZ",
        FieldType::Strings => "TEXT[]",
        FieldType::Json => "JSONB",
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn push_value(qb: &mut Builder, value: &Value) {
    match value {
        Value::Null => qb.push("NULL"),
        Value::Bool(b) => qb.push_bind(*b),
        Value::Int(i) => qb.push_bind(*i),
        Value::Float(f) => qb.push_bind(*f),
        Value::String(s) => qb.push_bind(s.clone()),
        Value::Time(t) => qb.push_bind(*t),
        Value::Strings(v) => qb.push_bind(v.clone()),
        Value::Json(j) => qb.push_bind(Json(j.clone())),
    };
}

fn push_list(qb: &mut Builder, values: &[Value]) {
    qb.push("(");
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        push_value(qb, v);
    }
    qb.push(")");
}

/// Render `pred` against the row aliased `alias`. `depth` names nested
/// traversal aliases.
fn push_predicate(qb: &mut Builder, pred: &Predicate, alias: &str, depth: &mut usize) {
    let compare = |qb: &mut Builder, col: &str, op: &str, v: &Value| {
        qb.push(column_sql(alias, col)).push(format!(" {} ", op));
        push_value(qb, v);
    };
    let like = |qb: &mut Builder, col: &str, op: &str, pattern: String| {
        qb.push(column_sql(alias, col))
            .push(format!(" {} ", op))
            .push_bind(pattern)
            .push(" ESCAPE '\\'");
    };

    match pred {
        Predicate::Eq(c, v) => compare(qb, c, "=", v),
        Predicate::Ne(c, v) => compare(qb, c, "<>", v),
        Predicate::Gt(c, v) => compare(qb, c, ">", v),
        Predicate::Gte(c, v) => compare(qb, c, ">=", v),
        Predicate::Lt(c, v) => compare(qb, c, "<", v),
        Predicate::Lte(c, v) => compare(qb, c, "<=", v),
        Predicate::In(_, vs) if vs.is_empty() => {
            qb.push("FALSE");
        }
        Predicate::NotIn(_, vs) if vs.is_empty() => {
            qb.push("TRUE");
        }
        Predicate::In(c, vs) => {
            qb.push(column_sql(alias, c)).push(" IN ");
            push_list(qb, vs);
        }
        Predicate::NotIn(c, vs) => {
            qb.push(column_sql(alias, c)).push(" NOT IN ");
            push_list(qb, vs);
        }
        Predicate::IsNull(c) => {
            qb.push(column_sql(alias, c)).push(" IS NULL");
        }
        Predicate::NotNull(c) => {
            qb.push(column_sql(alias, c)).push(" IS NOT NULL");
        }
        Predicate::Contains(c, s) => like(qb, c, "LIKE", format!("%{}%", escape_like(s))),
        Predicate::ContainsFold(c, s) => like(qb, c, "ILIKE", format!("%{}%", escape_like(s))),
        Predicate::HasPrefix(c, s) => like(qb, c, "LIKE", format!("{}%", escape_like(s))),
        Predicate::HasSuffix(c, s) => like(qb, c, "LIKE", format!("%{}", escape_like(s))),
        Predicate::HasElement(c, s) => {
            qb.push_bind(s.clone()).push(" = ANY(").push(column_sql(alias, c)).push(")");
        }
        Predicate::And(ps) | Predicate::Or(ps) if ps.is_empty() => {
            qb.push(if matches!(pred, Predicate::And(_)) { "TRUE" } else { "FALSE" });
        }
        Predicate::And(ps) | Predicate::Or(ps) => {
            let glue = if matches!(pred, Predicate::And(_)) { " AND " } else { " OR " };
            qb.push("(");
            for (i, p) in ps.iter().enumerate() {
                if i > 0 {
                    qb.push(glue);
                }
                push_predicate(qb, p, alias, depth);
            }
            qb.push(")");
        }
        Predicate::Not(p) => {
            qb.push("NOT (");
            push_predicate(qb, p, alias, depth);
            qb.push(")");
        }
        Predicate::HasEdge { step, filter } => {
            *depth += 1;
            let target = format!("e{}", depth);
            let target_id = column_sql(&target, &step.target_id);
            qb.push("EXISTS (SELECT 1 FROM ");
            match &step.link {
                EdgeLink::SourceColumn(col) => {
                    qb.push(format!(
                        "{} {} WHERE {} = {}",
                        table_sql(&step.target),
                        target,
                        target_id,
                        column_sql(alias, col)
                    ));
                }
                EdgeLink::TargetColumn(col) => {
                    qb.push(format!(
                        "{} {} WHERE {} = {}",
                        table_sql(&step.target),
                        target,
                        column_sql(&target, col),
                        column_sql(alias, ID_COLUMN)
                    ));
                }
                EdgeLink::Junction {
                    table,
                    owner_column,
                    target_column,
                } => {
                    let junction = format!("j{}", depth);
                    qb.push(format!(
                        "{} {} JOIN {} {} ON {} = {} WHERE {} = {}",
                        table_sql(table),
                        junction,
                        table_sql(&step.target),
                        target,
                        target_id,
                        column_sql(&junction, target_column),
                        column_sql(&junction, owner_column),
                        column_sql(alias, ID_COLUMN)
                    ));
                }
            }
            if let Some(f) = filter {
                qb.push(" AND ");
                push_predicate(qb, f, &target, depth);
            }
            qb.push(")");
        }
    }
}

/// `FROM ... WHERE ...` of a select over `spec`, aliased `t0`.
fn push_from_where(qb: &mut Builder, spec: &QuerySpec) {
    qb.push(format!(" FROM {} t0", table_sql(&spec.table)));
    if let Some(through) = &spec.through {
        qb.push(format!(
            " JOIN {} j0 ON {} = {}",
            table_sql(&through.table),
            column_sql("j0", &through.target_column),
            column_sql("t0", &spec.id_column)
        ));
    }
    qb.push(" WHERE TRUE");
    if let Some(through) = &spec.through {
        qb.push(" AND ");
        push_predicate(qb, &Predicate::In(through.owner_column.clone(), through.owners.clone()), "j0", &mut 0);
    }
    if let Some(pred) = &spec.predicate {
        qb.push(" AND ");
        push_predicate(qb, pred, "t0", &mut 0);
    }
}

fn push_limit(qb: &mut Builder, spec: &QuerySpec) {
    if let Some(limit) = spec.limit {
        qb.push(" LIMIT ").push_bind(limit as i64);
    }
    if let Some(offset) = spec.offset {
        qb.push(" OFFSET ").push_bind(offset as i64);
    }
}

fn on_delete_sql(on_delete: OnDelete) -> &'static str {
    match on_delete {
        OnDelete::Restrict => "RESTRICT",
        OnDelete::Cascade => "CASCADE",
        OnDelete::SetNull => "SET NULL",
    }
}

fn create_table_sql(table: &TableRef, schema: &TableSchema) -> String {
    let mut parts: Vec<String> = schema
        .columns
        .iter()
        .map(|c| {
            let mut def = format!("{} {}", ident(&c.name), sql_type(c.ty));
            if schema.auto_increment.as_deref() == Some(c.name.as_str()) {
                def.push_str(" GENERATED BY DEFAULT AS IDENTITY");
            }
            if !c.nullable {
                def.push_str(" NOT NULL");
            }
            def
        })
        .collect();
    if !schema.primary_key.is_empty() {
        let cols: Vec<String> = schema.primary_key.iter().map(|c| ident(c)).collect();
        parts.push(format!("PRIMARY KEY ({})", cols.join(", ")));
    }
    for col in &schema.unique {
        parts.push(format!("UNIQUE ({})", ident(col)));
    }
    for fk in &schema.foreign_keys {
        parts.push(format!(
            "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {}",
            ident(&fk.column),
            table_sql(&fk.references),
            ident(&fk.ref_column),
            on_delete_sql(fk.on_delete)
        ));
    }
    format!("CREATE TABLE IF NOT EXISTS {} ({})", table_sql(table), parts.join(", "))
}

// ============================================================================
// ERRORS AND DECODING
// ============================================================================

fn store_err(e: sqlx::Error) -> StoreError {
    if let Some(db) = e.as_database_error() {
        let kind = match db.kind() {
            ErrorKind::UniqueViolation => Some(ConstraintKind::Unique),
            ErrorKind::ForeignKeyViolation => Some(ConstraintKind::ForeignKey),
            ErrorKind::NotNullViolation => Some(ConstraintKind::NotNull),
            ErrorKind::CheckViolation => Some(ConstraintKind::Check),
            _ => None,
        };
        if let Some(kind) = kind {
            return StoreError::constraint(kind, db.message());
        }
        if db.code().as_deref() == Some("42P01") {
            return StoreError::UnknownTable(db.message().to_string());
        }
    }
    StoreError::Backend(anyhow::Error::new(e))
}

struct Decoder {
    schema: Option<TableSchema>,
    owner: Option<FieldType>,
}

impl Decoder {
    fn new(schemas: &Schemas, table: &TableRef, through: Option<&TableRef>, owner_column: Option<&str>) -> StoreResult<Self> {
        let cache = schemas.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let owner = match (through, owner_column) {
            (Some(t), Some(c)) => cache.get(t).and_then(|s| s.column(c)).map(|c| c.ty),
            _ => None,
        };
        Ok(Self {
            schema: cache.get(table).cloned(),
            owner,
        })
    }

    fn row(&self, json: serde_json::Value) -> StoreResult<Row> {
        let serde_json::Value::Object(map) = json else {
            return Err(anyhow!("expected a JSON object row, got {}", json).into());
        };
        let mut row = Row::new();
        for (k, v) in map {
            let ty = if k == EDGE_OWNER_COLUMN {
                self.owner
            } else {
                self.schema.as_ref().and_then(|s| s.column(&k)).map(|c| c.ty)
            };
            let value = match ty {
                Some(ty) => Value::from_json(v, ty).map_err(|e| anyhow!("column {}: {}", k, e))?,
                None => match v {
                    serde_json::Value::Null => Value::Null,
                    serde_json::Value::Bool(b) => Value::Bool(b),
                    serde_json::Value::String(s) => Value::String(s),
                    serde_json::Value::Number(n) if n.is_i64() => Value::Int(n.as_i64().unwrap_or_default()),
                    serde_json::Value::Number(n) => Value::Float(n.as_f64().unwrap_or_default()),
                    other => Value::Json(other),
                },
            };
            row.insert(k, value);
        }
        Ok(row)
    }
}

// ============================================================================
// STATEMENTS
// ============================================================================

async fn fetch_rows<'e, E>(conn: E, mut qb: Builder, decoder: &Decoder) -> StoreResult<Vec<Row>>
where
    E: sqlx::PgExecutor<'e>,
{
    let rows: Vec<Json<serde_json::Value>> = qb.build_query_scalar().fetch_all(conn).await.map_err(store_err)?;
    rows.into_iter().map(|Json(j)| decoder.row(j)).collect()
}

fn select_sql(spec: &QuerySpec) -> Builder {
    let mut qb = Builder::new("SELECT to_jsonb(s)");
    let extra: Vec<String> = match &spec.columns {
        Some(cols) => spec
            .order
            .iter()
            .filter(|o| !cols.contains(&o.field))
            .map(|o| o.field.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
        None => Vec::new(),
    };
    if !extra.is_empty() {
        let keys: Vec<String> = extra.iter().map(|c| format!("'{}'", c.replace('\'', "''"))).collect();
        qb.push(format!(" - ARRAY[{}]::text[]", keys.join(", ")));
    }
    qb.push(" AS row FROM (SELECT ");
    if spec.unique {
        qb.push("DISTINCT ");
    }
    if let Some(through) = &spec.through {
        qb.push(format!("{} AS {}, ", column_sql("j0", &through.owner_column), ident(EDGE_OWNER_COLUMN)));
    }
    match &spec.columns {
        Some(cols) => {
            let rendered: Vec<String> = cols
                .iter()
                .chain(extra.iter())
                .map(|c| column_sql("t0", c))
                .collect();
            qb.push(rendered.join(", "));
        }
        None => {
            qb.push("t0.*");
        }
    }
    push_from_where(&mut qb, spec);
    qb.push(") s");
    if !spec.order.is_empty() {
        let terms: Vec<String> = spec
            .order
            .iter()
            .map(|o| {
                let dir = match o.direction {
                    Direction::Asc => "ASC NULLS FIRST",
                    Direction::Desc => "DESC NULLS LAST",
                };
                format!("{} {}", column_sql("s", &o.field), dir)
            })
            .collect();
        qb.push(" ORDER BY ").push(terms.join(", "));
    }
    push_limit(&mut qb, spec);
    qb
}

fn count_sql(spec: &QuerySpec) -> Builder {
    let mut qb = Builder::new("SELECT COUNT(*) FROM (SELECT ");
    if spec.unique {
        qb.push("DISTINCT ");
    }
    match &spec.columns {
        Some(cols) => {
            let rendered: Vec<String> = cols.iter().map(|c| column_sql("t0", c)).collect();
            qb.push(rendered.join(", "));
        }
        None => {
            qb.push("t0.*");
        }
    }
    push_from_where(&mut qb, spec);
    push_limit(&mut qb, spec);
    qb.push(") c");
    qb
}

/// One `INSERT` per distinct column set; rows come back in input order.
fn insert_sql(table: &TableRef, rows: &[Row]) -> Builder {
    let columns: BTreeSet<&String> = rows.iter().flat_map(|r| r.keys()).collect();
    let mut qb = Builder::new(format!("INSERT INTO {} AS t0 ", table_sql(table)));
    if columns.is_empty() {
        qb.push("DEFAULT VALUES");
    } else {
        let names: Vec<String> = columns.iter().map(|c| ident(c)).collect();
        qb.push(format!("({}) VALUES ", names.join(", ")));
        for (i, row) in rows.iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            qb.push("(");
            for (j, col) in columns.iter().enumerate() {
                if j > 0 {
                    qb.push(", ");
                }
                match row.get(*col) {
                    Some(v) => push_value(&mut qb, v),
                    None => {
                        qb.push("DEFAULT");
                    }
                }
            }
            qb.push(")");
        }
    }
    qb.push(" RETURNING to_jsonb(t0) AS row");
    qb
}

fn update_sql(spec: &UpdateSpec) -> Builder {
    let mut qb = Builder::new(format!("UPDATE {} AS t0 SET ", table_sql(&spec.table)));
    let mut first = true;
    for (col, value) in &spec.set {
        if !first {
            qb.push(", ");
        }
        first = false;
        qb.push(format!("{} = ", ident(col)));
        push_value(&mut qb, value);
    }
    for (col, extra) in &spec.append {
        if !first {
            qb.push(", ");
        }
        first = false;
        qb.push(format!(
            "{} = array_cat(COALESCE({}, ARRAY[]::text[]), ",
            ident(col),
            column_sql("t0", col)
        ))
        .push_bind(extra.clone())
        .push(")");
    }
    if first {
        qb.push(format!("{} = {}", ident(ID_COLUMN), column_sql("t0", ID_COLUMN)));
    }
    if let Some(pred) = &spec.predicate {
        qb.push(" WHERE ");
        push_predicate(&mut qb, pred, "t0", &mut 0);
    }
    qb.push(" RETURNING to_jsonb(t0) AS row");
    qb
}

fn delete_sql(spec: &DeleteSpec) -> Builder {
    let mut qb = Builder::new(format!("DELETE FROM {} AS t0", table_sql(&spec.table)));
    if let Some(pred) = &spec.predicate {
        qb.push(" WHERE ");
        push_predicate(&mut qb, pred, "t0", &mut 0);
    }
    qb
}

fn link_sql(spec: &LinkSpec) -> Builder {
    let mut qb = Builder::new(format!(
        "INSERT INTO {} ({}, {}) VALUES ",
        table_sql(&spec.table),
        ident(&spec.owner_column),
        ident(&spec.target_column)
    ));
    for (i, (owner, target)) in spec.pairs.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push("(");
        push_value(&mut qb, owner);
        qb.push(", ");
        push_value(&mut qb, target);
        qb.push(")");
    }
    qb.push(" ON CONFLICT DO NOTHING");
    qb
}

fn unlink_sql(spec: &LinkSpec) -> Builder {
    let mut qb = Builder::new(format!(
        "DELETE FROM {} WHERE ({}, {}) IN (",
        table_sql(&spec.table),
        ident(&spec.owner_column),
        ident(&spec.target_column)
    ));
    for (i, (owner, target)) in spec.pairs.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push("(");
        push_value(&mut qb, owner);
        qb.push(", ");
        push_value(&mut qb, target);
        qb.push(")");
    }
    qb.push(")");
    qb
}

fn decoder_for(schemas: &Schemas, spec: &QuerySpec) -> StoreResult<Decoder> {
    Decoder::new(
        schemas,
        &spec.table,
        spec.through.as_ref().map(|t| &t.table),
        spec.through.as_ref().map(|t| t.owner_column.as_str()),
    )
}

fn remember(schemas: &Schemas, table: &TableRef, schema: &TableSchema) -> StoreResult<()> {
    schemas
        .write()
        .map_err(|e| anyhow!("Lock: {}", e))?
        .insert(table.clone(), schema.clone());
    Ok(())
}

// ============================================================================
// EXECUTOR
// ============================================================================

/// Executor over a `sqlx` Postgres pool.
#[derive(Clone)]
pub struct PgExecutor {
    pool: PgPool,
    schemas: Schemas,
}

impl PgExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schemas: Arc::default(),
        }
    }

    pub async fn connect(url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .context("Failed to connect to Postgres")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Executor for PgExecutor {
    async fn ensure_table(&self, table: &TableRef, schema: &TableSchema) -> StoreResult<()> {
        if let Some(ns) = &table.schema {
            sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", ident(ns)))
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
        }
        sqlx::query(&create_table_sql(table, schema))
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        remember(&self.schemas, table, schema)
    }

    async fn query(&self, spec: &QuerySpec) -> StoreResult<Vec<Row>> {
        let decoder = decoder_for(&self.schemas, spec)?;
        fetch_rows(&self.pool, select_sql(spec), &decoder).await
    }

    async fn count(&self, spec: &QuerySpec) -> StoreResult<usize> {
        let n: i64 = count_sql(spec)
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(n as usize)
    }

    async fn insert(&self, spec: &InsertSpec) -> StoreResult<Vec<Row>> {
        if spec.rows.is_empty() {
            return Ok(Vec::new());
        }
        // Multi-row inserts must be atomic: run them in a transaction.
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let rows = insert_rows(&mut tx, &self.schemas, spec).await?;
        tx.commit().await.map_err(store_err)?;
        Ok(rows)
    }

    async fn update(&self, spec: &UpdateSpec) -> StoreResult<Vec<Row>> {
        let decoder = Decoder::new(&self.schemas, &spec.table, None, None)?;
        fetch_rows(&self.pool, update_sql(spec), &decoder).await
    }

    async fn delete(&self, spec: &DeleteSpec) -> StoreResult<usize> {
        let done = delete_sql(spec).build().execute(&self.pool).await.map_err(store_err)?;
        Ok(done.rows_affected() as usize)
    }

    async fn link(&self, spec: &LinkSpec) -> StoreResult<()> {
        if spec.pairs.is_empty() {
            return Ok(());
        }
        link_sql(spec).build().execute(&self.pool).await.map_err(store_err)?;
        Ok(())
    }

    async fn unlink(&self, spec: &LinkSpec) -> StoreResult<usize> {
        if spec.pairs.is_empty() {
            return Ok(0);
        }
        let done = unlink_sql(spec).build().execute(&self.pool).await.map_err(store_err)?;
        Ok(done.rows_affected() as usize)
    }

    async fn begin(&self) -> StoreResult<Arc<dyn Transaction>> {
        let tx = self.pool.begin().await.map_err(store_err)?;
        Ok(Arc::new(PgTx {
            tx: Mutex::new(Some(tx)),
            schemas: self.schemas.clone(),
        }))
    }
}

async fn insert_rows(
    conn: &mut sqlx::PgConnection,
    schemas: &Schemas,
    spec: &InsertSpec,
) -> StoreResult<Vec<Row>> {
    let decoder = Decoder::new(schemas, &spec.table, None, None)?;
    let mut out = Vec::with_capacity(spec.rows.len());
    // Rows without any column can only be inserted one at a time.
    if spec.rows.iter().any(|r| r.is_empty()) {
        for row in &spec.rows {
            out.extend(fetch_rows(&mut *conn, insert_sql(&spec.table, std::slice::from_ref(row)), &decoder).await?);
        }
    } else {
        out = fetch_rows(&mut *conn, insert_sql(&spec.table, &spec.rows), &decoder).await?;
    }
    Ok(out)
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

struct PgTx {
    tx: Mutex<Option<sqlx::Transaction<'static, Postgres>>>,
    schemas: Schemas,
}

#[async_trait]
impl Executor for PgTx {
    async fn ensure_table(&self, table: &TableRef, schema: &TableSchema) -> StoreResult<()> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::TxDone)?;
        if let Some(ns) = &table.schema {
            sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", ident(ns)))
                .execute(&mut **tx)
                .await
                .map_err(store_err)?;
        }
        sqlx::query(&create_table_sql(table, schema))
            .execute(&mut **tx)
            .await
            .map_err(store_err)?;
        remember(&self.schemas, table, schema)
    }

    async fn query(&self, spec: &QuerySpec) -> StoreResult<Vec<Row>> {
        let decoder = decoder_for(&self.schemas, spec)?;
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::TxDone)?;
        fetch_rows(&mut **tx, select_sql(spec), &decoder).await
    }

    async fn count(&self, spec: &QuerySpec) -> StoreResult<usize> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::TxDone)?;
        let n: i64 = count_sql(spec)
            .build_query_scalar()
            .fetch_one(&mut **tx)
            .await
            .map_err(store_err)?;
        Ok(n as usize)
    }

    async fn insert(&self, spec: &InsertSpec) -> StoreResult<Vec<Row>> {
        if spec.rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::TxDone)?;
        insert_rows(&mut **tx, &self.schemas, spec).await
    }

    async fn update(&self, spec: &UpdateSpec) -> StoreResult<Vec<Row>> {
        let decoder = Decoder::new(&self.schemas, &spec.table, None, None)?;
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::TxDone)?;
        fetch_rows(&mut **tx, update_sql(spec), &decoder).await
    }

    async fn delete(&self, spec: &DeleteSpec) -> StoreResult<usize> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::TxDone)?;
        let done = delete_sql(spec).build().execute(&mut **tx).await.map_err(store_err)?;
        Ok(done.rows_affected() as usize)
    }

    async fn link(&self, spec: &LinkSpec) -> StoreResult<()> {
        if spec.pairs.is_empty() {
            return Ok(());
        }
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::TxDone)?;
        link_sql(spec).build().execute(&mut **tx).await.map_err(store_err)?;
        Ok(())
    }

    async fn unlink(&self, spec: &LinkSpec) -> StoreResult<usize> {
        if spec.pairs.is_empty() {
            return Ok(0);
        }
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::TxDone)?;
        let done = unlink_sql(spec).build().execute(&mut **tx).await.map_err(store_err)?;
        Ok(done.rows_affected() as usize)
    }

    async fn begin(&self) -> StoreResult<Arc<dyn Transaction>> {
        Err(anyhow!("nested transactions are not supported").into())
    }
}

#[async_trait]
impl Transaction for PgTx {
    async fn commit(&self) -> StoreResult<()> {
        let tx = self.tx.lock().await.take().ok_or(StoreError::TxDone)?;
        tx.commit().await.map_err(store_err)
    }

    async fn rollback(&self) -> StoreResult<()> {
        let tx = self.tx.lock().await.take().ok_or(StoreError::TxDone)?;
        tx.rollback().await.map_err(store_err)
    }
}
