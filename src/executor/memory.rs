//! In-process executor for tests and embedding.
//!
//! Every mutating statement runs against a copy of the state and is swapped in
//! only when all constraints hold, so statements are atomic. Transactions work
//! on a private copy taken at `begin`; `commit` replaces the shared state with
//! it (last commit wins, there is no conflict detection).
//!
//! Predicates follow SQL three-valued logic: comparisons against NULL are
//! unknown and unknown rows are not selected.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use anyhow::anyhow;
use async_trait::async_trait;
use entgraph_types::{Direction, EdgeLink, Order, Predicate, Row, TableRef, Value, ID_COLUMN};

use super::{
    DeleteSpec, Executor, InsertSpec, LinkSpec, OnDelete, QuerySpec, StoreResult, TableSchema,
    Transaction, UpdateSpec, EDGE_OWNER_COLUMN,
};
use crate::error::{ConstraintKind, StoreError};

#[derive(Debug, Clone)]
struct MemTable {
    schema: TableSchema,
    rows: Vec<Row>,
    next_id: i64,
}

#[derive(Debug, Clone, Default)]
struct State {
    tables: HashMap<TableRef, MemTable>,
    /// Tables written since the state was forked for a transaction.
    touched: HashSet<TableRef>,
}

// ============================================================================
// STATE OPERATIONS
// ============================================================================

fn unknown(table: &TableRef) -> StoreError {
    StoreError::UnknownTable(table.to_string())
}

fn equal(a: &Value, b: &Value) -> bool {
    match a.compare(b) {
        Some(o) => o == Ordering::Equal,
        None => a == b,
    }
}

fn get<'a>(row: &'a Row, column: &str) -> &'a Value {
    static NULL: Value = Value::Null;
    row.get(column).unwrap_or(&NULL)
}

fn and3(items: impl IntoIterator<Item = Option<bool>>) -> Option<bool> {
    let mut unknown = false;
    for item in items {
        match item {
            Some(false) => return Some(false),
            None => unknown = true,
            Some(true) => {}
        }
    }
    if unknown {
        None
    } else {
        Some(true)
    }
}

fn or3(items: impl IntoIterator<Item = Option<bool>>) -> Option<bool> {
    let mut unknown = false;
    for item in items {
        match item {
            Some(true) => return Some(true),
            None => unknown = true,
            Some(false) => {}
        }
    }
    if unknown {
        None
    } else {
        Some(false)
    }
}

fn compare_rows(a: &Row, b: &Row, order: &[Order]) -> Ordering {
    for term in order {
        let o = get(a, &term.field)
            .compare(get(b, &term.field))
            .unwrap_or(Ordering::Equal);
        let o = match term.direction {
            Direction::Asc => o,
            Direction::Desc => o.reverse(),
        };
        if o != Ordering::Equal {
            return o;
        }
    }
    Ordering::Equal
}

impl State {
    fn table(&self, table: &TableRef) -> StoreResult<&MemTable> {
        self.tables.get(table).ok_or_else(|| unknown(table))
    }

    fn table_mut(&mut self, table: &TableRef) -> StoreResult<&mut MemTable> {
        let t = self.tables.get_mut(table).ok_or_else(|| unknown(table))?;
        self.touched.insert(table.clone());
        Ok(t)
    }

    fn fork(&self) -> State {
        State {
            tables: self.tables.clone(),
            touched: HashSet::new(),
        }
    }

    /// Apply the tables `other` wrote on top of `self`, leaving the rest alone.
    fn merge(&mut self, other: State) {
        let State { mut tables, touched } = other;
        for name in touched {
            if let Some(t) = tables.remove(&name) {
                self.tables.insert(name, t);
            }
        }
        for (name, t) in tables {
            self.tables.entry(name).or_insert(t);
        }
    }

    fn ensure_table(&mut self, table: &TableRef, schema: &TableSchema) {
        self.tables.entry(table.clone()).or_insert_with(|| MemTable {
            schema: schema.clone(),
            rows: Vec::new(),
            next_id: 1,
        });
    }

    fn eval(&self, pred: &Predicate, row: &Row) -> StoreResult<Option<bool>> {
        let cmp = |col: &str, rhs: &Value, ok: fn(Ordering) -> bool| -> Option<bool> {
            let lhs = get(row, col);
            if lhs.is_null() || rhs.is_null() {
                return None;
            }
            Some(lhs.compare(rhs).map(ok).unwrap_or(false))
        };
        let text = |col: &str, f: &dyn Fn(&str) -> bool| -> Option<bool> {
            match get(row, col) {
                Value::Null => None,
                Value::String(s) => Some(f(s.as_str())),
                _ => Some(false),
            }
        };

        let result = match pred {
            Predicate::Eq(c, v) => {
                let lhs = get(row, c);
                if lhs.is_null() || v.is_null() {
                    None
                } else {
                    Some(equal(lhs, v))
                }
            }
            Predicate::Ne(c, v) => {
                let lhs = get(row, c);
                if lhs.is_null() || v.is_null() {
                    None
                } else {
                    Some(!equal(lhs, v))
                }
            }
            Predicate::Gt(c, v) => cmp(c, v, |o| o == Ordering::Greater),
            Predicate::Gte(c, v) => cmp(c, v, |o| o != Ordering::Less),
            Predicate::Lt(c, v) => cmp(c, v, |o| o == Ordering::Less),
            Predicate::Lte(c, v) => cmp(c, v, |o| o != Ordering::Greater),
            Predicate::In(c, values) => in_list(get(row, c), values),
            Predicate::NotIn(c, values) => in_list(get(row, c), values).map(|b| !b),
            Predicate::IsNull(c) => Some(get(row, c).is_null()),
            Predicate::NotNull(c) => Some(!get(row, c).is_null()),
            Predicate::Contains(c, s) => text(c, &|v: &str| v.contains(s.as_str())),
            Predicate::ContainsFold(c, s) => {
                let needle = s.to_lowercase();
                text(c, &|v: &str| v.to_lowercase().contains(&needle))
            }
            Predicate::HasPrefix(c, s) => text(c, &|v: &str| v.starts_with(s.as_str())),
            Predicate::HasSuffix(c, s) => text(c, &|v: &str| v.ends_with(s.as_str())),
            Predicate::HasElement(c, s) => match get(row, c) {
                Value::Null => None,
                Value::Strings(items) => Some(items.iter().any(|i| i == s)),
                _ => Some(false),
            },
            Predicate::And(items) => and3(
                items
                    .iter()
                    .map(|p| self.eval(p, row))
                    .collect::<StoreResult<Vec<_>>>()?,
            ),
            Predicate::Or(items) => or3(
                items
                    .iter()
                    .map(|p| self.eval(p, row))
                    .collect::<StoreResult<Vec<_>>>()?,
            ),
            Predicate::Not(p) => self.eval(p, row)?.map(|b| !b),
            Predicate::HasEdge { step, filter } => {
                let target = self.table(&step.target)?;
                let matches = |t: &Row| -> StoreResult<bool> {
                    match filter {
                        Some(f) => Ok(self.eval(f, t)? == Some(true)),
                        None => Ok(true),
                    }
                };
                let mut found = false;
                match &step.link {
                    EdgeLink::SourceColumn(col) => {
                        let fk = get(row, col);
                        if !fk.is_null() {
                            for t in &target.rows {
                                if equal(get(t, &step.target_id), fk) && matches(t)? {
                                    found = true;
                                    break;
                                }
                            }
                        }
                    }
                    EdgeLink::TargetColumn(col) => {
                        let id = get(row, ID_COLUMN);
                        for t in &target.rows {
                            if equal(get(t, col), id) && matches(t)? {
                                found = true;
                                break;
                            }
                        }
                    }
                    EdgeLink::Junction {
                        table,
                        owner_column,
                        target_column,
                    } => {
                        let id = get(row, ID_COLUMN);
                        let junction = self.table(table)?;
                        'outer: for j in junction.rows.iter().filter(|j| equal(get(j, owner_column), id)) {
                            let tid = get(j, target_column);
                            for t in &target.rows {
                                if equal(get(t, &step.target_id), tid) && matches(t)? {
                                    found = true;
                                    break 'outer;
                                }
                            }
                        }
                    }
                }
                Some(found)
            }
        };
        Ok(result)
    }

    fn matching(&self, table: &TableRef, pred: Option<&Predicate>) -> StoreResult<Vec<usize>> {
        let t = self.table(table)?;
        let mut out = Vec::new();
        for (i, row) in t.rows.iter().enumerate() {
            let keep = match pred {
                Some(p) => self.eval(p, row)? == Some(true),
                None => true,
            };
            if keep {
                out.push(i);
            }
        }
        Ok(out)
    }

    fn select(&self, spec: &QuerySpec) -> StoreResult<Vec<Row>> {
        let table = self.table(&spec.table)?;

        // (owner, row) candidates
        let mut candidates: Vec<(Option<Value>, &Row)> = Vec::new();
        match &spec.through {
            Some(join) => {
                let junction = self.table(&join.table)?;
                for j in &junction.rows {
                    let owner = get(j, &join.owner_column);
                    if !join.owners.iter().any(|o| equal(o, owner)) {
                        continue;
                    }
                    let tid = get(j, &join.target_column);
                    for row in &table.rows {
                        if equal(get(row, &spec.id_column), tid) {
                            candidates.push((Some(owner.clone()), row));
                        }
                    }
                }
            }
            None => candidates.extend(table.rows.iter().map(|r| (None, r))),
        }

        let mut selected = Vec::new();
        for (owner, row) in candidates {
            let keep = match &spec.predicate {
                Some(p) => self.eval(p, row)? == Some(true),
                None => true,
            };
            if keep {
                selected.push((owner, row));
            }
        }
        selected.sort_by(|a, b| compare_rows(a.1, b.1, &spec.order));

        let mut out: Vec<Row> = Vec::with_capacity(selected.len());
        for (owner, row) in selected {
            let mut projected = match &spec.columns {
                Some(cols) => {
                    let mut r = Row::new();
                    for c in cols {
                        if table.schema.column(c).is_none() {
                            return Err(anyhow!("unknown column {}.{}", spec.table, c).into());
                        }
                        r.insert(c.clone(), get(row, c).clone());
                    }
                    r
                }
                None => row.clone(),
            };
            if let Some(owner) = owner {
                projected.insert(EDGE_OWNER_COLUMN.to_string(), owner);
            }
            if spec.unique && out.contains(&projected) {
                continue;
            }
            out.push(projected);
        }

        let offset = spec.offset.unwrap_or(0);
        let limit = spec.limit.unwrap_or(usize::MAX);
        Ok(out.into_iter().skip(offset).take(limit).collect())
    }

    fn check_row(&self, table: &TableRef, row: &Row, skip: Option<usize>, batch: &[Row]) -> StoreResult<()> {
        let t = self.table(table)?;
        let schema = &t.schema;

        for col in row.keys() {
            if schema.column(col).is_none() {
                return Err(anyhow!("unknown column {}.{}", table, col).into());
            }
        }
        for col in &schema.columns {
            if !col.nullable && get(row, &col.name).is_null() {
                return Err(StoreError::constraint(
                    ConstraintKind::NotNull,
                    format!("{}.{} is null", table, col.name),
                ));
            }
        }

        let others = t
            .rows
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != skip)
            .map(|(_, r)| r)
            .chain(batch.iter());

        let mut keyed: Vec<(&str, Vec<&String>)> = vec![("primary key", schema.primary_key.iter().collect())];
        for u in &schema.unique {
            keyed.push(("unique", vec![u]));
        }
        let others: Vec<&Row> = others.collect();
        for (label, cols) in &keyed {
            if cols.is_empty() || cols.iter().any(|c| get(row, c).is_null()) {
                continue;
            }
            let clash = others
                .iter()
                .any(|o| cols.iter().all(|c| equal(get(o, c), get(row, c))));
            if clash {
                let key: Vec<String> = cols
                    .iter()
                    .map(|c| format!("{}={}", c, get(row, c)))
                    .collect();
                return Err(StoreError::constraint(
                    ConstraintKind::Unique,
                    format!("{} {} on {} already exists", label, key.join(","), table),
                ));
            }
        }

        for fk in &schema.foreign_keys {
            let value = get(row, &fk.column);
            if value.is_null() {
                continue;
            }
            let referenced = self.table(&fk.references)?;
            let mut present = referenced
                .rows
                .iter()
                .any(|r| equal(get(r, &fk.ref_column), value));
            if !present && &fk.references == table {
                present = batch.iter().chain(std::iter::once(row)).any(|r| equal(get(r, &fk.ref_column), value));
            }
            if !present {
                return Err(StoreError::constraint(
                    ConstraintKind::ForeignKey,
                    format!(
                        "{}.{} = {} references missing {}.{}",
                        table, fk.column, value, fk.references, fk.ref_column
                    ),
                ));
            }
        }
        Ok(())
    }

    fn insert(&mut self, spec: &InsertSpec) -> StoreResult<Vec<Row>> {
        let mut batch: Vec<Row> = Vec::with_capacity(spec.rows.len());
        for input in &spec.rows {
            let t = self.table_mut(&spec.table)?;
            let mut row = input.clone();
            if let Some(col) = t.schema.auto_increment.clone() {
                match row.get(&col).and_then(Value::as_i64) {
                    Some(v) => t.next_id = t.next_id.max(v + 1),
                    None => {
                        row.insert(col, Value::Int(t.next_id));
                        t.next_id += 1;
                    }
                }
            }
            for c in &t.schema.columns {
                row.entry(c.name.clone()).or_insert(Value::Null);
            }
            self.check_row(&spec.table, &row, None, &batch)?;
            batch.push(row);
        }
        let t = self.table_mut(&spec.table)?;
        t.rows.extend(batch.iter().cloned());
        Ok(batch)
    }

    fn update(&mut self, spec: &UpdateSpec) -> StoreResult<Vec<Row>> {
        let hits = self.matching(&spec.table, spec.predicate.as_ref())?;
        let mut out = Vec::with_capacity(hits.len());
        for i in hits {
            let t = self.table_mut(&spec.table)?;
            let row = &mut t.rows[i];
            for (col, value) in &spec.set {
                row.insert(col.clone(), value.clone());
            }
            for (col, extra) in &spec.append {
                let mut items = match row.get(col) {
                    Some(Value::Strings(v)) => v.clone(),
                    Some(Value::Null) | None => Vec::new(),
                    Some(other) => {
                        return Err(anyhow!("cannot append to non-list column {} ({})", col, other).into())
                    }
                };
                items.extend(extra.iter().cloned());
                row.insert(col.clone(), Value::Strings(items));
            }
            let row = row.clone();
            self.check_row(&spec.table, &row, Some(i), &[])?;
            out.push(row);
        }
        Ok(out)
    }

    fn delete_indices(&mut self, table: &TableRef, mut doomed: Vec<usize>) -> StoreResult<()> {
        doomed.sort_unstable();
        doomed.dedup();
        let t = self.table_mut(table)?;
        let mut removed = Vec::with_capacity(doomed.len());
        for i in doomed.into_iter().rev() {
            removed.push(t.rows.remove(i));
        }

        let referencing: Vec<(TableRef, super::ForeignKey)> = self
            .tables
            .iter()
            .flat_map(|(name, t)| {
                t.schema
                    .foreign_keys
                    .iter()
                    .filter(|fk| &fk.references == table)
                    .map(move |fk| (name.clone(), fk.clone()))
            })
            .collect();

        for (other, fk) in referencing {
            let gone: Vec<&Value> = removed
                .iter()
                .map(|r| get(r, &fk.ref_column))
                .filter(|v| !v.is_null())
                .collect();
            let hits: Vec<usize> = self
                .table(&other)?
                .rows
                .iter()
                .enumerate()
                .filter(|(_, r)| gone.iter().any(|g| equal(get(r, &fk.column), g)))
                .map(|(i, _)| i)
                .collect();
            if hits.is_empty() {
                continue;
            }
            match fk.on_delete {
                OnDelete::Restrict => {
                    return Err(StoreError::constraint(
                        ConstraintKind::ForeignKey,
                        format!("{}.{} still references {}", other, fk.column, table),
                    ))
                }
                OnDelete::Cascade => self.delete_indices(&other, hits)?,
                OnDelete::SetNull => {
                    let t = self.table_mut(&other)?;
                    let nullable = t.schema.column(&fk.column).map(|c| c.nullable).unwrap_or(true);
                    if !nullable {
                        return Err(StoreError::constraint(
                            ConstraintKind::NotNull,
                            format!("{}.{} cannot be set null", other, fk.column),
                        ));
                    }
                    for i in hits {
                        t.rows[i].insert(fk.column.clone(), Value::Null);
                    }
                }
            }
        }
        Ok(())
    }

    fn delete(&mut self, spec: &DeleteSpec) -> StoreResult<usize> {
        let hits = self.matching(&spec.table, spec.predicate.as_ref())?;
        let n = hits.len();
        self.delete_indices(&spec.table, hits)?;
        Ok(n)
    }

    fn link(&mut self, spec: &LinkSpec) -> StoreResult<()> {
        let existing = &self.table(&spec.table)?.rows;
        let mut rows: Vec<Row> = Vec::new();
        for (owner, target) in &spec.pairs {
            let present = existing.iter().chain(rows.iter()).any(|r| {
                equal(get(r, &spec.owner_column), owner) && equal(get(r, &spec.target_column), target)
            });
            if present {
                continue;
            }
            let mut row = Row::new();
            row.insert(spec.owner_column.clone(), owner.clone());
            row.insert(spec.target_column.clone(), target.clone());
            rows.push(row);
        }
        self.insert(&InsertSpec {
            table: spec.table.clone(),
            id_column: spec.owner_column.clone(),
            rows,
        })?;
        Ok(())
    }

    fn unlink(&mut self, spec: &LinkSpec) -> StoreResult<usize> {
        let hits: Vec<usize> = self
            .table(&spec.table)?
            .rows
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                spec.pairs.iter().any(|(o, t)| {
                    equal(get(r, &spec.owner_column), o) && equal(get(r, &spec.target_column), t)
                })
            })
            .map(|(i, _)| i)
            .collect();
        let n = hits.len();
        self.delete_indices(&spec.table, hits)?;
        Ok(n)
    }
}

fn in_list(value: &Value, list: &[Value]) -> Option<bool> {
    if value.is_null() {
        return None;
    }
    if list.iter().any(|v| !v.is_null() && equal(value, v)) {
        return Some(true);
    }
    if list.iter().any(Value::is_null) {
        None
    } else {
        Some(false)
    }
}

/// Run `f` on a copy of `state`, keeping the copy only on success.
fn atomically<R>(state: &mut State, f: impl FnOnce(&mut State) -> StoreResult<R>) -> StoreResult<R> {
    let mut next = state.clone();
    let out = f(&mut next)?;
    *state = next;
    Ok(out)
}

// ============================================================================
// EXECUTOR
// ============================================================================

/// Shared in-memory store. Cloning yields a handle to the same data.
#[derive(Clone, Default)]
pub struct MemoryExecutor {
    inner: Arc<RwLock<State>>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw rows of a table, bypassing every engine layer.
    pub fn rows(&self, table: &TableRef) -> StoreResult<Vec<Row>> {
        let state = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(state.table(table)?.rows.clone())
    }

    pub fn has_table(&self, table: &TableRef) -> bool {
        self.inner
            .read()
            .map(|s| s.tables.contains_key(table))
            .unwrap_or(false)
    }

    fn read<R>(&self, f: impl FnOnce(&State) -> StoreResult<R>) -> StoreResult<R> {
        let state = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        f(&state)
    }

    fn write<R>(&self, f: impl FnOnce(&mut State) -> StoreResult<R>) -> StoreResult<R> {
        let mut state = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let out = atomically(&mut state, f)?;
        state.touched.clear();
        Ok(out)
    }
}

#[async_trait]
impl Executor for MemoryExecutor {
    async fn ensure_table(&self, table: &TableRef, schema: &TableSchema) -> StoreResult<()> {
        self.write(|s| {
            s.ensure_table(table, schema);
            Ok(())
        })
    }

    async fn query(&self, spec: &QuerySpec) -> StoreResult<Vec<Row>> {
        self.read(|s| s.select(spec))
    }

    async fn count(&self, spec: &QuerySpec) -> StoreResult<usize> {
        self.read(|s| s.select(spec).map(|rows| rows.len()))
    }

    async fn insert(&self, spec: &InsertSpec) -> StoreResult<Vec<Row>> {
        self.write(|s| s.insert(spec))
    }

    async fn update(&self, spec: &UpdateSpec) -> StoreResult<Vec<Row>> {
        self.write(|s| s.update(spec))
    }

    async fn delete(&self, spec: &DeleteSpec) -> StoreResult<usize> {
        self.write(|s| s.delete(spec))
    }

    async fn link(&self, spec: &LinkSpec) -> StoreResult<()> {
        self.write(|s| s.link(spec))
    }

    async fn unlink(&self, spec: &LinkSpec) -> StoreResult<usize> {
        self.write(|s| s.unlink(spec))
    }

    async fn begin(&self) -> StoreResult<Arc<dyn Transaction>> {
        let snapshot = self.read(|s| Ok(s.fork()))?;
        Ok(Arc::new(MemoryTx {
            parent: self.inner.clone(),
            working: RwLock::new(Some(snapshot)),
        }))
    }
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

struct MemoryTx {
    parent: Arc<RwLock<State>>,
    working: RwLock<Option<State>>,
}

impl MemoryTx {
    fn read<R>(&self, f: impl FnOnce(&State) -> StoreResult<R>) -> StoreResult<R> {
        let guard = self.working.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let state = guard.as_ref().ok_or(StoreError::TxDone)?;
        f(state)
    }

    fn write<R>(&self, f: impl FnOnce(&mut State) -> StoreResult<R>) -> StoreResult<R> {
        let mut guard = self.working.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let state = guard.as_mut().ok_or(StoreError::TxDone)?;
        atomically(state, f)
    }

    fn finish(&self) -> StoreResult<State> {
        let mut guard = self.working.write().map_err(|e| anyhow!("Lock: {}", e))?;
        guard.take().ok_or(StoreError::TxDone)
    }
}

#[async_trait]
impl Executor for MemoryTx {
    async fn ensure_table(&self, table: &TableRef, schema: &TableSchema) -> StoreResult<()> {
        self.write(|s| {
            s.ensure_table(table, schema);
            Ok(())
        })
    }

    async fn query(&self, spec: &QuerySpec) -> StoreResult<Vec<Row>> {
        self.read(|s| s.select(spec))
    }

    async fn count(&self, spec: &QuerySpec) -> StoreResult<usize> {
        self.read(|s| s.select(spec).map(|rows| rows.len()))
    }

    async fn insert(&self, spec: &InsertSpec) -> StoreResult<Vec<Row>> {
        self.write(|s| s.insert(spec))
    }

    async fn update(&self, spec: &UpdateSpec) -> StoreResult<Vec<Row>> {
        self.write(|s| s.update(spec))
    }

    async fn delete(&self, spec: &DeleteSpec) -> StoreResult<usize> {
        self.write(|s| s.delete(spec))
    }

    async fn link(&self, spec: &LinkSpec) -> StoreResult<()> {
        self.write(|s| s.link(spec))
    }

    async fn unlink(&self, spec: &LinkSpec) -> StoreResult<usize> {
        self.write(|s| s.unlink(spec))
    }

    async fn begin(&self) -> StoreResult<Arc<dyn Transaction>> {
        Err(anyhow!("nested transactions are not supported").into())
    }
}

#[async_trait]
impl Transaction for MemoryTx {
    async fn commit(&self) -> StoreResult<()> {
        let state = self.finish()?;
        let mut parent = self.parent.write().map_err(|e| anyhow!("Lock: {}", e))?;
        parent.merge(state);
        Ok(())
    }

    async fn rollback(&self) -> StoreResult<()> {
        self.finish().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ColumnDef, ForeignKey, JunctionJoin};
    use entgraph_types::FieldType;

    fn col(name: &str, ty: FieldType, nullable: bool) -> ColumnDef {
        ColumnDef {
            name: name.into(),
            ty,
            nullable,
        }
    }

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    async fn fixture() -> MemoryExecutor {
        let exec = MemoryExecutor::new();
        exec.ensure_table(
            &TableRef::new("orgs"),
            &TableSchema {
                columns: vec![col("id", FieldType::Int, false), col("name", FieldType::String, true)],
                primary_key: vec!["id".into()],
                auto_increment: Some("id".into()),
                unique: vec!["name".into()],
                foreign_keys: vec![],
            },
        )
        .await
        .unwrap();
        exec.ensure_table(
            &TableRef::new("notes"),
            &TableSchema {
                columns: vec![
                    col("id", FieldType::String, false),
                    col("title", FieldType::String, false),
                    col("org_id", FieldType::Int, true),
                ],
                primary_key: vec!["id".into()],
                auto_increment: None,
                unique: vec![],
                foreign_keys: vec![ForeignKey {
                    column: "org_id".into(),
                    references: TableRef::new("orgs"),
                    ref_column: "id".into(),
                    on_delete: OnDelete::Cascade,
                }],
            },
        )
        .await
        .unwrap();
        exec
    }

    #[tokio::test]
    async fn insert_generates_ids_and_enforces_unique() {
        let exec = fixture().await;
        let rows = exec
            .insert(&InsertSpec {
                table: TableRef::new("orgs"),
                id_column: "id".into(),
                rows: vec![row(&[("name", Value::from("a"))]), row(&[("name", Value::from("b"))])],
            })
            .await
            .unwrap();
        assert_eq!(rows[0]["id"], Value::Int(1));
        assert_eq!(rows[1]["id"], Value::Int(2));

        let err = exec
            .insert(&InsertSpec {
                table: TableRef::new("orgs"),
                id_column: "id".into(),
                rows: vec![row(&[("name", Value::from("c"))]), row(&[("name", Value::from("a"))])],
            })
            .await
            .unwrap_err();
        assert!(err.is_constraint());
        // the failed batch left nothing behind
        assert_eq!(exec.rows(&TableRef::new("orgs")).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn commit_merges_only_the_tables_the_tx_wrote() {
        let exec = fixture().await;
        let tx = exec.begin().await.unwrap();

        exec.insert(&InsertSpec {
            table: TableRef::new("orgs"),
            id_column: "id".into(),
            rows: vec![row(&[("name", Value::from("pool"))])],
        })
        .await
        .unwrap();
        tx.insert(&InsertSpec {
            table: TableRef::new("notes"),
            id_column: "id".into(),
            rows: vec![row(&[("id", Value::from("n1")), ("title", Value::from("in tx"))])],
        })
        .await
        .unwrap();
        assert!(exec.rows(&TableRef::new("notes")).unwrap().is_empty());

        tx.commit().await.unwrap();
        assert_eq!(exec.rows(&TableRef::new("orgs")).unwrap().len(), 1);
        assert_eq!(exec.rows(&TableRef::new("notes")).unwrap().len(), 1);
        assert!(matches!(tx.rollback().await, Err(StoreError::TxDone)));
    }

    #[tokio::test]
    async fn foreign_keys_are_checked_and_cascade() {
        let exec = fixture().await;
        let bad = exec
            .insert(&InsertSpec {
                table: TableRef::new("notes"),
                id_column: "id".into(),
                rows: vec![row(&[
                    ("id", Value::from("n1")),
                    ("title", Value::from("t")),
                    ("org_id", Value::Int(9)),
                ])],
            })
            .await
            .unwrap_err();
        assert!(matches!(
            bad,
            StoreError::Constraint {
                kind: ConstraintKind::ForeignKey,
                ..
            }
        ));

        exec.insert(&InsertSpec {
            table: TableRef::new("orgs"),
            id_column: "id".into(),
            rows: vec![row(&[("name", Value::from("a"))])],
        })
        .await
        .unwrap();
        exec.insert(&InsertSpec {
            table: TableRef::new("notes"),
            id_column: "id".into(),
            rows: vec![row(&[
                ("id", Value::from("n1")),
                ("title", Value::from("t")),
                ("org_id", Value::Int(1)),
            ])],
        })
        .await
        .unwrap();
        let n = exec
            .delete(&DeleteSpec {
                table: TableRef::new("orgs"),
                predicate: None,
            })
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert!(exec.rows(&TableRef::new("notes")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn null_comparisons_are_unknown() {
        let exec = fixture().await;
        exec.insert(&InsertSpec {
            table: TableRef::new("orgs"),
            id_column: "id".into(),
            rows: vec![row(&[("name", Value::from("a"))]), row(&[])],
        })
        .await
        .unwrap();
        let mut spec = QuerySpec::new(TableRef::new("orgs"), "id");
        spec.predicate = Some(Predicate::ne("name", "a"));
        assert_eq!(exec.count(&spec).await.unwrap(), 0);
        spec.predicate = Some(Predicate::not(Predicate::eq("name", "a")));
        assert_eq!(exec.count(&spec).await.unwrap(), 0);
        spec.predicate = Some(Predicate::is_null("name"));
        assert_eq!(exec.count(&spec).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn junction_join_projects_owner() {
        let exec = fixture().await;
        exec.ensure_table(
            &TableRef::new("org_notes"),
            &TableSchema {
                columns: vec![col("org_id", FieldType::Int, false), col("note_id", FieldType::String, false)],
                primary_key: vec!["org_id".into(), "note_id".into()],
                auto_increment: None,
                unique: vec![],
                foreign_keys: vec![],
            },
        )
        .await
        .unwrap();
        exec.insert(&InsertSpec {
            table: TableRef::new("notes"),
            id_column: "id".into(),
            rows: vec![row(&[("id", Value::from("n1")), ("title", Value::from("t"))])],
        })
        .await
        .unwrap();
        let link = LinkSpec {
            table: TableRef::new("org_notes"),
            owner_column: "org_id".into(),
            target_column: "note_id".into(),
            pairs: vec![(Value::Int(1), Value::from("n1")), (Value::Int(2), Value::from("n1"))],
        };
        exec.link(&link).await.unwrap();
        // linking again is a no-op
        exec.link(&link).await.unwrap();

        let mut spec = QuerySpec::new(TableRef::new("notes"), "id");
        spec.through = Some(JunctionJoin {
            table: TableRef::new("org_notes"),
            owner_column: "org_id".into(),
            target_column: "note_id".into(),
            owners: vec![Value::Int(1), Value::Int(2)],
        });
        let rows = exec.query(&spec).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][EDGE_OWNER_COLUMN], Value::Int(1));
        assert_eq!(rows[1][EDGE_OWNER_COLUMN], Value::Int(2));
    }

    #[tokio::test]
    async fn transaction_commit_and_rollback() {
        let exec = fixture().await;
        let insert = InsertSpec {
            table: TableRef::new("orgs"),
            id_column: "id".into(),
            rows: vec![row(&[("name", Value::from("a"))])],
        };

        let tx = exec.begin().await.unwrap();
        tx.insert(&insert).await.unwrap();
        assert!(exec.rows(&TableRef::new("orgs")).unwrap().is_empty());
        tx.rollback().await.unwrap();
        assert!(matches!(tx.insert(&insert).await, Err(StoreError::TxDone)));

        let tx = exec.begin().await.unwrap();
        tx.insert(&insert).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(exec.rows(&TableRef::new("orgs")).unwrap().len(), 1);
        assert!(matches!(tx.commit().await, Err(StoreError::TxDone)));
    }
}
