//! Engine-side predicate handling: edge steps built from descriptors, column
//! checks against an entity, and namespace routing of traversal targets.

use entgraph_types::{EdgeLink, EdgeStep, Order, Predicate, TableRef, ID_COLUMN};

use crate::descriptor::EntityDescriptor;
use crate::edge::{EdgeDescriptor, EdgeStorage};
use crate::error::{EntError, Result};
use crate::schema::SchemaSnapshot;

/// Unrouted traversal step for `edge`; `target_table` is the target's table.
pub(crate) fn edge_step(edge: &EdgeDescriptor, target_table: &str) -> EdgeStep {
    let link = match &edge.storage {
        EdgeStorage::SourceColumn(col) => EdgeLink::SourceColumn(col.clone()),
        EdgeStorage::TargetColumn(col) => EdgeLink::TargetColumn(col.clone()),
        EdgeStorage::Junction {
            table,
            owner_column,
            target_column,
        } => EdgeLink::Junction {
            table: TableRef::new(table.clone()),
            owner_column: owner_column.clone(),
            target_column: target_column.clone(),
        },
    };
    EdgeStep {
        edge: edge.name.clone(),
        target: TableRef::new(target_table),
        target_id: ID_COLUMN.to_string(),
        link,
    }
}

/// Address every traversal target through the request's snapshot.
pub(crate) fn route(pred: Predicate, snap: &SchemaSnapshot) -> Predicate {
    match pred {
        Predicate::And(items) => Predicate::And(items.into_iter().map(|p| route(p, snap)).collect()),
        Predicate::Or(items) => Predicate::Or(items.into_iter().map(|p| route(p, snap)).collect()),
        Predicate::Not(p) => Predicate::Not(Box::new(route(*p, snap))),
        Predicate::HasEdge { mut step, filter } => {
            step.target = snap.table(&step.target.name);
            if let EdgeLink::Junction { table, .. } = &mut step.link {
                *table = snap.table(&table.name);
            }
            Predicate::HasEdge {
                step,
                filter: filter.map(|f| Box::new(route(*f, snap))),
            }
        }
        other => other,
    }
}

/// Reject references to columns the entity does not have.
pub(crate) fn check_columns<'a>(
    desc: &EntityDescriptor,
    predicates: impl IntoIterator<Item = &'a Predicate>,
    order: &[Order],
    fields: Option<&[String]>,
) -> Result<()> {
    let unknown = |field: &str, what: &str| {
        EntError::validation(&desc.name, field, format!("unknown column in {}", what))
    };
    for p in predicates {
        for col in p.columns() {
            if !desc.has_column(col) {
                return Err(unknown(col, "filter"));
            }
        }
    }
    for o in order {
        if !desc.has_column(&o.field) {
            return Err(unknown(&o.field, "order"));
        }
    }
    for f in fields.unwrap_or(&[]) {
        if !desc.has_column(f) {
            return Err(unknown(f, "select"));
        }
    }
    Ok(())
}
