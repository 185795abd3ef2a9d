//! Edge definitions and the eager-load resolver.
//!
//! Each load runs one fetch per edge against the target entity's own query
//! pipeline (interceptors and policy included) and assigns the results back to
//! the parents by key.

use std::collections::{HashMap, HashSet};

use entgraph_types::{EntityId, Predicate, Value, ID_COLUMN};

use crate::context::RequestContext;
use crate::descriptor::EntityDescriptor;
use crate::entity::Entity;
use crate::error::{EntError, Result};
use crate::executor::EDGE_OWNER_COLUMN;
use crate::query::{EdgeLoad, QueryOp, Through};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    O2O,
    O2M,
    M2O,
    M2M,
}

/// Physical representation of an edge, fixed per definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeStorage {
    /// This entity's column holds the target id.
    SourceColumn(String),
    /// The target's column holds this entity's id.
    TargetColumn(String),
    Junction {
        table: String,
        /// Column holding this entity's id.
        owner_column: String,
        /// Column holding the target's id.
        target_column: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeDescriptor {
    pub name: String,
    /// Target entity name.
    pub target: String,
    pub relation: Relation,
    pub storage: EdgeStorage,
    /// Set on the back-reference side: names the edge on the target that
    /// owns the foreign key or junction.
    pub inverse_of: Option<String>,
}

impl EdgeDescriptor {
    fn new(name: impl Into<String>, target: impl Into<String>, relation: Relation, storage: EdgeStorage) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            relation,
            storage,
            inverse_of: None,
        }
    }

    /// `column` on this entity references the target.
    pub fn many_to_one(name: impl Into<String>, target: impl Into<String>, column: impl Into<String>) -> Self {
        Self::new(name, target, Relation::M2O, EdgeStorage::SourceColumn(column.into()))
    }

    /// `target_column` on the target references this entity.
    pub fn one_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        target_column: impl Into<String>,
    ) -> Self {
        Self::new(name, target, Relation::O2M, EdgeStorage::TargetColumn(target_column.into()))
    }

    /// To-one edge whose foreign key lives on this entity.
    pub fn one_to_one(name: impl Into<String>, target: impl Into<String>, column: impl Into<String>) -> Self {
        Self::new(name, target, Relation::O2O, EdgeStorage::SourceColumn(column.into()))
    }

    /// To-one edge whose foreign key lives on the target.
    pub fn one_to_one_ref(
        name: impl Into<String>,
        target: impl Into<String>,
        target_column: impl Into<String>,
    ) -> Self {
        Self::new(name, target, Relation::O2O, EdgeStorage::TargetColumn(target_column.into()))
    }

    pub fn many_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        junction: impl Into<String>,
        owner_column: impl Into<String>,
        target_column: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            target,
            Relation::M2M,
            EdgeStorage::Junction {
                table: junction.into(),
                owner_column: owner_column.into(),
                target_column: target_column.into(),
            },
        )
    }

    /// Mark this edge as the back-reference of `edge` on the target.
    pub fn inverse(mut self, edge: impl Into<String>) -> Self {
        self.inverse_of = Some(edge.into());
        self
    }

    pub fn is_inverse(&self) -> bool {
        self.inverse_of.is_some()
    }

    /// At most one target per source.
    pub fn is_to_one(&self) -> bool {
        matches!(self.relation, Relation::O2O | Relation::M2O)
    }

    /// True when `other` (declared on the target) describes the same link
    /// seen from the other end.
    pub fn mirrors(&self, other: &EdgeDescriptor) -> bool {
        match (&self.storage, &other.storage) {
            (EdgeStorage::SourceColumn(a), EdgeStorage::TargetColumn(b))
            | (EdgeStorage::TargetColumn(a), EdgeStorage::SourceColumn(b)) => a == b,
            (
                EdgeStorage::Junction {
                    table: t1,
                    owner_column: o1,
                    target_column: c1,
                },
                EdgeStorage::Junction {
                    table: t2,
                    owner_column: o2,
                    target_column: c2,
                },
            ) => t1 == t2 && o1 == c2 && c1 == o2,
            _ => false,
        }
    }
}

// ============================================================================
// RESOLVER
// ============================================================================

fn consistency(edge: &str, message: String) -> EntError {
    EntError::Consistency {
        edge: edge.to_string(),
        message,
    }
}

fn key_of(edge: &str, value: &Value) -> Result<EntityId> {
    EntityId::try_from(value).map_err(|e| consistency(edge, e.to_string()))
}

/// Populate one edge (or aliased load) on every parent.
pub(crate) async fn resolve(
    ctx: &RequestContext,
    desc: &EntityDescriptor,
    parents: &mut [Entity],
    load: &EdgeLoad,
) -> Result<()> {
    ctx.check("edge")?;
    let edge = desc
        .edge(&load.edge)
        .ok_or_else(|| EntError::config(format!("{} has no edge '{}'", desc.name, load.edge)))?;
    if parents.is_empty() {
        return Ok(());
    }
    let alias = load.alias.as_deref();
    tracing::debug!(entity = %desc.name, edge = %edge.name, parents = parents.len(), "loading edge");

    match &edge.storage {
        EdgeStorage::SourceColumn(col) => {
            let mut wanted: HashSet<EntityId> = HashSet::new();
            let mut keys: Vec<Value> = Vec::new();
            for p in parents.iter() {
                if let Some(v) = p.get(col).filter(|v| !v.is_null()) {
                    if wanted.insert(key_of(&edge.name, v)?) {
                        keys.push(v.clone());
                    }
                }
            }

            let mut by_id: HashMap<EntityId, Entity> = HashMap::new();
            if !keys.is_empty() {
                let targets = load
                    .query
                    .clone()
                    .filter(Predicate::In(ID_COLUMN.to_string(), keys))
                    .fetch(ctx, QueryOp::All)
                    .await?;
                for t in targets {
                    if !wanted.contains(t.id()) {
                        return Err(consistency(
                            &edge.name,
                            format!("fetched {} {} that no parent references", edge.target, t.id()),
                        ));
                    }
                    by_id.insert(t.id().clone(), t);
                }
            }

            for p in parents.iter_mut() {
                let target = match p.get(col).filter(|v| !v.is_null()) {
                    Some(v) => by_id.get(&key_of(&edge.name, v)?).cloned(),
                    None => None,
                };
                p.set_edge(&edge.name, alias, target.into_iter().collect());
            }
        }

        EdgeStorage::TargetColumn(col) => {
            let owners: HashSet<EntityId> = parents.iter().map(|p| p.id().clone()).collect();
            let ids: Vec<Value> = parents.iter().map(|p| p.id().to_value()).collect();
            let targets = load
                .query
                .clone()
                .ensure_selected(col)
                .filter(Predicate::In(col.clone(), ids))
                .fetch(ctx, QueryOp::All)
                .await?;

            let mut grouped: HashMap<EntityId, Vec<Entity>> = HashMap::new();
            for t in targets {
                let owner = match t.get(col).filter(|v| !v.is_null()) {
                    Some(v) => key_of(&edge.name, v)?,
                    None => {
                        return Err(consistency(
                            &edge.name,
                            format!("{} {} has no {}", edge.target, t.id(), col),
                        ))
                    }
                };
                if !owners.contains(&owner) {
                    return Err(consistency(
                        &edge.name,
                        format!("{} {} points at unknown parent {}", edge.target, t.id(), owner),
                    ));
                }
                grouped.entry(owner).or_default().push(t);
            }
            for p in parents.iter_mut() {
                let targets = grouped.remove(p.id()).unwrap_or_default();
                p.set_edge(&edge.name, alias, targets);
            }
        }

        EdgeStorage::Junction {
            table,
            owner_column,
            target_column,
        } => {
            let owners: HashSet<EntityId> = parents.iter().map(|p| p.id().clone()).collect();
            let through = Through {
                table: table.clone(),
                owner_column: owner_column.clone(),
                target_column: target_column.clone(),
                owners: parents.iter().map(|p| p.id().to_value()).collect(),
            };
            let targets = load
                .query
                .clone()
                .through(through)
                .fetch(ctx, QueryOp::All)
                .await?;

            let mut seen: HashSet<(EntityId, EntityId)> = HashSet::new();
            let mut grouped: HashMap<EntityId, Vec<Entity>> = HashMap::new();
            for mut t in targets {
                let owner = match t.take_extra(EDGE_OWNER_COLUMN) {
                    Some(v) => key_of(&edge.name, &v)?,
                    None => {
                        return Err(consistency(
                            &edge.name,
                            format!("junction row for {} {} carries no owner", edge.target, t.id()),
                        ))
                    }
                };
                if !owners.contains(&owner) {
                    return Err(consistency(
                        &edge.name,
                        format!("junction {} links unknown owner {}", table, owner),
                    ));
                }
                if seen.insert((owner.clone(), t.id().clone())) {
                    grouped.entry(owner).or_default().push(t);
                }
            }
            for p in parents.iter_mut() {
                let targets = grouped.remove(p.id()).unwrap_or_default();
                p.set_edge(&edge.name, alias, targets);
            }
        }
    }
    Ok(())
}
