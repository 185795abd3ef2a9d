//! Materialized entities.

use std::collections::HashMap;
use std::fmt;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use entgraph_types::{EntityId, Row, Value, ID_COLUMN};

use crate::client::Client;
use crate::descriptor::{
    EntityDescriptor, CREATED_AT, CREATED_BY, DELETED_AT, DELETED_BY, TAGS, UPDATED_AT, UPDATED_BY,
};
use crate::error::{EntError, Result, StoreError};
use crate::mutation::UpdateOne;

/// One row of an entity type plus whatever edges were eager-loaded with it.
///
/// An entity remembers the client that produced it. Inside a transaction that
/// is the transaction's client; see [`Entity::unwrap`].
#[derive(Clone)]
pub struct Entity {
    entity: String,
    id: EntityId,
    fields: Row,
    extra: Row,
    edges: HashMap<String, Vec<Entity>>,
    named: HashMap<String, Vec<Entity>>,
    client: Option<Client>,
}

impl Entity {
    pub(crate) fn from_row(desc: &EntityDescriptor, mut row: Row, client: Option<Client>) -> Result<Self> {
        let raw_id = row.remove(ID_COLUMN).unwrap_or_default();
        let id = EntityId::try_from(&raw_id).map_err(|e| {
            EntError::Store(StoreError::Backend(anyhow!("{} row has no usable id: {}", desc.name, e)))
        })?;

        let mut fields = Row::new();
        let mut extra = Row::new();
        for (k, v) in row {
            if desc.field(&k).is_some() {
                fields.insert(k, v);
            } else {
                extra.insert(k, v);
            }
        }

        Ok(Self {
            entity: desc.name.clone(),
            id,
            fields,
            extra,
            edges: HashMap::new(),
            named: HashMap::new(),
            client,
        })
    }

    /// Entity type name.
    pub fn entity_name(&self) -> &str {
        &self.entity
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// Declared field value; `None` when the field was not selected.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(Value::as_bool)
    }

    pub fn get_time(&self, field: &str) -> Option<DateTime<Utc>> {
        self.get(field).and_then(Value::as_time)
    }

    pub fn get_strings(&self, field: &str) -> Option<&[String]> {
        self.get(field).and_then(Value::as_strings)
    }

    /// Every declared field that was materialized.
    pub fn fields(&self) -> &Row {
        &self.fields
    }

    // ── Audit accessors ──

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.get_time(CREATED_AT)
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.get_time(UPDATED_AT)
    }

    pub fn created_by(&self) -> Option<&str> {
        self.get_str(CREATED_BY)
    }

    pub fn updated_by(&self) -> Option<&str> {
        self.get_str(UPDATED_BY)
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.get_time(DELETED_AT)
    }

    pub fn deleted_by(&self) -> Option<&str> {
        self.get_str(DELETED_BY)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at().is_some()
    }

    pub fn tags(&self) -> &[String] {
        self.get_strings(TAGS).unwrap_or(&[])
    }

    /// A value the store returned that is not a declared field, such as a
    /// derived or backend-computed column. Falls back to declared fields.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.extra.get(name).or_else(|| self.fields.get(name))
    }

    pub(crate) fn take_extra(&mut self, name: &str) -> Option<Value> {
        self.extra.remove(name)
    }

    // ── Edges ──

    /// Eager-loaded targets of `edge`.
    pub fn edge(&self, edge: &str) -> Result<&[Entity]> {
        self.edges
            .get(edge)
            .map(Vec::as_slice)
            .ok_or_else(|| EntError::EdgeNotLoaded {
                entity: self.entity.clone(),
                edge: edge.to_string(),
            })
    }

    /// The single target of a to-one edge, `None` when unset or hidden.
    pub fn edge_one(&self, edge: &str) -> Result<Option<&Entity>> {
        self.edge(edge).map(|v| v.first())
    }

    /// Targets of an aliased load made with `with_named_edge`.
    pub fn named_edge(&self, alias: &str) -> Result<&[Entity]> {
        self.named
            .get(alias)
            .map(Vec::as_slice)
            .ok_or_else(|| EntError::EdgeNotLoaded {
                entity: self.entity.clone(),
                edge: alias.to_string(),
            })
    }

    pub(crate) fn set_edge(&mut self, edge: &str, alias: Option<&str>, targets: Vec<Entity>) {
        match alias {
            Some(a) => self.named.insert(a.to_string(), targets),
            None => self.edges.insert(edge.to_string(), targets),
        };
    }

    // ── Client binding ──

    /// Start an update of this entity through the client that produced it.
    pub fn update(&self) -> Result<UpdateOne> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| EntError::config(format!("{} {} is not bound to a client", self.entity, self.id)))?;
        client.check_open()?;
        Ok(client.entity(&self.entity)?.update_one_id(self.id.clone()))
    }

    /// Rebind this entity (and its loaded edges) from a finished transaction
    /// to the underlying pool.
    pub fn unwrap(mut self) -> Entity {
        self.client = self.client.map(|c| c.unwrapped());
        for targets in self.edges.values_mut().chain(self.named.values_mut()) {
            let taken = std::mem::take(targets);
            *targets = taken.into_iter().map(Entity::unwrap).collect();
        }
        self
    }

    /// JSON rendering with the id, every field and loaded edges.
    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert(ID_COLUMN.to_string(), self.id.to_value().to_json());
        for (k, v) in &self.fields {
            obj.insert(k.clone(), v.to_json());
        }
        if !self.edges.is_empty() {
            let edges: serde_json::Map<String, serde_json::Value> = self
                .edges
                .iter()
                .map(|(k, v)| (k.clone(), v.iter().map(Entity::to_json).collect()))
                .collect();
            obj.insert("edges".to_string(), serde_json::Value::Object(edges));
        }
        serde_json::Value::Object(obj)
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity && self.id == other.id && self.fields == other.fields
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut edges: Vec<&String> = self.edges.keys().collect();
        edges.sort();
        f.debug_struct("Entity")
            .field("entity", &self.entity)
            .field("id", &self.id)
            .field("fields", &self.fields)
            .field("edges", &edges)
            .field("in_tx", &self.client.as_ref().is_some_and(Client::in_tx))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Field;

    fn desc() -> EntityDescriptor {
        EntityDescriptor::builder("note")
            .audited()
            .field(Field::string("title"))
            .build()
            .unwrap()
    }

    fn row() -> Row {
        let mut row = Row::new();
        row.insert("id".into(), Value::from("n1"));
        row.insert("title".into(), Value::from("hello"));
        row.insert("title_len".into(), Value::Int(5));
        row
    }

    #[test]
    fn undeclared_columns_surface_through_value() {
        let e = Entity::from_row(&desc(), row(), None).unwrap();
        assert_eq!(e.id(), &EntityId::from("n1"));
        assert_eq!(e.get_str("title"), Some("hello"));
        assert!(e.get("title_len").is_none());
        assert_eq!(e.value("title_len"), Some(&Value::Int(5)));
        assert_eq!(e.value("title"), Some(&Value::from("hello")));
        assert!(e.tags().is_empty());
    }

    #[test]
    fn unloaded_edges_are_errors() {
        let mut e = Entity::from_row(&desc(), row(), None).unwrap();
        assert!(e.edge("files").unwrap_err().is_edge_not_loaded());
        e.set_edge("files", None, vec![]);
        assert!(e.edge("files").unwrap().is_empty());
        assert!(e.named_edge("recent").unwrap_err().is_edge_not_loaded());
        assert_eq!(e.edge_one("files").unwrap(), None);
    }

    #[test]
    fn rows_without_ids_are_rejected() {
        let mut r = row();
        r.remove("id");
        assert!(Entity::from_row(&desc(), r, None).is_err());
    }

    #[test]
    fn unbound_entities_cannot_update() {
        let e = Entity::from_row(&desc(), row(), None).unwrap();
        assert!(e.update().err().unwrap().is_configuration());
    }

    #[test]
    fn json_includes_id_and_fields() {
        let e = Entity::from_row(&desc(), row(), None).unwrap();
        let json = e.to_json();
        assert_eq!(json["id"], "n1");
        assert_eq!(json["title"], "hello");
    }
}
