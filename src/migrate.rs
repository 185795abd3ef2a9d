//! Table definitions derived from descriptors.

use std::collections::{HashMap, HashSet};

use entgraph_types::{FieldType, IdType, TableRef, ID_COLUMN};

use crate::client::{Client, EngineInner};
use crate::context::RequestContext;
use crate::descriptor::EntityDescriptor;
use crate::edge::EdgeStorage;
use crate::error::{EntError, Result};
use crate::executor::{ColumnDef, ForeignKey, OnDelete, TableSchema};
use crate::history::{ENTITY_ID, HISTORY_TIME, OPERATION, REF};
use crate::schema::{self, SchemaSnapshot};

fn column(name: &str, ty: FieldType, nullable: bool) -> ColumnDef {
    ColumnDef {
        name: name.to_string(),
        ty,
        nullable,
    }
}

fn entity_schema(desc: &EntityDescriptor) -> TableSchema {
    let mut columns = vec![column(ID_COLUMN, desc.id_field_type(), false)];
    columns.extend(desc.fields.iter().map(|f| column(&f.name, f.ty, !f.required)));
    TableSchema {
        columns,
        primary_key: vec![ID_COLUMN.to_string()],
        auto_increment: (desc.generated_id && desc.id_type == IdType::Int).then(|| ID_COLUMN.to_string()),
        unique: desc.fields.iter().filter(|f| f.unique).map(|f| f.name.clone()).collect(),
        foreign_keys: Vec::new(),
    }
}

fn history_schema(desc: &EntityDescriptor) -> TableSchema {
    let mut columns = vec![
        column(ID_COLUMN, FieldType::String, false),
        column(ENTITY_ID, desc.id_field_type(), false),
        column(HISTORY_TIME, FieldType::Time, false),
        column(REF, FieldType::String, true),
        column(OPERATION, FieldType::String, false),
    ];
    columns.extend(desc.fields.iter().map(|f| column(&f.name, f.ty, true)));
    TableSchema {
        columns,
        primary_key: vec![ID_COLUMN.to_string()],
        ..TableSchema::default()
    }
}

/// Every table the engine needs, referenced tables before referencing ones.
pub(crate) fn table_schemas(inner: &EngineInner, snap: &SchemaSnapshot) -> Result<Vec<(TableRef, TableSchema)>> {
    let mut schemas: HashMap<&str, TableSchema> = HashMap::new();
    let mut deps: HashMap<&str, HashSet<&str>> = HashMap::new();
    for name in &inner.order {
        let desc = inner.descriptor(name)?;
        schemas.insert(name.as_str(), entity_schema(&desc));
    }

    let mut junctions: Vec<(TableRef, TableSchema)> = Vec::new();
    let mut seen_junctions = HashSet::new();
    for name in &inner.order {
        let desc = inner.descriptor(name)?;
        for edge in &desc.edges {
            let target = inner.descriptor(&edge.target)?;
            match &edge.storage {
                EdgeStorage::SourceColumn(col) => {
                    add_foreign_key(&mut schemas, &mut deps, &inner.order, &desc, col, &target, snap);
                }
                EdgeStorage::TargetColumn(col) => {
                    add_foreign_key(&mut schemas, &mut deps, &inner.order, &target, col, &desc, snap);
                }
                EdgeStorage::Junction {
                    table,
                    owner_column,
                    target_column,
                } => {
                    if !seen_junctions.insert(table.clone()) {
                        continue;
                    }
                    let fk = |col: &str, references: &EntityDescriptor| ForeignKey {
                        column: col.to_string(),
                        references: snap.table(&references.table),
                        ref_column: ID_COLUMN.to_string(),
                        on_delete: OnDelete::Cascade,
                    };
                    junctions.push((
                        snap.table(table),
                        TableSchema {
                            columns: vec![
                                column(owner_column, desc.id_field_type(), false),
                                column(target_column, target.id_field_type(), false),
                            ],
                            primary_key: vec![owner_column.clone(), target_column.clone()],
                            foreign_keys: vec![fk(owner_column, desc.as_ref()), fk(target_column, target.as_ref())],
                            ..TableSchema::default()
                        },
                    ));
                }
            }
        }
    }

    let mut ordered = Vec::new();
    let mut done = HashSet::new();
    let mut visiting = HashSet::new();
    for name in &inner.order {
        visit(name, &deps, &mut done, &mut visiting, &mut ordered);
    }

    let mut out = Vec::new();
    for name in ordered {
        let desc = inner.descriptor(name)?;
        if let Some(schema) = schemas.remove(name) {
            out.push((snap.table(&desc.table), schema));
        }
    }
    out.extend(junctions);
    for name in &inner.order {
        let desc = inner.descriptor(name)?;
        if desc.tracked {
            out.push((
                snap.table(&inner.config.history_table(&desc.table)),
                history_schema(&desc),
            ));
        }
    }
    Ok(out)
}

/// `owner.col` references `target.id`.
fn add_foreign_key<'a>(
    schemas: &mut HashMap<&'a str, TableSchema>,
    deps: &mut HashMap<&'a str, HashSet<&'a str>>,
    order: &'a [String],
    owner: &EntityDescriptor,
    col: &str,
    target: &EntityDescriptor,
    snap: &SchemaSnapshot,
) {
    let (Some(owner_key), Some(target_key)) = (
        order.iter().find(|n| **n == owner.name),
        order.iter().find(|n| **n == target.name),
    ) else {
        return;
    };
    let Some(schema) = schemas.get_mut(owner_key.as_str()) else {
        return;
    };
    if schema.foreign_keys.iter().any(|fk| fk.column == col) {
        return;
    }
    let nullable = schema.column(col).map_or(true, |c| c.nullable);
    schema.foreign_keys.push(ForeignKey {
        column: col.to_string(),
        references: snap.table(&target.table),
        ref_column: ID_COLUMN.to_string(),
        on_delete: if nullable { OnDelete::SetNull } else { OnDelete::Restrict },
    });
    if owner_key != target_key {
        deps.entry(owner_key.as_str()).or_default().insert(target_key.as_str());
    }
}

/// Depth-first topological order; back edges of cycles are ignored.
fn visit<'a>(
    name: &'a str,
    deps: &HashMap<&'a str, HashSet<&'a str>>,
    done: &mut HashSet<&'a str>,
    visiting: &mut HashSet<&'a str>,
    out: &mut Vec<&'a str>,
) {
    if done.contains(name) || !visiting.insert(name) {
        return;
    }
    if let Some(targets) = deps.get(name) {
        let mut targets: Vec<&str> = targets.iter().copied().collect();
        targets.sort_unstable();
        for t in targets {
            visit(t, deps, done, visiting, out);
        }
    }
    visiting.remove(name);
    done.insert(name);
    out.push(name);
}

pub(crate) async fn run(client: &Client, ctx: &RequestContext) -> Result<()> {
    client.check_open()?;
    let inner = client.inner();
    let snap = schema::snapshot(inner.tenants.as_ref(), ctx).await?;
    let tables = table_schemas(inner, &snap)?;
    for (table, schema) in &tables {
        ctx.check("store")?;
        client
            .exec()
            .ensure_table(table, schema)
            .await
            .map_err(EntError::Store)?;
        tracing::debug!(table = %table, columns = schema.columns.len(), "table ensured");
    }
    tracing::info!(tables = tables.len(), tenant = ?snap.tenant, "schema migrated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Field;
    use crate::edge::EdgeDescriptor;
    use crate::executor::MemoryExecutor;
    use crate::policy::Policy;
    use crate::EngineBuilder;
    use std::sync::Arc;

    fn client() -> Client {
        let file = EntityDescriptor::builder("file")
            .field(Field::string("note_id"))
            .edge(EdgeDescriptor::many_to_one("note", "note", "note_id").inverse("files"))
            .build()
            .unwrap();
        let note = EntityDescriptor::builder("note")
            .tracked()
            .field(Field::string("title").required())
            .edge(EdgeDescriptor::one_to_many("files", "file", "note_id"))
            .edge(EdgeDescriptor::many_to_many("labels", "label", "note_labels", "note_id", "label_id"))
            .build()
            .unwrap();
        let label = EntityDescriptor::builder("label").id(IdType::Int).build().unwrap();
        EngineBuilder::new()
            .entity(file)
            .entity(note)
            .entity(label)
            .policy(Policy::allow_all("file"))
            .policy(Policy::allow_all("note"))
            .policy(Policy::allow_all("label"))
            .build(Arc::new(MemoryExecutor::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn referenced_tables_come_first() {
        let client = client();
        let snap = schema::snapshot(client.inner().tenants.as_ref(), &RequestContext::new())
            .await
            .unwrap();
        let tables = table_schemas(client.inner(), &snap).unwrap();
        let names: Vec<String> = tables.iter().map(|(t, _)| t.to_string()).collect();
        assert_eq!(names, vec!["note", "file", "label", "note_labels", "note_history"]);

        let (_, file) = &tables[1];
        assert_eq!(file.foreign_keys.len(), 1);
        assert_eq!(file.foreign_keys[0].on_delete, OnDelete::SetNull);

        let (_, junction) = &tables[3];
        assert_eq!(junction.primary_key, vec!["note_id", "label_id"]);
        assert_eq!(junction.column("label_id").map(|c| c.ty), Some(FieldType::Int));

        let (_, label) = &tables[2];
        assert_eq!(label.auto_increment.as_deref(), Some("id"));

        let (_, history) = &tables[4];
        assert!(history.column("title").is_some_and(|c| c.nullable));
        assert!(history.foreign_keys.is_empty());
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let client = client();
        let ctx = RequestContext::new();
        client.migrate(&ctx).await.unwrap();
        client.migrate(&ctx).await.unwrap();
        let created = client.entity("note").unwrap().create().set("title", "x").save(&ctx).await.unwrap();
        assert_eq!(created.get_str("title"), Some("x"));
    }
}
