//! Engine assembly, configuration and tenant/schema routing.

mod helpers;

use std::io::Write;
use std::sync::Arc;

use entgraph::{
    EngineBuilder, EngineConfig, EntityDescriptor, Field, MemoryExecutor, Policy, RequestContext, SchemaConfig,
    SchemaPerTenant, StaticTenants, TableRef,
};

fn memo() -> EntityDescriptor {
    EntityDescriptor::builder("memo")
        .tracked()
        .field(Field::string("body").required())
        .build()
        .unwrap()
}

fn schema(name: &str) -> Option<String> {
    Some(name.to_string())
}

#[test]
fn every_entity_needs_a_policy() {
    let err = helpers::builder()
        .entity(memo())
        .build(Arc::new(MemoryExecutor::new()))
        .err()
        .unwrap();
    assert!(err.is_configuration(), "{err}");

    let err = helpers::builder()
        .policy(Policy::allow_all("ghost"))
        .build(Arc::new(MemoryExecutor::new()))
        .err()
        .unwrap();
    assert!(err.is_configuration(), "{err}");

    let err = helpers::builder()
        .entity_hook("ghost", entgraph::hook::before(|_, _| Ok(())))
        .build(Arc::new(MemoryExecutor::new()))
        .err()
        .unwrap();
    assert!(err.is_configuration(), "{err}");
}

#[tokio::test]
async fn schema_per_tenant_isolates_every_table() {
    let store = Arc::new(MemoryExecutor::new());
    let client = EngineBuilder::new()
        .entity(memo())
        .policy(Policy::allow_all("memo"))
        .tenants(SchemaPerTenant::new("tenant_"))
        .build(store.clone())
        .unwrap();

    for tenant in ["a", "b"] {
        let ctx = RequestContext::new().with_tenant(tenant);
        client.migrate(&ctx).await.unwrap();
        client.entity("memo").unwrap().create().set("body", tenant).save(&ctx).await.unwrap();
    }

    for tenant in ["a", "b"] {
        let ns = schema(&format!("tenant_{tenant}"));
        let rows = store.rows(&TableRef::in_schema(ns.clone(), "memo")).unwrap();
        assert_eq!(rows.len(), 1);
        let history = store.rows(&TableRef::in_schema(ns, "memo_history")).unwrap();
        assert_eq!(history.len(), 1);

        let ctx = RequestContext::new().with_tenant(tenant);
        let only = client.entity("memo").unwrap().query().only(&ctx).await.unwrap();
        assert_eq!(only.get_str("body"), Some(tenant));
    }
    assert!(!store.has_table(&TableRef::new("memo")));

    let bad = RequestContext::new().with_tenant("a; drop");
    let err = client.entity("memo").unwrap().query().all(&bad).await.unwrap_err();
    assert!(err.is_validation(), "{err}");
}

#[tokio::test]
async fn static_tenant_maps_load_from_yaml() {
    let tenants = StaticTenants::from_yaml_str(
        r#"
tenants:
  acme:
    default_schema: acme
    tables:
      memo: acme_archive
fallback:
  default_schema: shared
"#,
    )
    .unwrap();
    let store = Arc::new(MemoryExecutor::new());
    let client = EngineBuilder::new()
        .entity(memo())
        .policy(Policy::allow_all("memo"))
        .tenants(tenants)
        .build(store.clone())
        .unwrap();

    let acme = RequestContext::new().with_tenant("acme");
    client.migrate(&acme).await.unwrap();
    client.entity("memo").unwrap().create().set("body", "x").save(&acme).await.unwrap();
    assert_eq!(store.rows(&TableRef::in_schema(schema("acme_archive"), "memo")).unwrap().len(), 1);
    assert_eq!(store.rows(&TableRef::in_schema(schema("acme"), "memo_history")).unwrap().len(), 1);

    let anonymous = RequestContext::new();
    client.migrate(&anonymous).await.unwrap();
    assert!(store.has_table(&TableRef::in_schema(schema("shared"), "memo")));

    let stranger = RequestContext::new().with_tenant("globex");
    let err = client.entity("memo").unwrap().query().all(&stranger).await.unwrap_err();
    assert!(err.is_permission_denied(), "{err}");
}

#[tokio::test]
async fn engine_config_from_a_yaml_file_drives_routing() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "default_schema: app\nhistory:\n  table_suffix: _log\nschema_per_tenant_prefix: null\nmax_batch_size: 10"
    )
    .unwrap();
    let config = EngineConfig::from_yaml_file(file.path()).unwrap();
    assert_eq!(config.history_table("memo"), "memo_log");

    let store = Arc::new(MemoryExecutor::new());
    let client = EngineBuilder::new()
        .config(config)
        .entity(memo())
        .policy(Policy::allow_all("memo"))
        .build(store.clone())
        .unwrap();
    let ctx = RequestContext::new();
    client.migrate(&ctx).await.unwrap();
    client.entity("memo").unwrap().create().set("body", "routed").save(&ctx).await.unwrap();

    assert_eq!(store.rows(&TableRef::in_schema(schema("app"), "memo")).unwrap().len(), 1);
    assert_eq!(store.rows(&TableRef::in_schema(schema("app"), "memo_log")).unwrap().len(), 1);

    let shared = SchemaConfig::from_yaml_str("default_schema: app\n").unwrap();
    assert_eq!(shared.schema_for("anything"), Some("app"));
}
