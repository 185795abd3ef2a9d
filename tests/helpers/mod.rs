//! Shared fixtures for the integration tests.
//!
//! Schema:
//!   organization  caller-assigned string ids ("t1", "t2")
//!   note          tracked, audited, soft-delete; owner_id -> organization,
//!                 tenant-scoped on owner_id; O2M `files`
//!   file          note_id -> note (inverse of `files`)
//!   user / group  M2M through group_members, `members` is the inverse

#![allow(dead_code)]

use std::sync::Arc;

use entgraph::policy::TenantScope;
use entgraph::{
    validate, Client, EdgeDescriptor, EngineBuilder, EntityDescriptor, Field, MemoryExecutor, Policy,
    Principal, RequestContext,
};

pub const TENANTS: [&str; 2] = ["t1", "t2"];

pub fn organization() -> EntityDescriptor {
    EntityDescriptor::builder("organization")
        .table("organizations")
        .caller_assigned_id()
        .field(Field::string("name").required())
        .build()
        .unwrap()
}

pub fn note() -> EntityDescriptor {
    EntityDescriptor::builder("note")
        .table("notes")
        .tracked()
        .audited()
        .soft_delete()
        .field(Field::string("title").required().validate(validate::not_empty()))
        .field(Field::int("priority").default_value(3_i64))
        .field(Field::string("owner_id").required().immutable())
        .edge(EdgeDescriptor::many_to_one("owner", "organization", "owner_id"))
        .edge(EdgeDescriptor::one_to_many("files", "file", "note_id"))
        .build()
        .unwrap()
}

pub fn file() -> EntityDescriptor {
    EntityDescriptor::builder("file")
        .table("files")
        .field(Field::string("name").required())
        .field(Field::string("note_id"))
        .edge(EdgeDescriptor::many_to_one("note", "note", "note_id").inverse("files"))
        .build()
        .unwrap()
}

pub fn user() -> EntityDescriptor {
    EntityDescriptor::builder("user")
        .table("users")
        .field(Field::string("email").required().unique())
        .edge(EdgeDescriptor::many_to_many("groups", "group", "group_members", "user_id", "group_id"))
        .build()
        .unwrap()
}

pub fn group() -> EntityDescriptor {
    EntityDescriptor::builder("group")
        .table("groups")
        .field(Field::string("name").required())
        .edge(
            EdgeDescriptor::many_to_many("members", "user", "group_members", "group_id", "user_id")
                .inverse("groups"),
        )
        .build()
        .unwrap()
}

/// Builder with every fixture entity and its policy registered.
pub fn builder() -> EngineBuilder {
    EngineBuilder::new()
        .entity(organization())
        .entity(note())
        .entity(file())
        .entity(user())
        .entity(group())
        .policy(Policy::allow_all("organization"))
        .policy(Policy::new("note").rule(TenantScope::new("owner_id")))
        .policy(Policy::allow_all("file"))
        .policy(Policy::allow_all("user"))
        .policy(Policy::allow_all("group"))
}

/// Context acting as `actor` inside `tenant`.
pub fn ctx(tenant: &str) -> RequestContext {
    RequestContext::for_principal(Principal::new(format!("{}-admin", tenant)).with_tenancy(tenant))
}

/// Migrate and seed the tenant organizations.
pub async fn seed(client: &Client) {
    let ctx = RequestContext::new();
    client.migrate(&ctx).await.unwrap();
    let orgs = client.entity("organization").unwrap();
    for tenant in TENANTS {
        orgs.create()
            .set_id(tenant)
            .set("name", format!("Org {}", tenant))
            .save(&ctx)
            .await
            .unwrap();
    }
}

/// Migrated, seeded engine over a fresh in-memory store.
pub async fn engine() -> Client {
    engine_with(builder()).await
}

pub async fn engine_with(builder: EngineBuilder) -> Client {
    let client = builder.build(Arc::new(MemoryExecutor::new())).unwrap();
    seed(&client).await;
    client
}
