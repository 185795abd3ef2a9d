//! Query pipeline and edge resolver against the in-memory store.

mod helpers;

use entgraph::interceptor::func;
use entgraph::{Decision, EntError, Order, Predicate, RequestContext};
use helpers::{builder, ctx, engine, engine_with};

#[tokio::test]
async fn created_entity_reads_back_with_defaults_applied() {
    let client = engine().await;
    let ctx = ctx("t1");
    let notes = client.entity("note").unwrap();

    let created = notes.create().set("title", "Quarterly review").save(&ctx).await.unwrap();
    assert_eq!(created.get_i64("priority"), Some(3));
    assert_eq!(created.get_str("owner_id"), Some("t1"));
    assert_eq!(created.created_by(), Some("t1-admin"));
    assert!(created.created_at().is_some());
    assert!(!created.is_deleted());

    let loaded = notes
        .query()
        .filter(Predicate::eq("id", created.id()))
        .only(&ctx)
        .await
        .unwrap();
    assert_eq!(loaded, created);
}

#[tokio::test]
async fn only_distinguishes_zero_one_and_many() {
    let client = engine().await;
    let ctx = ctx("t1");
    let notes = client.entity("note").unwrap();
    let by_title = |title: &str| notes.query().filter(Predicate::eq("title", title));

    let err = by_title("missing").only(&ctx).await.unwrap_err();
    assert!(err.is_not_found());

    notes.create().set("title", "one").save(&ctx).await.unwrap();
    assert_eq!(by_title("one").only(&ctx).await.unwrap().get_str("title"), Some("one"));
    assert!(by_title("one").only_id(&ctx).await.is_ok());

    for _ in 0..3 {
        notes.create().set("title", "many").save(&ctx).await.unwrap();
    }
    assert!(by_title("many").only(&ctx).await.unwrap_err().is_not_singular());
    assert!(by_title("many").only_id(&ctx).await.unwrap_err().is_not_singular());
    assert_eq!(by_title("many").count(&ctx).await.unwrap(), 3);
}

#[tokio::test]
async fn only_ignores_a_caller_limit() {
    let client = engine().await;
    let ctx = ctx("t1");
    let files = client.entity("file").unwrap();
    for _ in 0..2 {
        files.create().set("name", "dup").save(&ctx).await.unwrap();
    }

    let dup = files.query().filter(Predicate::eq("name", "dup")).limit(1);
    assert!(dup.only(&ctx).await.unwrap_err().is_not_singular());
    assert!(dup.only_id(&ctx).await.unwrap_err().is_not_singular());
    assert_eq!(dup.clone().limit(5).first(&ctx).await.unwrap().get_str("name"), Some("dup"));
}

#[tokio::test]
async fn first_all_and_ids_follow_ordering() {
    let client = engine().await;
    let ctx = ctx("t1");
    let notes = client.entity("note").unwrap();
    for (title, priority) in [("b", 2_i64), ("a", 5), ("c", 1)] {
        notes.create().set("title", title).set("priority", priority).save(&ctx).await.unwrap();
    }

    let base = notes.query().order_by(Order::desc("priority"));
    assert_eq!(base.first(&ctx).await.unwrap().get_str("title"), Some("a"));

    let titles: Vec<String> = base
        .clone()
        .limit(2)
        .all(&ctx)
        .await
        .unwrap()
        .iter()
        .filter_map(|n| n.get_str("title").map(str::to_string))
        .collect();
    assert_eq!(titles, vec!["a", "b"]);

    let offset = base.clone().offset(2).all(&ctx).await.unwrap();
    assert_eq!(offset.len(), 1);
    assert_eq!(offset[0].get_str("title"), Some("c"));

    // The template is unaffected by clones.
    assert_eq!(base.ids(&ctx).await.unwrap().len(), 3);
    assert!(notes.query().filter(Predicate::eq("title", "zzz")).all(&ctx).await.unwrap().is_empty());
    assert!(notes.query().filter(Predicate::eq("title", "zzz")).first(&ctx).await.unwrap_err().is_not_found());
    assert!(!notes.query().filter(Predicate::eq("title", "zzz")).exist(&ctx).await.unwrap());
}

#[tokio::test]
async fn select_narrows_and_rejects_unknown_fields() {
    let client = engine().await;
    let ctx = ctx("t1");
    let notes = client.entity("note").unwrap();
    notes.create().set("title", "narrow").save(&ctx).await.unwrap();

    let narrow = notes.query().select(["title"]).only(&ctx).await.unwrap();
    assert_eq!(narrow.get_str("title"), Some("narrow"));
    assert_eq!(narrow.get_i64("priority"), None);

    let err = notes.query().select(["nope"]).all(&ctx).await.unwrap_err();
    assert!(err.is_validation(), "{err}");
    let err = notes.query().filter(Predicate::eq("nope", 1_i64)).all(&ctx).await.unwrap_err();
    assert!(err.is_validation(), "{err}");
}

#[tokio::test]
async fn unloaded_edge_is_an_error_even_when_rows_exist() {
    let client = engine().await;
    let ctx = ctx("t1");
    let note = client.entity("note").unwrap().create().set("title", "with files").save(&ctx).await.unwrap();
    client
        .entity("file")
        .unwrap()
        .create()
        .set("name", "a.pdf")
        .set("note_id", note.id())
        .save(&ctx)
        .await
        .unwrap();

    let loaded = client.entity("note").unwrap().get(&ctx, note.id().clone()).await.unwrap();
    assert!(loaded.edge("files").unwrap_err().is_edge_not_loaded());
    assert!(loaded.named_edge("pdfs").unwrap_err().is_edge_not_loaded());
}

#[tokio::test]
async fn o2m_and_m2o_edges_load_in_batches() {
    let client = engine().await;
    let ctx = ctx("t1");
    let notes = client.entity("note").unwrap();
    let files = client.entity("file").unwrap();

    let a = notes.create().set("title", "a").save(&ctx).await.unwrap();
    let b = notes.create().set("title", "b").save(&ctx).await.unwrap();
    notes.create().set("title", "empty").save(&ctx).await.unwrap();
    for (name, parent) in [("a1.pdf", &a), ("a2.txt", &a), ("b1.pdf", &b)] {
        files.create().set("name", name).set("note_id", parent.id()).save(&ctx).await.unwrap();
    }

    let loaded = notes
        .query()
        .with_edge("files")
        .with_named_edge("pdfs", "files", |q| q.filter(Predicate::has_suffix("name", ".pdf")))
        .order_by(Order::asc("title"))
        .all(&ctx)
        .await
        .unwrap();
    let counts: Vec<(usize, usize)> = loaded
        .iter()
        .map(|n| (n.edge("files").unwrap().len(), n.named_edge("pdfs").unwrap().len()))
        .collect();
    assert_eq!(counts, vec![(2, 1), (1, 1), (0, 0)]);

    let with_parent = files
        .query()
        .with_edge("note")
        .filter(Predicate::eq("name", "b1.pdf"))
        .only(&ctx)
        .await
        .unwrap();
    let parent = with_parent.edge_one("note").unwrap().unwrap();
    assert_eq!(parent.get_str("title"), Some("b"));
}

#[tokio::test]
async fn duplicate_named_edge_alias_is_a_configuration_error() {
    let client = engine().await;
    let ctx = ctx("t1");
    let err = client
        .entity("note")
        .unwrap()
        .query()
        .with_named_edge("x", "files", |q| q)
        .with_named_edge("x", "files", |q| q)
        .all(&ctx)
        .await
        .unwrap_err();
    assert!(err.is_configuration(), "{err}");

    let err = client.entity("note").unwrap().query().with_edge("nope").all(&ctx).await.unwrap_err();
    assert!(err.is_configuration(), "{err}");
}

#[tokio::test]
async fn m2m_links_are_visible_from_both_ends() {
    let client = engine().await;
    let ctx = ctx("t1");
    let users = client.entity("user").unwrap();
    let groups = client.entity("group").unwrap();

    let admins = groups.create().set("name", "admins").save(&ctx).await.unwrap();
    let staff = groups.create().set("name", "staff").save(&ctx).await.unwrap();
    let ana = users
        .create()
        .set("email", "ana@example.com")
        .add_edge_entities("groups", &[admins.clone(), staff.clone()])
        .save(&ctx)
        .await
        .unwrap();
    let bo = users.create().set("email", "bo@example.com").save(&ctx).await.unwrap();
    users.update_one(&bo).add_edge_ids("groups", [admins.id().clone()]).save(&ctx).await.unwrap();

    let loaded = groups
        .query()
        .with_edge_query("members", |q| q.order_by(Order::asc("email")))
        .order_by(Order::asc("name"))
        .all(&ctx)
        .await
        .unwrap();
    let emails = |i: usize| -> Vec<String> {
        loaded[i]
            .edge("members")
            .unwrap()
            .iter()
            .filter_map(|u| u.get_str("email").map(str::to_string))
            .collect()
    };
    assert_eq!(emails(0), vec!["ana@example.com", "bo@example.com"]);
    assert_eq!(emails(1), vec!["ana@example.com"]);

    users
        .update_one(&ana)
        .remove_edge_entities("groups", &[staff.clone()])
        .save(&ctx)
        .await
        .unwrap();
    let staff_members = groups
        .query()
        .filter(Predicate::eq("id", staff.id()))
        .with_edge("members")
        .only(&ctx)
        .await
        .unwrap();
    assert!(staff_members.edge("members").unwrap().is_empty());
}

#[tokio::test]
async fn has_edge_filters_on_related_rows() {
    let client = engine().await;
    let ctx = ctx("t1");
    let users = client.entity("user").unwrap();
    let admins = client.entity("group").unwrap().create().set("name", "admins").save(&ctx).await.unwrap();
    users
        .create()
        .set("email", "root@example.com")
        .add_edge_entities("groups", &[admins])
        .save(&ctx)
        .await
        .unwrap();
    users.create().set("email", "guest@example.com").save(&ctx).await.unwrap();

    let in_any = users.query().filter(users.has_edge("groups").unwrap()).all(&ctx).await.unwrap();
    assert_eq!(in_any.len(), 1);

    let admin = users
        .query()
        .filter(users.has_edge_with("groups", Predicate::eq("name", "admins")).unwrap())
        .only(&ctx)
        .await
        .unwrap();
    assert_eq!(admin.get_str("email"), Some("root@example.com"));

    let lonely = users
        .query()
        .filter(Predicate::not(users.has_edge("groups").unwrap()))
        .only(&ctx)
        .await
        .unwrap();
    assert_eq!(lonely.get_str("email"), Some("guest@example.com"));

    assert!(users.has_edge("nope").unwrap_err().is_configuration());
    assert!(users
        .has_edge_with("groups", Predicate::eq("email", "x"))
        .unwrap_err()
        .is_validation());
}

#[tokio::test]
async fn soft_deleted_rows_are_hidden_unless_skipped() {
    let client = engine().await;
    let ctx = ctx("t1");
    let notes = client.entity("note").unwrap();
    let gone = notes.create().set("title", "gone").save(&ctx).await.unwrap();
    notes.create().set("title", "kept").save(&ctx).await.unwrap();

    notes.soft_delete_one_id(gone.id().clone()).unwrap().exec(&ctx).await.unwrap();

    assert_eq!(notes.query().count(&ctx).await.unwrap(), 1);
    let all = notes.query().all(&ctx.clone().skip_soft_delete()).await.unwrap();
    assert_eq!(all.len(), 2);
    let deleted = all.iter().find(|n| n.id() == gone.id()).unwrap();
    assert!(deleted.is_deleted());
    assert_eq!(deleted.deleted_by(), Some("t1-admin"));

    assert!(matches!(
        client.entity("file").unwrap().soft_delete(),
        Err(e) if e.is_configuration()
    ));
}

#[tokio::test]
async fn interceptors_run_in_order_and_abort_before_the_store() {
    let client = engine_with(
        builder()
            .entity_interceptor(
                "file",
                func(|_, plan| {
                    plan.filter(Predicate::has_suffix("name", ".pdf"));
                    Ok(())
                }),
            )
            .entity_interceptor(
                "file",
                func(|ctx, _| match ctx.actor() {
                    Some("blocked") => Err(EntError::denied("file", "query", "blocked actor")),
                    _ => Ok(()),
                }),
            ),
    )
    .await;
    let ctx = ctx("t1");
    let files = client.entity("file").unwrap();
    files.create().set("name", "a.pdf").save(&ctx).await.unwrap();
    files.create().set("name", "b.txt").save(&ctx).await.unwrap();

    assert_eq!(files.query().count(&ctx).await.unwrap(), 1);

    let blocked = RequestContext::for_principal(entgraph::Principal::new("blocked"));
    assert!(files.query().all(&blocked).await.unwrap_err().is_permission_denied());
}

#[tokio::test]
async fn tenant_scope_never_leaks_rows_across_tenants() {
    let client = engine().await;
    let notes = client.entity("note").unwrap();
    for tenant in ["t1", "t2"] {
        for i in 0..3 {
            notes
                .create()
                .set("title", format!("{tenant}-{i}"))
                .save(&ctx(tenant))
                .await
                .unwrap();
        }
    }

    let t1 = ctx("t1");
    let sneaky = notes
        .query()
        .filter(Predicate::or(vec![
            Predicate::eq("owner_id", "t2"),
            Predicate::has_prefix("title", "t2-"),
        ]))
        .all(&t1)
        .await
        .unwrap();
    assert!(sneaky.is_empty());
    assert_eq!(notes.query().count(&t1).await.unwrap(), 3);
    assert!(notes
        .query()
        .all(&t1)
        .await
        .unwrap()
        .iter()
        .all(|n| n.get_str("owner_id") == Some("t1")));

    let err = notes
        .create()
        .set("title", "cross")
        .set("owner_id", "t2")
        .save(&t1)
        .await
        .unwrap_err();
    assert!(err.is_permission_denied(), "{err}");

    // Updates by predicate are narrowed to the caller's tenant.
    let touched = notes.update().set("priority", 9_i64).save(&t1).await.unwrap();
    assert_eq!(touched, 3);
    let t2_priorities = notes.query().filter(Predicate::eq("priority", 9_i64)).count(&ctx("t2")).await.unwrap();
    assert_eq!(t2_priorities, 0);

    let anonymous = RequestContext::new();
    assert!(notes.query().all(&anonymous).await.unwrap_err().is_permission_denied());

    let internal = RequestContext::new().with_decision(Decision::Allow);
    assert_eq!(notes.query().count(&internal).await.unwrap(), 6);
}

#[tokio::test]
async fn unattributable_edge_rows_are_consistency_faults() {
    // An interceptor that drops every filter makes the target fetch return
    // rows no parent references.
    let client = engine_with(builder().entity_interceptor(
        "file",
        func(|_, plan| {
            plan.predicates.clear();
            Ok(())
        }),
    ))
    .await;
    let ctx = ctx("t1");
    let notes = client.entity("note").unwrap();
    let files = client.entity("file").unwrap();
    let note = notes.create().set("title", "parent").save(&ctx).await.unwrap();
    files.create().set("name", "mine").set("note_id", note.id()).save(&ctx).await.unwrap();
    files.create().set("name", "stray").save(&ctx).await.unwrap();

    let err = notes.query().with_edge("files").all(&ctx).await.unwrap_err();
    assert!(matches!(&err, EntError::Consistency { edge, .. } if edge == "files"), "{err}");
}
