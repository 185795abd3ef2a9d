//! Transaction binding, commit/rollback visibility and closed-transaction errors.

mod helpers;

use entgraph::{EntError, Predicate};
use helpers::{ctx, engine};

#[tokio::test]
async fn committed_work_becomes_visible() {
    let client = engine().await;
    let ctx = ctx("t1");
    let notes = client.entity("note").unwrap();

    let tx = client.tx(&ctx).await.unwrap();
    let inside = tx.client().entity("note").unwrap();
    let note = inside.create().set("title", "in tx").save(&ctx).await.unwrap();
    assert_eq!(inside.query().count(&ctx).await.unwrap(), 1);
    assert_eq!(notes.query().count(&ctx).await.unwrap(), 0);

    tx.commit().await.unwrap();
    assert_eq!(notes.query().count(&ctx).await.unwrap(), 1);
    assert_eq!(notes.history().unwrap().of(&ctx, note.id().clone()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn rolled_back_work_disappears() {
    let client = engine().await;
    let ctx = ctx("t1");

    let tx = client.tx(&ctx).await.unwrap();
    let files = tx.client().entity("file").unwrap();
    files.create().set("name", "temp").save(&ctx).await.unwrap();
    tx.rollback().await.unwrap();

    assert!(!client.entity("file").unwrap().query().exist(&ctx).await.unwrap());
}

#[tokio::test]
async fn entities_from_a_finished_transaction_must_be_unwrapped() {
    let client = engine().await;
    let ctx = ctx("t1");

    let tx = client.tx(&ctx).await.unwrap();
    let note = tx.client().entity("note").unwrap().create().set("title", "bound").save(&ctx).await.unwrap();
    let stale_client = tx.client().clone();
    tx.commit().await.unwrap();

    let err = note.update().unwrap().set("title", "late").save(&ctx).await.unwrap_err();
    assert!(matches!(err, EntError::TxClosed), "{err}");
    let err = stale_client.entity("note").unwrap().query().all(&ctx).await.unwrap_err();
    assert!(matches!(err, EntError::TxClosed), "{err}");

    let note = note.unwrap();
    let renamed = note.update().unwrap().set("title", "rebound").save(&ctx).await.unwrap();
    assert_eq!(renamed.get_str("title"), Some("rebound"));
}

#[tokio::test]
async fn nested_transactions_are_rejected() {
    let client = engine().await;
    let ctx = ctx("t1");
    let tx = client.tx(&ctx).await.unwrap();
    assert!(tx.client().in_tx());
    assert!(!tx.client().unwrapped().in_tx());
    let err = tx.client().tx(&ctx).await.err().unwrap();
    assert!(err.is_configuration(), "{err}");
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn edge_writes_roll_back_with_the_primary_row() {
    let client = engine().await;
    let ctx = ctx("t1");
    let users = client.entity("user").unwrap();
    let group = client.entity("group").unwrap().create().set("name", "ops").save(&ctx).await.unwrap();

    // Linking to a group that does not exist fails on the junction foreign key.
    let err = users
        .create()
        .set("email", "x@example.com")
        .add_edge_ids("groups", [group.id().clone(), "ghost".into()])
        .save(&ctx)
        .await
        .unwrap_err();
    assert!(err.is_constraint(), "{err}");
    assert_eq!(
        users.query().filter(Predicate::eq("email", "x@example.com")).count(&ctx).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn commit_keeps_writes_made_outside_the_transaction() {
    let client = engine().await;
    let ctx = ctx("t1");
    let files = client.entity("file").unwrap();

    let tx = client.tx(&ctx).await.unwrap();
    files.create().set("name", "outside").save(&ctx).await.unwrap();
    tx.client()
        .entity("user")
        .unwrap()
        .create()
        .set("email", "inside@example.com")
        .save(&ctx)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(files.query().count(&ctx).await.unwrap(), 1);
    assert_eq!(client.entity("user").unwrap().query().count(&ctx).await.unwrap(), 1);
}
