//! Property checks over the in-memory engine.

mod helpers;

use entgraph::{HistoryOp, Predicate};
use helpers::{ctx, engine};
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn only_matches_row_cardinality(rows in 0usize..5) {
        let outcome = runtime().block_on(async {
            let client = engine().await;
            let ctx = ctx("t1");
            let notes = client.entity("note").unwrap();
            for _ in 0..rows {
                notes.create().set("title", "same").save(&ctx).await.unwrap();
            }
            notes.query().filter(Predicate::eq("title", "same")).only(&ctx).await
        });
        match rows {
            0 => prop_assert!(outcome.unwrap_err().is_not_found()),
            1 => {
                let only = outcome.unwrap();
                prop_assert_eq!(only.get_str("title"), Some("same"));
            }
            _ => prop_assert!(outcome.unwrap_err().is_not_singular()),
        }
    }

    #[test]
    fn history_times_strictly_increase(updates in 1usize..8, bulk in 1usize..4) {
        let records = runtime().block_on(async {
            let client = engine().await;
            let ctx = ctx("t1");
            let notes = client.entity("note").unwrap();
            let created = notes
                .create_bulk((0..bulk).map(|i| notes.create().set("title", format!("n{i}"))).collect())
                .save(&ctx)
                .await
                .unwrap();
            for round in 0..updates {
                notes.update().set("priority", round as i64).save(&ctx).await.unwrap();
            }
            let history = notes.history().unwrap();
            let mut all = Vec::new();
            for note in &created {
                all.push(history.of(&ctx, note.id().clone()).await.unwrap());
            }
            all
        });
        for per_entity in records {
            prop_assert_eq!(per_entity.len(), updates + 1);
            prop_assert_eq!(per_entity[0].operation, HistoryOp::Create);
            prop_assert!(per_entity[1..].iter().all(|r| r.operation == HistoryOp::Update));
            prop_assert!(per_entity.windows(2).all(|w| w[0].history_time < w[1].history_time));
        }
    }
}
