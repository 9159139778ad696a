//! Contention tests on a file-backed database with a real connection pool.

mod common;

use std::time::Duration;

use common::{TestStore, BAG, SHIRT_L};
use tillkeeper_core::{CoreError, UnitTag};
use tillkeeper_db::{AddToCart, DbError};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_exactly_one_winner() {
    let store = TestStore::file_backed(8, Duration::from_secs(10)).await;
    let unit = store.receive(SHIRT_L, 1).await.remove(0);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let units = store.db.units();
        let code = unit.code.clone();
        handles.push(tokio::spawn(async move {
            units.try_claim(&code, SHIRT_L, None).await
        }));
    }

    let mut winners = 0;
    let mut already_claimed = 0;
    for handle in handles {
        match handle.await.expect("claim task panicked") {
            Ok(claimed) => {
                assert_eq!(claimed.tag, UnitTag::InCart);
                winners += 1;
            }
            Err(DbError::Domain(CoreError::AlreadyClaimed { .. })) => already_claimed += 1,
            Err(other) => panic!("unexpected claim error: {other}"),
        }
    }

    assert_eq!(winners, 1);
    assert_eq!(already_claimed, 7);
    assert_eq!(store.tag_of(&unit.code).await, UnitTag::InCart);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_scans_into_different_carts() {
    let store = TestStore::file_backed(6, Duration::from_secs(10)).await;
    let unit = store.receive(SHIRT_L, 1).await.remove(0);

    let mut carts = Vec::new();
    for _ in 0..4 {
        carts.push(store.db.carts().open_cart(None).await.unwrap());
    }

    let mut handles = Vec::new();
    for cart in &carts {
        let coordinator = store.db.carts();
        let cart_id = cart.id.clone();
        let code = unit.code.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .add_to_cart(&cart_id, AddToCart::scan(SHIRT_L, code))
                .await
        }));
    }

    let mut lines = 0;
    for handle in handles {
        match handle.await.expect("scan task panicked") {
            Ok(line) => {
                assert_eq!(line.claimed_units, vec![unit.code.clone()]);
                lines += 1;
            }
            Err(DbError::Domain(CoreError::NotAvailable { tag, .. })) => {
                assert_eq!(tag, UnitTag::InCart)
            }
            Err(other) => panic!("unexpected scan error: {other}"),
        }
    }
    assert_eq!(lines, 1);

    // Exactly one cart holds the unit
    let mut holders = 0;
    for cart in &carts {
        let view = store.db.carts().get_cart(&cart.id).await.unwrap();
        holders += view.lines.len();
    }
    assert_eq!(holders, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_never_oversell() {
    let store = TestStore::file_backed(8, Duration::from_secs(10)).await;
    let ledger = store.db.stock();
    // Leave exactly five bags at the default location
    ledger
        .reserve(BAG, None, "main", common::BAG_STOCK - 5)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..12 {
        let ledger = store.db.stock();
        handles.push(tokio::spawn(async move { ledger.reserve(BAG, None, "main", 1).await }));
    }

    let mut reserved = 0;
    let mut refused = 0;
    for handle in handles {
        match handle.await.expect("reserve task panicked") {
            Ok(()) => reserved += 1,
            Err(DbError::Domain(CoreError::InsufficientStock { .. })) => refused += 1,
            Err(other) => panic!("unexpected reserve error: {other}"),
        }
    }

    assert_eq!(reserved, 5);
    assert_eq!(refused, 7);
    assert_eq!(store.bags_available().await, 0);
}

#[tokio::test]
async fn held_writer_lock_surfaces_busy() {
    let store = TestStore::file_backed(2, Duration::from_millis(200)).await;
    let unit = store.receive(SHIRT_L, 1).await.remove(0);

    let mut blocker = store.db.pool().begin().await.unwrap();
    sqlx::query("UPDATE write_guard SET generation = generation + 1 WHERE id = 1")
        .execute(&mut *blocker)
        .await
        .unwrap();

    let err = store
        .db
        .units()
        .try_claim(&unit.code, SHIRT_L, None)
        .await
        .unwrap_err();
    assert!(err.is_busy(), "expected Busy, got {err}");
    assert!(err.as_domain().is_some_and(CoreError::is_retryable));

    blocker.rollback().await.unwrap();

    // Nothing was applied, the retry goes through
    assert_eq!(store.tag_of(&unit.code).await, UnitTag::New);
    store
        .db
        .units()
        .try_claim(&unit.code, SHIRT_L, None)
        .await
        .unwrap();
}
