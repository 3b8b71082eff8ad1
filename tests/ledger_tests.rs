//! Credit ledger behavior against both store backends.

use std::sync::Arc;

use leadflow_core::ledger::{CreditKind, IdempotencyToken, LedgerStore, QuotaConsumer, TenantId};
use leadflow_core::store::{MemoryStore, SqliteStore};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

const KIND: CreditKind = CreditKind::LeadSearch;

async fn seeded(store: Arc<dyn LedgerStore>, balance: u64) -> (QuotaConsumer, TenantId) {
    let quota = QuotaConsumer::new(store);
    let tenant = TenantId::new("acme");
    quota
        .credit(&tenant, KIND, balance, &"seed".into(), "initial grant")
        .await
        .unwrap();
    (quota, tenant)
}

async fn sqlite_store() -> (tempfile::TempDir, Arc<SqliteStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("ledger.db"));
    store.init().await.unwrap();
    (dir, Arc::new(store))
}

fn entries_with_token<'a>(
    history: &'a [leadflow_core::ledger::LedgerEntry],
    token: &str,
) -> Vec<&'a leadflow_core::ledger::LedgerEntry> {
    history
        .iter()
        .filter(|e| e.idempotency_token.as_str() == token)
        .collect()
}

async fn debit_replay_scenario(store: Arc<dyn LedgerStore>) {
    let (quota, tenant) = seeded(store, 10).await;
    let t1 = IdempotencyToken::from("t1");

    assert!(quota.debit(&tenant, KIND, 5, &t1, "search").await.unwrap());
    assert_eq!(quota.balance(&tenant, KIND).await.unwrap(), 5);

    // Identical replay: accepted again, no second charge
    assert!(quota.debit(&tenant, KIND, 5, &t1, "search").await.unwrap());
    assert_eq!(quota.balance(&tenant, KIND).await.unwrap(), 5);

    let history = quota.history(&tenant, KIND).await.unwrap();
    let t1_entries = entries_with_token(&history, "t1");
    assert_eq!(t1_entries.len(), 1);
    assert_eq!(t1_entries[0].delta, -5);
}

async fn insufficient_scenario(store: Arc<dyn LedgerStore>) {
    let (quota, tenant) = seeded(store, 5).await;

    let ok = quota.debit(&tenant, KIND, 20, &"t2".into(), "search").await.unwrap();
    assert!(!ok);
    assert_eq!(quota.balance(&tenant, KIND).await.unwrap(), 5);

    let history = quota.history(&tenant, KIND).await.unwrap();
    assert!(entries_with_token(&history, "t2").is_empty());
}

async fn rollback_scenario(store: Arc<dyn LedgerStore>) {
    let (quota, tenant) = seeded(store, 5).await;
    let t3 = IdempotencyToken::from("t3");

    assert!(quota.debit(&tenant, KIND, 5, &t3, "search").await.unwrap());
    assert_eq!(quota.balance(&tenant, KIND).await.unwrap(), 0);

    assert!(quota.credit(&tenant, KIND, 5, &t3, "rollback").await.unwrap());
    assert_eq!(quota.balance(&tenant, KIND).await.unwrap(), 5);

    // A retried rollback must not refund twice
    assert!(quota.credit(&tenant, KIND, 5, &t3, "rollback").await.unwrap());
    assert_eq!(quota.balance(&tenant, KIND).await.unwrap(), 5);

    let history = quota.history(&tenant, KIND).await.unwrap();
    let deltas: Vec<i64> = entries_with_token(&history, "t3").iter().map(|e| e.delta).collect();
    assert_eq!(deltas, vec![-5, 5]);
}

#[tokio::test]
async fn test_debit_replay_memory() {
    debit_replay_scenario(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn test_debit_replay_sqlite() {
    let (_dir, store) = sqlite_store().await;
    debit_replay_scenario(store).await;
}

#[tokio::test]
async fn test_insufficient_memory() {
    insufficient_scenario(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn test_insufficient_sqlite() {
    let (_dir, store) = sqlite_store().await;
    insufficient_scenario(store).await;
}

#[tokio::test]
async fn test_rollback_memory() {
    rollback_scenario(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn test_rollback_sqlite() {
    let (_dir, store) = sqlite_store().await;
    rollback_scenario(store).await;
}

async fn concurrent_debits(store: Arc<dyn LedgerStore>) {
    let (quota, tenant) = seeded(store, 10).await;

    let tasks: Vec<_> = (0..25)
        .map(|i| {
            let quota = quota.clone();
            let tenant = tenant.clone();
            tokio::spawn(async move {
                quota
                    .debit(&tenant, KIND, 1, &format!("race-{i}").into(), "race")
                    .await
                    .unwrap()
            })
        })
        .collect();

    let results = futures::future::join_all(tasks).await;
    let accepted = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();

    assert_eq!(accepted, 10);
    assert_eq!(quota.balance(&tenant, KIND).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_overdraft_under_concurrency_memory() {
    concurrent_debits(Arc::new(MemoryStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_overdraft_under_concurrency_sqlite() {
    let (_dir, store) = sqlite_store().await;
    concurrent_debits(store).await;
}

#[tokio::test]
async fn test_sqlite_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    {
        let store = SqliteStore::new(&path);
        store.init().await.unwrap();
        let quota = QuotaConsumer::new(Arc::new(store));
        quota
            .credit(&"acme".into(), KIND, 7, &"grant".into(), "grant")
            .await
            .unwrap();
    }

    let store = SqliteStore::new(&path);
    store.init().await.unwrap();
    let quota = QuotaConsumer::new(Arc::new(store));
    assert_eq!(quota.balance(&"acme".into(), KIND).await.unwrap(), 7);

    // Token already used before the restart
    let replay = quota
        .credit(&"acme".into(), KIND, 7, &"grant".into(), "grant")
        .await
        .unwrap();
    assert!(replay);
    assert_eq!(quota.balance(&"acme".into(), KIND).await.unwrap(), 7);
}

#[derive(Debug, Clone)]
enum Op {
    Debit { amount: u64, token: u8 },
    Credit { amount: u64, token: u8 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u64..20, 0u8..8).prop_map(|(amount, token)| Op::Debit { amount, token }),
        (1u64..20, 0u8..8).prop_map(|(amount, token)| Op::Credit { amount, token }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The balance always equals the sum of ledger deltas, never goes
    /// negative, and each (token, direction) appears at most once.
    #[test]
    fn prop_balance_matches_ledger(ops in proptest::collection::vec(op_strategy(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let quota = QuotaConsumer::new(Arc::new(MemoryStore::new()));
            let tenant = TenantId::new("prop");

            for op in &ops {
                match op {
                    Op::Debit { amount, token } => {
                        quota.debit(&tenant, KIND, *amount, &format!("tok-{token}").into(), "d").await.unwrap();
                    }
                    Op::Credit { amount, token } => {
                        quota.credit(&tenant, KIND, *amount, &format!("tok-{token}").into(), "c").await.unwrap();
                    }
                }
            }

            let balance = quota.balance(&tenant, KIND).await.unwrap();
            let history = quota.history(&tenant, KIND).await.unwrap();
            let sum: i64 = history.iter().map(|e| e.delta).sum();
            assert!(sum >= 0);
            assert_eq!(balance, sum as u64);

            let mut keys: Vec<(String, bool)> = history
                .iter()
                .map(|e| (e.idempotency_token.as_str().to_string(), e.delta < 0))
                .collect();
            let total = keys.len();
            keys.sort();
            keys.dedup();
            assert_eq!(keys.len(), total);
        });
    }
}
