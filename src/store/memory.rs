//! In-process store.
//!
//! All state sits behind one `parking_lot::Mutex`, so every operation is
//! trivially atomic and serializable. Nothing is awaited while the lock is
//! held. Used by tests and by `serve --ephemeral`.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::ledger::types::settle;
use crate::ledger::{
    CreditBalance, CreditKind, Direction, IdempotencyToken, LedgerEntry, LedgerMutation,
    LedgerStore, MutationOutcome, TenantId,
};
use crate::webhook::dedup::{EventStore, NewWebhookEvent, RecordOutcome, StoredEvent};
use crate::webhook::events::ObjectRef;
use crate::webhook::records::{
    transition_record, AuditContext, AuditEntry, NewRecord, RecordStore, TrackedRecord,
    Transition, TransitionOutcome,
};

type EntryKey = (TenantId, CreditKind, IdempotencyToken, Direction);

#[derive(Default)]
struct MemoryState {
    balances: HashMap<(TenantId, CreditKind), u64>,
    entries: Vec<LedgerEntry>,
    entry_keys: HashSet<EntryKey>,
    events: HashMap<String, StoredEvent>,
    event_order: Vec<String>,
    records: HashMap<String, TrackedRecord>,
    references: HashMap<ObjectRef, String>,
    audit: Vec<AuditEntry>,
    accounts: HashMap<String, TenantId>,
}

/// Store holding everything in memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn apply(&self, mutation: LedgerMutation) -> Result<MutationOutcome, StoreError> {
        let mut state = self.state.lock();
        let balance_key = (mutation.tenant_id.clone(), mutation.kind);
        let current = state.balances.get(&balance_key).copied().unwrap_or(0);

        let entry_key = (
            mutation.tenant_id.clone(),
            mutation.kind,
            mutation.token.clone(),
            mutation.direction,
        );
        if state.entry_keys.contains(&entry_key) {
            return Ok(MutationOutcome::Replayed { balance: current });
        }

        let next = match settle(current, mutation.direction, mutation.amount) {
            Ok(Some(next)) => next,
            Ok(None) => return Ok(MutationOutcome::Insufficient { balance: current }),
            Err(()) => {
                return Err(StoreError::BalanceOverflow {
                    tenant: mutation.tenant_id.to_string(),
                    kind: mutation.kind,
                })
            }
        };

        state.entry_keys.insert(entry_key);
        state.entries.push(mutation.to_entry(Utc::now()));
        state.balances.insert(balance_key, next);
        Ok(MutationOutcome::Applied { balance: next })
    }

    async fn balance(&self, tenant: &TenantId, kind: CreditKind) -> Result<u64, StoreError> {
        let state = self.state.lock();
        Ok(state
            .balances
            .get(&(tenant.clone(), kind))
            .copied()
            .unwrap_or(0))
    }

    async fn balances(&self, tenant: &TenantId) -> Result<Vec<CreditBalance>, StoreError> {
        let state = self.state.lock();
        let mut balances: Vec<CreditBalance> = state
            .balances
            .iter()
            .filter(|((t, _), _)| t == tenant)
            .map(|((t, kind), balance)| CreditBalance {
                tenant_id: t.clone(),
                kind: *kind,
                balance: *balance,
            })
            .collect();
        balances.sort_by_key(|b| b.kind);
        Ok(balances)
    }

    async fn entries(
        &self,
        tenant: &TenantId,
        kind: CreditKind,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .entries
            .iter()
            .filter(|e| &e.tenant_id == tenant && e.kind == kind)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn record_if_new(&self, event: NewWebhookEvent) -> Result<RecordOutcome, StoreError> {
        let mut state = self.state.lock();
        if let Some(existing) = state.events.get(&event.event_id) {
            return Ok(RecordOutcome {
                is_new: false,
                event: existing.clone(),
            });
        }

        let stored = StoredEvent::from(event);
        state.event_order.push(stored.event_id.clone());
        state.events.insert(stored.event_id.clone(), stored.clone());
        Ok(RecordOutcome {
            is_new: true,
            event: stored,
        })
    }

    async fn mark_matched(
        &self,
        event_id: &str,
        record_id: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        match state.events.get_mut(event_id) {
            Some(event) if !event.matched => {
                event.matched = true;
                event.matched_record_id = Some(record_id.to_string());
                event.processed_at = Some(processed_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<StoredEvent>, StoreError> {
        Ok(self.state.lock().events.get(event_id).cloned())
    }

    async fn list_unmatched(&self, limit: usize) -> Result<Vec<StoredEvent>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .event_order
            .iter()
            .filter_map(|id| state.events.get(id))
            .filter(|event| !event.matched)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create_record(&self, record: NewRecord) -> Result<TrackedRecord, StoreError> {
        let mut state = self.state.lock();
        if let Some(existing) = state
            .references
            .get(&record.reference)
            .and_then(|id| state.records.get(id))
        {
            return Ok(existing.clone());
        }

        let reference = record.reference.clone();
        let created = record.into_record(Utc::now());
        state.references.insert(reference, created.id.clone());
        state.records.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn find_record(
        &self,
        reference: &ObjectRef,
    ) -> Result<Option<TrackedRecord>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .references
            .get(reference)
            .and_then(|id| state.records.get(id))
            .cloned())
    }

    async fn get_record(&self, record_id: &str) -> Result<Option<TrackedRecord>, StoreError> {
        Ok(self.state.lock().records.get(record_id).cloned())
    }

    async fn apply_transition(
        &self,
        record_id: &str,
        transition: &Transition,
        context: &AuditContext,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut state = self.state.lock();
        let record = state
            .records
            .get_mut(record_id)
            .ok_or_else(|| StoreError::NotFound(format!("record {record_id}")))?;

        let audit = transition_record(record, transition, context);
        let record = record.clone();
        state.audit.push(audit.clone());
        Ok(TransitionOutcome { record, audit })
    }

    async fn audit_trail(&self, record_id: &str) -> Result<Vec<AuditEntry>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .audit
            .iter()
            .filter(|a| a.record_id == record_id)
            .cloned()
            .collect())
    }

    async fn register_account(
        &self,
        account_id: &str,
        tenant: &TenantId,
    ) -> Result<(), StoreError> {
        self.state
            .lock()
            .accounts
            .insert(account_id.to_string(), tenant.clone());
        Ok(())
    }

    async fn tenant_for_account(&self, account_id: &str) -> Result<Option<TenantId>, StoreError> {
        Ok(self.state.lock().accounts.get(account_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::events::ObjectType;
    use crate::webhook::records::{RecordKind, RecordStatus};

    fn mutation(direction: Direction, amount: u64, token: &str) -> LedgerMutation {
        LedgerMutation {
            tenant_id: TenantId::new("acme"),
            kind: CreditKind::LeadSearch,
            direction,
            amount,
            token: token.into(),
            description: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_replay_and_insufficient() {
        let store = MemoryStore::new();
        let outcome = store.apply(mutation(Direction::Credit, 10, "grant")).await.unwrap();
        assert_eq!(outcome, MutationOutcome::Applied { balance: 10 });

        let outcome = store.apply(mutation(Direction::Debit, 4, "t1")).await.unwrap();
        assert_eq!(outcome, MutationOutcome::Applied { balance: 6 });
        let outcome = store.apply(mutation(Direction::Debit, 4, "t1")).await.unwrap();
        assert_eq!(outcome, MutationOutcome::Replayed { balance: 6 });

        let outcome = store.apply(mutation(Direction::Debit, 7, "t2")).await.unwrap();
        assert_eq!(outcome, MutationOutcome::Insufficient { balance: 6 });

        let entries = store.entries(&"acme".into(), CreditKind::LeadSearch).await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_overflow_is_an_error() {
        let store = MemoryStore::new();
        store
            .apply(mutation(Direction::Credit, i64::MAX as u64, "a"))
            .await
            .unwrap();
        let err = store.apply(mutation(Direction::Credit, 1, "b")).await.unwrap_err();
        assert!(matches!(err, StoreError::BalanceOverflow { .. }));
    }

    #[tokio::test]
    async fn test_create_record_is_idempotent_per_reference() {
        let store = MemoryStore::new();
        let new = NewRecord {
            kind: RecordKind::CampaignLead,
            tenant_id: TenantId::new("acme"),
            reference: ObjectRef::new(ObjectType::Message, "m1"),
            status: RecordStatus::Sent,
            sent_at: None,
        };
        let first = store.create_record(new.clone()).await.unwrap();
        let second = store.create_record(new).await.unwrap();
        assert_eq!(first.id, second.id);

        let found = store
            .find_record(&ObjectRef::new(ObjectType::Message, "m1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, first.id);
        assert!(store
            .find_record(&ObjectRef::new(ObjectType::Invitation, "m1"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_apply_transition_unknown_record() {
        let store = MemoryStore::new();
        let context = AuditContext {
            event_id: "e".into(),
            event_type: "message.sent".into(),
            correlation_id: "c".into(),
        };
        let transition = Transition::Fail {
            error: "x".into(),
            at: Utc::now(),
        };
        let err = store
            .apply_transition("missing", &transition, &context)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
