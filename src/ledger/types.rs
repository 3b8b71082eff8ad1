//! Ledger data types
//!
//! Strongly-typed representations of tenants, credit kinds, idempotency tokens
//! and the append-only ledger entries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tenant (workspace) identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Wrap a tenant identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is empty (never valid for a ledger mutation)
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Metered credit kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditKind {
    /// Paid lead searches on the actor platform
    LeadSearch,
    /// Phone number reveals through the enrichment API
    PhoneReveal,
}

impl CreditKind {
    /// All kinds, in display order
    pub const ALL: [CreditKind; 2] = [CreditKind::LeadSearch, CreditKind::PhoneReveal];

    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeadSearch => "lead_search",
            Self::PhoneReveal => "phone_reveal",
        }
    }
}

impl fmt::Display for CreditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CreditKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lead_search" | "lead-search" | "lead_search_credit" | "lead-search-credit" => {
                Ok(Self::LeadSearch)
            }
            "phone_reveal" | "phone-reveal" | "phone_reveal_credit" | "phone-reveal-credit" => {
                Ok(Self::PhoneReveal)
            }
            other => Err(format!("unknown credit kind: {other}")),
        }
    }
}

/// Caller-generated token that makes a ledger mutation idempotent.
///
/// A debit and the credit that rolls it back carry the SAME token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    /// Fresh random token (UUID v4)
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the token is blank
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdempotencyToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for IdempotencyToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Direction of a ledger mutation.
///
/// Part of the idempotency key, so a debit and its rollback credit with the
/// same token are two distinct entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Balance decreases
    Debit,
    /// Balance increases
    Credit,
}

impl Direction {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debit => "debit",
            Self::Credit => "credit",
        }
    }

    /// Signed delta for an amount moving in this direction
    pub fn signed(&self, amount: u64) -> i64 {
        let amount = i64::try_from(amount).unwrap_or(i64::MAX);
        match self {
            Self::Debit => -amount,
            Self::Credit => amount,
        }
    }
}

/// Current balance of one credit kind for one tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBalance {
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Credit kind
    pub kind: CreditKind,
    /// Remaining credits (never negative)
    pub balance: u64,
}

/// Append-only ledger row. Created once per accepted mutation, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Credit kind
    pub kind: CreditKind,
    /// Signed balance change
    pub delta: i64,
    /// Token the mutation was submitted with
    pub idempotency_token: IdempotencyToken,
    /// Human-readable reason
    pub description: String,
    /// When the entry was committed
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Direction implied by the sign of `delta`
    pub fn direction(&self) -> Direction {
        if self.delta < 0 {
            Direction::Debit
        } else {
            Direction::Credit
        }
    }
}

/// A validated request to move credits, handed to a [`LedgerStore`](super::LedgerStore)
#[derive(Debug, Clone)]
pub struct LedgerMutation {
    pub tenant_id: TenantId,
    pub kind: CreditKind,
    pub direction: Direction,
    /// Always positive; sign comes from `direction`
    pub amount: u64,
    pub token: IdempotencyToken,
    pub description: String,
}

impl LedgerMutation {
    /// Build the entry this mutation appends when accepted
    pub fn to_entry(&self, created_at: DateTime<Utc>) -> LedgerEntry {
        LedgerEntry {
            tenant_id: self.tenant_id.clone(),
            kind: self.kind,
            delta: self.direction.signed(self.amount),
            idempotency_token: self.token.clone(),
            description: self.description.clone(),
            created_at,
        }
    }
}

/// Result of applying a [`LedgerMutation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// New entry appended, balance changed
    Applied {
        /// Balance after the mutation
        balance: u64,
    },
    /// An entry with this token and direction already existed; nothing changed
    Replayed {
        /// Current balance
        balance: u64,
    },
    /// Debit refused; no entry written
    Insufficient {
        /// Current balance
        balance: u64,
    },
}

impl MutationOutcome {
    /// The boolean the quota consumer contract returns
    pub fn accepted(&self) -> bool {
        !matches!(self, Self::Insufficient { .. })
    }

    /// Balance observed by the mutation
    pub fn balance(&self) -> u64 {
        match *self {
            Self::Applied { balance } | Self::Replayed { balance } | Self::Insufficient { balance } => {
                balance
            }
        }
    }
}

/// Balance arithmetic shared by every store backend.
///
/// Returns `Ok(None)` when a debit exceeds the balance and `Err(())` when a
/// credit would overflow what the store can hold.
pub(crate) fn settle(current: u64, direction: Direction, amount: u64) -> Result<Option<u64>, ()> {
    match direction {
        Direction::Debit => Ok(current.checked_sub(amount)),
        Direction::Credit => match current.checked_add(amount) {
            Some(next) if next <= i64::MAX as u64 => Ok(Some(next)),
            _ => Err(()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credit_kind_parsing() {
        assert_eq!("lead_search".parse::<CreditKind>().unwrap(), CreditKind::LeadSearch);
        assert_eq!(
            "phone-reveal-credit".parse::<CreditKind>().unwrap(),
            CreditKind::PhoneReveal
        );
        assert!("sms".parse::<CreditKind>().is_err());
    }

    #[test]
    fn test_generated_tokens_are_unique() {
        let a = IdempotencyToken::generate();
        let b = IdempotencyToken::generate();
        assert_ne!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn test_direction_sign() {
        assert_eq!(Direction::Debit.signed(5), -5);
        assert_eq!(Direction::Credit.signed(5), 5);
    }

    #[test]
    fn test_settle() {
        assert_eq!(settle(10, Direction::Debit, 5), Ok(Some(5)));
        assert_eq!(settle(10, Direction::Debit, 10), Ok(Some(0)));
        assert_eq!(settle(5, Direction::Debit, 20), Ok(None));
        assert_eq!(settle(5, Direction::Credit, 5), Ok(Some(10)));
        assert_eq!(settle(i64::MAX as u64, Direction::Credit, 1), Err(()));
    }

    #[test]
    fn test_entry_direction_from_delta() {
        let mutation = LedgerMutation {
            tenant_id: TenantId::new("t"),
            kind: CreditKind::LeadSearch,
            direction: Direction::Debit,
            amount: 3,
            token: IdempotencyToken::from("tok"),
            description: "search".to_string(),
        };
        let entry = mutation.to_entry(Utc::now());
        assert_eq!(entry.delta, -3);
        assert_eq!(entry.direction(), Direction::Debit);
    }

    #[test]
    fn test_outcome_accepted() {
        assert!(MutationOutcome::Applied { balance: 1 }.accepted());
        assert!(MutationOutcome::Replayed { balance: 1 }.accepted());
        assert!(!MutationOutcome::Insufficient { balance: 1 }.accepted());
    }
}
