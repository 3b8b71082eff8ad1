//! Provider Event Types
//!
//! Typed taxonomy of inbound provider events and the per-provider adapters
//! that turn loosely-structured webhook JSON into one normalized
//! [`InboundEvent`]. All field-name guessing lives in this file; the
//! deduplicator and reconciler only ever see the normalized envelope.
//!
//! Two providers deliver webhooks:
//!
//! - **messaging**: the unified messaging provider (WhatsApp/LinkedIn/Email).
//!   Envelope roughly `{event|type, id?, data: {account_id, message_id|id, ...}}`.
//! - **actor**: the scraping/enrichment actor platform, notifying when a run
//!   started by a metered action finishes.
//!   Envelope `{eventType, eventData: {actorRunId}, resource: {id, status}}`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::WebhookError;

/// Webhook source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Unified messaging provider
    Messaging,
    /// Scraping/enrichment actor platform
    Actor,
}

impl Provider {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Messaging => "messaging",
            Self::Actor => "actor",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "messaging" => Ok(Self::Messaging),
            "actor" => Ok(Self::Actor),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// Kind of provider object an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Message,
    Invitation,
    /// Actor platform run
    Run,
    Unknown,
}

impl ObjectType {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Invitation => "invitation",
            Self::Run => "run",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "invitation" => Ok(Self::Invitation),
            "run" => Ok(Self::Run),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown object type: {other}")),
        }
    }
}

/// Event kinds we act on.
///
/// The set of raw provider event types is open: anything unrecognised parses
/// to [`EventKind::Unknown`] and is stored but never acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // Message events
    MessageSent,
    MessageDelivered,
    MessageSeen,
    MessageReplied,
    MessageFailed,

    // Invitation events
    InvitationSent,
    InvitationAccepted,
    InvitationFailed,

    // Actor run events
    RunSucceeded,
    RunFailed,

    Unknown,
}

impl FromStr for EventKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "message.sent" | "message_sent" => Self::MessageSent,
            "message.delivered" | "message_delivered" => Self::MessageDelivered,
            "message.seen" | "message.read" | "message_read" | "message_seen" => {
                Self::MessageSeen
            }
            "message.replied" | "message_replied" => Self::MessageReplied,
            "message.failed" | "message_failed" => Self::MessageFailed,
            "invitation.sent" | "invitation_sent" => Self::InvitationSent,
            "invitation.accepted" | "invitation_accepted" | "new_relation" => {
                Self::InvitationAccepted
            }
            "invitation.failed" | "invitation_failed" => Self::InvitationFailed,
            "ACTOR.RUN.SUCCEEDED" => Self::RunSucceeded,
            "ACTOR.RUN.FAILED" | "ACTOR.RUN.TIMED_OUT" | "ACTOR.RUN.ABORTED" => Self::RunFailed,
            _ => Self::Unknown,
        })
    }
}

impl EventKind {
    /// Parse a raw provider event type. Never fails.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse() {
            Ok(kind) => kind,
            Err(never) => match never {},
        }
    }

    /// Canonical name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageSent => "message.sent",
            Self::MessageDelivered => "message.delivered",
            Self::MessageSeen => "message.seen",
            Self::MessageReplied => "message.replied",
            Self::MessageFailed => "message.failed",
            Self::InvitationSent => "invitation.sent",
            Self::InvitationAccepted => "invitation.accepted",
            Self::InvitationFailed => "invitation.failed",
            Self::RunSucceeded => "run.succeeded",
            Self::RunFailed => "run.failed",
            Self::Unknown => "unknown",
        }
    }

    /// Object type this kind refers to
    pub fn object_type(&self) -> ObjectType {
        match self {
            Self::MessageSent
            | Self::MessageDelivered
            | Self::MessageSeen
            | Self::MessageReplied
            | Self::MessageFailed => ObjectType::Message,
            Self::InvitationSent | Self::InvitationAccepted | Self::InvitationFailed => {
                ObjectType::Invitation
            }
            Self::RunSucceeded | Self::RunFailed => ObjectType::Run,
            Self::Unknown => ObjectType::Unknown,
        }
    }
}

/// Reference to a provider-side object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub object_type: ObjectType,
    pub object_id: String,
}

impl ObjectRef {
    pub fn new(object_type: ObjectType, object_id: impl Into<String>) -> Self {
        Self {
            object_type,
            object_id: object_id.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.object_id)
    }
}

/// Normalized inbound event
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    /// Provider event id, or a deterministic fallback when the provider sent none
    pub event_id: String,

    /// Whether `event_id` was derived rather than supplied
    pub derived_id: bool,

    pub provider: Provider,

    /// Raw event type exactly as delivered
    pub event_type: String,

    /// Parsed kind
    pub kind: EventKind,

    pub object_type: ObjectType,

    /// Provider message/invitation/run id
    pub object_id: Option<String>,

    /// Provider account the event belongs to (used for tenant resolution)
    pub account_id: Option<String>,

    /// Provider error text on failure events
    pub error: Option<String>,

    /// When the provider says the event happened
    pub occurred_at: Option<DateTime<Utc>>,

    /// Body exactly as delivered, kept for audit and replay
    pub raw_payload: String,
}

impl InboundEvent {
    /// Parse raw webhook bytes from the given provider
    pub fn from_bytes(provider: Provider, bytes: &[u8]) -> Result<Self, WebhookError> {
        let raw = std::str::from_utf8(bytes)
            .map_err(|e| WebhookError::InvalidPayload(format!("body is not UTF-8: {e}")))?;
        Self::from_raw(provider, raw)
    }

    /// Parse a stored body (used when replaying events)
    pub fn from_raw(provider: Provider, raw: &str) -> Result<Self, WebhookError> {
        let payload: Value =
            serde_json::from_str(raw).map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
        if !payload.is_object() {
            return Err(WebhookError::InvalidPayload(
                "webhook body is not a JSON object".to_string(),
            ));
        }
        let mut event = match provider {
            Provider::Messaging => parse_messaging(&payload)?,
            Provider::Actor => parse_actor(&payload)?,
        };
        event.raw_payload = raw.to_string();
        Ok(event)
    }

    /// Target reference, when the event names an object
    pub fn object_ref(&self) -> Option<ObjectRef> {
        self.object_id
            .as_ref()
            .map(|id| ObjectRef::new(self.object_type, id.clone()))
    }
}

// =============================================================================
// Messaging provider adapter
// =============================================================================

const MESSAGING_TYPE_FIELDS: &[&[&str]] = &[&["event"], &["type"], &["event_type"], &["data", "event"]];
const MESSAGING_ID_FIELDS: &[&[&str]] = &[&["event_id"], &["webhook_event_id"], &["data", "event_id"]];
const MESSAGING_ACCOUNT_FIELDS: &[&[&str]] = &[&["data", "account_id"], &["account_id"], &["data", "account", "id"]];
const MESSAGE_ID_FIELDS: &[&[&str]] = &[
    &["data", "message_id"],
    &["data", "provider_message_id"],
    &["data", "message", "id"],
    &["data", "id"],
    &["message_id"],
];
const INVITATION_ID_FIELDS: &[&[&str]] = &[
    &["data", "invitation_id"],
    &["data", "provider_invitation_id"],
    &["data", "invitation", "id"],
    &["data", "id"],
    &["invitation_id"],
];
const MESSAGING_ERROR_FIELDS: &[&[&str]] = &[
    &["data", "error"],
    &["data", "error_message"],
    &["data", "reason"],
    &["error"],
];
const MESSAGING_TIME_FIELDS: &[&[&str]] = &[&["data", "timestamp"], &["timestamp"], &["created_at"]];

fn parse_messaging(payload: &Value) -> Result<InboundEvent, WebhookError> {
    let event_type =
        first_string(payload, MESSAGING_TYPE_FIELDS).ok_or(WebhookError::MissingEventType)?;
    let kind = EventKind::parse(&event_type);

    let object_type = match kind.object_type() {
        ObjectType::Unknown => infer_object_type(&event_type),
        known => known,
    };
    let object_id = match object_type {
        ObjectType::Invitation => first_string(payload, INVITATION_ID_FIELDS),
        _ => first_string(payload, MESSAGE_ID_FIELDS),
    };

    let supplied_id = first_string(payload, MESSAGING_ID_FIELDS)
        .or_else(|| envelope_id(payload, object_id.as_deref()));
    let (event_id, derived_id) = match supplied_id {
        Some(id) => (id, false),
        None => (
            derive_event_id(Provider::Messaging, &event_type, object_id.as_deref(), payload),
            true,
        ),
    };

    Ok(InboundEvent {
        event_id,
        derived_id,
        provider: Provider::Messaging,
        kind,
        object_type,
        object_id,
        account_id: first_string(payload, MESSAGING_ACCOUNT_FIELDS),
        error: first_string(payload, MESSAGING_ERROR_FIELDS),
        occurred_at: first_timestamp(payload, MESSAGING_TIME_FIELDS),
        event_type,
        raw_payload: String::new(),
    })
}

/// Top-level `id`, trusted as the event id only when the object id lives in
/// a separate `data` object. In flat envelopes `id` is usually the message
/// id, shared by every event about that message.
fn envelope_id(payload: &Value, object_id: Option<&str>) -> Option<String> {
    if !payload.get("data").is_some_and(Value::is_object) {
        return None;
    }
    let id = first_string(payload, &[&["id"]])?;
    match object_id {
        Some(object_id) if object_id != id => Some(id),
        _ => None,
    }
}

fn infer_object_type(event_type: &str) -> ObjectType {
    let lower = event_type.to_ascii_lowercase();
    if lower.starts_with("message") {
        ObjectType::Message
    } else if lower.starts_with("invitation") {
        ObjectType::Invitation
    } else {
        ObjectType::Unknown
    }
}

// =============================================================================
// Actor platform adapter
// =============================================================================

const ACTOR_TYPE_FIELDS: &[&[&str]] = &[&["eventType"], &["event_type"], &["type"]];
const ACTOR_ID_FIELDS: &[&[&str]] = &[&["eventId"], &["event_id"], &["id"]];
const RUN_ID_FIELDS: &[&[&str]] = &[&["eventData", "actorRunId"], &["resource", "id"], &["runId"]];
const ACTOR_ERROR_FIELDS: &[&[&str]] = &[&["resource", "statusMessage"], &["resource", "status"]];
const ACTOR_TIME_FIELDS: &[&[&str]] = &[&["createdAt"], &["resource", "finishedAt"]];

fn parse_actor(payload: &Value) -> Result<InboundEvent, WebhookError> {
    let event_type =
        first_string(payload, ACTOR_TYPE_FIELDS).ok_or(WebhookError::MissingEventType)?;
    let kind = EventKind::parse(&event_type);
    let object_id = first_string(payload, RUN_ID_FIELDS);

    let (event_id, derived_id) = match first_string(payload, ACTOR_ID_FIELDS) {
        Some(id) => (id, false),
        None => (
            derive_event_id(Provider::Actor, &event_type, object_id.as_deref(), payload),
            true,
        ),
    };

    let error = if kind == EventKind::RunFailed {
        first_string(payload, ACTOR_ERROR_FIELDS).or_else(|| Some(event_type.clone()))
    } else {
        None
    };

    Ok(InboundEvent {
        event_id,
        derived_id,
        provider: Provider::Actor,
        kind,
        object_type: ObjectType::Run,
        object_id,
        account_id: None,
        error,
        occurred_at: first_timestamp(payload, ACTOR_TIME_FIELDS),
        event_type,
        raw_payload: String::new(),
    })
}

// =============================================================================
// Field helpers
// =============================================================================

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.get(key))
}

/// First non-empty value found under any of `paths`. Numbers are stringified;
/// objects are serialized (some providers send structured errors).
fn first_string(value: &Value, paths: &[&[&str]]) -> Option<String> {
    paths.iter().find_map(|path| match lookup(value, path)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        obj @ Value::Object(map) if !map.is_empty() => Some(obj.to_string()),
        _ => None,
    })
}

/// RFC 3339 strings, or unix seconds/milliseconds
fn first_timestamp(value: &Value, paths: &[&[&str]]) -> Option<DateTime<Utc>> {
    paths.iter().find_map(|path| match lookup(value, path)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            let raw = n.as_i64()?;
            if raw > 100_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        _ => None,
    })
}

/// Deterministic id for providers that do not send one.
///
/// Identical redeliveries hash to the same id, so the deduplicator still
/// catches them. `serde_json::Value` objects are key-sorted, so the
/// serialization is canonical.
fn derive_event_id(
    provider: Provider,
    event_type: &str,
    object_id: Option<&str>,
    payload: &Value,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(event_type.as_bytes());
    hasher.update(b"\n");
    hasher.update(object_id.unwrap_or("").as_bytes());
    hasher.update(b"\n");
    hasher.update(payload.to_string().as_bytes());
    format!("derived-{}", hex::encode(hasher.finalize()))
}
