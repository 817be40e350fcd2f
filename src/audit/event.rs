//! Audit event schema

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::AaaError;

/// What kind of security-relevant action an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "auth.success")]
    AuthSuccess,
    #[serde(rename = "auth.failure")]
    AuthFailure,
    #[serde(rename = "token.issued")]
    TokenIssued,
    #[serde(rename = "token.revoked")]
    TokenRevoked,
    #[serde(rename = "token.refreshed")]
    TokenRefreshed,
    #[serde(rename = "authz.granted")]
    AuthzGranted,
    #[serde(rename = "authz.denied")]
    AuthzDenied,
    #[serde(rename = "spiffe.auth")]
    SpiffeAuth,
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.destroyed")]
    SessionDestroyed,
}

impl EventType {
    pub const ALL: [EventType; 10] = [
        EventType::AuthSuccess,
        EventType::AuthFailure,
        EventType::TokenIssued,
        EventType::TokenRevoked,
        EventType::TokenRefreshed,
        EventType::AuthzGranted,
        EventType::AuthzDenied,
        EventType::SpiffeAuth,
        EventType::SessionCreated,
        EventType::SessionDestroyed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AuthSuccess => "auth.success",
            EventType::AuthFailure => "auth.failure",
            EventType::TokenIssued => "token.issued",
            EventType::TokenRevoked => "token.revoked",
            EventType::TokenRefreshed => "token.refreshed",
            EventType::AuthzGranted => "authz.granted",
            EventType::AuthzDenied => "authz.denied",
            EventType::SpiffeAuth => "spiffe.auth",
            EventType::SessionCreated => "session.created",
            EventType::SessionDestroyed => "session.destroyed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = AaaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| AaaError::Config(format!("unknown audit event type {s:?}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

/// A structured record of a security-relevant action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Random UUID
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Who acted, e.g. a user id or SPIFFE ID
    pub subject: String,
    /// What was attempted, e.g. `rpc` or `login`
    pub action: String,
    /// What was acted upon, e.g. a procedure path
    pub resource: String,
    pub outcome: Outcome,
}

impl AuditEvent {
    /// New event with a fresh id stamped with the current UTC time.
    pub fn new(
        event_type: EventType,
        subject: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
        outcome: Outcome,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type,
            subject: subject.into(),
            action: action.into(),
            resource: resource.into(),
            outcome,
        }
    }

    /// Flat string map handed to sinks.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::with_capacity(7);
        map.insert("id".into(), Value::from(self.id.clone()));
        map.insert(
            "timestamp".into(),
            Value::from(self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)),
        );
        map.insert("type".into(), Value::from(self.event_type.as_str()));
        map.insert("subject".into(), Value::from(self.subject.clone()));
        map.insert("action".into(), Value::from(self.action.clone()));
        map.insert("resource".into(), Value::from(self.resource.clone()));
        map.insert("outcome".into(), Value::from(self.outcome.as_str()));
        map
    }
}
