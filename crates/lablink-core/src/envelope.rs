//! The standard message envelope and its wire codec.
//!
//! Every payload exchanged between the coordinator and device agents is an
//! `Envelope`: a command (`action` + `params`) or a response/event
//! (`success` + optional `error`/`error_code` + `data`), always carrying a
//! caller-generated `req_id`, the acting party and a UTC timestamp.
//!
//! The wire format is compact JSON. Responses are correlated back to
//! commands by `req_id`; duplicate responses for an already-resolved id
//! must be tolerated by every consumer (the transport is at-least-once).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, ErrorCode, Result};

/// Maximum serialized size of `params` or `data`, in bytes.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Maximum length of the `action` field and the actor string form.
const MAX_NAME_LEN: usize = 50;

/// The party a message acts on behalf of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    /// External API caller.
    Api,
    /// The coordinator itself (scheduled or cascaded actions).
    Orchestrator,
    /// Interactive user.
    User,
    /// Internal system activity (sweeps, lifecycle).
    System,
}

impl Actor {
    /// Wire string for this actor.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Orchestrator => "orchestrator",
            Self::User => "user",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Standard message envelope.
///
/// A command envelope has a non-empty `action`; a response envelope has
/// `success` set. The two field groups are never populated together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Caller-generated correlation id.
    pub req_id: Uuid,
    /// Acting party.
    pub actor: Actor,
    /// UTC timestamp at creation.
    pub ts: DateTime<Utc>,

    // Command fields
    /// Command action name (commands only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Command parameters (commands only).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,

    // Response fields
    /// Outcome flag (responses only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    /// Human-readable error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    /// Response payload.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

impl Envelope {
    /// Build a command envelope with a fresh `req_id`.
    pub fn command(actor: Actor, action: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            req_id: Uuid::new_v4(),
            actor,
            ts: Utc::now(),
            action: Some(action.into()),
            params,
            success: None,
            error: None,
            error_code: None,
            data: Map::new(),
        }
    }

    /// Build a successful response for an earlier command.
    pub fn response(req_id: Uuid, actor: Actor, data: Map<String, Value>) -> Self {
        Self {
            req_id,
            actor,
            ts: Utc::now(),
            action: None,
            params: Map::new(),
            success: Some(true),
            error: None,
            error_code: None,
            data,
        }
    }

    /// Build an error response for an earlier command.
    pub fn error(req_id: Uuid, actor: Actor, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            req_id,
            actor,
            ts: Utc::now(),
            action: None,
            params: Map::new(),
            success: Some(false),
            error: Some(message.into()),
            error_code: Some(code),
            data: Map::new(),
        }
    }

    /// Whether this envelope is a command.
    pub fn is_command(&self) -> bool {
        self.action.as_deref().is_some_and(|a| !a.is_empty())
    }

    /// Whether this envelope is a response or event with an outcome.
    pub fn is_response(&self) -> bool {
        self.success.is_some()
    }

    /// Serialize to compact JSON bytes, validating first.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse and validate an envelope from raw payload bytes.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let envelope: Self = serde_json::from_slice(payload)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Validate structural invariants and field constraints.
    pub fn validate(&self) -> Result<()> {
        match (&self.action, self.success) {
            (Some(action), None) => {
                if action.is_empty() {
                    return Err(Error::InvalidParams("action must not be empty".into()));
                }
                if action.len() > MAX_NAME_LEN {
                    return Err(Error::InvalidParams(format!(
                        "action exceeds {} chars",
                        MAX_NAME_LEN
                    )));
                }
                if !action
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                {
                    return Err(Error::InvalidParams(format!(
                        "action contains invalid characters: {}",
                        action
                    )));
                }
            }
            (None, Some(_)) => {}
            (Some(_), Some(_)) => {
                return Err(Error::InvalidParams(
                    "envelope carries both command and response fields".into(),
                ));
            }
            (None, None) => {
                return Err(Error::InvalidParams(
                    "envelope carries neither action nor success".into(),
                ));
            }
        }

        check_payload_size("params", &self.params)?;
        check_payload_size("data", &self.data)?;
        Ok(())
    }
}

fn check_payload_size(field: &str, map: &Map<String, Value>) -> Result<()> {
    if map.is_empty() {
        return Ok(());
    }
    let size = serde_json::to_vec(map)?.len();
    if size > MAX_PAYLOAD_BYTES {
        return Err(Error::InvalidParams(format!(
            "{} exceeds {} bytes (got {})",
            field, MAX_PAYLOAD_BYTES, size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_command_roundtrip() {
        let env = Envelope::command(
            Actor::Api,
            "start",
            params(&[("source", json!("cam-3")), ("fps", json!(30))]),
        );

        let bytes = env.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();

        assert_eq!(decoded.req_id, env.req_id);
        assert_eq!(decoded.actor, Actor::Api);
        assert!(decoded.is_command());
        assert!(!decoded.is_response());
        assert_eq!(decoded.action.as_deref(), Some("start"));
        assert_eq!(decoded.params["fps"], json!(30));
    }

    #[test]
    fn test_response_correlates_by_req_id() {
        let cmd = Envelope::command(Actor::User, "ping", Map::new());
        let resp = Envelope::response(cmd.req_id, Actor::System, Map::new());

        assert_eq!(resp.req_id, cmd.req_id);
        assert!(resp.is_response());
        assert_eq!(resp.success, Some(true));
    }

    #[test]
    fn test_error_envelope_carries_code() {
        let cmd = Envelope::command(Actor::Api, "start", Map::new());
        let err = Envelope::error(cmd.req_id, Actor::Orchestrator, ErrorCode::ResourceBusy, "held");

        let bytes = err.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.success, Some(false));
        assert_eq!(decoded.error_code, Some(ErrorCode::ResourceBusy));
        assert_eq!(decoded.error.as_deref(), Some("held"));
    }

    #[test]
    fn test_empty_action_rejected() {
        let mut env = Envelope::command(Actor::Api, "start", Map::new());
        env.action = Some(String::new());
        assert!(matches!(env.validate(), Err(Error::InvalidParams(_))));
    }

    #[test]
    fn test_bad_action_charset_rejected() {
        let env = Envelope::command(Actor::Api, "rm -rf", Map::new());
        assert!(matches!(env.validate(), Err(Error::InvalidParams(_))));
    }

    #[test]
    fn test_overlong_action_rejected() {
        let env = Envelope::command(Actor::Api, "a".repeat(51), Map::new());
        assert!(matches!(env.validate(), Err(Error::InvalidParams(_))));
    }

    #[test]
    fn test_oversized_params_rejected() {
        let big = "x".repeat(MAX_PAYLOAD_BYTES + 1);
        let env = Envelope::command(Actor::Api, "start", params(&[("blob", json!(big))]));
        assert!(matches!(env.validate(), Err(Error::InvalidParams(_))));
    }

    #[test]
    fn test_neither_command_nor_response_rejected() {
        let raw = json!({
            "req_id": Uuid::new_v4(),
            "actor": "api",
            "ts": Utc::now(),
        });
        let bytes = serde_json::to_vec(&raw).unwrap();
        assert!(Envelope::decode(&bytes).is_err());
    }

    #[test]
    fn test_wire_field_names() {
        let env = Envelope::command(Actor::Orchestrator, "set-input", Map::new());
        let value: Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();

        assert!(value.get("req_id").is_some());
        assert_eq!(value["actor"], json!("orchestrator"));
        assert_eq!(value["action"], json!("set-input"));
        // Response-only fields stay off the wire for commands.
        assert!(value.get("success").is_none());
        assert!(value.get("data").is_none());
    }
}
