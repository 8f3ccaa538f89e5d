//! Event row, codec and error types shared by every `qbus-*` crate.
//!
//! This crate has no I/O: it defines the persisted shape of a queue row
//! (`EventRow`), the pluggable serialization contract (`EventCodec`), and
//! the error taxonomy the rest of the workspace reports through.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod backoff;

/// Lifecycle state of a queue row (spec §3: AVAILABLE -> IN_PROCESSING -> PROCESSED/FAILED).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessingState {
    Available,
    InProcessing,
    Processed,
    Failed,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Available => "AVAILABLE",
            ProcessingState::InProcessing => "IN_PROCESSING",
            ProcessingState::Processed => "PROCESSED",
            ProcessingState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, EventBusError> {
        match s {
            "AVAILABLE" => Ok(ProcessingState::Available),
            "IN_PROCESSING" => Ok(ProcessingState::InProcessing),
            "PROCESSED" => Ok(ProcessingState::Processed),
            "FAILED" => Ok(ProcessingState::Failed),
            other => Err(EventBusError::Decode(format!(
                "invalid processing_state: {other}"
            ))),
        }
    }

    /// Terminal states live in the history table (spec §3 invariant 3).
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingState::Processed | ProcessingState::Failed)
    }
}

/// A persisted queue row (spec §3 "Event row (persistent)").
#[derive(Debug, Clone)]
pub struct EventRow {
    pub record_id: i64,
    pub class_name: String,
    pub event_json: Value,
    pub user_token: Uuid,
    pub search_key1: Option<i64>,
    pub search_key2: i64,
    pub created_date: DateTime<Utc>,
    pub creator_name: String,
    pub processing_owner: Option<String>,
    pub processing_available_date: Option<DateTime<Utc>>,
    pub processing_state: ProcessingState,
    pub error_count: i32,
}

/// A not-yet-persisted row, produced by `EventCodec::encode` at publish time.
#[derive(Debug, Clone)]
pub struct NewEventRow {
    pub class_name: String,
    pub event_json: Value,
    pub user_token: Uuid,
    pub search_key1: Option<i64>,
    pub search_key2: i64,
    pub creator_name: String,
}

/// Two opaque 64-bit correlation handles used by inspection queries (spec §3, §GLOSSARY).
///
/// `search_key1` is optional: when absent, selectors filter on `search_key2` only
/// (spec §4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SearchKeys {
    pub search_key1: Option<i64>,
    pub search_key2: i64,
}

impl SearchKeys {
    pub fn new(search_key2: i64) -> Self {
        Self {
            search_key1: None,
            search_key2,
        }
    }

    pub fn with_key1(mut self, search_key1: i64) -> Self {
        self.search_key1 = Some(search_key1);
        self
    }
}

/// Pluggable payload (de)serialization (spec §4.A).
///
/// The codec must be deterministic: re-encoding a decoded event yields
/// bytewise-equivalent JSON under the same codec configuration, so that row
/// inspection remains meaningful (spec §4.A).
pub trait EventCodec: Send + Sync {
    fn encode_value<T: Serialize>(&self, event: &T) -> Result<Value, EventBusError>;
    fn decode_value<T: DeserializeOwned>(&self, json: &Value) -> Result<T, EventBusError>;
}

/// Default codec: `serde_json`, used exactly as stored in `event_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEventCodec;

impl EventCodec for JsonEventCodec {
    fn encode_value<T: Serialize>(&self, event: &T) -> Result<Value, EventBusError> {
        serde_json::to_value(event).map_err(|e| EventBusError::Encoding(e.to_string()))
    }

    fn decode_value<T: DeserializeOwned>(&self, json: &Value) -> Result<T, EventBusError> {
        serde_json::from_value(json.clone()).map_err(|e| EventBusError::Decode(e.to_string()))
    }
}

/// Error taxonomy (spec §7 "Error kinds").
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    /// Payload could not be serialized for publish.
    #[error("encoding failure: {0}")]
    Encoding(String),

    /// `class_name` unresolvable to a decoder, or malformed JSON.
    #[error("decode failure: {0}")]
    Decode(String),

    /// Underlying storage error propagated from the DAO port.
    #[error("dao failure: {0}")]
    Dao(String),

    /// A registered handler raised an exception during dispatch; the first
    /// underlying cause is carried (spec §4.D).
    #[error("handler failure: {0}")]
    Handler(String),

    /// `post`/`register`/`unregister` called while the bus is not STARTED
    /// (spec §4.E, §7 "Lifecycle misuse").
    #[error("lifecycle misuse: {0}")]
    LifecycleMisuse(String),
}
