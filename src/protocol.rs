//! Decoding of the events a data source receives, and the state machine that turns them into
//! [ChangeSet]s.
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::changeset::{ChangeSet, ChangeSetBuilder, ChangeSetError, IntentCode, Selector};
use crate::item::DataKind;
use crate::legacy::{LegacyData, LegacyDelete, LegacyPatch, LegacyPut};

pub const SERVER_INTENT: &str = "server-intent";
pub const PUT_OBJECT: &str = "put-object";
pub const DELETE_OBJECT: &str = "delete-object";
pub const PAYLOAD_TRANSFERRED: &str = "payload-transferred";
pub const HEART_BEAT: &str = "heart-beat";
pub const GOODBYE: &str = "goodbye";
pub const ERROR: &str = "error";

const LEGACY_PUT: &str = "put";
const LEGACY_PATCH: &str = "patch";
const LEGACY_DELETE: &str = "delete";

/// An event as it arrives from a transport: a name and a JSON payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RawEvent {
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        RawEvent {
            name: name.into(),
            data,
        }
    }

    /// Builds an event from a text payload, as delivered by server-sent events. An empty payload
    /// is read as null.
    pub fn from_text(name: impl Into<String>, data: &str) -> Result<Self, ProtocolError> {
        let name = name.into();
        let data = if data.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(data).map_err(|e| ProtocolError::InvalidData {
                event: name.clone(),
                source: Arc::new(e),
            })?
        };
        Ok(RawEvent { name, data })
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ServerIntent {
    pub payloads: Vec<Payload>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub target: i64,
    #[serde(alias = "intentCode")]
    pub code: IntentCode,
    #[serde(default)]
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct PutObject {
    pub kind: String,
    pub key: String,
    pub version: u64,
    pub object: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct DeleteObject {
    pub kind: String,
    pub key: String,
    pub version: u64,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Goodbye {
    #[serde(default)]
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub payload_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    ServerIntent(ServerIntent),
    PutObject(PutObject),
    DeleteObject(DeleteObject),
    PayloadTransferred(Selector),
    HeartBeat,
    Goodbye(Goodbye),
    Error(ErrorInfo),
    LegacyPut(LegacyPut),
    LegacyPatch(LegacyPatch),
    LegacyDelete(LegacyDelete),
    /// An event this library does not understand; it is skipped.
    Unknown(String),
}

impl Event {
    pub fn decode(raw: RawEvent) -> Result<Event, ProtocolError> {
        let RawEvent { name, data } = raw;
        let parse_error = |e: serde_json::Error| ProtocolError::InvalidData {
            event: name.clone(),
            source: Arc::new(e),
        };

        let event = match name.as_str() {
            SERVER_INTENT => Event::ServerIntent(serde_json::from_value(data).map_err(parse_error)?),
            PUT_OBJECT => Event::PutObject(serde_json::from_value(data).map_err(parse_error)?),
            DELETE_OBJECT => Event::DeleteObject(serde_json::from_value(data).map_err(parse_error)?),
            PAYLOAD_TRANSFERRED => {
                Event::PayloadTransferred(serde_json::from_value(data).map_err(parse_error)?)
            }
            HEART_BEAT => Event::HeartBeat,
            GOODBYE => Event::Goodbye(serde_json::from_value(data).map_err(parse_error)?),
            ERROR => Event::Error(serde_json::from_value(data).map_err(parse_error)?),
            LEGACY_PUT => Event::LegacyPut(serde_json::from_value(data).map_err(parse_error)?),
            LEGACY_PATCH => Event::LegacyPatch(serde_json::from_value(data).map_err(parse_error)?),
            LEGACY_DELETE => {
                Event::LegacyDelete(serde_json::from_value(data).map_err(parse_error)?)
            }
            _ => Event::Unknown(name.clone()),
        };
        Ok(event)
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed '{event}' event")]
    InvalidData {
        event: String,
        #[source]
        source: Arc<serde_json::Error>,
    },

    #[error(transparent)]
    ChangeSet(#[from] ChangeSetError),

    /// A polling response did not have the shape of an event envelope.
    #[error("invalid polling response: {0}")]
    InvalidEnvelope(String),

    /// The server reported an error instead of data.
    #[error("server reported an error: {0}")]
    ServerError(String),
}

/// What the caller should do after handing an event to [ProtocolHandler::handle].
#[derive(Clone, Debug, PartialEq)]
pub enum ProtocolAction {
    /// Keep reading.
    None,
    /// A transfer completed; apply it.
    ChangeSet(ChangeSet),
    /// The server is closing the connection.
    Goodbye(String),
    /// The server reported an error; pending changes were discarded.
    Error(ErrorInfo),
}

/// Consumes events in order, accumulating changes until a transfer completes.
#[derive(Debug, Default)]
pub struct ProtocolHandler {
    builder: ChangeSetBuilder,
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&mut self, event: Event) -> Result<ProtocolAction, ProtocolError> {
        match event {
            Event::ServerIntent(intent) => {
                let payload = intent
                    .payloads
                    .first()
                    .ok_or(ChangeSetError::EmptyIntent)?;
                debug!(
                    "server intent {:?} for payload '{}': {}",
                    payload.code, payload.id, payload.reason
                );
                if payload.code == IntentCode::None {
                    self.builder.reset();
                    return Ok(ProtocolAction::ChangeSet(ChangeSetBuilder::no_changes()));
                }
                self.builder.start(payload.code);
                Ok(ProtocolAction::None)
            }
            Event::PutObject(put) => {
                match DataKind::from_wire_name(&put.kind) {
                    Some(kind) => self.builder.add_put(kind, put.key, put.version, put.object),
                    None => debug!("ignoring put-object of unknown kind '{}'", put.kind),
                }
                Ok(ProtocolAction::None)
            }
            Event::DeleteObject(delete) => {
                match DataKind::from_wire_name(&delete.kind) {
                    Some(kind) => self.builder.add_delete(kind, delete.key, delete.version),
                    None => debug!("ignoring delete-object of unknown kind '{}'", delete.kind),
                }
                Ok(ProtocolAction::None)
            }
            Event::PayloadTransferred(selector) => {
                let change_set = self.builder.finish(Some(selector))?;
                Ok(ProtocolAction::ChangeSet(change_set))
            }
            Event::HeartBeat => Ok(ProtocolAction::None),
            Event::Goodbye(goodbye) => {
                self.builder.reset();
                Ok(ProtocolAction::Goodbye(goodbye.reason))
            }
            Event::Error(error) => {
                warn!(
                    "server reported an error for payload {:?}: {}",
                    error.payload_id, error.reason
                );
                self.builder.reset();
                Ok(ProtocolAction::Error(error))
            }
            Event::LegacyPut(put) => Ok(Self::legacy_action(put.into_change_set())),
            Event::LegacyPatch(patch) => Ok(Self::legacy_action(patch.into_change_set())),
            Event::LegacyDelete(delete) => Ok(Self::legacy_action(delete.into_change_set())),
            Event::Unknown(name) => {
                debug!("ignoring unknown event '{}'", name);
                Ok(ProtocolAction::None)
            }
        }
    }

    fn legacy_action(change_set: Option<ChangeSet>) -> ProtocolAction {
        change_set
            .map(ProtocolAction::ChangeSet)
            .unwrap_or(ProtocolAction::None)
    }

    /// Forgets any transfer in progress; used when a connection is dropped.
    pub fn reset(&mut self) {
        self.builder.reset();
    }
}

#[derive(Deserialize)]
struct Envelope {
    events: Vec<RawEvent>,
}

/// Parses a polling response body into a single change-set.
///
/// The body is either an event envelope `{"events": [...]}` whose first event is a
/// `server-intent` and whose transfer ends with `payload-transferred`, or a legacy
/// `{"flags": {...}, "segments": {...}}` document, which is read as a full transfer.
pub fn parse_polling_response(body: &str) -> Result<ChangeSet, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| ProtocolError::InvalidData {
            event: "polling response".to_string(),
            source: Arc::new(e),
        })?;

    if value.get("events").is_none() {
        let data: LegacyData =
            serde_json::from_value(value).map_err(|e| ProtocolError::InvalidData {
                event: "polling response".to_string(),
                source: Arc::new(e),
            })?;
        return Ok(data.into_change_set());
    }

    let envelope: Envelope =
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidData {
            event: "polling response".to_string(),
            source: Arc::new(e),
        })?;

    match envelope.events.first() {
        Some(first) if first.name == SERVER_INTENT => {}
        Some(first) => {
            return Err(ProtocolError::InvalidEnvelope(format!(
                "expected '{}' as the first event, got '{}'",
                SERVER_INTENT, first.name
            )))
        }
        None => return Err(ProtocolError::InvalidEnvelope("no events".to_string())),
    }

    let mut handler = ProtocolHandler::new();
    for raw in envelope.events {
        match handler.handle(Event::decode(raw)?)? {
            ProtocolAction::ChangeSet(change_set) => return Ok(change_set),
            ProtocolAction::Goodbye(reason) => return Err(ProtocolError::ServerError(reason)),
            ProtocolAction::Error(error) => return Err(ProtocolError::ServerError(error.reason)),
            ProtocolAction::None => {}
        }
    }

    Err(ProtocolError::InvalidEnvelope(format!(
        "transfer did not end with '{}'",
        PAYLOAD_TRANSFERRED
    )))
}
