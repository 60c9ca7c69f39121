use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::encoding::Codec;
use crate::error::CodecError;
use crate::queue::task::Task;

/// Task type carrying a batch of hits (or a ping)
pub const HIT_PROCESSING_TASK_NAME: &str = "process-hits";

pub const SESSION_STAMP_IDENTIFIER: &str = "session_stamp";
pub const USER_ID_IDENTIFIER: &str = "user_id";

/// One tracking event, immutable after ingress except for the
/// authoritative client id which conflict resolution may rewrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub id: String,
    #[serde(default)]
    pub property_id: String,
    pub client_id: String,
    pub authoritative_client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub ip: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub identifiers: BTreeMap<String, String>,
    pub server_received_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub payload: BTreeMap<String, serde_json::Value>,
}

impl Hit {
    /// New hit whose session anchor is its own client id
    pub fn new(
        id: impl Into<String>,
        client_id: impl Into<String>,
        server_received_time: DateTime<Utc>,
    ) -> Self {
        let client_id = client_id.into();
        Self {
            id: id.into(),
            property_id: String::new(),
            authoritative_client_id: client_id.clone(),
            client_id,
            user_id: None,
            ip: String::new(),
            identifiers: BTreeMap::new(),
            server_received_time,
            payload: BTreeMap::new(),
        }
    }

    pub fn with_identifier(mut self, kind: impl Into<String>, value: impl Into<String>) -> Self {
        self.identifiers.insert(kind.into(), value.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// The explicit session stamp, falling back to the client IP
    pub fn session_stamp(&self) -> &str {
        self.identifiers
            .get(SESSION_STAMP_IDENTIFIER)
            .map(String::as_str)
            .unwrap_or(self.ip.as_str())
    }

    /// Value of the identifier of the given type, if the hit carries one
    pub fn identifier(&self, kind: &str) -> Option<&str> {
        match kind {
            SESSION_STAMP_IDENTIFIER => {
                let stamp = self.session_stamp();
                (!stamp.is_empty()).then_some(stamp)
            }
            USER_ID_IDENTIFIER => self.user_id.as_deref().filter(|id| !id.is_empty()),
            other => self.identifiers.get(other).map(String::as_str),
        }
    }
}

/// Body of a `process-hits` task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HitProcessingTask {
    pub hits: Vec<Hit>,
}

/// Encode a hit batch into a queue task
pub fn hits_task(codec: Codec, hits: Vec<Hit>) -> Result<Task, CodecError> {
    let body = codec.encode(&HitProcessingTask { hits })?;
    Ok(Task::new(HIT_PROCESSING_TASK_NAME, BTreeMap::new(), body))
}

/// Identifier types checked for cross-client joins
pub fn identifier_types(join_by_session_stamp: bool, join_by_user_id: bool) -> Vec<String> {
    let mut types = Vec::new();
    if join_by_session_stamp {
        types.push(SESSION_STAMP_IDENTIFIER.to_string());
    }
    if join_by_user_id {
        types.push(USER_ID_IDENTIFIER.to_string());
    }
    types
}
