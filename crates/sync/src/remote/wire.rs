#![forbid(unsafe_code)]

use super::{PushRequest, RemoteError};
use crate::clock::rfc3339_to_ts_ms;
use serde::{Deserialize, Serialize};
use tk_core::ids::{ClientId, ServerId};
use tk_core::{EntityFields, RemoteEntity, ServerAck};

#[derive(Debug, Serialize)]
pub(super) struct WirePush<'a> {
    pub client_id: &'a str,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<i64>,
    pub fields: &'a EntityFields,
}

impl<'a> WirePush<'a> {
    pub fn from_request(request: &'a PushRequest) -> Self {
        Self {
            client_id: request.client_id.as_str(),
            version: request.version,
            expected_version: request.expected_version,
            fields: &request.fields,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct WireApplied {
    pub server_id: String,
    pub version: i64,
    pub updated_at: String,
}

impl WireApplied {
    pub fn into_ack(self) -> Result<ServerAck, RemoteError> {
        Ok(ServerAck {
            server_id: ServerId::new(self.server_id),
            version: self.version,
            updated_at_ms: parse_timestamp(&self.updated_at)?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct WireEntity {
    pub client_id: ClientId,
    pub server_id: String,
    pub version: i64,
    pub fields: EntityFields,
    #[serde(default)]
    pub deleted: bool,
    pub updated_at: String,
}

impl WireEntity {
    pub fn into_remote(self) -> Result<RemoteEntity, RemoteError> {
        Ok(RemoteEntity {
            updated_at_ms: parse_timestamp(&self.updated_at)?,
            client_id: self.client_id,
            server_id: ServerId::new(self.server_id),
            version: self.version,
            fields: self.fields,
            deleted: self.deleted,
        })
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct WireChanges {
    #[serde(default)]
    pub entities: Vec<WireEntity>,
    #[serde(default)]
    pub checkpoint: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct WireProblem {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub server_version: Option<i64>,
}

fn parse_timestamp(raw: &str) -> Result<i64, RemoteError> {
    rfc3339_to_ts_ms(raw)
        .ok_or_else(|| RemoteError::Unavailable(format!("malformed timestamp {raw:?}")))
}
