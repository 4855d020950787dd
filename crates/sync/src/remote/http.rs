#![forbid(unsafe_code)]

use super::wire::{WireApplied, WireChanges, WireEntity, WirePush, WireProblem};
use super::{ChangeBatch, PushRequest, RemoteClient, RemoteError};
use crate::auth::Credential;
use crate::config::SyncConfig;
use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder, Response};
use std::time::Duration;
use tk_core::ids::ClientId;
use tk_core::{EntityKind, Operation, RemoteEntity, ServerAck};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
const MAX_ERROR_BODY: usize = 200;

/// JSON-over-HTTP task server at `{base_url}/tasks` and `{base_url}/categories`.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
}

impl HttpRemote {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| RemoteError::Connection(format!("http client: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, RemoteError> {
        Self::new(
            &config.remote.base_url,
            Duration::from_millis(config.request_timeout_ms),
        )
    }

    fn collection_url(&self, kind: EntityKind) -> String {
        let collection = match kind {
            EntityKind::Task => "tasks",
            EntityKind::Category => "categories",
        };
        format!("{}/{collection}", self.base_url)
    }

    fn push_url(&self, request: &PushRequest) -> Result<String, RemoteError> {
        let collection = self.collection_url(request.kind);
        match (request.operation, &request.server_id) {
            (Operation::Create, _) => Ok(collection),
            (_, Some(server_id)) => Ok(format!("{collection}/{}", server_id.as_str())),
            // Nothing to address on the server: let conflict handling look the entity up.
            (_, None) => Err(RemoteError::VersionConflict {
                server_version: None,
            }),
        }
    }

    fn send(
        &self,
        builder: RequestBuilder,
        credential: &Credential,
    ) -> Result<Response, RemoteError> {
        builder
            .bearer_auth(credential.token())
            .send()
            .map_err(transport_error)
    }
}

impl RemoteClient for HttpRemote {
    fn push(
        &self,
        credential: &Credential,
        request: &PushRequest,
    ) -> Result<ServerAck, RemoteError> {
        let url = self.push_url(request)?;
        let builder = match request.operation {
            Operation::Create => self.client.post(url),
            Operation::Update => self.client.put(url),
            Operation::Delete => self.client.delete(url),
        };
        let builder = builder
            .header(IDEMPOTENCY_HEADER, request.idempotency_key.as_str())
            .json(&WirePush::from_request(request));
        let response = self.send(builder, credential)?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(classify_status(status, &response.text().unwrap_or_default()));
        }
        let applied: WireApplied = response.json().map_err(transport_error)?;
        applied.into_ack()
    }

    fn fetch(
        &self,
        credential: &Credential,
        kind: EntityKind,
        client_id: &ClientId,
    ) -> Result<Option<RemoteEntity>, RemoteError> {
        let url = format!("{}/client/{}", self.collection_url(kind), client_id.as_str());
        let response = self.send(self.client.get(url), credential)?;
        let status = response.status().as_u16();
        if status == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(classify_status(status, &response.text().unwrap_or_default()));
        }
        let entity: WireEntity = response.json().map_err(transport_error)?;
        entity.into_remote().map(Some)
    }

    fn list_changes(
        &self,
        credential: &Credential,
        kind: EntityKind,
        since: Option<&str>,
    ) -> Result<ChangeBatch, RemoteError> {
        let base = format!("{}/changes", self.collection_url(kind));
        let url = match since {
            Some(since) => Url::parse_with_params(&base, &[("since", since)]),
            None => Url::parse(&base),
        }
        .map_err(|err| RemoteError::Connection(format!("bad url: {err}")))?;

        let response = self.send(self.client.get(url), credential)?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(classify_status(status, &response.text().unwrap_or_default()));
        }
        let changes: WireChanges = response.json().map_err(transport_error)?;
        let entities = changes
            .entities
            .into_iter()
            .map(WireEntity::into_remote)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ChangeBatch {
            entities,
            checkpoint: changes.checkpoint,
        })
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else if err.is_connect() {
        RemoteError::Connection(err.to_string())
    } else if err.is_decode() {
        RemoteError::Unavailable(format!("malformed response: {err}"))
    } else {
        RemoteError::Connection(err.to_string())
    }
}

/// Maps a non-2xx response onto the remote error taxonomy.
pub(super) fn classify_status(status: u16, body: &str) -> RemoteError {
    let problem: WireProblem = serde_json::from_str(body).unwrap_or_default();
    let message = problem.message.unwrap_or_else(|| {
        let mut text: String = body.chars().take(MAX_ERROR_BODY).collect();
        if text.trim().is_empty() {
            text = format!("http {status}");
        }
        text
    });
    match status {
        409 => RemoteError::VersionConflict {
            server_version: problem.server_version,
        },
        // The addressed entity is gone; conflict handling fetches the server copy.
        404 | 410 => RemoteError::VersionConflict {
            server_version: None,
        },
        400 | 422 => RemoteError::Validation(message),
        401 | 403 => RemoteError::Unauthorized(message),
        408 => RemoteError::Timeout,
        429 | 500..=599 => RemoteError::Unavailable(message),
        _ => RemoteError::Validation(format!("unexpected http {status}: {message}")),
    }
}
