//! Remote collaborators reached over HTTP/JSON.
//!
//! - [`HttpParticipant`]: PREPARE / COMMIT / ABORT as `POST {url}/prepare`,
//!   `POST {url}/commit` and `POST {url}/abort`
//! - [`HttpActionInvoker`]: saga steps as `POST {endpoint}/{step_type}`
//!
//! Transport failures and 5xx replies are transient and retried through the
//! configured [`RetryPolicy`]; 4xx replies are rejections and are not.

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tce_common::error::ProtocolError;
use tce_common::prelude::*;
use tce_txn::{ActionInvoker, Participant, PrepareReply, StepInvocation};

/// Header carrying the step idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Body of every participant call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantRequest {
    pub txn_id: u64,
    pub coordinator_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::internal(format!("failed to build HTTP client: {e}")))
}

/// POST `body` to `url` and decode the JSON reply. An empty reply decodes
/// from `{}`.
async fn post_json<B, T>(client: &Client, target: &str, url: &str, body: &B, key: Option<&str>) -> Result<T>
where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
{
    let mut request = client.post(url).json(body);
    if let Some(key) = key {
        request = request.header(IDEMPOTENCY_HEADER, key);
    }

    let response = request.send().await.map_err(|e| {
        Error::Protocol(ProtocolError::RemoteUnavailable {
            target: target.to_string(),
            reason: e.to_string(),
        })
    })?;

    let status = response.status();
    let bytes = response.bytes().await.map_err(|e| {
        Error::Protocol(ProtocolError::RemoteUnavailable {
            target: target.to_string(),
            reason: e.to_string(),
        })
    })?;

    if !status.is_success() {
        let reason = format!("{status}: {}", String::from_utf8_lossy(&bytes));
        return Err(if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Error::Protocol(ProtocolError::RemoteUnavailable {
                target: target.to_string(),
                reason,
            })
        } else {
            Error::Protocol(ProtocolError::RemoteRejected {
                target: target.to_string(),
                reason,
            })
        });
    }

    let body: &[u8] = if bytes.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        &bytes
    };
    serde_json::from_slice(body).map_err(|e| {
        Error::Protocol(ProtocolError::RemoteRejected {
            target: target.to_string(),
            reason: format!("malformed reply: {e}"),
        })
    })
}

// ============================================================================
// Participant
// ============================================================================

/// Two-phase commit participant behind an HTTP endpoint.
pub struct HttpParticipant {
    id: ParticipantId,
    base_url: String,
    coordinator_id: String,
    client: Client,
    retry: RetryPolicy,
}

impl HttpParticipant {
    pub fn new(
        endpoint: &ParticipantEndpoint,
        coordinator_id: impl Into<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        Ok(Self {
            id: endpoint.id.clone(),
            base_url: endpoint.url.trim_end_matches('/').to_string(),
            coordinator_id: coordinator_id.into(),
            client: build_client(timeout)?,
            retry,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call<T: DeserializeOwned>(&self, phase: &str, txn_id: TxnId, payload: Option<&Payload>) -> Result<T> {
        let url = format!("{}/{phase}", self.base_url);
        let body = ParticipantRequest {
            txn_id: txn_id.0,
            coordinator_id: self.coordinator_id.clone(),
            payload: payload.cloned(),
        };
        let op = format!("participant.{phase}");
        self.retry
            .run(&op, || post_json(&self.client, self.id.as_str(), &url, &body, None))
            .await
    }
}

#[async_trait]
impl Participant for HttpParticipant {
    fn id(&self) -> ParticipantId {
        self.id.clone()
    }

    async fn prepare(&self, txn_id: TxnId, payload: &Payload) -> Result<PrepareReply> {
        self.call("prepare", txn_id, Some(payload)).await
    }

    async fn commit(&self, txn_id: TxnId) -> Result<Payload> {
        self.call("commit", txn_id, None).await
    }

    async fn abort(&self, txn_id: TxnId) -> Result<()> {
        let _: Payload = self.call("abort", txn_id, None).await?;
        Ok(())
    }
}

// ============================================================================
// Action invoker
// ============================================================================

/// Saga action invoker posting each step to `{endpoint}/{step_type}`.
pub struct HttpActionInvoker {
    endpoint: String,
    client: Client,
    retry: RetryPolicy,
}

impl HttpActionInvoker {
    pub fn new(endpoint: &str, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client: build_client(timeout)?,
            retry,
        })
    }
}

#[async_trait]
impl ActionInvoker for HttpActionInvoker {
    async fn invoke(&self, invocation: StepInvocation) -> Result<Payload> {
        let url = format!("{}/{}", self.endpoint, invocation.step_type);
        debug!(
            saga_id = %invocation.saga_id,
            step = invocation.step_number,
            kind = %invocation.kind,
            url = %url,
            "invoking remote step"
        );
        let key = invocation.idempotency_key.clone();
        self.retry
            .run(&invocation.step_type, || {
                post_json(&self.client, &invocation.step_type, &url, &invocation, Some(key.as_str()))
            })
            .await
    }
}
