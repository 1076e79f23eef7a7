use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Serialize, Serializer};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

use crate::config::Credentials;
use crate::error::DispatchError;
use crate::execution::retry::RetryPolicy;

/// Why an observation was requested. Travels to the executor as `request_type`
/// and comes back with the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestReason {
    Heartbeat,
    Deviation,
    NewRound,
}

impl RequestReason {
    pub fn code(self) -> u8 {
        match self {
            RequestReason::Heartbeat => 1,
            RequestReason::Deviation => 2,
            RequestReason::NewRound => 3,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(RequestReason::Heartbeat),
            2 => Some(RequestReason::Deviation),
            3 => Some(RequestReason::NewRound),
            _ => None,
        }
    }
}

impl fmt::Display for RequestReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestReason::Heartbeat => "heartbeat",
            RequestReason::Deviation => "deviation",
            RequestReason::NewRound => "new-round",
        };
        write!(f, "{}", name)
    }
}

impl Serialize for RequestReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

/// A request id already allocated and persisted, waiting to be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTicket {
    pub job_name: String,
    pub external_job_id: String,
    pub request_id: u64,
    pub reason: RequestReason,
}

/// Starts job runs on the external executor
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn send_run(
        &self,
        external_job_id: &str,
        request_id: u64,
        reason: RequestReason,
    ) -> Result<(), DispatchError>;
}

#[derive(Debug, Serialize)]
struct JobRunBody {
    payment: u64,
    request_id: u64,
    request_type: RequestReason,
}

/// Executor client for `POST /v2/jobs/{id}/runs`
pub struct HttpJobRunner {
    client: Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpJobRunner {
    pub fn new(base_url: &str, credentials: Credentials, timeout_secs: u64) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn runs_url(&self, external_job_id: &str) -> String {
        format!("{}/v2/jobs/{}/runs", self.base_url, external_job_id)
    }
}

#[async_trait]
impl JobRunner for HttpJobRunner {
    async fn send_run(
        &self,
        external_job_id: &str,
        request_id: u64,
        reason: RequestReason,
    ) -> Result<(), DispatchError> {
        let response = self
            .client
            .post(self.runs_url(external_job_id))
            .header("X-Chainlink-EA-AccessKey", &self.credentials.access_key)
            .header("X-Chainlink-EA-Secret", &self.credentials.secret)
            .json(&JobRunBody {
                payment: 0,
                request_id,
                request_type: reason,
            })
            .send()
            .await
            .map_err(|e| DispatchError::Unreachable {
                job_id: external_job_id.to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(DispatchError::Rejected {
                job_id: external_job_id.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Sends observation requests with bounded retry
pub struct Dispatcher {
    runner: Arc<dyn JobRunner>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(runner: Arc<dyn JobRunner>, retry: RetryPolicy) -> Self {
        Self { runner, retry }
    }

    /// Send one request. On exhaustion the request is dropped; the next
    /// scheduler cycle re-evaluates staleness and may issue a new one.
    #[instrument(skip(self, ticket), fields(job = %ticket.job_name, request_id = ticket.request_id, reason = %ticket.reason))]
    pub async fn send_request(&self, ticket: &DispatchTicket) -> Result<(), DispatchError> {
        info!("📨 Sending job run {} for {}", ticket.request_id, ticket.job_name);

        let label = format!("Job run {} for {}", ticket.request_id, ticket.external_job_id);
        self.retry
            .run(&label, |_| {
                self.runner
                    .send_run(&ticket.external_job_id, ticket.request_id, ticket.reason)
            })
            .await
            .map_err(|_| DispatchError::Exhausted {
                job_id: ticket.external_job_id.clone(),
                attempts: self.retry.attempts(),
            })
    }

    /// Fire-and-forget send on a background task
    pub fn spawn(self: &Arc<Self>, ticket: DispatchTicket) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.send_request(&ticket).await {
                error!("Request {} for {} lost: {}", ticket.request_id, ticket.job_name, e);
            }
        })
    }
}
