//! Task execution.
//!
//! The dispatcher hands each attempt to a [`TaskHandler`]. The production
//! handler, [`HttpTaskHandler`], POSTs the payload to the queue's target at
//! `/_ah/queue/{queue}`.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use relay_common::{AppError, AppResult, Environment};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::task::TaskId;

/// Why a handler invocation did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Transient failure; retried under the queue's policy.
    #[error("handler failed: {0}")]
    Failed(String),
    /// The handler refused the task; never retried.
    #[error("handler rejected task: {0}")]
    Rejected(String),
    /// The invocation outlived its deadline; retried.
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),
    /// The task was cancelled mid-flight.
    #[error("task cancelled")]
    Cancelled,
}

impl HandlerError {
    /// Whether the retry scheduler should see this failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Timeout(_))
    }
}

/// Everything a handler gets to see about one attempt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Task ID.
    pub id: TaskId,
    /// Queue name.
    pub queue: String,
    /// Opaque payload.
    pub payload: Bytes,
    /// Failed attempts before this one.
    pub retry_count: u32,
    /// Invocations before this one.
    pub execution_count: u32,
    /// Fired when the task is cancelled while this attempt runs.
    pub cancel: CancellationToken,
}

/// Executes tasks on behalf of the dispatcher.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Deliver one attempt of `task` to `target`.
    async fn deliver(&self, target: &str, task: &TaskContext) -> Result<(), HandlerError>;
}

/// Request headers carrying task metadata.
pub mod headers {
    /// Queue name.
    pub const QUEUE_NAME: &str = "X-Relay-Queue-Name";
    /// Task ID.
    pub const TASK_NAME: &str = "X-Relay-Task-Name";
    /// Failed attempts before this one.
    pub const TASK_RETRY_COUNT: &str = "X-Relay-Task-Retry-Count";
    /// Invocations before this one.
    pub const TASK_EXECUTION_COUNT: &str = "X-Relay-Task-Execution-Count";
}

/// Payloads are opaque form-encoded bodies.
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Handler that POSTs each task to `{target}/_ah/queue/{queue}`.
///
/// A target base URL may carry a path prefix; callbacks are resolved under it.
#[derive(Debug, Clone)]
pub struct HttpTaskHandler {
    client: Client,
    routes: HashMap<String, Url>,
}

impl HttpTaskHandler {
    /// Build from `target -> base URL` routes, expanding `${NAME}` through `env`.
    pub fn new(
        routes: &BTreeMap<String, String>,
        env: &Environment,
        user_agent: &str,
    ) -> AppResult<Self> {
        let routes = routes
            .iter()
            .map(|(target, template)| {
                let expanded = env.expand(template)?;
                let mut url = Url::parse(&expanded).map_err(|e| {
                    AppError::Config(format!("target {target}: invalid URL {expanded:?}: {e}"))
                })?;
                if !url.path().ends_with('/') {
                    let path = format!("{}/", url.path());
                    url.set_path(&path);
                }
                Ok((target.clone(), url))
            })
            .collect::<AppResult<HashMap<_, _>>>()?;

        let client = Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, routes })
    }

    /// Fail unless every target in `targets` has a route.
    pub fn check_targets<'a>(&self, targets: impl IntoIterator<Item = &'a str>) -> AppResult<()> {
        for target in targets {
            if !self.routes.contains_key(target) {
                return Err(AppError::Config(format!("no URL configured for target {target}")));
            }
        }
        Ok(())
    }

    /// Callback URL for a task on `queue` routed to `target`.
    pub fn callback_url(&self, target: &str, queue: &str) -> Result<Url, HandlerError> {
        let base = self
            .routes
            .get(target)
            .ok_or_else(|| HandlerError::Rejected(format!("no URL configured for target {target}")))?;
        base.join(&format!("_ah/queue/{queue}"))
            .map_err(|e| HandlerError::Rejected(format!("invalid callback URL: {e}")))
    }
}

/// Map a callback's status to an attempt outcome.
///
/// 2xx succeeds. 408 and 429 are transient like any 5xx; every other 4xx
/// means the handler will never accept the task.
#[must_use]
pub fn classify_status(status: StatusCode, body: &str) -> Result<(), HandlerError> {
    if status.is_success() {
        Ok(())
    } else if status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
    {
        Err(HandlerError::Rejected(format!("{status}: {body}")))
    } else {
        Err(HandlerError::Failed(format!("{status}: {body}")))
    }
}

#[async_trait]
impl TaskHandler for HttpTaskHandler {
    async fn deliver(&self, target: &str, task: &TaskContext) -> Result<(), HandlerError> {
        let url = self.callback_url(target, &task.queue)?;
        debug!(task_id = %task.id, url = %url, "Posting task callback");

        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, FORM_CONTENT_TYPE)
            .header(headers::QUEUE_NAME, &task.queue)
            .header(headers::TASK_NAME, task.id.as_str())
            .header(headers::TASK_RETRY_COUNT, task.retry_count.to_string())
            .header(headers::TASK_EXECUTION_COUNT, task.execution_count.to_string())
            .body(task.payload.clone())
            .send()
            .await
            .map_err(|e| HandlerError::Failed(e.to_string()))?;

        let status = response.status();
        let body = if status.is_success() {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };

        classify_status(status, &body)
    }
}
