use crate::retry::RetryPolicy;
use anyhow::Context;
use pictask_core::{CommitRequest, Signer, COMMIT_CAPABILITY_HEADER};
use reqwest::{StatusCode, Url};
use std::{sync::Arc, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDisposition {
    Ok,
    /// The gateway already holds an outcome for the task, or does not know it.
    Conflict,
}

#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("issue commit capability: {0}")]
    Capability(#[source] pictask_core::Error),

    #[error("gateway rejected commit with {status}")]
    Rejected { status: StatusCode },

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl CallbackError {
    /// Transport failures and 5xx answers may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Capability(_) => false,
            Self::Rejected { status } => status.is_server_error(),
            Self::Transport(_) => true,
        }
    }
}

#[derive(Clone)]
pub struct GatewayClient {
    base_url: Url,
    http: reqwest::Client,
    signer: Option<Arc<dyn Signer>>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("base_url", &self.base_url.as_str())
            .field("signer", &self.signer.is_some())
            .finish()
    }
}

impl GatewayClient {
    /// `signer` is `None` only against a gateway that accepts unauthenticated commits.
    pub fn new(
        base_url: &str,
        signer: Option<Arc<dyn Signer>>,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url).context("parse gateway base URL")?;
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("build gateway http client")?;
        Ok(Self {
            base_url,
            http,
            signer,
        })
    }

    pub async fn commit(&self, req: &CommitRequest) -> Result<WriteDisposition, CallbackError> {
        let url = self
            .base_url
            .join("/internal/commit")
            .context("join gateway URL")?;

        let mut request = self.http.post(url).json(req);
        if let Some(signer) = &self.signer {
            let token = signer
                .issue_commit_capability(&req.id)
                .map_err(CallbackError::Capability)?;
            request = request.header(COMMIT_CAPABILITY_HEADER, token);
        }

        let resp = request
            .send()
            .await
            .context("POST /internal/commit")?;

        let status = resp.status();
        if status == StatusCode::CONFLICT {
            return Ok(WriteDisposition::Conflict);
        }
        if !status.is_success() {
            return Err(CallbackError::Rejected { status });
        }
        Ok(WriteDisposition::Ok)
    }

    /// [`Self::commit`] with backoff between retryable failures.
    pub async fn commit_with_retry(
        &self,
        req: &CommitRequest,
        policy: &RetryPolicy,
    ) -> Result<WriteDisposition, CallbackError> {
        let mut retry = 0;
        loop {
            let err = match self.commit(req).await {
                Ok(disposition) => return Ok(disposition),
                Err(err) => err,
            };
            if !err.is_retryable() {
                return Err(err);
            }

            retry += 1;
            let Some(delay) = policy.delay_for_retry(retry) else {
                return Err(err);
            };
            tracing::debug!(
                event = "pictask.worker.commit.retry",
                task_id = %req.id,
                retry,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "commit failed; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
