//! Job dispatcher
//!
//! External collaborator boundary: once the pipeline selects a release and a
//! job row exists, the dispatcher hands the job to the agent/runner
//! integration. A dispatch failure is recorded on the job as Failure with
//! the dispatcher's message; it never blocks future evaluations.

use async_trait::async_trait;
use pennant_core::domain::job::Job;
use pennant_core::domain::release::Release;
use pennant_core::domain::target::ReleaseTarget;
use serde::Serialize;

use crate::error::{EngineError, Result};

/// Hands a created job to the external runner integration
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, job: &Job, release: &Release, target: &ReleaseTarget) -> Result<()>;
}

/// Payload posted to the agent webhook
#[derive(Debug, Serialize)]
struct DispatchPayload<'a> {
    job: &'a Job,
    release: &'a Release,
    target_key: String,
    resource_id: uuid::Uuid,
    environment_id: uuid::Uuid,
    deployment_id: uuid::Uuid,
}

/// Dispatcher that POSTs jobs to a configured agent webhook
pub struct WebhookDispatcher {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookDispatcher {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl JobDispatcher for WebhookDispatcher {
    async fn dispatch(&self, job: &Job, release: &Release, target: &ReleaseTarget) -> Result<()> {
        let payload = DispatchPayload {
            job,
            release,
            target_key: target.key(),
            resource_id: target.resource_id,
            environment_id: target.environment_id,
            deployment_id: target.deployment_id,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| EngineError::Dispatch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::Dispatch(format!(
                "agent webhook returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}

/// Dispatcher that only logs, for runs without a configured agent endpoint
pub struct LogDispatcher;

#[async_trait]
impl JobDispatcher for LogDispatcher {
    async fn dispatch(&self, job: &Job, release: &Release, target: &ReleaseTarget) -> Result<()> {
        tracing::info!(
            "Dispatching job {} (release {} -> target {})",
            job.id,
            release.id,
            target.key()
        );
        Ok(())
    }
}
