//! HTTP job executor. A 2xx response is success; anything else is failure.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use tickwork_core::model::{HttpJob, JobKind, JobPayload};
use tracing::debug;

use crate::error::{ExecutorError, Result};
use crate::output;
use crate::types::{Executor, JobContext, Outcome};

pub struct HttpExecutor {
    client: Client,
    max_output_chars: usize,
}

impl HttpExecutor {
    pub fn new(max_output_chars: usize) -> Self {
        Self::with_client(Client::new(), max_output_chars)
    }

    pub fn with_client(client: Client, max_output_chars: usize) -> Self {
        Self {
            client,
            max_output_chars,
        }
    }

    fn request(&self, job: &HttpJob, ctx: &JobContext) -> Result<reqwest::RequestBuilder> {
        let method = Method::from_bytes(job.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| ExecutorError::InvalidRequest(format!("bad method {}", job.method)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &job.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ExecutorError::InvalidRequest(format!("header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ExecutorError::InvalidRequest(format!("header {name}: {e}")))?;
            headers.insert(name, value);
        }

        let mut req = self
            .client
            .request(method, &job.url)
            .headers(headers)
            .header("x-tickwork-run-id", ctx.run_id.to_string())
            .header("x-tickwork-attempt", ctx.attempt.to_string())
            .timeout(ctx.job.timeout());
        if let Some(body) = &job.body {
            req = req.body(body.clone());
        }
        Ok(req)
    }

    async fn run(&self, job: &HttpJob, ctx: &JobContext) -> Result<Outcome> {
        let response = match self.request(job, ctx)?.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Ok(Outcome::Timeout),
            Err(e) => return Err(e.into()),
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let body = output::truncate_middle(body.trim_end(), self.max_output_chars);
        debug!(job_id = %ctx.job.id, url = %job.url, %status, "http job responded");

        if status.is_success() {
            Ok(Outcome::success(output::non_empty(body)))
        } else {
            Ok(Outcome::failure(format!("HTTP {status}: {body}").trim_end()))
        }
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    fn name(&self) -> &'static str {
        "http"
    }

    fn supports(&self, kind: JobKind) -> bool {
        kind == JobKind::Http
    }

    async fn execute(&self, ctx: &JobContext) -> Outcome {
        let JobPayload::Http(job) = &ctx.job.payload else {
            return ExecutorError::PayloadMismatch {
                executor: "http",
                kind: ctx.job.kind,
            }
            .into();
        };

        tokio::select! {
            outcome = self.run(job, ctx) => outcome.unwrap_or_else(Outcome::from),
            _ = ctx.cancel.cancelled() => Outcome::failure("cancelled"),
        }
    }
}
