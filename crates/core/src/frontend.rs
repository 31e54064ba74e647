//! HTTP client for the frontend's backend endpoints.

use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::{ImportReport, ImportingResponse};
use crate::config::ImporterConfig;
use crate::model::{TaskDescriptor, TaskId};

const IMPORTING_PATH: &str = "/backend/importing/";
const IMPORT_COMPLETED_PATH: &str = "/backend/import-completed/";
const IMPORTER_ID_HEADER: &str = "X-Importer-Id";

/// Frontend communication failures.
#[derive(Debug, Error)]
pub enum FrontendError {
    #[error("frontend request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("frontend rejected report for task {task_id}: HTTP {status}")]
    Rejected { task_id: TaskId, status: u16 },
    #[error("frontend unavailable: {0}")]
    Unavailable(String),
}

/// The two calls the importer makes to the frontend.
pub trait Frontend {
    /// Pending import requests, in frontend order.
    fn importing_tasks(
        &self,
    ) -> impl Future<Output = Result<Vec<TaskDescriptor>, FrontendError>> + Send;

    /// Delivers one outcome report.
    fn post_back(
        &self,
        report: &ImportReport,
    ) -> impl Future<Output = Result<(), FrontendError>> + Send;
}

/// Delivers `report`, logging instead of failing. Returns whether the
/// frontend accepted it. Never retries.
pub async fn post_back_safe<F: Frontend>(frontend: &F, report: &ImportReport) -> bool {
    match frontend.post_back(report).await {
        Ok(()) => true,
        Err(e) => {
            warn!(task_id = report.task_id(), error = %e, "failed to deliver import report");
            false
        }
    }
}

/// reqwest-backed [`Frontend`].
#[derive(Debug, Clone)]
pub struct FrontendClient {
    client: Client,
    base_url: String,
    auth: String,
    importer_id: String,
}

impl FrontendClient {
    /// Client whose every request is bounded by `timeout`.
    pub fn new(
        base_url: &str,
        auth: &str,
        importer_id: &str,
        timeout: Duration,
    ) -> Result<Self, FrontendError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth: auth.to_string(),
            importer_id: importer_id.to_string(),
        })
    }

    /// Client for the configured frontend.
    pub fn from_config(cfg: &ImporterConfig, importer_id: &str) -> Result<Self, FrontendError> {
        Self::new(
            &cfg.frontend_base_url,
            &cfg.frontend_auth,
            importer_id,
            cfg.request_timeout(),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Frontend for FrontendClient {
    async fn importing_tasks(&self) -> Result<Vec<TaskDescriptor>, FrontendError> {
        let resp = self
            .client
            .get(self.url(IMPORTING_PATH))
            .header(IMPORTER_ID_HEADER, &self.importer_id)
            .send()
            .await?
            .error_for_status()?
            .json::<ImportingResponse>()
            .await?;
        Ok(resp.builds)
    }

    async fn post_back(&self, report: &ImportReport) -> Result<(), FrontendError> {
        let resp = self
            .client
            .post(self.url(IMPORT_COMPLETED_PATH))
            .basic_auth("user", Some(&self.auth))
            .header(IMPORTER_ID_HEADER, &self.importer_id)
            .json(report)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FrontendError::Rejected {
                task_id: report.task_id(),
                status: status.as_u16(),
            });
        }
        debug!(task_id = report.task_id(), error = ?report.error(), "import report delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::api::ErrorCode;

    struct Flaky {
        delivered: Mutex<Vec<ImportReport>>,
    }

    impl Frontend for Flaky {
        async fn importing_tasks(&self) -> Result<Vec<TaskDescriptor>, FrontendError> {
            Ok(vec![])
        }

        async fn post_back(&self, report: &ImportReport) -> Result<(), FrontendError> {
            if report.task_id() % 2 == 0 {
                return Err(FrontendError::Unavailable("connection refused".into()));
            }
            self.delivered.lock().unwrap().push(report.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn post_back_safe_swallows_delivery_errors() {
        let frontend = Flaky {
            delivered: Mutex::new(vec![]),
        };

        assert!(!post_back_safe(&frontend, &ImportReport::timed_out(2)).await);
        assert!(post_back_safe(&frontend, &ImportReport::timed_out(3)).await);

        let delivered = frontend.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].error(), Some(ErrorCode::ImportTimeoutExceeded));
    }

    #[test]
    fn base_url_trailing_slash_is_ignored() {
        let client =
            FrontendClient::new("http://front/", "pw", "importer-1", Duration::from_secs(1))
                .unwrap();
        assert_eq!(client.url(IMPORTING_PATH), "http://front/backend/importing/");
    }
}
