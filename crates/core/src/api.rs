use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{TaskDescriptor, TaskId};

/// Response of `GET /backend/importing/`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportingResponse {
    #[serde(default)]
    pub builds: Vec<TaskDescriptor>,
}

/// Terminal failure category reported to the frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SrpmDownloadFailed,
    SrpmBuildFailed,
    SrpmQueryFailed,
    GitImportFailed,
    /// The worker outlived its timeout and was killed by the dispatcher.
    ImportTimeoutExceeded,
    /// The worker was killed because the dispatcher shut down.
    ImportInterrupted,
    /// The worker process could not be started.
    ImportSpawnFailed,
    /// The worker process died without reporting the task.
    ImportAgentFailed,
}

impl ErrorCode {
    /// Wire string.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::SrpmDownloadFailed => "srpm_download_failed",
            ErrorCode::SrpmBuildFailed => "srpm_build_failed",
            ErrorCode::SrpmQueryFailed => "srpm_query_failed",
            ErrorCode::GitImportFailed => "git_import_failed",
            ErrorCode::ImportTimeoutExceeded => "import_timeout_exceeded",
            ErrorCode::ImportInterrupted => "import_interrupted",
            ErrorCode::ImportSpawnFailed => "import_spawn_failed",
            ErrorCode::ImportAgentFailed => "import_agent_failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of `POST /backend/import-completed/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImportReport {
    /// Package imported and committed.
    Success {
        task_id: TaskId,
        pkg_name: String,
        pkg_version: String,
        repo_name: String,
        git_hash: String,
    },
    /// Import failed, timed out or was abandoned.
    Failure {
        task_id: TaskId,
        error: ErrorCode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl ImportReport {
    /// Failure report.
    pub fn failure(task_id: TaskId, error: ErrorCode, message: Option<String>) -> Self {
        ImportReport::Failure {
            task_id,
            error,
            message,
        }
    }

    /// Abandonment record for a worker killed after its timeout.
    pub fn timed_out(task_id: TaskId) -> Self {
        Self::failure(task_id, ErrorCode::ImportTimeoutExceeded, None)
    }

    /// Task this report is about.
    pub fn task_id(&self) -> TaskId {
        match self {
            ImportReport::Success { task_id, .. } | ImportReport::Failure { task_id, .. } => {
                *task_id
            }
        }
    }

    /// Error code, `None` for successes.
    pub fn error(&self) -> Option<ErrorCode> {
        match self {
            ImportReport::Success { .. } => None,
            ImportReport::Failure { error, .. } => Some(*error),
        }
    }
}
