use importer_core::api::ErrorCode;
use importer_core::model::SourceKind;
use thiserror::Error;

/// A failed import step. Each variant maps to one wire error code.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("SRPM download failed: {0}")]
    Download(String),
    #[error("SRPM build failed: {0}")]
    Build(String),
    #[error("SRPM query failed: {0}")]
    Query(String),
    #[error("git import failed: {0}")]
    GitImport(String),
}

impl ImportError {
    /// Failure while obtaining the SRPM: a download for link and upload
    /// sources, a build for everything else.
    pub fn fetch(kind: SourceKind, message: impl Into<String>) -> Self {
        match kind {
            SourceKind::SrpmLink | SourceKind::SrpmUpload => ImportError::Download(message.into()),
            _ => ImportError::Build(message.into()),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ImportError::Download(_) => ErrorCode::SrpmDownloadFailed,
            ImportError::Build(_) => ErrorCode::SrpmBuildFailed,
            ImportError::Query(_) => ErrorCode::SrpmQueryFailed,
            ImportError::GitImport(_) => ErrorCode::GitImportFailed,
        }
    }
}
