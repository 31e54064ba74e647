use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::api::{ErrorCode, ImportReport};

/// Frontend build id of an import task.
pub type TaskId = i64;

/// Errors raised while turning an upstream descriptor into an [`ImportTask`].
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("unknown source type: {0}")]
    UnknownSourceKind(i64),
    #[error("task {task_id}: malformed source_json: {source}")]
    MalformedSource {
        task_id: TaskId,
        #[source]
        source: serde_json::Error,
    },
}

/// How a task's payload is interpreted and fetched.
///
/// Serialized as the frontend's numeric `source_type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum SourceKind {
    /// Link to an SRPM somewhere on the web.
    SrpmLink,
    /// SRPM uploaded to the frontend's tmp area.
    SrpmUpload,
    /// Git checkout built into an SRPM with Tito.
    GitAndTito,
    /// Git/SVN checkout built into an SRPM from a spec file.
    MockScm,
    /// Package from PyPI converted with pyp2rpm.
    Pypi,
    /// Gem from rubygems.org converted with gem2rpm.
    Rubygems,
}

impl SourceKind {
    /// Every known kind, in tag order.
    pub const ALL: [SourceKind; 6] = [
        SourceKind::SrpmLink,
        SourceKind::SrpmUpload,
        SourceKind::GitAndTito,
        SourceKind::MockScm,
        SourceKind::Pypi,
        SourceKind::Rubygems,
    ];

    /// Numeric wire tag.
    pub fn tag(self) -> i64 {
        match self {
            SourceKind::SrpmLink => 1,
            SourceKind::SrpmUpload => 2,
            SourceKind::GitAndTito => 3,
            SourceKind::MockScm => 4,
            SourceKind::Pypi => 5,
            SourceKind::Rubygems => 6,
        }
    }

    /// Short name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            SourceKind::SrpmLink => "srpm_link",
            SourceKind::SrpmUpload => "srpm_upload",
            SourceKind::GitAndTito => "git_and_tito",
            SourceKind::MockScm => "mock_scm",
            SourceKind::Pypi => "pypi",
            SourceKind::Rubygems => "rubygems",
        }
    }
}

impl TryFrom<i64> for SourceKind {
    type Error = TaskError;

    fn try_from(tag: i64) -> Result<Self, Self::Error> {
        SourceKind::ALL
            .into_iter()
            .find(|k| k.tag() == tag)
            .ok_or(TaskError::UnknownSourceKind(tag))
    }
}

impl From<SourceKind> for i64 {
    fn from(kind: SourceKind) -> Self {
        kind.tag()
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pending import request as returned by the frontend.
///
/// `source_type` stays raw so that unknown kinds can be seen (and rejected)
/// by the dispatcher instead of failing the whole response decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: TaskId,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub branch: String,
    pub source_type: i64,
    /// JSON document carried as a string.
    #[serde(default)]
    pub source_json: String,
    /// Fields this importer does not interpret; visible to filter predicates.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl TaskDescriptor {
    /// Known source kind, or `None` for unset/unknown tags.
    pub fn source_kind(&self) -> Option<SourceKind> {
        SourceKind::try_from(self.source_type).ok()
    }

    /// `source_json` decoded as an object. Empty or invalid documents decode
    /// to an empty map.
    pub fn source_fields(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::from_str(&self.source_json).unwrap_or_default()
    }
}

/// `source_json` payload of a link build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSource {
    pub url: String,
}

/// `source_json` payload of an uploaded SRPM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSource {
    /// Directory name under the frontend's `/tmp/`.
    pub tmp: String,
    /// File name of the package.
    pub pkg: String,
}

/// `source_json` payload of a Tito build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitoSource {
    pub git_url: String,
    /// Subdirectory holding the Tito project.
    #[serde(default)]
    pub git_dir: Option<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
    /// Build from the latest commit instead of the latest tag.
    #[serde(default)]
    pub tito_test: bool,
}

/// Version control system of a mock SCM build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScmType {
    #[default]
    Git,
    Svn,
}

/// `source_json` payload of a mock SCM build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockScmSource {
    #[serde(default)]
    pub scm_type: ScmType,
    pub scm_url: String,
    #[serde(default)]
    pub scm_branch: Option<String>,
    /// Spec file path relative to the checkout root.
    pub spec: String,
}

/// `source_json` payload of a PyPI build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PypiSource {
    pub pypi_package_name: String,
    /// Latest release when absent.
    #[serde(default)]
    pub pypi_package_version: Option<String>,
    #[serde(default, deserialize_with = "string_or_number_list")]
    pub python_versions: Vec<String>,
}

/// `source_json` payload of a RubyGems build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GemSource {
    pub gem_name: String,
}

/// Parsed, kind-specific source of an import task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Source {
    SrpmLink(LinkSource),
    SrpmUpload(UploadSource),
    GitAndTito(TitoSource),
    MockScm(MockScmSource),
    Pypi(PypiSource),
    Rubygems(GemSource),
}

impl Source {
    /// Decodes `source_json` for the given kind.
    pub fn parse(kind: SourceKind, source_json: &str) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            SourceKind::SrpmLink => Source::SrpmLink(serde_json::from_str(source_json)?),
            SourceKind::SrpmUpload => Source::SrpmUpload(serde_json::from_str(source_json)?),
            SourceKind::GitAndTito => Source::GitAndTito(serde_json::from_str(source_json)?),
            SourceKind::MockScm => Source::MockScm(serde_json::from_str(source_json)?),
            SourceKind::Pypi => Source::Pypi(serde_json::from_str(source_json)?),
            SourceKind::Rubygems => Source::Rubygems(serde_json::from_str(source_json)?),
        })
    }

    /// Kind tag of this source.
    pub fn kind(&self) -> SourceKind {
        match self {
            Source::SrpmLink(_) => SourceKind::SrpmLink,
            Source::SrpmUpload(_) => SourceKind::SrpmUpload,
            Source::GitAndTito(_) => SourceKind::GitAndTito,
            Source::MockScm(_) => SourceKind::MockScm,
            Source::Pypi(_) => SourceKind::Pypi,
            Source::Rubygems(_) => SourceKind::Rubygems,
        }
    }
}

/// One unit of import work.
///
/// The descriptor part is fixed at poll time. The result fields are filled in
/// only by the agent that executes the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportTask {
    pub task_id: TaskId,
    pub user: String,
    pub project: String,
    pub branch: String,
    pub source: Source,
    /// Fetchable SRPM location for the link and upload kinds.
    #[serde(default)]
    pub package_url: Option<String>,

    #[serde(default)]
    pub package_name: Option<String>,
    #[serde(default)]
    pub package_version: Option<String>,
    #[serde(default)]
    pub git_hash: Option<String>,
    #[serde(default)]
    pub error: Option<ErrorCode>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ImportTask {
    /// Builds a task from an upstream descriptor. Upload locations are
    /// resolved against `frontend_base_url`.
    pub fn from_descriptor(
        desc: &TaskDescriptor,
        frontend_base_url: &str,
    ) -> Result<Self, TaskError> {
        let kind = SourceKind::try_from(desc.source_type)?;
        let source = Source::parse(kind, &desc.source_json).map_err(|source| {
            TaskError::MalformedSource {
                task_id: desc.task_id,
                source,
            }
        })?;

        let package_url = match &source {
            Source::SrpmLink(link) => Some(link.url.clone()),
            Source::SrpmUpload(upload) => Some(format!(
                "{}/tmp/{}/{}",
                frontend_base_url.trim_end_matches('/'),
                upload.tmp,
                upload.pkg
            )),
            _ => None,
        };

        Ok(Self {
            task_id: desc.task_id,
            user: desc.user.clone(),
            project: desc.project.clone(),
            branch: desc.branch.clone(),
            source,
            package_url,
            package_name: None,
            package_version: None,
            git_hash: None,
            error: None,
            error_message: None,
        })
    }

    /// Kind of the task's source.
    pub fn source_kind(&self) -> SourceKind {
        self.source.kind()
    }

    /// dist-git repository name, known once the package name is resolved.
    pub fn repo_name(&self) -> Option<String> {
        self.package_name
            .as_ref()
            .map(|name| format!("{}/{}/{}", self.user, self.project, name))
    }

    /// Records a failure on the task.
    pub fn fail(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.error = Some(code);
        self.error_message = Some(message.into());
    }

    /// Outcome report for the frontend: a failure when an error was recorded
    /// or a result field is missing, a success otherwise.
    pub fn report(&self) -> ImportReport {
        if let Some(code) = self.error {
            return ImportReport::failure(self.task_id, code, self.error_message.clone());
        }
        match (
            &self.package_name,
            &self.package_version,
            &self.git_hash,
            self.repo_name(),
        ) {
            (Some(name), Some(version), Some(hash), Some(repo)) => ImportReport::Success {
                task_id: self.task_id,
                pkg_name: name.clone(),
                pkg_version: version.clone(),
                repo_name: repo,
                git_hash: hash.clone(),
            },
            _ => ImportReport::failure(
                self.task_id,
                ErrorCode::GitImportFailed,
                Some("import finished without a commit".into()),
            ),
        }
    }
}

fn string_or_number_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Item {
        Text(String),
        Number(i64),
    }

    let items = Option::<Vec<Item>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(items
        .into_iter()
        .map(|item| match item {
            Item::Text(s) => s,
            Item::Number(n) => n.to_string(),
        })
        .collect())
}
