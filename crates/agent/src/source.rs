//! Obtaining the SRPM for each source kind.
//!
//! Link and upload sources are downloaded. Every other kind is checked out or
//! fetched into the work directory and turned into an SRPM by its builder
//! tool; the first `*.src.rpm` in the output directory is the result.

use std::path::{Path, PathBuf};

use importer_core::config::ToolsConfig;
use importer_core::model::{
    GemSource, ImportTask, MockScmSource, PypiSource, ScmType, Source, SourceKind, TitoSource,
};
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::ImportError;
use crate::exec;

const SRPM_SUFFIX: &str = ".src.rpm";

/// Produces a local SRPM for a task.
pub struct Fetcher<'a> {
    http: &'a Client,
    tools: &'a ToolsConfig,
}

impl<'a> Fetcher<'a> {
    pub fn new(http: &'a Client, tools: &'a ToolsConfig) -> Self {
        Self { http, tools }
    }

    /// Places the task's SRPM under `workdir` and returns its path.
    pub async fn fetch(&self, task: &ImportTask, workdir: &Path) -> Result<PathBuf, ImportError> {
        let kind = task.source_kind();
        let output = workdir.join("output");
        tokio::fs::create_dir_all(&output)
            .await
            .map_err(|e| ImportError::fetch(kind, format!("create {}: {e}", output.display())))?;

        let srpm = match &task.source {
            Source::SrpmLink(_) | Source::SrpmUpload(_) => {
                let url = task
                    .package_url
                    .as_deref()
                    .ok_or_else(|| ImportError::Download("task has no package URL".into()))?;
                self.download(url, &output).await?
            }
            Source::GitAndTito(src) => {
                self.tito(src, workdir, &output).await?;
                find_srpm(kind, &output).await?
            }
            Source::MockScm(src) => {
                self.mock_scm(src, workdir, &output).await?;
                find_srpm(kind, &output).await?
            }
            Source::Pypi(src) => {
                self.pyp2rpm(src, &output).await?;
                find_srpm(kind, &output).await?
            }
            Source::Rubygems(src) => {
                self.gem2rpm(src, &output).await?;
                find_srpm(kind, &output).await?
            }
        };
        info!(task_id = task.task_id, srpm = %srpm.display(), "SRPM ready");
        Ok(srpm)
    }

    async fn download(&self, url: &str, output: &Path) -> Result<PathBuf, ImportError> {
        let dest = output.join(srpm_file_name(url));
        let fail = |what: String| ImportError::Download(format!("{url}: {what}"));

        let mut resp = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| fail(e.to_string()))?;
        let mut file = tokio::fs::File::create(&dest)
            .await
            .map_err(|e| fail(format!("create {}: {e}", dest.display())))?;
        let mut bytes = 0_usize;
        while let Some(chunk) = resp.chunk().await.map_err(|e| fail(e.to_string()))? {
            bytes += chunk.len();
            file.write_all(&chunk)
                .await
                .map_err(|e| fail(format!("write {}: {e}", dest.display())))?;
        }
        file.flush()
            .await
            .map_err(|e| fail(format!("write {}: {e}", dest.display())))?;
        info!(url, bytes, "downloaded");
        Ok(dest)
    }

    async fn tito(&self, src: &TitoSource, workdir: &Path, output: &Path) -> Result<(), ImportError> {
        let checkout = workdir.join("checkout");
        self.git_clone(
            SourceKind::GitAndTito,
            &src.git_url,
            src.git_branch.as_deref(),
            &checkout,
        )
        .await?;

        let project = match src.git_dir.as_deref().filter(|d| !d.is_empty()) {
            Some(dir) => checkout.join(dir),
            None => checkout,
        };
        let mut argv = vec![
            self.tools.tito.clone(),
            "build".into(),
            "--srpm".into(),
            "--output".into(),
            path_arg(output),
        ];
        if src.tito_test {
            argv.push("--test".into());
        }
        step(SourceKind::GitAndTito, &argv, Some(&project)).await
    }

    async fn mock_scm(
        &self,
        src: &MockScmSource,
        workdir: &Path,
        output: &Path,
    ) -> Result<(), ImportError> {
        let kind = SourceKind::MockScm;
        let checkout = workdir.join("checkout");
        match src.scm_type {
            ScmType::Git => {
                self.git_clone(kind, &src.scm_url, src.scm_branch.as_deref(), &checkout)
                    .await?
            }
            ScmType::Svn => {
                let argv = vec![
                    self.tools.svn.clone(),
                    "checkout".into(),
                    src.scm_url.clone(),
                    path_arg(&checkout),
                ];
                step(kind, &argv, None).await?
            }
        }

        let spec = checkout.join(&src.spec);
        let sources = spec.parent().unwrap_or(&checkout).to_path_buf();
        let argv = vec![
            self.tools.rpmbuild.clone(),
            "-bs".into(),
            "--define".into(),
            format!("_sourcedir {}", sources.display()),
            "--define".into(),
            format!("_srcrpmdir {}", output.display()),
            path_arg(&spec),
        ];
        step(kind, &argv, Some(&checkout)).await
    }

    async fn pyp2rpm(&self, src: &PypiSource, output: &Path) -> Result<(), ImportError> {
        let mut argv = vec![self.tools.pyp2rpm.clone(), src.pypi_package_name.clone()];
        if let Some(version) = src.pypi_package_version.as_deref().filter(|v| !v.is_empty()) {
            argv.extend(["-v".into(), version.to_string()]);
        }
        if let Some((base, others)) = src.python_versions.split_first() {
            argv.extend(["-b".into(), base.clone()]);
            for version in others {
                argv.extend(["-p".into(), version.clone()]);
            }
        }
        argv.extend(["--srpm".into(), "-d".into(), path_arg(output)]);
        step(SourceKind::Pypi, &argv, Some(output)).await
    }

    async fn gem2rpm(&self, src: &GemSource, output: &Path) -> Result<(), ImportError> {
        let argv = vec![
            self.tools.gem2rpm.clone(),
            "--fetch".into(),
            src.gem_name.clone(),
            "--srpm".into(),
        ];
        step(SourceKind::Rubygems, &argv, Some(output)).await
    }

    async fn git_clone(
        &self,
        kind: SourceKind,
        url: &str,
        branch: Option<&str>,
        dest: &Path,
    ) -> Result<(), ImportError> {
        let mut argv = vec![self.tools.git.clone(), "clone".into()];
        if let Some(branch) = branch.filter(|b| !b.is_empty()) {
            argv.extend(["--branch".into(), branch.to_string()]);
        }
        argv.extend([url.to_string(), path_arg(dest)]);
        step(kind, &argv, None).await
    }
}

/// Runs one build step; any spawn failure or non-zero exit fails the fetch.
async fn step(kind: SourceKind, argv: &[String], cwd: Option<&Path>) -> Result<(), ImportError> {
    let program = argv.first().map(String::as_str).unwrap_or_default();
    let out = exec::run(argv, cwd)
        .await
        .map_err(|e| ImportError::fetch(kind, format!("cannot run {program}: {e}")))?;
    if !out.success() {
        return Err(ImportError::fetch(kind, out.describe(program)));
    }
    Ok(())
}

/// First `*.src.rpm` in `dir`, by name.
async fn find_srpm(kind: SourceKind, dir: &Path) -> Result<PathBuf, ImportError> {
    let read_err = |e: std::io::Error| ImportError::fetch(kind, format!("read {}: {e}", dir.display()));
    let mut entries = tokio::fs::read_dir(dir).await.map_err(read_err)?;
    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
        let path = entry.path();
        let is_srpm = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(SRPM_SUFFIX));
        if is_srpm && path.is_file() {
            found.push(path);
        }
    }
    found.sort();
    found
        .into_iter()
        .next()
        .ok_or_else(|| ImportError::fetch(kind, format!("no {SRPM_SUFFIX} produced in {}", dir.display())))
}

/// Local file name for a downloaded package: the URL's last path segment,
/// restricted to a safe character set.
fn srpm_file_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let last = path.rsplit('/').next().unwrap_or_default();
    let name: String = last
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.ends_with(".rpm") && !name.starts_with('.') {
        name
    } else {
        format!("package{SRPM_SUFFIX}")
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}
