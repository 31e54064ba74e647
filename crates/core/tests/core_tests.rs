//! Integration tests for the core crate.

use std::collections::BTreeMap;

use importer_core::api::{ErrorCode, ImportReport, ImportingResponse};
use importer_core::model::{ImportTask, Source, SourceKind, TaskDescriptor, TaskError};

const FRONTEND: &str = "http://front";

fn link_descriptor() -> TaskDescriptor {
    TaskDescriptor {
        task_id: 123,
        user: "foo".into(),
        project: "bar".into(),
        branch: "f22".into(),
        source_type: SourceKind::SrpmLink.tag(),
        source_json: r#"{"url": "http://example.com/pkg.src.rpm"}"#.into(),
        extra: BTreeMap::new(),
    }
}

fn upload_descriptor() -> TaskDescriptor {
    TaskDescriptor {
        task_id: 124,
        source_type: SourceKind::SrpmUpload.tag(),
        source_json: r#"{"tmp": "tmp_2", "pkg": "pkg_2.src.rpm"}"#.into(),
        ..link_descriptor()
    }
}

#[test]
fn test_source_kind_serde() {
    let kind: SourceKind = serde_json::from_str("5").unwrap();
    assert_eq!(kind, SourceKind::Pypi);
    assert_eq!(serde_json::to_string(&SourceKind::Rubygems).unwrap(), "6");
    assert!(serde_json::from_str::<SourceKind>("999999").is_err());
    assert!(serde_json::from_str::<SourceKind>("0").is_err());
}

#[test]
fn test_link_task_from_descriptor() {
    let task = ImportTask::from_descriptor(&link_descriptor(), FRONTEND).unwrap();
    assert_eq!(task.task_id, 123);
    assert_eq!(task.user, "foo");
    assert_eq!(task.branch, "f22");
    assert_eq!(task.package_url.as_deref(), Some("http://example.com/pkg.src.rpm"));
    assert_eq!(task.source_kind(), SourceKind::SrpmLink);
    assert_eq!(task.repo_name(), None);
}

#[test]
fn test_upload_task_resolves_against_frontend() {
    let task = ImportTask::from_descriptor(&upload_descriptor(), FRONTEND).unwrap();
    assert_eq!(
        task.package_url.as_deref(),
        Some("http://front/tmp/tmp_2/pkg_2.src.rpm")
    );
    assert!(matches!(task.source, Source::SrpmUpload(_)));
}

#[test]
fn test_unknown_source_kind_is_rejected() {
    let mut desc = link_descriptor();
    desc.source_type = 999_999;
    assert_eq!(desc.source_kind(), None);
    let err = ImportTask::from_descriptor(&desc, FRONTEND).unwrap_err();
    assert!(matches!(err, TaskError::UnknownSourceKind(999_999)));
}

#[test]
fn test_importing_response_keeps_extra_fields() {
    let body = r#"{
        "builds": [
            {"task_id": 1, "user": "u", "project": "p", "branch": "master",
             "source_type": 1, "source_json": "{\"url\": \"http://x/a.src.rpm\"}",
             "priority": 3}
        ]
    }"#;
    let resp: ImportingResponse = serde_json::from_str(body).unwrap();
    assert_eq!(resp.builds.len(), 1);
    assert_eq!(resp.builds[0].extra.get("priority"), Some(&serde_json::json!(3)));

    let empty: ImportingResponse = serde_json::from_str("{}").unwrap();
    assert!(empty.builds.is_empty());
}

#[test]
fn test_abandonment_payload() {
    let json = serde_json::to_value(ImportReport::timed_out(123)).unwrap();
    assert_eq!(
        json,
        serde_json::json!({"task_id": 123, "error": "import_timeout_exceeded"})
    );
}

#[test]
fn test_agent_failure_payload() {
    let report = ImportReport::failure(
        9,
        ErrorCode::ImportAgentFailed,
        Some("agent exited with exit status: 1".into()),
    );
    assert_eq!(ErrorCode::ImportAgentFailed.to_string(), "import_agent_failed");
    assert_eq!(
        serde_json::to_value(&report).unwrap(),
        serde_json::json!({
            "task_id": 9,
            "error": "import_agent_failed",
            "message": "agent exited with exit status: 1"
        })
    );
}

#[test]
fn test_success_payload_round_trips_through_task() {
    let mut task = ImportTask::from_descriptor(&link_descriptor(), FRONTEND).unwrap();
    task.package_name = Some("bar_app".into());
    task.package_version = Some("2:0.01-1.fc20".into());
    task.git_hash = Some("1234abc".into());

    let json = serde_json::to_value(task.report()).unwrap();
    assert_eq!(
        json,
        serde_json::json!({
            "task_id": 123,
            "pkg_name": "bar_app",
            "pkg_version": "2:0.01-1.fc20",
            "repo_name": "foo/bar/bar_app",
            "git_hash": "1234abc",
        })
    );

    task.fail(ErrorCode::SrpmQueryFailed, "rpm: not an rpm package");
    let json = serde_json::to_value(task.report()).unwrap();
    assert_eq!(json["error"], "srpm_query_failed");
    assert_eq!(json["message"], "rpm: not an rpm package");
}

#[test]
fn test_task_survives_agent_handoff() {
    let task = ImportTask::from_descriptor(&upload_descriptor(), FRONTEND).unwrap();
    let json = serde_json::to_string(&task).unwrap();
    let back: ImportTask = serde_json::from_str(&json).unwrap();
    assert_eq!(back, task);
}
