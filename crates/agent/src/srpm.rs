//! Name and version of a source RPM.

use std::collections::BTreeMap;
use std::path::Path;

use importer_core::config::CommandTemplate;

use crate::error::ImportError;
use crate::exec;

/// Runs the query command on `srpm` and returns `(name, version)`.
pub async fn query_name_evr(
    template: &CommandTemplate,
    srpm: &Path,
) -> Result<(String, String), ImportError> {
    let vars = BTreeMap::from([("srpm", srpm.display().to_string())]);
    let argv = template.render(&vars);
    let program = argv.first().map(String::as_str).unwrap_or_default();
    let out = exec::run(&argv, None)
        .await
        .map_err(|e| ImportError::Query(format!("cannot run {program}: {e}")))?;
    if !out.success() {
        return Err(ImportError::Query(out.describe(program)));
    }
    parse_name_evr(&out.stdout, &out.stderr)
}

/// Parses `NAME EPOCH VERSION RELEASE`. Any stderr output is a failure.
pub fn parse_name_evr(stdout: &str, stderr: &str) -> Result<(String, String), ImportError> {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return Err(ImportError::Query(stderr.to_string()));
    }
    let fields: Vec<&str> = stdout.split_whitespace().collect();
    let [name, epoch, version, release] = fields.as_slice() else {
        return Err(ImportError::Query(format!(
            "expected NAME EPOCH VERSION RELEASE, got {:?}",
            stdout.trim()
        )));
    };
    let evr = if *epoch == "(none)" {
        format!("{version}-{release}")
    } else {
        format!("{epoch}:{version}-{release}")
    };
    Ok((name.to_string(), evr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_is_omitted_when_unset() {
        let plan = [
            (("(none)", "0.1", "1.fc20"), "0.1-1.fc20"),
            (("2", "0.1", "1.fc20"), "2:0.1-1.fc20"),
        ];
        for ((e, v, r), expected) in plan {
            let out = format!("foo {e} {v} {r}");
            let (name, evr) = parse_name_evr(&out, "").unwrap();
            assert_eq!(name, "foo");
            assert_eq!(evr, expected);
        }
    }

    #[test]
    fn stderr_or_empty_output_fails() {
        assert!(matches!(
            parse_name_evr("foo (none) 0.1 1.fc20", "err msg"),
            Err(ImportError::Query(_))
        ));
        assert!(matches!(parse_name_evr("", ""), Err(ImportError::Query(_))));
        assert!(matches!(parse_name_evr("foo 0.1", ""), Err(ImportError::Query(_))));
    }

    #[tokio::test]
    async fn query_runs_template() {
        let template = CommandTemplate::from(["sh", "-c", "echo bar_app 2 0.01 1.fc20 # {srpm}"]);
        let got = query_name_evr(&template, Path::new("/dev/null")).await.unwrap();
        assert_eq!(got, ("bar_app".to_string(), "2:0.01-1.fc20".to_string()));

        let missing = CommandTemplate::from(["/nonexistent/rpm", "{srpm}"]);
        assert!(matches!(
            query_name_evr(&missing, Path::new("/dev/null")).await,
            Err(ImportError::Query(_))
        ));
    }
}
