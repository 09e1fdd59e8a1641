use std::fs;
use std::io;
use std::path::Path;

use super::types::{AuditError, AuditReport};

/// Write the report as pretty JSON with a trailing newline, creating parent directories.
pub fn write_report(path: &Path, report: &AuditReport) -> Result<(), AuditError> {
    write_json(path, report).map_err(|source| AuditError::ReportWrite {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json(path: &Path, report: &AuditReport) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut text = serde_json::to_string_pretty(report).map_err(io::Error::other)?;
    text.push('\n');
    fs::write(path, text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::types::AuditFailure;
    use serde_json::Value;

    fn report() -> AuditReport {
        AuditReport {
            base: "http://127.0.0.1:3000/".to_string(),
            generated_at: "2026-10-19T00:00:00+00:00".to_string(),
            pages_checked: 2,
            assets_checked: 1,
            page_failures: vec![AuditFailure {
                path: "/missing?x=1".to_string(),
                status: 404,
                error: None,
            }],
            asset_failures: Vec::new(),
        }
    }

    #[test]
    fn creates_directories_and_writes_camel_case_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports").join("audit-sitemap.json");

        write_report(&path, &report()).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.ends_with("}\n"));
        assert!(text.contains("\n  \"pagesChecked\": 2"));

        let json: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["base"], "http://127.0.0.1:3000/");
        assert_eq!(json["assetsChecked"], 1);
        assert_eq!(json["pageFailures"][0]["path"], "/missing?x=1");
        assert_eq!(json["pageFailures"][0]["status"], 404);
        assert!(json["pageFailures"][0]["error"].is_null());
        assert_eq!(json["assetFailures"].as_array().map(Vec::len), Some(0));
    }

    #[test]
    fn unwritable_target_is_a_report_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();

        let err = write_report(&blocker.join("report.json"), &report()).unwrap_err();
        assert!(matches!(err, AuditError::ReportWrite { .. }));
    }
}
