use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;

use crate::executor::ExecutionReport;

/// Report plus the moment the run was started, as printed by `--json`
#[derive(Serialize, Debug)]
pub struct RunSummary<'a> {
    pub started_at: String,
    #[serde(flatten)]
    pub report: &'a ExecutionReport,
}

/// Writes a captured output file under a `--- label ---` banner
///
/// Missing and empty files print nothing; contents are copied byte for byte.
pub fn write_captured(out: &mut impl Write, path: &Path, label: &str) -> io::Result<()> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if content.is_empty() {
        return Ok(());
    }

    writeln!(out, "\n--- {label} ---")?;
    out.write_all(&content)?;
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Termination;
    use assert_json_diff::assert_json_include;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn test_write_captured_skips_missing_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.txt");
        fs::write(&empty, b"").unwrap();

        let mut out = Vec::new();
        write_captured(&mut out, &dir.path().join("missing.txt"), "Program Output").unwrap();
        write_captured(&mut out, &empty, "Program Output").unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_write_captured_is_byte_faithful() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout.txt");
        fs::write(&path, b"hi\n\xff").unwrap();

        let mut out = Vec::new();
        write_captured(&mut out, &path, "Program Output").unwrap();
        assert_eq!(out, b"\n--- Program Output ---\nhi\n\xff\n".to_vec());
    }

    #[test]
    fn test_summary_json() {
        let report = ExecutionReport {
            termination: Termination::Signaled(libc::SIGXCPU),
            user_time: Duration::from_secs(1),
            system_time: Duration::ZERO,
            peak_memory_kb: 900,
            wall_time: Duration::from_millis(1200),
            child_failure: None,
            wall_limit_exceeded: false,
        };
        let summary = RunSummary {
            started_at: "2024-01-01T00:00:00.000Z".to_string(),
            report: &report,
        };

        assert_json_include!(
            actual: serde_json::to_value(&summary).unwrap(),
            expected: serde_json::json!({
                "started_at": "2024-01-01T00:00:00.000Z",
                "termination": { "kind": "signaled", "value": libc::SIGXCPU },
                "user_time_us": 1_000_000,
                "peak_memory_kb": 900,
            })
        );
    }
}
