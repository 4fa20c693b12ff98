//! Readers for the files an engine writes into its data directory.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

pub const SNAPSHOT_DIR: &str = "snapshots";
pub const STRUCTURED_LOG_FILE: &str = "events.jsonl";

/// Newest `*.json` file in `dir`, by modification time then file name.
///
/// A missing directory has no snapshot.
pub fn latest_snapshot_path(dir: &Path) -> Result<Option<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io(dir, e)),
    };

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        // The engine may delete old snapshots while we scan.
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let is_newer = match &newest {
            None => true,
            Some((time, best)) => (modified, &path) > (*time, best),
        };
        if is_newer {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

pub fn read_snapshot(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    serde_json::from_str(&content).map_err(|e| Error::Snapshot {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Parsed entries of a JSON-lines log, keeping the most recent `limit` in file order.
///
/// Blank and malformed lines (including a half-written last line) are skipped;
/// a failing read is an error.
pub fn read_structured_logs(path: &Path, limit: Option<usize>) -> Result<Vec<Value>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(path, e)),
    };

    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut entries = Vec::new();
    let mut line_no = 0usize;
    loop {
        buf.clear();
        // Read errors repeat on retry (EISDIR, EIO), so they end the read.
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => line_no += 1,
            Err(e) => return Err(Error::io(path, e)),
        }
        let line = String::from_utf8_lossy(&buf);
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                debug!(path = %path.display(), line = line_no, error = %e, "skipping malformed log line");
            }
        }
    }

    if let Some(limit) = limit {
        let excess = entries.len().saturating_sub(limit);
        entries.drain(..excess);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_missing_snapshot_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(latest_snapshot_path(&dir.path().join("nope")).unwrap(), None);
        assert_eq!(latest_snapshot_path(dir.path()).unwrap(), None);
    }

    #[test]
    fn test_latest_snapshot_prefers_newest_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("snapshot_000010.json"), r#"{"tick":10}"#).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(dir.path().join("snapshot_000020.json"), r#"{"tick":20}"#).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let latest = latest_snapshot_path(dir.path()).unwrap().unwrap();
        assert_eq!(latest.file_name().unwrap(), "snapshot_000020.json");
        assert_eq!(read_snapshot(&latest).unwrap(), json!({"tick": 20}));
    }

    #[test]
    fn test_malformed_snapshot_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot_1.json");
        std::fs::write(&path, "{\"tick\": ").unwrap();
        assert!(matches!(read_snapshot(&path), Err(Error::Snapshot { .. })));
    }

    #[test]
    fn test_structured_logs_skip_bad_lines_and_keep_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STRUCTURED_LOG_FILE);
        std::fs::write(
            &path,
            "{\"n\":1}\nnot json\n\n{\"n\":2}\n{\"n\":3}\n{\"n\":4, \"trunc",
        )
        .unwrap();

        let all = read_structured_logs(&path, None).unwrap();
        assert_eq!(all, vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);

        let tail = read_structured_logs(&path, Some(2)).unwrap();
        assert_eq!(tail, vec![json!({"n": 2}), json!({"n": 3})]);
    }

    #[test]
    fn test_unreadable_log_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STRUCTURED_LOG_FILE);
        std::fs::create_dir(&path).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let reader_path = path.clone();
        std::thread::spawn(move || {
            let _ = tx.send(read_structured_logs(&reader_path, Some(5)));
        });
        let result = rx
            .recv_timeout(Duration::from_secs(3))
            .expect("log read should return");
        assert!(matches!(result, Err(Error::Io { .. })));
    }

    #[test]
    fn test_invalid_utf8_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STRUCTURED_LOG_FILE);
        std::fs::write(&path, b"{\"n\":1}\n\xff\xfe\n{\"n\":2}\n").unwrap();

        let logs = read_structured_logs(&path, None).unwrap();
        assert_eq!(logs, vec![json!({"n": 1}), json!({"n": 2})]);
    }

    #[test]
    fn test_missing_log_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let logs = read_structured_logs(&dir.path().join(STRUCTURED_LOG_FILE), Some(5)).unwrap();
        assert!(logs.is_empty());
    }
}
