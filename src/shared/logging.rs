use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// JSON-lines log sink handed to each runtime component.
///
/// Writes never fail the caller; an unwritable log is silently skipped.
#[derive(Debug, Clone)]
pub struct RuntimeLog {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl RuntimeLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self, event: &str, message: &str) {
        self.append("info", event, message);
    }

    pub fn warn(&self, event: &str, message: &str) {
        self.append("warn", event, message);
    }

    pub fn error(&self, event: &str, message: &str) {
        self.append("error", event, message);
    }

    pub fn append(&self, level: &str, event: &str, message: &str) {
        let payload = serde_json::json!({
            "timestamp": super::time::now_millis(),
            "level": level,
            "event": event,
            "message": message,
        });

        let Ok(line) = serde_json::to_string(&payload) else {
            return;
        };

        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(parent) = self.path.parent() {
            if fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let Ok(mut file) = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        else {
            return;
        };
        let _ = writeln!(file, "{line}");
    }
}

pub fn tail_lines(path: &Path, count: usize) -> Vec<String> {
    let raw = fs::read_to_string(path).unwrap_or_default();
    let mut recent = raw
        .lines()
        .rev()
        .take(count)
        .map(str::to_string)
        .collect::<Vec<_>>();
    recent.reverse();
    recent
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appends_one_json_object_per_line() {
        let dir = tempdir().expect("tempdir");
        let log = RuntimeLog::new(dir.path().join("logs/runtime.log"));
        log.info("task.started", "id=t1");
        log.warn("poll.fetch.failed", "boom");

        let lines = tail_lines(log.path(), 10);
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(&lines[0]).expect("json");
        assert_eq!(first["level"], "info");
        assert_eq!(first["event"], "task.started");
        assert_eq!(first["message"], "id=t1");
        let second: serde_json::Value = serde_json::from_str(&lines[1]).expect("json");
        assert_eq!(second["level"], "warn");
    }

    #[test]
    fn tail_returns_last_lines_in_order() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("x.log");
        fs::write(&path, "a\nb\nc\n").expect("write");
        assert_eq!(tail_lines(&path, 2), vec!["b".to_string(), "c".to_string()]);
        assert!(tail_lines(&dir.path().join("missing"), 2).is_empty());
    }
}
