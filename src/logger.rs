use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::transfer::Transfer;

/// Sink for transfer lifecycle events
pub trait TransferLogger: Send + Sync {
    fn started(&self, _transfer: &Transfer) {}
    fn completed(&self, _transfer: &Transfer) {}
    fn failed(&self, _transfer: &Transfer, _msg: &str) {}
    fn checksum_mismatch(&self, _transfer: &Transfer, _expected: &str, _actual: &str) {}
}

pub struct NoopLogger;
impl TransferLogger for NoopLogger {}

/// Append-only `[timestamp] EVENT key=value` log
pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl TransferLogger for TextLogger {
    fn started(&self, t: &Transfer) {
        self.line(&format!(
            "START id={} kind={} dir={:?} name={} size={} peer={}",
            t.id, t.kind, t.direction, t.name, t.declared_size, t.peer_id
        ));
    }
    fn completed(&self, t: &Transfer) {
        let secs = (Utc::now() - t.started_at).num_milliseconds() as f64 / 1000.0;
        self.line(&format!(
            "DONE id={} bytes={} seconds={:.3}",
            t.id,
            t.bytes_complete(),
            secs
        ));
    }
    fn failed(&self, t: &Transfer, msg: &str) {
        self.line(&format!(
            "FAIL id={} bytes={}/{} msg={}",
            t.id,
            t.bytes_complete(),
            t.declared_size,
            msg
        ));
    }
    fn checksum_mismatch(&self, t: &Transfer, expected: &str, actual: &str) {
        self.line(&format!(
            "CHECKSUM id={} expected={} actual={}",
            t.id, expected, actual
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{test_spec, TransferRegistry};

    #[test]
    fn test_text_logger_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/transfers.log");
        let logger = TextLogger::new(&path).unwrap();
        let registry = TransferRegistry::new();
        let t = registry.start(test_spec(8));

        logger.started(&t);
        logger.checksum_mismatch(&t, "aa", "bb");
        logger.failed(&t, "connection reset");

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("START id=1 kind=File"));
        assert!(lines[1].contains("expected=aa actual=bb"));
        assert!(lines[2].contains("FAIL id=1 bytes=0/8 msg=connection reset"));
    }
}
