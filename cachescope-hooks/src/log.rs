//! Serialized trace-file writers
//!
//! Each tracked event appends one fixed-size record under a single
//! mutex. Writers block briefly per event; that is the whole concurrency
//! story for the log, the table carries the lock-free fast path.

use cachescope_protocol::{AllocEvent, StackEvent};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

pub struct EventLog {
    file: Mutex<File>,
}

impl EventLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(EventLog {
            file: Mutex::new(file),
        })
    }

    pub fn append_alloc(&self, event: &AllocEvent) {
        let buf = event.encode();
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(&buf);
        }
    }

    pub fn append_stack(&self, event: &StackEvent) {
        let buf = event.encode();
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(&buf);
        }
    }

    pub fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachescope_protocol::{AllocKind, ALLOC_RECORD_SIZE};

    #[test]
    fn appended_records_are_fixed_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alloc.trace");
        let log = EventLog::open(&path).unwrap();
        for i in 0..3u64 {
            log.append_alloc(&AllocEvent {
                base: 0x1000 + i,
                size: 64,
                kind: AllocKind::Heap,
                ..Default::default()
            });
        }
        log.flush();
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, 3 * ALLOC_RECORD_SIZE as u64);
    }

    #[test]
    fn parallel_appends_never_tear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alloc.trace");
        let log = std::sync::Arc::new(EventLog::open(&path).unwrap());
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let log = std::sync::Arc::clone(&log);
            handles.push(std::thread::spawn(move || {
                for i in 0..50u64 {
                    log.append_alloc(&AllocEvent {
                        base: t << 32 | i,
                        size: 16,
                        ..Default::default()
                    });
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        log.flush();
        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len() % ALLOC_RECORD_SIZE, 0);
        assert_eq!(data.len() / ALLOC_RECORD_SIZE, 200);
    }
}
