//! Container log plumbing.
//!
//! Stdout/stderr of a container flow into [`FileLogWriter`]s that persist
//! Docker-shaped JSON log lines; TTY attaches use [`RawWriter`] (no
//! framing); client stdin arrives through a [`ChannelReader`].
//! [`ContainerLogManager`] owns the per-container path map and survives
//! daemon restarts without truncating files.

use crate::ids::ContainerId;
use crate::layout::FilesystemLayout;
use arca_shared::{ArcaError, ArcaResult};
use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Destination for container output bytes.
pub trait ByteSink: Send {
    fn write(&mut self, data: &[u8]) -> ArcaResult<()>;

    /// Flush and release. Later writes are an error.
    fn close(&mut self) -> ArcaResult<()> {
        Ok(())
    }
}

// ============================================================================
// FILE LOG WRITER
// ============================================================================

/// Persists one stream of a container as JSON log lines:
/// `{"stream":"stdout","log":"<line>","time":"<RFC3339>"}`.
///
/// Each source line (including its trailing newline) becomes one record;
/// a chunk that is not valid UTF-8 becomes a single record holding the
/// base64 of the whole chunk.
pub struct FileLogWriter {
    stream: &'static str,
    file: File,
    combined: Arc<Mutex<File>>,
}

impl FileLogWriter {
    pub fn new(stream: &'static str, file: File, combined: Arc<Mutex<File>>) -> Self {
        Self {
            stream,
            file,
            combined,
        }
    }

    fn emit(&mut self, log: &str) -> ArcaResult<()> {
        let time = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        let mut line = String::with_capacity(log.len() + 64);
        line.push_str("{\"stream\":\"");
        line.push_str(self.stream);
        line.push_str("\",\"log\":\"");
        escape_into(log, &mut line);
        line.push_str("\",\"time\":\"");
        line.push_str(&time);
        line.push_str("\"}\n");

        self.file
            .write_all(line.as_bytes())
            .map_err(|e| ArcaError::Internal(format!("log write failed: {e}")))?;
        self.combined
            .lock()
            .write_all(line.as_bytes())
            .map_err(|e| ArcaError::Internal(format!("combined log write failed: {e}")))
    }
}

impl ByteSink for FileLogWriter {
    fn write(&mut self, data: &[u8]) -> ArcaResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        match std::str::from_utf8(data) {
            Ok(text) => {
                for line in split_log_lines(text) {
                    self.emit(line)?;
                }
                Ok(())
            }
            Err(_) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(data);
                self.emit(&encoded)
            }
        }
    }

    fn close(&mut self) -> ArcaResult<()> {
        self.file
            .flush()
            .map_err(|e| ArcaError::Internal(format!("log flush failed: {e}")))?;
        self.combined
            .lock()
            .flush()
            .map_err(|e| ArcaError::Internal(format!("combined log flush failed: {e}")))
    }
}

/// Split a chunk into log records: one per `\n`-terminated line, plus a
/// final unterminated remainder if present. Nothing is emitted for the
/// empty tail after the last newline.
fn split_log_lines(text: &str) -> impl Iterator<Item = &str> {
    text.split_inclusive('\n')
}

/// The documented escape set: backslash, quote, newline, carriage return,
/// tab. Other bytes pass through untouched.
fn escape_into(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
}

// ============================================================================
// RAW WRITER
// ============================================================================

/// Forwards raw output bytes to an attach client, unframed. Used for TTY
/// attach, where stdout and stderr are already merged.
pub struct RawWriter {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl RawWriter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Wrap an existing consumer channel.
    pub fn from_sender(tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { tx: Some(tx) }
    }
}

impl ByteSink for RawWriter {
    fn write(&mut self, data: &[u8]) -> ArcaResult<()> {
        match &self.tx {
            // A consumer that went away is an end of attachment, not a
            // container failure.
            Some(tx) => {
                let _ = tx.send(data.to_vec());
                Ok(())
            }
            None => Err(ArcaError::Internal("write after close".into())),
        }
    }

    fn close(&mut self) -> ArcaResult<()> {
        self.tx = None;
        Ok(())
    }
}

// ============================================================================
// CHANNEL READER
// ============================================================================

/// Client-supplied stdin stream, exposed as a chunk source for the
/// container. Dropping the client sender finishes the stream.
pub struct ChannelReader {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ChannelReader {
    pub fn new() -> (mpsc::UnboundedSender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    pub fn from_receiver(rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    /// Next stdin chunk; `None` once the client closed the stream.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Stop accepting further input.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

// ============================================================================
// CONTAINER LOG MANAGER
// ============================================================================

/// On-disk log locations of one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub combined: PathBuf,
}

/// Maps container IDs to their log files under the logs root.
pub struct ContainerLogManager {
    layout: FilesystemLayout,
    paths: Mutex<HashMap<String, LogPaths>>,
}

impl ContainerLogManager {
    pub fn new(layout: FilesystemLayout) -> Self {
        Self {
            layout,
            paths: Mutex::new(HashMap::new()),
        }
    }

    fn paths_for(&self, id: &ContainerId) -> LogPaths {
        let dir = self.layout.container_logs_dir(id);
        LogPaths {
            stdout: dir.join("stdout.log"),
            stderr: dir.join("stderr.log"),
            combined: dir.join("combined.log"),
        }
    }

    /// Create (or reopen in append mode) the log files and return the
    /// stdout and stderr writers.
    pub fn create_log_writers(
        &self,
        id: &ContainerId,
    ) -> ArcaResult<(FileLogWriter, FileLogWriter)> {
        let paths = self.paths_for(id);
        let dir = self.layout.container_logs_dir(id);
        std::fs::create_dir_all(&dir).map_err(|e| {
            ArcaError::Internal(format!("failed to create {}: {e}", dir.display()))
        })?;

        let open = |path: &PathBuf| -> ArcaResult<File> {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| ArcaError::Internal(format!("failed to open {}: {e}", path.display())))
        };

        let combined = Arc::new(Mutex::new(open(&paths.combined)?));
        let stdout = FileLogWriter::new("stdout", open(&paths.stdout)?, Arc::clone(&combined));
        let stderr = FileLogWriter::new("stderr", open(&paths.stderr)?, combined);

        self.paths.lock().insert(id.as_str().to_string(), paths);
        Ok((stdout, stderr))
    }

    /// Re-bind the path map after a daemon restart. Files are left alone,
    /// so history survives.
    pub fn register_existing_log_paths(&self, id: &ContainerId) {
        let paths = self.paths_for(id);
        self.paths.lock().insert(id.as_str().to_string(), paths);
    }

    pub fn log_paths(&self, id: &ContainerId) -> Option<LogPaths> {
        self.paths.lock().get(id.as_str()).cloned()
    }

    /// Delete the container's log directory and drop the mapping.
    pub fn remove_logs(&self, id: &ContainerId) -> ArcaResult<()> {
        self.paths.lock().remove(id.as_str());
        let dir = self.layout.container_logs_dir(id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| {
                ArcaError::Internal(format!("failed to remove {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, ContainerLogManager) {
        let tmp = tempfile::TempDir::new().unwrap();
        let layout = FilesystemLayout::new(tmp.path().to_path_buf());
        layout.prepare().unwrap();
        (tmp, ContainerLogManager::new(layout))
    }

    fn read_records(path: &PathBuf) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn one_record_per_line() {
        let (_tmp, mgr) = manager();
        let id = ContainerId::new();
        let (mut stdout, _stderr) = mgr.create_log_writers(&id).unwrap();

        stdout.write(b"first\nsecond\n").unwrap();
        stdout.close().unwrap();

        let records = read_records(&mgr.log_paths(&id).unwrap().stdout);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["stream"], "stdout");
        assert_eq!(records[0]["log"], "first\n");
        assert_eq!(records[1]["log"], "second\n");
        assert!(records[0]["time"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn unterminated_tail_is_its_own_record() {
        let (_tmp, mgr) = manager();
        let id = ContainerId::new();
        let (mut stdout, _stderr) = mgr.create_log_writers(&id).unwrap();

        stdout.write(b"partial").unwrap();
        let records = read_records(&mgr.log_paths(&id).unwrap().stdout);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["log"], "partial");
    }

    #[test]
    fn escapes_round_trip_through_json() {
        let (_tmp, mgr) = manager();
        let id = ContainerId::new();
        let (mut stdout, _stderr) = mgr.create_log_writers(&id).unwrap();

        let message = "quote\" back\\slash tab\t cr\r end\n";
        stdout.write(message.as_bytes()).unwrap();

        let records = read_records(&mgr.log_paths(&id).unwrap().stdout);
        // \r splits nothing; only \n terminates a record.
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["log"].as_str().unwrap(), message);
    }

    #[test]
    fn non_utf8_becomes_base64_record() {
        let (_tmp, mgr) = manager();
        let id = ContainerId::new();
        let (mut stdout, _stderr) = mgr.create_log_writers(&id).unwrap();

        let chunk = [0xff, 0xfe, b'h', b'i'];
        stdout.write(&chunk).unwrap();

        let records = read_records(&mgr.log_paths(&id).unwrap().stdout);
        assert_eq!(records.len(), 1);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(records[0]["log"].as_str().unwrap())
            .unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn stderr_and_stdout_share_combined() {
        let (_tmp, mgr) = manager();
        let id = ContainerId::new();
        let (mut stdout, mut stderr) = mgr.create_log_writers(&id).unwrap();

        stdout.write(b"out\n").unwrap();
        stderr.write(b"err\n").unwrap();

        let paths = mgr.log_paths(&id).unwrap();
        let combined = read_records(&paths.combined);
        assert_eq!(combined.len(), 2);
        assert_eq!(combined[0]["stream"], "stdout");
        assert_eq!(combined[1]["stream"], "stderr");

        assert_eq!(read_records(&paths.stderr).len(), 1);
    }

    #[test]
    fn rebind_does_not_truncate() {
        let (_tmp, mgr) = manager();
        let id = ContainerId::new();
        {
            let (mut stdout, _stderr) = mgr.create_log_writers(&id).unwrap();
            stdout.write(b"before restart\n").unwrap();
        }

        mgr.register_existing_log_paths(&id);
        let (mut stdout, _stderr) = mgr.create_log_writers(&id).unwrap();
        stdout.write(b"after restart\n").unwrap();

        let records = read_records(&mgr.log_paths(&id).unwrap().stdout);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn remove_logs_deletes_directory() {
        let (_tmp, mgr) = manager();
        let id = ContainerId::new();
        let _ = mgr.create_log_writers(&id).unwrap();

        mgr.remove_logs(&id).unwrap();
        assert!(mgr.log_paths(&id).is_none());
    }

    #[tokio::test]
    async fn channel_reader_finishes_on_close() {
        let (tx, mut reader) = ChannelReader::new();
        tx.send(b"stdin data".to_vec()).unwrap();
        drop(tx);

        assert_eq!(reader.next_chunk().await.unwrap(), b"stdin data");
        assert!(reader.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn raw_writer_forwards_unframed() {
        let (mut writer, mut rx) = RawWriter::new();
        writer.write(b"\x1b[1mprompt$ ").unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"\x1b[1mprompt$ ");

        writer.close().unwrap();
        assert!(writer.write(b"more").is_err());
    }
}
