//! Non-blocking append-only line writer.
//!
//! The decision loop must never wait on file I/O, so durable logs (unblocked
//! read ids, the per-chunk debug TSV) go through a bounded channel drained by
//! one dedicated writer thread. `append` uses `try_send`: when the queue is
//! full or the writer died the line is dropped and counted instead of
//! blocking the producer.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender, TrySendError};
use tracing::{error, warn};

const QUEUE_CAP: usize = 8192;
/// Flush after this many buffered lines so tail readers stay fresh without
/// paying a syscall per line.
const FLUSH_EVERY: usize = 32;

pub struct LineAppender {
    path: PathBuf,
    tx: Option<Sender<String>>,
    dropped: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl LineAppender {
    /// Open `path` for appending and start the writer thread. `header` is
    /// written first when the file did not previously exist.
    pub fn open(path: &Path, header: Option<&str>) -> std::io::Result<Self> {
        let existed = path.exists();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);
        if !existed {
            if let Some(header) = header {
                writeln!(writer, "{header}")?;
            }
        }
        let (tx, rx) = bounded::<String>(QUEUE_CAP);
        let thread_path = path.to_path_buf();
        let handle = std::thread::Builder::new()
            .name(format!(
                "append-{}",
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "log".into())
            ))
            .spawn(move || {
                let mut pending = 0usize;
                for line in rx {
                    if let Err(e) = writeln!(writer, "{line}") {
                        error!(
                            target: "stats.appender",
                            path = %thread_path.display(),
                            error = %e,
                            "append_write_failed"
                        );
                        return;
                    }
                    pending += 1;
                    if pending >= FLUSH_EVERY {
                        let _ = writer.flush();
                        pending = 0;
                    }
                }
                let _ = writer.flush();
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
            handle: Some(handle),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Enqueue one line. Never blocks; a full queue drops the line.
    pub fn append(&self, line: String) {
        let Some(tx) = &self.tx else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match tx.try_send(line) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                    warn!(
                        target: "stats.appender",
                        path = %self.path.display(),
                        "append_queue_saturated"
                    );
                }
            }
        }
    }

    /// Lines lost to queue saturation or writer failure.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drain the queue and stop the writer thread.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LineAppender {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_arrive_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids.txt");
        let appender = LineAppender::open(&path, None).unwrap();
        for i in 0..100 {
            appender.append(format!("read-{i}"));
        }
        appender.close();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 100);
        assert_eq!(lines[0], "read-0");
        assert_eq!(lines[99], "read-99");
    }

    #[test]
    fn header_written_only_for_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debug.tsv");
        let first = LineAppender::open(&path, Some("a\tb")).unwrap();
        first.append("1\t2".into());
        first.close();
        let second = LineAppender::open(&path, Some("a\tb")).unwrap();
        second.append("3\t4".into());
        second.close();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().collect::<Vec<_>>(), vec!["a\tb", "1\t2", "3\t4"]);
    }

    #[test]
    fn no_drops_under_normal_load() {
        let dir = tempfile::tempdir().unwrap();
        let appender = LineAppender::open(&dir.path().join("x.txt"), None).unwrap();
        for i in 0..1000 {
            appender.append(i.to_string());
        }
        assert_eq!(appender.dropped(), 0);
        appender.close();
    }
}
