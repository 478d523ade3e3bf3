//! Logging initialization and the rotating file sink.
//!
//! Call sites use `tracing` macros; this module wires the subscriber. The
//! sink rotates by calendar day and again every `split_lines` entries within
//! a day (suffix `.N`). Two write modes: sync (mutex around the file) and
//! async (bounded queue drained by one writer thread; a full queue falls
//! back to a synchronous write so entries are never dropped).

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{Datelike, Local};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

const DEFAULT_LOG_PATH: &str = "./server-log/minuet.log";
const DEFAULT_SPLIT_LINES: u64 = 800_000;
const ASYNC_QUEUE_CAPACITY: usize = 800;

/// Keeps the sink alive; dropping it flushes (and joins the async writer).
pub struct LogGuard {
    sink: Option<LogSink>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.shutdown();
        }
    }
}

/// Install the tracing subscriber per config. Returns None when logging is
/// disabled (`-c 1`); tracing macros become no-ops in that case.
pub fn init(cfg: &Config) -> Option<LogGuard> {
    if !cfg.log_enabled() {
        return None;
    }

    let file = RotatingFile::open(Path::new(DEFAULT_LOG_PATH), DEFAULT_SPLIT_LINES)
        .map_err(|e| eprintln!("minuet: cannot open log file: {}", e))
        .ok()?;

    let sink = if cfg.log_write == 1 {
        LogSink::spawn_async(file)
    } else {
        LogSink::sync(file)
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(sink.clone())
        .init();

    Some(LogGuard { sink: Some(sink) })
}

// ─── Rotating file ────────────────────────────────────────────

/// A log file that rotates by day and by entry count.
struct RotatingFile {
    dir: PathBuf,
    name: String,
    split_lines: u64,
    file: File,
    day: u32,
    count: u64,
}

impl RotatingFile {
    fn open(path: &Path, split_lines: u64) -> io::Result<Self> {
        let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "minuet.log".to_string());

        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(&dir)?;
        }

        let now = Local::now();
        let file = Self::open_segment(&dir, &name, None)?;
        Ok(Self {
            dir,
            name,
            split_lines,
            file,
            day: now.day(),
            count: 0,
        })
    }

    fn segment_path(dir: &Path, name: &str, suffix: Option<u64>) -> PathBuf {
        let stamp = Local::now().format("%Y_%m_%d");
        let base = format!("{}_{}", stamp, name);
        match suffix {
            Some(n) => dir.join(format!("{}.{}", base, n)),
            None => dir.join(base),
        }
    }

    fn open_segment(dir: &Path, name: &str, suffix: Option<u64>) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::segment_path(dir, name, suffix))
    }

    /// Write one log entry, rotating first if the day changed or the line
    /// budget tripped.
    fn write_entry(&mut self, entry: &[u8]) -> io::Result<()> {
        let now = Local::now();
        self.count += 1;

        if self.day != now.day() {
            self.file.flush()?;
            self.day = now.day();
            self.count = 0;
            self.file = Self::open_segment(&self.dir, &self.name, None)?;
        } else if self.count % self.split_lines == 0 {
            self.file.flush()?;
            self.file =
                Self::open_segment(&self.dir, &self.name, Some(self.count / self.split_lines))?;
        }

        self.file.write_all(entry)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

// ─── Sink: sync or bounded-queue async ────────────────────────

#[derive(Clone)]
enum LogSink {
    Sync(Arc<Mutex<RotatingFile>>),
    Async {
        tx: SyncSender<Vec<u8>>,
        // The fallback path writes directly when the queue is full.
        file: Arc<Mutex<RotatingFile>>,
        handle: Arc<Mutex<Option<thread::JoinHandle<()>>>>,
    },
}

impl LogSink {
    fn sync(file: RotatingFile) -> Self {
        LogSink::Sync(Arc::new(Mutex::new(file)))
    }

    fn spawn_async(file: RotatingFile) -> Self {
        let file = Arc::new(Mutex::new(file));
        let (tx, rx): (SyncSender<Vec<u8>>, Receiver<Vec<u8>>) =
            sync_channel(ASYNC_QUEUE_CAPACITY);

        let writer_file = Arc::clone(&file);
        let handle = thread::Builder::new()
            .name("minuet-log".to_string())
            .spawn(move || {
                // An empty entry is the shutdown sentinel; the subscriber
                // itself never submits one.
                while let Ok(entry) = rx.recv() {
                    if entry.is_empty() {
                        break;
                    }
                    if let Ok(mut f) = writer_file.lock() {
                        let _ = f.write_entry(&entry);
                    }
                }
                if let Ok(mut f) = writer_file.lock() {
                    let _ = f.flush();
                }
            })
            .expect("failed to spawn log writer thread");

        LogSink::Async {
            tx,
            file,
            handle: Arc::new(Mutex::new(Some(handle))),
        }
    }

    fn submit(&self, entry: Vec<u8>) {
        match self {
            LogSink::Sync(file) => {
                if let Ok(mut f) = file.lock() {
                    let _ = f.write_entry(&entry);
                }
            }
            LogSink::Async { tx, file, .. } => match tx.try_send(entry) {
                Ok(()) => {}
                Err(TrySendError::Full(entry)) | Err(TrySendError::Disconnected(entry)) => {
                    if let Ok(mut f) = file.lock() {
                        let _ = f.write_entry(&entry);
                    }
                }
            },
        }
    }

    fn shutdown(self) {
        match self {
            LogSink::Sync(file) => {
                if let Ok(mut f) = file.lock() {
                    let _ = f.flush();
                }
            }
            LogSink::Async { tx, handle, .. } => {
                let _ = tx.send(Vec::new());
                if let Ok(mut slot) = handle.lock() {
                    if let Some(h) = slot.take() {
                        let _ = h.join();
                    }
                }
            }
        }
    }
}

/// Buffers one formatted event and submits it to the sink on drop.
struct EntryWriter {
    sink: LogSink,
    buf: Vec<u8>,
}

impl Write for EntryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for EntryWriter {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            self.sink.submit(std::mem::take(&mut self.buf));
        }
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = EntryWriter;

    fn make_writer(&'a self) -> Self::Writer {
        EntryWriter {
            sink: self.clone(),
            buf: Vec::with_capacity(256),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("minuet_log_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn read_all_segments(dir: &Path) -> String {
        let mut out = String::new();
        for entry in fs::read_dir(dir).unwrap() {
            out.push_str(&fs::read_to_string(entry.unwrap().path()).unwrap());
        }
        out
    }

    #[test]
    fn sync_sink_writes_entries() {
        let dir = temp_dir();
        let file = RotatingFile::open(&dir.join("test.log"), 1000).unwrap();
        let sink = LogSink::sync(file);

        sink.submit(b"first entry\n".to_vec());
        sink.submit(b"second entry\n".to_vec());
        sink.shutdown();

        let contents = read_all_segments(&dir);
        assert!(contents.contains("first entry"));
        assert!(contents.contains("second entry"));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn async_sink_drains_queue_on_shutdown() {
        let dir = temp_dir();
        let file = RotatingFile::open(&dir.join("test.log"), 1000).unwrap();
        let sink = LogSink::spawn_async(file);

        for i in 0..50 {
            sink.submit(format!("entry {}\n", i).into_bytes());
        }
        sink.shutdown();

        let contents = read_all_segments(&dir);
        assert!(contents.contains("entry 0"));
        assert!(contents.contains("entry 49"));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rotates_after_split_lines() {
        let dir = temp_dir();
        let mut file = RotatingFile::open(&dir.join("test.log"), 3).unwrap();

        for i in 0..7 {
            file.write_entry(format!("line {}\n", i).as_bytes()).unwrap();
        }
        file.flush().unwrap();

        let segments = fs::read_dir(&dir).unwrap().count();
        // 7 entries with a budget of 3 per segment: base file plus .1 and .2.
        assert_eq!(segments, 3);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn entry_writer_submits_once_on_drop() {
        let dir = temp_dir();
        let file = RotatingFile::open(&dir.join("test.log"), 1000).unwrap();
        let sink = LogSink::sync(file);

        {
            let mut w = sink.make_writer();
            w.write_all(b"split ").unwrap();
            w.write_all(b"event\n").unwrap();
        }
        sink.shutdown();

        let contents = read_all_segments(&dir);
        assert!(contents.contains("split event"));
        fs::remove_dir_all(&dir).ok();
    }
}
