use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use crate::app::models::{OutputChunk, OutputEvent};
use crate::app::observable::{lock, Observable, Subscribers, Subscription};

struct BackingFile {
    path: PathBuf,
    file: Option<File>,
}

impl BackingFile {
    fn create(path: PathBuf) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = open_truncated(&path)?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    fn write(&mut self, content: &str) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(err) = file.write_all(content.as_bytes()).and_then(|_| file.flush()) {
            warn!(path = %self.path.display(), error = %err, "failed to mirror output to file");
            // Stop mirroring rather than logging on every chunk.
            self.file = None;
        }
    }

    fn truncate(&mut self) {
        match open_truncated(&self.path) {
            Ok(file) => self.file = Some(file),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to truncate output file");
                self.file = None;
            }
        }
    }
}

fn open_truncated(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
}

struct OutputInner {
    text: String,
    next_seq: u64,
    paused: bool,
    file: Option<BackingFile>,
    chunk_subscribers: Subscribers<OutputEvent>,
}

/// Session output sink: bounded in memory, mirrored in full to an optional
/// file, observable as whole snapshots or as a lossless chunk stream.
///
/// One writer (the shell reader thread) and any number of observers.
pub struct OutputBuffer {
    inner: Mutex<OutputInner>,
    max_retained: usize,
    snapshots: Observable<String>,
}

impl OutputBuffer {
    pub fn new(max_retained_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(OutputInner {
                text: String::new(),
                next_seq: 0,
                paused: false,
                file: None,
                chunk_subscribers: Subscribers::new(),
            }),
            max_retained: max_retained_bytes.max(1),
            snapshots: Observable::new(String::new()),
        }
    }

    /// Creates (or truncates) `path` and mirrors every chunk into it.
    pub fn with_file(max_retained_bytes: usize, path: impl Into<PathBuf>) -> io::Result<Self> {
        let buffer = Self::new(max_retained_bytes);
        let backing = BackingFile::create(path.into())?;
        lock(&buffer.inner).file = Some(backing);
        Ok(buffer)
    }

    pub fn append(&self, content: &str) -> Option<OutputChunk> {
        if content.is_empty() {
            return None;
        }
        let mut inner = lock(&self.inner);
        let chunk = OutputChunk {
            seq: inner.next_seq,
            content: content.to_string(),
        };
        inner.next_seq += 1;
        if let Some(file) = inner.file.as_mut() {
            file.write(content);
        }
        inner.text.push_str(content);
        trim_front(&mut inner.text, self.max_retained);

        inner
            .chunk_subscribers
            .broadcast(&OutputEvent::Chunk(chunk.clone()));
        if !inner.paused {
            self.snapshots.set(inner.text.clone());
        }
        Some(chunk)
    }

    /// Writes a `* message` diagnostic line into the output.
    pub fn debug(&self, message: &str) {
        self.append(&format!("* {message}\n"));
    }

    pub fn clear(&self) {
        let mut inner = lock(&self.inner);
        inner.text.clear();
        if let Some(file) = inner.file.as_mut() {
            file.truncate();
        }
        inner.chunk_subscribers.broadcast(&OutputEvent::Cleared);
        if !inner.paused {
            self.snapshots.set(String::new());
        }
    }

    pub fn snapshot(&self) -> String {
        lock(&self.inner).text.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).text.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).text.is_empty()
    }

    pub fn file_path(&self) -> Option<PathBuf> {
        lock(&self.inner).file.as_ref().map(|file| file.path.clone())
    }

    /// Full text after every append and clear, starting with the current one.
    pub fn subscribe_snapshots(&self) -> Subscription<String> {
        let _inner = lock(&self.inner);
        self.snapshots.subscribe()
    }

    /// The retained backlog, then every later chunk exactly once.
    pub fn subscribe(&self) -> Subscription<OutputEvent> {
        let mut inner = lock(&self.inner);
        let backlog = OutputEvent::Backlog(inner.text.clone());
        inner.chunk_subscribers.attach(Some(backlog))
    }

    /// While paused, snapshot observers are not notified. Chunks are still
    /// retained, mirrored and streamed.
    pub fn set_paused(&self, paused: bool) {
        let mut inner = lock(&self.inner);
        if inner.paused == paused {
            return;
        }
        inner.paused = paused;
        if !paused {
            self.snapshots.set(inner.text.clone());
        }
    }
}

/// Drops bytes from the front until `text` fits in `max`, on a char boundary.
fn trim_front(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = text.len() - max;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text.drain(..cut);
}
