use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use crate::app::error::TransportError;

/// Byte-level link to the debugging endpoint.
///
/// Implementations never retry; every failure is reported to the caller.
pub trait Transport: Send + Sync {
    /// Sends pairing credentials and returns whether the device accepted them.
    fn pair(&self, port: u16, code: &str) -> Result<bool, TransportError>;

    /// Opens the shell channel.
    fn connect(&self) -> Result<Connection, TransportError>;
}

/// Tears down a connection from any thread, unblocking pending reads and writes.
pub trait CloseHandle: Send + Sync {
    fn close(&self);
}

pub struct Connection {
    writer: Box<dyn Write + Send>,
    reader: Option<Box<dyn Read + Send>>,
    closer: Arc<dyn CloseHandle>,
}

impl Connection {
    pub fn new(
        writer: Box<dyn Write + Send>,
        reader: Box<dyn Read + Send>,
        closer: Arc<dyn CloseHandle>,
    ) -> Self {
        Self {
            writer,
            reader: Some(reader),
            closer,
        }
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.writer
            .write_all(bytes)
            .and_then(|_| self.writer.flush())
            .map_err(|err| match err.kind() {
                io::ErrorKind::TimedOut => TransportError::from_io(&err),
                _ => TransportError::reset(format!("shell write failed: {err}")),
            })
    }

    /// The output side. Can be taken once; reads return 0 after close.
    pub fn take_reader(&mut self) -> Option<Box<dyn Read + Send>> {
        self.reader.take()
    }

    pub fn close_handle(&self) -> Arc<dyn CloseHandle> {
        Arc::clone(&self.closer)
    }

    pub fn close(&self) {
        self.closer.close();
    }
}

/// Merges byte chunks from several producer threads into one `Read`.
///
/// Returns end of stream once every sender is gone or `closed` is raised.
pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
    closed: Arc<AtomicBool>,
}

impl PipeReader {
    pub fn new(closed: Arc<AtomicBool>) -> (Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel();
        (
            tx,
            Self {
                rx,
                pending: Vec::new(),
                offset: 0,
                closed,
            },
        )
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.offset >= self.pending.len() {
            if self.closed.load(Ordering::Relaxed) {
                return Ok(0);
            }
            match self.rx.recv_timeout(Duration::from_millis(50)) {
                Ok(bytes) => {
                    self.pending = bytes;
                    self.offset = 0;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let available = &self.pending[self.offset..];
        let count = available.len().min(buf.len());
        buf[..count].copy_from_slice(&available[..count]);
        self.offset += count;
        Ok(count)
    }
}
