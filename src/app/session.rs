use std::io::{ErrorKind, Read};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::config::SessionSettings;
use crate::app::decoder::OutputDecoder;
use crate::app::error::{SessionError, TransportError};
use crate::app::models::{SessionInfo, SessionState};
use crate::app::observable::{lock, Observable, Subscription};
use crate::app::output::OutputBuffer;
use crate::app::transport::{CloseHandle, Connection, Transport};

/// Reader batching and settle detection knobs.
#[derive(Debug, Clone)]
pub struct SessionTuning {
    pub read_buffer_size: usize,
    pub batch_delay: Duration,
    pub batch_max_len: usize,
    /// Output is settled after this long without new bytes...
    pub settle_quiet: Duration,
    /// ...or once this much time has passed since the write.
    pub settle_max: Duration,
}

impl SessionTuning {
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            read_buffer_size: settings.read_buffer_size.max(1),
            batch_delay: Duration::from_millis(settings.batch_delay_ms),
            batch_max_len: settings.batch_max_len.max(1),
            settle_quiet: Duration::from_millis(settings.settle_quiet_ms),
            settle_max: Duration::from_millis(settings.settle_max_ms),
        }
    }
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self::from_settings(&SessionSettings::default())
    }
}

struct Outgoing {
    payload: String,
    script: bool,
}

struct SessionCore {
    state: SessionState,
    close_handle: Option<Arc<dyn CloseHandle>>,
    queue_tx: Option<Sender<Outgoing>>,
    // Queued or in-flight items.
    pending: usize,
    started_at: Option<DateTime<Utc>>,
    last_output: Instant,
}

struct Shared {
    session_id: String,
    trace_id: String,
    core: Mutex<SessionCore>,
    output: Arc<OutputBuffer>,
    tuning: SessionTuning,
    state: Observable<SessionState>,
    started: Observable<bool>,
    closed: Observable<bool>,
}

impl Shared {
    fn set_state(&self, core: &mut SessionCore, next: SessionState) {
        if core.state != next {
            debug!(session_id = %self.session_id, from = ?core.state, to = ?next, "session state");
        }
        core.state = next;
        self.state.set_if_changed(next);
    }

    /// Appends decoded output unless the session is already closed.
    fn emit(&self, text: &str) -> bool {
        let core = lock(&self.core);
        if core.state.is_closed() {
            return false;
        }
        self.output.append(text);
        true
    }

    fn mark_output(&self) {
        lock(&self.core).last_output = Instant::now();
    }

    fn force_close(&self, reason: &str) {
        let handle = {
            let mut core = lock(&self.core);
            if core.state.is_closed() {
                return;
            }
            self.set_state(&mut core, SessionState::Closed);
            core.queue_tx = None;
            core.pending = 0;
            self.started.set_if_changed(false);
            self.closed.set_if_changed(true);
            core.close_handle.take()
        };
        info!(session_id = %self.session_id, trace_id = %self.trace_id, reason, "shell session closed");
        if let Some(handle) = handle {
            handle.close();
        }
    }
}

/// One shell channel and the threads that feed it.
pub struct CommandSession {
    shared: Arc<Shared>,
}

impl CommandSession {
    pub fn new(output: Arc<OutputBuffer>, tuning: SessionTuning, trace_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                session_id: Uuid::new_v4().to_string(),
                trace_id: trace_id.into(),
                core: Mutex::new(SessionCore {
                    state: SessionState::Idle,
                    close_handle: None,
                    queue_tx: None,
                    pending: 0,
                    started_at: None,
                    last_output: Instant::now(),
                }),
                output,
                tuning,
                state: Observable::new(SessionState::Idle),
                started: Observable::new(false),
                closed: Observable::new(false),
            }),
        }
    }

    pub fn start(&self, transport: &dyn Transport) -> Result<(), SessionError> {
        {
            let mut core = lock(&self.shared.core);
            match core.state {
                SessionState::Idle => {}
                SessionState::Closed => return Err(SessionError::Closed),
                _ => return Err(SessionError::AlreadyStarted),
            }
            self.shared.set_state(&mut core, SessionState::Starting);
        }

        let mut connection = match transport.connect() {
            Ok(connection) => connection,
            Err(err) => {
                warn!(session_id = %self.shared.session_id, error = %err, "failed to open shell");
                self.shared.force_close("connect failed");
                return Err(err.into());
            }
        };
        let Some(reader) = connection.take_reader() else {
            connection.close();
            self.shared.force_close("shell output unavailable");
            return Err(TransportError::reset("shell output unavailable").into());
        };
        let handle = connection.close_handle();
        let (queue_tx, queue_rx) = mpsc::channel();

        {
            let mut core = lock(&self.shared.core);
            if core.state.is_closed() {
                drop(core);
                handle.close();
                return Err(SessionError::Closed);
            }
            core.close_handle = Some(handle);
            core.queue_tx = Some(queue_tx);
            core.started_at = Some(Utc::now());
            core.last_output = Instant::now();
            self.shared.set_state(&mut core, SessionState::Ready);
            self.shared.started.set_if_changed(true);
        }

        let shared = Arc::clone(&self.shared);
        thread::spawn(move || read_loop(shared, reader));
        let shared = Arc::clone(&self.shared);
        thread::spawn(move || dispatch_loop(shared, connection, queue_rx));

        info!(
            session_id = %self.shared.session_id,
            trace_id = %self.shared.trace_id,
            "shell session started"
        );
        Ok(())
    }

    /// Queues one line of input. Blank input is ignored.
    pub fn send(&self, text: &str, add_newline: bool) -> Result<(), SessionError> {
        if text.trim().is_empty() {
            return Ok(());
        }
        let mut payload = text.to_string();
        if add_newline {
            payload.push('\n');
        }
        self.enqueue(Outgoing {
            payload,
            script: false,
        })
    }

    /// Queues a whole script, written in a single call.
    pub fn send_script(&self, script: &str) -> Result<(), SessionError> {
        if script.trim().is_empty() {
            return Ok(());
        }
        let mut payload = script.to_string();
        if !payload.ends_with('\n') {
            payload.push('\n');
        }
        self.enqueue(Outgoing {
            payload,
            script: true,
        })
    }

    fn enqueue(&self, item: Outgoing) -> Result<(), SessionError> {
        let mut core = lock(&self.shared.core);
        match core.state {
            SessionState::Closed => return Err(SessionError::Closed),
            SessionState::Idle | SessionState::Starting => return Err(SessionError::NotReady),
            SessionState::Ready | SessionState::Executing => {}
        }
        let tx = core.queue_tx.as_ref().ok_or(SessionError::Closed)?;
        tx.send(item).map_err(|_| SessionError::Closed)?;
        core.pending += 1;
        Ok(())
    }

    pub fn close(&self) {
        self.shared.force_close("closed by caller");
    }

    pub fn state(&self) -> SessionState {
        lock(&self.shared.core).state
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn info(&self) -> SessionInfo {
        let core = lock(&self.shared.core);
        SessionInfo {
            session_id: self.shared.session_id.clone(),
            state: core.state,
            started_at: core.started_at.map(|at| at.to_rfc3339()),
        }
    }

    pub fn subscribe_state(&self) -> Subscription<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn started(&self) -> Observable<bool> {
        self.shared.started.clone()
    }

    pub fn closed(&self) -> Observable<bool> {
        self.shared.closed.clone()
    }
}

impl Drop for CommandSession {
    fn drop(&mut self) {
        self.shared.force_close("session dropped");
    }
}

fn dispatch_loop(shared: Arc<Shared>, mut connection: Connection, queue: Receiver<Outgoing>) {
    while let Ok(item) = queue.recv() {
        {
            let mut core = lock(&shared.core);
            if core.state.is_closed() {
                break;
            }
            shared.set_state(&mut core, SessionState::Executing);
        }

        if let Err(err) = connection.write(item.payload.as_bytes()) {
            warn!(
                session_id = %shared.session_id,
                trace_id = %shared.trace_id,
                error = %err,
                "failed to write to shell"
            );
            shared.force_close("write failed");
            break;
        }
        debug!(
            session_id = %shared.session_id,
            bytes = item.payload.len(),
            script = item.script,
            "input written"
        );

        wait_for_settle(&shared, Instant::now());

        let mut core = lock(&shared.core);
        if core.state.is_closed() {
            break;
        }
        core.pending = core.pending.saturating_sub(1);
        if core.pending == 0 {
            shared.set_state(&mut core, SessionState::Ready);
        }
    }
}

fn wait_for_settle(shared: &Shared, written_at: Instant) {
    let tuning = &shared.tuning;
    let tick = (tuning.settle_quiet / 4).clamp(Duration::from_millis(1), Duration::from_millis(25));
    loop {
        let (closed, last_output) = {
            let core = lock(&shared.core);
            (core.state.is_closed(), core.last_output)
        };
        if closed || written_at.elapsed() >= tuning.settle_max {
            return;
        }
        let quiet_since = last_output.max(written_at);
        if quiet_since.elapsed() >= tuning.settle_quiet {
            return;
        }
        thread::sleep(tick);
    }
}

fn read_loop(shared: Arc<Shared>, mut reader: Box<dyn Read + Send>) {
    let tuning = shared.tuning.clone();
    let mut decoder = OutputDecoder::new();
    let mut temp = vec![0u8; tuning.read_buffer_size];
    let mut pending = String::new();
    let mut last_emit = Instant::now();

    loop {
        let read_count = match reader.read(&mut temp) {
            Ok(0) => break,
            Ok(count) => count,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(
                    session_id = %shared.session_id,
                    trace_id = %shared.trace_id,
                    error = %err,
                    "failed to read shell output"
                );
                break;
            }
        };
        shared.mark_output();
        let chunk = decoder.decode(&temp[..read_count]);
        pending.push_str(&chunk);
        // A lone small read must flush too, or it sits until the next one.
        if pending.len() >= tuning.batch_max_len
            || read_count < temp.len()
            || chunk.contains('\n')
            || chunk.contains('\r')
            || last_emit.elapsed() >= tuning.batch_delay
        {
            let flush = std::mem::take(&mut pending);
            if !flush.is_empty() && !shared.emit(&flush) {
                return;
            }
            last_emit = Instant::now();
        }
    }

    pending.push_str(&decoder.finish());
    if !pending.is_empty() {
        shared.emit(&pending);
    }
    shared.force_close("shell output ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::error::TransportErrorKind;
    use crate::app::transport::testing::ScriptedTransport;

    fn fast_tuning() -> SessionTuning {
        SessionTuning {
            read_buffer_size: 4096,
            batch_delay: Duration::from_millis(5),
            batch_max_len: 16_384,
            settle_quiet: Duration::from_millis(20),
            settle_max: Duration::from_millis(200),
        }
    }

    fn session() -> (CommandSession, Arc<OutputBuffer>) {
        let output = Arc::new(OutputBuffer::new(64 * 1024));
        let session = CommandSession::new(Arc::clone(&output), fast_tuning(), "trace-session");
        (session, output)
    }

    fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn blank_input_is_ignored_in_every_state() {
        let (session, _) = session();
        assert_eq!(session.send("", true), Ok(()));
        assert_eq!(session.send("   ", true), Ok(()));
        assert_eq!(session.state(), SessionState::Idle);

        let transport = ScriptedTransport::silent();
        session.start(&transport).expect("start");
        assert_eq!(session.send(" \t ", true), Ok(()));
        assert_eq!(session.state(), SessionState::Ready);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(transport.written(), "");
    }

    #[test]
    fn send_before_start_is_not_ready() {
        let (session, _) = session();
        assert_eq!(session.send("ls", true), Err(SessionError::NotReady));
    }

    #[test]
    fn commands_are_written_in_order() {
        let (session, output) = session();
        let transport = ScriptedTransport::echo();
        session.start(&transport).expect("start");
        assert!(session.started().get());

        session.send("ls", true).expect("send ls");
        session.send("pwd", true).expect("send pwd");

        assert!(wait_until(Duration::from_secs(2), || transport.written() == "ls\npwd\n"));
        assert!(wait_until(Duration::from_secs(2), || output.snapshot() == "ls\npwd\n"));
    }

    #[test]
    fn script_is_written_in_one_piece_with_trailing_newline() {
        let (session, _) = session();
        let transport = ScriptedTransport::silent();
        session.start(&transport).expect("start");
        session.send_script("echo a\necho b").expect("script");
        session.send("echo c", true).expect("send");
        assert!(wait_until(Duration::from_secs(2), || {
            transport.written() == "echo a\necho b\necho c\n"
        }));
    }

    #[test]
    fn executing_returns_to_ready_once_output_settles() {
        let (session, _) = session();
        let transport = ScriptedTransport::echo();
        let states = session.subscribe_state();
        session.start(&transport).expect("start");
        session.send("uptime", true).expect("send");

        assert_eq!(
            states.wait_for(Duration::from_secs(2), |s| *s == SessionState::Executing),
            Some(SessionState::Executing)
        );
        assert_eq!(
            states.wait_for(Duration::from_secs(2), |s| *s == SessionState::Ready),
            Some(SessionState::Ready)
        );
    }

    #[test]
    fn split_utf8_sequence_is_decoded_once_complete() {
        let (session, output) = session();
        let transport = ScriptedTransport::silent();
        session.start(&transport).expect("start");
        transport.feed(&[0xC3]);
        thread::sleep(Duration::from_millis(20));
        transport.feed(&[0xA9, b'\n']);
        assert!(wait_until(Duration::from_secs(2), || output.snapshot() == "\u{e9}\n"));
    }

    #[test]
    fn write_failure_closes_the_session() {
        let (session, _) = session();
        let transport = ScriptedTransport::silent().with_write_error();
        session.start(&transport).expect("start");
        let closed = session.closed().subscribe();

        session.send("ls", true).expect("queued");
        assert_eq!(closed.wait_for(Duration::from_secs(2), |c| *c), Some(true));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.started().get());
        assert_eq!(session.send("pwd", true), Err(SessionError::Closed));
        assert_eq!(transport.written(), "");
    }

    #[test]
    fn close_is_idempotent_and_stops_output() {
        let (session, output) = session();
        let transport = ScriptedTransport::silent();
        session.start(&transport).expect("start");
        transport.feed(b"before\n");
        assert!(wait_until(Duration::from_secs(2), || output.snapshot() == "before\n"));

        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.closed().get());
        assert!(!session.started().get());
        assert_eq!(session.send("ls", true), Err(SessionError::Closed));

        transport.feed(b"after\n");
        thread::sleep(Duration::from_millis(60));
        assert_eq!(output.snapshot(), "before\n");
    }

    #[test]
    fn remote_hang_up_closes_the_session() {
        let (session, _) = session();
        let transport = ScriptedTransport::silent();
        let closed = session.closed().subscribe();
        session.start(&transport).expect("start");

        transport.hang_up();
        assert_eq!(closed.wait_for(Duration::from_secs(2), |c| *c), Some(true));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.send("ls", true), Err(SessionError::Closed));
    }

    #[test]
    fn connect_failure_closes_and_reports() {
        let (session, _) = session();
        let transport = ScriptedTransport::silent().with_connect_error(TransportError::refused("no device"));
        let err = session.start(&transport).expect_err("expected failure");
        match err {
            SessionError::Transport(inner) => assert_eq!(inner.kind, TransportErrorKind::Refused),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.closed().get());
    }

    #[test]
    fn start_only_from_idle() {
        let (session, _) = session();
        let transport = ScriptedTransport::silent();
        session.start(&transport).expect("start");
        assert_eq!(session.start(&transport), Err(SessionError::AlreadyStarted));
        session.close();
        assert_eq!(session.start(&transport), Err(SessionError::Closed));
        assert_eq!(transport.connect_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn info_reports_start_time() {
        let (session, _) = session();
        assert!(session.info().started_at.is_none());
        session.start(&ScriptedTransport::silent()).expect("start");
        let info = session.info();
        assert_eq!(info.state, SessionState::Ready);
        assert_eq!(info.session_id, session.session_id());
        assert!(info.started_at.is_some());
    }
}
