use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::app::adb::transport::AdbTransport;
use crate::app::config::{output_file_path, AppConfig};
use crate::app::error::{AppError, PairingError, SessionError};
use crate::app::history::HistoryLog;
use crate::app::models::{Command, LaunchOutcome, Notice, NoticeLevel, PairingCredentials};
use crate::app::observable::{lock, Observable, Subscription};
use crate::app::output::OutputBuffer;
use crate::app::pairing::PairingCoordinator;
use crate::app::session::{CommandSession, SessionTuning};
use crate::app::store::StateStore;
use crate::app::transport::Transport;

/// Source of pairing credentials, usually the user. `None` cancels.
pub trait PairingPrompt {
    fn request(&mut self, attempt: u32) -> Option<PairingCredentials>;
}

impl<F> PairingPrompt for F
where
    F: FnMut(u32) -> Option<PairingCredentials>,
{
    fn request(&mut self, attempt: u32) -> Option<PairingCredentials> {
        self(attempt)
    }
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub history_cap: Option<usize>,
    pub persist_history: bool,
    pub retry_delay: Duration,
    pub tuning: SessionTuning,
}

impl ControllerOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            history_cap: Some(config.command.max_history_size),
            persist_history: config.command.auto_save_history,
            retry_delay: Duration::from_millis(config.pairing.retry_delay_ms),
            tuning: SessionTuning::from_settings(&config.session),
        }
    }
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Writes history snapshots on its own thread, keeping only the newest of a
/// burst.
struct HistorySaver {
    tx: Sender<Vec<String>>,
    handle: JoinHandle<()>,
}

impl HistorySaver {
    fn spawn(store: Arc<dyn StateStore>, trace_id: String) -> Self {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || save_history_loop(store, rx, trace_id));
        Self { tx, handle }
    }
}

fn save_history_loop(store: Arc<dyn StateStore>, rx: Receiver<Vec<String>>, trace_id: String) {
    while let Ok(mut texts) = rx.recv() {
        while let Ok(newer) = rx.try_recv() {
            texts = newer;
        }
        if let Err(err) = store.save_history(&texts) {
            warn!(trace_id = %trace_id, error = %err, "failed to save command history");
        }
    }
}

/// Owns one session for the life of the process.
///
/// Once the session is closed the controller stays closed; the caller is
/// expected to restart the whole process.
pub struct SessionController {
    trace_id: String,
    transport: Arc<dyn Transport>,
    history: Arc<HistoryLog>,
    output: Arc<OutputBuffer>,
    pairing: PairingCoordinator,
    session: CommandSession,
    notices: Observable<Option<Notice>>,
    history_saver: Mutex<Option<HistorySaver>>,
    retry_delay: Duration,
}

impl SessionController {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn StateStore>,
        output: Arc<OutputBuffer>,
        options: ControllerOptions,
        trace_id: impl Into<String>,
    ) -> Self {
        let trace_id = trace_id.into();
        let history = if options.persist_history {
            HistoryLog::with_entries(options.history_cap, store.load_history())
        } else {
            HistoryLog::new(options.history_cap)
        };
        let pairing = PairingCoordinator::new(
            Arc::clone(&transport),
            Arc::clone(&store),
            Arc::clone(&output),
            trace_id.clone(),
        );
        let session = CommandSession::new(Arc::clone(&output), options.tuning, trace_id.clone());
        let history_saver = options
            .persist_history
            .then(|| HistorySaver::spawn(Arc::clone(&store), trace_id.clone()));
        Self {
            trace_id,
            transport,
            history: Arc::new(history),
            output,
            pairing,
            session,
            notices: Observable::new(None),
            history_saver: Mutex::new(history_saver),
            retry_delay: options.retry_delay,
        }
    }

    /// Wires the adb transport and the file-backed output from configuration.
    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn StateStore>,
        trace_id: &str,
    ) -> Result<Self, AppError> {
        let transport = AdbTransport::from_config(config, trace_id)
            .map_err(|err| AppError::dependency(err.to_string(), trace_id))?;
        let path = output_file_path(config);
        let output = match OutputBuffer::with_file(config.output.max_retained_bytes, &path) {
            Ok(output) => output,
            Err(err) => {
                warn!(
                    trace_id = %trace_id,
                    path = %path.display(),
                    error = %err,
                    "output file unavailable, keeping output in memory only"
                );
                OutputBuffer::new(config.output.max_retained_bytes)
            }
        };
        Ok(Self::new(
            Arc::new(transport),
            store,
            Arc::new(output),
            ControllerOptions::from_config(config),
            trace_id,
        ))
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Pairs when needed, re-prompting after every failure until the prompt
    /// gives up, then opens the shell.
    pub fn launch(&self, prompt: &mut dyn PairingPrompt) -> Result<LaunchOutcome, AppError> {
        if self.session.is_closed() {
            return Err(AppError::session(&SessionError::Closed, &self.trace_id));
        }

        let mut attempts = 0u32;
        if self.pairing.needs_pairing() {
            loop {
                self.pairing.debug("Requesting pairing information");
                let Some(credentials) = prompt.request(attempts + 1) else {
                    info!(trace_id = %self.trace_id, attempts, "pairing cancelled");
                    return Ok(LaunchOutcome::Cancelled {
                        pairing_attempts: attempts,
                    });
                };
                attempts += 1;
                match self.pairing.pair(&credentials.port, &credentials.code) {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(err @ PairingError::InvalidCode(_)) => {
                        self.notify(NoticeLevel::Error, err.to_string());
                    }
                    Err(err) => {
                        let app = AppError::pairing(&err, &self.trace_id);
                        self.notify(NoticeLevel::Error, app.error);
                    }
                }
                if !self.retry_delay.is_zero() {
                    thread::sleep(self.retry_delay);
                }
            }
        }

        self.start_session()?;
        Ok(LaunchOutcome::Started {
            pairing_attempts: attempts,
        })
    }

    pub fn needs_pairing(&self) -> bool {
        self.pairing.needs_pairing()
    }

    /// A single pairing attempt, outside the launch loop.
    pub fn pair(&self, port: &str, code: &str) -> Result<bool, AppError> {
        self.pairing
            .pair(port, code)
            .map_err(|err| AppError::pairing(&err, &self.trace_id))
    }

    pub fn start_session(&self) -> Result<(), AppError> {
        self.session.start(self.transport.as_ref()).map_err(|err| {
            let app = AppError::session(&err, &self.trace_id);
            self.notify(NoticeLevel::Error, format!("Unable to open shell: {}", app.error));
            app
        })
    }

    /// Sends one line and records it. Returns false for blank input.
    pub fn submit(&self, text: &str) -> Result<bool, AppError> {
        if text.trim().is_empty() {
            return Ok(false);
        }
        self.session
            .send(text, true)
            .map_err(|err| AppError::session(&err, &self.trace_id))?;
        self.history.append(text);
        if let Some(saver) = lock(&self.history_saver).as_ref() {
            let _ = saver.tx.send(self.history.texts());
        }
        Ok(true)
    }

    /// Writes any pending history and stops saving. Later submits are not
    /// persisted.
    pub fn flush_history(&self) {
        let Some(saver) = lock(&self.history_saver).take() else {
            return;
        };
        drop(saver.tx);
        if saver.handle.join().is_err() {
            warn!(trace_id = %self.trace_id, "history saver panicked");
        }
    }

    pub fn run_script(&self, script: &str) -> Result<(), AppError> {
        self.session
            .send_script(script)
            .map_err(|err| AppError::session(&err, &self.trace_id))?;
        self.notify(NoticeLevel::Info, "File opened");
        Ok(())
    }

    pub fn on_foreground(&self) {
        self.output.set_paused(false);
    }

    pub fn on_background(&self) {
        self.output.set_paused(true);
    }

    /// The host reclaimed resources; the process has to start over.
    pub fn on_reclaimed(&self) {
        info!(trace_id = %self.trace_id, "resources reclaimed, closing session");
        self.session.close();
    }

    pub fn reset(&self) {
        info!(trace_id = %self.trace_id, "session reset requested");
        self.session.close();
    }

    pub fn clear_output(&self) {
        self.output.clear();
    }

    pub fn output_file(&self) -> Option<PathBuf> {
        self.output.file_path()
    }

    pub fn output(&self) -> &Arc<OutputBuffer> {
        &self.output
    }

    pub fn history(&self) -> &Arc<HistoryLog> {
        &self.history
    }

    pub fn session(&self) -> &CommandSession {
        &self.session
    }

    pub fn select_history<F>(&self, chooser: F) -> Option<Command>
    where
        F: FnOnce(&[Command]) -> Option<usize>,
    {
        self.history.select(chooser)
    }

    pub fn started(&self) -> Observable<bool> {
        self.session.started()
    }

    pub fn closed(&self) -> Observable<bool> {
        self.session.closed()
    }

    pub fn notices(&self) -> Subscription<Option<Notice>> {
        self.notices.subscribe()
    }

    pub fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        let notice = Notice {
            id: Uuid::new_v4().to_string(),
            level,
            message: message.into(),
            trace_id: self.trace_id.clone(),
        };
        self.notices.set(Some(notice));
    }

    /// Hides the current notice if it is still `id`.
    pub fn dismiss_notice(&self, id: &str) {
        let current = self.notices.get();
        if current.as_ref().is_some_and(|notice| notice.id == id) {
            self.notices.set(None);
        }
    }
}
