use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::app::error::PairingError;
use crate::app::models::{PairingAttempt, PairingOutcome};
use crate::app::observable::lock;
use crate::app::output::OutputBuffer;
use crate::app::store::StateStore;
use crate::app::transport::Transport;

/// Releases the in-flight slot on every exit path.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Checks the pairing port and code typed by the user.
pub fn parse_credentials(port: &str, code: &str) -> Result<(u16, String), PairingError> {
    let port = port
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| PairingError::InvalidCode(format!("invalid port '{}'", port.trim())))?;
    let code = code.trim();
    if code.is_empty() || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(PairingError::InvalidCode(
            "pairing code must be numeric".to_string(),
        ));
    }
    Ok((port, code.to_string()))
}

pub struct PairingCoordinator {
    transport: Arc<dyn Transport>,
    store: Arc<dyn StateStore>,
    output: Arc<OutputBuffer>,
    in_flight: AtomicBool,
    last_attempt: Mutex<Option<PairingAttempt>>,
    trace_id: String,
}

impl PairingCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn StateStore>,
        output: Arc<OutputBuffer>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            store,
            output,
            in_flight: AtomicBool::new(false),
            last_attempt: Mutex::new(None),
            trace_id: trace_id.into(),
        }
    }

    pub fn needs_pairing(&self) -> bool {
        !self.store.paired_before()
    }

    pub fn is_pairing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn last_attempt(&self) -> Option<PairingAttempt> {
        lock(&self.last_attempt).clone()
    }

    /// One attempt. Every failure clears the persisted flag and leaves a
    /// diagnostic line in the output; success sets the flag.
    pub fn pair(&self, port: &str, code: &str) -> Result<bool, PairingError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PairingError::AlreadyInProgress);
        }
        let _in_flight = InFlight(&self.in_flight);

        self.output.debug("Trying to pair...");
        let result = parse_credentials(port, code)
            .and_then(|(port, code)| self.transport.pair(port, &code).map_err(PairingError::from));

        let outcome = match &result {
            Ok(true) => PairingOutcome::Paired,
            Ok(false) => PairingOutcome::Rejected,
            Err(err) => PairingOutcome::Failed {
                error: err.to_string(),
            },
        };
        let paired = outcome == PairingOutcome::Paired;
        *lock(&self.last_attempt) = Some(PairingAttempt {
            port: port.trim().to_string(),
            code: "*".repeat(code.trim().chars().count()),
            outcome,
        });

        if let Err(err) = self.store.set_paired_before(paired) {
            warn!(trace_id = %self.trace_id, error = %err, "failed to persist pairing flag");
        }

        match &result {
            Ok(true) => info!(trace_id = %self.trace_id, port = %port.trim(), "paired"),
            Ok(false) => {
                warn!(trace_id = %self.trace_id, port = %port.trim(), "pairing rejected");
                self.output.debug("Failed to pair! Trying again...");
            }
            Err(err) => {
                warn!(trace_id = %self.trace_id, error = %err, "pairing failed");
                self.output.debug(&format!("Failed to pair ({err})! Trying again..."));
            }
        }
        result
    }

    pub fn debug(&self, message: &str) {
        self.output.debug(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::error::TransportError;
    use crate::app::store::MemoryStore;
    use crate::app::transport::testing::ScriptedTransport;
    use std::thread;
    use std::time::Duration;

    fn coordinator(
        transport: ScriptedTransport,
        paired_before: bool,
    ) -> (PairingCoordinator, Arc<MemoryStore>, Arc<OutputBuffer>) {
        let store = Arc::new(MemoryStore::new(paired_before));
        let output = Arc::new(OutputBuffer::new(4096));
        let coordinator = PairingCoordinator::new(
            Arc::new(transport),
            store.clone(),
            output.clone(),
            "trace-pair",
        );
        (coordinator, store, output)
    }

    #[test]
    fn needs_pairing_follows_persisted_flag() {
        let (fresh, _, _) = coordinator(ScriptedTransport::silent(), false);
        assert!(fresh.needs_pairing());
        let (known, _, _) = coordinator(ScriptedTransport::silent(), true);
        assert!(!known.needs_pairing());
    }

    #[test]
    fn success_sets_flag() {
        let transport = ScriptedTransport::silent().with_pair_results([Ok(true)]);
        let (coordinator, store, output) = coordinator(transport, false);
        assert_eq!(coordinator.pair("37123", "482913"), Ok(true));
        assert!(store.paired_before());
        assert!(!coordinator.needs_pairing());
        assert_eq!(output.snapshot(), "* Trying to pair...\n");
        assert_eq!(
            coordinator.last_attempt().map(|a| a.outcome),
            Some(PairingOutcome::Paired)
        );
    }

    #[test]
    fn rejection_clears_flag_and_logs() {
        let transport = ScriptedTransport::silent().with_pair_results([Ok(false)]);
        let (coordinator, store, output) = coordinator(transport, true);
        assert_eq!(coordinator.pair("37123", "000000"), Ok(false));
        assert!(!store.paired_before());
        assert!(output.snapshot().contains("* Failed to pair! Trying again...\n"));
        assert!(!output.snapshot().contains("000000"));
    }

    #[test]
    fn last_attempt_keeps_the_port_but_not_the_code() {
        let transport = ScriptedTransport::silent().with_pair_results([Ok(false)]);
        let (coordinator, _, _) = coordinator(transport, false);
        coordinator.pair(" 37123 ", " 482913 ").expect("pair");
        let attempt = coordinator.last_attempt().expect("attempt");
        assert_eq!(attempt.port, "37123");
        assert_eq!(attempt.code, "******");
        assert_eq!(attempt.outcome, PairingOutcome::Rejected);
    }

    #[test]
    fn transport_error_is_reported_as_failure() {
        let transport = ScriptedTransport::silent()
            .with_pair_results([Err(TransportError::timeout("pair timed out"))]);
        let (coordinator, store, output) = coordinator(transport, true);
        let err = coordinator.pair("37123", "482913").expect_err("expected failure");
        assert!(matches!(err, PairingError::TransportFailure(_)));
        assert!(!store.paired_before());
        assert!(output.snapshot().contains("Failed to pair"));
        assert!(!coordinator.is_pairing());
    }

    #[test]
    fn invalid_credentials_never_reach_transport() {
        let transport = Arc::new(ScriptedTransport::silent());
        let store = Arc::new(MemoryStore::new(false));
        let coordinator = PairingCoordinator::new(
            transport.clone(),
            store,
            Arc::new(OutputBuffer::new(1024)),
            "trace",
        );
        for (port, code) in [("", "123456"), ("0", "123456"), ("70000", "1"), ("5555", "12ab"), ("5555", " ")] {
            let err = coordinator.pair(port, code).expect_err("expected invalid");
            assert!(matches!(err, PairingError::InvalidCode(_)), "{port}/{code}");
        }
        assert_eq!(transport.pair_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_attempt_is_rejected() {
        let transport = ScriptedTransport::silent()
            .with_pair_delay(Duration::from_millis(300))
            .with_pair_results([Ok(true)]);
        let (coordinator, _, _) = coordinator(transport, false);
        let coordinator = Arc::new(coordinator);

        let first = {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || coordinator.pair("37123", "482913"))
        };
        let start = std::time::Instant::now();
        while !coordinator.is_pairing() && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(
            coordinator.pair("37123", "482913"),
            Err(PairingError::AlreadyInProgress)
        );
        assert_eq!(first.join().expect("join"), Ok(true));
        assert!(!coordinator.is_pairing());
    }
}
