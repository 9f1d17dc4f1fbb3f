use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;
use tracing::{info, warn};

use crate::app::adb::locator::{device_selector, endpoint, resolve_adb_program};
use crate::app::adb::runner::{run_command_with_timeout, CommandOutput};
use crate::app::config::AppConfig;
use crate::app::error::TransportError;
use crate::app::observable::lock;
use crate::app::transport::{CloseHandle, Connection, PipeReader, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairReply {
    pub paired: bool,
    pub guid: Option<String>,
}

/// Interprets `adb pair` output. Older adb builds exit 0 on failure, so the
/// text is checked as well as the exit code.
pub fn parse_pair_output(output: &CommandOutput) -> PairReply {
    static PAIRED: OnceLock<Regex> = OnceLock::new();
    let pattern = PAIRED.get_or_init(|| {
        Regex::new(r"(?i)successfully paired to \S+(?:\s+\[guid=([^\]]+)\])?").unwrap()
    });

    let combined = format!("{}{}", output.stdout, output.stderr);
    if let Some(captures) = pattern.captures(&combined) {
        return PairReply {
            paired: output.exit_code.unwrap_or_default() == 0,
            guid: captures.get(1).map(|m| m.as_str().to_string()),
        };
    }
    let lower = output.combined_lower();
    let failed = output.exit_code.unwrap_or_default() != 0
        || lower.contains("failed")
        || lower.contains("unable");
    PairReply {
        paired: !failed,
        guid: None,
    }
}

/// Talks to the device through the `adb` executable.
pub struct AdbTransport {
    program: String,
    host: String,
    selector: Vec<String>,
    connect_timeout: Duration,
    command_timeout: Duration,
    pair_timeout: Duration,
    trace_id: String,
}

impl AdbTransport {
    pub fn from_config(config: &AppConfig, trace_id: &str) -> Result<Self, TransportError> {
        Ok(Self {
            program: resolve_adb_program(&config.adb)?,
            host: config.adb.host.trim().to_string(),
            selector: device_selector(&config.adb),
            connect_timeout: Duration::from_secs(config.adb.connect_timeout_secs),
            command_timeout: Duration::from_secs(config.adb.command_timeout_secs),
            pair_timeout: Duration::from_secs(config.pairing.pair_timeout_secs),
            trace_id: trace_id.to_string(),
        })
    }

    fn args(&self, tail: &[&str]) -> Vec<String> {
        self.selector
            .iter()
            .cloned()
            .chain(tail.iter().map(|arg| arg.to_string()))
            .collect()
    }

    fn spawn_shell(&self) -> Result<Connection, TransportError> {
        let mut child = Command::new(&self.program)
            .args(self.args(&["shell"]))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| TransportError::from_io(&err))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::reset("failed to capture shell stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::reset("failed to capture shell stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::reset("failed to capture shell stderr"))?;

        let closed = Arc::new(AtomicBool::new(false));
        let (tx, reader) = PipeReader::new(Arc::clone(&closed));
        pump(stdout, tx.clone(), "stdout", self.trace_id.clone());
        pump(stderr, tx, "stderr", self.trace_id.clone());

        let closer = ChildCloser {
            child: Mutex::new(Some(child)),
            closed,
        };
        Ok(Connection::new(
            Box::new(stdin),
            Box::new(reader),
            Arc::new(closer),
        ))
    }
}

impl Transport for AdbTransport {
    fn pair(&self, port: u16, code: &str) -> Result<bool, TransportError> {
        let target = endpoint(&self.host, port);
        let args = vec!["pair".to_string(), target.clone(), code.to_string()];
        let output = run_command_with_timeout(&self.program, &args, self.pair_timeout, &self.trace_id)?;
        let reply = parse_pair_output(&output);
        if reply.paired {
            info!(trace_id = %self.trace_id, target = %target, guid = ?reply.guid, "adb pair succeeded");
        } else {
            warn!(trace_id = %self.trace_id, target = %target, detail = %output.detail(), "adb pair rejected");
        }
        Ok(reply.paired)
    }

    fn connect(&self) -> Result<Connection, TransportError> {
        let output = run_command_with_timeout(
            &self.program,
            &["start-server".to_string()],
            self.command_timeout,
            &self.trace_id,
        )?;
        if output.exit_code.unwrap_or_default() != 0 {
            return Err(TransportError::refused(format!(
                "adb start-server failed: {}",
                output.detail()
            )));
        }

        let output = run_command_with_timeout(
            &self.program,
            &self.args(&["wait-for-device"]),
            self.connect_timeout,
            &self.trace_id,
        )?;
        if output.exit_code.unwrap_or_default() != 0 {
            return Err(TransportError::refused(format!(
                "adb wait-for-device failed: {}",
                output.detail()
            )));
        }

        info!(trace_id = %self.trace_id, "device available, opening shell");
        self.spawn_shell()
    }
}

struct ChildCloser {
    child: Mutex<Option<Child>>,
    closed: Arc<AtomicBool>,
}

impl CloseHandle for ChildCloser {
    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        if let Some(mut child) = lock(&self.child).take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for ChildCloser {
    fn drop(&mut self) {
        self.close();
    }
}

fn pump(
    mut source: impl Read + Send + 'static,
    tx: Sender<Vec<u8>>,
    stream: &'static str,
    trace_id: String,
) {
    std::thread::spawn(move || {
        let mut temp = [0u8; 4096];
        loop {
            match source.read(&mut temp) {
                Ok(0) => break,
                Ok(count) => {
                    if tx.send(temp[..count].to_vec()).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(trace_id = %trace_id, stream, error = %err, "failed to read shell output");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(stdout: &str, stderr: &str, exit_code: i32) -> CommandOutput {
        CommandOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code: Some(exit_code),
        }
    }

    #[test]
    fn successful_pair_reports_guid() {
        let reply = parse_pair_output(&output(
            "Successfully paired to 192.168.1.20:37123 [guid=adb-R58M12ABCDE-xyz]\n",
            "",
            0,
        ));
        assert!(reply.paired);
        assert_eq!(reply.guid.as_deref(), Some("adb-R58M12ABCDE-xyz"));
    }

    #[test]
    fn failed_pair_with_zero_exit_is_rejected() {
        let reply = parse_pair_output(&output("Failed: Wrong password or connection was dropped.\n", "", 0));
        assert!(!reply.paired);
    }

    #[test]
    fn nonzero_exit_is_rejected() {
        let reply = parse_pair_output(&output("", "error: protocol fault\n", 1));
        assert!(!reply.paired);
        assert!(reply.guid.is_none());
    }

    #[test]
    fn missing_adb_is_refused_at_construction() {
        let mut config = AppConfig::default();
        config.adb.command_path = "/no/such/dir/adb".to_string();
        let err = match AdbTransport::from_config(&config, "trace") {
            Ok(_) => panic!("expected missing adb"),
            Err(err) => err,
        };
        assert_eq!(err.kind, crate::app::error::TransportErrorKind::Refused);
    }

    #[cfg(unix)]
    #[test]
    fn fake_adb_shell_round_trip() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        // Stand-in adb: helper commands succeed, `shell` becomes a plain sh.
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("adb");
        {
            let mut file = std::fs::File::create(&script).expect("create");
            writeln!(
                file,
                "#!/bin/sh\ncase \"$1\" in\n  shell) exec sh ;;\n  *) exit 0 ;;\nesac"
            )
            .expect("write");
        }
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let mut config = AppConfig::default();
        config.adb.command_path = script.to_string_lossy().to_string();
        let transport = AdbTransport::from_config(&config, "trace-fake").expect("transport");
        let mut connection = transport.connect().expect("connect");
        let mut reader = connection.take_reader().expect("reader");
        connection.write(b"echo fake-device\nexit\n").expect("write");

        let mut text = String::new();
        reader.read_to_string(&mut text).expect("read");
        assert_eq!(text, "fake-device\n");
        connection.close();
    }
}
