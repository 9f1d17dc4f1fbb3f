use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ladb_shell_lib::app::config::{config_path, load_config_from_path};
use ladb_shell_lib::app::controller::{PairingPrompt, SessionController};
use ladb_shell_lib::app::logging::init_logging;
use ladb_shell_lib::app::models::{LaunchOutcome, NoticeLevel, OutputEvent, PairingCredentials};
use ladb_shell_lib::app::store::ConfigStore;
use tracing::{error, info, warn};
use uuid::Uuid;

const USAGE: &str = "Usage: ladb [--config PATH] [--host HOST] [--serial SERIAL] [--script FILE]\n\
Commands: :history, :rerun <n>, :clear, :export, :reset, :quit";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Args {
    config: Option<PathBuf>,
    host: Option<String>,
    serial: Option<String>,
    script: Option<PathBuf>,
}

fn parse_args(raw: impl IntoIterator<Item = String>) -> Result<Args, String> {
    let mut args = Args::default();
    let mut it = raw.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--config requires a value".to_string())?;
                args.config = Some(PathBuf::from(value));
            }
            "--host" => {
                args.host = it
                    .next()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                if args.host.is_none() {
                    return Err("--host requires a value".to_string());
                }
            }
            "--serial" => {
                args.serial = it
                    .next()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                if args.serial.is_none() {
                    return Err("--serial requires a value".to_string());
                }
            }
            "--script" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--script requires a value".to_string())?;
                args.script = Some(PathBuf::from(value));
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            other => return Err(format!("Unknown arg: {other}\n{USAGE}")),
        }
    }
    Ok(args)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplCommand {
    Send(String),
    History,
    Rerun(usize),
    Clear,
    Export,
    Reset,
    Quit,
    Invalid(String),
}

fn parse_repl(line: &str) -> ReplCommand {
    let trimmed = line.trim();
    let Some(rest) = trimmed.strip_prefix(':') else {
        return ReplCommand::Send(line.trim_end_matches(['\r', '\n']).to_string());
    };
    let mut parts = rest.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("history"), None) => ReplCommand::History,
        (Some("rerun"), Some(n)) => match n.parse::<usize>() {
            Ok(n) if n > 0 => ReplCommand::Rerun(n),
            _ => ReplCommand::Invalid(format!("not a history number: {n}")),
        },
        (Some("clear"), None) => ReplCommand::Clear,
        (Some("export"), None) => ReplCommand::Export,
        (Some("reset"), None) => ReplCommand::Reset,
        (Some("quit"), None) | (Some("q"), None) => ReplCommand::Quit,
        _ => ReplCommand::Invalid(format!("unknown command :{rest}")),
    }
}

/// Asks for pairing details on the terminal. An empty answer cancels.
struct StdinPrompt;

impl PairingPrompt for StdinPrompt {
    fn request(&mut self, attempt: u32) -> Option<PairingCredentials> {
        if attempt == 1 {
            eprintln!("Open Wireless debugging > Pair device with pairing code on the device.");
        }
        let port = ask("Pairing port")?;
        let code = ask("Pairing code")?;
        Some(PairingCredentials::new(port, code))
    }
}

fn ask(label: &str) -> Option<String> {
    eprint!("{label}: ");
    let _ = io::stderr().flush();
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()).filter(|value| !value.is_empty()),
    }
}

fn spawn_output_printer(controller: &SessionController) {
    let events = controller.output().subscribe();
    thread::spawn(move || {
        let stdout = io::stdout();
        for event in events {
            let mut out = stdout.lock();
            let _ = match event {
                OutputEvent::Backlog(text) => write!(out, "{text}"),
                OutputEvent::Chunk(chunk) => write!(out, "{}", chunk.content),
                OutputEvent::Cleared => writeln!(out, "\x1b[2J\x1b[H"),
            };
            let _ = out.flush();
        }
    });
}

fn spawn_notice_printer(controller: &SessionController) {
    let notices = controller.notices();
    thread::spawn(move || {
        for notice in notices.flatten() {
            let level = match notice.level {
                NoticeLevel::Info => "info",
                NoticeLevel::Error => "error",
            };
            eprintln!("[{level}] {}", notice.message);
        }
    });
}

/// A closed session cannot be reopened in-process; start over instead.
fn spawn_restart_watcher(controller: Arc<SessionController>, quitting: Arc<AtomicBool>) {
    let mut closed = controller.closed().subscribe();
    thread::spawn(move || {
        if !closed.any(|closed| closed) {
            return;
        }
        // Give the printer a moment to drain the last output.
        thread::sleep(Duration::from_millis(100));
        if quitting.load(Ordering::SeqCst) {
            return;
        }
        if controller.session().info().started_at.is_none() {
            // Never opened: restarting would only fail the same way.
            return;
        }
        controller.flush_history();
        eprintln!("* Session closed, restarting...");
        relaunch(controller.trace_id());
    });
}

/// Arguments for the restarted process. The startup script has already run
/// and must not run again.
fn relaunch_args(args: &[String]) -> Vec<String> {
    let mut kept = Vec::with_capacity(args.len());
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        if arg == "--script" {
            it.next();
            continue;
        }
        kept.push(arg.clone());
    }
    kept
}

#[cfg(unix)]
fn relaunch(trace_id: &str) {
    use std::os::unix::process::CommandExt;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let err = match std::env::current_exe() {
        Ok(exe) => std::process::Command::new(exe)
            .args(relaunch_args(&args))
            .exec(),
        Err(err) => err,
    };
    error!(trace_id = %trace_id, error = %err, "failed to restart");
    std::process::exit(1);
}

#[cfg(not(unix))]
fn relaunch(trace_id: &str) {
    let args: Vec<String> = std::env::args().skip(1).collect();
    // Exit right after spawning so only the new process reads stdin.
    let spawned = std::env::current_exe().and_then(|exe| {
        std::process::Command::new(exe)
            .args(relaunch_args(&args))
            .spawn()
    });
    match spawned {
        Ok(_) => std::process::exit(0),
        Err(err) => {
            error!(trace_id = %trace_id, error = %err, "failed to restart");
            std::process::exit(1);
        }
    }
}

fn print_history(controller: &SessionController) {
    let view = controller.history().reversed_view();
    if view.is_empty() {
        eprintln!("* History is empty");
        return;
    }
    for (position, command) in view.iter().enumerate() {
        eprintln!("{:>4}  {}", position + 1, command.text);
    }
}

fn run_repl(controller: &SessionController) {
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => return,
            Ok(_) => {}
            Err(err) => {
                warn!(trace_id = %controller.trace_id(), error = %err, "failed to read stdin");
                return;
            }
        }
        let result = match parse_repl(&line) {
            ReplCommand::Quit => return,
            ReplCommand::Send(text) => controller.submit(&text).map(|_| ()),
            ReplCommand::History => {
                print_history(controller);
                Ok(())
            }
            ReplCommand::Rerun(n) => {
                match controller.select_history(|items| (n <= items.len()).then(|| n - 1)) {
                    Some(command) => controller.submit(&command.text).map(|_| ()),
                    None => {
                        eprintln!("* No history entry {n}");
                        Ok(())
                    }
                }
            }
            ReplCommand::Clear => {
                controller.clear_output();
                Ok(())
            }
            ReplCommand::Export => {
                match controller.output_file() {
                    Some(path) => eprintln!("* Output saved at {}", path.display()),
                    None => eprintln!("* Output is not backed by a file"),
                }
                Ok(())
            }
            ReplCommand::Reset => {
                controller.reset();
                Ok(())
            }
            ReplCommand::Invalid(message) => {
                eprintln!("* {message}");
                Ok(())
            }
        };
        if let Err(err) = result {
            eprintln!("[error] {}", err.error);
            if err.is_session_closed() {
                // The restart watcher takes over from here.
                thread::sleep(Duration::from_secs(1));
            }
        }
    }
}

fn main() {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };

    let path = args.config.clone().unwrap_or_else(config_path);
    let mut config = match load_config_from_path(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load config {}: {err}", path.display());
            std::process::exit(1);
        }
    };
    if let Some(host) = &args.host {
        config.adb.host = host.clone();
    }
    if let Some(serial) = &args.serial {
        config.adb.serial = serial.clone();
    }
    init_logging(&config.logging.log_level);

    let trace_id = Uuid::new_v4().to_string();
    let store = Arc::new(ConfigStore::new(&path));
    let controller = match SessionController::from_config(&config, store, &trace_id) {
        Ok(controller) => Arc::new(controller),
        Err(err) => {
            error!(trace_id = %trace_id, code = %err.code, error = %err.error, "failed to set up session");
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    info!(trace_id = %trace_id, config = %path.display(), "ladb starting");

    let quitting = Arc::new(AtomicBool::new(false));
    spawn_output_printer(&controller);
    spawn_notice_printer(&controller);
    spawn_restart_watcher(Arc::clone(&controller), Arc::clone(&quitting));

    match controller.launch(&mut StdinPrompt) {
        Ok(LaunchOutcome::Started { pairing_attempts }) => {
            info!(trace_id = %trace_id, pairing_attempts, "shell ready");
        }
        Ok(LaunchOutcome::Cancelled { .. }) => {
            quitting.store(true, Ordering::SeqCst);
            eprintln!("* Pairing cancelled");
            return;
        }
        Err(err) => {
            quitting.store(true, Ordering::SeqCst);
            eprintln!("{err}");
            std::process::exit(1);
        }
    }

    if let Some(script) = &args.script {
        match fs::read_to_string(script) {
            Ok(text) => {
                if let Err(err) = controller.run_script(&text) {
                    eprintln!("[error] {}", err.error);
                }
            }
            Err(err) => {
                warn!(trace_id = %trace_id, path = %script.display(), error = %err, "failed to read script");
                eprintln!("[error] Unable to open {}: {err}", script.display());
            }
        }
    }

    run_repl(&controller);
    quitting.store(true, Ordering::SeqCst);
    controller.reset();
    controller.flush_history();
}
