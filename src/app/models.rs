use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Ready,
    Executing,
    Closed,
}

impl SessionState {
    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Command {
    pub index: u64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputChunk {
    pub seq: u64,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// Everything retained at the moment of attaching.
    Backlog(String),
    Chunk(OutputChunk),
    Cleared,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairingCredentials {
    pub port: String,
    pub code: String,
}

impl PairingCredentials {
    pub fn new(port: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            code: code.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PairingOutcome {
    Paired,
    Rejected,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairingAttempt {
    pub port: String,
    /// Masked: one `*` per character entered.
    pub code: String,
    pub outcome: PairingOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LaunchOutcome {
    Started { pairing_attempts: u32 },
    Cancelled { pairing_attempts: u32 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Error,
}

/// Transient, dismissible message for the user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notice {
    pub id: String,
    pub level: NoticeLevel,
    pub message: String,
    pub trace_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub state: SessionState,
    pub started_at: Option<String>,
}
