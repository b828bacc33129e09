//! Lifecycle states and the log-line classifier that drives them.
//!
//! The wrapped binaries expose no structured IPC; their stdout/stderr wording
//! is the only readiness signal. The matching table lives here, isolated from
//! the transition logic, so it can be tested (and updated when the binaries
//! reword their logs) without touching the supervisor.

/// Which external binary a session wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    /// Local inference server hosting the model.
    LocalServer,
    /// Remote compute worker serving layers to a master.
    RpcWorker,
}

impl ServerRole {
    pub fn tag(self) -> &'static str {
        match self {
            ServerRole::LocalServer => "SERVER",
            ServerRole::RpcWorker => "RPC",
        }
    }
}

/// Progress value used while loading when the binary gives no percentage.
pub const INDETERMINATE: f32 = -1.0;

/// Lifecycle of one supervised process.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerState {
    Stopped,
    Starting,
    Loading { progress: f32, status: String },
    Running { port: u16 },
    Error { message: String },
}

impl ServerState {
    pub fn loading(status: &str) -> Self {
        ServerState::Loading {
            progress: INDETERMINATE,
            status: status.to_string(),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ServerState::Running { .. })
    }

    /// Terminal until a new explicit start request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerState::Stopped | ServerState::Error { .. })
    }
}

/// Event extracted from one output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    Loading { status: &'static str },
    Ready,
    ClientConnected,
    ClientDisconnected,
}

/// Classify one line of process output.
///
/// Lifecycle wording is matched case-sensitively (the binaries emit it
/// lowercase); connection events are matched case-insensitively because the
/// worker binary has used both capitalizations across versions.
pub fn classify_line(role: ServerRole, line: &str) -> Option<LineEvent> {
    if line.contains("loading model") {
        return Some(LineEvent::Loading {
            status: "Loading model...",
        });
    }
    if line.contains("llm_load_tensors") {
        return Some(LineEvent::Loading {
            status: "Loading tensors...",
        });
    }
    if line.contains("warming up") {
        return Some(LineEvent::Loading {
            status: "Warming up model...",
        });
    }
    if line.contains("listening on") || line.contains("HTTP server") || line.contains("server listening")
    {
        return Some(LineEvent::Ready);
    }

    if role == ServerRole::RpcWorker {
        let lower = line.to_ascii_lowercase();
        if lower.contains("accepted client connection") || lower.contains("accepted connection") {
            return Some(LineEvent::ClientConnected);
        }
        if lower.contains("client connection closed") || lower.contains("connection closed") {
            return Some(LineEvent::ClientDisconnected);
        }
    }

    None
}
