//! One supervised external process: spawn, output-driven lifecycle, stop.
//!
//! Layout is two reader threads (one per pipe; pipe reads block, so they get
//! dedicated threads) feeding a channel drained by a monitor thread that owns
//! every side effect: state transitions, the connection counter, the rolling
//! log, the keep-awake hold, and the final reap. Killing the process closes
//! the pipes, which unblocks the readers and lets the monitor run down.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tokio::sync::watch;

use super::keep_awake::{self, WakeGuard};
use super::rolling_log::{RollingLog, DEFAULT_LOG_CAPACITY};
use super::state::{classify_line, LineEvent, ServerRole, ServerState};
use crate::server_config::LaunchCommand;
use crate::{log_debug, log_info, log_warn};

/// How a session's process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExit {
    /// True when `stop` was requested before the process went away. An exit
    /// without this flag is an unexpected termination; whether to surface it
    /// as an error is the caller's call, not ours.
    pub intentional: bool,
    pub code: Option<i32>,
}

/// A running (or finished) supervised process. Sessions are never reused:
/// a restart builds a new one.
pub struct ServerSession {
    role: ServerRole,
    command_line: String,
    child: Arc<Mutex<Option<Child>>>,
    stopped_intentionally: Arc<AtomicBool>,
    state_tx: Arc<watch::Sender<ServerState>>,
    connections_tx: Arc<watch::Sender<u32>>,
    logs: Arc<RollingLog>,
    exit: Arc<Mutex<Option<SessionExit>>>,
}

impl ServerSession {
    /// Spawn the process and start its reader/monitor threads.
    ///
    /// `port` is the port the launch arguments bind; it is echoed back in
    /// `Running` when the ready line appears.
    pub fn spawn(role: ServerRole, launch: &LaunchCommand, port: u16) -> Result<Self, String> {
        // Acquired before the spawn so a failed spawn still releases it on
        // the error return path.
        let wake = keep_awake::acquire(role.tag());

        log_info!("[{}] Starting: {}", role.tag(), launch.command_line());

        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .envs(launch.env.iter().cloned())
            .current_dir(&launch.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| format!("Failed to start {}: {e}", launch.program.display()))?;

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err("output pipes unavailable".to_string());
            }
        };

        let state_tx = Arc::new(watch::channel(ServerState::Starting).0);
        let connections_tx = Arc::new(watch::channel(0u32).0);
        let logs = Arc::new(RollingLog::new(DEFAULT_LOG_CAPACITY));
        if role == ServerRole::RpcWorker {
            logs.push("=== RPC Server Started ===");
            logs.push(&format!("Command: {}", launch.command_line()));
        }

        let child = Arc::new(Mutex::new(Some(child)));
        let stopped_intentionally = Arc::new(AtomicBool::new(false));

        let (line_tx, line_rx) = unbounded::<String>();
        spawn_reader(stdout, line_tx.clone());
        spawn_reader(stderr, line_tx);

        let monitor = SessionMonitor {
            role,
            port,
            child: child.clone(),
            stopped_intentionally: stopped_intentionally.clone(),
            state_tx: state_tx.clone(),
            connections_tx: connections_tx.clone(),
            logs: logs.clone(),
            exit: Arc::new(Mutex::new(None)),
        };
        let exit = monitor.exit.clone();
        std::thread::spawn(move || monitor.run(line_rx, wake));

        Ok(Self {
            role,
            command_line: launch.command_line(),
            child,
            stopped_intentionally,
            state_tx,
            connections_tx,
            logs,
            exit,
        })
    }

    pub fn role(&self) -> ServerRole {
        self.role
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Subscribe to lifecycle state changes.
    pub fn state(&self) -> watch::Receiver<ServerState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ServerState {
        self.state_tx.borrow().clone()
    }

    /// Subscribe to the live connection counter (worker role).
    pub fn connections(&self) -> watch::Receiver<u32> {
        self.connections_tx.subscribe()
    }

    pub fn connection_count(&self) -> u32 {
        *self.connections_tx.borrow()
    }

    /// Rolling diagnostic log (worker role).
    pub fn logs(&self) -> Arc<RollingLog> {
        self.logs.clone()
    }

    /// Set once the process has gone away and been reaped.
    pub fn exit_info(&self) -> Option<SessionExit> {
        self.exit.lock().expect("exit info poisoned").clone()
    }

    pub fn is_alive(&self) -> bool {
        let mut guard = self.child.lock().expect("child handle poisoned");
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Request termination. Idempotent; never blocks past the forced kill.
    ///
    /// The intentional-stop flag is set before the kill so the monitor can
    /// tell this apart from the process dying on its own.
    pub fn stop(&self) {
        self.stopped_intentionally.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.child.lock() {
            if let Some(child) = guard.as_mut() {
                log_info!("[{}] Killing process", self.role.tag());
                let _ = child.kill();
            }
        }
        self.state_tx.send_replace(ServerState::Stopped);
        self.connections_tx.send_replace(0);
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read one pipe line-by-line onto the shared line channel. Exits on EOF,
/// which the kill in `stop` guarantees eventually happens.
fn spawn_reader<R: Read + Send + 'static>(stream: R, tx: Sender<String>) {
    std::thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
}

/// Owns all session side effects; runs on its own thread.
struct SessionMonitor {
    role: ServerRole,
    port: u16,
    child: Arc<Mutex<Option<Child>>>,
    stopped_intentionally: Arc<AtomicBool>,
    state_tx: Arc<watch::Sender<ServerState>>,
    connections_tx: Arc<watch::Sender<u32>>,
    logs: Arc<RollingLog>,
    exit: Arc<Mutex<Option<SessionExit>>>,
}

impl SessionMonitor {
    fn run(self, lines: Receiver<String>, wake: WakeGuard) {
        // Held for the lifetime of the monitor; dropped on every way out.
        let _wake = wake;

        for line in lines.iter() {
            self.handle_line(&line);
        }

        // Both readers hit EOF: the process is gone. Reap it.
        let taken = self.child.lock().expect("child handle poisoned").take();
        let code = taken.and_then(|mut child| child.wait().ok()).and_then(|s| s.code());
        self.finish(code);
    }

    fn handle_line(&self, line: &str) {
        match self.role {
            ServerRole::RpcWorker => self.logs.push(line),
            ServerRole::LocalServer => log_debug!("[SERVER] {line}"),
        }

        // A stop has been requested; the tail of the output must not
        // resurrect the state machine.
        if self.stopped_intentionally.load(Ordering::SeqCst) {
            return;
        }

        let Some(event) = classify_line(self.role, line) else {
            return;
        };

        match event {
            LineEvent::Loading { status } => {
                if !self.state_tx.borrow().is_running() {
                    self.state_tx.send_replace(ServerState::loading(status));
                }
            }
            LineEvent::Ready => {
                log_info!("[{}] Ready, listening on port {}", self.role.tag(), self.port);
                self.state_tx
                    .send_replace(ServerState::Running { port: self.port });
            }
            LineEvent::ClientConnected => {
                let count = *self.connections_tx.borrow() + 1;
                self.connections_tx.send_replace(count);
                log_info!("[{}] Connection count: {count}", self.role.tag());
            }
            LineEvent::ClientDisconnected => {
                let current = *self.connections_tx.borrow();
                if current > 0 {
                    self.connections_tx.send_replace(current - 1);
                    log_info!("[{}] Connection count: {}", self.role.tag(), current - 1);
                }
            }
        }
    }

    fn finish(&self, code: Option<i32>) {
        let intentional = self.stopped_intentionally.load(Ordering::SeqCst);
        *self.exit.lock().expect("exit info poisoned") = Some(SessionExit { intentional, code });

        if intentional {
            log_info!("[{}] Process stopped (exit code {code:?})", self.role.tag());
        } else {
            log_warn!(
                "[{}] Process terminated unexpectedly (exit code {code:?})",
                self.role.tag()
            );
        }

        self.state_tx.send_replace(ServerState::Stopped);
        self.connections_tx.send_replace(0);
    }
}
