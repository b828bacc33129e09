//! Process supervision for the wrapped inference binaries.
//!
//! The engine binaries run as child processes; their text output is the only
//! lifecycle signal available. Each session gets its own reader and monitor
//! threads so a stuck pipe never blocks registry or UI access.

pub mod keep_awake;
pub mod rolling_log;
pub mod session;
pub mod state;

pub use rolling_log::RollingLog;
pub use session::{ServerSession, SessionExit};
pub use state::{classify_line, LineEvent, ServerRole, ServerState};
