pub mod ansi;
pub mod config;
pub mod protocol;
pub mod pty;
pub mod scrollback;
pub mod session;
pub mod token;

pub use config::Config;
pub use protocol::{ClientMessage, DashboardMessage, DashboardRequest, ServerMessage};
pub use session::{SessionInfo, SessionRegistration, SessionStatus};
