pub mod session;
pub mod static_files;

pub use session::{bind_scanning, pump_output, Fanout, SessionState};
pub use static_files::AssetCache;
