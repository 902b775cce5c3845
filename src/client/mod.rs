pub mod hub_client;

pub use hub_client::{ensure_hub, spawn_heartbeat, HubClient};
