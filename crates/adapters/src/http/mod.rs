pub mod conntrack_handler;
pub mod error;
pub mod firewall_handler;
pub mod health_handler;
pub mod metrics_handler;
pub mod router;
pub mod server;
pub mod state;
