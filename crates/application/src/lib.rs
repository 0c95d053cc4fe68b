#![forbid(unsafe_code)]

pub mod config_reload;
pub mod conntrack_service_impl;
pub mod firewall_engine;
pub mod firewall_service_impl;
pub mod state_sweeper;
