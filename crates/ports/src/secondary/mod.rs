pub mod address_pool_port;
pub mod checksum_port;
pub mod clock_port;
pub mod metrics_port;
pub mod packet_log_port;
pub mod state_export_port;
