pub mod builder;
pub mod entity;
pub mod error;
pub mod expiry;
pub mod flow;
pub mod icmp;
pub mod snapshot;
pub mod store;
pub mod synproxy;
pub mod table;
pub mod tcp;
