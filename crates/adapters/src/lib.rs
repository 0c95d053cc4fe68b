#![forbid(unsafe_code)]

pub mod checksum;
pub mod clock;
pub mod export;
pub mod http;
pub mod packet_log;
pub mod pool;
