#![forbid(unsafe_code)]

pub mod common;
pub mod conntrack;
pub mod firewall;
pub mod nat;
pub mod srctrack;
