pub mod cluster;
pub mod common;
pub mod network;
pub mod snapshot;
