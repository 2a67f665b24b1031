pub mod config;
pub mod endpoint;
pub mod ipc;
pub mod layout;
pub mod protocol;
