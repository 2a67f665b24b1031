pub mod chat;
pub mod config;
pub mod query;
pub mod status;
pub mod worker;
