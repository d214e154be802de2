pub mod broker;
pub mod channel;
pub mod config;
pub mod connection;
pub mod security;
pub mod transfer;
