// Library root: re-exports all modules so the server binary and integration
// tests can reach the crate's public API.

pub mod config;
pub mod connection;
pub mod db;
pub mod hub;
pub mod pick;
pub mod protocol;
pub mod room;
pub mod ws_server;
