pub mod config;
pub mod connection;
pub mod server;
pub mod ws;

pub use config::ServerConfig;
pub use connection::Connection;
pub use server::{AppState, router, serve};
