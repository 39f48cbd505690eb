//! File Sharing Server Library
//!
//! Session protocol engine for a multi-client file sharing server. The
//! binary in main.rs wires these pieces together; integration tests drive
//! them over real sockets.
//!
//! # Modules
//!
//! - `server`: Acceptor and active-connection tracking
//! - `worker`: Bounded worker pool the acceptor dispatches into
//! - `session`: Per-connection handshake and command loop
//! - `protocol`: Wire vocabulary shared by sessions and the registry
//! - `transfer`: Framed, checksum-verified file transfer codec
//! - `pool`: Bounded pool of backend connections
//! - `db`: SQLite persistence for files and the activity log
//! - `broadcast`: Registry fanning notifications out to interactive clients
//! - `locks`: Per-filename reader/writer locks

pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod locks;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod session;
pub mod state;
pub mod transfer;
pub mod worker;

pub use config::Config;
pub use error::{Result, ServerError};
pub use server::Server;
pub use state::ServerState;
