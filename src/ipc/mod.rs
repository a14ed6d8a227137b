//! IPC module for lifecycle hooks and management clients

mod protocol;
mod server;

pub use server::{Server, ServerContext};
