//! kithub - relay hub for kit journals
//!
//! Accepts authenticated peers, appends what they send to the hub journal
//! and fans accepted messages out to every following connection.

pub mod config;
pub mod hub;
pub mod server;

pub use config::Config;
pub use hub::{Hub, HubConfig, HubHandle, HubStats};
pub use server::{Server, ServerError};
