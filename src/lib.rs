//! Drive virtual Xbox and DualShock 4 controllers from a browser.
//!
//! Every WebSocket connection becomes a [`Session`] that owns one virtual controller.
//! The [`Registry`] hands out session ids and shuts everything down together.

pub mod app;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod device;
pub mod prefix;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;
pub mod virtual_controller;

pub use config::ServerConfig;
pub use registry::{Registry, SessionObserver};
pub use session::{Session, SessionId, SessionSnapshot};
pub use virtual_controller::{Backend, Mode};
