//! RDFM client - device-side update and management agent
//!
//! This library provides everything the `rdfm` binary runs:
//! - Artifact parsing, delta reconstruction and A/B rootfs installs
//! - Authentication and update polling against an RDFM server
//! - The management WebSocket: actions, file transfer, reverse shell
//! - MCUboot firmware updates over MCUmgr (serial, UDP, BLE)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    RDFM server                       │
//! │   auth  │  update check  │  packages  │  device ws   │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                      Daemon                          │
//! │   poller  │  connection  │  dispatcher  │  actions   │
//! └──────────┬─────────────────────────────┬────────────┘
//!            │                             │
//! ┌──────────▼──────────┐       ┌──────────▼────────────┐
//! │  installer/artifact │       │  store (durable FIFO) │
//! │  delta  │  blockdev │       │  req  │  res          │
//! └─────────────────────┘       └───────────────────────┘
//! ```

pub mod actions;
pub mod artifact;
pub mod blockdev;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod delta;
pub mod error;
pub mod installer;
pub mod mcumgr;
pub mod security;
pub mod server;
pub mod store;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, Result};
