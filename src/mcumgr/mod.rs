//! MCUmgr update driver
//!
//! Updates MCUboot devices over SMP. A [`Transport`] hands out one
//! [`Session`] at a time per device; the single-device and group flows are
//! written against [`McuDevice`] and never see the link underneath.

pub mod agent;
pub mod artifact;
pub mod config;
pub mod device;
pub mod group;
pub mod image;
pub mod session;
pub mod single;
pub mod smp;
pub mod transport;

pub use agent::McumgrAgent;
pub use artifact::{GroupArtifact, ZephyrArtifact};
pub use config::McumgrConfig;
pub use device::{McuDevice, Timing};
pub use group::{group_version, update_group, wait_all};
pub use image::{ImageEntry, ImageVersion, parse_image_header};
pub use session::{Link, Session, SmpSession, Transport};
pub use single::update_device;
pub use transport::TransportConfig;
