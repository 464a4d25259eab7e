//! Device sessions
//!
//! A [`Transport`] hands out at most one [`Session`] at a time. Sessions
//! speak SMP over a [`Link`], which only moves whole packets.

use std::time::Duration;

use async_trait::async_trait;
use serde_cbor::Value;
use sha2::{Digest, Sha256};

use super::image::ImageEntry;
use super::smp::{
    GROUP_IMAGE, GROUP_OS, ID_ECHO, ID_IMAGE_ERASE, ID_IMAGE_STATE, ID_IMAGE_UPLOAD, ID_RESET, OP_READ, OP_WRITE,
    Request, Response,
};
use crate::{Error, Result};

/// Echo payload used by [`Session::ping`]
pub const PING_PAYLOAD: &str = "Pong";

/// Default per-command timeout
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Room left in every upload packet for the header and CBOR framing
const UPLOAD_OVERHEAD: usize = 64;

/// Image management commands on one device
#[async_trait]
pub trait Session: Send {
    /// Echo round trip
    async fn ping(&mut self) -> Result<()>;

    /// Current slots, primary first
    async fn read_images(&mut self) -> Result<Vec<ImageEntry>>;

    /// Upload an image into the secondary slot
    async fn write_image(&mut self, image: &[u8]) -> Result<()>;

    /// Mark `hash` for a test boot
    async fn set_pending(&mut self, hash: &[u8]) -> Result<()>;

    /// Mark `hash` permanent
    async fn confirm_image(&mut self, hash: &[u8]) -> Result<()>;

    /// Erase the secondary slot, dropping a queued test boot
    async fn erase_image(&mut self) -> Result<()>;

    /// Reboot the device
    async fn reset(&mut self) -> Result<()>;

    /// Release the device; later commands fail
    async fn close(&mut self) -> Result<()>;
}

/// Access path to one device
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable device address
    fn id(&self) -> &str;

    /// Wait until the device is free and open a session
    async fn acquire_session(&self) -> Result<Box<dyn Session>>;
}

/// Packet pipe under an SMP session
#[async_trait]
pub trait Link: Send {
    /// Largest SMP packet the link carries in one request
    fn mtu(&self) -> usize;

    /// Send one request packet and return the matching response packet
    async fn transceive(&mut self, packet: &[u8], seq: u8, timeout: Duration) -> Result<Vec<u8>>;

    /// Time the device needs after a reset before the link is usable
    fn settle_after_reset(&self) -> Duration {
        Duration::ZERO
    }

    /// Tear the link down
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// SMP command set over any [`Link`]
pub struct SmpSession<L: Link> {
    link: Option<L>,
    seq: u8,
    timeout: Duration,
}

impl<L: Link> std::fmt::Debug for SmpSession<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmpSession")
            .field("open", &self.link.is_some())
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

impl<L: Link> SmpSession<L> {
    /// Session over `link`
    #[must_use]
    pub const fn new(link: L) -> Self {
        Self {
            link: Some(link),
            seq: 0,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Override the per-command timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&mut self, op: &'static str, request: Request) -> Result<Response> {
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| Error::Transport(format!("{op}: session is closed")))?;

        self.seq = self.seq.wrapping_add(1);
        let packet = request.encode(self.seq)?;
        let raw = link
            .transceive(&packet, self.seq, self.timeout)
            .await
            .map_err(|e| Error::Transport(format!("{op} failed (err: {e})")))?;

        let response = Response::decode(&raw)?;
        if response.header.group != request.group || response.header.id != request.id {
            return Err(Error::Transport(format!(
                "{op}: response for group {} id {} does not match request",
                response.header.group, response.header.id
            )));
        }
        response.check(op)
    }
}

#[async_trait]
impl<L: Link> Session for SmpSession<L> {
    async fn ping(&mut self) -> Result<()> {
        let request = Request::new(OP_WRITE, GROUP_OS, ID_ECHO).with("d", Value::Text(PING_PAYLOAD.into()));
        let response = self.run("Ping", request).await?;
        match response.get("r") {
            Some(Value::Text(r)) if r == PING_PAYLOAD => Ok(()),
            other => Err(Error::Transport(format!(
                "bad Pong response (expected '{PING_PAYLOAD}', got {other:?})"
            ))),
        }
    }

    async fn read_images(&mut self) -> Result<Vec<ImageEntry>> {
        let response = self
            .run("Reading images", Request::new(OP_READ, GROUP_IMAGE, ID_IMAGE_STATE))
            .await?;
        match response.get("images") {
            Some(Value::Array(images)) => images.iter().map(ImageEntry::from_cbor).collect(),
            _ => Err(Error::Transport("image state response has no images".to_string())),
        }
    }

    async fn write_image(&mut self, image: &[u8]) -> Result<()> {
        let mtu = self.link.as_ref().map_or(0, Link::mtu);
        let chunk = mtu.saturating_sub(UPLOAD_OVERHEAD).max(32);
        let digest = Sha256::digest(image).to_vec();
        let total = image.len();

        let mut offset = 0usize;
        while offset < total {
            let end = (offset + chunk).min(total);
            let mut request = Request::new(OP_WRITE, GROUP_IMAGE, ID_IMAGE_UPLOAD)
                .with("off", Value::Integer(offset as i128))
                .with("data", Value::Bytes(image[offset..end].to_vec()));
            if offset == 0 {
                request = request
                    .with("image", Value::Integer(0))
                    .with("len", Value::Integer(total as i128))
                    .with("sha", Value::Bytes(digest.clone()))
                    .with("upgrade", Value::Bool(false));
            }

            let response = self.run("Writing image", request).await?;
            let next = response
                .int("off")
                .and_then(|v| usize::try_from(v).ok())
                .ok_or_else(|| Error::Transport("upload response has no offset".to_string()))?;
            if next <= offset {
                return Err(Error::Transport(format!("device did not advance upload offset ({next})")));
            }
            offset = next;
            tracing::trace!(offset, total, "image upload progress");
        }
        Ok(())
    }

    async fn set_pending(&mut self, hash: &[u8]) -> Result<()> {
        let request = Request::new(OP_WRITE, GROUP_IMAGE, ID_IMAGE_STATE)
            .with("hash", Value::Bytes(hash.to_vec()))
            .with("confirm", Value::Bool(false));
        self.run("Setting image as pending", request).await.map(drop)
    }

    async fn confirm_image(&mut self, hash: &[u8]) -> Result<()> {
        let request = Request::new(OP_WRITE, GROUP_IMAGE, ID_IMAGE_STATE)
            .with("hash", Value::Bytes(hash.to_vec()))
            .with("confirm", Value::Bool(true));
        self.run("Confirming new image", request).await.map(drop)
    }

    async fn erase_image(&mut self) -> Result<()> {
        self.run("Erasing secondary slot", Request::new(OP_WRITE, GROUP_IMAGE, ID_IMAGE_ERASE))
            .await
            .map(drop)
    }

    async fn reset(&mut self) -> Result<()> {
        self.run("Resetting device", Request::new(OP_WRITE, GROUP_OS, ID_RESET))
            .await?;
        let settle = self.link.as_ref().map_or(Duration::ZERO, Link::settle_after_reset);
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        match self.link.take() {
            Some(mut link) => link.close().await,
            None => Ok(()),
        }
    }
}
