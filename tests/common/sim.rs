//! In-memory MCUboot device
//!
//! Answers SMP requests the way an MCUboot/Zephyr target does, including
//! test boots, reverts of unconfirmed images and devices that reject an
//! update.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_cbor::Value;
use sha2::{Digest, Sha256};
use tokio::sync::OwnedMutexGuard;

use rdfm_client::mcumgr::image::{IMAGE_MAGIC, ImageEntry, parse_image_header};
use rdfm_client::mcumgr::smp::{
    GROUP_IMAGE, GROUP_OS, HEADER_LEN, Header, ID_ECHO, ID_IMAGE_ERASE, ID_IMAGE_STATE, ID_IMAGE_UPLOAD,
    ID_RESET, OP_READ, OP_READ_RSP, OP_WRITE_RSP, Request, map_bool, map_bytes, map_int,
};
use rdfm_client::mcumgr::{Link, Session, SmpSession, Transport};
use rdfm_client::{Error, Result};

/// MCUmgr "invalid value" status
const RC_EINVAL: i128 = 3;
/// MCUmgr "bad state" status
const RC_EBADSTATE: i128 = 6;

/// Build a minimal signed-image stand-in carrying `version` and `payload`
#[must_use]
pub fn build_image(major: u8, minor: u8, revision: u16, build: u32, payload: &[u8]) -> Vec<u8> {
    let mut image = vec![0u8; 32];
    image[..4].copy_from_slice(&IMAGE_MAGIC.to_le_bytes());
    image[20] = major;
    image[21] = minor;
    image[22..24].copy_from_slice(&revision.to_le_bytes());
    image[24..28].copy_from_slice(&build.to_le_bytes());
    image.extend_from_slice(payload);
    image
}

/// Something the device was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    /// A full image landed in the secondary slot
    Uploaded(Vec<u8>),
    /// Test boot requested for this hash
    SetPending(Vec<u8>),
    /// Permanent mark requested for this hash
    Confirmed(Vec<u8>),
    /// Secondary slot erased
    Erased,
    /// Device rebooted
    Reset,
}

#[derive(Debug, Clone)]
struct Slot {
    hash: Vec<u8>,
    version: String,
}

impl Slot {
    fn from_image(image: &[u8]) -> Result<Self> {
        Ok(Self {
            hash: Sha256::digest(image).to_vec(),
            version: parse_image_header(image)?.to_string(),
        })
    }
}

#[derive(Debug)]
struct SimState {
    primary: Slot,
    secondary: Option<Slot>,
    confirmed: bool,
    pending: bool,
    permanent: bool,
    reject: bool,
    self_confirm: bool,
    offline_pings: u32,
    boot_pings: u32,
    upload: Vec<u8>,
    upload_len: usize,
    events: Vec<SimEvent>,
}

impl SimState {
    fn images(&self) -> Vec<ImageEntry> {
        let mut images = vec![ImageEntry {
            slot: 0,
            version: self.primary.version.clone(),
            hash: self.primary.hash.clone(),
            bootable: true,
            confirmed: self.confirmed,
            active: true,
            ..ImageEntry::default()
        }];
        if let Some(secondary) = &self.secondary {
            images.push(ImageEntry {
                slot: 1,
                version: secondary.version.clone(),
                hash: secondary.hash.clone(),
                bootable: true,
                pending: self.pending,
                permanent: self.permanent,
                ..ImageEntry::default()
            });
        }
        images
    }

    fn reset(&mut self) {
        self.events.push(SimEvent::Reset);
        self.offline_pings = self.boot_pings;

        if self.pending {
            let permanent = self.permanent;
            self.pending = false;
            self.permanent = false;
            if self.reject && !permanent {
                return;
            }
            if let Some(secondary) = self.secondary.take() {
                let previous = std::mem::replace(&mut self.primary, secondary);
                self.secondary = Some(previous);
                self.confirmed = permanent || self.self_confirm;
            }
        } else if !self.confirmed
            && let Some(secondary) = self.secondary.take()
        {
            // unconfirmed test boot reverts
            let previous = std::mem::replace(&mut self.primary, secondary);
            self.secondary = Some(previous);
            self.confirmed = true;
        }
    }

    fn image_state(&mut self, body: &BTreeMap<Value, Value>) -> BTreeMap<Value, Value> {
        let Some(hash) = map_bytes(body, "hash").map(<[u8]>::to_vec) else {
            return rc(RC_EINVAL);
        };
        let secondary = self.secondary.as_ref().map(|s| s.hash.clone());

        if map_bool(body, "confirm") {
            self.events.push(SimEvent::Confirmed(hash.clone()));
            if hash == self.primary.hash {
                self.confirmed = true;
            } else if Some(&hash) == secondary.as_ref() {
                self.pending = true;
                self.permanent = true;
            } else {
                return rc(RC_EINVAL);
            }
        } else {
            self.events.push(SimEvent::SetPending(hash.clone()));
            if Some(&hash) != secondary.as_ref() {
                return rc(RC_EINVAL);
            }
            self.pending = true;
            self.permanent = false;
        }
        self.images_body()
    }

    fn upload(&mut self, body: &BTreeMap<Value, Value>) -> BTreeMap<Value, Value> {
        let off = map_int(body, "off").and_then(|v| usize::try_from(v).ok()).unwrap_or(0);
        let data = map_bytes(body, "data").unwrap_or_default();
        if off == 0 {
            self.upload.clear();
            self.upload_len = map_int(body, "len").and_then(|v| usize::try_from(v).ok()).unwrap_or(0);
        }
        if off != self.upload.len() {
            return rc(RC_EINVAL);
        }
        self.upload.extend_from_slice(data);

        if self.upload.len() >= self.upload_len {
            let image = std::mem::take(&mut self.upload);
            match Slot::from_image(&image) {
                Ok(slot) => {
                    self.events.push(SimEvent::Uploaded(slot.hash.clone()));
                    self.secondary = Some(slot);
                    self.pending = false;
                    self.permanent = false;
                }
                Err(_) => return rc(RC_EINVAL),
            }
            return BTreeMap::from([(text("rc"), Value::Integer(0)), (text("off"), Value::Integer(image.len() as i128))]);
        }
        BTreeMap::from([
            (text("rc"), Value::Integer(0)),
            (text("off"), Value::Integer(self.upload.len() as i128)),
        ])
    }

    fn erase(&mut self) -> BTreeMap<Value, Value> {
        self.events.push(SimEvent::Erased);
        if self.pending && self.permanent {
            return rc(RC_EBADSTATE);
        }
        self.secondary = None;
        self.pending = false;
        BTreeMap::from([(text("rc"), Value::Integer(0))])
    }

    fn images_body(&self) -> BTreeMap<Value, Value> {
        BTreeMap::from([(
            text("images"),
            Value::Array(self.images().iter().map(ImageEntry::to_cbor).collect()),
        )])
    }
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn rc(code: i128) -> BTreeMap<Value, Value> {
    BTreeMap::from([(text("rc"), Value::Integer(code))])
}

/// Simulated device, usable as a [`Transport`]
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    id: String,
    state: Arc<Mutex<SimState>>,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl SimulatedDevice {
    /// Device running `image`, confirmed
    ///
    /// # Errors
    ///
    /// Returns `Artifact` if `image` has no valid header
    pub fn new(id: &str, image: &[u8]) -> Result<Self> {
        Ok(Self {
            id: id.to_string(),
            state: Arc::new(Mutex::new(SimState {
                primary: Slot::from_image(image)?,
                secondary: None,
                confirmed: true,
                pending: false,
                permanent: false,
                reject: false,
                self_confirm: false,
                offline_pings: 0,
                boot_pings: 0,
                upload: Vec::new(),
                upload_len: 0,
                events: Vec::new(),
            })),
            lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// New images never boot; the bootloader keeps the old primary
    #[must_use]
    pub fn rejecting(self) -> Self {
        self.state().reject = true;
        self
    }

    /// Firmware confirms itself after a successful test boot
    #[must_use]
    pub fn self_confirming(self) -> Self {
        self.state().self_confirm = true;
        self
    }

    /// Pings fail this many times after each reset
    #[must_use]
    pub fn boot_pings(self, pings: u32) -> Self {
        self.state().boot_pings = pings;
        self
    }

    /// Leave the running image unconfirmed
    #[must_use]
    pub fn unconfirmed(self) -> Self {
        self.state().confirmed = false;
        self
    }

    /// Hash of the running image
    #[must_use]
    pub fn primary_hash(&self) -> Vec<u8> {
        self.state().primary.hash.clone()
    }

    /// Whether the running image is confirmed
    #[must_use]
    pub fn confirmed(&self) -> bool {
        self.state().confirmed
    }

    /// Everything the device was asked to do, in order
    #[must_use]
    pub fn events(&self) -> Vec<SimEvent> {
        self.state().events.clone()
    }

    fn handle(&self, header: Header, body: &BTreeMap<Value, Value>) -> Result<BTreeMap<Value, Value>> {
        let mut state = self.state();
        Ok(match (header.group, header.id) {
            (GROUP_OS, ID_ECHO) => {
                if state.offline_pings > 0 {
                    state.offline_pings -= 1;
                    return Err(Error::Transport(format!("{} is rebooting", self.id)));
                }
                BTreeMap::from([(text("r"), body.get(&text("d")).cloned().unwrap_or(Value::Null))])
            }
            (GROUP_OS, ID_RESET) => {
                state.reset();
                BTreeMap::new()
            }
            (GROUP_IMAGE, ID_IMAGE_STATE) if header.op == OP_READ => state.images_body(),
            (GROUP_IMAGE, ID_IMAGE_STATE) => state.image_state(body),
            (GROUP_IMAGE, ID_IMAGE_UPLOAD) => state.upload(body),
            (GROUP_IMAGE, ID_IMAGE_ERASE) => state.erase(),
            _ => rc(8),
        })
    }
}

#[async_trait]
impl Transport for SimulatedDevice {
    fn id(&self) -> &str {
        &self.id
    }

    async fn acquire_session(&self) -> Result<Box<dyn Session>> {
        let guard = Arc::clone(&self.lock).lock_owned().await;
        Ok(Box::new(
            SmpSession::new(SimLink {
                device: self.clone(),
                _guard: guard,
            })
            .with_timeout(Duration::from_secs(1)),
        ))
    }
}

struct SimLink {
    device: SimulatedDevice,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl Link for SimLink {
    fn mtu(&self) -> usize {
        512
    }

    async fn transceive(&mut self, packet: &[u8], seq: u8, _timeout: Duration) -> Result<Vec<u8>> {
        let header = Header::parse(packet)?;
        let body = match serde_cbor::from_slice(&packet[HEADER_LEN..])? {
            Value::Map(map) => map,
            _ => BTreeMap::new(),
        };
        let reply = self.device.handle(header, &body)?;
        Request {
            op: if header.op == OP_READ { OP_READ_RSP } else { OP_WRITE_RSP },
            group: header.group,
            id: header.id,
            body: reply,
        }
        .encode(seq)
    }
}
