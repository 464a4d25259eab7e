//! SMP over a serial console
//!
//! Packets travel as base64 text lines so they can share the console with
//! log output. A packet is `len (BE u16) | SMP | crc16 (BE)`, where `len`
//! counts the SMP bytes plus the CRC. The first line of a packet starts
//! with `06 09`, continuation lines with `04 14`; every line is at most
//! 127 bytes including its marker and newline.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::io::unix::AsyncFd;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::mcumgr::session::{Link, Session, SmpSession, Transport};
use crate::{Error, Result};

const START: [u8; 2] = [0x06, 0x09];
const CONTINUATION: [u8; 2] = [0x04, 0x14];

/// Raw bytes per line; 93 bytes encode to 124 base64 characters
const RAW_PER_FRAME: usize = 93;

/// Serial reads give up after this long
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Device on a TTY
#[derive(Debug)]
pub struct SerialTransport {
    device: String,
    baud: u32,
    mtu: usize,
    lock: Arc<Mutex<()>>,
}

impl SerialTransport {
    /// Transport for `device` at `baud`
    #[must_use]
    pub fn new(device: String, baud: u32, mtu: usize) -> Self {
        Self {
            device,
            baud,
            mtu,
            lock: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn id(&self) -> &str {
        &self.device
    }

    async fn acquire_session(&self) -> Result<Box<dyn Session>> {
        let guard = Arc::clone(&self.lock).lock_owned().await;
        let port = SerialPort::open(&self.device, self.baud)
            .map_err(|e| Error::Transport(format!("cannot open {}: {e}", self.device)))?;
        tracing::debug!(device = %self.device, baud = self.baud, "serial port opened");

        Ok(Box::new(SmpSession::new(SerialLink {
            port,
            mtu: self.mtu,
            pending: Vec::new(),
            _guard: guard,
        })))
    }
}

struct SerialLink {
    port: SerialPort,
    mtu: usize,
    pending: Vec<u8>,
    _guard: OwnedMutexGuard<()>,
}

impl SerialLink {
    async fn read_line(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                return Ok(line);
            }
            let mut buf = [0u8; 512];
            let n = self.port.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::Transport("serial port closed".to_string()));
            }
            self.pending.extend_from_slice(&buf[..n]);
        }
    }

    async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut decoder = FrameDecoder::default();
        loop {
            let line = self.read_line().await?;
            if let Some(packet) = decoder.push_line(&line)? {
                return Ok(packet);
            }
        }
    }
}

#[async_trait]
impl Link for SerialLink {
    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn transceive(&mut self, packet: &[u8], seq: u8, timeout: Duration) -> Result<Vec<u8>> {
        for frame in encode_frames(packet)? {
            self.port.write_all(&frame).await?;
        }

        let deadline = tokio::time::Instant::now() + timeout.min(READ_TIMEOUT);
        loop {
            let response = tokio::time::timeout_at(deadline, self.read_packet())
                .await
                .map_err(|_| Error::Transport("timed out waiting for serial response".to_string()))??;
            if response.get(6) == Some(&seq) {
                return Ok(response);
            }
            tracing::debug!(expected = seq, "dropping stale serial response");
        }
    }
}

/// Split an SMP packet into console lines
///
/// # Errors
///
/// Returns `Transport` if the packet is too large for the length prefix
pub fn encode_frames(packet: &[u8]) -> Result<Vec<Vec<u8>>> {
    let len = u16::try_from(packet.len() + 2)
        .map_err(|_| Error::Transport(format!("packet too large for serial ({} bytes)", packet.len())))?;

    let mut raw = Vec::with_capacity(packet.len() + 4);
    raw.extend_from_slice(&len.to_be_bytes());
    raw.extend_from_slice(packet);
    raw.extend_from_slice(&crc16(packet).to_be_bytes());

    Ok(raw
        .chunks(RAW_PER_FRAME)
        .enumerate()
        .map(|(i, chunk)| {
            let mut frame = Vec::with_capacity(2 + 124 + 1);
            frame.extend_from_slice(if i == 0 { &START } else { &CONTINUATION });
            frame.extend_from_slice(STANDARD.encode(chunk).as_bytes());
            frame.push(b'\n');
            frame
        })
        .collect())
}

/// Reassemble one packet from console lines
///
/// # Errors
///
/// Returns `Transport` for bad base64 or a CRC mismatch
pub fn decode_frame(lines: &[&[u8]]) -> Result<Option<Vec<u8>>> {
    let mut decoder = FrameDecoder::default();
    for line in lines {
        if let Some(packet) = decoder.push_line(line)? {
            return Ok(Some(packet));
        }
    }
    Ok(None)
}

#[derive(Default)]
struct FrameDecoder {
    buf: Vec<u8>,
    started: bool,
}

impl FrameDecoder {
    fn push_line(&mut self, line: &[u8]) -> Result<Option<Vec<u8>>> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        let body = if let Some(rest) = line.strip_prefix(&START) {
            self.buf.clear();
            self.started = true;
            rest
        } else if let Some(rest) = line.strip_prefix(&CONTINUATION)
            && self.started
        {
            rest
        } else {
            // console output between packets
            return Ok(None);
        };

        let decoded = STANDARD
            .decode(body)
            .map_err(|e| Error::Transport(format!("bad base64 in serial frame: {e}")))?;
        self.buf.extend_from_slice(&decoded);

        if self.buf.len() < 2 {
            return Ok(None);
        }
        let len = usize::from(u16::from_be_bytes([self.buf[0], self.buf[1]]));
        if self.buf.len() < 2 + len {
            return Ok(None);
        }
        if len < 2 {
            return Err(Error::Transport(format!("serial packet length {len} too short")));
        }

        let packet = &self.buf[2..len];
        let expected = u16::from_be_bytes([self.buf[len], self.buf[len + 1]]);
        let actual = crc16(packet);
        if expected != actual {
            return Err(Error::Transport(format!(
                "serial CRC mismatch: expected {expected:#06x}, got {actual:#06x}"
            )));
        }

        let packet = packet.to_vec();
        self.buf.clear();
        self.started = false;
        Ok(Some(packet))
    }
}

/// CRC-16/XMODEM
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 == 0 { crc << 1 } else { (crc << 1) ^ 0x1021 };
        }
    }
    crc
}

/// Non-blocking TTY driven by the tokio reactor
struct SerialPort {
    fd: AsyncFd<File>,
}

impl SerialPort {
    fn open(path: &str, baud: u32) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
            .open(path)?;
        configure(file.as_raw_fd(), baud)?;
        Ok(Self { fd: AsyncFd::new(file)? })
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable_mut().await?;
            match guard.try_io(|inner| inner.get_mut().read(buf)) {
                Ok(result) => return result,
                Err(_would_block) => {}
            }
        }
    }

    async fn write_all(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let mut guard = self.fd.writable_mut().await?;
            match guard.try_io(|inner| inner.get_mut().write(data)) {
                Ok(Ok(n)) => data = &data[n..],
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => {}
            }
        }
        Ok(())
    }
}

fn baud_constant(baud: u32) -> io::Result<libc::speed_t> {
    Ok(match baud {
        9600 => libc::B9600,
        19_200 => libc::B19200,
        38_400 => libc::B38400,
        57_600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        460_800 => libc::B460800,
        921_600 => libc::B921600,
        1_000_000 => libc::B1000000,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported baud rate {other}"),
            ));
        }
    })
}

#[allow(unsafe_code)]
fn configure(fd: RawFd, baud: u32) -> io::Result<()> {
    let speed = baud_constant(baud)?;
    // SAFETY: fd is an open descriptor owned by the caller for the whole
    // call, and termios is a plain C struct filled in by tcgetattr.
    unsafe {
        let mut tio: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &raw mut tio) != 0 {
            return Err(io::Error::last_os_error());
        }
        libc::cfmakeraw(&raw mut tio);
        tio.c_cflag |= libc::CLOCAL | libc::CREAD;
        if libc::cfsetispeed(&raw mut tio, speed) != 0 || libc::cfsetospeed(&raw mut tio, speed) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::tcsetattr(fd, libc::TCSANOW, &raw const tio) != 0 {
            return Err(io::Error::last_os_error());
        }
        libc::tcflush(fd, libc::TCIOFLUSH);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_xmodem() {
        assert_eq!(crc16(b"123456789"), 0x31c3);
    }

    #[test]
    fn test_frames_fit_console_lines() {
        let packet: Vec<u8> = (0..=255u8).collect();
        let frames = encode_frames(&packet).unwrap();
        assert!(frames.len() > 1);
        assert!(frames.iter().all(|f| f.len() <= 127 && f.ends_with(b"\n")));
        assert!(frames[0].starts_with(&START));
        assert!(frames[1..].iter().all(|f| f.starts_with(&CONTINUATION)));
    }

    #[test]
    fn test_decode_skips_console_noise() {
        let packet = b"\x01\x00\x00\x01\x00\x00\x01\x00\xa0".to_vec();
        let frames = encode_frames(&packet).unwrap();

        let mut lines: Vec<&[u8]> = vec![b"uart:~$ booting\n"];
        lines.extend(frames.iter().map(Vec::as_slice));
        assert_eq!(decode_frame(&lines).unwrap(), Some(packet));
    }

    #[test]
    fn test_decode_rejects_bad_crc() {
        let mut frames = encode_frames(b"abcdef").unwrap();
        let mut raw = STANDARD.decode(&frames[0][2..frames[0].len() - 1]).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let mut frame = START.to_vec();
        frame.extend_from_slice(STANDARD.encode(&raw).as_bytes());
        frame.push(b'\n');
        frames[0] = frame;

        let lines: Vec<&[u8]> = frames.iter().map(Vec::as_slice).collect();
        assert!(decode_frame(&lines).is_err());
    }

    #[test]
    fn test_incomplete_packet() {
        let frames = encode_frames(&[7u8; 200]).unwrap();
        let lines: Vec<&[u8]> = vec![frames[0].as_slice()];
        assert_eq!(decode_frame(&lines).unwrap(), None);
    }
}
