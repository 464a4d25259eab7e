//! Wear-aware writer for raw block devices
//!
//! Data is buffered into frames (a power-of-two multiple of the sector size,
//! at least 1 MiB). Each frame is compared with what the device already
//! holds and only written when it differs.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Lower bound for the frame size
pub const MIN_FRAME_SIZE: usize = 1024 * 1024;

/// Sector size assumed for regular files
const DEFAULT_SECTOR_SIZE: usize = 512;

/// Counters collected while writing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    /// Frames compared against the device
    pub frames_checked: u64,
    /// Frames that differed and were written
    pub frames_overwritten: u64,
    /// Bytes accepted from the stream
    pub bytes_accepted: u64,
}

/// An open block device (or image file) receiving an update
#[derive(Debug)]
pub struct BlockDevice {
    path: PathBuf,
    file: File,
    remaining: u64,
    declared: u64,
    buffer: Vec<u8>,
    scratch: Vec<u8>,
    sector_size: usize,
    frame_size: usize,
    bytes_until_flush: i64,
    stats: WriteStats,
}

impl BlockDevice {
    /// Open `path` for an update of `update_size` bytes
    ///
    /// The partition is unmounted first if `/proc/self/mounts` lists it.
    ///
    /// # Errors
    ///
    /// Returns `NoSpace` if a block device is smaller than the update, or
    /// `BlockDevice` for a negative size or if unmounting, opening or
    /// querying the device fails
    pub fn open(path: impl AsRef<Path>, update_size: i64) -> Result<Self> {
        let path = path.as_ref();
        let declared = u64::try_from(update_size)
            .map_err(|_| Error::BlockDevice("invalid update: negative size".to_string()))?;

        tracing::info!(device = %path.display(), size = declared, "installing update");

        unmount_if_mounted(path)?;

        let file = OpenOptions::new().read(true).write(true).open(path).map_err(|e| {
            Error::BlockDevice(format!("failed to open {}: {e}", path.display()))
        })?;

        check_capacity(declared, device_size(&file)?)?;

        let sector_size = sector_size(&file)?;
        let frame_size = frame_size(sector_size);
        tracing::debug!(sector_size, frame_size, "initialized block device writer");

        Ok(Self {
            path: path.to_path_buf(),
            file,
            remaining: declared,
            declared,
            buffer: Vec::with_capacity(frame_size),
            scratch: vec![0; frame_size],
            sector_size,
            frame_size,
            bytes_until_flush: 0,
            stats: WriteStats::default(),
        })
    }

    /// Device path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sector size reported by the device
    #[must_use]
    pub const fn sector_size(&self) -> usize {
        self.sector_size
    }

    /// Diff/write quantum
    #[must_use]
    pub const fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Counters so far
    #[must_use]
    pub const fn stats(&self) -> WriteStats {
        self.stats
    }

    /// Write the buffered tail, sync and release the device
    ///
    /// # Errors
    ///
    /// Returns error if the final write or sync fails
    pub fn close(mut self) -> Result<WriteStats> {
        let tail = std::mem::take(&mut self.buffer);
        if !tail.is_empty() {
            self.write_frame_if_diff(&tail)?;
        }
        self.sync()?;

        tracing::info!(
            device = %self.path.display(),
            checked = self.stats.frames_checked,
            overwritten = self.stats.frames_overwritten,
            bytes = self.stats.bytes_accepted,
            "block device closed"
        );
        Ok(self.stats)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.bytes_until_flush = i64::try_from(self.sector_size).unwrap_or(i64::MAX);
        self.file.sync_all()
    }

    fn write_frame_if_diff(&mut self, frame: &[u8]) -> io::Result<()> {
        let current = &mut self.scratch[..frame.len()];
        let read = read_full(&mut self.file, current)?;
        self.stats.frames_checked += 1;

        if read == frame.len() && current[..] == *frame {
            return Ok(());
        }

        self.file.seek(SeekFrom::Current(-i64::try_from(read).unwrap_or(0)))?;
        self.file.write_all(frame)?;
        self.stats.frames_overwritten += 1;

        self.bytes_until_flush -= i64::try_from(frame.len()).unwrap_or(i64::MAX);
        if self.bytes_until_flush < 0 {
            self.sync()?;
        }
        Ok(())
    }
}

impl Write for BlockDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.remaining == 0 {
            tracing::warn!(device = %self.path.display(), declared = self.declared, "update exceeds declared size");
            return Err(io::Error::from_raw_os_error(libc::ENOSPC));
        }

        let accepted = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        self.buffer.extend_from_slice(&buf[..accepted]);
        self.remaining -= accepted as u64;
        self.stats.bytes_accepted += accepted as u64;

        if self.buffer.len() >= self.frame_size {
            let full = self.buffer.len() / self.frame_size * self.frame_size;
            let pending: Vec<u8> = self.buffer.drain(..full).collect();
            for frame in pending.chunks(self.frame_size) {
                self.write_frame_if_diff(frame)?;
            }
        }

        Ok(accepted)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Map a writer error to `NoSpace` when the stream overran the device
#[must_use]
pub fn map_write_error(err: io::Error, declared: u64) -> Error {
    if err.raw_os_error() == Some(libc::ENOSPC) {
        Error::NoSpace(declared)
    } else {
        Error::Io(err)
    }
}

/// Smallest power-of-two multiple of `sector` that is at least 1 MiB
#[must_use]
pub fn frame_size(sector: usize) -> usize {
    let mut frame = sector.max(1);
    while frame < MIN_FRAME_SIZE {
        frame *= 2;
    }
    frame
}

/// Refuse an update larger than the device; `None` means the target grows
///
/// # Errors
///
/// Returns `NoSpace` with the device size
pub fn check_capacity(declared: u64, capacity: Option<u64>) -> Result<()> {
    match capacity {
        Some(capacity) if declared > capacity => {
            tracing::error!(declared, capacity, "update does not fit the device");
            Err(Error::NoSpace(capacity))
        }
        _ => Ok(()),
    }
}

/// `BLKGETSIZE64` from `<linux/fs.h>`; not exported by the `libc` crate
const BLKGETSIZE64: libc::Ioctl = libc::_IOR::<libc::size_t>(0x12, 114);

/// Size in bytes of a block device, `None` for regular files
#[allow(unsafe_code)]
fn device_size(file: &File) -> Result<Option<u64>> {
    use std::os::fd::AsRawFd;

    if !file.metadata()?.file_type().is_block_device() {
        return Ok(None);
    }

    let mut size: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes a single u64 through the pointer
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &raw mut size) };
    if rc != 0 {
        return Err(Error::BlockDevice(format!(
            "couldn't get size of device: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(Some(size))
}

#[allow(unsafe_code)]
fn sector_size(file: &File) -> Result<usize> {
    use std::os::fd::AsRawFd;

    let meta = file.metadata()?;
    if !meta.file_type().is_block_device() {
        return Ok(DEFAULT_SECTOR_SIZE);
    }

    let mut size: libc::c_int = 0;
    // SAFETY: BLKSSZGET writes a single c_int through the pointer
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), libc::BLKSSZGET, &raw mut size) };
    if rc != 0 {
        return Err(Error::BlockDevice(format!(
            "couldn't get sector size of device: {}",
            io::Error::last_os_error()
        )));
    }

    usize::try_from(size)
        .ok()
        .filter(|s| *s > 0)
        .ok_or_else(|| Error::BlockDevice(format!("device reported invalid sector size {size}")))
}

/// Mount point of `device` according to a mounts table
#[must_use]
pub fn mount_point(mounts: &str, device: &str) -> Option<String> {
    mounts.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let (Some(source), Some(target)) = (fields.next(), fields.next()) else {
            return None;
        };
        (source == device).then(|| target.to_string())
    })
}

#[allow(unsafe_code)]
fn unmount_if_mounted(device: &Path) -> Result<()> {
    let Ok(mounts) = std::fs::read_to_string("/proc/self/mounts") else {
        return Ok(());
    };
    let Some(target) = mount_point(&mounts, &device.to_string_lossy()) else {
        return Ok(());
    };

    tracing::info!(device = %device.display(), mount_point = %target, "unmounting partition");

    let c_target = std::ffi::CString::new(target.as_str())
        .map_err(|_| Error::BlockDevice(format!("invalid mount point {target:?}")))?;
    // SAFETY: c_target is a valid NUL-terminated path for the duration of the call
    let rc = unsafe { libc::umount2(c_target.as_ptr(), 0) };
    if rc != 0 {
        return Err(Error::BlockDevice(format!(
            "failed to unmount {target}: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
