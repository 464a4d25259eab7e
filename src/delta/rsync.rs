//! librsync-compatible signatures, deltas and patching
//!
//! Signature: `0x72730137`, block length, strong length, then per block a
//! rollsum and a truncated BLAKE2b digest. Delta: `0x72730236` followed by
//! literal and copy commands, terminated by a zero byte. All integers are
//! big-endian.

use std::collections::HashMap;
use std::io::{self, Read, SeekFrom, Write};

use blake2::Blake2b;
use blake2::digest::Digest;
use blake2::digest::consts::U32;

use super::{DeltaEngine, ReadSeek};
use crate::{Error, Result};

/// BLAKE2 signature magic
pub const SIGNATURE_MAGIC: u32 = 0x7273_0137;

/// Delta magic
pub const DELTA_MAGIC: u32 = 0x7273_0236;

/// Default block length
pub const BLOCK_LEN: u32 = 4096;

/// Default strong sum length (full BLAKE2b-256)
pub const STRONG_LEN: u32 = 32;

const CHAR_OFFSET: u32 = 31;

const OP_END: u8 = 0x00;
const OP_LITERAL_N1: u8 = 0x41;
const OP_COPY_N1_N1: u8 = 0x45;
const OP_COPY_LAST: u8 = 0x54;

/// Largest literal emitted as one command
const MAX_LITERAL: usize = 1 << 16;

type Blake2b256 = Blake2b<U32>;

/// rsync delta engine
#[derive(Debug, Clone, Copy, Default)]
pub struct Rsync;

impl DeltaEngine for Rsync {
    fn name(&self) -> &'static str {
        "rsync"
    }

    fn encode(&self, base: &mut dyn Read, target: &mut dyn Read, out: &mut dyn Write) -> Result<()> {
        let signature = Signature::generate(base, BLOCK_LEN, STRONG_LEN)?;
        delta(&signature, target, out)
    }

    fn decode(&self, base: &mut dyn ReadSeek, delta: &mut dyn Read, out: &mut dyn Write) -> Result<()> {
        patch(base, delta, out)
    }
}

/// Weak rolling checksum
#[derive(Debug, Clone, Copy, Default)]
struct Rollsum {
    count: u32,
    s1: u32,
    s2: u32,
}

impl Rollsum {
    fn of(buf: &[u8]) -> Self {
        let mut sum = Self::default();
        for &b in buf {
            sum.s1 = sum.s1.wrapping_add(u32::from(b) + CHAR_OFFSET);
            sum.s2 = sum.s2.wrapping_add(sum.s1);
        }
        sum.count = u32::try_from(buf.len()).unwrap_or(u32::MAX);
        sum
    }

    fn rotate(&mut self, out: u8, inp: u8) {
        let out = u32::from(out) + CHAR_OFFSET;
        self.s1 = self.s1.wrapping_add(u32::from(inp) + CHAR_OFFSET).wrapping_sub(out);
        self.s2 = self.s2.wrapping_add(self.s1).wrapping_sub(self.count.wrapping_mul(out));
    }

    fn rollout(&mut self, out: u8) {
        let out = u32::from(out) + CHAR_OFFSET;
        self.s1 = self.s1.wrapping_sub(out);
        self.s2 = self.s2.wrapping_sub(self.count.wrapping_mul(out));
        self.count -= 1;
    }

    const fn digest(&self) -> u32 {
        ((self.s2 & 0xffff) << 16) | (self.s1 & 0xffff)
    }
}

fn strong_sum(block: &[u8], len: usize) -> Vec<u8> {
    let digest = Blake2b256::digest(block);
    digest[..len].to_vec()
}

/// Block signature of a base file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    block_len: u32,
    strong_len: u32,
    blocks: Vec<(u32, Vec<u8>)>,
}

impl Signature {
    /// Compute the signature of `base`
    ///
    /// # Errors
    ///
    /// Returns `Delta` for invalid lengths, or on I/O failure
    pub fn generate(base: &mut dyn Read, block_len: u32, strong_len: u32) -> Result<Self> {
        if block_len == 0 || strong_len == 0 || strong_len > 32 {
            return Err(Error::Delta(format!(
                "invalid signature parameters (block {block_len}, strong {strong_len})"
            )));
        }

        let mut blocks = Vec::new();
        let mut buf = vec![0u8; block_len as usize];
        loop {
            let n = read_full(base, &mut buf)?;
            if n == 0 {
                break;
            }
            let block = &buf[..n];
            blocks.push((Rollsum::of(block).digest(), strong_sum(block, strong_len as usize)));
            if n < buf.len() {
                break;
            }
        }

        Ok(Self {
            block_len,
            strong_len,
            blocks,
        })
    }

    /// Number of blocks covered
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Serialize in librsync's format
    ///
    /// # Errors
    ///
    /// Returns error on I/O failure
    pub fn write_to(&self, out: &mut dyn Write) -> Result<()> {
        out.write_all(&SIGNATURE_MAGIC.to_be_bytes())?;
        out.write_all(&self.block_len.to_be_bytes())?;
        out.write_all(&self.strong_len.to_be_bytes())?;
        for (weak, strong) in &self.blocks {
            out.write_all(&weak.to_be_bytes())?;
            out.write_all(strong)?;
        }
        Ok(())
    }

    /// Parse a serialized signature
    ///
    /// # Errors
    ///
    /// Returns `Delta` for a foreign magic or truncated input
    pub fn read_from(input: &mut dyn Read) -> Result<Self> {
        let magic = read_u32(input)?;
        if magic != SIGNATURE_MAGIC {
            return Err(Error::Delta(format!("unsupported signature magic {magic:#010x}")));
        }
        let block_len = read_u32(input)?;
        let strong_len = read_u32(input)?;
        if block_len == 0 || strong_len == 0 || strong_len > 32 {
            return Err(Error::Delta("corrupt signature header".to_string()));
        }

        let mut blocks = Vec::new();
        let mut weak = [0u8; 4];
        loop {
            if read_full(input, &mut weak)? == 0 {
                break;
            }
            let mut strong = vec![0u8; strong_len as usize];
            input.read_exact(&mut strong)?;
            blocks.push((u32::from_be_bytes(weak), strong));
        }

        Ok(Self {
            block_len,
            strong_len,
            blocks,
        })
    }

    fn index(&self) -> HashMap<u32, Vec<usize>> {
        let mut index: HashMap<u32, Vec<usize>> = HashMap::new();
        for (i, (weak, _)) in self.blocks.iter().enumerate() {
            index.entry(*weak).or_default().push(i);
        }
        index
    }
}

/// Command stream writer, merging adjacent copies
struct DeltaWriter<'a> {
    out: &'a mut dyn Write,
    pending_copy: Option<(u64, u64)>,
}

impl DeltaWriter<'_> {
    fn literal(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.flush_copy()?;
        for chunk in data.chunks(MAX_LITERAL) {
            let len = chunk.len() as u64;
            if len <= 64 {
                self.out.write_all(&[u8::try_from(len).unwrap_or(64)])?;
            } else {
                let width = int_width(len);
                self.out.write_all(&[OP_LITERAL_N1 + width_index(width)])?;
                write_int(self.out, len, width)?;
            }
            self.out.write_all(chunk)?;
        }
        Ok(())
    }

    fn copy(&mut self, offset: u64, len: u64) -> Result<()> {
        match self.pending_copy {
            Some((start, pending)) if start + pending == offset => {
                self.pending_copy = Some((start, pending + len));
            }
            _ => {
                self.flush_copy()?;
                self.pending_copy = Some((offset, len));
            }
        }
        Ok(())
    }

    fn flush_copy(&mut self) -> Result<()> {
        if let Some((offset, len)) = self.pending_copy.take() {
            let (w_off, w_len) = (int_width(offset), int_width(len));
            let op = OP_COPY_N1_N1 + width_index(w_off) * 4 + width_index(w_len);
            self.out.write_all(&[op])?;
            write_int(self.out, offset, w_off)?;
            write_int(self.out, len, w_len)?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.flush_copy()?;
        self.out.write_all(&[OP_END])?;
        self.out.flush()?;
        Ok(())
    }
}

/// Write a delta of `target` against `signature`
///
/// The target is streamed; only about one block plus the pending literal is
/// kept in memory.
///
/// # Errors
///
/// Returns error on I/O failure
pub fn delta(signature: &Signature, target: &mut dyn Read, out: &mut dyn Write) -> Result<()> {
    let block_len = signature.block_len as usize;
    let strong_len = signature.strong_len as usize;
    let index = signature.index();

    out.write_all(&DELTA_MAGIC.to_be_bytes())?;
    let mut writer = DeltaWriter {
        out,
        pending_copy: None,
    };

    let mut buf: Vec<u8> = Vec::with_capacity(block_len * 4);
    let mut chunk = vec![0u8; block_len * 2];
    let mut eof = false;
    let mut pos = 0usize;
    let mut lit_start = 0usize;
    let mut sum: Option<Rollsum> = None;

    loop {
        // Keep one full window plus the next byte available
        while !eof && buf.len() < pos + block_len + 1 {
            let n = target.read(&mut chunk)?;
            if n == 0 {
                eof = true;
            } else {
                buf.extend_from_slice(&chunk[..n]);
            }
        }

        let avail = buf.len() - pos;
        if avail == 0 {
            break;
        }
        let win = avail.min(block_len);
        let current = *sum.get_or_insert_with(|| Rollsum::of(&buf[pos..pos + win]));

        let matched = index.get(&current.digest()).and_then(|candidates| {
            let strong = strong_sum(&buf[pos..pos + win], strong_len);
            candidates
                .iter()
                .copied()
                .find(|&i| signature.blocks[i].1 == strong)
        });

        if let Some(block) = matched {
            writer.literal(&buf[lit_start..pos])?;
            writer.copy(block as u64 * block_len as u64, win as u64)?;
            pos += win;
            lit_start = pos;
            sum = None;
        } else {
            let mut rolled = current;
            if pos + win < buf.len() {
                rolled.rotate(buf[pos], buf[pos + win]);
            } else {
                rolled.rollout(buf[pos]);
            }
            sum = Some(rolled);
            pos += 1;

            if pos - lit_start >= MAX_LITERAL {
                writer.literal(&buf[lit_start..pos])?;
                lit_start = pos;
            }
        }

        if lit_start >= block_len * 4 {
            buf.drain(..lit_start);
            pos -= lit_start;
            lit_start = 0;
        }
    }

    writer.literal(&buf[lit_start..pos])?;
    writer.finish()
}

/// Apply a delta produced by [`delta`]
///
/// # Errors
///
/// Returns `Delta` for a foreign magic, unknown command or truncated delta
pub fn patch(base: &mut dyn ReadSeek, delta: &mut dyn Read, out: &mut dyn Write) -> Result<()> {
    let magic = read_u32(delta)?;
    if magic != DELTA_MAGIC {
        return Err(Error::Delta(format!("unsupported delta magic {magic:#010x}")));
    }

    loop {
        let mut op = [0u8; 1];
        delta
            .read_exact(&mut op)
            .map_err(|_| Error::Delta("delta ended without END command".to_string()))?;
        let op = op[0];

        match op {
            OP_END => break,
            1..=0x40 => copy_exact(delta, out, u64::from(op))?,
            OP_LITERAL_N1..=0x44 => {
                let len = read_int(delta, 1 << (op - OP_LITERAL_N1))?;
                copy_exact(delta, out, len)?;
            }
            OP_COPY_N1_N1..=OP_COPY_LAST => {
                let rel = op - OP_COPY_N1_N1;
                let offset = read_int(delta, 1 << (rel / 4))?;
                let len = read_int(delta, 1 << (rel % 4))?;
                base.seek(SeekFrom::Start(offset))?;
                copy_exact(base, out, len)?;
            }
            other => return Err(Error::Delta(format!("unknown delta command {other:#04x}"))),
        }
    }

    out.flush()?;
    Ok(())
}

fn copy_exact(from: &mut (impl Read + ?Sized), to: &mut dyn Write, len: u64) -> Result<()> {
    let copied = io::copy(&mut from.take(len), to)?;
    if copied != len {
        return Err(Error::Delta(format!("truncated input: wanted {len} bytes, got {copied}")));
    }
    Ok(())
}

const fn int_width(v: u64) -> usize {
    if v <= 0xff {
        1
    } else if v <= 0xffff {
        2
    } else if v <= 0xffff_ffff {
        4
    } else {
        8
    }
}

const fn width_index(width: usize) -> u8 {
    match width {
        1 => 0,
        2 => 1,
        4 => 2,
        _ => 3,
    }
}

fn write_int(out: &mut dyn Write, v: u64, width: usize) -> Result<()> {
    out.write_all(&v.to_be_bytes()[8 - width..])?;
    Ok(())
}

fn read_int(input: &mut dyn Read, width: usize) -> Result<u64> {
    let mut raw = [0u8; 8];
    input
        .read_exact(&mut raw[8 - width..])
        .map_err(|_| Error::Delta("truncated command parameter".to_string()))?;
    Ok(u64::from_be_bytes(raw))
}

fn read_u32(input: &mut dyn Read) -> Result<u32> {
    let mut raw = [0u8; 4];
    input
        .read_exact(&mut raw)
        .map_err(|_| Error::Delta("truncated header".to_string()))?;
    Ok(u32::from_be_bytes(raw))
}

/// Read until `buf` is full or the stream ends
fn read_full(input: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
