//! VCDIFF (RFC 3284) delta format, as produced by xdelta3
//!
//! The decoder understands the full default code table, the address cache,
//! application headers and xdelta3's Adler-32 window checksums. Secondary
//! compression and custom code tables are rejected. The encoder emits plain
//! ADD/COPY instructions against a single source window.

mod code_table;
mod decode;
mod encode;

use std::io::{Read, Write};

use super::{DeltaEngine, ReadSeek};
use crate::{Error, Result};

/// VCDIFF file magic (including the version byte)
pub const MAGIC: [u8; 4] = [0xd6, 0xc3, 0xc4, 0x00];

/// Header indicator: secondary compressor id follows
const VCD_DECOMPRESS: u8 = 0x01;
/// Header indicator: custom code table follows
const VCD_CODETABLE: u8 = 0x02;
/// Header indicator: application header follows (xdelta3 extension)
const VCD_APPHEADER: u8 = 0x04;

/// Window indicator: copies may reference the source file
const VCD_SOURCE: u8 = 0x01;
/// Window indicator: copies reference earlier target data
const VCD_TARGET: u8 = 0x02;
/// Window indicator: Adler-32 of the target window follows (xdelta3 extension)
const VCD_ADLER32: u8 = 0x04;

/// xdelta engine
#[derive(Debug, Clone, Copy, Default)]
pub struct Xdelta;

impl DeltaEngine for Xdelta {
    fn name(&self) -> &'static str {
        "xdelta"
    }

    fn encode(&self, base: &mut dyn Read, target: &mut dyn Read, out: &mut dyn Write) -> Result<()> {
        encode::encode(base, target, out)
    }

    fn decode(&self, base: &mut dyn ReadSeek, delta: &mut dyn Read, out: &mut dyn Write) -> Result<()> {
        decode::decode(base, delta, out)
    }
}

/// Read a base-128 big-endian integer
fn read_varint(input: &mut (impl Read + ?Sized)) -> Result<u64> {
    let mut value: u64 = 0;
    for _ in 0..10 {
        let mut byte = [0u8; 1];
        input
            .read_exact(&mut byte)
            .map_err(|_| Error::Delta("truncated integer".to_string()))?;
        if value > (u64::MAX >> 7) {
            return Err(Error::Delta("integer overflow".to_string()));
        }
        value = (value << 7) | u64::from(byte[0] & 0x7f);
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::Delta("integer too long".to_string()))
}

#[allow(clippy::cast_possible_truncation)]
fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    let mut tmp = [0u8; 10];
    let mut i = tmp.len() - 1;
    tmp[i] = (value & 0x7f) as u8;
    value >>= 7;
    while value > 0 {
        i -= 1;
        tmp[i] = (value & 0x7f) as u8 | 0x80;
        value >>= 7;
    }
    out.extend_from_slice(&tmp[i..]);
}

#[cfg(test)]
const fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65_521;
    let (mut a, mut b) = (1u32, 0u32);
    for chunk in data.chunks(5552) {
        for &byte in chunk {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}
