//! Streaming VCDIFF decoder

use std::io::{self, Read, SeekFrom, Write};

use super::code_table::{AddressCache, Kind, default_table};
use super::{
    MAGIC, VCD_ADLER32, VCD_APPHEADER, VCD_CODETABLE, VCD_DECOMPRESS, VCD_SOURCE, VCD_TARGET,
    adler32, read_varint,
};
use crate::delta::ReadSeek;
use crate::{Error, Result};

/// Refuse windows larger than this
const MAX_WINDOW: u64 = 1 << 28;

pub(super) fn decode(base: &mut dyn ReadSeek, delta: &mut dyn Read, out: &mut dyn Write) -> Result<()> {
    let mut magic = [0u8; 4];
    delta
        .read_exact(&mut magic)
        .map_err(|_| Error::Delta("not a VCDIFF stream (too short)".to_string()))?;
    if magic != MAGIC {
        return Err(Error::Delta("not a VCDIFF stream".to_string()));
    }

    let indicator = read_byte(delta)?;
    if indicator & VCD_DECOMPRESS != 0 {
        let id = read_byte(delta)?;
        return Err(Error::Delta(format!("secondary compressor {id} is not supported")));
    }
    if indicator & VCD_CODETABLE != 0 {
        return Err(Error::Delta("custom code tables are not supported".to_string()));
    }
    if indicator & VCD_APPHEADER != 0 {
        let len = read_varint(delta)?;
        let skipped = io::copy(&mut (&mut *delta).take(len), &mut io::sink())?;
        if skipped != len {
            return Err(Error::Delta("truncated application header".to_string()));
        }
    }

    let mut windows = 0usize;
    while let Some(win_indicator) = read_optional_byte(delta)? {
        decode_window(win_indicator, base, delta, out)?;
        windows += 1;
    }

    tracing::debug!(windows, "vcdiff stream decoded");
    out.flush()?;
    Ok(())
}

fn decode_window(
    indicator: u8,
    base: &mut dyn ReadSeek,
    delta: &mut dyn Read,
    out: &mut dyn Write,
) -> Result<()> {
    if indicator & VCD_TARGET != 0 {
        return Err(Error::Delta("target-sourced windows are not supported".to_string()));
    }

    let (source_len, source_pos) = if indicator & VCD_SOURCE != 0 {
        (read_varint(delta)?, read_varint(delta)?)
    } else {
        (0, 0)
    };
    if source_pos.checked_add(source_len).is_none() {
        return Err(Error::Delta("source segment runs past the end of any file".to_string()));
    }

    let _encoding_len = read_varint(delta)?;
    let target_len = read_varint(delta)?;
    if target_len > MAX_WINDOW {
        return Err(Error::Delta(format!("target window of {target_len} bytes is too large")));
    }

    let delta_indicator = read_byte(delta)?;
    if delta_indicator != 0 {
        return Err(Error::Delta("compressed window sections are not supported".to_string()));
    }

    let data_len = read_varint(delta)?;
    let inst_len = read_varint(delta)?;
    let addr_len = read_varint(delta)?;
    let checksum = if indicator & VCD_ADLER32 == 0 {
        None
    } else {
        let mut raw = [0u8; 4];
        delta.read_exact(&mut raw)?;
        Some(u32::from_be_bytes(raw))
    };

    let data = read_section(delta, data_len)?;
    let inst = read_section(delta, inst_len)?;
    let addrs = read_section(delta, addr_len)?;

    let mut source = SourceWindow {
        base,
        pos: source_pos,
        len: source_len,
    };
    let target = execute(&mut source, target_len, &data, &inst, &addrs)?;

    if let Some(expected) = checksum {
        let actual = adler32(&target);
        if actual != expected {
            return Err(Error::Delta(format!(
                "window checksum mismatch: expected {expected:#010x}, got {actual:#010x}"
            )));
        }
    }

    out.write_all(&target)?;
    Ok(())
}

struct SourceWindow<'a> {
    base: &'a mut dyn ReadSeek,
    pos: u64,
    len: u64,
}

fn execute(
    source: &mut SourceWindow<'_>,
    target_len: u64,
    data: &[u8],
    inst: &[u8],
    addrs: &[u8],
) -> Result<Vec<u8>> {
    let table = default_table();
    let mut cache = AddressCache::new();
    let mut target: Vec<u8> = Vec::with_capacity(usize::try_from(target_len).unwrap_or_default());
    let (mut data, mut inst, mut addrs) = (data, inst, addrs);

    while let Some((&code, rest)) = inst.split_first() {
        inst = rest;
        let (first, second) = table[usize::from(code)];

        for half in [first, second] {
            if half.kind == Kind::Noop {
                continue;
            }
            let size = if half.size == 0 {
                read_varint(&mut inst)?
            } else {
                u64::from(half.size)
            };
            if (target.len() as u64).checked_add(size).is_none_or(|end| end > target_len) {
                return Err(Error::Delta("instruction overruns target window".to_string()));
            }
            let n = usize::try_from(size).map_err(|_| Error::Delta("oversized instruction".to_string()))?;

            match half.kind {
                Kind::Add => {
                    let bytes = take(&mut data, n)?;
                    target.extend_from_slice(bytes);
                }
                Kind::Run => {
                    let byte = take(&mut data, 1)?[0];
                    target.resize(target.len() + n, byte);
                }
                Kind::Copy => {
                    let here = source
                        .len
                        .checked_add(target.len() as u64)
                        .ok_or_else(|| Error::Delta("window addresses overflow".to_string()))?;
                    let addr = cache.decode(half.mode, here, &mut addrs)?;
                    copy(source, &mut target, addr, n)?;
                }
                Kind::Noop => {}
            }
        }
    }

    if target.len() as u64 != target_len {
        return Err(Error::Delta(format!(
            "window produced {} bytes, expected {target_len}",
            target.len()
        )));
    }
    Ok(target)
}

fn copy(source: &mut SourceWindow<'_>, target: &mut Vec<u8>, addr: u64, mut n: usize) -> Result<()> {
    let mut addr = addr;

    if addr < source.len {
        let from_source = usize::try_from((source.len - addr).min(n as u64))
            .map_err(|_| Error::Delta("oversized copy".to_string()))?;
        let offset = source
            .pos
            .checked_add(addr)
            .ok_or_else(|| Error::Delta("COPY offset overflows".to_string()))?;
        source.base.seek(SeekFrom::Start(offset))?;
        let start = target.len();
        target.resize(start + from_source, 0);
        source
            .base
            .read_exact(&mut target[start..])
            .map_err(|e| Error::Delta(format!("base is shorter than the delta expects: {e}")))?;
        addr += from_source as u64;
        n -= from_source;
    }

    if n > 0 {
        let mut from = usize::try_from(addr - source.len)
            .map_err(|_| Error::Delta("oversized copy".to_string()))?;
        if from >= target.len() {
            return Err(Error::Delta("COPY reads beyond decoded data".to_string()));
        }
        // Byte at a time: the copied range may overlap what it produces
        for _ in 0..n {
            let byte = target[from];
            target.push(byte);
            from += 1;
        }
    }

    Ok(())
}

fn take<'a>(section: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if section.len() < n {
        return Err(Error::Delta("truncated data section".to_string()));
    }
    let (head, rest) = section.split_at(n);
    *section = rest;
    Ok(head)
}

fn read_section(delta: &mut dyn Read, len: u64) -> Result<Vec<u8>> {
    if len > MAX_WINDOW {
        return Err(Error::Delta(format!("section of {len} bytes is too large")));
    }
    let mut buf = Vec::new();
    delta.take(len).read_to_end(&mut buf)?;
    if buf.len() as u64 != len {
        return Err(Error::Delta("truncated window".to_string()));
    }
    Ok(buf)
}

fn read_byte(input: &mut dyn Read) -> Result<u8> {
    read_optional_byte(input)?.ok_or_else(|| Error::Delta("unexpected end of delta".to_string()))
}

fn read_optional_byte(input: &mut dyn Read) -> Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match input.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}
