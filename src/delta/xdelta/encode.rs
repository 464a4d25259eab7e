//! VCDIFF encoder
//!
//! The whole base is indexed in memory and used as the source segment of
//! every window; the target is processed one window at a time.

use std::collections::HashMap;
use std::io::{self, Read, Write};

use super::code_table::{AddressCache, EncodedAddr, add_code, copy_code};
use super::{MAGIC, VCD_ADLER32, VCD_SOURCE, adler32, write_varint};
use crate::Result;

/// Target bytes per window
const WINDOW_SIZE: usize = 1 << 22;

/// Shortest match worth a COPY
const MIN_MATCH: usize = 32;

/// Spacing of indexed source positions
const INDEX_STEP: usize = 16;

fn fingerprint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |h, &b| {
        (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

struct SourceIndex<'a> {
    source: &'a [u8],
    positions: HashMap<u64, usize>,
}

impl<'a> SourceIndex<'a> {
    fn build(source: &'a [u8]) -> Self {
        let mut positions = HashMap::new();
        if source.len() >= MIN_MATCH {
            for pos in (0..=source.len() - MIN_MATCH).step_by(INDEX_STEP) {
                positions
                    .entry(fingerprint(&source[pos..pos + MIN_MATCH]))
                    .or_insert(pos);
            }
        }
        Self { source, positions }
    }

    /// Source offset whose next `MIN_MATCH` bytes equal `window`
    fn lookup(&self, window: &[u8]) -> Option<usize> {
        let pos = *self.positions.get(&fingerprint(window))?;
        (self.source[pos..pos + MIN_MATCH] == *window).then_some(pos)
    }
}

/// Encode `target` against `base`
///
/// `base` is read to the end into memory before the first window is
/// written, so memory use grows with the size of the base image. Only
/// `target` is streamed.
pub(super) fn encode(base: &mut dyn Read, target: &mut dyn Read, out: &mut dyn Write) -> Result<()> {
    let mut source = Vec::new();
    base.read_to_end(&mut source)?;
    let index = SourceIndex::build(&source);

    out.write_all(&MAGIC)?;
    out.write_all(&[0])?;

    let mut window = vec![0u8; WINDOW_SIZE];
    loop {
        let n = read_full(target, &mut window)?;
        if n == 0 {
            break;
        }
        encode_window(&index, &window[..n], out)?;
        if n < WINDOW_SIZE {
            break;
        }
    }

    out.flush()?;
    Ok(())
}

#[derive(Default)]
struct Sections {
    data: Vec<u8>,
    inst: Vec<u8>,
    addrs: Vec<u8>,
}

impl Sections {
    fn add(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let (code, explicit) = add_code(bytes.len() as u64);
        self.inst.push(code);
        if explicit {
            write_varint(&mut self.inst, bytes.len() as u64);
        }
        self.data.extend_from_slice(bytes);
    }

    fn copy(&mut self, cache: &mut AddressCache, addr: u64, len: u64, here: u64) {
        let (mode, encoded) = cache.encode(addr, here);
        let (code, explicit) = copy_code(len, mode);
        self.inst.push(code);
        if explicit {
            write_varint(&mut self.inst, len);
        }
        match encoded {
            EncodedAddr::Varint(v) => write_varint(&mut self.addrs, v),
            EncodedAddr::Byte(b) => self.addrs.push(b),
        }
    }
}

fn encode_window(index: &SourceIndex<'_>, target: &[u8], out: &mut dyn Write) -> Result<()> {
    let source = index.source;
    let source_len = source.len() as u64;
    let mut cache = AddressCache::new();
    let mut sections = Sections::default();

    let mut pos = 0usize;
    let mut lit_start = 0usize;
    while pos + MIN_MATCH <= target.len() {
        let Some(found) = index.lookup(&target[pos..pos + MIN_MATCH]) else {
            pos += 1;
            continue;
        };

        let mut len = MIN_MATCH;
        while found + len < source.len() && pos + len < target.len() && source[found + len] == target[pos + len] {
            len += 1;
        }
        let mut back = 0usize;
        while back < pos - lit_start && back < found && source[found - back - 1] == target[pos - back - 1] {
            back += 1;
        }

        let start = pos - back;
        sections.add(&target[lit_start..start]);
        sections.copy(
            &mut cache,
            (found - back) as u64,
            (len + back) as u64,
            source_len + start as u64,
        );
        pos += len;
        lit_start = pos;
    }
    sections.add(&target[lit_start..]);

    let mut header = Vec::new();
    let mut indicator = VCD_ADLER32;
    if !source.is_empty() {
        indicator |= VCD_SOURCE;
    }
    header.push(indicator);
    if !source.is_empty() {
        write_varint(&mut header, source_len);
        write_varint(&mut header, 0);
    }

    let Sections { data, inst, addrs } = sections;
    let mut body = Vec::with_capacity(32);
    write_varint(&mut body, target.len() as u64);
    body.push(0);
    write_varint(&mut body, data.len() as u64);
    write_varint(&mut body, inst.len() as u64);
    write_varint(&mut body, addrs.len() as u64);
    body.extend_from_slice(&adler32(target).to_be_bytes());

    let encoding_len = body.len() + data.len() + inst.len() + addrs.len();
    write_varint(&mut header, encoding_len as u64);

    out.write_all(&header)?;
    out.write_all(&body)?;
    out.write_all(&data)?;
    out.write_all(&inst)?;
    out.write_all(&addrs)?;
    Ok(())
}

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
