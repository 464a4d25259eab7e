//! Default instruction code table and address cache

use std::sync::OnceLock;

use super::read_varint;
use crate::{Error, Result};

const NEAR_SIZE: usize = 4;
const SAME_SIZE: usize = 3;

/// First mode using the same-address cache
const SAME_MODE: u8 = 2 + NEAR_SIZE as u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Kind {
    Noop,
    Add,
    Run,
    Copy,
}

/// One half of a code table entry
#[derive(Debug, Clone, Copy)]
pub(super) struct Inst {
    pub kind: Kind,
    pub size: u8,
    pub mode: u8,
}

const NOOP: Inst = Inst {
    kind: Kind::Noop,
    size: 0,
    mode: 0,
};

const fn inst(kind: Kind, size: u8, mode: u8) -> Inst {
    Inst { kind, size, mode }
}

/// RFC 3284 section 5.6
pub(super) fn default_table() -> &'static [(Inst, Inst); 256] {
    static TABLE: OnceLock<[(Inst, Inst); 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [(NOOP, NOOP); 256];
        let mut code = 0usize;
        let mut push = |first: Inst, second: Inst| {
            table[code] = (first, second);
            code += 1;
        };

        push(inst(Kind::Run, 0, 0), NOOP);
        for size in 0..=17 {
            push(inst(Kind::Add, size, 0), NOOP);
        }
        for mode in 0..=8 {
            push(inst(Kind::Copy, 0, mode), NOOP);
            for size in 4..=18 {
                push(inst(Kind::Copy, size, mode), NOOP);
            }
        }
        for mode in 0..=5 {
            for add in 1..=4 {
                for copy in 4..=6 {
                    push(inst(Kind::Add, add, 0), inst(Kind::Copy, copy, mode));
                }
            }
        }
        for mode in 6..=8 {
            for add in 1..=4 {
                push(inst(Kind::Add, add, 0), inst(Kind::Copy, 4, mode));
            }
        }
        for mode in 0..=8 {
            push(inst(Kind::Copy, 4, mode), inst(Kind::Add, 1, 0));
        }

        table
    })
}

/// Code for a lone ADD of `size` bytes, and whether the size must follow
#[allow(clippy::cast_possible_truncation)]
pub(super) fn add_code(size: u64) -> (u8, bool) {
    if (1..=17).contains(&size) {
        (1 + size as u8, false)
    } else {
        (1, true)
    }
}

/// Code for a lone COPY of `size` bytes in `mode`, and whether the size must follow
#[allow(clippy::cast_possible_truncation)]
pub(super) fn copy_code(size: u64, mode: u8) -> (u8, bool) {
    let base = 19 + 16 * mode;
    if (4..=18).contains(&size) {
        (base + size as u8 - 3, false)
    } else {
        (base, true)
    }
}

/// How a COPY address is written to the address section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum EncodedAddr {
    Varint(u64),
    Byte(u8),
}

/// Near/same address cache, reset at the start of every window
pub(super) struct AddressCache {
    near: [u64; NEAR_SIZE],
    next_slot: usize,
    same: Vec<u64>,
}

impl AddressCache {
    pub fn new() -> Self {
        Self {
            near: [0; NEAR_SIZE],
            next_slot: 0,
            same: vec![0; SAME_SIZE * 256],
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn update(&mut self, addr: u64) {
        self.near[self.next_slot] = addr;
        self.next_slot = (self.next_slot + 1) % NEAR_SIZE;
        let slot = (addr % self.same.len() as u64) as usize;
        self.same[slot] = addr;
    }

    /// Decode the address of a COPY executing at `here`
    pub fn decode(&mut self, mode: u8, here: u64, addrs: &mut &[u8]) -> Result<u64> {
        let addr = match mode {
            0 => read_varint(addrs)?,
            1 => here
                .checked_sub(read_varint(addrs)?)
                .ok_or_else(|| Error::Delta("HERE address underflow".to_string()))?,
            m if m < SAME_MODE => {
                let near = self.near[usize::from(m - 2)];
                near.checked_add(read_varint(addrs)?)
                    .ok_or_else(|| Error::Delta("NEAR address overflow".to_string()))?
            }
            m if usize::from(m - SAME_MODE) < SAME_SIZE => {
                let (&byte, rest) = addrs
                    .split_first()
                    .ok_or_else(|| Error::Delta("truncated address section".to_string()))?;
                *addrs = rest;
                self.same[usize::from(m - SAME_MODE) * 256 + usize::from(byte)]
            }
            m => return Err(Error::Delta(format!("invalid address mode {m}"))),
        };

        if addr >= here {
            return Err(Error::Delta(format!("COPY address {addr} is not before {here}")));
        }

        self.update(addr);
        Ok(addr)
    }

    /// Pick the cheapest mode for `addr` at `here`
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&mut self, addr: u64, here: u64) -> (u8, EncodedAddr) {
        let slot = (addr % self.same.len() as u64) as usize;
        let best = if self.same[slot] == addr {
            (SAME_MODE + (slot / 256) as u8, EncodedAddr::Byte((slot % 256) as u8))
        } else {
            let mut best = (0u8, addr);
            if here - addr < best.1 {
                best = (1, here - addr);
            }
            for (i, &near) in self.near.iter().enumerate() {
                if addr >= near && addr - near < best.1 {
                    best = (2 + i as u8, addr - near);
                }
            }
            (best.0, EncodedAddr::Varint(best.1))
        };

        self.update(addr);
        best
    }
}
