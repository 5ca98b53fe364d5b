//! Decomposition of byte ranges into naturally aligned device accesses.
//!
//! An access of 1, 2 or 4 bytes sits at an address divisible by its width.
//! Anything larger is a block: 8-aligned, a multiple of 8 bytes and at most
//! [`MAX_BLOCK_SIZE`] long.

use crate::error::ClientError;
use tas_protocol::{RwItem, MAX_BLOCK_SIZE};

/// One aligned device access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub addr: u64,
    pub len: u32,
}

impl Access {
    /// Offset of this access relative to `base`.
    pub fn offset_from(&self, base: u64) -> usize {
        self.addr.wrapping_sub(base) as usize
    }

    pub fn is_naturally_aligned(&self) -> bool {
        match self.len {
            1 | 2 | 4 => self.addr % self.len as u64 == 0,
            n => n % 8 == 0 && n <= MAX_BLOCK_SIZE && self.addr % 8 == 0,
        }
    }
}

/// Returns a supported minimum access width; anything unexpected degrades
/// to byte access.
pub fn normalize_width(width: u8) -> u8 {
    match width {
        1 | 2 | 4 | 8 => width,
        _ => 1,
    }
}

/// Rejects empty ranges and ranges running past the end of the address space.
pub fn check_range(addr: u64, len: u64) -> Result<(), ClientError> {
    if len == 0 {
        return Err(ClientError::usage("zero-length access"));
    }
    if addr.checked_add(len - 1).is_none() {
        return Err(ClientError::usage(format!(
            "range {:#x}+{} exceeds the address space",
            addr, len
        )));
    }
    Ok(())
}

/// Splits `[addr, addr + len)` into naturally aligned accesses lying
/// entirely inside the range: 1/2/4-byte pieces until the address is
/// 8-aligned, blocks while at least 8 bytes remain, then 4/2/1-byte pieces.
pub fn split_aligned(addr: u64, len: u64) -> Vec<Access> {
    let mut out = Vec::new();
    let mut addr = addr;
    let mut rem = len;

    while rem > 0 {
        let piece = if addr % 8 == 0 && rem >= 8 {
            (rem - rem % 8).min(MAX_BLOCK_SIZE as u64)
        } else {
            [4u64, 2, 1]
                .into_iter()
                .find(|&w| addr % w == 0 && w <= rem)
                .unwrap_or(1)
        };
        out.push(Access {
            addr,
            len: piece as u32,
        });
        addr = addr.wrapping_add(piece);
        rem -= piece;
    }
    out
}

/// `[addr, addr + len)` widened outward to multiples of `width`.
/// Returns the covering start and length.
pub fn cover(addr: u64, len: u64, width: u8) -> (u64, u64) {
    let w = normalize_width(width) as u64;
    let start = addr - addr % w;
    let end = addr as u128 + len as u128;
    let end = end.div_ceil(w as u128) * w as u128;
    (start, (end - start as u128) as u64)
}

/// Accesses needed to read a range and where the requested bytes sit in
/// the concatenated result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPlan {
    pub accesses: Vec<Access>,
    /// Offset of the first requested byte in the concatenated data.
    pub skip: usize,
    pub len: usize,
}

impl ReadPlan {
    pub fn new(addr: u64, len: u32, width: u8) -> Self {
        let (start, covered) = cover(addr, len as u64, width);
        Self {
            accesses: split_aligned(start, covered),
            skip: (addr - start) as usize,
            len: len as usize,
        }
    }

    /// Total bytes transferred by the device accesses.
    pub fn covered_len(&self) -> usize {
        self.accesses.iter().map(|a| a.len as usize).sum()
    }

    /// Cuts the requested bytes out of the concatenated access data.
    pub fn extract(&self, raw: &[u8]) -> Vec<u8> {
        let end = (self.skip + self.len).min(raw.len());
        raw.get(self.skip..end).map(<[u8]>::to_vec).unwrap_or_default()
    }
}

/// Accesses needed to write a range without touching bytes outside it.
///
/// With byte-granular devices the range is written directly. When the
/// device's minimum access width is larger, the partially covered units at
/// either end are listed in `merge_units` and must be read first so their
/// untouched bytes can be written back unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePlan {
    pub start: u64,
    /// Offset of the caller's data inside the covering range.
    pub skip: usize,
    pub covered: usize,
    pub merge_units: Vec<Access>,
    pub accesses: Vec<Access>,
}

impl WritePlan {
    pub fn new(addr: u64, len: u32, width: u8) -> Self {
        let w = normalize_width(width);
        let (start, covered) = cover(addr, len as u64, w);
        // Ranges may end exactly at the top of the address space.
        let end = addr as u128 + len as u128;
        let cover_end = start as u128 + covered as u128;

        let mut merge_units = Vec::new();
        if addr != start {
            merge_units.push(Access {
                addr: start,
                len: w as u32,
            });
        }
        if end != cover_end {
            let tail = Access {
                addr: (cover_end - w as u128) as u64,
                len: w as u32,
            };
            if merge_units.first() != Some(&tail) {
                merge_units.push(tail);
            }
        }

        Self {
            start,
            skip: (addr - start) as usize,
            covered: covered as usize,
            merge_units,
            accesses: split_aligned(start, covered),
        }
    }

    pub fn needs_merge(&self) -> bool {
        !self.merge_units.is_empty()
    }

    /// Builds the covering image from the merge unit contents (in
    /// `merge_units` order) and the caller's data.
    pub fn merge(&self, units: &[Vec<u8>], data: &[u8]) -> Vec<u8> {
        let mut image = vec![0u8; self.covered];
        for (unit, bytes) in self.merge_units.iter().zip(units) {
            let off = unit.offset_from(self.start);
            let n = bytes.len().min(unit.len as usize);
            image[off..off + n].copy_from_slice(&bytes[..n]);
        }
        image[self.skip..self.skip + data.len()].copy_from_slice(data);
        image
    }

    /// Wire items writing `image` (the full covering range).
    pub fn items(&self, image: &[u8]) -> Vec<RwItem> {
        self.accesses
            .iter()
            .map(|a| {
                let off = a.offset_from(self.start);
                RwItem::write(a.addr, image[off..off + a.len as usize].to_vec())
            })
            .collect()
    }
}

/// Combines a 32-bit pattern into the equivalent 64-bit pattern.
pub fn widen_pattern(pattern: u32) -> u64 {
    pattern as u64 | (pattern as u64) << 32
}

/// Bytes laid down by repeating a little-endian pattern of `width` bytes.
pub fn pattern_bytes(pattern: u64, width: usize, len: usize) -> Vec<u8> {
    let unit = pattern.to_le_bytes();
    unit[..width].iter().copied().cycle().take(len).collect()
}

/// Wire items for a 32-bit fill: a leading 32-bit write when `addr` is not
/// 8-aligned, one 64-bit fill for the body and a trailing 32-bit write when
/// four bytes remain.
pub fn fill32_items(
    addr: u64,
    pattern: u32,
    num_bytes: u32,
    width: u8,
) -> Result<Vec<RwItem>, ClientError> {
    if num_bytes == 0 || num_bytes % 4 != 0 {
        return Err(ClientError::usage(format!(
            "fill32 length {} is not a non-zero multiple of 4",
            num_bytes
        )));
    }
    if addr % 4 != 0 {
        return Err(ClientError::usage(format!(
            "fill32 address {:#x} is not 4-byte aligned",
            addr
        )));
    }
    check_range(addr, num_bytes as u64)?;

    let needs_words = addr % 8 != 0 || num_bytes % 8 != 0;
    if needs_words && normalize_width(width) > 4 {
        return Err(ClientError::usage(
            "device requires 8-byte accesses; use an 8-aligned fill",
        ));
    }

    let word = pattern.to_le_bytes().to_vec();
    let mut items = Vec::with_capacity(3);
    let mut a = addr;
    let mut rem = num_bytes;

    if a % 8 != 0 {
        items.push(RwItem::write(a, word.clone()));
        a = a.wrapping_add(4);
        rem -= 4;
    }
    let body = rem - rem % 8;
    if body > 0 {
        items.push(RwItem::fill(a, body, widen_pattern(pattern)));
        a = a.wrapping_add(body as u64);
        rem -= body;
    }
    if rem == 4 {
        items.push(RwItem::write(a, word));
    }
    Ok(items)
}

/// Wire item for a 64-bit fill.
pub fn fill64_item(addr: u64, pattern: u64, num_bytes: u32) -> Result<RwItem, ClientError> {
    if num_bytes == 0 || num_bytes % 8 != 0 {
        return Err(ClientError::usage(format!(
            "fill64 length {} is not a non-zero multiple of 8",
            num_bytes
        )));
    }
    if addr % 8 != 0 {
        return Err(ClientError::usage(format!(
            "fill64 address {:#x} is not 8-byte aligned",
            addr
        )));
    }
    check_range(addr, num_bytes as u64)?;
    Ok(RwItem::fill(addr, num_bytes, pattern))
}
