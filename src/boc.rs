//! Minimal bag-of-cells codec.
//!
//! Only what the miner needs: read the artifact written by the PoW
//! executable, pick the message body out of it and write that body back
//! as a standalone bag for the outbound transfer.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

const BOC_MAGIC: [u8; 4] = [0xb5, 0xee, 0x9c, 0x72];
const MAX_REFS: usize = 4;
const MAX_BITS: usize = 1023;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BocError {
    #[error("unexpected end of data at byte {0}")]
    Truncated(usize),
    #[error("bad magic prefix")]
    BadMagic,
    #[error("invalid header: {0}")]
    Header(&'static str),
    #[error("cell #{index} is invalid: {reason}")]
    Cell { index: usize, reason: &'static str },
    #[error("artifact has no root cell")]
    NoRoot,
    #[error("root cell carries no reference")]
    NoReference,
}

/// A single cell: up to 1023 data bits and up to four children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    data: Vec<u8>,
    bit_len: usize,
    exotic: bool,
    level_mask: u8,
    refs: Vec<Arc<Cell>>,
}

impl Cell {
    /// Build an ordinary cell. `data` must hold at least `bit_len` bits.
    pub fn new(data: Vec<u8>, bit_len: usize, refs: Vec<Arc<Cell>>) -> Result<Self, BocError> {
        if bit_len > MAX_BITS || data.len() * 8 < bit_len {
            return Err(BocError::Cell {
                index: 0,
                reason: "bit length out of range",
            });
        }
        if refs.len() > MAX_REFS {
            return Err(BocError::Cell {
                index: 0,
                reason: "too many references",
            });
        }
        let mut data = data;
        data.truncate(bit_len.div_ceil(8));
        Ok(Self {
            data,
            bit_len,
            exotic: false,
            level_mask: 0,
            refs,
        })
    }

    #[cfg(test)]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[cfg(test)]
    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    #[cfg(test)]
    pub fn refs(&self) -> &[Arc<Cell>] {
        &self.refs
    }

    pub fn reference(&self, idx: usize) -> Option<&Arc<Cell>> {
        self.refs.get(idx)
    }

    fn descriptors(&self) -> [u8; 2] {
        let d1 = self.refs.len() as u8 | (u8::from(self.exotic) << 3) | (self.level_mask << 5);
        let d2 = (self.bit_len / 8 + self.bit_len.div_ceil(8)) as u8;
        [d1, d2]
    }

    /// Data bytes with the completion tag applied to a partial last byte.
    fn padded_data(&self) -> Vec<u8> {
        let mut out = self.data.clone();
        let rem = self.bit_len % 8;
        if rem != 0 {
            if let Some(last) = out.last_mut() {
                let keep = 0xffu8 << (8 - rem);
                *last = (*last & keep) | (0x80 >> rem);
            }
        }
        out
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], BocError> {
        let end = self.pos.checked_add(n).ok_or(BocError::Truncated(self.pos))?;
        if end > self.buf.len() {
            return Err(BocError::Truncated(self.pos));
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn byte(&mut self) -> Result<u8, BocError> {
        Ok(self.take(1)?[0])
    }

    fn uint(&mut self, width: usize) -> Result<usize, BocError> {
        let bytes = self.take(width)?;
        Ok(bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize))
    }
}

struct RawCell {
    data: Vec<u8>,
    bit_len: usize,
    exotic: bool,
    level_mask: u8,
    refs: Vec<usize>,
}

/// Parse a serialized bag of cells and return its root cells.
pub fn deserialize(bytes: &[u8]) -> Result<Vec<Arc<Cell>>, BocError> {
    let mut r = Reader { buf: bytes, pos: 0 };
    if r.take(4)? != BOC_MAGIC {
        return Err(BocError::BadMagic);
    }

    let flags = r.byte()?;
    let has_idx = flags & 0x80 != 0;
    let size = (flags & 0x07) as usize;
    if size == 0 || size > 4 {
        return Err(BocError::Header("reference size must be 1..=4 bytes"));
    }
    let off_bytes = r.byte()? as usize;
    if off_bytes == 0 || off_bytes > 8 {
        return Err(BocError::Header("offset size must be 1..=8 bytes"));
    }

    let cells = r.uint(size)?;
    let roots = r.uint(size)?;
    let _absent = r.uint(size)?;
    let total_size = r.uint(off_bytes)?;
    if roots > cells {
        return Err(BocError::Header("more roots than cells"));
    }
    if cells > bytes.len() {
        return Err(BocError::Header("cell count exceeds payload"));
    }

    let mut root_idx = Vec::with_capacity(roots);
    for _ in 0..roots {
        let idx = r.uint(size)?;
        if idx >= cells {
            return Err(BocError::Header("root index out of range"));
        }
        root_idx.push(idx);
    }
    if has_idx {
        r.take(cells.saturating_mul(off_bytes))?;
    }

    let data_start = r.pos;
    let mut raw = Vec::with_capacity(cells);
    for index in 0..cells {
        let d1 = r.byte()?;
        let d2 = r.byte()?;
        let ref_count = (d1 & 0x07) as usize;
        if ref_count > MAX_REFS {
            return Err(BocError::Cell {
                index,
                reason: "too many references",
            });
        }
        let exotic = d1 & 0x08 != 0;
        let level_mask = d1 >> 5;
        if d1 & 0x10 != 0 {
            // stored hashes and depths, not needed here
            let hashes = level_mask.count_ones() as usize + 1;
            r.take(hashes * (32 + 2))?;
        }

        let data_len = (d2 as usize).div_ceil(2);
        let mut data = r.take(data_len)?.to_vec();
        let bit_len = if d2 % 2 == 0 {
            data_len * 8
        } else {
            let last = data.last().copied().unwrap_or(0);
            if last == 0 {
                return Err(BocError::Cell {
                    index,
                    reason: "missing completion tag",
                });
            }
            let tag = last.trailing_zeros() as usize;
            let bits = (data_len - 1) * 8 + (7 - tag);
            if let Some(byte) = data.last_mut() {
                *byte &= !(1u8 << tag);
            }
            bits
        };

        let mut refs = Vec::with_capacity(ref_count);
        for _ in 0..ref_count {
            let child = r.uint(size)?;
            if child <= index || child >= cells {
                return Err(BocError::Cell {
                    index,
                    reason: "reference must point to a later cell",
                });
            }
            refs.push(child);
        }

        raw.push(RawCell {
            data,
            bit_len,
            exotic,
            level_mask,
            refs,
        });
    }
    if r.pos - data_start != total_size {
        return Err(BocError::Header("cell data size mismatch"));
    }

    // children always come after their parent, so build back to front
    let mut built: Vec<Option<Arc<Cell>>> = vec![None; cells];
    for index in (0..cells).rev() {
        let rc = &raw[index];
        let mut refs = Vec::with_capacity(rc.refs.len());
        for child in &rc.refs {
            let cell = built[*child].clone().ok_or(BocError::Cell {
                index,
                reason: "dangling reference",
            })?;
            refs.push(cell);
        }
        built[index] = Some(Arc::new(Cell {
            data: rc.data.clone(),
            bit_len: rc.bit_len,
            exotic: rc.exotic,
            level_mask: rc.level_mask,
            refs,
        }));
    }

    root_idx
        .into_iter()
        .map(|idx| built[idx].clone().ok_or(BocError::NoRoot))
        .collect()
}

/// Serialize a cell tree as a single-root bag (no index, no checksum).
pub fn serialize(root: &Arc<Cell>) -> Vec<u8> {
    // pre-order numbering keeps every parent ahead of its children
    let mut order: Vec<Arc<Cell>> = Vec::new();
    let mut index_of: HashMap<*const Cell, usize> = HashMap::new();
    let mut stack = vec![root.clone()];
    while let Some(cell) = stack.pop() {
        let key = Arc::as_ptr(&cell);
        if index_of.contains_key(&key) {
            continue;
        }
        index_of.insert(key, order.len());
        for child in cell.refs.iter().rev() {
            stack.push(child.clone());
        }
        order.push(cell);
    }
    // a shared child reached again later must still sit after every parent
    let order = reorder_topologically(order);
    let index_of: HashMap<*const Cell, usize> = order
        .iter()
        .enumerate()
        .map(|(i, c)| (Arc::as_ptr(c), i))
        .collect();

    let size = byte_width(order.len() as u64);
    let mut cells_blob = Vec::new();
    for cell in &order {
        cells_blob.extend_from_slice(&cell.descriptors());
        cells_blob.extend_from_slice(&cell.padded_data());
        for child in &cell.refs {
            let idx = index_of[&Arc::as_ptr(child)];
            push_uint(&mut cells_blob, idx as u64, size);
        }
    }
    let off_bytes = byte_width(cells_blob.len() as u64);

    let mut out = Vec::with_capacity(16 + cells_blob.len());
    out.extend_from_slice(&BOC_MAGIC);
    out.push(size as u8);
    out.push(off_bytes as u8);
    push_uint(&mut out, order.len() as u64, size);
    push_uint(&mut out, 1, size);
    push_uint(&mut out, 0, size);
    push_uint(&mut out, cells_blob.len() as u64, off_bytes);
    push_uint(&mut out, 0, size);
    out.extend_from_slice(&cells_blob);
    out
}

fn reorder_topologically(order: Vec<Arc<Cell>>) -> Vec<Arc<Cell>> {
    let pos: HashMap<*const Cell, usize> = order
        .iter()
        .enumerate()
        .map(|(i, c)| (Arc::as_ptr(c), i))
        .collect();
    let mut in_degree = vec![0usize; order.len()];
    for cell in &order {
        for child in &cell.refs {
            in_degree[pos[&Arc::as_ptr(child)]] += 1;
        }
    }
    let mut ready: Vec<usize> = (0..order.len()).filter(|i| in_degree[*i] == 0).rev().collect();
    let mut sorted = Vec::with_capacity(order.len());
    while let Some(i) = ready.pop() {
        let cell = &order[i];
        for child in cell.refs.iter().rev() {
            let c = pos[&Arc::as_ptr(child)];
            in_degree[c] -= 1;
            if in_degree[c] == 0 {
                ready.push(c);
            }
        }
        sorted.push(cell.clone());
    }
    sorted
}

fn byte_width(value: u64) -> usize {
    let mut width = 1;
    while width < 8 && value >> (8 * width) != 0 {
        width += 1;
    }
    width
}

fn push_uint(out: &mut Vec<u8>, value: u64, width: usize) {
    for i in (0..width).rev() {
        out.push((value >> (8 * i)) as u8);
    }
}
