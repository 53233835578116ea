use crate::unsigned_ceil_div;
use anyhow::{bail, Result};

/// One bit per piece, most significant bit of the first byte is piece 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    data: Vec<u8>,
    len: usize,
}

impl Bitfield {
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![0; unsigned_ceil_div!(len, 8)],
            len,
        }
    }

    pub fn full(len: usize) -> Self {
        let mut rv = Self::new(len);
        for idx in 0..len {
            rv.change(idx, true);
        }
        rv
    }

    /// Spare bits past `len` are cleared, a byte count mismatch is an error.
    pub fn from_bytes(raw: &[u8], len: usize) -> Result<Self> {
        let expected = unsigned_ceil_div!(len, 8);

        if raw.len() != expected {
            bail!(
                "bitfield for {} pieces must be {} bytes, got {}",
                len,
                expected,
                raw.len()
            );
        }

        let mut data = raw.to_vec();

        let spare_bits = expected * 8 - len;
        if let Some(last) = data.last_mut() {
            *last &= 0xFFu8.checked_shl(spare_bits as u32).unwrap_or(0);
        }

        Ok(Self { data, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, i: usize) -> bool {
        if i >= self.len {
            return false;
        }

        let byte_idx = i / 8;
        let bit_offset = i % 8;

        let bits = 0b1000_0000u8 >> bit_offset;

        bits & self.data[byte_idx] > 0
    }

    /// Returns the previous value. Out of range indexes are ignored.
    pub fn change(&mut self, idx: usize, val: bool) -> bool {
        if idx >= self.len {
            return false;
        }

        let old = self.get(idx);

        let byte_idx = idx / 8;
        let bit_offset = idx % 8;

        let bits = 0b1000_0000u8 >> bit_offset;

        if val {
            self.data[byte_idx] |= bits;
        } else {
            self.data[byte_idx] &= !bits;
        }

        old
    }

    pub fn weight(&self) -> usize {
        self.data
            .iter()
            .fold(0, |weight, x| weight + x.count_ones() as usize)
    }

    pub fn is_complete(&self) -> bool {
        self.weight() == self.len
    }

    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|idx| self.get(*idx))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}
