//! Kernel argument (kernarg) segment marshalling
//!
//! Kernarg segments are little-endian byte blobs where every value sits at its
//! natural alignment. [`KernargBuilder`] packs values on the host side and
//! [`KernargReader`] unpacks them inside a kernel.
//!
//! ```rust
//! use aql_core::{KernargBuilder, KernargReader};
//!
//! let mut args = KernargBuilder::new();
//! args.push(7u16).push(0x1000u64).push(2.5f32);
//! let bytes = args.finish();
//! assert_eq!(bytes.len(), 20);
//!
//! let mut reader = KernargReader::new(&bytes);
//! assert_eq!(reader.read::<u16>().unwrap(), 7);
//! assert_eq!(reader.read::<u64>().unwrap(), 0x1000);
//! assert_eq!(reader.read::<f32>().unwrap(), 2.5);
//! ```

use bytemuck::Pod;
use std::mem::{align_of, size_of};

/// Errors raised while unpacking a kernarg segment
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernargError {
    #[error("kernarg segment too small: need {needed} bytes at offset {offset}, segment is {len} bytes")]
    Truncated { offset: usize, needed: usize, len: usize },
}

fn align_up(offset: usize, alignment: usize) -> usize {
    let misalignment = offset % alignment;
    if misalignment == 0 {
        offset
    } else {
        offset + alignment - misalignment
    }
}

/// Packs values into a kernarg segment
#[derive(Debug, Clone, Default)]
pub struct KernargBuilder {
    bytes: Vec<u8>,
    alignment: usize,
}

impl KernargBuilder {
    pub fn new() -> Self {
        Self {
            bytes: Vec::new(),
            alignment: 1,
        }
    }

    /// Append `value` at its natural alignment.
    pub fn push<T: Pod>(&mut self, value: T) -> &mut Self {
        let start = align_up(self.bytes.len(), align_of::<T>());
        self.bytes.resize(start, 0);
        self.bytes.extend_from_slice(bytemuck::bytes_of(&value));
        self.alignment = self.alignment.max(align_of::<T>());
        self
    }

    /// Append a device address.
    pub fn push_address(&mut self, address: u64) -> &mut Self {
        self.push(address)
    }

    /// Current segment size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Largest alignment of any pushed value.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

/// Unpacks values from a kernarg segment in push order
#[derive(Debug, Clone)]
pub struct KernargReader<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> KernargReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    /// Read the next value at its natural alignment.
    pub fn read<T: Pod>(&mut self) -> Result<T, KernargError> {
        let start = align_up(self.offset, align_of::<T>());
        let end = start + size_of::<T>();
        if end > self.buffer.len() {
            return Err(KernargError::Truncated {
                offset: start,
                needed: size_of::<T>(),
                len: self.buffer.len(),
            });
        }
        self.offset = end;
        Ok(bytemuck::pod_read_unaligned(&self.buffer[start..end]))
    }

    pub fn read_u32(&mut self) -> Result<u32, KernargError> {
        self.read()
    }

    pub fn read_u64(&mut self) -> Result<u64, KernargError> {
        self.read()
    }

    pub fn read_f32(&mut self) -> Result<f32, KernargError> {
        self.read()
    }

    /// Read a device address.
    pub fn read_address(&mut self) -> Result<u64, KernargError> {
        self.read()
    }

    /// Bytes consumed so far (including alignment padding).
    pub fn position(&self) -> usize {
        self.offset
    }
}
