use std::ops::Range;

use crate::error::PatchError;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

/// Linear mapping between absolute addresses and byte offsets within one blob.
///
/// The mapping can be rebased between decode and encode passes (blobs get
/// relocated), so it is always queried, never assumed. Out-of-range queries
/// fail with [PatchError::AddressOutOfBounds] rather than wrapping.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AddressSpace {
    base_address: u32,
    base_offset: u32,
    len: u32,
}

impl AddressSpace {
    pub fn new(base_address: u32, len: u32) -> Self {
        Self { base_address, base_offset: 0, len }
    }

    pub fn set_address_range(&mut self, start: u32, len: u32) {
        self.base_address = start;
        self.len = len;
    }

    pub fn set_offset_range(&mut self, start: u32, len: u32) {
        self.base_offset = start;
        self.len = len;
    }

    pub fn len(&self) -> u32 { self.len }

    pub fn is_empty(&self) -> bool { self.len == 0 }

    pub fn base_address(&self) -> u32 { self.base_address }

    pub fn address_range(&self) -> Range<u32> {
        self.base_address..self.base_address + self.len
    }

    /// Whether an address falls within the current blob, as opposed to a
    /// foreign address (engine function, shared library data).
    pub fn is_local(&self, address: u32) -> bool { self.address_range().contains(&address) }

    pub fn to_offset(&self, address: u32) -> Result<u32, PatchError> {
        if self.is_local(address) {
            Ok(address - self.base_address + self.base_offset)
        } else {
            Err(self.oob(address))
        }
    }

    pub fn to_address(&self, offset: u32) -> Result<u32, PatchError> {
        if offset >= self.base_offset && offset - self.base_offset < self.len {
            Ok(offset - self.base_offset + self.base_address)
        } else {
            Err(PatchError::AddressOutOfBounds {
                address: offset,
                start: self.base_offset,
                end: self.base_offset + self.len,
            })
        }
    }

    fn oob(&self, address: u32) -> PatchError {
        PatchError::AddressOutOfBounds {
            address,
            start: self.base_address,
            end: self.base_address + self.len,
        }
    }
}

/// Bounds-checked reader over a borrowed slice with an explicit position.
///
/// Returned by value and never shared mutably across traversal frames; a
/// caller that needs to descend into a child structure creates a fresh cursor
/// at the child's offset.
#[derive(Copy, Clone)]
pub struct Cursor<'a> {
    data: &'a [u8],
    space: AddressSpace,
    pos: usize,
    endian: Endian,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8], space: AddressSpace, endian: Endian) -> Self {
        Self { data, space, pos: 0, endian }
    }

    pub fn at_address(mut self, address: u32) -> Result<Self, PatchError> {
        self.pos = self.space.to_offset(address)? as usize;
        Ok(self)
    }

    pub fn at_offset(mut self, offset: u32) -> Self {
        self.pos = offset as usize;
        self
    }

    pub fn offset(&self) -> u32 { self.pos as u32 }

    /// The absolute address of the current position. Positions one past the
    /// end report the end address, for error messages.
    pub fn address(&self) -> u32 { self.space.base_address() + self.pos as u32 }

    pub fn remaining(&self) -> usize { self.data.len().saturating_sub(self.pos) }

    fn take(&mut self, count: usize) -> Result<&'a [u8], PatchError> {
        if self.remaining() < count {
            return Err(PatchError::AddressOutOfBounds {
                address: self.address(),
                start: self.space.address_range().start,
                end: self.space.address_range().end,
            });
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, PatchError> { Ok(self.take(1)?[0]) }

    pub fn read_u16(&mut self) -> Result<u16, PatchError> {
        let b = self.take(2)?;
        Ok(match self.endian {
            Endian::Big => u16::from_be_bytes([b[0], b[1]]),
            Endian::Little => u16::from_le_bytes([b[0], b[1]]),
        })
    }

    pub fn read_u32(&mut self) -> Result<u32, PatchError> {
        let b = self.take(4)?;
        Ok(match self.endian {
            Endian::Big => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            Endian::Little => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
        })
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], PatchError> { self.take(count) }
}

/// Append-only counterpart of [Cursor] for the encoder: grows a byte buffer,
/// writing scalars at explicit offsets so declaration order and layout order
/// can differ.
pub struct ByteWriter {
    buf: Vec<u8>,
    endian: Endian,
}

impl ByteWriter {
    pub fn new(size: usize, endian: Endian) -> Self { Self { buf: vec![0u8; size], endian } }

    pub fn from_vec(buf: Vec<u8>, endian: Endian) -> Self { Self { buf, endian } }

    pub fn len(&self) -> usize { self.buf.len() }

    pub fn is_empty(&self) -> bool { self.buf.is_empty() }

    pub fn into_inner(self) -> Vec<u8> { self.buf }

    fn ensure(&mut self, end: usize) {
        if self.buf.len() < end {
            self.buf.resize(end, 0);
        }
    }

    pub fn write_u8(&mut self, offset: u32, value: u8) {
        self.ensure(offset as usize + 1);
        self.buf[offset as usize] = value;
    }

    pub fn write_u16(&mut self, offset: u32, value: u16) {
        self.ensure(offset as usize + 2);
        let bytes = match self.endian {
            Endian::Big => value.to_be_bytes(),
            Endian::Little => value.to_le_bytes(),
        };
        self.buf[offset as usize..offset as usize + 2].copy_from_slice(&bytes);
    }

    pub fn write_u32(&mut self, offset: u32, value: u32) {
        self.ensure(offset as usize + 4);
        let bytes = match self.endian {
            Endian::Big => value.to_be_bytes(),
            Endian::Little => value.to_le_bytes(),
        };
        self.buf[offset as usize..offset as usize + 4].copy_from_slice(&bytes);
    }

    pub fn write_bytes(&mut self, offset: u32, bytes: &[u8]) {
        self.ensure(offset as usize + bytes.len());
        self.buf[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
    }
}

pub fn align4(value: u32) -> u32 { (value + 3) & !3 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_offset_round_trip() {
        let space = AddressSpace::new(0x8001_0000, 0x100);
        assert_eq!(space.to_offset(0x8001_0000).unwrap(), 0);
        assert_eq!(space.to_offset(0x8001_00FF).unwrap(), 0xFF);
        assert_eq!(space.to_address(0x40).unwrap(), 0x8001_0040);
        assert!(space.is_local(0x8001_0040));
        assert!(!space.is_local(0x8001_0100));
        assert!(!space.is_local(0x8004_B300));
    }

    #[test]
    fn test_out_of_bounds_is_reported_not_wrapped() {
        let space = AddressSpace::new(0x8001_0000, 0x10);
        match space.to_offset(0x8001_0010) {
            Err(PatchError::AddressOutOfBounds { address, .. }) => {
                assert_eq!(address, 0x8001_0010)
            }
            other => panic!("expected AddressOutOfBounds, got {other:?}"),
        }
    }

    #[test]
    fn test_rebase_between_passes() {
        let mut space = AddressSpace::new(0x8001_0000, 0x100);
        space.set_address_range(0x8020_0000, 0x100);
        assert_eq!(space.to_offset(0x8020_0010).unwrap(), 0x10);
    }

    #[test]
    fn test_cursor_reads() {
        let data = [0x01u8, 0x02, 0x03, 0x04, 0x05];
        let space = AddressSpace::new(0x8000_0000, data.len() as u32);
        let mut cursor = Cursor::new(&data, space, Endian::Little);
        assert_eq!(cursor.read_u8().unwrap(), 0x01);
        assert_eq!(cursor.read_u16().unwrap(), 0x0302);
        assert!(cursor.read_u32().is_err());
    }
}
