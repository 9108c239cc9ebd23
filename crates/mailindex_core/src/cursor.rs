//! Bounds-checked access to on-disk byte layouts.
//!
//! Header fields and records are located by computed byte offsets. Every
//! read goes through [`ByteCursor`], which returns
//! [`CoreError::OutOfBounds`] instead of panicking, so a lying size field in
//! a damaged file turns into a corruption report.

use crate::error::{CoreError, CoreResult};

/// A read-only cursor over a byte slice.
#[derive(Debug, Clone, Copy)]
pub struct ByteCursor<'a> {
    buf: &'a [u8],
}

impl<'a> ByteCursor<'a> {
    /// Wraps a byte slice.
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Returns the wrapped buffer length.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if the buffer is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns `len` bytes at `offset`.
    pub fn slice_at(&self, offset: usize, len: usize) -> CoreResult<&'a [u8]> {
        let end = offset.checked_add(len).ok_or(CoreError::OutOfBounds {
            offset,
            len,
            size: self.buf.len(),
        })?;
        self.buf.get(offset..end).ok_or(CoreError::OutOfBounds {
            offset,
            len,
            size: self.buf.len(),
        })
    }

    fn array_at<const N: usize>(&self, offset: usize) -> CoreResult<[u8; N]> {
        let bytes = self.slice_at(offset, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Reads a byte.
    pub fn read_u8_at(&self, offset: usize) -> CoreResult<u8> {
        Ok(self.array_at::<1>(offset)?[0])
    }

    /// Reads a little-endian `u16`.
    pub fn read_u16_at(&self, offset: usize) -> CoreResult<u16> {
        Ok(u16::from_le_bytes(self.array_at(offset)?))
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32_at(&self, offset: usize) -> CoreResult<u32> {
        Ok(u32::from_le_bytes(self.array_at(offset)?))
    }

    /// Reads a little-endian `i32`.
    pub fn read_i32_at(&self, offset: usize) -> CoreResult<i32> {
        Ok(i32::from_le_bytes(self.array_at(offset)?))
    }

    /// Reads a little-endian `u64`.
    pub fn read_u64_at(&self, offset: usize) -> CoreResult<u64> {
        Ok(u64::from_le_bytes(self.array_at(offset)?))
    }

    /// Reads a 16-byte GUID.
    pub fn read_guid_at(&self, offset: usize) -> CoreResult<[u8; 16]> {
        self.array_at(offset)
    }
}

/// Overwrites a little-endian `u16` at `offset`. Panics if out of range;
/// only used on buffers this process sized itself.
pub fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

/// Overwrites a little-endian `u32` at `offset`.
pub fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Overwrites a little-endian `u64` at `offset`.
pub fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Appends zero bytes until `buf.len()` is a multiple of `align`.
pub fn pad_to(buf: &mut Vec<u8>, align: usize) {
    let padded = crate::types::align_up(buf.len(), align);
    buf.resize(padded, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian() {
        let buf = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let cur = ByteCursor::new(&buf);
        assert_eq!(cur.read_u8_at(0).unwrap(), 0x01);
        assert_eq!(cur.read_u16_at(0).unwrap(), 0x0201);
        assert_eq!(cur.read_u32_at(4).unwrap(), 0x0807_0605);
        assert_eq!(cur.read_u64_at(0).unwrap(), 0x0807_0605_0403_0201);
    }

    #[test]
    fn out_of_bounds_is_an_error() {
        let buf = [0u8; 6];
        let cur = ByteCursor::new(&buf);
        assert!(matches!(
            cur.read_u32_at(4),
            Err(CoreError::OutOfBounds {
                offset: 4,
                len: 4,
                size: 6
            })
        ));
        assert!(cur.slice_at(usize::MAX, 2).is_err());
        assert!(cur.slice_at(6, 0).unwrap().is_empty());
    }

    #[test]
    fn put_and_pad() {
        let mut buf = vec![0u8; 8];
        put_u32(&mut buf, 2, 0xdead_beef);
        assert_eq!(ByteCursor::new(&buf).read_u32_at(2).unwrap(), 0xdead_beef);

        let mut v = vec![1u8, 2, 3];
        pad_to(&mut v, 4);
        assert_eq!(v, vec![1, 2, 3, 0]);
        pad_to(&mut v, 4);
        assert_eq!(v.len(), 4);
    }
}
