use crate::Error;

/// Bounds-checked little-endian readers over a raw byte buffer.
///
/// Every accessor fails with [`Error::OffsetOutOfRange`] instead of
/// panicking, so callers can propagate truncated-file conditions with `?`.
pub trait Scribe {
    /// Read one byte.
    fn read_u8(&self, offset: usize) -> Result<u8, Error>;
    /// Read a little-endian u16.
    fn read_u16(&self, offset: usize) -> Result<u16, Error>;
    /// Read a little-endian u32.
    fn read_u32(&self, offset: usize) -> Result<u32, Error>;
    /// Read a little-endian u64.
    fn read_u64(&self, offset: usize) -> Result<u64, Error>;
    /// Borrow `len` bytes starting at `offset`.
    fn read_bytes(&self, offset: usize, len: usize) -> Result<&[u8], Error>;
    /// Read a NUL-terminated string. Bytes above 0x7F are passed through
    /// via lossy conversion; PE name tables are ASCII in practice.
    fn read_cstr(&self, offset: usize) -> Result<String, Error>;
}

impl Scribe for [u8] {
    fn read_u8(&self, offset: usize) -> Result<u8, Error> {
        self.get(offset).copied().ok_or(Error::OffsetOutOfRange)
    }

    fn read_u16(&self, offset: usize) -> Result<u16, Error> {
        let bytes = self.read_bytes(offset, 2)?;
        Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_u32(&self, offset: usize) -> Result<u32, Error> {
        let bytes = self.read_bytes(offset, 4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_u64(&self, offset: usize) -> Result<u64, Error> {
        let bytes = self.read_bytes(offset, 8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_bytes(&self, offset: usize, len: usize) -> Result<&[u8], Error> {
        let end = offset.checked_add(len).ok_or(Error::OffsetOutOfRange)?;
        self.get(offset..end).ok_or(Error::OffsetOutOfRange)
    }

    fn read_cstr(&self, offset: usize) -> Result<String, Error> {
        let tail = self.get(offset..).ok_or(Error::OffsetOutOfRange)?;
        let nul = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::OffsetOutOfRange)?;
        Ok(String::from_utf8_lossy(&tail[..nul]).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_reads() {
        let buf = [0x78, 0x56, 0x34, 0x12, 0xEF, 0xCD, 0xAB, 0x89];
        assert_eq!(buf.read_u8(0).unwrap(), 0x78);
        assert_eq!(buf.read_u16(0).unwrap(), 0x5678);
        assert_eq!(buf.read_u32(0).unwrap(), 0x1234_5678);
        assert_eq!(buf.read_u64(0).unwrap(), 0x89AB_CDEF_1234_5678);
    }

    #[test]
    fn out_of_range_reads_fail() {
        let buf = [0u8; 4];
        assert!(buf.read_u32(1).is_err());
        assert!(buf.read_u8(4).is_err());
        assert!(buf.read_bytes(2, usize::MAX).is_err());
    }

    #[test]
    fn cstr_stops_at_nul() {
        let buf = b"kernel32.dll\0junk";
        assert_eq!(buf.read_cstr(0).unwrap(), "kernel32.dll");
        assert!(b"no terminator".read_cstr(0).is_err());
    }
}
