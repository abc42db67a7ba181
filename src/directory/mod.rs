//! Decoders for the data directories the loader consumes.
//!
//! Each decoder takes an [`RvaReader`] so tables that reference strings in
//! a sibling section (import names in `.rdata`, for example) resolve
//! without guessing which section owns them.

/// Bound-import descriptors
pub mod bound_import;
/// Debug directory and CodeView records
pub mod debug;
/// Delay-import descriptors
pub mod delay_import;
/// Exception (`.pdata`) table
pub mod exception;
/// Export directory
pub mod export;
/// Import descriptors and thunks
pub mod import;
/// Load-configuration directory
pub mod load_config;
/// Base-relocation blocks
pub mod reloc;
/// TLS directory
pub mod tls;

use crate::{scribe::Scribe, section::Section, Error};

/// Data-directory slot indices as laid out in the optional header.
pub mod index {
    /// Export table.
    pub const EXPORT: usize = 0;
    /// Import table.
    pub const IMPORT: usize = 1;
    /// Resource table.
    pub const RESOURCE: usize = 2;
    /// Exception table.
    pub const EXCEPTION: usize = 3;
    /// Attribute certificate table.
    pub const CERTIFICATE: usize = 4;
    /// Base relocation table.
    pub const BASE_RELOCATION: usize = 5;
    /// Debug data.
    pub const DEBUG: usize = 6;
    /// Reserved architecture slot.
    pub const ARCHITECTURE: usize = 7;
    /// Global pointer register value.
    pub const GLOBAL_PTR: usize = 8;
    /// Thread local storage table.
    pub const TLS: usize = 9;
    /// Load configuration table.
    pub const LOAD_CONFIG: usize = 10;
    /// Bound import table.
    pub const BOUND_IMPORT: usize = 11;
    /// Import address table.
    pub const IAT: usize = 12;
    /// Delay import descriptors.
    pub const DELAY_IMPORT: usize = 13;
}

/// Reads file bytes addressed by RVA, resolving each access through the
/// section table. Accesses into a section's zero-fill tail or outside any
/// section fail with [`Error::OffsetOutOfRange`].
pub struct RvaReader<'a> {
    bytes: &'a [u8],
    sections: &'a [Section],
}

impl<'a> RvaReader<'a> {
    /// Wrap a file image and its resolved section table.
    pub fn new(bytes: &'a [u8], sections: &'a [Section]) -> Self {
        RvaReader { bytes, sections }
    }

    /// File offset backing `rva`, when some section's raw data covers it.
    pub fn offset_of(&self, rva: u32) -> Option<usize> {
        for section in self.sections {
            let header = &section.header;
            if rva >= header.virtual_address {
                let delta = (rva - header.virtual_address) as usize;
                if delta < section.data.len() {
                    return Some(section.data.start + delta);
                }
            }
        }
        None
    }

    fn offset(&self, rva: u32) -> Result<usize, Error> {
        self.offset_of(rva).ok_or(Error::OffsetOutOfRange)
    }

    /// Read one byte at `rva`.
    pub fn read_u8(&self, rva: u32) -> Result<u8, Error> {
        self.bytes.read_u8(self.offset(rva)?)
    }

    /// Read a little-endian u16 at `rva`.
    pub fn read_u16(&self, rva: u32) -> Result<u16, Error> {
        self.bytes.read_u16(self.offset(rva)?)
    }

    /// Read a little-endian u32 at `rva`.
    pub fn read_u32(&self, rva: u32) -> Result<u32, Error> {
        self.bytes.read_u32(self.offset(rva)?)
    }

    /// Read a little-endian u64 at `rva`.
    pub fn read_u64(&self, rva: u32) -> Result<u64, Error> {
        self.bytes.read_u64(self.offset(rva)?)
    }

    /// Read a NUL-terminated string at `rva`.
    pub fn read_cstr(&self, rva: u32) -> Result<String, Error> {
        self.bytes.read_cstr(self.offset(rva)?)
    }

    /// Borrow `len` bytes starting at `rva`. The range must stay within
    /// one section's raw data.
    pub fn slice(&self, rva: u32, len: usize) -> Result<&'a [u8], Error> {
        self.bytes.read_bytes(self.offset(rva)?, len)
    }
}
