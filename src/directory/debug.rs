use crate::{optional::DataDirectory, scribe::Scribe, Error};
use crate::directory::RvaReader;
use bytemuck::checked::try_from_bytes;
use bytemuck::{Pod, Zeroable};
use core::fmt;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// Debug information format tags.
#[derive(FromPrimitive, Debug, PartialEq, Clone, Copy)]
#[repr(u32)]
pub enum DebugType {
    /// Unknown format.
    Unknown = 0,
    /// COFF debug information.
    Coff = 1,
    /// CodeView / PDB reference. The only type decoded further.
    CodeView = 2,
    /// Frame pointer omission records.
    Fpo = 3,
    /// Miscellaneous (DBG file location).
    Misc = 4,
    /// Exception information copy.
    Exception = 5,
    /// Fixup records.
    Fixup = 6,
    /// Borland debug information.
    Borland = 9,
    /// Reproducible-build marker.
    Repro = 16,
}

/// One 28-byte debug-directory entry.
#[derive(Copy, Clone, Pod, Zeroable, Default)]
#[repr(C)]
pub struct DebugDirectoryHeader {
    /// Reserved, must be zero.
    pub characteristics: u32,
    /// Timestamp of the debug data.
    pub time_date_stamp: u32,
    /// Format major version.
    pub major_version: u16,
    /// Format minor version.
    pub minor_version: u16,
    /// Format tag, see [`DebugType`].
    pub debug_type: u32,
    /// Size of the referenced debug data.
    pub size_of_data: u32,
    /// RVA of the data when mapped; zero when only on disk.
    pub address_of_raw_data: u32,
    /// File offset of the data.
    pub pointer_to_raw_data: u32,
}

impl DebugDirectoryHeader {
    /// Format tag as an enum, when known.
    pub fn get_debug_type(&self) -> Option<DebugType> {
        DebugType::from_u32(self.debug_type)
    }
}

/// Decoded CodeView record referenced by a debug entry.
#[derive(Clone, Debug, PartialEq)]
pub enum CodeView {
    /// PDB 7.0 (`RSDS`): GUID, age, and the PDB path.
    Rsds {
        /// PDB signature GUID.
        guid: [u8; 16],
        /// Incremental-link age.
        age: u32,
        /// Path to the PDB as written by the linker.
        path: String,
    },
    /// PDB 2.0 (`NB10`): offset, age, and the PDB path.
    Nb10 {
        /// Offset within the NB10 file, normally zero.
        offset: u32,
        /// Incremental-link age.
        age: u32,
        /// Path to the PDB as written by the linker.
        path: String,
    },
}

/// One debug entry plus its decoded CodeView payload, when it has one.
#[derive(Clone)]
pub struct DebugEntry {
    /// The raw directory entry.
    pub header: DebugDirectoryHeader,
    /// Decoded RSDS/NB10 record for CodeView entries.
    pub codeview: Option<CodeView>,
}

/// Decoded debug directory.
#[derive(Clone, Default)]
pub struct DebugDirectory {
    /// Entries in table order.
    pub entries: Vec<DebugEntry>,
}

impl DebugDirectory {
    /// Decode the debug directory. CodeView payloads are read through
    /// their file offsets, so they decode even when the data lives
    /// outside any section.
    pub fn parse(binary: &[u8], r: &RvaReader, dir: DataDirectory) -> Result<Self, Error> {
        let header_size = core::mem::size_of::<DebugDirectoryHeader>() as u32;
        let count = dir.size / header_size;
        let mut entries = Vec::with_capacity(count as usize);

        for i in 0..count {
            let slice = r.slice(dir.virtual_address + i * header_size, header_size as usize)?;
            let header = *try_from_bytes::<DebugDirectoryHeader>(slice)
                .map_err(|_| Error::OffsetOutOfRange)?;

            let codeview = if header.get_debug_type() == Some(DebugType::CodeView) {
                parse_codeview(binary, header.pointer_to_raw_data as usize)
            } else {
                None
            };
            entries.push(DebugEntry { header, codeview });
        }

        Ok(DebugDirectory { entries })
    }

    /// First decoded CodeView record, the one debuggers use.
    pub fn codeview(&self) -> Option<&CodeView> {
        self.entries.iter().find_map(|e| e.codeview.as_ref())
    }
}

fn parse_codeview(binary: &[u8], offset: usize) -> Option<CodeView> {
    let sig = binary.read_bytes(offset, 4).ok()?;
    match sig {
        b"RSDS" => {
            let guid: [u8; 16] = binary.read_bytes(offset + 4, 16).ok()?.try_into().ok()?;
            let age = binary.read_u32(offset + 20).ok()?;
            let path = binary.read_cstr(offset + 24).ok()?;
            Some(CodeView::Rsds { guid, age, path })
        }
        b"NB10" => {
            let cv_offset = binary.read_u32(offset + 4).ok()?;
            let age = binary.read_u32(offset + 12).ok()?;
            let path = binary.read_cstr(offset + 16).ok()?;
            Some(CodeView::Nb10 {
                offset: cv_offset,
                age,
                path,
            })
        }
        _ => None,
    }
}

impl fmt::Display for DebugDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Debug Directory")?;
        writeln!(f, "---------------")?;
        for entry in &self.entries {
            match entry.header.get_debug_type() {
                Some(t) => writeln!(f, "Type: {:?}", t)?,
                None => writeln!(f, "Type: {:#x}", entry.header.debug_type)?,
            }
            match &entry.codeview {
                Some(CodeView::Rsds { age, path, .. }) => {
                    writeln!(f, "    RSDS age {age} {path}")?
                }
                Some(CodeView::Nb10 { age, path, .. }) => {
                    writeln!(f, "    NB10 age {age} {path}")?
                }
                None => {}
            }
        }

        Ok(())
    }
}
