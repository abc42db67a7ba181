use crate::{directory::RvaReader, optional::DataDirectory, Error};
use core::fmt;

/// What an import thunk asks for: a hinted name or a bare ordinal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportTarget {
    /// Import by name. The hint indexes the exporter's name table.
    Name {
        /// Position hint into the exporter's name-pointer table.
        hint: u16,
        /// Exported symbol name.
        name: String,
    },
    /// Import by ordinal (thunk high bit set; low 16 bits hold it).
    Ordinal(u16),
}

/// One import slot: the requested symbol and the IAT cell the loader fills
/// with the resolved guest address.
#[derive(Clone, Debug)]
pub struct ImportEntry {
    /// Requested symbol.
    pub target: ImportTarget,
    /// RVA of this entry's IAT cell in the importing image.
    pub iat_rva: u32,
}

/// All imports requested from one DLL.
#[derive(Clone, Debug)]
pub struct ImportDescriptor {
    /// Name of the DLL as written in the import table.
    pub dll_name: String,
    /// Thunk list, terminated in the file by a zero thunk.
    pub entries: Vec<ImportEntry>,
}

/// Decoded import directory: the descriptor array, minus its all-zero
/// terminator.
#[derive(Clone, Debug, Default)]
pub struct ImportDirectory {
    /// One descriptor per imported DLL.
    pub descriptors: Vec<ImportDescriptor>,
}

impl ImportDirectory {
    /// Decode the import directory addressed by `dir`. `wide_thunks`
    /// selects the 8-byte thunk layout of PE32+ images.
    pub fn parse(r: &RvaReader, dir: DataDirectory, wide_thunks: bool) -> Result<Self, Error> {
        let mut descriptors = Vec::new();
        let mut desc_rva = dir.virtual_address;

        loop {
            let original_first_thunk = r.read_u32(desc_rva)?;
            let name_rva = r.read_u32(desc_rva + 12)?;
            let first_thunk = r.read_u32(desc_rva + 16)?;
            if original_first_thunk == 0 && name_rva == 0 && first_thunk == 0 {
                break;
            }
            desc_rva += 20;

            let dll_name = r.read_cstr(name_rva)?;
            // The lookup table is preferred; bound images overwrite the
            // first-thunk copy in place.
            let lookup = if original_first_thunk != 0 {
                original_first_thunk
            } else {
                first_thunk
            };

            let entries = parse_thunks(r, lookup, first_thunk, wide_thunks)?;
            descriptors.push(ImportDescriptor { dll_name, entries });
        }

        Ok(ImportDirectory { descriptors })
    }
}

/// Walk one zero-terminated thunk list. `iat_rva` tracks the parallel IAT
/// cell for each slot.
pub(crate) fn parse_thunks(
    r: &RvaReader,
    mut lookup_rva: u32,
    mut iat_rva: u32,
    wide_thunks: bool,
) -> Result<Vec<ImportEntry>, Error> {
    let thunk_size = if wide_thunks { 8 } else { 4 };
    let mut entries = Vec::new();

    loop {
        let (thunk, by_ordinal) = if wide_thunks {
            let t = r.read_u64(lookup_rva)?;
            (t, t & (1 << 63) != 0)
        } else {
            let t = r.read_u32(lookup_rva)?;
            (t.into(), t & (1 << 31) != 0)
        };
        if thunk == 0 {
            break;
        }

        let target = if by_ordinal {
            ImportTarget::Ordinal(thunk as u16)
        } else {
            let hint_name_rva = thunk as u32;
            ImportTarget::Name {
                hint: r.read_u16(hint_name_rva)?,
                name: r.read_cstr(hint_name_rva + 2)?,
            }
        };
        entries.push(ImportEntry { target, iat_rva });

        lookup_rva += thunk_size;
        iat_rva += thunk_size;
    }

    Ok(entries)
}

impl fmt::Display for ImportDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Import Directory")?;
        writeln!(f, "----------------")?;
        for descriptor in &self.descriptors {
            writeln!(f, "{}", descriptor.dll_name)?;
            for entry in &descriptor.entries {
                match &entry.target {
                    ImportTarget::Name { name, .. } => {
                        writeln!(f, "    {:#010x}  {}", entry.iat_rva, name)?
                    }
                    ImportTarget::Ordinal(n) => {
                        writeln!(f, "    {:#010x}  Ordinal #{}", entry.iat_rva, n)?
                    }
                }
            }
        }

        Ok(())
    }
}
