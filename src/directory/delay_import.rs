use crate::directory::import::{parse_thunks, ImportEntry};
use crate::{directory::RvaReader, optional::DataDirectory, Error};

/// All delayed imports requested from one DLL, decoded to the same entry
/// shape as the ordinary import table so the loader can bind them eagerly
/// through one resolver.
#[derive(Clone, Debug)]
pub struct DelayImportDescriptor {
    /// Attribute flags; bit 0 set means the RVAs really are RVAs (the
    /// older VA-based layout is not supported).
    pub attributes: u32,
    /// Name of the delayed DLL.
    pub dll_name: String,
    /// RVA of the delay IAT in the importing image.
    pub iat_rva: u32,
    /// Thunk list of the delay import-name table.
    pub entries: Vec<ImportEntry>,
}

/// Decode the delay-import directory addressed by `dir`.
pub fn parse(
    r: &RvaReader,
    dir: DataDirectory,
    wide_thunks: bool,
) -> Result<Vec<DelayImportDescriptor>, Error> {
    let mut descriptors = Vec::new();
    let mut desc_rva = dir.virtual_address;

    loop {
        let attributes = r.read_u32(desc_rva)?;
        let name_rva = r.read_u32(desc_rva + 4)?;
        let iat_rva = r.read_u32(desc_rva + 12)?;
        let int_rva = r.read_u32(desc_rva + 16)?;
        if name_rva == 0 && iat_rva == 0 {
            break;
        }
        desc_rva += 32;

        if attributes & 1 == 0 {
            log::warn!("delay-import descriptor uses VA addressing, skipping");
            continue;
        }

        let dll_name = r.read_cstr(name_rva)?;
        let entries = parse_thunks(r, int_rva, iat_rva, wide_thunks)?;
        descriptors.push(DelayImportDescriptor {
            attributes,
            dll_name,
            iat_rva,
            entries,
        });
    }

    Ok(descriptors)
}
