use crate::{optional::DataDirectory, scribe::Scribe, Error};

/// One bound-import descriptor: the timestamp the binder saw for a DLL.
/// The loader ignores these (timestamps never match across systems) but
/// they parse for diagnostics.
#[derive(Clone, Debug)]
pub struct BoundImport {
    /// Timestamp of the DLL the image was bound against.
    pub time_date_stamp: u32,
    /// Name of the bound DLL.
    pub dll_name: String,
    /// Forwarder DLLs referenced through this binding.
    pub forwarders: Vec<String>,
}

/// Decode the bound-import table. Its name offsets are relative to the
/// table start, and the table itself lives in the header region, so this
/// decoder reads straight file offsets rather than RVAs.
pub fn parse(binary: &[u8], dir: DataDirectory) -> Result<Vec<BoundImport>, Error> {
    let table = dir.virtual_address as usize;
    let mut descriptors = Vec::new();
    let mut offset = table;

    loop {
        let time_date_stamp = binary.read_u32(offset)?;
        let name_offset = binary.read_u16(offset + 4)?;
        let forwarder_count = binary.read_u16(offset + 6)?;
        if time_date_stamp == 0 && name_offset == 0 {
            break;
        }
        offset += 8;

        let dll_name = binary.read_cstr(table + name_offset as usize)?;
        let mut forwarders = Vec::with_capacity(forwarder_count.into());
        for _ in 0..forwarder_count {
            let fwd_name = binary.read_u16(offset + 4)?;
            forwarders.push(binary.read_cstr(table + fwd_name as usize)?);
            offset += 8;
        }

        descriptors.push(BoundImport {
            time_date_stamp,
            dll_name,
            forwarders,
        });
    }

    Ok(descriptors)
}
