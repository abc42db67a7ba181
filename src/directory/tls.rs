use crate::{directory::RvaReader, optional::DataDirectory, Error};
use bytemuck::checked::try_from_bytes;
use bytemuck::{Pod, Zeroable};

/// TLS directory of a PE32 image. All address fields are virtual
/// addresses, not RVAs, so they already include the preferred base.
#[derive(Copy, Clone, Pod, Zeroable, Default, Debug)]
#[repr(C)]
pub struct TlsDirectory {
    /// VA of the start of the template data.
    pub start_address_of_raw_data: u32,
    /// VA one past the end of the template data.
    pub end_address_of_raw_data: u32,
    /// VA of the slot that receives the TLS index.
    pub address_of_index: u32,
    /// VA of the zero-terminated callback pointer array.
    pub address_of_callbacks: u32,
    /// Bytes to zero-fill after the template.
    pub size_of_zero_fill: u32,
    /// Alignment characteristics.
    pub characteristics: u32,
}

impl TlsDirectory {
    /// Decode the TLS directory addressed by `dir`.
    pub fn parse(r: &RvaReader, dir: DataDirectory) -> Result<Self, Error> {
        let slice = r.slice(dir.virtual_address, core::mem::size_of::<Self>())?;
        let tls = try_from_bytes::<Self>(slice).map_err(|_| Error::OffsetOutOfRange)?;
        Ok(*tls)
    }
}
