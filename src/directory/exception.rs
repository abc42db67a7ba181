use crate::{directory::RvaReader, optional::DataDirectory, Error};
use bytemuck::checked::try_from_bytes;
use bytemuck::{Pod, Zeroable};

/// One `.pdata` entry. i386 images rarely carry this table; it parses for
/// diagnostics on the architectures that do.
#[derive(Copy, Clone, Pod, Zeroable, Default, Debug)]
#[repr(C)]
pub struct RuntimeFunction {
    /// RVA of the function start.
    pub begin_address: u32,
    /// RVA one past the function end.
    pub end_address: u32,
    /// RVA of the unwind information.
    pub unwind_info: u32,
}

/// Decode the exception directory addressed by `dir`.
pub fn parse(r: &RvaReader, dir: DataDirectory) -> Result<Vec<RuntimeFunction>, Error> {
    let entry_size = core::mem::size_of::<RuntimeFunction>() as u32;
    let count = dir.size / entry_size;
    let mut functions = Vec::with_capacity(count as usize);

    for i in 0..count {
        let slice = r.slice(dir.virtual_address + i * entry_size, entry_size as usize)?;
        let entry =
            try_from_bytes::<RuntimeFunction>(slice).map_err(|_| Error::OffsetOutOfRange)?;
        functions.push(*entry);
    }

    Ok(functions)
}
