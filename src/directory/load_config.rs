use crate::{directory::RvaReader, optional::DataDirectory, Error};
use bytemuck::checked::try_pod_read_unaligned;
use bytemuck::{Pod, Zeroable};

/// Load-configuration directory of a PE32 image, through the SafeSEH
/// fields. Later extensions (CFG and beyond) are ignored; the declared
/// `size` field says how much of this struct the linker actually wrote.
#[derive(Copy, Clone, Pod, Zeroable, Default, Debug)]
#[repr(C)]
pub struct LoadConfigDirectory {
    /// Declared size of the structure.
    pub size: u32,
    /// Timestamp.
    pub time_date_stamp: u32,
    /// Format major version.
    pub major_version: u16,
    /// Format minor version.
    pub minor_version: u16,
    /// Global flags to clear at process start.
    pub global_flags_clear: u32,
    /// Global flags to set at process start.
    pub global_flags_set: u32,
    /// Default critical-section timeout.
    pub critical_section_default_timeout: u32,
    /// De-commit free-block threshold.
    pub de_commit_free_block_threshold: u32,
    /// De-commit total-free threshold.
    pub de_commit_total_free_threshold: u32,
    /// VA of the lock-prefix table.
    pub lock_prefix_table: u32,
    /// Maximum allocation size.
    pub maximum_allocation_size: u32,
    /// Virtual-memory threshold.
    pub virtual_memory_threshold: u32,
    /// Process heap flags.
    pub process_heap_flags: u32,
    /// Process affinity mask.
    pub process_affinity_mask: u32,
    /// Service-pack version.
    pub csd_version: u16,
    /// Reserved.
    pub reserved1: u16,
    /// Reserved edit list.
    pub edit_list: u32,
    /// VA of the /GS security cookie.
    pub security_cookie: u32,
    /// VA of the SafeSEH handler table.
    pub se_handler_table: u32,
    /// Entry count of the SafeSEH handler table.
    pub se_handler_count: u32,
}

impl LoadConfigDirectory {
    /// Decode the load-config directory addressed by `dir`. Images that
    /// wrote fewer fields than this struct parse with the tail zeroed.
    pub fn parse(r: &RvaReader, dir: DataDirectory) -> Result<Self, Error> {
        let want = core::mem::size_of::<Self>();
        let declared = r.read_u32(dir.virtual_address)? as usize;
        let have = declared.max(4).min(want);

        let mut bytes = [0u8; core::mem::size_of::<Self>()];
        bytes[..have].copy_from_slice(r.slice(dir.virtual_address, have)?);
        try_pod_read_unaligned::<Self>(&bytes).map_err(|_| Error::OffsetOutOfRange)
    }
}
