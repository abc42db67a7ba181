use crate::{flag_formats, scribe::Scribe, Error};
use bitflags::bitflags;
use bytemuck::checked::try_from_bytes;
use bytemuck::{Pod, Zeroable};
use core::fmt;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// COFF File Header, 20 bytes immediately after the `PE\0\0` signature.
#[derive(Copy, Clone, Pod, Zeroable, Default)]
#[repr(C)]
pub struct CoffFileHeader {
    /// Target machine type. Only [`MachineType::I386`] executes on this core.
    pub machine: u16,
    /// Number of entries in the section table that follows the headers.
    pub number_of_sections: u16,
    /// Low 32 bits of the link time as seconds since the Unix epoch.
    pub time_date_stamp: u32,
    /// File offset of the COFF symbol table; deprecated, zero for images.
    pub pointer_to_symbol_table: u32,
    /// Entry count of the symbol table; deprecated, zero for images.
    pub number_of_symbols: u32,
    /// Size of the optional header that follows; zero for object files.
    pub size_of_optional_header: u16,
    /// Attribute flags, see [`Characteristics`].
    pub characteristics: u16,
}

/// Machine types this emulator can meet in the wild. The loader only
/// executes [`MachineType::I386`]; the rest parse for diagnostics.
#[derive(FromPrimitive, Debug, PartialEq)]
#[repr(u16)]
pub enum MachineType {
    /// Applicable to any machine.
    Unknown = 0x0,
    /// Intel 386 and compatibles. The only type the interpreter runs.
    I386 = 0x14C,
    /// Intel Itanium.
    IA64 = 0x200,
    /// x64.
    AMD64 = 0x8664,
    /// ARM little endian.
    ARM = 0x1C0,
    /// ARM Thumb-2 little endian.
    ARMNT = 0x1C4,
    /// ARM64 little endian.
    ARM64 = 0xAA64,
}

bitflags! {
    /// Attribute flags of the image file.
    pub struct Characteristics: u16 {
        /// No base relocations; the image must load at its preferred base.
        const IMAGE_FILE_RELOCS_STRIPPED = 0x0001;
        /// The image is valid and can be run.
        const IMAGE_FILE_EXECUTABLE_IMAGE = 0x0002;
        /// COFF line numbers removed. Deprecated.
        const IMAGE_FILE_LINE_NUMS_STRIPPED = 0x0004;
        /// COFF local symbols removed. Deprecated.
        const IMAGE_FILE_LOCAL_SYMS_STRIPPED = 0x0008;
        /// Obsolete working-set trimming hint.
        const IMAGE_FILE_AGGRESIVE_WS_TRIM = 0x0010;
        /// Application can handle addresses beyond 2 GiB.
        const IMAGE_FILE_LARGE_ADDRESS_AWARE = 0x0020;
        /// Reserved.
        const IMAGE_FILE_RESERVED1 = 0x0040;
        /// Deprecated little-endian marker.
        const IMAGE_FILE_BYTES_RESERVED_LO = 0x0080;
        /// Machine uses 32-bit words.
        const IMAGE_FILE_32BIT_MACHINE = 0x0100;
        /// Debugging information stripped from the file.
        const IMAGE_FILE_DEBUG_STRIPPED = 0x0200;
        /// Copy to swap when run from removable media.
        const IMAGE_FILE_REMOVABLE_RUN_FROM_SWAP = 0x0400;
        /// Copy to swap when run from network media.
        const IMAGE_FILE_NET_RUN_FROM_SWAP = 0x0800;
        /// System file, not a user program.
        const IMAGE_FILE_SYSTEM = 0x1000;
        /// The file is a DLL.
        const IMAGE_FILE_DLL = 0x2000;
        /// Uniprocessor-only.
        const IMAGE_FILE_UP_SYSTEM_ONLY = 0x4000;
        /// Deprecated big-endian marker.
        const IMAGE_FILE_BYTES_RESERVED_HI = 0x8000;
    }
}

flag_formats!(Characteristics);

impl CoffFileHeader {
    /// Parse the header from `binary` at `offset`, advancing `offset` past it.
    pub fn parse(binary: &[u8], offset: &mut usize) -> Result<Self, Error> {
        let slice = binary.read_bytes(*offset, core::mem::size_of::<Self>())?;
        let header =
            try_from_bytes::<CoffFileHeader>(slice).map_err(|_| Error::MissingCoffHeader)?;
        *offset += core::mem::size_of::<Self>();
        Ok(*header)
    }

    /// Returns the machine type as an enum, if it is a known one.
    pub fn get_machine_type(&self) -> Option<MachineType> {
        MachineType::from_u16(self.machine)
    }

    /// Returns the Characteristics as bitflags.
    pub fn get_characteristics(&self) -> Option<Characteristics> {
        Characteristics::from_bits(self.characteristics)
    }

    /// Returns the link timestamp as a `DateTime<Utc>`.
    #[cfg(feature = "chrono")]
    pub fn get_time_date_stamp(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp(self.time_date_stamp.into(), 0)
    }

    /// True when the DLL characteristic bit is set.
    pub fn is_dll(&self) -> bool {
        self.characteristics & Characteristics::IMAGE_FILE_DLL.bits() != 0
    }
}

impl fmt::Display for CoffFileHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[cfg(feature = "chrono")]
        let time: String = match self.get_time_date_stamp() {
            Some(time) => time.to_string(),
            None => self.time_date_stamp.to_string(),
        };
        #[cfg(not(feature = "chrono"))]
        let time = self.time_date_stamp;

        writeln!(f, "COFF Header")?;
        writeln!(f, "-----------")?;
        match self.get_machine_type() {
            Some(machine) => writeln!(f, "Machine Type:            {:?}", machine)?,
            None => writeln!(f, "Machine Type:            {:#06x}", self.machine)?,
        }
        writeln!(f, "Number of Sections:      {}", self.number_of_sections)?;
        writeln!(f, "Time Date Stamp:         {}", time)?;
        writeln!(f, "Size of Optional Header: {}", self.size_of_optional_header)?;
        match self.get_characteristics() {
            Some(flags) => writeln!(f, "Characteristics:         {}", flags)?,
            None => writeln!(f, "Characteristics:         {:#06x}", self.characteristics)?,
        }

        Ok(())
    }
}
