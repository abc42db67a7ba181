use crate::{flag_formats, scribe::Scribe, Error};
use bitflags::bitflags;
use bytemuck::checked::try_from_bytes;
use bytemuck::{Pod, Zeroable};
use core::fmt;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// Magic values that determine if an Optional Header is
/// PE32 (32-bit) or PE32+ (64-bit).
#[derive(FromPrimitive, Debug)]
#[repr(u16)]
pub enum Magic {
    /// Magic value for 32-bit PEs.
    PE32 = 0x10b,
    /// Magic value for 64-bit PEs.
    PE64 = 0x20b,
}

/// One data-directory slot: the RVA and size of a table the loader uses at
/// run time.
#[derive(Copy, Clone, Pod, Zeroable, Default, Debug)]
#[repr(C)]
pub struct DataDirectory {
    /// RVA of the table relative to the image base.
    pub virtual_address: u32,
    /// Size of the table in bytes.
    pub size: u32,
}

impl DataDirectory {
    /// A directory slot counts as present when its RVA is non-zero.
    pub fn is_present(&self) -> bool {
        self.virtual_address != 0 && self.size != 0
    }
}

/// PE32 Optional Header without the trailing data-directory array, which is
/// counted by `number_of_rva_and_sizes` and parsed separately.
#[derive(Copy, Clone, Pod, Zeroable, Default)]
#[repr(C)]
pub struct OptionalHeader32 {
    /// 0x10B for PE32.
    pub magic: u16,
    /// The linker major version number.
    pub major_linker_version: u8,
    /// The linker minor version number.
    pub minor_linker_version: u8,
    /// Total size of all code sections.
    pub size_of_code: u32,
    /// Total size of all initialized-data sections.
    pub size_of_initialized_data: u32,
    /// Total size of all uninitialized-data (BSS) sections.
    pub size_of_uninitialized_data: u32,
    /// Entry-point RVA; the loader starts the program here.
    pub address_of_entry_point: u32,
    /// RVA of the beginning of the code section.
    pub base_of_code: u32,
    /// (PE32 only) RVA of the beginning of the data section.
    pub base_of_data: u32,
    /// Preferred load address; a multiple of 64 KiB. 0x10000000 for DLLs,
    /// 0x400000 for executables.
    pub image_base: u32,
    /// In-memory section alignment.
    pub section_alignment: u32,
    /// On-disk section alignment.
    pub file_alignment: u32,
    /// The major version number of the required operating system.
    pub major_operating_system_version: u16,
    /// The minor version number of the required operating system.
    pub minor_operating_system_version: u16,
    /// The major version number of the image.
    pub major_image_version: u16,
    /// The minor version number of the image.
    pub minor_image_version: u16,
    /// The major version number of the subsystem.
    pub major_subsystem_version: u16,
    /// The minor version number of the subsystem.
    pub minor_subsystem_version: u16,
    /// Reserved, must be zero.
    pub win32_version_value: u32,
    /// Size of the loaded image including headers; multiple of
    /// `section_alignment`.
    pub size_of_image: u32,
    /// Combined size of the DOS stub, PE headers, and section headers.
    pub size_of_headers: u32,
    /// The image file checksum.
    pub check_sum: u32,
    /// The subsystem required to run this image.
    pub subsystem: u16,
    /// Bitflag characteristics that describe how a DLL should be loaded.
    pub dll_characteristics: u16,
    /// Stack reservation size.
    pub size_of_stack_reserve: u32,
    /// Stack commit size.
    pub size_of_stack_commit: u32,
    /// Heap reservation size.
    pub size_of_heap_reserve: u32,
    /// Heap commit size.
    pub size_of_heap_commit: u32,
    /// Reserved, must be zero.
    pub loader_flags: u32,
    /// Number of data-directory entries that follow this header.
    pub number_of_rva_and_sizes: u32,
}

/// PE32+ Optional Header without the trailing data-directory array.
/// Parsed for completeness; execution rejects PE32+ images.
#[derive(Copy, Clone, Pod, Zeroable, Default)]
#[repr(C)]
pub struct OptionalHeader64 {
    /// 0x20B for PE32+.
    pub magic: u16,
    /// The linker major version number.
    pub major_linker_version: u8,
    /// The linker minor version number.
    pub minor_linker_version: u8,
    /// Total size of all code sections.
    pub size_of_code: u32,
    /// Total size of all initialized-data sections.
    pub size_of_initialized_data: u32,
    /// Total size of all uninitialized-data (BSS) sections.
    pub size_of_uninitialized_data: u32,
    /// Entry-point RVA.
    pub address_of_entry_point: u32,
    /// RVA of the beginning of the code section.
    pub base_of_code: u32,
    /// Preferred load address; 8 bytes from offset 24 in this variant.
    pub image_base: u64,
    /// In-memory section alignment.
    pub section_alignment: u32,
    /// On-disk section alignment.
    pub file_alignment: u32,
    /// The major version number of the required operating system.
    pub major_operating_system_version: u16,
    /// The minor version number of the required operating system.
    pub minor_operating_system_version: u16,
    /// The major version number of the image.
    pub major_image_version: u16,
    /// The minor version number of the image.
    pub minor_image_version: u16,
    /// The major version number of the subsystem.
    pub major_subsystem_version: u16,
    /// The minor version number of the subsystem.
    pub minor_subsystem_version: u16,
    /// Reserved, must be zero.
    pub win32_version_value: u32,
    /// Size of the loaded image including headers.
    pub size_of_image: u32,
    /// Combined size of the DOS stub, PE headers, and section headers.
    pub size_of_headers: u32,
    /// The image file checksum.
    pub check_sum: u32,
    /// The subsystem required to run this image.
    pub subsystem: u16,
    /// Bitflag characteristics that describe how a DLL should be loaded.
    pub dll_characteristics: u16,
    /// Stack reservation size.
    pub size_of_stack_reserve: u64,
    /// Stack commit size.
    pub size_of_stack_commit: u64,
    /// Heap reservation size.
    pub size_of_heap_reserve: u64,
    /// Heap commit size.
    pub size_of_heap_commit: u64,
    /// Reserved, must be zero.
    pub loader_flags: u32,
    /// Number of data-directory entries that follow this header.
    pub number_of_rva_and_sizes: u32,
}

/// The subsystem required to run an image.
#[derive(FromPrimitive, Debug)]
#[repr(u16)]
pub enum Subsystem {
    /// An unknown subsystem.
    Unknown = 0,
    /// Device drivers and native Windows processes.
    Native = 1,
    /// The Windows graphical user interface (GUI) subsystem.
    WindowsGUI = 2,
    /// The Windows character subsystem.
    WindowsCUI = 3,
    /// The OS/2 character subsystem.
    OS2CUI = 5,
    /// The Posix character subsystem.
    PosixCUI = 7,
    /// Native Win9x driver.
    NativeWindows = 8,
    /// Windows CE.
    WindowsCEGUI = 9,
    /// An Extensible Firmware Interface (EFI) application.
    EFIApplication = 10,
    /// An EFI driver with boot services.
    EFIBootServiceDriver = 11,
    /// An EFI driver with run-time services.
    EFIRuntimeDriver = 12,
    /// An EFI ROM image.
    EFIROM = 13,
    /// XBOX.
    XBOX = 14,
    /// Windows boot application.
    WindowsBootApplication = 16,
}

bitflags! {
    /// Bitflags that describe how a DLL should be loaded.
    pub struct DLLCharacteristics: u16 {
        /// Reserved, must be zero.
        const IMAGE_DLLCHARACTERISTICS_RESERVED1 = 0x0001;
        /// Reserved, must be zero.
        const IMAGE_DLLCHARACTERISTICS_RESERVED2 = 0x0002;
        /// Reserved, must be zero.
        const IMAGE_DLLCHARACTERISTICS_RESERVED4 = 0x0004;
        /// Reserved, must be zero.
        const IMAGE_DLLCHARACTERISTICS_RESERVED8 = 0x0008;
        /// Image can handle a high entropy 64-bit virtual address space.
        const IMAGE_DLLCHARACTERISTICS_HIGH_ENTROPY_VA = 0x0020;
        /// DLL can be relocated at load time.
        const IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE = 0x0040;
        /// Code Integrity checks are enforced.
        const IMAGE_DLLCHARACTERISTICS_FORCE_INTEGRITY = 0x0080;
        /// Image is NX compatible.
        const IMAGE_DLLCHARACTERISTICS_NX_COMPAT = 0x0100;
        /// Isolation aware, but do not isolate the image.
        const IMAGE_DLLCHARACTERISTICS_NO_ISOLATION = 0x0200;
        /// Does not use structured exception (SE) handling.
        const IMAGE_DLLCHARACTERISTICS_NO_SEH = 0x0400;
        /// Do not bind the image.
        const IMAGE_DLLCHARACTERISTICS_NO_BIND = 0x0800;
        /// Image must execute in an AppContainer.
        const IMAGE_DLLCHARACTERISTICS_APPCONTAINER = 0x1000;
        /// A WDM driver.
        const IMAGE_DLLCHARACTERISTICS_WDM_DRIVER = 0x2000;
        /// Image supports Control Flow Guard.
        const IMAGE_DLLCHARACTERISTICS_GUARD_CF = 0x4000;
        /// Terminal Server aware.
        const IMAGE_DLLCHARACTERISTICS_TERMINAL_SERVER_AWARE = 0x8000;
    }
}

flag_formats!(DLLCharacteristics);

/// Helper functions shared by the two optional-header variants.
pub trait Optional: Sized {
    /// Returns the subsystem as an enum.
    fn get_subsystem(&self) -> Option<Subsystem>;
    /// Returns the DLL Characteristics as bitflags.
    fn get_dll_characteristics(&self) -> Option<DLLCharacteristics>;
    /// Parse the fixed part of the header at `offset`, advancing it.
    fn parse_optional_header(binary: &[u8], offset: &mut usize) -> Result<Self, Error>;
}

macro_rules! impl_optional {
    ($t:ty) => {
        impl Optional for $t {
            fn get_subsystem(&self) -> Option<Subsystem> {
                Subsystem::from_u16(self.subsystem)
            }

            fn get_dll_characteristics(&self) -> Option<DLLCharacteristics> {
                DLLCharacteristics::from_bits(self.dll_characteristics)
            }

            fn parse_optional_header(binary: &[u8], offset: &mut usize) -> Result<Self, Error> {
                let size = core::mem::size_of::<Self>();
                let slice = binary.read_bytes(*offset, size)?;
                let header = try_from_bytes::<Self>(slice).map_err(|_| Error::BadOptionalHeader)?;
                *offset += size;
                Ok(*header)
            }
        }
    };
}

impl_optional!(OptionalHeader32);
impl_optional!(OptionalHeader64);

/// Parsed optional header of either width, with uniform accessors for the
/// fields the loader and driver consume.
pub enum OptionalHeader {
    /// PE32 variant.
    Pe32(OptionalHeader32),
    /// PE32+ variant.
    Pe32Plus(OptionalHeader64),
}

impl OptionalHeader {
    /// Parse the header and its trailing data-directory array, advancing
    /// `offset` past both. Directory counts above 16 are clamped the way
    /// the system loader clamps them.
    pub fn parse(
        binary: &[u8],
        offset: &mut usize,
    ) -> Result<(Self, Vec<DataDirectory>), Error> {
        let magic = binary.read_u16(*offset)?;
        let header = match Magic::from_u16(magic) {
            Some(Magic::PE32) => {
                OptionalHeader::Pe32(OptionalHeader32::parse_optional_header(binary, offset)?)
            }
            Some(Magic::PE64) => {
                OptionalHeader::Pe32Plus(OptionalHeader64::parse_optional_header(binary, offset)?)
            }
            None => return Err(Error::MissingMagicNumber(magic)),
        };

        let declared = header.number_of_rva_and_sizes();
        if declared > 16 {
            log::debug!("clamping {declared} data directories to 16");
        }
        let count = declared.min(16) as usize;
        let mut directories = Vec::with_capacity(count);
        for _ in 0..count {
            directories.push(DataDirectory {
                virtual_address: binary.read_u32(*offset)?,
                size: binary.read_u32(*offset + 4)?,
            });
            *offset += 8;
        }

        Ok((header, directories))
    }

    /// True for the PE32+ variant.
    pub fn is_pe32_plus(&self) -> bool {
        matches!(self, OptionalHeader::Pe32Plus(_))
    }

    /// Preferred load address, widened to u64 for the PE32+ case.
    pub fn image_base(&self) -> u64 {
        match self {
            OptionalHeader::Pe32(h) => h.image_base.into(),
            OptionalHeader::Pe32Plus(h) => h.image_base,
        }
    }

    /// Entry-point RVA.
    pub fn address_of_entry_point(&self) -> u32 {
        match self {
            OptionalHeader::Pe32(h) => h.address_of_entry_point,
            OptionalHeader::Pe32Plus(h) => h.address_of_entry_point,
        }
    }

    /// Size of the loaded image including headers.
    pub fn size_of_image(&self) -> u32 {
        match self {
            OptionalHeader::Pe32(h) => h.size_of_image,
            OptionalHeader::Pe32Plus(h) => h.size_of_image,
        }
    }

    /// Combined size of the headers on disk.
    pub fn size_of_headers(&self) -> u32 {
        match self {
            OptionalHeader::Pe32(h) => h.size_of_headers,
            OptionalHeader::Pe32Plus(h) => h.size_of_headers,
        }
    }

    /// In-memory section alignment.
    pub fn section_alignment(&self) -> u32 {
        match self {
            OptionalHeader::Pe32(h) => h.section_alignment,
            OptionalHeader::Pe32Plus(h) => h.section_alignment,
        }
    }

    /// On-disk section alignment.
    pub fn file_alignment(&self) -> u32 {
        match self {
            OptionalHeader::Pe32(h) => h.file_alignment,
            OptionalHeader::Pe32Plus(h) => h.file_alignment,
        }
    }

    /// Stack reservation size.
    pub fn size_of_stack_reserve(&self) -> u64 {
        match self {
            OptionalHeader::Pe32(h) => h.size_of_stack_reserve.into(),
            OptionalHeader::Pe32Plus(h) => h.size_of_stack_reserve,
        }
    }

    /// Heap reservation size.
    pub fn size_of_heap_reserve(&self) -> u64 {
        match self {
            OptionalHeader::Pe32(h) => h.size_of_heap_reserve.into(),
            OptionalHeader::Pe32Plus(h) => h.size_of_heap_reserve,
        }
    }

    /// Declared data-directory count, before clamping.
    pub fn number_of_rva_and_sizes(&self) -> u32 {
        match self {
            OptionalHeader::Pe32(h) => h.number_of_rva_and_sizes,
            OptionalHeader::Pe32Plus(h) => h.number_of_rva_and_sizes,
        }
    }

    /// Subsystem as an enum, when known.
    pub fn get_subsystem(&self) -> Option<Subsystem> {
        match self {
            OptionalHeader::Pe32(h) => h.get_subsystem(),
            OptionalHeader::Pe32Plus(h) => h.get_subsystem(),
        }
    }
}

impl fmt::Display for OptionalHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Optional Header")?;
        writeln!(f, "---------------")?;
        let magic = if self.is_pe32_plus() { "PE32+" } else { "PE32" };
        writeln!(f, "Magic:                      {}", magic)?;
        writeln!(f, "Address of Entry Point:     {:#010x}", self.address_of_entry_point())?;
        writeln!(f, "Image Base:                 {:#010x}", self.image_base())?;
        writeln!(f, "Section Alignment:          {}", self.section_alignment())?;
        writeln!(f, "File Alignment:             {}", self.file_alignment())?;
        writeln!(f, "Size of Image:              {}", self.size_of_image())?;
        writeln!(f, "Size of Headers:            {}", self.size_of_headers())?;
        match self.get_subsystem() {
            Some(subsystem) => writeln!(f, "Subsystem:                  {:?}", subsystem)?,
            None => writeln!(f, "Subsystem:                  ?")?,
        }
        writeln!(f, "Size of Stack Reserve:      {}", self.size_of_stack_reserve())?;
        writeln!(f, "Size of Heap Reserve:       {}", self.size_of_heap_reserve())?;
        writeln!(f, "Number of RVA and Sizes:    {}", self.number_of_rva_and_sizes())?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_header_sizes_match_the_format() {
        assert_eq!(core::mem::size_of::<OptionalHeader32>(), 96);
        assert_eq!(core::mem::size_of::<OptionalHeader64>(), 112);
    }

    #[test]
    fn parse_reads_counted_directories() {
        let mut bytes = vec![0u8; 96 + 2 * 8];
        bytes[0] = 0x0b;
        bytes[1] = 0x01; // PE32 magic
        bytes[92] = 2; // number_of_rva_and_sizes
        bytes[96] = 0x10; // first directory rva
        bytes[100] = 0x20; // first directory size
        let mut offset = 0;
        let (header, dirs) = OptionalHeader::parse(&bytes, &mut offset).unwrap();
        assert!(!header.is_pe32_plus());
        assert_eq!(offset, 96 + 16);
        assert_eq!(dirs.len(), 2);
        assert_eq!(dirs[0].virtual_address, 0x10);
        assert_eq!(dirs[0].size, 0x20);
        assert!(dirs[0].is_present());
        assert!(!dirs[1].is_present());
    }
}
