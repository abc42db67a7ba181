use crate::{flag_formats, scribe::Scribe, Error};
use bitflags::bitflags;
use bytemuck::checked::try_from_bytes;
use bytemuck::{Pod, Zeroable};
use core::fmt;
use core::ops::Range;

/// One 40-byte entry of the section table.
#[derive(Copy, Clone, Pod, Zeroable, Default)]
#[repr(C)]
pub struct SectionHeader {
    /// 8-byte, null-padded UTF-8 name. Executable images do not use the
    /// string-table escape for longer names.
    pub name: [u8; 8],
    /// Total size of the section in memory; the tail past
    /// `size_of_raw_data` is zero-filled at load.
    pub virtual_size: u32,
    /// RVA of the first byte of the section when loaded.
    pub virtual_address: u32,
    /// Size of the initialized data on disk.
    pub size_of_raw_data: u32,
    /// File offset of the first page of the section.
    pub pointer_to_raw_data: u32,
    /// File offset of COFF relocations; zero for images.
    pub pointer_to_relocations: u32,
    /// File offset of COFF line numbers; deprecated, zero for images.
    pub pointer_to_linenumbers: u32,
    /// COFF relocation count; zero for images.
    pub number_of_relocations: u16,
    /// COFF line-number count; deprecated, zero for images.
    pub number_of_linenumbers: u16,
    /// Flags describing the section, see [`SectionFlags`].
    pub characteristics: u32,
}

bitflags! {
    /// Section characteristics. Used for diagnostics; the linear memory
    /// model does not enforce protection.
    pub struct SectionFlags: u32 {
        /// The section contains executable code.
        const IMAGE_SCN_CNT_CODE = 0x00000020;
        /// The section contains initialized data.
        const IMAGE_SCN_CNT_INITIALIZED_DATA = 0x00000040;
        /// The section contains uninitialized data.
        const IMAGE_SCN_CNT_UNINITIALIZED_DATA = 0x00000080;
        /// The section can be discarded as needed.
        const IMAGE_SCN_MEM_DISCARDABLE = 0x02000000;
        /// The section cannot be cached.
        const IMAGE_SCN_MEM_NOT_CACHED = 0x04000000;
        /// The section is not pageable.
        const IMAGE_SCN_MEM_NOT_PAGED = 0x08000000;
        /// The section can be shared in memory.
        const IMAGE_SCN_MEM_SHARED = 0x10000000;
        /// The section can be executed as code.
        const IMAGE_SCN_MEM_EXECUTE = 0x20000000;
        /// The section can be read.
        const IMAGE_SCN_MEM_READ = 0x40000000;
        /// The section can be written to.
        const IMAGE_SCN_MEM_WRITE = 0x80000000;
    }
}

flag_formats!(SectionFlags);

impl SectionHeader {
    /// Section name with trailing NUL padding removed.
    pub fn get_name(&self) -> String {
        String::from_utf8_lossy(&self.name)
            .trim_end_matches(char::from(0))
            .to_string()
    }

    /// Returns the Section Characteristics as bitflags, masking out the
    /// alignment nibble and reserved bits.
    pub fn get_characteristics(&self) -> SectionFlags {
        SectionFlags::from_bits_truncate(self.characteristics)
    }
}

/// A section header together with the file-offset range of its initialized
/// bytes, resolved once at parse time.
#[derive(Clone)]
pub struct Section {
    /// The raw header.
    pub header: SectionHeader,
    /// Range of this section's raw data within the file image. Empty for
    /// BSS-only sections.
    pub data: Range<usize>,
}

impl Section {
    /// Size of the section's address span when loaded: the larger of the
    /// virtual size and the raw size, so file-padded sections stay
    /// addressable.
    pub fn virtual_span(&self) -> u32 {
        self.header.virtual_size.max(self.header.size_of_raw_data)
    }

    /// True when `rva` falls inside this section's loaded span.
    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.header.virtual_address
            && rva - self.header.virtual_address < self.virtual_span()
    }
}

/// Parse `number_of_sections` headers starting at `offset` and resolve each
/// one's raw-data range against the file image. Headers that run past the
/// end of a truncated file fail; raw-data ranges are clipped to the file.
pub fn parse_section_table(
    binary: &[u8],
    offset: usize,
    number_of_sections: u16,
) -> Result<Vec<Section>, Error> {
    let header_size = core::mem::size_of::<SectionHeader>();
    let mut sections = Vec::with_capacity(number_of_sections.into());

    for i in 0..usize::from(number_of_sections) {
        let slice = binary.read_bytes(offset + i * header_size, header_size)?;
        let header = *try_from_bytes::<SectionHeader>(slice)
            .map_err(|_| Error::OffsetOutOfRange)?;

        let start = header.pointer_to_raw_data as usize;
        let len = header.size_of_raw_data as usize;
        let data = if len == 0 {
            0..0
        } else {
            let end = start.saturating_add(len).min(binary.len());
            start.min(end)..end
        };
        sections.push(Section { header, data });
    }

    Ok(sections)
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Section Header")?;
        writeln!(f, "--------------")?;
        writeln!(f, "Name:                    {}", self.header.get_name())?;
        writeln!(f, "Virtual Size:            {}", self.header.virtual_size)?;
        writeln!(f, "Virtual Address:         {:#010x}", self.header.virtual_address)?;
        writeln!(f, "Size of Raw Data:        {}", self.header.size_of_raw_data)?;
        writeln!(f, "Pointer to Raw Data:     {}", self.header.pointer_to_raw_data)?;
        writeln!(f, "Characteristics:         {}", self.header.get_characteristics())?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_header(name: &[u8], va: u32, vsize: u32, raw_ptr: u32, raw_size: u32) -> [u8; 40] {
        let mut bytes = [0u8; 40];
        bytes[..name.len()].copy_from_slice(name);
        bytes[8..12].copy_from_slice(&vsize.to_le_bytes());
        bytes[12..16].copy_from_slice(&va.to_le_bytes());
        bytes[16..20].copy_from_slice(&raw_size.to_le_bytes());
        bytes[20..24].copy_from_slice(&raw_ptr.to_le_bytes());
        bytes
    }

    #[test]
    fn raw_data_is_resolved_and_clipped() {
        let mut binary = vec![0u8; 0x80];
        binary[..40].copy_from_slice(&raw_header(b".text", 0x1000, 0x100, 0x60, 0x40));
        let sections = parse_section_table(&binary, 0, 1).unwrap();
        // 0x60 + 0x40 runs past the 0x80-byte file; the range clips.
        assert_eq!(sections[0].data, 0x60..0x80);
        assert_eq!(sections[0].header.get_name(), ".text");
    }

    #[test]
    fn rva_lookup_covers_the_zero_fill_tail() {
        let binary = raw_header(b".bss", 0x2000, 0x500, 0, 0);
        let sections = parse_section_table(&binary, 0, 1).unwrap();
        let s = &sections[0];
        assert!(s.contains_rva(0x2000));
        assert!(s.contains_rva(0x24FF));
        assert!(!s.contains_rva(0x2500));
        assert!(s.data.is_empty());
    }
}
