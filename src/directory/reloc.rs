use crate::{directory::RvaReader, optional::DataDirectory, Error};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// Base-relocation type, the high nibble of each block entry.
#[derive(FromPrimitive, Debug, PartialEq, Clone, Copy)]
#[repr(u16)]
pub enum BaseRelocationType {
    /// Padding entry, skipped.
    Absolute = 0,
    /// High 16 bits of a 32-bit field.
    High = 1,
    /// Low 16 bits of a 32-bit field.
    Low = 2,
    /// Full 32-bit absolute field; the only type the loader applies.
    HighLow = 3,
    /// High 16 bits with sign adjustment from the paired entry.
    HighAdj = 4,
    /// MIPS jump instruction.
    MipsJmpAddr = 5,
    /// ARM/Thumb MOV32 pair.
    ThumbMov32 = 7,
    /// RISC-V high 20 bits.
    RiscVHigh20 = 8,
    /// 64-bit absolute field.
    Dir64 = 10,
}

/// One relocation site inside a block's 4 KiB page.
#[derive(Clone, Copy, Debug)]
pub struct RelocationEntry {
    /// Raw type nibble. ABS padding never reaches this struct.
    pub kind: u16,
    /// Offset of the field within the block's page.
    pub offset: u16,
}

impl RelocationEntry {
    /// The type as an enum, when it is a defined one.
    pub fn get_kind(&self) -> Option<BaseRelocationType> {
        BaseRelocationType::from_u16(self.kind)
    }
}

/// One base-relocation block: a page RVA and the entries within that page.
#[derive(Clone, Debug)]
pub struct RelocationBlock {
    /// RVA of the 4 KiB page the entries offset into.
    pub page_rva: u32,
    /// Entries with ABS padding already discarded.
    pub entries: Vec<RelocationEntry>,
}

/// Decode the base-relocation directory addressed by `dir` into blocks.
pub fn parse(r: &RvaReader, dir: DataDirectory) -> Result<Vec<RelocationBlock>, Error> {
    let mut blocks = Vec::new();
    let mut rva = dir.virtual_address;
    let end = dir.virtual_address + dir.size;

    while rva + 8 <= end {
        let page_rva = r.read_u32(rva)?;
        let block_size = r.read_u32(rva + 4)?;
        if block_size < 8 {
            log::warn!("relocation block at rva {rva:#010x} has bad size {block_size}");
            break;
        }

        let count = (block_size - 8) / 2;
        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count {
            let raw = r.read_u16(rva + 8 + i * 2)?;
            let kind = raw >> 12;
            if kind == BaseRelocationType::Absolute as u16 {
                continue;
            }
            entries.push(RelocationEntry {
                kind,
                offset: raw & 0x0FFF,
            });
        }

        blocks.push(RelocationBlock { page_rva, entries });
        rva += block_size;
    }

    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::{Section, SectionHeader};

    #[test]
    fn abs_padding_is_discarded() {
        // One block: page 0x1000, size 12, entries HIGHLOW@0x234 and ABS pad.
        let mut bytes = vec![0u8; 12];
        bytes[0..4].copy_from_slice(&0x1000u32.to_le_bytes());
        bytes[4..8].copy_from_slice(&12u32.to_le_bytes());
        bytes[8..10].copy_from_slice(&0x3234u16.to_le_bytes());
        bytes[10..12].copy_from_slice(&0u16.to_le_bytes());

        let header = SectionHeader {
            virtual_address: 0x4000,
            virtual_size: 12,
            size_of_raw_data: 12,
            ..Default::default()
        };
        let sections = [Section {
            header,
            data: 0..12,
        }];
        let r = RvaReader::new(&bytes, &sections);
        let dir = DataDirectory {
            virtual_address: 0x4000,
            size: 12,
        };

        let blocks = parse(&r, dir).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].page_rva, 0x1000);
        assert_eq!(blocks[0].entries.len(), 1);
        assert_eq!(blocks[0].entries[0].offset, 0x234);
        assert_eq!(
            blocks[0].entries[0].get_kind(),
            Some(BaseRelocationType::HighLow)
        );
    }
}
