use crate::{directory::RvaReader, optional::DataDirectory, Error};
use core::fmt;

/// One exported symbol: an RVA, its biased ordinal, and the name attached
/// through the name-pointer table when one references this slot.
#[derive(Clone, Debug)]
pub struct Export {
    /// RVA of the exported code or data.
    pub rva: u32,
    /// `ordinal_base + index_in_function_table`.
    pub ordinal: u32,
    /// Exported name, when the slot is named.
    pub name: Option<String>,
}

/// Decoded export directory.
#[derive(Clone, Debug, Default)]
pub struct ExportDirectory {
    /// Internal DLL name recorded by the linker.
    pub dll_name: String,
    /// First ordinal of the function table.
    pub ordinal_base: u32,
    /// Function-table entries in table order.
    pub entries: Vec<Export>,
}

impl ExportDirectory {
    /// Decode the export directory addressed by `dir`.
    pub fn parse(r: &RvaReader, dir: DataDirectory) -> Result<Self, Error> {
        let base = dir.virtual_address;
        let name_rva = r.read_u32(base + 12)?;
        let ordinal_base = r.read_u32(base + 16)?;
        let number_of_functions = r.read_u32(base + 20)?;
        let number_of_names = r.read_u32(base + 24)?;
        let address_of_functions = r.read_u32(base + 28)?;
        let address_of_names = r.read_u32(base + 32)?;
        let address_of_name_ordinals = r.read_u32(base + 36)?;

        let dll_name = if name_rva != 0 {
            r.read_cstr(name_rva).unwrap_or_default()
        } else {
            String::new()
        };

        let mut entries = Vec::with_capacity(number_of_functions as usize);
        for i in 0..number_of_functions {
            entries.push(Export {
                rva: r.read_u32(address_of_functions + i * 4)?,
                ordinal: ordinal_base + i,
                name: None,
            });
        }

        // The name-pointer and ordinal tables run in parallel: entry i
        // names the function-table slot ordinals[i].
        for i in 0..number_of_names {
            let name_ptr = r.read_u32(address_of_names + i * 4)?;
            let index = r.read_u16(address_of_name_ordinals + i * 2)? as usize;
            if let Some(entry) = entries.get_mut(index) {
                if entry.name.is_none() {
                    entry.name = Some(r.read_cstr(name_ptr)?);
                }
            } else {
                log::warn!("export name table references slot {index} out of range");
            }
        }

        Ok(ExportDirectory {
            dll_name,
            ordinal_base,
            entries,
        })
    }
}

impl fmt::Display for ExportDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Export Directory ({})", self.dll_name)?;
        writeln!(f, "----------------")?;
        for entry in &self.entries {
            match &entry.name {
                Some(name) => {
                    writeln!(f, "{:5}  {:#010x}  {}", entry.ordinal, entry.rva, name)?
                }
                None => writeln!(f, "{:5}  {:#010x}", entry.ordinal, entry.rva)?,
            }
        }

        Ok(())
    }
}
