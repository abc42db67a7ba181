use crate::coff::{CoffFileHeader, MachineType};
use crate::directory::bound_import::{self, BoundImport};
use crate::directory::debug::DebugDirectory;
use crate::directory::delay_import::{self, DelayImportDescriptor};
use crate::directory::exception::{self, RuntimeFunction};
use crate::directory::export::ExportDirectory;
use crate::directory::import::ImportDirectory;
use crate::directory::load_config::LoadConfigDirectory;
use crate::directory::reloc::{self, RelocationBlock};
use crate::directory::tls::TlsDirectory;
use crate::directory::{index, RvaReader};
use crate::optional::{DataDirectory, OptionalHeader};
use crate::section::{parse_section_table, Section};
use crate::{scribe::Scribe, Error};
use core::fmt;
use std::path::Path;

const IMAGE_DOS_SIGNATURE: u16 = 0x5A4D;
const IMAGE_DOS_PE_SIGNATURE_OFFSET: usize = 0x3C;

/// A fully parsed Portable Executable: headers, section table, and every
/// data directory the loader consumes. Immutable once parsed.
pub struct Image {
    bytes: Vec<u8>,
    /// COFF File Header.
    pub coff: CoffFileHeader,
    /// Optional header of either width.
    pub optional: OptionalHeader,
    /// Data-directory array, as many slots as the header declared.
    pub data_directories: Vec<DataDirectory>,
    /// Section table with resolved raw-data ranges.
    pub sections: Vec<Section>,
    /// Export directory, for DLLs that have one.
    pub export: Option<ExportDirectory>,
    /// Import directory.
    pub import: Option<ImportDirectory>,
    /// Base-relocation blocks; empty when the directory is absent.
    pub relocations: Vec<RelocationBlock>,
    /// Exception (`.pdata`) entries; empty for i386 images.
    pub exception: Vec<RuntimeFunction>,
    /// Debug directory with decoded CodeView records.
    pub debug: Option<DebugDirectory>,
    /// TLS directory.
    pub tls: Option<TlsDirectory>,
    /// Load-configuration directory.
    pub load_config: Option<LoadConfigDirectory>,
    /// Bound-import descriptors; parsed, never applied.
    pub bound_imports: Vec<BoundImport>,
    /// Delay-import descriptors, bound eagerly by the loader.
    pub delay_imports: Vec<DelayImportDescriptor>,
}

impl Image {
    /// Parse an in-memory PE file.
    pub fn parse(bytes: Vec<u8>) -> Result<Self, Error> {
        if bytes.read_u16(0)? != IMAGE_DOS_SIGNATURE {
            return Err(Error::MissingDosHeader);
        }

        let e_lfanew = bytes.read_u32(IMAGE_DOS_PE_SIGNATURE_OFFSET)? as usize;
        if bytes.read_bytes(e_lfanew, 4)? != b"PE\0\0" {
            return Err(Error::MissingPeHeader);
        }

        let mut offset = e_lfanew + 4;
        let coff = CoffFileHeader::parse(&bytes, &mut offset)?;
        if coff.size_of_optional_header == 0 {
            // Object files have no optional header and cannot be loaded.
            return Err(Error::BadOptionalHeader);
        }

        let optional_start = offset;
        let (optional, data_directories) = OptionalHeader::parse(&bytes, &mut offset)?;

        // The section table starts after the declared optional-header size,
        // which may exceed the fixed fields plus directories.
        let table_offset = optional_start + usize::from(coff.size_of_optional_header);
        let sections = parse_section_table(&bytes, table_offset, coff.number_of_sections)?;

        let wide = optional.is_pe32_plus();
        let r = RvaReader::new(&bytes, &sections);
        let dir = |slot: usize| -> Option<DataDirectory> {
            data_directories.get(slot).copied().filter(|d| d.is_present())
        };

        let export = dir(index::EXPORT)
            .and_then(|d| log_skip("export", ExportDirectory::parse(&r, d)));
        let import = dir(index::IMPORT)
            .and_then(|d| log_skip("import", ImportDirectory::parse(&r, d, wide)));
        let relocations = dir(index::BASE_RELOCATION)
            .and_then(|d| log_skip("base-relocation", reloc::parse(&r, d)))
            .unwrap_or_default();
        let exception = dir(index::EXCEPTION)
            .and_then(|d| log_skip("exception", exception::parse(&r, d)))
            .unwrap_or_default();
        let debug = dir(index::DEBUG)
            .and_then(|d| log_skip("debug", DebugDirectory::parse(&bytes, &r, d)));
        let tls = dir(index::TLS).and_then(|d| log_skip("tls", TlsDirectory::parse(&r, d)));
        let load_config = dir(index::LOAD_CONFIG)
            .and_then(|d| log_skip("load-config", LoadConfigDirectory::parse(&r, d)));
        let bound_imports = dir(index::BOUND_IMPORT)
            .and_then(|d| log_skip("bound-import", bound_import::parse(&bytes, d)))
            .unwrap_or_default();
        let delay_imports = dir(index::DELAY_IMPORT)
            .and_then(|d| log_skip("delay-import", delay_import::parse(&r, d, wide)))
            .unwrap_or_default();

        Ok(Image {
            bytes,
            coff,
            optional,
            data_directories,
            sections,
            export,
            import,
            relocations,
            exception,
            debug,
            tls,
            load_config,
            bound_imports,
            delay_imports,
        })
    }

    /// Read and parse a PE file from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Image::parse(std::fs::read(path)?)
    }

    /// The raw file bytes the image was parsed from.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The section whose loaded span covers `rva`.
    pub fn section_for_rva(&self, rva: u32) -> Option<&Section> {
        self.sections.iter().find(|s| s.contains_rva(rva))
    }

    /// File offset backing `rva`, when initialized data covers it.
    pub fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        RvaReader::new(&self.bytes, &self.sections).offset_of(rva)
    }

    /// Preferred load address.
    pub fn image_base(&self) -> u64 {
        self.optional.image_base()
    }

    /// Entry-point RVA.
    pub fn entry_point(&self) -> u32 {
        self.optional.address_of_entry_point()
    }

    /// Size of the loaded image in bytes.
    pub fn size_of_image(&self) -> u32 {
        self.optional.size_of_image()
    }

    /// True for PE32+ images.
    pub fn is_pe32_plus(&self) -> bool {
        self.optional.is_pe32_plus()
    }

    /// True when the file is a DLL.
    pub fn is_dll(&self) -> bool {
        self.coff.is_dll()
    }

    /// Machine type, when it is a known one.
    pub fn machine(&self) -> Option<MachineType> {
        self.coff.get_machine_type()
    }

    /// The data directory in `slot`, when present.
    pub fn directory(&self, slot: usize) -> Option<DataDirectory> {
        self.data_directories
            .get(slot)
            .copied()
            .filter(|d| d.is_present())
    }
}

fn log_skip<T>(what: &str, result: Result<T, Error>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            log::warn!("skipping malformed {what} directory: {err}");
            None
        }
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.coff)?;
        writeln!(f, "{}", self.optional)?;

        for section in self.sections.iter() {
            writeln!(f, "{}", section)?;
        }

        if let Some(export) = &self.export {
            writeln!(f, "{}", export)?;
        }

        if let Some(import) = &self.import {
            writeln!(f, "{}", import)?;
        }

        if let Some(debug) = &self.debug {
            writeln!(f, "{}", debug)?;
        }

        Ok(())
    }
}
