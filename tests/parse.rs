mod common;

use common::{export_section, import_section, PeBuilder};
use pe_emu::coff::MachineType;
use pe_emu::directory::debug::CodeView;
use pe_emu::directory::import::ImportTarget;
use pe_emu::image::Image;
use pe_emu::Error;

#[test]
fn minimal_executable_parses() {
    let bytes = PeBuilder::new(0x40_0000)
        .entry(0x1000)
        .section(".text", 0x1000, vec![0x90, 0x90, 0x90, 0xC3])
        .build();

    let image = Image::parse(bytes).unwrap();
    assert_eq!(image.machine(), Some(MachineType::I386));
    assert!(!image.is_pe32_plus());
    assert!(!image.is_dll());
    assert_eq!(image.image_base(), 0x40_0000);
    assert_eq!(image.entry_point(), 0x1000);
    assert_eq!(image.sections.len(), 1);
    assert_eq!(image.sections[0].header.get_name(), ".text");

    let offset = image.rva_to_offset(0x1000).unwrap();
    assert_eq!(&image.bytes()[offset..offset + 4], &[0x90, 0x90, 0x90, 0xC3]);
    // The zero-fill tail of the section is addressable but has no file
    // backing.
    assert!(image.rva_to_offset(0x1004).is_none());
    assert!(image.section_for_rva(0x1003).is_some());
}

#[test]
fn bad_signatures_are_rejected() {
    assert!(matches!(
        Image::parse(vec![0u8; 16]),
        Err(Error::MissingDosHeader)
    ));

    let mut bytes = PeBuilder::new(0x40_0000)
        .section(".text", 0x1000, vec![0xC3])
        .build();
    bytes[0x80] = b'X'; // corrupt the PE signature
    assert!(matches!(Image::parse(bytes), Err(Error::MissingPeHeader)));

    let truncated = PeBuilder::new(0x40_0000)
        .section(".text", 0x1000, vec![0xC3])
        .build()[..0x90]
        .to_vec();
    assert!(Image::parse(truncated).is_err());
}

#[test]
fn export_directory_names_and_ordinals() {
    let exports = export_section(0x1000, "fixture.dll", &[("Alpha", 0x500), ("Beta", 0x600)]);
    let size = exports.len() as u32;
    let bytes = PeBuilder::new(0x1000_0000)
        .dll()
        .section(".edata", 0x1000, exports)
        .directory(pe_emu::directory::index::EXPORT, 0x1000, size)
        .build();

    let image = Image::parse(bytes).unwrap();
    assert!(image.is_dll());
    let directory = image.export.as_ref().unwrap();
    assert_eq!(directory.dll_name, "fixture.dll");
    assert_eq!(directory.ordinal_base, 1);
    assert_eq!(directory.entries.len(), 2);
    assert_eq!(directory.entries[0].name.as_deref(), Some("Alpha"));
    assert_eq!(directory.entries[0].rva, 0x500);
    assert_eq!(directory.entries[0].ordinal, 1);
    assert_eq!(directory.entries[1].name.as_deref(), Some("Beta"));
    assert_eq!(directory.entries[1].ordinal, 2);
}

#[test]
fn import_directory_descriptors_and_thunks() {
    let (imports, cells) = import_section(
        0x2000,
        &[("KERNEL32.DLL", &["ExitProcess", "Sleep"]), ("user32.dll", &["MessageBoxA"])],
    );
    let size = imports.len() as u32;
    let bytes = PeBuilder::new(0x40_0000)
        .entry(0x1000)
        .section(".text", 0x1000, vec![0xC3])
        .section(".idata", 0x2000, imports)
        .directory(pe_emu::directory::index::IMPORT, 0x2000, size)
        .build();

    let image = Image::parse(bytes).unwrap();
    let directory = image.import.as_ref().unwrap();
    assert_eq!(directory.descriptors.len(), 2);
    assert_eq!(directory.descriptors[0].dll_name, "KERNEL32.DLL");
    assert_eq!(directory.descriptors[1].dll_name, "user32.dll");

    let entries = &directory.descriptors[0].entries;
    assert_eq!(entries.len(), 2);
    match &entries[0].target {
        ImportTarget::Name { name, .. } => assert_eq!(name, "ExitProcess"),
        other => panic!("expected name import, got {other:?}"),
    }
    // The recorded IAT RVAs line up with the builder's layout.
    assert_eq!(entries[0].iat_rva, cells[0].2);
    assert_eq!(entries[1].iat_rva, cells[1].2);
    assert_eq!(directory.descriptors[1].entries[0].iat_rva, cells[2].2);
}

#[test]
fn codeview_rsds_record_is_decoded() {
    // One debug-directory entry whose payload sits right after it in the
    // same section. The section lands at file offset 0x200 (one section,
    // headers padded to the file alignment).
    let mut section = vec![0u8; 28];
    section[12..16].copy_from_slice(&2u32.to_le_bytes()); // type = CodeView
    let payload_file_offset = 0x200u32 + 28;
    section[24..28].copy_from_slice(&payload_file_offset.to_le_bytes());

    section.extend_from_slice(b"RSDS");
    section.extend_from_slice(&[0xAA; 16]); // guid
    section.extend_from_slice(&7u32.to_le_bytes()); // age
    section.extend_from_slice(b"C:\\build\\fixture.pdb\0");

    let bytes = PeBuilder::new(0x40_0000)
        .section(".rdata", 0x1000, section)
        .directory(pe_emu::directory::index::DEBUG, 0x1000, 28)
        .build();

    let image = Image::parse(bytes).unwrap();
    let debug = image.debug.as_ref().unwrap();
    match debug.codeview() {
        Some(CodeView::Rsds { guid, age, path }) => {
            assert_eq!(guid, &[0xAA; 16]);
            assert_eq!(*age, 7);
            assert_eq!(path, "C:\\build\\fixture.pdb");
        }
        other => panic!("expected RSDS, got {other:?}"),
    }
}

#[test]
fn malformed_directory_degrades_to_none() {
    // An export directory RVA pointing at unmapped space parses the rest
    // of the image and simply leaves the directory empty.
    let bytes = PeBuilder::new(0x40_0000)
        .section(".text", 0x1000, vec![0xC3])
        .directory(pe_emu::directory::index::EXPORT, 0x8000, 0x40)
        .build();

    let image = Image::parse(bytes).unwrap();
    assert!(image.export.is_none());
    assert_eq!(image.sections.len(), 1);
}
