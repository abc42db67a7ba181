mod common;

use common::{export_section, import_section, reloc_section, PeBuilder};
use pe_emu::directory::index;
use pe_emu::image::Image;
use pe_emu::loader::{Loader, DLL_REGION_START, IMAGE_SLOT_SIZE};
use pe_emu::memory::Memory;
use std::collections::HashMap;
use std::path::PathBuf;

const MEMORY_SIZE: usize = 0x2200_0000;

fn write_fixture(dir: &PathBuf, name: &str, bytes: Vec<u8>) {
    std::fs::write(dir.join(name), bytes).expect("write fixture dll");
}

fn kernel32_fixture() -> Vec<u8> {
    let exports = export_section(
        0x1000,
        "KERNEL32.dll",
        &[("Sleep", 0x500), ("ExitProcess", 0x540)],
    );
    let size = exports.len() as u32;
    PeBuilder::new(DLL_REGION_START)
        .dll()
        .section(".edata", 0x1000, exports)
        .directory(index::EXPORT, 0x1000, size)
        .build()
}

#[test]
fn main_image_lands_at_its_own_base() {
    let dir = common::scratch_dir("main-base");
    let mut memory = Memory::new(MEMORY_SIZE);
    let mut loader = Loader::new(vec![dir]);

    let main = Image::parse(
        PeBuilder::new(0x40_0000)
            .entry(0x1000)
            .section(".text", 0x1000, vec![0x90, 0x90, 0x90, 0xC3])
            .build(),
    )
    .unwrap();

    let entry = loader.bind_main(&mut memory, main).unwrap();
    assert_eq!(entry, 0x40_1000);
    assert_eq!(memory.read32(0x40_1000).unwrap(), 0xC390_9090);

    let interval = loader.find_image_for(0x40_1000).unwrap();
    assert_eq!(interval.base, 0x40_0000);
    assert!(loader.find_image_for(0x39_FFFF).is_none());
}

#[test]
fn non_i386_main_is_rejected() {
    let mut memory = Memory::new(MEMORY_SIZE);
    let mut loader = Loader::new(Vec::new());

    let main = Image::parse(
        PeBuilder::new(0x40_0000)
            .machine(0x8664)
            .section(".text", 0x1000, vec![0xC3])
            .build(),
    )
    .unwrap();
    assert!(matches!(
        loader.bind_main(&mut memory, main),
        Err(pe_emu::Error::UnsupportedMachine(0x8664))
    ));
}

#[test]
fn displaced_dll_gets_highlow_fixups() {
    let dir = common::scratch_dir("reloc");

    // Both prefer the bottom of the region; the second is displaced one
    // slot up and its absolute word rewritten by the delta.
    write_fixture(
        &dir,
        "occupier.dll",
        PeBuilder::new(DLL_REGION_START)
            .dll()
            .section(".text", 0x1000, vec![0xC3])
            .build(),
    );

    let mut text = 0x1000_1234u32.to_le_bytes().to_vec();
    text.resize(0x10, 0);
    let relocs = reloc_section(&[(0x1000, &[0x3000])]); // HIGHLOW at offset 0
    let reloc_size = relocs.len() as u32;
    write_fixture(
        &dir,
        "shifted.dll",
        PeBuilder::new(DLL_REGION_START)
            .dll()
            .section(".text", 0x1000, text)
            .section(".reloc", 0x2000, relocs)
            .directory(index::BASE_RELOCATION, 0x2000, reloc_size)
            .build(),
    );

    let mut memory = Memory::new(MEMORY_SIZE);
    let mut loader = Loader::new(vec![dir]);
    loader.load(&mut memory, "occupier.dll").unwrap();
    loader.load(&mut memory, "shifted.dll").unwrap();

    let occupier = loader.loaded("occupier.dll").unwrap();
    let shifted = loader.loaded("shifted.dll").unwrap();
    assert_eq!(occupier.base, DLL_REGION_START);
    assert_eq!(shifted.base, DLL_REGION_START + IMAGE_SLOT_SIZE);

    let delta = shifted.base - DLL_REGION_START;
    assert_eq!(
        memory.read32(shifted.base + 0x1000).unwrap(),
        0x1000_1234 + delta
    );
}

#[test]
fn loaded_image_intervals_are_disjoint() {
    let dir = common::scratch_dir("disjoint");
    for name in ["a.dll", "b.dll", "c.dll"] {
        write_fixture(
            &dir,
            name,
            PeBuilder::new(DLL_REGION_START)
                .dll()
                .section(".text", 0x1000, vec![0xC3])
                .build(),
        );
    }

    let mut memory = Memory::new(MEMORY_SIZE);
    let mut loader = Loader::new(vec![dir]);
    for name in ["a.dll", "b.dll", "c.dll"] {
        loader.load(&mut memory, name).unwrap();
    }

    let images = loader.images();
    for a in images {
        for b in images {
            if a.name != b.name {
                let overlap = a.base < b.base + b.size && b.base < a.base + a.size;
                assert!(!overlap, "{} and {} overlap", a.name, b.name);
            }
        }
    }
}

#[test]
fn api_set_import_resolves_through_the_forwarder_hosts() {
    let dir = common::scratch_dir("forwarder");
    write_fixture(&dir, "kernel32.dll", kernel32_fixture());

    let (imports, cells) =
        import_section(0x2000, &[("api-ms-win-core-synch-l1-1-0.dll", &["Sleep"])]);
    let import_size = imports.len() as u32;
    let main = Image::parse(
        PeBuilder::new(0x40_0000)
            .entry(0x1000)
            .section(".text", 0x1000, vec![0xC3])
            .section(".idata", 0x2000, imports)
            .directory(index::IMPORT, 0x2000, import_size)
            .build(),
    )
    .unwrap();

    let mut memory = Memory::new(MEMORY_SIZE);
    let mut loader = Loader::new(vec![dir]);
    loader.bind_main(&mut memory, main).unwrap();

    let sleep = loader.get_export("kernel32.dll", "Sleep").unwrap();
    let kernel32 = loader.loaded("kernel32.dll").unwrap();
    assert_eq!(sleep, kernel32.base + 0x500);
    // Ordinal aliases index the same slots.
    assert_eq!(loader.get_export("KERNEL32.DLL", "Ordinal #1"), Some(sleep));

    let iat_cell = 0x40_0000 + cells[0].2;
    assert_eq!(memory.read32(iat_cell).unwrap(), sleep);

    // Every export of every image stays inside its interval.
    for image in loader.images() {
        for (name, addr) in &image.exports {
            assert!(
                *addr >= image.base && *addr < image.base + image.size,
                "{name} escapes its image"
            );
        }
    }
}

#[test]
fn unresolved_imports_zero_the_cell() {
    let dir = common::scratch_dir("miss");
    write_fixture(&dir, "kernel32.dll", kernel32_fixture());

    let (imports, cells) = import_section(0x2000, &[("kernel32.dll", &["NoSuchExport"])]);
    let import_size = imports.len() as u32;
    let main = Image::parse(
        PeBuilder::new(0x40_0000)
            .entry(0x1000)
            .section(".text", 0x1000, vec![0xC3])
            .section(".idata", 0x2000, imports)
            .directory(index::IMPORT, 0x2000, import_size)
            .build(),
    )
    .unwrap();

    let mut memory = Memory::new(MEMORY_SIZE);
    let mut loader = Loader::new(vec![dir]);
    loader.bind_main(&mut memory, main).unwrap();
    assert_eq!(memory.read32(0x40_0000 + cells[0].2).unwrap(), 0);
}

#[test]
fn cyclic_imports_terminate_and_bind() {
    let dir = common::scratch_dir("cycle");

    let build_half = |own: &str, own_export: &str, peer: &str, peer_import: &str| {
        let exports = export_section(0x1000, own, &[(own_export, 0x3000)]);
        let export_size = exports.len() as u32;
        let (imports, cells) = import_section(0x2000, &[(peer, &[peer_import])]);
        let import_size = imports.len() as u32;
        let bytes = PeBuilder::new(DLL_REGION_START)
            .dll()
            .section(".edata", 0x1000, exports)
            .section(".idata", 0x2000, imports)
            .section(".text", 0x3000, vec![0xC3])
            .directory(index::EXPORT, 0x1000, export_size)
            .directory(index::IMPORT, 0x2000, import_size)
            .build();
        (bytes, cells)
    };

    let (a_bytes, a_cells) = build_half("a.dll", "AlphaEntry", "b.dll", "BetaEntry");
    let (b_bytes, b_cells) = build_half("b.dll", "BetaEntry", "a.dll", "AlphaEntry");
    write_fixture(&dir, "a.dll", a_bytes);
    write_fixture(&dir, "b.dll", b_bytes);

    let mut memory = Memory::new(MEMORY_SIZE);
    let mut loader = Loader::new(vec![dir]);
    loader.load(&mut memory, "a.dll").unwrap();

    assert_eq!(loader.images().len(), 2);
    let a = loader.loaded("a.dll").unwrap().base;
    let b = loader.loaded("b.dll").unwrap().base;
    assert_eq!(memory.read32(a + a_cells[0].2).unwrap(), b + 0x3000);
    assert_eq!(memory.read32(b + b_cells[0].2).unwrap(), a + 0x3000);
}

#[test]
fn patch_iats_repoints_stubbed_imports() {
    let dir = common::scratch_dir("patch");
    write_fixture(&dir, "kernel32.dll", kernel32_fixture());

    let (imports, cells) = import_section(0x2000, &[("kernel32.dll", &["Sleep"])]);
    let import_size = imports.len() as u32;
    let main = Image::parse(
        PeBuilder::new(0x40_0000)
            .entry(0x1000)
            .section(".text", 0x1000, vec![0xC3])
            .section(".idata", 0x2000, imports)
            .directory(index::IMPORT, 0x2000, import_size)
            .build(),
    )
    .unwrap();

    let mut memory = Memory::new(MEMORY_SIZE);
    let mut loader = Loader::new(vec![dir]);
    loader.bind_main(&mut memory, main).unwrap();

    let cell = 0x40_0000 + cells[0].2;
    let real = memory.read32(cell).unwrap();
    assert_ne!(real, 0);

    let mut stubs: HashMap<(String, String), u32> = HashMap::new();
    stubs.insert(("kernel32.dll".into(), "Sleep".into()), 0x0600_D011);
    loader.patch_iats(&mut memory, &stubs).unwrap();
    assert_eq!(memory.read32(cell).unwrap(), 0x0600_D011);
}

#[test]
fn leaf_lookup_is_case_insensitive() {
    let dir = common::scratch_dir("case");
    write_fixture(&dir, "kernel32.dll", kernel32_fixture());

    let mut memory = Memory::new(MEMORY_SIZE);
    let mut loader = Loader::new(vec![dir]);
    loader.load(&mut memory, "KERNEL32.DLL").unwrap();
    // The cache folds the name, so a second spelling does not reload.
    loader.load(&mut memory, "Kernel32.dll").unwrap();
    assert_eq!(loader.images().len(), 1);
}

#[test]
fn missing_image_is_reported() {
    let dir = common::scratch_dir("empty");
    let mut memory = Memory::new(MEMORY_SIZE);
    let mut loader = Loader::new(vec![dir]);
    assert!(matches!(
        loader.load(&mut memory, "nowhere.dll"),
        Err(pe_emu::Error::ImageNotFound(_))
    ));
}
