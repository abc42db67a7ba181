use crate::coff::MachineType;
use crate::directory::import::{ImportDescriptor, ImportTarget};
use crate::directory::reloc::BaseRelocationType;
use crate::image::Image;
use crate::memory::Memory;
use crate::Error;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Bottom of the region DLL slots are carved from.
pub const DLL_REGION_START: u32 = 0x1000_0000;
/// Top of the DLL region; placement never crosses it.
pub const DLL_REGION_END: u32 = 0x4000_0000;
/// Default per-image slot size. Oversized images take consecutive slots.
pub const IMAGE_SLOT_SIZE: u32 = 16 * 1024 * 1024;

/// Canonical host DLLs for each `api-ms-win-*` contract prefix, tried in
/// order when the contract image itself does not resolve a symbol.
const API_SET_HOSTS: &[(&str, &[&str])] = &[
    ("api-ms-win-core-rtlsupport-", &["ntdll.dll", "kernel32.dll"]),
    ("api-ms-win-core-processthreads-", &["kernel32.dll", "ntdll.dll"]),
    ("api-ms-win-core-synch-", &["kernel32.dll", "ntdll.dll"]),
    ("api-ms-win-core-file-", &["kernel32.dll", "ntdll.dll"]),
    ("api-ms-win-core-memory-", &["kernel32.dll", "ntdll.dll"]),
    ("api-ms-win-core-heap-", &["kernel32.dll", "ntdll.dll"]),
    ("api-ms-win-core-registry-", &["advapi32.dll", "kernel32.dll"]),
    ("api-ms-win-core-io-", &["kernel32.dll", "ntdll.dll"]),
    ("api-ms-win-core-handle-", &["kernel32.dll", "ntdll.dll"]),
    ("api-ms-win-core-errorhandling-", &["kernel32.dll", "ntdll.dll"]),
    ("api-ms-win-core-string-", &["kernel32.dll", "ntdll.dll"]),
    ("api-ms-win-core-localization-", &["kernel32.dll", "ntdll.dll"]),
    ("api-ms-win-core-sysinfo-", &["kernel32.dll", "ntdll.dll"]),
    ("api-ms-win-core-datetime-", &["kernel32.dll", "ntdll.dll"]),
    ("api-ms-win-core-libraryloader-", &["kernel32.dll", "ntdll.dll"]),
    ("api-ms-win-core-console-", &["kernel32.dll"]),
    ("api-ms-win-security-", &["advapi32.dll", "ntdll.dll"]),
    ("api-ms-win-crt-", &["msvcrt.dll"]),
    ("api-ms-win-shell-", &["shell32.dll", "kernel32.dll"]),
    ("api-ms-win-mm-", &["winmm.dll", "kernel32.dll"]),
    ("api-ms-win-gdi-", &["gdi32.dll", "kernel32.dll"]),
];
const API_SET_DEFAULT: &[&str] = &["kernel32.dll", "ntdll.dll"];

fn is_api_set(dll: &str) -> bool {
    dll.starts_with("api-ms-win-")
}

fn api_set_hosts(dll: &str) -> &'static [&'static str] {
    for &(prefix, hosts) in API_SET_HOSTS {
        if dll.starts_with(prefix) {
            return hosts;
        }
    }
    API_SET_DEFAULT
}

/// One registered span of the guest address space and the image owning it.
#[derive(Clone, Debug)]
pub struct AddressInterval {
    /// Case-folded leaf name of the owning image.
    pub name: String,
    /// First guest address of the span.
    pub base: u32,
    /// One past the last guest address of the span.
    pub end: u32,
}

impl AddressInterval {
    /// True when `addr` falls inside this span.
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr < self.end
    }

    fn overlaps(&self, base: u32, end: u32) -> bool {
        base < self.end && self.base < end
    }
}

/// A placed image: the parse result plus where it landed and what it
/// exports. Lives for the whole emulator session.
pub struct LoadedImage {
    /// Case-folded leaf name, e.g. `kernel32.dll`.
    pub name: String,
    /// The parsed file.
    pub image: Image,
    /// Guest address the image was placed at.
    pub base: u32,
    /// Reserved span size, a multiple of [`IMAGE_SLOT_SIZE`] for DLLs.
    pub size: u32,
    /// Export name (and `"Ordinal #N"`) to guest address.
    pub exports: HashMap<String, u32>,
}

/// One IAT cell the loader filled, journaled for the stub-patching pass.
#[derive(Clone, Debug)]
pub struct IatFixup {
    /// Guest address of the IAT cell.
    pub address: u32,
    /// DLL the import was requested from, case-folded.
    pub dll: String,
    /// Imported symbol name, or `"Ordinal #N"`.
    pub function: String,
}

/// Host-side stub registry consulted by [`Loader::patch_iats`]. Cells
/// whose `(dll, function)` has a stub are re-pointed at its trampoline so
/// cross-DLL calls dispatch into the host shim layer.
pub trait StubTable {
    /// Guest address of the trampoline for `dll!function`, if one exists.
    fn stub_address(&self, dll: &str, function: &str) -> Option<u32>;
}

impl StubTable for HashMap<(String, String), u32> {
    fn stub_address(&self, dll: &str, function: &str) -> Option<u32> {
        self.get(&(dll.to_string(), function.to_string())).copied()
    }
}

/// Places images into guest memory, applies base relocations, and binds
/// import tables recursively, resolving API-set forwarders along the way.
pub struct Loader {
    search_dirs: Vec<PathBuf>,
    images: Vec<LoadedImage>,
    by_name: HashMap<String, usize>,
    intervals: Vec<AddressInterval>,
    fixups: Vec<IatFixup>,
}

impl Loader {
    /// Create a loader that searches `search_dirs` in order for DLL files.
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        Loader {
            search_dirs,
            images: Vec::new(),
            by_name: HashMap::new(),
            intervals: Vec::new(),
            fixups: Vec::new(),
        }
    }

    /// Append one directory to the search order.
    pub fn add_search_dir<P: Into<PathBuf>>(&mut self, dir: P) {
        self.search_dirs.push(dir.into());
    }

    /// Every image placed so far, in load order.
    pub fn images(&self) -> &[LoadedImage] {
        &self.images
    }

    /// The placed image with the given case-folded name.
    pub fn loaded(&self, name: &str) -> Option<&LoadedImage> {
        self.by_name
            .get(&name.to_ascii_lowercase())
            .map(|&i| &self.images[i])
    }

    /// IAT cells written during binding, in write order.
    pub fn fixups(&self) -> &[IatFixup] {
        &self.fixups
    }

    /// Place the main executable at its own image base, bind its imports
    /// (loading dependencies recursively), and return the entry-point
    /// guest address.
    pub fn bind_main(&mut self, memory: &mut Memory, image: Image) -> Result<u32, Error> {
        if image.machine() != Some(MachineType::I386) || image.is_pe32_plus() {
            return Err(Error::UnsupportedMachine(image.coff.machine));
        }

        let name = image
            .export
            .as_ref()
            .map(|e| e.dll_name.to_ascii_lowercase())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "main".to_string());
        let base = image.image_base() as u32;
        let size = image.size_of_image();
        let entry = base.wrapping_add(image.entry_point());

        debug!("placing main image {name} at {base:#010x} (+{size:#x})");
        let index = self.place(memory, name, image, base, size)?;
        self.bind_imports(memory, index)?;

        Ok(entry)
    }

    /// Load a DLL by name, placing and binding it and everything it
    /// imports. Returns the index of the (possibly already loaded) image.
    pub fn load(&mut self, memory: &mut Memory, dll_name: &str) -> Result<usize, Error> {
        let key = folded_leaf(dll_name);
        if let Some(&index) = self.by_name.get(&key) {
            return Ok(index);
        }

        let path = self
            .find_file(&key)
            .ok_or_else(|| Error::ImageNotFound(key.clone()))?;
        debug!("loading {key} from {}", path.display());
        let image = Image::from_file(&path)?;

        let preferred = image.image_base() as u32;
        let size = slot_span(image.size_of_image());
        let base = self.find_available_base(&key, preferred, size)?;
        let index = self.place(memory, key, image, base, size)?;

        // The image is cached and its exports indexed before its imports
        // bind, so cyclic import graphs terminate at the second visit.
        self.bind_imports(memory, index)?;
        Ok(index)
    }

    /// First free base for a span of `size` bytes: the preferred base when
    /// it lies in the DLL region and is unoccupied, otherwise the lowest
    /// free slot from the bottom of the region.
    pub fn find_available_base(
        &self,
        name: &str,
        preferred: u32,
        size: u32,
    ) -> Result<u32, Error> {
        let fits = |base: u32| -> bool {
            base.checked_add(size)
                .is_some_and(|end| end <= DLL_REGION_END && !self.occupied(base, end))
        };

        if preferred >= DLL_REGION_START && preferred < DLL_REGION_END && fits(preferred) {
            return Ok(preferred);
        }

        let mut base = DLL_REGION_START;
        while base.checked_add(size).is_some_and(|end| end <= DLL_REGION_END) {
            if fits(base) {
                return Ok(base);
            }
            base += IMAGE_SLOT_SIZE;
        }

        Err(Error::NoAddressSpace {
            name: name.to_string(),
            size,
        })
    }

    fn occupied(&self, base: u32, end: u32) -> bool {
        self.intervals.iter().any(|iv| iv.overlaps(base, end))
    }

    /// Copy sections, apply relocations when displaced, index exports,
    /// and register the interval. Imports are NOT bound here; callers do
    /// that after the cache entry exists.
    fn place(
        &mut self,
        memory: &mut Memory,
        name: String,
        image: Image,
        base: u32,
        size: u32,
    ) -> Result<usize, Error> {
        for section in &image.sections {
            if section.data.is_empty() {
                continue;
            }
            let addr = base.wrapping_add(section.header.virtual_address);
            trace!(
                "{name}: section {} -> {addr:#010x} ({} bytes)",
                section.header.get_name(),
                section.data.len()
            );
            memory.load(addr, &image.bytes()[section.data.clone()])?;
            // The zero-fill tail needs no work: guest memory starts zeroed.
        }

        let preferred = image.image_base() as u32;
        if base != preferred {
            apply_relocations(memory, &image, base)?;
        }

        let mut exports = HashMap::new();
        if let Some(directory) = &image.export {
            for entry in &directory.entries {
                if entry.rva == 0 {
                    continue;
                }
                let va = base.wrapping_add(entry.rva);
                if let Some(export_name) = &entry.name {
                    // First definition of a name wins.
                    exports.entry(export_name.clone()).or_insert(va);
                }
                exports.insert(format!("Ordinal #{}", entry.ordinal), va);
            }
        }

        let index = self.images.len();
        self.intervals.push(AddressInterval {
            name: name.clone(),
            base,
            end: base.wrapping_add(size),
        });
        self.by_name.insert(name.clone(), index);
        self.images.push(LoadedImage {
            name,
            image,
            base,
            size,
            exports,
        });
        Ok(index)
    }

    /// Bind the ordinary and delay import tables of `index`, loading
    /// dependency DLLs recursively. Misses degrade to a zero IAT cell and
    /// a warning; the guest faults on first call instead.
    fn bind_imports(&mut self, memory: &mut Memory, index: usize) -> Result<(), Error> {
        let importer = &self.images[index];
        let base = importer.base;
        let importer_name = importer.name.clone();

        let mut descriptors: Vec<ImportDescriptor> = importer
            .image
            .import
            .as_ref()
            .map(|dir| dir.descriptors.clone())
            .unwrap_or_default();
        for delayed in &importer.image.delay_imports {
            descriptors.push(ImportDescriptor {
                dll_name: delayed.dll_name.clone(),
                entries: delayed.entries.clone(),
            });
        }

        for descriptor in descriptors {
            let dll = folded_leaf(&descriptor.dll_name);
            let dep = match self.load(memory, &dll) {
                Ok(i) => Some(i),
                Err(err) => {
                    if !is_api_set(&dll) {
                        warn!("{importer_name}: cannot load {dll}: {err}");
                    }
                    None
                }
            };

            for entry in descriptor.entries {
                let function = match &entry.target {
                    ImportTarget::Name { name, .. } => name.clone(),
                    ImportTarget::Ordinal(n) => format!("Ordinal #{n}"),
                };
                let cell = base.wrapping_add(entry.iat_rva);

                match self.resolve(memory, dep, &dll, &function) {
                    Some(target) => {
                        memory.write32(cell, target)?;
                        self.fixups.push(IatFixup {
                            address: cell,
                            dll: dll.clone(),
                            function,
                        });
                    }
                    None => {
                        warn!("{importer_name}: unresolved import {dll}!{function}");
                        memory.write32(cell, 0)?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Resolve one import against, in order: the dependency itself, the
    /// API-set host candidates, then every loaded non-contract image.
    fn resolve(
        &mut self,
        memory: &mut Memory,
        dep: Option<usize>,
        dll: &str,
        function: &str,
    ) -> Option<u32> {
        if let Some(index) = dep {
            if let Some(&addr) = self.images[index].exports.get(function) {
                return Some(addr);
            }
        }

        if is_api_set(dll) {
            for host in api_set_hosts(dll) {
                if let Ok(index) = self.load(memory, host) {
                    if let Some(&addr) = self.images[index].exports.get(function) {
                        return Some(addr);
                    }
                }
            }
        }

        self.images
            .iter()
            .filter(|img| !is_api_set(&img.name))
            .find_map(|img| img.exports.get(function).copied())
    }

    /// Re-point journaled IAT cells whose `(dll, function)` has a host
    /// stub. After this returns every cell holds a stub trampoline, a real
    /// DLL address, or zero.
    pub fn patch_iats(&self, memory: &mut Memory, stubs: &dyn StubTable) -> Result<(), Error> {
        for fixup in &self.fixups {
            if let Some(stub) = stubs.stub_address(&fixup.dll, &fixup.function) {
                trace!(
                    "patching {}!{} at {:#010x} -> stub {stub:#010x}",
                    fixup.dll,
                    fixup.function,
                    fixup.address
                );
                memory.write32(fixup.address, stub)?;
            }
        }
        Ok(())
    }

    /// Reverse lookup: the interval owning `addr`, if any. The interval
    /// list stays small (tens of images), so a linear scan is fine.
    pub fn find_image_for(&self, addr: u32) -> Option<&AddressInterval> {
        self.intervals.iter().find(|iv| iv.contains(addr))
    }

    /// Guest address of `dll!name`, after case-folding the DLL name.
    pub fn get_export(&self, dll: &str, name: &str) -> Option<u32> {
        self.loaded(dll)?.exports.get(name).copied()
    }

    /// TLS callback pointers of the image at `index`, in array order. The
    /// pointer array address is a VA linked against the preferred base, so
    /// it is rebased when the image was displaced.
    pub fn tls_callbacks(&self, memory: &Memory, index: usize) -> Result<Vec<u32>, Error> {
        let loaded = &self.images[index];
        let Some(tls) = &loaded.image.tls else {
            return Ok(Vec::new());
        };
        if tls.address_of_callbacks == 0 {
            return Ok(Vec::new());
        }

        let delta = loaded.base.wrapping_sub(loaded.image.image_base() as u32);
        let mut cursor = tls.address_of_callbacks.wrapping_add(delta);
        let mut callbacks = Vec::new();
        loop {
            let callback = memory.read32(cursor)?;
            if callback == 0 {
                break;
            }
            callbacks.push(callback.wrapping_add(delta));
            cursor = cursor.wrapping_add(4);
        }
        Ok(callbacks)
    }

    /// Case-insensitive leaf-name lookup through the search directories,
    /// in configuration order.
    fn find_file(&self, leaf: &str) -> Option<PathBuf> {
        for dir in &self.search_dirs {
            if let Some(path) = find_in_dir(dir, leaf) {
                return Some(path);
            }
            if !leaf.contains('.') {
                if let Some(path) = find_in_dir(dir, &format!("{leaf}.dll")) {
                    return Some(path);
                }
            }
        }
        None
    }
}

fn find_in_dir(dir: &Path, leaf: &str) -> Option<PathBuf> {
    let direct = dir.join(leaf);
    if direct.is_file() {
        return Some(direct);
    }
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().eq_ignore_ascii_case(leaf) {
            let path = entry.path();
            if path.is_file() {
                return Some(path);
            }
        }
    }
    None
}

/// Leaf of a possibly qualified DLL path, case-folded.
fn folded_leaf(name: &str) -> String {
    let leaf = name.rsplit(['/', '\\']).next().unwrap_or(name);
    leaf.to_ascii_lowercase()
}

/// Span to reserve for an image: whole slots, at least one.
fn slot_span(size_of_image: u32) -> u32 {
    let slots = size_of_image.div_ceil(IMAGE_SLOT_SIZE).max(1);
    slots * IMAGE_SLOT_SIZE
}

/// Add the load delta to every HIGHLOW field. ABS padding never survives
/// parsing; any other type is skipped with a warning.
fn apply_relocations(memory: &mut Memory, image: &Image, base: u32) -> Result<(), Error> {
    let preferred = image.image_base() as u32;
    let delta = base.wrapping_sub(preferred);

    for block in &image.relocations {
        for entry in &block.entries {
            match entry.get_kind() {
                Some(BaseRelocationType::HighLow) => {
                    let addr = base
                        .wrapping_add(block.page_rva)
                        .wrapping_add(entry.offset.into());
                    let original = memory.read32(addr)?;
                    memory.write32(addr, original.wrapping_add(delta))?;
                }
                kind => {
                    warn!(
                        "skipping relocation type {:?} at rva {:#010x}+{:#x}",
                        kind, block.page_rva, entry.offset
                    );
                }
            }
        }
    }
    Ok(())
}
