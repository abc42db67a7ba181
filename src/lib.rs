//! # pe-emu: user-mode PE loading and IA-32 interpretation.
//!
//! `pe-emu` parses 32-bit Portable Executables, places them in a linear
//! guest address space, binds their import tables against further PE
//! images, and interprets IA-32 machine code against that memory. It is
//! the substrate a thin Win32 compatibility layer runs legacy Windows
//! binaries on; the Win32 stubs themselves live outside this crate and
//! talk to the core through the interrupt/exception hooks and the IAT
//! stub-patching interface.
//!
//! ## Example
//! ```no_run
//! use pe_emu::{cpu::Cpu, image::Image, loader::Loader, memory::Memory};
//!
//! # fn main() -> Result<(), pe_emu::Error> {
//! let mut memory = Memory::new(512 * 1024 * 1024);
//! let image = Image::from_file("guest/program.exe")?;
//!
//! let mut loader = Loader::new(vec!["guest".into()]);
//! let entry = loader.bind_main(&mut memory, image)?;
//!
//! let mut cpu = Cpu::new();
//! cpu.eip = entry;
//! cpu.regs[pe_emu::cpu::ESP] = 0x1FFF_FFF0;
//! cpu.run(&mut memory, 1_000_000)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// COFF file header definitions and helper functions
pub mod coff;
/// IA-32 interpreter: registers, flags, x87, dispatch
pub mod cpu;
/// Data-directory decoders (exports, imports, relocations, ...)
pub mod directory;
/// Crate-wide error type
pub mod error;
/// Parsed-image aggregate and its queries
pub mod image;
/// Image placement, relocation, and import binding
pub mod loader;
/// Linear guest memory
pub mod memory;
/// Optional header definitions and helper functions
pub mod optional;
/// Bounds-checked little-endian readers
pub mod scribe;
/// Section header definitions and helper functions
pub mod section;

pub use error::Error;

// The bitflags newtypes all format and parse by deferring to the inner
// flags value; stamp the three impls out in one place.
macro_rules! flag_formats {
    ($t:ty) => {
        impl core::fmt::Debug for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                core::fmt::Debug::fmt(&self.0, f)
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl core::str::FromStr for $t {
            type Err = bitflags::parser::ParseError;

            fn from_str(flags: &str) -> Result<Self, Self::Err> {
                Ok(Self(flags.parse()?))
            }
        }
    };
}
pub(crate) use flag_formats;
