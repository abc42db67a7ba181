use thiserror::Error;

/// Everything that can go wrong while parsing, loading, or executing a
/// guest image.
///
/// Parse and placement variants abort image construction; the CPU variants
/// are surfaced through [`crate::cpu::Cpu::run`] so the driver (or an
/// installed exception hook) can decide whether to halt, patch state, or
/// re-raise.
#[derive(Debug, Error)]
pub enum Error {
    /// A read ran past the end of the file or slice.
    #[error("offset out of range")]
    OffsetOutOfRange,
    /// The file does not start with the `MZ` signature.
    #[error("file is missing the MZ signature")]
    MissingDosHeader,
    /// `e_lfanew` does not point at a `PE\0\0` signature.
    #[error("file is missing the PE signature")]
    MissingPeHeader,
    /// The COFF file header could not be read.
    #[error("COFF header is truncated or malformed")]
    MissingCoffHeader,
    /// The optional-header magic is neither PE32 nor PE32+.
    #[error("optional header magic {0:#06x} is not PE32 or PE32+")]
    MissingMagicNumber(u16),
    /// The optional header could not be read.
    #[error("optional header is truncated or malformed")]
    BadOptionalHeader,
    /// The image targets a machine the interpreter cannot execute.
    #[error("machine type {0:#06x} is not executable on this core")]
    UnsupportedMachine(u16),
    /// No free slot of the required size in the DLL region.
    #[error("no free {size:#x}-byte slot in guest address space for {name}")]
    NoAddressSpace {
        /// Leaf name of the image that could not be placed.
        name: String,
        /// Size of the slot that was requested.
        size: u32,
    },
    /// The named image exists in none of the search directories.
    #[error("image {0:?} not found in any search directory")]
    ImageNotFound(String),
    /// A guest memory access fell outside the linear buffer.
    #[error("bad guest address {addr:#010x} (+{len}) outside memory of {size:#x} bytes")]
    BadAddress {
        /// First byte of the faulting access.
        addr: u32,
        /// Length of the access in bytes.
        len: usize,
        /// Total size of the guest memory buffer.
        size: usize,
    },
    /// No handler is registered for a one-byte opcode.
    #[error("unknown opcode {opcode:#04x} at eip {eip:#010x}")]
    UnknownOpcode {
        /// The unhandled opcode byte.
        opcode: u8,
        /// Guest address of that byte.
        eip: u32,
    },
    /// No handler is registered for a `0F`-prefixed opcode.
    #[error("unknown opcode 0f {opcode:#04x} at eip {eip:#010x}")]
    UnknownOpcode0f {
        /// The unhandled second opcode byte.
        opcode: u8,
        /// Guest address of the `0F` byte.
        eip: u32,
    },
    /// A ModR/M form a handler does not model (e.g. an x87 encoding
    /// outside the supported set, or an unused group slot).
    #[error("unsupported encoding {opcode:#04x} /{reg} at eip {eip:#010x}")]
    UnsupportedEncoding {
        /// Opcode byte that owns the group.
        opcode: u8,
        /// ModR/M `reg` field selecting the sub-operation.
        reg: u8,
        /// Guest address of the opcode byte.
        eip: u32,
    },
    /// DIV/IDIV by zero or a quotient that does not fit the destination.
    #[error("integer division fault at eip {eip:#010x}")]
    DivideFault {
        /// Guest address of the faulting instruction.
        eip: u32,
    },
    /// `INT n` executed with no interrupt hook installed.
    #[error("unhandled interrupt {0:#04x}")]
    UnhandledInterrupt(u8),
    /// Host I/O failure while reading an image from disk.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
