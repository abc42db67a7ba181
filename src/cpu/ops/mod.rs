//! Opcode handlers, registered into the CPU dispatch tables in one
//! initialization pass. Every handler fetches its own ModR/M, SIB,
//! displacement, and immediate bytes through the CPU fetch helpers, so
//! `eip` always ends up past the full encoding, faults included.

/// ALU family, INC/DEC, multiply/divide group
pub mod arith;
/// Transfers, interrupts, flag instructions, CPUID/RDTSC
pub mod control;
/// MOV family, LEA, XCHG, widening moves, SETcc, BSWAP
pub mod data;
/// x87 escape opcodes
pub mod float;
/// TEST, shifts and rotates, bit tests and scans
pub mod logic;
/// Pushes, pops, frames
pub mod stack;
/// MOVS/STOS/LODS/SCAS/CMPS with repeat prefixes
pub mod string;

use super::Cpu;
use crate::memory::Memory;
use crate::Error;

/// Populate both dispatch tables. Called once from [`Cpu::new`].
pub fn register_all(cpu: &mut Cpu) {
    arith::register(cpu);
    control::register(cpu);
    data::register(cpu);
    float::register(cpu);
    logic::register(cpu);
    stack::register(cpu);
    string::register(cpu);

    cpu.set_handler(0x0F, two_byte);
}

/// `0F` escape: dispatch the next byte through the secondary table.
fn two_byte(cpu: &mut Cpu, memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    let at = cpu.eip.wrapping_sub(1);
    let opcode = cpu.fetch8(memory)?;
    let handler = cpu.secondary[opcode as usize].ok_or(Error::UnknownOpcode0f { opcode, eip: at })?;
    handler(cpu, memory, opcode)
}
