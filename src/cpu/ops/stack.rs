use crate::cpu::{Cpu, OpSize, EBP, ESP};
use crate::memory::Memory;
use crate::Error;

/// Mask of the EFLAGS bits POPFD is allowed to load.
const POPF_MASK: u32 = crate::cpu::flags::CF
    | crate::cpu::flags::PF
    | crate::cpu::flags::ZF
    | crate::cpu::flags::SF
    | crate::cpu::flags::DF
    | crate::cpu::flags::OF;

/// Register the stack instructions.
pub fn register(cpu: &mut Cpu) {
    for reg in 0..8u8 {
        cpu.set_handler(0x50 + reg, push_reg);
        cpu.set_handler(0x58 + reg, pop_reg);
    }
    cpu.set_handler(0x60, pushad);
    cpu.set_handler(0x61, popad);
    cpu.set_handler(0x68, push_imm32);
    cpu.set_handler(0x6A, push_imm8);
    cpu.set_handler(0x8F, pop_rm);
    cpu.set_handler(0x9C, pushfd);
    cpu.set_handler(0x9D, popfd);
    cpu.set_handler(0xC8, enter);
    cpu.set_handler(0xC9, leave);
}

fn push_reg(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let reg = opcode & 7;
    if cpu.prefixes.operand_size {
        let value = cpu.reg(OpSize::Word, reg) as u16;
        cpu.push16(memory, value)
    } else {
        cpu.push32(memory, cpu.regs[reg as usize])
    }
}

fn pop_reg(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let reg = opcode & 7;
    if cpu.prefixes.operand_size {
        let value = cpu.pop16(memory)?;
        cpu.set_reg(OpSize::Word, reg, value.into());
    } else {
        cpu.regs[reg as usize] = cpu.pop32(memory)?;
    }
    Ok(())
}

/// 60: push all eight registers, with the pre-push ESP in the ESP slot.
fn pushad(cpu: &mut Cpu, memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    let original_esp = cpu.regs[ESP];
    for reg in 0..8 {
        let value = if reg == ESP {
            original_esp
        } else {
            cpu.regs[reg]
        };
        cpu.push32(memory, value)?;
    }
    Ok(())
}

/// 61: pop back into every register except ESP, whose slot is skipped.
fn popad(cpu: &mut Cpu, memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    for reg in (0..8).rev() {
        let value = cpu.pop32(memory)?;
        if reg != ESP {
            cpu.regs[reg] = value;
        }
    }
    Ok(())
}

fn push_imm32(cpu: &mut Cpu, memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    let imm = cpu.fetch32(memory)?;
    cpu.push32(memory, imm)
}

fn push_imm8(cpu: &mut Cpu, memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    let imm = cpu.fetch8(memory)? as i8 as i32 as u32;
    cpu.push32(memory, imm)
}

/// 8F /0: pop into an r/m operand.
fn pop_rm(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let at = cpu.eip.wrapping_sub(1);
    let modrm = cpu.fetch_modrm(memory)?;
    if modrm.reg != 0 {
        return Err(Error::UnsupportedEncoding {
            opcode,
            reg: modrm.reg,
            eip: at,
        });
    }
    // The pop happens before the EA uses ESP, per the architecture.
    let value = cpu.pop32(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    cpu.write_op(memory, OpSize::Dword, rm, value)
}

fn pushfd(cpu: &mut Cpu, memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    // Bit 1 always reads as set in the stored image.
    cpu.push32(memory, cpu.eflags | 0x02)
}

fn popfd(cpu: &mut Cpu, memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    let value = cpu.pop32(memory)?;
    cpu.eflags = (cpu.eflags & !POPF_MASK) | (value & POPF_MASK);
    Ok(())
}

/// C8: ENTER imm16, imm8. Nesting levels beyond zero copy the enclosing
/// frame pointers the way the architecture specifies.
fn enter(cpu: &mut Cpu, memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    let frame_size = cpu.fetch16(memory)?;
    let nesting = cpu.fetch8(memory)? & 0x1F;

    cpu.push32(memory, cpu.regs[EBP])?;
    let frame_ptr = cpu.regs[ESP];
    for _ in 1..u32::from(nesting) {
        cpu.regs[EBP] = cpu.regs[EBP].wrapping_sub(4);
        let enclosing = memory.read32(cpu.regs[EBP])?;
        cpu.push32(memory, enclosing)?;
    }
    if nesting > 0 {
        cpu.push32(memory, frame_ptr)?;
    }
    cpu.regs[EBP] = frame_ptr;
    cpu.regs[ESP] = cpu.regs[ESP].wrapping_sub(frame_size.into());
    Ok(())
}

/// C9: LEAVE.
fn leave(cpu: &mut Cpu, memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    cpu.regs[ESP] = cpu.regs[EBP];
    cpu.regs[EBP] = cpu.pop32(memory)?;
    Ok(())
}
