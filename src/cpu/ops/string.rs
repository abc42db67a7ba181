use crate::cpu::{flags, Cpu, OpSize, Operand, Rep, ECX, EDI, ESI};
use crate::memory::Memory;
use crate::Error;

/// Register MOVS/STOS/LODS/SCAS/CMPS in their byte and full-width forms.
/// A repeat prefix runs the whole iteration inside one step, so `REP
/// MOVSD` with ECX = N copies 4·N bytes in a single instruction.
pub fn register(cpu: &mut Cpu) {
    cpu.set_handler(0xA4, movs); // MOVSB
    cpu.set_handler(0xA5, movs); // MOVSD / MOVSW
    cpu.set_handler(0xA6, cmps); // CMPSB
    cpu.set_handler(0xA7, cmps); // CMPSD / CMPSW
    cpu.set_handler(0xAA, stos); // STOSB
    cpu.set_handler(0xAB, stos); // STOSD / STOSW
    cpu.set_handler(0xAC, lods); // LODSB
    cpu.set_handler(0xAD, lods); // LODSD / LODSW
    cpu.set_handler(0xAE, scas); // SCASB
    cpu.set_handler(0xAF, scas); // SCASD / SCASW
}

fn elem_size(cpu: &Cpu, opcode: u8) -> OpSize {
    if opcode & 1 == 0 {
        OpSize::Byte
    } else {
        cpu.operand_size()
    }
}

/// Per-element pointer adjustment: forward or backward by the element
/// width, selected by DF.
fn advance(cpu: &Cpu, size: OpSize) -> u32 {
    let step = size.bits() / 8;
    if cpu.flag(flags::DF) {
        step.wrapping_neg()
    } else {
        step
    }
}

fn read_elem(cpu: &Cpu, memory: &Memory, size: OpSize, addr: u32) -> Result<u32, Error> {
    cpu.read_op(memory, size, Operand::Mem(addr))
}

fn write_elem(
    cpu: &mut Cpu,
    memory: &mut Memory,
    size: OpSize,
    addr: u32,
    value: u32,
) -> Result<(), Error> {
    cpu.write_op(memory, size, Operand::Mem(addr), value)
}

fn movs(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let size = elem_size(cpu, opcode);
    let delta = advance(cpu, size);
    let repeat = cpu.prefixes.rep.is_some();

    loop {
        if repeat && cpu.regs[ECX] == 0 {
            break;
        }
        let value = read_elem(cpu, memory, size, cpu.apply_segment(cpu.regs[ESI]))?;
        write_elem(cpu, memory, size, cpu.regs[EDI], value)?;
        cpu.regs[ESI] = cpu.regs[ESI].wrapping_add(delta);
        cpu.regs[EDI] = cpu.regs[EDI].wrapping_add(delta);
        if !repeat {
            break;
        }
        cpu.regs[ECX] -= 1;
    }
    Ok(())
}

fn stos(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let size = elem_size(cpu, opcode);
    let delta = advance(cpu, size);
    let repeat = cpu.prefixes.rep.is_some();
    let value = cpu.reg(size, 0);

    loop {
        if repeat && cpu.regs[ECX] == 0 {
            break;
        }
        write_elem(cpu, memory, size, cpu.regs[EDI], value)?;
        cpu.regs[EDI] = cpu.regs[EDI].wrapping_add(delta);
        if !repeat {
            break;
        }
        cpu.regs[ECX] -= 1;
    }
    Ok(())
}

fn lods(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let size = elem_size(cpu, opcode);
    let delta = advance(cpu, size);
    let repeat = cpu.prefixes.rep.is_some();

    loop {
        if repeat && cpu.regs[ECX] == 0 {
            break;
        }
        let value = read_elem(cpu, memory, size, cpu.apply_segment(cpu.regs[ESI]))?;
        cpu.set_reg(size, 0, value);
        cpu.regs[ESI] = cpu.regs[ESI].wrapping_add(delta);
        if !repeat {
            break;
        }
        cpu.regs[ECX] -= 1;
    }
    Ok(())
}

fn cmps(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let size = elem_size(cpu, opcode);
    let delta = advance(cpu, size);
    let rep = cpu.prefixes.rep;

    loop {
        if rep.is_some() && cpu.regs[ECX] == 0 {
            break;
        }
        let a = read_elem(cpu, memory, size, cpu.apply_segment(cpu.regs[ESI]))?;
        let b = read_elem(cpu, memory, size, cpu.regs[EDI])?;
        cpu.alu_sub(size, a, b, false);
        cpu.regs[ESI] = cpu.regs[ESI].wrapping_add(delta);
        cpu.regs[EDI] = cpu.regs[EDI].wrapping_add(delta);
        match rep {
            None => break,
            Some(kind) => {
                cpu.regs[ECX] -= 1;
                if terminated(kind, cpu.flag(flags::ZF)) {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn scas(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let size = elem_size(cpu, opcode);
    let delta = advance(cpu, size);
    let rep = cpu.prefixes.rep;
    let accumulator = cpu.reg(size, 0);

    loop {
        if rep.is_some() && cpu.regs[ECX] == 0 {
            break;
        }
        let value = read_elem(cpu, memory, size, cpu.regs[EDI])?;
        cpu.alu_sub(size, accumulator, value, false);
        cpu.regs[EDI] = cpu.regs[EDI].wrapping_add(delta);
        match rep {
            None => break,
            Some(kind) => {
                cpu.regs[ECX] -= 1;
                if terminated(kind, cpu.flag(flags::ZF)) {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// REPE stops on inequality, REPNE on equality.
fn terminated(kind: Rep, zero: bool) -> bool {
    match kind {
        Rep::Rep => !zero,
        Rep::Repne => zero,
    }
}
