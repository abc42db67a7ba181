use crate::cpu::{flags, Cpu, OpSize, EAX, EBX, ECX, EDX, ESP};
use crate::memory::Memory;
use crate::Error;

/// Register control transfers, interrupt dispatch, flag instructions, and
/// the identification opcodes.
pub fn register(cpu: &mut Cpu) {
    for cc in 0..16u8 {
        cpu.set_handler(0x70 + cc, jcc_rel8);
        cpu.set_handler_0f(0x80 + cc, jcc_rel32);
    }

    cpu.set_handler(0xE8, call_rel32);
    cpu.set_handler(0xE9, jmp_rel32);
    cpu.set_handler(0xEB, jmp_rel8);
    cpu.set_handler(0xC2, ret_imm16);
    cpu.set_handler(0xC3, ret);
    cpu.set_handler(0xFF, ff_group);

    cpu.set_handler(0xCC, int3);
    cpu.set_handler(0xCD, int_imm8);
    cpu.set_handler(0xF4, hlt);

    cpu.set_handler(0xF5, flag_op); // CMC
    cpu.set_handler(0xF8, flag_op); // CLC
    cpu.set_handler(0xF9, flag_op); // STC
    cpu.set_handler(0xFA, flag_op); // CLI, tolerated
    cpu.set_handler(0xFB, flag_op); // STI, tolerated
    cpu.set_handler(0xFC, flag_op); // CLD
    cpu.set_handler(0xFD, flag_op); // STD
    cpu.set_handler(0x9E, sahf);
    cpu.set_handler(0x9F, lahf);

    cpu.set_handler_0f(0xA2, cpuid);
    cpu.set_handler_0f(0x31, rdtsc);
    cpu.set_handler_0f(0x1F, long_nop);
    cpu.set_handler_0f(0x0B, ud2);
}

fn jcc_rel8(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let disp = cpu.fetch8(memory)? as i8 as i32 as u32;
    if cpu.condition(opcode & 0x0F) {
        cpu.eip = cpu.eip.wrapping_add(disp);
    }
    Ok(())
}

fn jcc_rel32(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let disp = cpu.fetch32(memory)?;
    if cpu.condition(opcode & 0x0F) {
        cpu.eip = cpu.eip.wrapping_add(disp);
    }
    Ok(())
}

fn call_rel32(cpu: &mut Cpu, memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    let disp = cpu.fetch32(memory)?;
    cpu.push32(memory, cpu.eip)?;
    cpu.eip = cpu.eip.wrapping_add(disp);
    Ok(())
}

fn jmp_rel32(cpu: &mut Cpu, memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    let disp = cpu.fetch32(memory)?;
    cpu.eip = cpu.eip.wrapping_add(disp);
    Ok(())
}

fn jmp_rel8(cpu: &mut Cpu, memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    let disp = cpu.fetch8(memory)? as i8 as i32 as u32;
    cpu.eip = cpu.eip.wrapping_add(disp);
    Ok(())
}

fn ret(cpu: &mut Cpu, memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    cpu.eip = cpu.pop32(memory)?;
    Ok(())
}

fn ret_imm16(cpu: &mut Cpu, memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    let imm = cpu.fetch16(memory)?;
    cpu.eip = cpu.pop32(memory)?;
    cpu.regs[ESP] = cpu.regs[ESP].wrapping_add(imm.into());
    Ok(())
}

/// FF group: INC/DEC/CALL/JMP/PUSH on an r/m operand. Far transfers
/// (/3 and /5) are not modeled.
fn ff_group(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let at = cpu.eip.wrapping_sub(1);
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    let size = cpu.operand_size();

    match modrm.reg {
        0 | 1 => {
            let value = cpu.read_op(memory, size, rm)?;
            let result = cpu.alu_inc(size, value, modrm.reg == 1);
            cpu.write_op(memory, size, rm, result)?;
        }
        2 => {
            let target = cpu.read_op(memory, OpSize::Dword, rm)?;
            cpu.push32(memory, cpu.eip)?;
            cpu.eip = target;
        }
        4 => {
            cpu.eip = cpu.read_op(memory, OpSize::Dword, rm)?;
        }
        6 => {
            let value = cpu.read_op(memory, OpSize::Dword, rm)?;
            cpu.push32(memory, value)?;
        }
        reg => {
            return Err(Error::UnsupportedEncoding {
                opcode,
                reg,
                eip: at,
            })
        }
    }
    Ok(())
}

fn int3(cpu: &mut Cpu, memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    cpu.interrupt(memory, 3)
}

fn int_imm8(cpu: &mut Cpu, memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    let vector = cpu.fetch8(memory)?;
    cpu.interrupt(memory, vector)
}

fn hlt(cpu: &mut Cpu, _memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    cpu.halted = true;
    Ok(())
}

/// CMC/CLC/STC/CLD/STD plus CLI/STI, which a user-mode guest may execute
/// but which change nothing here.
fn flag_op(cpu: &mut Cpu, _memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    match opcode {
        0xF5 => {
            let carry = cpu.flag(flags::CF);
            cpu.set_flag(flags::CF, !carry);
        }
        0xF8 => cpu.set_flag(flags::CF, false),
        0xF9 => cpu.set_flag(flags::CF, true),
        0xFC => cpu.set_flag(flags::DF, false),
        0xFD => cpu.set_flag(flags::DF, true),
        _ => {} // CLI/STI
    }
    Ok(())
}

fn sahf(cpu: &mut Cpu, _memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    let ah = u32::from(cpu.reg8(4));
    let loadable = flags::CF | flags::PF | flags::ZF | flags::SF;
    cpu.eflags = (cpu.eflags & !loadable) | (ah & loadable);
    Ok(())
}

fn lahf(cpu: &mut Cpu, _memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    // Bit 1 of the low flag byte always reads as set.
    let low = (cpu.eflags & 0xFF) as u8 | 0x02;
    cpu.set_reg8(4, low);
    Ok(())
}

/// CPUID with the two leaves guests poke at: vendor string and a minimal
/// family/feature word (FPU present, TSC present).
fn cpuid(cpu: &mut Cpu, _memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    match cpu.regs[EAX] {
        0 => {
            cpu.regs[EAX] = 1;
            cpu.regs[EBX] = u32::from_le_bytes(*b"Genu");
            cpu.regs[EDX] = u32::from_le_bytes(*b"ineI");
            cpu.regs[ECX] = u32::from_le_bytes(*b"ntel");
        }
        _ => {
            cpu.regs[EAX] = 0x0000_0633; // family 6, model 3
            cpu.regs[EBX] = 0;
            cpu.regs[ECX] = 0;
            cpu.regs[EDX] = 0x0000_0011; // FPU | TSC
        }
    }
    Ok(())
}

/// RDTSC backed by the step counter, which is the only clock the
/// interpreter has.
fn rdtsc(cpu: &mut Cpu, _memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    cpu.regs[EAX] = cpu.steps as u32;
    cpu.regs[EDX] = (cpu.steps >> 32) as u32;
    Ok(())
}

/// 0F 1F: multi-byte NOP; the operand is decoded and dropped.
fn long_nop(cpu: &mut Cpu, memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    let modrm = cpu.fetch_modrm(memory)?;
    cpu.fetch_effective(memory, modrm)?;
    Ok(())
}

/// 0F 0B: guaranteed-undefined opcode, reported like any other decode
/// fault but under its own encoding.
fn ud2(cpu: &mut Cpu, _memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    Err(Error::UnknownOpcode0f {
        opcode,
        eip: cpu.eip.wrapping_sub(2),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_and_ret_round_trip() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(0x1000);
        cpu.regs[ESP] = 0x800;
        // 0x100: CALL +3 ; (3 bytes skipped) ; 0x108: target RET
        mem.load(0x100, &[0xE8, 0x03, 0x00, 0x00, 0x00]).unwrap();
        mem.write8(0x108, 0xC3).unwrap();
        cpu.eip = 0x100;
        cpu.step(&mut mem).unwrap();
        assert_eq!(cpu.eip, 0x108);
        assert_eq!(mem.read32(cpu.regs[ESP]).unwrap(), 0x105);
        cpu.step(&mut mem).unwrap();
        assert_eq!(cpu.eip, 0x105);
        assert_eq!(cpu.regs[ESP], 0x800);
    }

    #[test]
    fn ret_imm16_releases_arguments() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(0x1000);
        cpu.regs[ESP] = 0x7F8;
        mem.write32(0x7F8, 0x200).unwrap(); // return address
        mem.load(0x100, &[0xC2, 0x08, 0x00]).unwrap(); // RET 8
        cpu.eip = 0x100;
        cpu.step(&mut mem).unwrap();
        assert_eq!(cpu.eip, 0x200);
        assert_eq!(cpu.regs[ESP], 0x7F8 + 4 + 8);
    }

    #[test]
    fn conditional_jumps_follow_the_flags() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(0x1000);
        mem.load(0x100, &[0x74, 0x10]).unwrap(); // JZ +0x10

        cpu.set_flag(flags::ZF, true);
        cpu.eip = 0x100;
        cpu.step(&mut mem).unwrap();
        assert_eq!(cpu.eip, 0x112);

        cpu.set_flag(flags::ZF, false);
        cpu.eip = 0x100;
        cpu.step(&mut mem).unwrap();
        assert_eq!(cpu.eip, 0x102);
    }

    #[test]
    fn int_dispatches_to_the_hook() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(0x1000);
        cpu.set_interrupt_hook(Box::new(|vector, cpu, _mem| {
            cpu.regs[EAX] = u32::from(vector) * 2;
            Ok(())
        }));
        mem.load(0x100, &[0xCD, 0x21]).unwrap(); // INT 21h
        cpu.eip = 0x100;
        cpu.step(&mut mem).unwrap();
        assert_eq!(cpu.regs[EAX], 0x42);
    }

    #[test]
    fn int_without_hook_is_a_fault() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(0x1000);
        mem.load(0x100, &[0xCD, 0x80]).unwrap();
        cpu.eip = 0x100;
        match cpu.step(&mut mem) {
            Err(Error::UnhandledInterrupt(0x80)) => {}
            other => panic!("expected UnhandledInterrupt, got {other:?}"),
        }
    }

    #[test]
    fn indirect_call_through_register() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(0x1000);
        cpu.regs[ESP] = 0x800;
        cpu.regs[EBX] = 0x300;
        mem.load(0x100, &[0xFF, 0xD3]).unwrap(); // CALL EBX
        cpu.eip = 0x100;
        cpu.step(&mut mem).unwrap();
        assert_eq!(cpu.eip, 0x300);
        assert_eq!(mem.read32(cpu.regs[ESP]).unwrap(), 0x102);
    }

    #[test]
    fn hlt_sets_the_halted_flag() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(0x1000);
        mem.write8(0x100, 0xF4).unwrap();
        cpu.eip = 0x100;
        cpu.step(&mut mem).unwrap();
        assert!(cpu.halted);
        // run() refuses to continue.
        assert_eq!(cpu.run(&mut mem, 10).unwrap(), 0);
    }
}
