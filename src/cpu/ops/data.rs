use crate::cpu::{Cpu, OpSize, Operand, EAX, EDX};
use crate::memory::Memory;
use crate::Error;

/// Register data movement: the MOV family, LEA, XCHG, widening moves,
/// conversions, SETcc, and BSWAP.
pub fn register(cpu: &mut Cpu) {
    cpu.set_handler(0x88, mov_rm_r); // r/m8, r8
    cpu.set_handler(0x89, mov_rm_r); // r/m, r
    cpu.set_handler(0x8A, mov_r_rm); // r8, r/m8
    cpu.set_handler(0x8B, mov_r_rm); // r, r/m
    cpu.set_handler(0x8C, mov_rm_seg);
    cpu.set_handler(0x8E, mov_seg_rm);
    cpu.set_handler(0x8D, lea);

    cpu.set_handler(0x86, xchg_rm_r); // r/m8, r8
    cpu.set_handler(0x87, xchg_rm_r); // r/m, r
    for reg in 0..8u8 {
        cpu.set_handler(0x90 + reg, xchg_eax_reg); // 0x90 = NOP
        cpu.set_handler(0xB0 + reg, mov_reg8_imm);
        cpu.set_handler(0xB8 + reg, mov_reg_imm);
    }

    cpu.set_handler(0x98, cwde);
    cpu.set_handler(0x99, cdq);

    cpu.set_handler(0xA0, mov_moffs); // AL <- moffs8
    cpu.set_handler(0xA1, mov_moffs); // eAX <- moffs
    cpu.set_handler(0xA2, mov_moffs); // moffs8 <- AL
    cpu.set_handler(0xA3, mov_moffs); // moffs <- eAX

    cpu.set_handler(0xC6, mov_rm_imm); // r/m8, imm8
    cpu.set_handler(0xC7, mov_rm_imm); // r/m, imm

    cpu.set_handler_0f(0xB6, movzx); // r, r/m8
    cpu.set_handler_0f(0xB7, movzx); // r, r/m16
    cpu.set_handler_0f(0xBE, movsx); // r, r/m8
    cpu.set_handler_0f(0xBF, movsx); // r, r/m16

    for cc in 0..16u8 {
        cpu.set_handler_0f(0x90 + cc, setcc);
    }
    for reg in 0..8u8 {
        cpu.set_handler_0f(0xC8 + reg, bswap);
    }
}

fn op_size_for(opcode: u8, cpu: &Cpu) -> OpSize {
    if opcode & 1 == 0 {
        OpSize::Byte
    } else {
        cpu.operand_size()
    }
}

fn mov_rm_r(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let size = op_size_for(opcode, cpu);
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    let value = cpu.reg(size, modrm.reg);
    cpu.write_op(memory, size, rm, value)
}

fn mov_r_rm(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let size = op_size_for(opcode, cpu);
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    let value = cpu.read_op(memory, size, rm)?;
    cpu.set_reg(size, modrm.reg, value);
    Ok(())
}

fn mov_rm_seg(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let at = cpu.eip.wrapping_sub(1);
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    if modrm.reg > 5 {
        return Err(Error::UnsupportedEncoding {
            opcode,
            reg: modrm.reg,
            eip: at,
        });
    }
    let selector = cpu.segments[modrm.reg as usize];
    cpu.write_op(memory, OpSize::Word, rm, selector.into())
}

fn mov_seg_rm(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let at = cpu.eip.wrapping_sub(1);
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    if modrm.reg > 5 {
        return Err(Error::UnsupportedEncoding {
            opcode,
            reg: modrm.reg,
            eip: at,
        });
    }
    let selector = cpu.read_op(memory, OpSize::Word, rm)?;
    cpu.segments[modrm.reg as usize] = selector as u16;
    Ok(())
}

/// LEA computes the raw effective address: no segment base applies.
fn lea(cpu: &mut Cpu, memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    cpu.prefixes.segment = None;
    let modrm = cpu.fetch_modrm(memory)?;
    match cpu.fetch_effective(memory, modrm)? {
        Operand::Mem(addr) => {
            cpu.set_reg(cpu.operand_size(), modrm.reg, addr);
            Ok(())
        }
        Operand::Reg(_) => Err(Error::UnsupportedEncoding {
            opcode: 0x8D,
            reg: modrm.reg,
            eip: cpu.eip.wrapping_sub(2),
        }),
    }
}

fn xchg_rm_r(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let size = op_size_for(opcode, cpu);
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    let a = cpu.read_op(memory, size, rm)?;
    let b = cpu.reg(size, modrm.reg);
    cpu.write_op(memory, size, rm, b)?;
    cpu.set_reg(size, modrm.reg, a);
    Ok(())
}

/// 90..97: XCHG eAX, r. 0x90 exchanges EAX with itself, i.e. NOP.
fn xchg_eax_reg(cpu: &mut Cpu, _memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let size = cpu.operand_size();
    let reg = opcode & 7;
    let a = cpu.reg(size, 0);
    let b = cpu.reg(size, reg);
    cpu.set_reg(size, 0, b);
    cpu.set_reg(size, reg, a);
    Ok(())
}

fn mov_reg8_imm(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let imm = cpu.fetch8(memory)?;
    cpu.set_reg8(opcode & 7, imm);
    Ok(())
}

fn mov_reg_imm(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let size = cpu.operand_size();
    let imm = match size {
        OpSize::Word => cpu.fetch16(memory)?.into(),
        _ => cpu.fetch32(memory)?,
    };
    cpu.set_reg(size, opcode & 7, imm);
    Ok(())
}

/// A0..A3: accumulator moves through a 32-bit displacement, FS/GS aware.
fn mov_moffs(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let size = op_size_for(opcode, cpu);
    let off = cpu.fetch32(memory)?;
    let addr = cpu.apply_segment(off);
    let op = Operand::Mem(addr);
    if opcode < 0xA2 {
        let value = cpu.read_op(memory, size, op)?;
        cpu.set_reg(size, 0, value);
    } else {
        let value = cpu.reg(size, 0);
        cpu.write_op(memory, size, op, value)?;
    }
    Ok(())
}

fn mov_rm_imm(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let size = op_size_for(opcode, cpu);
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    let imm = match size {
        OpSize::Byte => cpu.fetch8(memory)?.into(),
        OpSize::Word => cpu.fetch16(memory)?.into(),
        OpSize::Dword => cpu.fetch32(memory)?,
    };
    cpu.write_op(memory, size, rm, imm)
}

fn narrow_size(opcode: u8) -> OpSize {
    if opcode & 1 == 0 {
        OpSize::Byte
    } else {
        OpSize::Word
    }
}

fn movzx(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    let value = cpu.read_op(memory, narrow_size(opcode), rm)?;
    cpu.set_reg(cpu.operand_size(), modrm.reg, value);
    Ok(())
}

fn movsx(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    let value = match narrow_size(opcode) {
        OpSize::Byte => cpu.read_op(memory, OpSize::Byte, rm)? as u8 as i8 as i32 as u32,
        _ => cpu.read_op(memory, OpSize::Word, rm)? as u16 as i16 as i32 as u32,
    };
    cpu.set_reg(cpu.operand_size(), modrm.reg, value);
    Ok(())
}

/// 98: CWDE (or CBW under the 66 prefix).
fn cwde(cpu: &mut Cpu, _memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    if cpu.prefixes.operand_size {
        let al = cpu.reg8(0) as i8;
        cpu.set_reg(OpSize::Word, EAX as u8, al as i16 as u16 as u32);
    } else {
        let ax = cpu.regs[EAX] as u16 as i16;
        cpu.regs[EAX] = ax as i32 as u32;
    }
    Ok(())
}

/// 99: CDQ (or CWD under the 66 prefix).
fn cdq(cpu: &mut Cpu, _memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    if cpu.prefixes.operand_size {
        let sign = if cpu.regs[EAX] & 0x8000 != 0 { 0xFFFF } else { 0 };
        cpu.set_reg(OpSize::Word, EDX as u8, sign);
    } else {
        cpu.regs[EDX] = if cpu.regs[EAX] & 0x8000_0000 != 0 {
            0xFFFF_FFFF
        } else {
            0
        };
    }
    Ok(())
}

/// 0F 90..9F: store the condition outcome as a byte.
fn setcc(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    let value = u32::from(cpu.condition(opcode & 0x0F));
    cpu.write_op(memory, OpSize::Byte, rm, value)
}

/// 0F C8+r: byte-swap a 32-bit register.
fn bswap(cpu: &mut Cpu, _memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let reg = (opcode & 7) as usize;
    cpu.regs[reg] = cpu.regs[reg].swap_bytes();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{flags, EBX, ECX, ESI};

    fn exec(cpu: &mut Cpu, mem: &mut Memory, code: &[u8]) {
        mem.load(0x100, code).unwrap();
        cpu.eip = 0x100;
        cpu.step(mem).unwrap();
    }

    #[test]
    fn mov_between_register_and_memory() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(0x1000);
        cpu.regs[EBX] = 0x200;
        cpu.regs[ECX] = 0xABCD_1234;
        exec(&mut cpu, &mut mem, &[0x89, 0x0B]); // MOV [EBX], ECX
        assert_eq!(mem.read32(0x200).unwrap(), 0xABCD_1234);

        cpu.regs[EAX] = 0;
        exec(&mut cpu, &mut mem, &[0x8B, 0x03]); // MOV EAX, [EBX]
        assert_eq!(cpu.regs[EAX], 0xABCD_1234);
    }

    #[test]
    fn mov_fs_moffs_uses_the_installed_base() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(0x5000);
        cpu.fs_base = Some(0x4000);
        mem.write32(0x4018, 0xCAFE_BABE).unwrap();
        // 64 A1 18 00 00 00 = MOV EAX, FS:[0x18]
        exec(&mut cpu, &mut mem, &[0x64, 0xA1, 0x18, 0x00, 0x00, 0x00]);
        assert_eq!(cpu.regs[EAX], 0xCAFE_BABE);
        assert!(cpu.prefixes.segment.is_none());
    }

    #[test]
    fn lea_ignores_segment_overrides() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(0x1000);
        cpu.fs_base = Some(0x4000);
        cpu.regs[ESI] = 0x30;
        // LEA EAX, [ESI+8] with an FS prefix in front.
        exec(&mut cpu, &mut mem, &[0x64, 0x8D, 0x46, 0x08]);
        assert_eq!(cpu.regs[EAX], 0x38);
    }

    #[test]
    fn movzx_and_movsx_widen_differently() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(0x1000);
        cpu.regs[EBX] = 0x80;
        exec(&mut cpu, &mut mem, &[0x0F, 0xB6, 0xCB]); // MOVZX ECX, BL
        assert_eq!(cpu.regs[ECX], 0x80);
        exec(&mut cpu, &mut mem, &[0x0F, 0xBE, 0xCB]); // MOVSX ECX, BL
        assert_eq!(cpu.regs[ECX], 0xFFFF_FF80);
    }

    #[test]
    fn setcc_writes_zero_or_one() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(0x1000);
        cpu.set_flag(flags::ZF, true);
        exec(&mut cpu, &mut mem, &[0x0F, 0x94, 0xC3]); // SETE BL
        assert_eq!(cpu.reg8(3), 1);
        cpu.set_flag(flags::ZF, false);
        exec(&mut cpu, &mut mem, &[0x0F, 0x94, 0xC3]);
        assert_eq!(cpu.reg8(3), 0);
    }

    #[test]
    fn cdq_extends_the_sign_into_edx() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(0x1000);
        cpu.regs[EAX] = 0x8000_0000;
        exec(&mut cpu, &mut mem, &[0x99]);
        assert_eq!(cpu.regs[EDX], 0xFFFF_FFFF);
        cpu.regs[EAX] = 5;
        exec(&mut cpu, &mut mem, &[0x99]);
        assert_eq!(cpu.regs[EDX], 0);
    }

    #[test]
    fn bswap_reverses_byte_order() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(0x1000);
        cpu.regs[ECX] = 0x1122_3344;
        exec(&mut cpu, &mut mem, &[0x0F, 0xC9]); // BSWAP ECX
        assert_eq!(cpu.regs[ECX], 0x4433_2211);
    }
}
