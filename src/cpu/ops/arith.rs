use crate::cpu::{flags, Cpu, OpSize, EAX, EDX};
use crate::memory::Memory;
use crate::Error;

/// Register the arithmetic family: the eight classic ALU operations in
/// all their encodings, INC/DEC, the F6/F7 unary group, and the IMUL,
/// CMPXCHG, and XADD extensions.
pub fn register(cpu: &mut Cpu) {
    // ADD OR ADC SBB AND SUB XOR CMP, forms 00..05 of each row.
    for row in 0..8u8 {
        let base = row << 3;
        for form in 0..6u8 {
            cpu.set_handler(base + form, alu);
        }
    }

    cpu.set_handler(0x80, alu_group); // r/m8, imm8
    cpu.set_handler(0x81, alu_group); // r/m, imm
    cpu.set_handler(0x83, alu_group); // r/m, imm8 sign-extended

    for reg in 0..8u8 {
        cpu.set_handler(0x40 + reg, inc_dec_reg);
        cpu.set_handler(0x48 + reg, inc_dec_reg);
    }

    cpu.set_handler(0xF6, unary_group); // r/m8
    cpu.set_handler(0xF7, unary_group); // r/m

    cpu.set_handler(0x69, imul_imm); // r, r/m, imm
    cpu.set_handler(0x6B, imul_imm); // r, r/m, imm8
    cpu.set_handler_0f(0xAF, imul_reg); // r, r/m

    cpu.set_handler_0f(0xB0, cmpxchg); // r/m8, r8
    cpu.set_handler_0f(0xB1, cmpxchg); // r/m, r
    cpu.set_handler_0f(0xC0, xadd); // r/m8, r8
    cpu.set_handler_0f(0xC1, xadd); // r/m, r
}

fn fetch_imm(cpu: &mut Cpu, memory: &Memory, size: OpSize) -> Result<u32, Error> {
    match size {
        OpSize::Byte => Ok(cpu.fetch8(memory)?.into()),
        OpSize::Word => Ok(cpu.fetch16(memory)?.into()),
        OpSize::Dword => cpu.fetch32(memory),
    }
}

/// Apply ALU operation `kind` (the opcode row) and update flags.
fn apply(cpu: &mut Cpu, kind: u8, size: OpSize, a: u32, b: u32) -> u32 {
    match kind {
        0 => cpu.alu_add(size, a, b, false),
        1 => cpu.logic_flags(size, a | b),
        2 => {
            let carry = cpu.flag(flags::CF);
            cpu.alu_add(size, a, b, carry)
        }
        3 => {
            let borrow = cpu.flag(flags::CF);
            cpu.alu_sub(size, a, b, borrow)
        }
        4 => cpu.logic_flags(size, a & b),
        5 => cpu.alu_sub(size, a, b, false),
        6 => cpu.logic_flags(size, a ^ b),
        _ => cpu.alu_sub(size, a, b, false), // CMP
    }
}

fn writes_back(kind: u8) -> bool {
    kind != 7 // CMP only sets flags
}

fn alu(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let kind = opcode >> 3;
    let form = opcode & 7;
    let size = if form & 1 == 0 {
        OpSize::Byte
    } else {
        cpu.operand_size()
    };

    match form {
        0 | 1 => {
            // r/m, r
            let modrm = cpu.fetch_modrm(memory)?;
            let rm = cpu.fetch_effective(memory, modrm)?;
            let a = cpu.read_op(memory, size, rm)?;
            let b = cpu.reg(size, modrm.reg);
            let result = apply(cpu, kind, size, a, b);
            if writes_back(kind) {
                cpu.write_op(memory, size, rm, result)?;
            }
        }
        2 | 3 => {
            // r, r/m
            let modrm = cpu.fetch_modrm(memory)?;
            let rm = cpu.fetch_effective(memory, modrm)?;
            let a = cpu.reg(size, modrm.reg);
            let b = cpu.read_op(memory, size, rm)?;
            let result = apply(cpu, kind, size, a, b);
            if writes_back(kind) {
                cpu.set_reg(size, modrm.reg, result);
            }
        }
        _ => {
            // AL/eAX, imm
            let imm = fetch_imm(cpu, memory, size)?;
            let a = cpu.reg(size, 0);
            let result = apply(cpu, kind, size, a, imm);
            if writes_back(kind) {
                cpu.set_reg(size, 0, result);
            }
        }
    }
    Ok(())
}

/// 80/81/83: ALU operation selected by the reg field, immediate source.
fn alu_group(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let size = if opcode == 0x80 {
        OpSize::Byte
    } else {
        cpu.operand_size()
    };
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    let imm = if opcode == 0x83 {
        cpu.fetch8(memory)? as i8 as i32 as u32
    } else {
        fetch_imm(cpu, memory, size)?
    };

    let a = cpu.read_op(memory, size, rm)?;
    let result = apply(cpu, modrm.reg, size, a, imm);
    if writes_back(modrm.reg) {
        cpu.write_op(memory, size, rm, result)?;
    }
    Ok(())
}

/// 40..4F: INC/DEC on a register encoded in the opcode.
fn inc_dec_reg(cpu: &mut Cpu, _memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let size = cpu.operand_size();
    let reg = opcode & 7;
    let dec = opcode & 0x08 != 0;
    let value = cpu.reg(size, reg);
    let result = cpu.alu_inc(size, value, dec);
    cpu.set_reg(size, reg, result);
    Ok(())
}

/// F6/F7: TEST imm, NOT, NEG, MUL, IMUL, DIV, IDIV by reg field.
fn unary_group(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let at = cpu.eip.wrapping_sub(1);
    let size = if opcode == 0xF6 {
        OpSize::Byte
    } else {
        cpu.operand_size()
    };
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;

    match modrm.reg {
        0 => {
            let imm = fetch_imm(cpu, memory, size)?;
            let value = cpu.read_op(memory, size, rm)?;
            cpu.logic_flags(size, value & imm);
        }
        2 => {
            let value = cpu.read_op(memory, size, rm)?;
            cpu.write_op(memory, size, rm, !value)?;
        }
        3 => {
            let value = cpu.read_op(memory, size, rm)?;
            let result = cpu.alu_sub(size, 0, value, false);
            cpu.set_flag(flags::CF, value & size.mask() != 0);
            cpu.write_op(memory, size, rm, result)?;
        }
        4 => {
            let value = cpu.read_op(memory, size, rm)?;
            mul(cpu, size, value);
        }
        5 => {
            let value = cpu.read_op(memory, size, rm)?;
            imul_one(cpu, size, value);
        }
        6 => {
            let value = cpu.read_op(memory, size, rm)?;
            div(cpu, size, value, at)?;
        }
        7 => {
            let value = cpu.read_op(memory, size, rm)?;
            idiv(cpu, size, value, at)?;
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

/// Unsigned widening multiply into the A/D pair. CF=OF set when the high
/// half is non-zero.
fn mul(cpu: &mut Cpu, size: OpSize, src: u32) {
    match size {
        OpSize::Byte => {
            let product = u32::from(cpu.reg8(0)) * (src & 0xFF);
            cpu.set_reg(OpSize::Word, EAX as u8, product);
            set_mul_overflow(cpu, product >> 8 != 0);
        }
        OpSize::Word => {
            let product = (cpu.regs[EAX] & 0xFFFF) * (src & 0xFFFF);
            cpu.set_reg(OpSize::Word, EAX as u8, product);
            cpu.set_reg(OpSize::Word, EDX as u8, product >> 16);
            set_mul_overflow(cpu, product >> 16 != 0);
        }
        OpSize::Dword => {
            let product = u64::from(cpu.regs[EAX]) * u64::from(src);
            cpu.regs[EAX] = product as u32;
            cpu.regs[EDX] = (product >> 32) as u32;
            set_mul_overflow(cpu, product >> 32 != 0);
        }
    }
}

/// Signed widening multiply into the A/D pair. CF=OF set when the high
/// half is not the sign extension of the low half.
fn imul_one(cpu: &mut Cpu, size: OpSize, src: u32) {
    match size {
        OpSize::Byte => {
            let product = i32::from(cpu.reg8(0) as i8) * i32::from(src as u8 as i8);
            cpu.set_reg(OpSize::Word, EAX as u8, product as u32);
            set_mul_overflow(cpu, product != i32::from(product as i8));
        }
        OpSize::Word => {
            let product =
                i32::from(cpu.regs[EAX] as u16 as i16) * i32::from(src as u16 as i16);
            cpu.set_reg(OpSize::Word, EAX as u8, product as u32);
            cpu.set_reg(OpSize::Word, EDX as u8, (product >> 16) as u32);
            set_mul_overflow(cpu, product != i32::from(product as i16));
        }
        OpSize::Dword => {
            let product = i64::from(cpu.regs[EAX] as i32) * i64::from(src as i32);
            cpu.regs[EAX] = product as u32;
            cpu.regs[EDX] = (product >> 32) as u32;
            set_mul_overflow(cpu, product != i64::from(product as i32));
        }
    }
}

fn set_mul_overflow(cpu: &mut Cpu, overflow: bool) {
    cpu.set_flag(flags::CF, overflow);
    cpu.set_flag(flags::OF, overflow);
}

/// Unsigned divide of the widened A/D pair. Faults on zero divisors and
/// on quotients that do not fit the destination.
fn div(cpu: &mut Cpu, size: OpSize, src: u32, at: u32) -> Result<(), Error> {
    let fault = Error::DivideFault { eip: at };
    match size {
        OpSize::Byte => {
            let divisor = src & 0xFF;
            if divisor == 0 {
                return Err(fault);
            }
            let dividend = cpu.regs[EAX] & 0xFFFF;
            let quotient = dividend / divisor;
            if quotient > 0xFF {
                return Err(fault);
            }
            cpu.set_reg8(0, quotient as u8);
            cpu.set_reg8(4, (dividend % divisor) as u8);
        }
        OpSize::Word => {
            let divisor = src & 0xFFFF;
            if divisor == 0 {
                return Err(fault);
            }
            let dividend = ((cpu.regs[EDX] & 0xFFFF) << 16) | (cpu.regs[EAX] & 0xFFFF);
            let quotient = dividend / divisor;
            if quotient > 0xFFFF {
                return Err(fault);
            }
            cpu.set_reg(OpSize::Word, EAX as u8, quotient);
            cpu.set_reg(OpSize::Word, EDX as u8, dividend % divisor);
        }
        OpSize::Dword => {
            if src == 0 {
                return Err(fault);
            }
            let dividend = (u64::from(cpu.regs[EDX]) << 32) | u64::from(cpu.regs[EAX]);
            let quotient = dividend / u64::from(src);
            if quotient > u64::from(u32::MAX) {
                return Err(fault);
            }
            cpu.regs[EAX] = quotient as u32;
            cpu.regs[EDX] = (dividend % u64::from(src)) as u32;
        }
    }
    Ok(())
}

/// Signed divide of the widened A/D pair, truncating toward zero.
fn idiv(cpu: &mut Cpu, size: OpSize, src: u32, at: u32) -> Result<(), Error> {
    let fault = Error::DivideFault { eip: at };
    match size {
        OpSize::Byte => {
            let divisor = i32::from(src as u8 as i8);
            if divisor == 0 {
                return Err(fault);
            }
            let dividend = i32::from(cpu.regs[EAX] as u16 as i16);
            let quotient = dividend / divisor;
            if quotient > 0x7F || quotient < -0x80 {
                return Err(fault);
            }
            cpu.set_reg8(0, quotient as u8);
            cpu.set_reg8(4, (dividend % divisor) as u8);
        }
        OpSize::Word => {
            let divisor = i32::from(src as u16 as i16);
            if divisor == 0 {
                return Err(fault);
            }
            let dividend =
                (((cpu.regs[EDX] & 0xFFFF) << 16) | (cpu.regs[EAX] & 0xFFFF)) as i32;
            let quotient = dividend / divisor;
            if quotient > 0x7FFF || quotient < -0x8000 {
                return Err(fault);
            }
            cpu.set_reg(OpSize::Word, EAX as u8, quotient as u32);
            cpu.set_reg(OpSize::Word, EDX as u8, (dividend % divisor) as u32);
        }
        OpSize::Dword => {
            let divisor = i64::from(src as i32);
            if divisor == 0 {
                return Err(fault);
            }
            let dividend =
                ((u64::from(cpu.regs[EDX]) << 32) | u64::from(cpu.regs[EAX])) as i64;
            let quotient = dividend / divisor;
            if quotient > i64::from(i32::MAX) || quotient < i64::from(i32::MIN) {
                return Err(fault);
            }
            cpu.regs[EAX] = quotient as u32;
            cpu.regs[EDX] = (dividend % divisor) as u32;
        }
    }
    Ok(())
}

/// 69/6B: three-operand IMUL with a dword or sign-extended byte immediate.
fn imul_imm(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let size = cpu.operand_size();
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    let imm = if opcode == 0x6B {
        cpu.fetch8(memory)? as i8 as i32 as u32
    } else {
        fetch_imm(cpu, memory, size)?
    };

    let value = cpu.read_op(memory, size, rm)?;
    let result = imul_truncating(cpu, size, value, imm);
    cpu.set_reg(size, modrm.reg, result);
    Ok(())
}

/// 0F AF: two-operand IMUL.
fn imul_reg(cpu: &mut Cpu, memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    let size = cpu.operand_size();
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    let value = cpu.read_op(memory, size, rm)?;
    let result = imul_truncating(cpu, size, cpu.reg(size, modrm.reg), value);
    cpu.set_reg(size, modrm.reg, result);
    Ok(())
}

fn imul_truncating(cpu: &mut Cpu, size: OpSize, a: u32, b: u32) -> u32 {
    let (result, overflow) = match size {
        OpSize::Word => {
            let wide = i32::from(a as u16 as i16) * i32::from(b as u16 as i16);
            (wide as u32 & 0xFFFF, wide != i32::from(wide as i16))
        }
        _ => {
            let wide = i64::from(a as i32) * i64::from(b as i32);
            (wide as u32, wide != i64::from(wide as i32))
        }
    };
    set_mul_overflow(cpu, overflow);
    result
}

/// 0F B0/B1: compare eAX with r/m, swap in the source on equality.
fn cmpxchg(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let size = if opcode == 0xB0 {
        OpSize::Byte
    } else {
        cpu.operand_size()
    };
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    let current = cpu.read_op(memory, size, rm)?;
    let accumulator = cpu.reg(size, 0);

    cpu.alu_sub(size, accumulator, current, false);
    if accumulator & size.mask() == current & size.mask() {
        let replacement = cpu.reg(size, modrm.reg);
        cpu.write_op(memory, size, rm, replacement)?;
    } else {
        cpu.set_reg(size, 0, current);
    }
    Ok(())
}

/// 0F C0/C1: exchange then add.
fn xadd(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let size = if opcode == 0xC0 {
        OpSize::Byte
    } else {
        cpu.operand_size()
    };
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    let dst = cpu.read_op(memory, size, rm)?;
    let src = cpu.reg(size, modrm.reg);

    let sum = cpu.alu_add(size, dst, src, false);
    cpu.set_reg(size, modrm.reg, dst);
    cpu.write_op(memory, size, rm, sum)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{EBX, ECX};

    fn exec(cpu: &mut Cpu, mem: &mut Memory, code: &[u8]) {
        mem.load(0x100, code).unwrap();
        cpu.eip = 0x100;
        cpu.step(mem).unwrap();
    }

    #[test]
    fn add_r32_rm32() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(0x1000);
        cpu.regs[EAX] = 7;
        cpu.regs[EBX] = 5;
        exec(&mut cpu, &mut mem, &[0x01, 0xD8]); // ADD EAX, EBX
        assert_eq!(cpu.regs[EAX], 12);
        assert!(!cpu.flag(flags::CF));
        assert!(!cpu.flag(flags::ZF));
    }

    #[test]
    fn group_83_sign_extends_the_immediate() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(0x1000);
        cpu.regs[ECX] = 10;
        exec(&mut cpu, &mut mem, &[0x83, 0xC1, 0xFE]); // ADD ECX, -2
        assert_eq!(cpu.regs[ECX], 8);
        assert!(cpu.flag(flags::CF)); // unsigned wrap carries
    }

    #[test]
    fn cmp_sets_flags_without_writing() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(0x1000);
        cpu.regs[EAX] = 3;
        cpu.regs[EBX] = 3;
        exec(&mut cpu, &mut mem, &[0x39, 0xD8]); // CMP EAX, EBX
        assert_eq!(cpu.regs[EAX], 3);
        assert!(cpu.flag(flags::ZF));
    }

    #[test]
    fn mul_widens_into_edx_eax() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(0x1000);
        cpu.regs[EAX] = 0x8000_0000;
        cpu.regs[ECX] = 4;
        exec(&mut cpu, &mut mem, &[0xF7, 0xE1]); // MUL ECX
        assert_eq!(cpu.regs[EAX], 0);
        assert_eq!(cpu.regs[EDX], 2);
        assert!(cpu.flag(flags::CF));
        assert!(cpu.flag(flags::OF));
    }

    #[test]
    fn div_by_zero_faults_with_eip() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(0x1000);
        cpu.regs[ECX] = 0;
        mem.load(0x100, &[0xF7, 0xF1]).unwrap(); // DIV ECX
        cpu.eip = 0x100;
        match cpu.step(&mut mem) {
            Err(Error::DivideFault { eip }) => assert_eq!(eip, 0x100),
            other => panic!("expected DivideFault, got {other:?}"),
        }
        // eip advanced past the whole encoding regardless.
        assert_eq!(cpu.eip, 0x102);
    }

    #[test]
    fn idiv_truncates_toward_zero() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(0x1000);
        cpu.regs[EAX] = (-7i32) as u32;
        cpu.regs[EDX] = 0xFFFF_FFFF; // sign extension
        cpu.regs[ECX] = 2;
        exec(&mut cpu, &mut mem, &[0xF7, 0xF9]); // IDIV ECX
        assert_eq!(cpu.regs[EAX] as i32, -3);
        assert_eq!(cpu.regs[EDX] as i32, -1);
    }

    #[test]
    fn neg_sets_carry_for_nonzero() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(0x1000);
        cpu.regs[EBX] = 5;
        exec(&mut cpu, &mut mem, &[0xF7, 0xDB]); // NEG EBX
        assert_eq!(cpu.regs[EBX] as i32, -5);
        assert!(cpu.flag(flags::CF));

        cpu.regs[EBX] = 0;
        exec(&mut cpu, &mut mem, &[0xF7, 0xDB]);
        assert_eq!(cpu.regs[EBX], 0);
        assert!(!cpu.flag(flags::CF));
    }

    #[test]
    fn cmpxchg_swaps_on_match() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(0x1000);
        cpu.regs[EAX] = 10;
        cpu.regs[EBX] = 10;
        cpu.regs[ECX] = 99;
        exec(&mut cpu, &mut mem, &[0x0F, 0xB1, 0xCB]); // CMPXCHG EBX, ECX
        assert_eq!(cpu.regs[EBX], 99);
        assert!(cpu.flag(flags::ZF));

        cpu.regs[EBX] = 7;
        exec(&mut cpu, &mut mem, &[0x0F, 0xB1, 0xCB]);
        assert_eq!(cpu.regs[EAX], 7); // loads the observed value
        assert!(!cpu.flag(flags::ZF));
    }
}
