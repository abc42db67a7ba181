use crate::cpu::{flags, Cpu, OpSize, Operand, ECX};
use crate::memory::Memory;
use crate::Error;

/// Register TEST, the shift/rotate groups, the double-precision shifts,
/// the bit-test family, and the bit scans.
pub fn register(cpu: &mut Cpu) {
    cpu.set_handler(0x84, test_rm_r); // r/m8, r8
    cpu.set_handler(0x85, test_rm_r); // r/m, r
    cpu.set_handler(0xA8, test_acc_imm); // AL, imm8
    cpu.set_handler(0xA9, test_acc_imm); // eAX, imm

    cpu.set_handler(0xC0, shift_group); // r/m8, imm8
    cpu.set_handler(0xC1, shift_group); // r/m, imm8
    cpu.set_handler(0xD0, shift_group); // r/m8, 1
    cpu.set_handler(0xD1, shift_group); // r/m, 1
    cpu.set_handler(0xD2, shift_group); // r/m8, CL
    cpu.set_handler(0xD3, shift_group); // r/m, CL

    cpu.set_handler_0f(0xA4, shld); // r/m, r, imm8
    cpu.set_handler_0f(0xA5, shld); // r/m, r, CL
    cpu.set_handler_0f(0xAC, shrd); // r/m, r, imm8
    cpu.set_handler_0f(0xAD, shrd); // r/m, r, CL

    cpu.set_handler_0f(0xA3, bt_rm_r); // BT
    cpu.set_handler_0f(0xAB, bt_rm_r); // BTS
    cpu.set_handler_0f(0xB3, bt_rm_r); // BTR
    cpu.set_handler_0f(0xBB, bt_rm_r); // BTC
    cpu.set_handler_0f(0xBA, bt_group); // BT/BTS/BTR/BTC r/m, imm8

    cpu.set_handler_0f(0xBC, bsf);
    cpu.set_handler_0f(0xBD, bsr);
}

fn test_rm_r(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let size = if opcode == 0x84 {
        OpSize::Byte
    } else {
        cpu.operand_size()
    };
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    let a = cpu.read_op(memory, size, rm)?;
    let b = cpu.reg(size, modrm.reg);
    cpu.logic_flags(size, a & b);
    Ok(())
}

fn test_acc_imm(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let size = if opcode == 0xA8 {
        OpSize::Byte
    } else {
        cpu.operand_size()
    };
    let imm = match size {
        OpSize::Byte => cpu.fetch8(memory)?.into(),
        OpSize::Word => cpu.fetch16(memory)?.into(),
        OpSize::Dword => cpu.fetch32(memory)?,
    };
    let a = cpu.reg(size, 0);
    cpu.logic_flags(size, a & imm);
    Ok(())
}

/// C0..D3: ROL ROR RCL RCR SHL SHR SHL SAR by reg field. The count comes
/// from an immediate, the constant one, or CL, and is masked to 5 bits.
fn shift_group(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let size = if opcode & 1 == 0 {
        OpSize::Byte
    } else {
        cpu.operand_size()
    };
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    let count = match opcode {
        0xC0 | 0xC1 => cpu.fetch8(memory)?,
        0xD0 | 0xD1 => 1,
        _ => cpu.reg8(ECX as u8),
    } & 0x1F;

    let value = cpu.read_op(memory, size, rm)?;
    let result = match modrm.reg {
        0 => rol(cpu, size, value, count),
        1 => ror(cpu, size, value, count),
        2 => rcl(cpu, size, value, count),
        3 => rcr(cpu, size, value, count),
        4 | 6 => shl(cpu, size, value, count),
        5 => shr(cpu, size, value, count),
        _ => sar(cpu, size, value, count),
    };
    cpu.write_op(memory, size, rm, result)
}

fn shl(cpu: &mut Cpu, size: OpSize, value: u32, count: u8) -> u32 {
    let value = value & size.mask();
    if count == 0 {
        return value;
    }
    let bits = size.bits();
    let count = u32::from(count);
    let result = if count >= bits { 0 } else { (value << count) & size.mask() };
    let carry = count <= bits && value >> (bits - count) & 1 != 0;
    cpu.set_flag(flags::CF, carry);
    if count == 1 {
        cpu.set_flag(flags::OF, carry != (result & size.sign_bit() != 0));
    }
    cpu.set_szp(size, result);
    result
}

fn shr(cpu: &mut Cpu, size: OpSize, value: u32, count: u8) -> u32 {
    let value = value & size.mask();
    if count == 0 {
        return value;
    }
    let count = u32::from(count);
    let result = if count >= size.bits() { 0 } else { value >> count };
    let carry = count <= size.bits() && value >> (count - 1) & 1 != 0;
    cpu.set_flag(flags::CF, carry);
    if count == 1 {
        cpu.set_flag(flags::OF, value & size.sign_bit() != 0);
    }
    cpu.set_szp(size, result);
    result
}

fn sar(cpu: &mut Cpu, size: OpSize, value: u32, count: u8) -> u32 {
    let value = value & size.mask();
    if count == 0 {
        return value;
    }
    let bits = size.bits();
    let count = u32::from(count).min(bits);
    let sign_fill = if value & size.sign_bit() != 0 {
        size.mask() << (bits - count.min(bits - 1)) & size.mask()
    } else {
        0
    };
    let result = if count >= bits {
        if value & size.sign_bit() != 0 {
            size.mask()
        } else {
            0
        }
    } else {
        (value >> count | sign_fill) & size.mask()
    };
    let carry = value >> (count - 1).min(bits - 1) & 1 != 0;
    cpu.set_flag(flags::CF, carry);
    if count == 1 {
        cpu.set_flag(flags::OF, false);
    }
    cpu.set_szp(size, result);
    result
}

fn rol(cpu: &mut Cpu, size: OpSize, value: u32, count: u8) -> u32 {
    let value = value & size.mask();
    let bits = size.bits();
    let count = u32::from(count) % bits;
    if count == 0 {
        return value;
    }
    let result = ((value << count) | (value >> (bits - count))) & size.mask();
    let carry = result & 1 != 0;
    cpu.set_flag(flags::CF, carry);
    if count == 1 {
        cpu.set_flag(flags::OF, carry != (result & size.sign_bit() != 0));
    }
    result
}

fn ror(cpu: &mut Cpu, size: OpSize, value: u32, count: u8) -> u32 {
    let value = value & size.mask();
    let bits = size.bits();
    let count = u32::from(count) % bits;
    if count == 0 {
        return value;
    }
    let result = ((value >> count) | (value << (bits - count))) & size.mask();
    let msb = result & size.sign_bit() != 0;
    cpu.set_flag(flags::CF, msb);
    if count == 1 {
        let next = result & (size.sign_bit() >> 1) != 0;
        cpu.set_flag(flags::OF, msb != next);
    }
    result
}

fn rcl(cpu: &mut Cpu, size: OpSize, value: u32, count: u8) -> u32 {
    let bits = size.bits();
    let count = u32::from(count) % (bits + 1);
    let mut result = value & size.mask();
    let mut carry = cpu.flag(flags::CF);
    for _ in 0..count {
        let out = result & size.sign_bit() != 0;
        result = ((result << 1) | u32::from(carry)) & size.mask();
        carry = out;
    }
    cpu.set_flag(flags::CF, carry);
    if count == 1 {
        cpu.set_flag(flags::OF, carry != (result & size.sign_bit() != 0));
    }
    result
}

fn rcr(cpu: &mut Cpu, size: OpSize, value: u32, count: u8) -> u32 {
    let bits = size.bits();
    let count = u32::from(count) % (bits + 1);
    let mut result = value & size.mask();
    let mut carry = cpu.flag(flags::CF);
    if count == 1 {
        cpu.set_flag(flags::OF, carry != (result & size.sign_bit() != 0));
    }
    for _ in 0..count {
        let out = result & 1 != 0;
        result = (result >> 1) | (u32::from(carry) << (bits - 1));
        carry = out;
    }
    cpu.set_flag(flags::CF, carry);
    result
}

/// 0F A4/A5: shift left, filling from the source register.
fn shld(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let size = cpu.operand_size();
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    let count = if opcode == 0xA4 {
        cpu.fetch8(memory)?
    } else {
        cpu.reg8(ECX as u8)
    } & 0x1F;
    if count == 0 {
        return Ok(());
    }

    let bits = size.bits();
    let dst = cpu.read_op(memory, size, rm)?;
    let src = cpu.reg(size, modrm.reg);
    let count = u32::from(count);
    let result = if count >= bits {
        src
    } else {
        ((dst << count) | (src >> (bits - count))) & size.mask()
    };
    cpu.set_flag(flags::CF, count <= bits && dst >> (bits - count) & 1 != 0);
    cpu.set_szp(size, result);
    cpu.write_op(memory, size, rm, result)
}

/// 0F AC/AD: shift right, filling from the source register.
fn shrd(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let size = cpu.operand_size();
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    let count = if opcode == 0xAC {
        cpu.fetch8(memory)?
    } else {
        cpu.reg8(ECX as u8)
    } & 0x1F;
    if count == 0 {
        return Ok(());
    }

    let bits = size.bits();
    let dst = cpu.read_op(memory, size, rm)?;
    let src = cpu.reg(size, modrm.reg);
    let count = u32::from(count);
    let result = if count >= bits {
        src
    } else {
        ((dst >> count) | (src << (bits - count))) & size.mask()
    };
    cpu.set_flag(flags::CF, dst >> (count - 1) & 1 != 0);
    cpu.set_szp(size, result);
    cpu.write_op(memory, size, rm, result)
}

fn bt_apply(
    cpu: &mut Cpu,
    memory: &mut Memory,
    rm: Operand,
    size: OpSize,
    bit: u32,
    kind: u8,
) -> Result<(), Error> {
    // Register operands wrap the bit index; memory operands address the
    // containing dword the same way after the EA was formed.
    let bit = bit % size.bits();
    let mask = 1u32 << bit;
    let value = cpu.read_op(memory, size, rm)?;
    cpu.set_flag(flags::CF, value & mask != 0);

    let updated = match kind {
        5 => value | mask,          // BTS
        6 => value & !mask,         // BTR
        7 => value ^ mask,          // BTC
        _ => return Ok(()),         // BT
    };
    cpu.write_op(memory, size, rm, updated)
}

/// 0F A3/AB/B3/BB: bit test against a register-selected bit.
fn bt_rm_r(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let size = cpu.operand_size();
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    let bit = cpu.reg(size, modrm.reg);
    let kind = match opcode {
        0xAB => 5,
        0xB3 => 6,
        0xBB => 7,
        _ => 4,
    };
    bt_apply(cpu, memory, rm, size, bit, kind)
}

/// 0F BA: bit test against an immediate bit index.
fn bt_group(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let at = cpu.eip.wrapping_sub(1);
    let size = cpu.operand_size();
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    let bit = cpu.fetch8(memory)?;
    if modrm.reg < 4 {
        return Err(Error::UnsupportedEncoding {
            opcode,
            reg: modrm.reg,
            eip: at,
        });
    }
    bt_apply(cpu, memory, rm, size, bit.into(), modrm.reg)
}

fn bsf(cpu: &mut Cpu, memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    let size = cpu.operand_size();
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    let value = cpu.read_op(memory, size, rm)? & size.mask();
    cpu.set_flag(flags::ZF, value == 0);
    if value != 0 {
        cpu.set_reg(size, modrm.reg, value.trailing_zeros());
    }
    Ok(())
}

fn bsr(cpu: &mut Cpu, memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    let size = cpu.operand_size();
    let modrm = cpu.fetch_modrm(memory)?;
    let rm = cpu.fetch_effective(memory, modrm)?;
    let value = cpu.read_op(memory, size, rm)? & size.mask();
    cpu.set_flag(flags::ZF, value == 0);
    if value != 0 {
        cpu.set_reg(size, modrm.reg, 31 - value.leading_zeros());
    }
    Ok(())
}
