use crate::cpu::{Cpu, ModRm, Operand, EAX};
use crate::memory::Memory;
use crate::Error;

/// Register the eight x87 escape opcodes plus FWAIT. Values are kept as
/// f64 throughout; the 80-bit extended forms decode but fault.
pub fn register(cpu: &mut Cpu) {
    for opcode in 0xD8..=0xDF {
        cpu.set_handler(opcode, escape);
    }
    cpu.set_handler(0x9B, fwait);
}

/// 9B: with no unmasked exceptions to wait on, a no-op.
fn fwait(_cpu: &mut Cpu, _memory: &mut Memory, _opcode: u8) -> Result<(), Error> {
    Ok(())
}

fn unsupported(opcode: u8, modrm: ModRm, at: u32) -> Error {
    Error::UnsupportedEncoding {
        opcode,
        reg: modrm.reg,
        eip: at,
    }
}

fn read_f32(memory: &Memory, addr: u32) -> Result<f64, Error> {
    Ok(f32::from_bits(memory.read32(addr)?).into())
}

fn read_f64(memory: &Memory, addr: u32) -> Result<f64, Error> {
    Ok(f64::from_bits(memory.read64(addr)?))
}

fn write_f32(memory: &mut Memory, addr: u32, value: f64) -> Result<(), Error> {
    memory.write32(addr, (value as f32).to_bits())
}

fn write_f64(memory: &mut Memory, addr: u32, value: f64) -> Result<(), Error> {
    memory.write64(addr, value.to_bits())
}

/// The six dyadic operations of the arithmetic rows, in reg-field order:
/// ADD MUL (COM COMP) SUB SUBR DIV DIVR.
fn dyadic(reg: u8, st0: f64, src: f64) -> f64 {
    match reg {
        0 => st0 + src,
        1 => st0 * src,
        4 => st0 - src,
        5 => src - st0,
        6 => st0 / src,
        _ => src / st0,
    }
}

fn escape(cpu: &mut Cpu, memory: &mut Memory, opcode: u8) -> Result<(), Error> {
    let at = cpu.eip.wrapping_sub(1);
    let modrm = cpu.fetch_modrm(memory)?;

    if modrm.mode != 3 {
        let addr = match cpu.fetch_effective(memory, modrm)? {
            Operand::Mem(addr) => addr,
            Operand::Reg(_) => unreachable!("mode != 3 resolves to memory"),
        };
        match opcode {
            0xD8 => mem_arith_f32(cpu, memory, modrm, addr),
            0xD9 => mem_d9(cpu, memory, modrm, addr, at),
            0xDA => mem_arith_i32(cpu, memory, modrm, addr),
            0xDB => mem_db(cpu, memory, modrm, addr, at),
            0xDC => mem_arith_f64(cpu, memory, modrm, addr),
            0xDD => mem_dd(cpu, memory, modrm, addr, at),
            0xDE => mem_arith_i16(cpu, memory, modrm, addr),
            _ => mem_df(cpu, memory, modrm, addr, at),
        }
    } else {
        match opcode {
            0xD8 => reg_d8(cpu, modrm),
            0xD9 => reg_d9(cpu, modrm, at),
            0xDA => reg_da(cpu, modrm, at),
            0xDB => reg_db(cpu, modrm, at),
            0xDC => reg_dc(cpu, modrm, at),
            0xDD => reg_dd(cpu, modrm, at),
            0xDE => reg_de(cpu, modrm, at),
            _ => reg_df(cpu, modrm, at),
        }
    }
}

// ── memory forms ──

fn mem_arith(cpu: &mut Cpu, reg: u8, src: f64) {
    match reg {
        2 => {
            let st0 = cpu.fpu.get(0);
            cpu.fpu.compare(st0, src);
        }
        3 => {
            let st0 = cpu.fpu.get(0);
            cpu.fpu.compare(st0, src);
            cpu.fpu.pop();
        }
        reg => {
            let st0 = cpu.fpu.get(0);
            cpu.fpu.set(0, dyadic(reg, st0, src));
        }
    }
}

fn mem_arith_f32(cpu: &mut Cpu, memory: &mut Memory, modrm: ModRm, addr: u32) -> Result<(), Error> {
    let src = read_f32(memory, addr)?;
    mem_arith(cpu, modrm.reg, src);
    Ok(())
}

fn mem_arith_f64(cpu: &mut Cpu, memory: &mut Memory, modrm: ModRm, addr: u32) -> Result<(), Error> {
    let src = read_f64(memory, addr)?;
    mem_arith(cpu, modrm.reg, src);
    Ok(())
}

fn mem_arith_i32(cpu: &mut Cpu, memory: &mut Memory, modrm: ModRm, addr: u32) -> Result<(), Error> {
    let src = memory.read32(addr)? as i32 as f64;
    mem_arith(cpu, modrm.reg, src);
    Ok(())
}

fn mem_arith_i16(cpu: &mut Cpu, memory: &mut Memory, modrm: ModRm, addr: u32) -> Result<(), Error> {
    let src = memory.read16(addr)? as i16 as f64;
    mem_arith(cpu, modrm.reg, src);
    Ok(())
}

fn mem_d9(
    cpu: &mut Cpu,
    memory: &mut Memory,
    modrm: ModRm,
    addr: u32,
    at: u32,
) -> Result<(), Error> {
    match modrm.reg {
        0 => {
            let value = read_f32(memory, addr)?;
            cpu.fpu.push(value);
        }
        2 => write_f32(memory, addr, cpu.fpu.get(0))?,
        3 => {
            let value = cpu.fpu.pop();
            write_f32(memory, addr, value)?;
        }
        5 => cpu.fpu.control = memory.read16(addr)?,
        7 => memory.write16(addr, cpu.fpu.control)?,
        _ => return Err(unsupported(0xD9, modrm, at)), // FLDENV/FNSTENV
    }
    Ok(())
}

fn mem_db(
    cpu: &mut Cpu,
    memory: &mut Memory,
    modrm: ModRm,
    addr: u32,
    at: u32,
) -> Result<(), Error> {
    match modrm.reg {
        0 => {
            let value = memory.read32(addr)? as i32 as f64;
            cpu.fpu.push(value);
        }
        2 => memory.write32(addr, round_i32(cpu.fpu.get(0)) as u32)?,
        3 => {
            let value = cpu.fpu.pop();
            memory.write32(addr, round_i32(value) as u32)?;
        }
        _ => return Err(unsupported(0xDB, modrm, at)), // 80-bit forms
    }
    Ok(())
}

fn mem_dd(
    cpu: &mut Cpu,
    memory: &mut Memory,
    modrm: ModRm,
    addr: u32,
    at: u32,
) -> Result<(), Error> {
    match modrm.reg {
        0 => {
            let value = read_f64(memory, addr)?;
            cpu.fpu.push(value);
        }
        2 => write_f64(memory, addr, cpu.fpu.get(0))?,
        3 => {
            let value = cpu.fpu.pop();
            write_f64(memory, addr, value)?;
        }
        7 => memory.write16(addr, cpu.fpu.status)?,
        _ => return Err(unsupported(0xDD, modrm, at)), // FRSTOR/FNSAVE
    }
    Ok(())
}

fn mem_df(
    cpu: &mut Cpu,
    memory: &mut Memory,
    modrm: ModRm,
    addr: u32,
    at: u32,
) -> Result<(), Error> {
    match modrm.reg {
        0 => {
            let value = memory.read16(addr)? as i16 as f64;
            cpu.fpu.push(value);
        }
        2 => memory.write16(addr, round_i32(cpu.fpu.get(0)) as u16)?,
        3 => {
            let value = cpu.fpu.pop();
            memory.write16(addr, round_i32(value) as u16)?;
        }
        5 => {
            let value = memory.read64(addr)? as i64 as f64;
            cpu.fpu.push(value);
        }
        7 => {
            let value = cpu.fpu.pop();
            memory.write64(addr, round_i64(value) as u64)?;
        }
        _ => return Err(unsupported(0xDF, modrm, at)), // BCD forms
    }
    Ok(())
}

/// Round to nearest even, the power-on rounding mode.
fn round_i32(value: f64) -> i32 {
    value.round_ties_even() as i32
}

fn round_i64(value: f64) -> i64 {
    value.round_ties_even() as i64
}

// ── register forms ──

fn reg_d8(cpu: &mut Cpu, modrm: ModRm) -> Result<(), Error> {
    let i = modrm.rm as usize;
    let st0 = cpu.fpu.get(0);
    let sti = cpu.fpu.get(i);
    match modrm.reg {
        2 => cpu.fpu.compare(st0, sti),
        3 => {
            cpu.fpu.compare(st0, sti);
            cpu.fpu.pop();
        }
        reg => cpu.fpu.set(0, dyadic(reg, st0, sti)),
    }
    Ok(())
}

fn reg_d9(cpu: &mut Cpu, modrm: ModRm, at: u32) -> Result<(), Error> {
    let i = modrm.rm as usize;
    match (modrm.reg, modrm.rm) {
        (0, _) => {
            let value = cpu.fpu.get(i);
            cpu.fpu.push(value);
        }
        (1, _) => {
            let st0 = cpu.fpu.get(0);
            let sti = cpu.fpu.get(i);
            cpu.fpu.set(0, sti);
            cpu.fpu.set(i, st0);
        }
        (2, 0) => {} // FNOP
        (4, 0) => {
            let st0 = cpu.fpu.get(0);
            cpu.fpu.set(0, -st0);
        }
        (4, 1) => {
            let st0 = cpu.fpu.get(0);
            cpu.fpu.set(0, st0.abs());
        }
        (4, 4) => {
            let st0 = cpu.fpu.get(0);
            cpu.fpu.compare(st0, 0.0);
        }
        (4, 5) => {
            let st0 = cpu.fpu.get(0);
            fxam(cpu, st0);
        }
        (5, constant) => {
            let value = match constant {
                0 => 1.0,
                1 => 10f64.log2(),
                2 => std::f64::consts::LOG2_E,
                3 => std::f64::consts::PI,
                4 => std::f64::consts::LOG10_2,
                5 => std::f64::consts::LN_2,
                6 => 0.0,
                _ => return Err(unsupported(0xD9, modrm, at)),
            };
            cpu.fpu.push(value);
        }
        (6, 0) => {
            let st0 = cpu.fpu.get(0);
            cpu.fpu.set(0, st0.exp2() - 1.0);
        }
        (6, 1) => {
            let st0 = cpu.fpu.get(0);
            let st1 = cpu.fpu.get(1);
            cpu.fpu.set(1, st1 * st0.log2());
            cpu.fpu.pop();
        }
        (6, 2) => {
            let st0 = cpu.fpu.get(0);
            cpu.fpu.set(0, st0.tan());
            cpu.fpu.push(1.0);
        }
        (6, 3) => {
            let st0 = cpu.fpu.get(0);
            let st1 = cpu.fpu.get(1);
            cpu.fpu.set(1, st1.atan2(st0));
            cpu.fpu.pop();
        }
        (6, 6) => {
            cpu.fpu.top = (cpu.fpu.top + 7) & 7;
            cpu.fpu.status = (cpu.fpu.status & !0x3800) | ((cpu.fpu.top as u16) << 11);
        }
        (6, 7) => {
            cpu.fpu.top = (cpu.fpu.top + 1) & 7;
            cpu.fpu.status = (cpu.fpu.status & !0x3800) | ((cpu.fpu.top as u16) << 11);
        }
        (7, 0) => {
            let st0 = cpu.fpu.get(0);
            let st1 = cpu.fpu.get(1);
            cpu.fpu.set(0, st0 % st1);
            // Reduction always completes at f64 range.
            cpu.fpu.set_conditions(false, false, false);
        }
        (7, 2) => {
            let st0 = cpu.fpu.get(0);
            cpu.fpu.set(0, st0.sqrt());
        }
        (7, 3) => {
            let st0 = cpu.fpu.get(0);
            cpu.fpu.set(0, st0.sin());
            cpu.fpu.push(st0.cos());
        }
        (7, 4) => {
            let st0 = cpu.fpu.get(0);
            cpu.fpu.set(0, st0.round_ties_even());
        }
        (7, 5) => {
            let st0 = cpu.fpu.get(0);
            let st1 = cpu.fpu.get(1);
            cpu.fpu.set(0, st0 * st1.trunc().exp2());
        }
        (7, 6) => {
            let st0 = cpu.fpu.get(0);
            cpu.fpu.set(0, st0.sin());
        }
        (7, 7) => {
            let st0 = cpu.fpu.get(0);
            cpu.fpu.set(0, st0.cos());
        }
        _ => return Err(unsupported(0xD9, modrm, at)),
    }
    Ok(())
}

/// FXAM condition classes over the f64 domain: C3/C2/C0.
fn fxam(cpu: &mut Cpu, value: f64) {
    if cpu.fpu.is_empty(0) {
        cpu.fpu.set_conditions(true, false, true);
    } else if value.is_nan() {
        cpu.fpu.set_conditions(false, false, true);
    } else if value.is_infinite() {
        cpu.fpu.set_conditions(false, true, true);
    } else if value == 0.0 {
        cpu.fpu.set_conditions(true, false, false);
    } else if value.is_subnormal() {
        cpu.fpu.set_conditions(true, true, false);
    } else {
        cpu.fpu.set_conditions(false, true, false);
    }
}

fn reg_da(cpu: &mut Cpu, modrm: ModRm, at: u32) -> Result<(), Error> {
    if modrm.reg == 5 && modrm.rm == 1 {
        // FUCOMPP
        let st0 = cpu.fpu.get(0);
        let st1 = cpu.fpu.get(1);
        cpu.fpu.compare(st0, st1);
        cpu.fpu.pop();
        cpu.fpu.pop();
        Ok(())
    } else {
        Err(unsupported(0xDA, modrm, at))
    }
}

fn reg_db(cpu: &mut Cpu, modrm: ModRm, at: u32) -> Result<(), Error> {
    match (modrm.reg, modrm.rm) {
        (4, 2) => {
            // FNCLEX: drop the sticky exception and busy bits.
            cpu.fpu.status &= !0x80FF;
            Ok(())
        }
        (4, 3) => {
            cpu.fpu.reset();
            Ok(())
        }
        _ => Err(unsupported(0xDB, modrm, at)),
    }
}

/// DC register forms target ST(i); the SUB/DIV directions mirror the
/// memory encodings.
fn dc_result(reg: u8, st0: f64, sti: f64) -> f64 {
    match reg {
        0 => sti + st0,
        1 => sti * st0,
        4 => st0 - sti,
        5 => sti - st0,
        6 => st0 / sti,
        _ => sti / st0,
    }
}

fn reg_dc(cpu: &mut Cpu, modrm: ModRm, at: u32) -> Result<(), Error> {
    if modrm.reg == 2 || modrm.reg == 3 {
        return Err(unsupported(0xDC, modrm, at));
    }
    let i = modrm.rm as usize;
    let st0 = cpu.fpu.get(0);
    let sti = cpu.fpu.get(i);
    cpu.fpu.set(i, dc_result(modrm.reg, st0, sti));
    Ok(())
}

fn reg_dd(cpu: &mut Cpu, modrm: ModRm, at: u32) -> Result<(), Error> {
    let i = modrm.rm as usize;
    match modrm.reg {
        0 => {
            cpu.fpu.free(i);
            Ok(())
        }
        2 => {
            let st0 = cpu.fpu.get(0);
            cpu.fpu.set(i, st0);
            Ok(())
        }
        3 => {
            let st0 = cpu.fpu.get(0);
            cpu.fpu.set(i, st0);
            cpu.fpu.pop();
            Ok(())
        }
        4 | 5 => {
            let st0 = cpu.fpu.get(0);
            let sti = cpu.fpu.get(i);
            cpu.fpu.compare(st0, sti);
            if modrm.reg == 5 {
                cpu.fpu.pop();
            }
            Ok(())
        }
        _ => Err(unsupported(0xDD, modrm, at)),
    }
}

fn reg_de(cpu: &mut Cpu, modrm: ModRm, at: u32) -> Result<(), Error> {
    if modrm.reg == 3 {
        if modrm.rm == 1 {
            // FCOMPP
            let st0 = cpu.fpu.get(0);
            let st1 = cpu.fpu.get(1);
            cpu.fpu.compare(st0, st1);
            cpu.fpu.pop();
            cpu.fpu.pop();
            return Ok(());
        }
        return Err(unsupported(0xDE, modrm, at));
    }
    if modrm.reg == 2 {
        return Err(unsupported(0xDE, modrm, at));
    }

    let i = modrm.rm as usize;
    let st0 = cpu.fpu.get(0);
    let sti = cpu.fpu.get(i);
    cpu.fpu.set(i, dc_result(modrm.reg, st0, sti));
    cpu.fpu.pop();
    Ok(())
}

fn reg_df(cpu: &mut Cpu, modrm: ModRm, at: u32) -> Result<(), Error> {
    if modrm.reg == 4 && modrm.rm == 0 {
        // FNSTSW AX
        let status = cpu.fpu.status;
        cpu.set_reg(crate::cpu::OpSize::Word, EAX as u8, status.into());
        Ok(())
    } else {
        Err(unsupported(0xDF, modrm, at))
    }
}
