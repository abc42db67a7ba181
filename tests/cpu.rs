mod common;

use common::PeBuilder;
use pe_emu::cpu::{flags, Cpu, EAX, EBP, ECX, EDI, ESI, ESP};
use pe_emu::image::Image;
use pe_emu::loader::Loader;
use pe_emu::memory::Memory;
use pe_emu::Error;
use std::cell::Cell;
use std::rc::Rc;

/// Parse, load, and run the classic three-NOPs-and-a-RET image. The RET
/// consumes the sentinel the test pushed, so the guest "returns" to an
/// address outside memory and the exception hook observes it.
#[test]
fn minimal_pe_round_trip() {
    let image = Image::parse(
        PeBuilder::new(0x40_0000)
            .entry(0x1000)
            .section(".text", 0x1000, vec![0x90, 0x90, 0x90, 0xC3])
            .build(),
    )
    .unwrap();

    let mut memory = Memory::new(0x80_0000);
    let mut loader = Loader::new(Vec::new());
    let entry = loader.bind_main(&mut memory, image).unwrap();
    assert_eq!(entry, 0x40_1000);

    let mut cpu = Cpu::new();
    cpu.eip = entry;
    cpu.regs[ESP] = 0x70_0000;
    cpu.push32(&mut memory, 0xDEAD_BEEF).unwrap();
    cpu.set_exception_hook(Box::new(|_err, cpu, _mem| {
        cpu.halted = true;
        Ok(())
    }));

    cpu.run(&mut memory, 10).unwrap();
    assert_eq!(cpu.eip, 0xDEAD_BEEF);
    assert_eq!(cpu.steps, 4);
    assert_eq!(cpu.regs[ESP], 0x70_0000);
}

/// FS-relative load through a host-installed segment base.
#[test]
fn fs_relative_load_reads_through_the_base() {
    let mut memory = Memory::new(0x4001_0000);
    memory.write32(0x4000_0018, 0xCAFE_BABE).unwrap();
    memory
        .load(0x100, &[0x64, 0xA1, 0x18, 0x00, 0x00, 0x00]) // MOV EAX, FS:[0x18]
        .unwrap();

    let mut cpu = Cpu::new();
    cpu.fs_base = Some(0x4000_0000);
    cpu.eip = 0x100;
    cpu.step(&mut memory).unwrap();

    assert_eq!(cpu.regs[EAX], 0xCAFE_BABE);
    assert!(cpu.prefixes.segment.is_none());
    assert!(!cpu.prefixes.operand_size);
}

/// An unregistered opcode reaches the exception hook exactly once, with
/// the faulting address attached.
#[test]
fn unknown_opcode_reaches_the_hook_once() {
    let mut memory = Memory::new(0x1000);
    memory.load(0x200, &[0xFE, 0xFF]).unwrap();

    let mut cpu = Cpu::new();
    cpu.eip = 0x200;

    let calls = Rc::new(Cell::new(0u32));
    let seen = calls.clone();
    cpu.set_exception_hook(Box::new(move |err, cpu, _mem| {
        seen.set(seen.get() + 1);
        match err {
            Error::UnknownOpcode { opcode, eip } => {
                assert_eq!(*opcode, 0xFE);
                assert_eq!(*eip, 0x200);
            }
            other => panic!("expected UnknownOpcode, got {other:?}"),
        }
        cpu.halted = true;
        Ok(())
    }));

    cpu.run(&mut memory, 10).unwrap();
    assert_eq!(calls.get(), 1);
}

/// REP MOVSD moves the whole block in one architectural step.
#[test]
fn rep_movsd_copies_256_bytes() {
    let mut memory = Memory::new(0x1000);
    for i in 0..256u32 {
        memory.write8(0x400 + i, (i as u8).wrapping_mul(7)).unwrap();
    }
    memory.load(0x100, &[0xF3, 0xA5]).unwrap();

    let mut cpu = Cpu::new();
    cpu.eip = 0x100;
    cpu.regs[ESI] = 0x400;
    cpu.regs[EDI] = 0x800;
    cpu.regs[ECX] = 64;
    cpu.set_flag(flags::DF, false);
    cpu.step(&mut memory).unwrap();

    for i in 0..256u32 {
        assert_eq!(
            memory.read8(0x800 + i).unwrap(),
            memory.read8(0x400 + i).unwrap()
        );
    }
    assert_eq!(cpu.regs[ECX], 0);
    assert_eq!(cpu.regs[ESI], 0x500);
    assert_eq!(cpu.regs[EDI], 0x900);
    assert_eq!(cpu.steps, 1);
}

/// ADD flag semantics over a spread of operand pairs.
#[test]
fn add_flag_invariants_hold() {
    let cases: &[(u32, u32)] = &[
        (0, 0),
        (1, 1),
        (0xFFFF_FFFF, 1),
        (0xFFFF_FFFF, 0xFFFF_FFFF),
        (0x7FFF_FFFF, 1),
        (0x8000_0000, 0x8000_0000),
        (0x1234_5678, 0x8765_4321),
    ];

    for &(a, b) in cases {
        let mut cpu = Cpu::new();
        let mut memory = Memory::new(0x1000);
        cpu.regs[EAX] = a;
        cpu.regs[ECX] = b;
        memory.load(0x100, &[0x01, 0xC8]).unwrap(); // ADD EAX, ECX
        cpu.eip = 0x100;
        cpu.step(&mut memory).unwrap();

        let wide = u64::from(a) + u64::from(b);
        assert_eq!(cpu.regs[EAX], wide as u32);
        assert_eq!(cpu.flag(flags::ZF), wide as u32 == 0, "ZF for {a:#x}+{b:#x}");
        assert_eq!(cpu.flag(flags::CF), wide > u64::from(u32::MAX), "CF for {a:#x}+{b:#x}");
        let overflow = (a ^ b) & 0x8000_0000 == 0 && (a ^ wide as u32) & 0x8000_0000 != 0;
        assert_eq!(cpu.flag(flags::OF), overflow, "OF for {a:#x}+{b:#x}");
    }
}

/// Push/pop round trip, any value, ESP restored.
#[test]
fn stack_round_trip() {
    let mut cpu = Cpu::new();
    let mut memory = Memory::new(0x1000);
    cpu.regs[ESP] = 0x800;

    for value in [0u32, 1, 0xDEAD_BEEF, u32::MAX] {
        cpu.push32(&mut memory, value).unwrap();
        assert_eq!(cpu.pop32(&memory).unwrap(), value);
        assert_eq!(cpu.regs[ESP], 0x800);
    }
}

/// FPU stack discipline: after push x, push y, pop — ST(0) is x again,
/// TOP sits one below where it started, and the slot is tagged valid.
#[test]
fn fpu_stack_discipline() {
    let mut cpu = Cpu::new();
    let initial_top = cpu.fpu.top;

    cpu.fpu.push(1.25);
    cpu.fpu.push(9.5);
    assert_eq!(cpu.fpu.pop(), 9.5);

    assert_eq!(cpu.fpu.get(0), 1.25);
    assert_eq!(cpu.fpu.top, (initial_top + 7) & 7);
    assert!(!cpu.fpu.is_empty(0));
    assert_eq!((cpu.fpu.status >> 11) as usize & 7, cpu.fpu.top);
}

/// A tight call/loop body runs to its HLT: exercises CALL, Jcc, INC, CMP
/// and the step accounting together.
#[test]
fn loop_until_halt() {
    // xor eax,eax ; inc eax ; cmp eax, 5 ; jne -6 ; hlt
    let code = [0x31, 0xC0, 0x40, 0x83, 0xF8, 0x05, 0x75, 0xFA, 0xF4];
    let mut memory = Memory::new(0x1000);
    memory.load(0x100, &code).unwrap();

    let mut cpu = Cpu::new();
    cpu.eip = 0x100;
    let executed = cpu.run(&mut memory, 1000).unwrap();
    assert!(cpu.halted);
    assert_eq!(cpu.regs[EAX], 5);
    // 1 xor + 5 * (inc, cmp, jne) + 1 hlt
    assert_eq!(executed, 17);
}

/// Guest divide faults surface through the hook and leave state
/// inspectable.
#[test]
fn divide_fault_routes_to_the_hook() {
    let mut memory = Memory::new(0x1000);
    memory.load(0x100, &[0x31, 0xC9, 0xF7, 0xF1]).unwrap(); // XOR ECX,ECX; DIV ECX

    let mut cpu = Cpu::new();
    cpu.eip = 0x100;
    cpu.regs[EBP] = 0x1234;
    cpu.set_exception_hook(Box::new(|err, cpu, _mem| {
        assert!(matches!(err, Error::DivideFault { eip: 0x102 }));
        cpu.halted = true;
        Ok(())
    }));
    cpu.run(&mut memory, 10).unwrap();
    assert!(cpu.halted);
    assert_eq!(cpu.regs[EBP], 0x1234);
}
