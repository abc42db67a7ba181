use clap::{arg, command, value_parser};
use pe_emu::cpu::{Cpu, EAX, ESP};
use pe_emu::image::Image;
use pe_emu::loader::Loader;
use pe_emu::memory::Memory;
use std::path::PathBuf;
use std::process::ExitCode;

/// Default stack top, just under the DLL region with room to grow down.
const DEFAULT_STACK_TOP: u32 = 0x1FFF_FFF0;
/// The sentinel return address pushed under the entry point; reaching it
/// means the guest returned from its entry function.
const EXIT_SENTINEL: u32 = 0xFFFF_FFF0;

fn main() -> ExitCode {
    env_logger::init();

    let matches = command!()
        .about("Run a 32-bit PE on the interpreted IA-32 core")
        .arg(arg!(<program> "Path to the guest executable").value_parser(value_parser!(PathBuf)))
        .arg(
            arg!(-s --"search-dir" <DIR> "Directory searched for dependency DLLs (repeatable)")
                .value_parser(value_parser!(PathBuf))
                .action(clap::ArgAction::Append)
                .required(false),
        )
        .arg(
            arg!(--"memory-size" <BYTES> "Guest memory size")
                .value_parser(value_parser!(usize))
                .default_value("1073741824"),
        )
        .arg(
            arg!(--"max-steps" <N> "Instruction cap")
                .value_parser(value_parser!(u64))
                .default_value("100000000"),
        )
        .arg(
            arg!(--"trace-size" <N> "Keep the last N executed instructions")
                .value_parser(value_parser!(usize))
                .default_value("0"),
        )
        .arg(arg!(--headers "Print the parsed headers and exit"))
        .get_matches();

    let program = matches.get_one::<PathBuf>("program").expect("required");
    let memory_size = *matches.get_one::<usize>("memory-size").expect("defaulted");
    let max_steps = *matches.get_one::<u64>("max-steps").expect("defaulted");
    let trace_size = *matches.get_one::<usize>("trace-size").expect("defaulted");

    let image = match Image::from_file(program) {
        Ok(image) => image,
        Err(err) => {
            eprintln!("{}: {err}", program.display());
            return ExitCode::FAILURE;
        }
    };

    if matches.get_flag("headers") {
        print!("{image}");
        return ExitCode::SUCCESS;
    }

    let mut search_dirs: Vec<PathBuf> = matches
        .get_many::<PathBuf>("search-dir")
        .map(|dirs| dirs.cloned().collect())
        .unwrap_or_default();
    if let Some(parent) = program.parent() {
        search_dirs.push(parent.to_path_buf());
    }

    let mut memory = Memory::new(memory_size);
    let mut loader = Loader::new(search_dirs);
    let entry = match loader.bind_main(&mut memory, image) {
        Ok(entry) => entry,
        Err(err) => {
            eprintln!("load failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    for interval in loader.images().iter().map(|img| (img.name.as_str(), img.base)) {
        log::info!("{} at {:#010x}", interval.0, interval.1);
    }

    let mut cpu = Cpu::new();
    cpu.set_trace_capacity(trace_size);
    cpu.eip = entry;
    cpu.regs[ESP] = DEFAULT_STACK_TOP;
    if let Err(err) = cpu.push32(&mut memory, EXIT_SENTINEL) {
        eprintln!("cannot set up the stack: {err}");
        return ExitCode::FAILURE;
    }

    cpu.set_interrupt_hook(Box::new(|vector, cpu, _memory| {
        log::warn!("INT {vector:#04x} with no Win32 layer attached, halting");
        cpu.halted = true;
        Ok(())
    }));
    cpu.set_exception_hook(Box::new(|err, cpu, _memory| {
        if cpu.eip == EXIT_SENTINEL {
            log::info!("guest returned from its entry point");
        } else {
            log::error!("guest fault at eip {:#010x}: {err}", cpu.eip);
        }
        cpu.halted = true;
        Ok(())
    }));

    match cpu.run(&mut memory, max_steps) {
        Ok(executed) => {
            println!(
                "stopped after {executed} steps: eip={:#010x} eax={:#010x} esp={:#010x}",
                cpu.eip, cpu.regs[EAX], cpu.regs[ESP]
            );
        }
        Err(err) => {
            eprintln!("execution failed: {err}");
            return ExitCode::FAILURE;
        }
    }

    if trace_size > 0 {
        for record in cpu.trace_records() {
            println!(
                "{:>8}  {:#010x}  op {:02x}  esp {:#010x}  ebp {:#010x}  eax {:#010x}",
                record.step, record.eip, record.opcode, record.esp, record.ebp, record.eax
            );
        }
    }

    ExitCode::SUCCESS
}
