use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::{fs, process};

use clap::Parser;

use kern::{
    BytecodeBuilder, HeapCreateInfo, Interpreter, InterpreterCreateInfo, Op, VmError,
};

/// Register bytecode virtual machine.
#[derive(Debug, Parser)]
#[command(name = "kern", version, about)]
struct Args {
    /// Bytecode image of raw little-endian 32-bit words. Runs a
    /// built-in demo program when omitted.
    image: Option<PathBuf>,

    /// Live-object count that triggers the first collection.
    #[arg(long)]
    collect_threshold: Option<usize>,

    /// Maximum number of simultaneously active frames.
    #[arg(long)]
    frame_capacity: Option<usize>,

    /// Total slot count of the locals arena.
    #[arg(long)]
    locals_capacity: Option<usize>,

    /// Window length of the root frame (the globals table).
    #[arg(long)]
    global_slots: Option<usize>,
}

/// Recursive factorial plus an array round trip, exercising calls,
/// jumps, arithmetic, allocation and printing.
fn demo_program() -> Box<[u32]> {
    let mut b = BytecodeBuilder::new();

    // fact(n): n <= 1 -> 1, else n * fact(n - 1)
    b.op(Op::StoreFun).reg(1);
    let end = b.forward_loc();
    b.word(4);
    b.op(Op::JumpIfLessEqualNum);
    let base_case = b.forward_loc();
    b.reg(0).num(1);
    b.op(Op::SubNum).reg(1).reg(0).num(1);
    b.op(Op::Rec).reg(2).count(1).reg(1);
    b.op(Op::Mul).reg(3).reg(0).reg(2);
    b.op(Op::Return).reg(3);
    b.bind(base_case);
    b.op(Op::StoreNum).reg(3).num(1);
    b.op(Op::Return).reg(3);
    b.bind(end);

    b.op(Op::StoreNum).reg(2).num(10);
    b.op(Op::Call).reg(3).reg(1).count(1).reg(2);
    b.op(Op::Println).reg(3);
    b.op(Op::StoreBool).reg(4).boolean(true);
    b.op(Op::Array).reg(5).count(2).reg(3).reg(4);
    b.op(Op::Println).reg(5);
    b.op(Op::Exit);

    b.into_words()
}

fn load_image(path: &Path) -> io::Result<Box<[u32]>> {
    let bytes = fs::read(path)?;
    if bytes.len() % 4 != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "image length is not a multiple of 4 bytes",
        ));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Ok(words.into_boxed_slice())
}

fn run(args: &Args) -> Result<(), VmError> {
    let code = match &args.image {
        Some(path) => load_image(path).unwrap_or_else(|err| {
            eprintln!("kern: {}: {err}", path.display());
            process::exit(2);
        }),
        None => demo_program(),
    };

    let info = InterpreterCreateInfo {
        frame_capacity: args.frame_capacity,
        locals_capacity: args.locals_capacity,
        global_slots: args.global_slots,
        heap: HeapCreateInfo {
            collect_threshold: args.collect_threshold,
        },
    };

    let stdin = io::stdin().lock();
    let stdout = io::stdout().lock();
    let mut interpreter = Interpreter::new(code, stdin, stdout, info)?;
    interpreter.run()
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("kern: {err}");
            ExitCode::FAILURE
        }
    }
}
