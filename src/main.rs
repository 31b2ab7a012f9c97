use std::io::{self, Write};
use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::error;

use nusa::{Driver, DriverOptions, InterpretResult, VM};

/// Runs NusantaraScript files, or starts a REPL when none are given.
#[derive(Parser, Debug)]
#[command(name = "nusa", version, about)]
struct Args {
    /// Compile breakpoints (`# BP`) and stop at them in the console debugger
    #[arg(long)]
    debug: bool,

    /// Print the bytecode listing before running
    #[arg(long)]
    disassemble: bool,

    /// Entry scripts; their imports are resolved relative to each file
    scripts: Vec<PathBuf>,
}

fn repl() {
    let mut vm = VM::new();
    let mut line = String::new();
    loop {
        print!("> ");
        if let Err(e) = io::stdout().flush() {
            error!("Error flushing prompt: {e}");
        }

        line.clear();
        match io::stdin().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => match vm.interpret(&line) {
                InterpretResult::InterpretCompileError => process::exit(65),
                InterpretResult::InterpretRuntimeError => process::exit(70),
                InterpretResult::InterpretOk => (),
            },
            Err(e) => eprintln!("Error reading line: {e}"),
        }
    }
}

fn run_files(options: DriverOptions, scripts: &[PathBuf]) {
    if let Err(e) = Driver::boot(options, scripts) {
        eprintln!("{e}");
        process::exit(e.exit_code());
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            process::exit(64);
        }
        Err(e) => {
            let _ = e.print();
            process::exit(0);
        }
    };

    if args.scripts.is_empty() {
        repl();
    } else {
        let options = DriverOptions { debug: args.debug, disassemble: args.disassemble };
        run_files(options, &args.scripts);
    }
}
