use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use rill::diagnostic::{Diagnostic, ansi::AnsiRenderer, json};
use rill::{InterpretError, Vm};

const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;
const EX_IOERR: u8 = 74;

#[derive(Parser)]
#[command(name = "rill", version, about = "The rill language: run a script or start a REPL")]
struct Cli {
    /// Script file to run; omit to start a REPL
    script: Option<PathBuf>,

    /// Print the compiled bytecode listing instead of executing
    #[arg(long)]
    dump: bool,

    /// Emit diagnostics as JSON, one object per line
    #[arg(long)]
    json: bool,

    /// Collect garbage at every allocation point (collector stress test)
    #[arg(long)]
    gc_stress: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let mut vm = Vm::new();
    if cli.gc_stress {
        vm.set_gc_stress(true);
    }

    match &cli.script {
        Some(path) => run_file(&mut vm, path, &cli),
        None => repl(&mut vm, &cli),
    }
}

fn run_file(vm: &mut Vm, path: &PathBuf, cli: &Cli) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("error reading {}: {e}", path.display());
            return ExitCode::from(EX_IOERR);
        }
    };

    let result = if cli.dump {
        vm.compile_to_listing(&source).map(|listing| print!("{listing}"))
    } else {
        vm.interpret(&source)
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => report(&error, &source, cli),
    }
}

fn repl(vm: &mut Vm, cli: &Cli) -> ExitCode {
    let stdin = std::io::stdin();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        match stdin.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        if line.trim().is_empty() {
            continue;
        }
        // Errors are reported but never end the session.
        if let Err(error) = vm.interpret(&line) {
            report(&error, &line, cli);
        }
    }
    println!();
    ExitCode::SUCCESS
}

fn report(error: &InterpretError, source: &str, cli: &Cli) -> ExitCode {
    match error {
        InterpretError::Compile(errors) => {
            for e in errors {
                let d = Diagnostic::from_compile_error(e, source);
                if cli.json {
                    eprintln!("{}", json::render(&d));
                } else {
                    let renderer = AnsiRenderer {
                        use_color: std::io::stderr().is_terminal(),
                    };
                    eprint!("{}", renderer.render(&d, source));
                }
            }
            ExitCode::from(EX_DATAERR)
        }
        InterpretError::Runtime(e) => {
            eprintln!("{}", e.message);
            for frame in &e.trace {
                eprintln!("{frame}");
            }
            ExitCode::from(EX_SOFTWARE)
        }
    }
}
