//! hetrt command-line tool: compile kernel-language files and list devices.

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};

use hetrt::jit::{CompilationRequest, Jit, JitConfig, OptLevel, PreludeSource};
use hetrt::runtime::Runtime;
use hetrt::CompileFailure;

#[derive(Parser, Debug)]
#[command(author, version, about = "hetrt JIT and device inspection tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile a source file and print or run the result.
    Compile(CompileArgs),
    /// List the devices of the host runtime.
    Devices,
}

#[derive(Parser, Debug)]
struct CompileArgs {
    /// Source file to compile.
    #[arg(value_name = "FILE")]
    input: PathBuf,
    /// Exported function to look up (and call with --emit run).
    #[arg(long, default_value = "main")]
    entry: String,
    /// Optimization level 0-3.
    #[arg(long, default_value_t = 2)]
    opt: u32,
    /// What to produce.
    #[arg(long, value_enum, default_value = "ir")]
    emit: Emit,
    /// i64 arguments passed to the entry with --emit run.
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    args: Vec<i64>,
    /// Compile without the built-in prelude.
    #[arg(long)]
    no_prelude: bool,
    /// Shared libraries to link before compiling.
    #[arg(long = "link", value_name = "LIB")]
    libraries: Vec<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Emit {
    /// Optimized IR.
    Ir,
    /// Disassembly of the entry function.
    Asm,
    /// Call the entry as `fn(i64, ...) -> i64` and print the result.
    Run,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Compile(args) => compile(args),
        Command::Devices => devices(),
    };
    if let Err(message) = result {
        eprintln!("error: {}", message);
        process::exit(1);
    }
}

fn report(failure: CompileFailure) -> String {
    if !failure.diagnostics.is_empty() {
        eprint!("{}", failure.diagnostics);
    }
    failure.to_string()
}

fn compile(args: CompileArgs) -> Result<(), String> {
    let source = fs::read_to_string(&args.input)
        .map_err(|e| format!("cannot read {}: {}", args.input.display(), e))?;
    let opt = OptLevel::try_from(args.opt).map_err(|e| e.to_string())?;

    let mut config = JitConfig::from_env();
    if args.no_prelude {
        config.prelude = PreludeSource::Disabled;
    }
    let jit = Jit::new(config);
    for library in &args.libraries {
        jit.link(library).map_err(|e| e.to_string())?;
    }

    let module_name = args
        .input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("jit")
        .to_string();
    let request = CompilationRequest::new(source, &args.entry)
        .module_name(module_name)
        .opt(opt);

    match args.emit {
        Emit::Ir => {
            let ir = jit.emit_ir(&request).map_err(report)?;
            print!("{}", ir);
        }
        Emit::Asm => {
            let object = jit.emit_object(&request).map_err(report)?;
            let listing = object.disassemble(&args.entry).map_err(|e| e.to_string())?;
            print!("{}", listing);
        }
        Emit::Run => {
            let artifact = jit.compile(&request).map_err(report)?;
            print!("{}", artifact.diagnostics());
            let a = &args.args;
            // SAFETY: the user asserts the entry takes `a.len()` i64 arguments and returns i64.
            let value = unsafe {
                match a.len() {
                    0 => artifact.function::<unsafe extern "C" fn() -> i64>().map(|f| f.call()),
                    1 => artifact
                        .function::<unsafe extern "C" fn(i64) -> i64>()
                        .map(|f| f.call(a[0])),
                    2 => artifact
                        .function::<unsafe extern "C" fn(i64, i64) -> i64>()
                        .map(|f| f.call(a[0], a[1])),
                    3 => artifact
                        .function::<unsafe extern "C" fn(i64, i64, i64) -> i64>()
                        .map(|f| f.call(a[0], a[1], a[2])),
                    4 => artifact
                        .function::<unsafe extern "C" fn(i64, i64, i64, i64) -> i64>()
                        .map(|f| f.call(a[0], a[1], a[2], a[3])),
                    n => return Err(format!("at most 4 arguments are supported, got {}", n)),
                }
            }
            .map_err(|e| e.to_string())?;
            println!("{}", value);
            log::info!("{}", artifact.stats());
        }
    }
    Ok(())
}

fn devices() -> Result<(), String> {
    let runtime = Runtime::with_host_platform().map_err(|e| e.to_string())?;
    for device in runtime.devices().map_err(|e| e.to_string())? {
        println!(
            "{:>3}  {:<8} #{}  {}",
            device.id.0, device.platform, device.local_index, device.info.name
        );
    }
    Ok(())
}
