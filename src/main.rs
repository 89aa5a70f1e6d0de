use clap::Parser;
use std::fs;
use std::process::ExitCode;
use wasmite::parser;
use wasmite::parser::module::ModuleFormat;
use wasmite::runtime::{EmptyImporter, ExecutionPolicy, ModuleInstance, SpectestImporter, Value};
use wasmite::wat;

#[derive(Parser)]
#[command(name = "wasmite")]
#[command(about = "WebAssembly module inspector and interpreter")]
struct Cli {
    /// Path to a .wasm (or .wat) module
    file: String,

    /// Invoke an exported function after instantiation
    #[arg(long, value_name = "NAME")]
    run: Option<String>,

    /// Arguments for --run, as i32 values
    #[arg(long = "arg", value_name = "N")]
    args: Vec<i32>,

    /// Dump the module instead of instantiating it
    #[arg(long)]
    dump: bool,

    /// Resolve imports from the built-in spectest namespace
    #[arg(long)]
    spectest: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let module = match load_module(&cli.file) {
        Ok(module) => module,
        Err(message) => {
            eprintln!("Error: {message}");
            return ExitCode::FAILURE;
        }
    };

    if cli.dump {
        print!("{}", module.to_string(ModuleFormat::Details));
        return ExitCode::SUCCESS;
    }

    let policy = ExecutionPolicy::default();
    let spectest = SpectestImporter::new();
    let empty = EmptyImporter;

    let instance = if cli.spectest {
        ModuleInstance::instantiate(&module, &spectest, policy)
    } else {
        ModuleInstance::instantiate(&module, &empty, policy)
    };
    let instance = match instance {
        Ok(instance) => instance,
        Err(e) => {
            eprintln!("Error instantiating {}: {e}", cli.file);
            return ExitCode::FAILURE;
        }
    };

    if let Some(name) = &cli.run {
        let args: Vec<Value> = cli.args.iter().map(|&v| Value::I32(v)).collect();
        match instance.invoke(name, args) {
            Ok(results) => {
                if !results.is_empty() {
                    let rendered: Vec<String> = results.iter().map(ToString::to_string).collect();
                    println!("{}", rendered.join(" "));
                }
            }
            Err(e) => {
                eprintln!("Error running {name}: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    if cli.spectest {
        let output = spectest.output();
        if !output.is_empty() {
            print!("{output}");
        }
    }

    ExitCode::SUCCESS
}

fn load_module(path: &str) -> Result<wasmite::parser::module::Module, String> {
    if path.ends_with(".wat") || path.ends_with(".wast") {
        let source = fs::read_to_string(path).map_err(|e| format!("reading {path}: {e}"))?;
        let (module, diagnostics) = wat::parse_with_diagnostics(&source);
        for diagnostic in diagnostics.entries() {
            eprintln!("{path}: {diagnostic}");
        }
        if diagnostics.has_errors() {
            return Err(format!("assembly of {path} failed"));
        }
        module.ok_or_else(|| format!("no module in {path}"))
    } else {
        let bytes = fs::read(path).map_err(|e| format!("reading {path}: {e}"))?;
        parser::parse(bytes).map_err(|e| format!("parsing {path}: {e}"))
    }
}
