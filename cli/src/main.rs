use std::{fs, path::PathBuf};

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use parity_wasm::{deserialize_buffer, elements::Module};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// The WebAssembly file to compile, binary (`.wasm`) or text (`.wat`).
    #[clap(value_parser)]
    wasm_file: PathBuf,

    /// Where to write the Miden Assembly; stdout when absent.
    #[clap(short, long, value_parser)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let wasm_bytes = read_wasm_or_wat(&args.wasm_file)?;
    let module = deserialize_buffer::<Module>(&wasm_bytes).map_err(|error| {
        anyhow!(
            "failed to parse Wasm module {}: {error}",
            args.wasm_file.display()
        )
    })?;
    let program = translate(&module)?;

    match &args.output {
        Some(path) => fs::write(path, program.to_string())
            .map_err(|error| anyhow!("failed to write {}: {error}", path.display()))?,
        None => print!("{}", program),
    }
    Ok(())
}

/// Returns the contents of the given `.wasm` or `.wat` file as Wasm bytes.
///
/// # Errors
///
/// If `wasm_file` is not a valid `.wasm` or `.wat` file.
fn read_wasm_or_wat(wasm_file: &PathBuf) -> Result<Vec<u8>> {
    let mut file_contents = fs::read(wasm_file)
        .map_err(|_| anyhow!("failed to read Wasm file {}", wasm_file.display()))?;
    if wasm_file.extension().map_or(false, |ext| ext == "wat") {
        let wat = String::from_utf8(file_contents).map_err(|error| {
            anyhow!("failed to read UTF-8 file {}: {error}", wasm_file.display())
        })?;
        file_contents = wat::parse_str(&wat).map_err(|error| {
            anyhow!("failed to parse .wat file {}: {error}", wasm_file.display())
        })?;
    }
    Ok(file_contents)
}

/// Translates the module, rendering every collected error on failure.
fn translate(module: &Module) -> Result<wasmiden::masm::Module> {
    match wasmiden::translate_module(module) {
        Ok(program) => Ok(program),
        Err(errors) => {
            let mut message = String::from("translation failed:");
            for error in &errors {
                message.push_str("\n  ");
                message.push_str(&error.to_string());
            }
            bail!(message)
        }
    }
}
