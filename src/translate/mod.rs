//! The translation pipeline.
//!
//! One pass over a parsed Wasm module: the planner orders the reachable
//! functions so callees come first, the layout allocator pins every
//! global to a word address, each function body is lowered by
//! [`func::translate_function`], and the program entry block is
//! assembled from globals initialization, data segment initialization,
//! WASI method initialization and one `Exec` per entry function.
//!
//! Errors accumulate: a function that fails to translate does not stop
//! the remaining functions from being checked, and all collected errors
//! are returned together.

use parity_wasm::elements::{GlobalEntry, Module, ValueType};

use crate::{
    error::{Error, ErrorKind},
    layout::MemoryLayout,
    masm,
    plan::{self, ModuleContext},
    wasi::{self, WasiInstr, WasiMethod},
};

mod func;

#[cfg(test)]
mod tests;

/// Translates a parsed Wasm module into a MASM module.
///
/// This is the crate's main entry point. On failure every collected
/// error is returned; module-level problems (no entry function, an
/// unsupported global type) abort early.
pub fn translate_module(module: &Module) -> Result<masm::Module, Vec<Error>> {
    use crate::masm::Instruction::*;

    let ctx = ModuleContext::new(module);
    let entries = plan::entries(&ctx).map_err(|error| vec![error])?;
    let order = plan::emit_order(&ctx, &entries);

    let mut errors = Vec::new();

    if module
        .memory_section()
        .map(|section| section.entries().len())
        .unwrap_or(0)
        > 1
    {
        errors.push(Error::new(ErrorKind::MultipleMemories));
    }

    // Resolve the imported functions in use against the WASI registry and
    // collect their named globals in discovery order.
    let mut methods: Vec<(u32, WasiMethod)> = Vec::new();
    let mut wasi_globals: Vec<&str> = Vec::new();
    for &index in &order {
        if let Some(entry) = ctx.import(index) {
            match wasi::resolve(entry.module(), entry.field()) {
                Some(method) => {
                    for &name in method.globals {
                        if !wasi_globals.contains(&name) {
                            wasi_globals.push(name);
                        }
                    }
                    methods.push((index, method));
                }
                None => errors.push(Error::new(ErrorKind::BadImport {
                    module: entry.module().to_string(),
                    field: entry.field().to_string(),
                })),
            }
        }
    }

    let globals: Vec<GlobalEntry> = module
        .global_section()
        .map(|section| section.entries().to_vec())
        .unwrap_or_default();
    let layout = match MemoryLayout::new(&wasi_globals, &globals) {
        Ok(layout) => layout,
        Err(error) => {
            errors.push(error);
            return Err(errors);
        }
    };

    let mut procedures = Vec::new();
    for &index in &order {
        if ctx.is_import(index) {
            if let Some((_, method)) = methods.iter().find(|(i, _)| *i == index) {
                match wasi_code(&method.body, &layout) {
                    Ok(body) => procedures.push((
                        ModuleContext::proc_name(index),
                        masm::Proc {
                            locals: method.locals,
                            body,
                        },
                    )),
                    Err(error) => errors.push(error),
                }
            }
        } else if ctx.is_elided(index) {
            // Empty bodies are not emitted; calls to them compile to
            // argument drops.
        } else {
            match func::translate_function(&ctx, &layout, index) {
                Ok(proc) => procedures.push((ModuleContext::proc_name(index), proc)),
                Err(error) => errors.push(error),
            }
        }
    }

    let mut program = Vec::new();

    // Globals take their initializer values before anything runs.
    for (index, entry) in globals.iter().enumerate() {
        match func::translate_init_expr(
            &ctx,
            &layout,
            func::Frame::GlobalsInit,
            entry.init_expr().code(),
        ) {
            Ok((code, stack)) => {
                let (ty, addr) = layout
                    .global(index as u32)
                    .expect("the layout covers every global section entry");
                if stack != [ty] {
                    errors.push(Error::new(ErrorKind::ExpectedStack(vec![ty])));
                    continue;
                }
                program.extend(code);
                program.extend(func::global_store(ty, addr));
            }
            Err(error) => errors.push(error),
        }
    }

    // Data segments are written into linear memory one packed word at a
    // time, little-endian, the trailing partial chunk zero-padded.
    for segment in module
        .data_section()
        .map(|section| section.entries())
        .unwrap_or(&[])
    {
        if segment.index() != 0 {
            errors.push(Error::new(ErrorKind::MultipleMemories));
            continue;
        }
        let offset_expr = segment
            .offset()
            .as_ref()
            .expect("passive segments do not exist in Wasm 1.0");
        match func::translate_init_expr(&ctx, &layout, func::Frame::DatasInit, offset_expr.code())
        {
            Ok((code, stack)) => {
                if stack != [ValueType::I32] {
                    errors.push(Error::new(ErrorKind::ExpectedStack(vec![ValueType::I32])));
                    continue;
                }
                program.extend(code);
                program.push(Push(4));
                program.push(IDiv);
                program.push(Push(layout.mem_beginning()));
                program.push(IAdd);
                for chunk in segment.value().chunks(4) {
                    let mut bytes = [0u8; 4];
                    bytes[..chunk.len()].copy_from_slice(chunk);
                    program.push(Dup(0));
                    program.push(Push(u32::from_le_bytes(bytes)));
                    program.push(Swap(1));
                    program.push(MemStore(None));
                    program.push(Drop);
                    program.push(Push(1));
                    program.push(IAdd);
                }
                program.push(Drop);
            }
            Err(error) => errors.push(error),
        }
    }

    // WASI methods initialize their named globals next.
    for (_, method) in &methods {
        match wasi_code(&method.init, &layout) {
            Ok(code) => program.extend(code),
            Err(error) => errors.push(error),
        }
    }

    for &entry in &entries {
        if ctx.is_elided(entry) {
            continue;
        }
        program.push(Exec(ModuleContext::proc_name(entry)));
    }

    if !errors.is_empty() {
        return Err(errors);
    }
    Ok(masm::Module {
        imports: vec!["std::sys".to_string(), "std::math::u64".to_string()],
        procedures,
        program,
    })
}

/// Resolves a WASI pseudo-instruction sequence against the layout's
/// named-global addresses.
fn wasi_code(
    instructions: &[WasiInstr],
    layout: &MemoryLayout,
) -> Result<Vec<masm::Instruction>, Error> {
    let mut code = Vec::new();
    for instruction in instructions {
        match instruction {
            WasiInstr::M(instruction) => code.push(instruction.clone()),
            WasiInstr::Load(name) => {
                code.push(masm::Instruction::MemLoad(Some(named_global(layout, name)?)));
            }
            WasiInstr::Store(name) => {
                code.push(masm::Instruction::MemStore(Some(named_global(layout, name)?)));
                code.push(masm::Instruction::Drop);
            }
        }
    }
    Ok(code)
}

fn named_global(layout: &MemoryLayout, name: &str) -> Result<u32, Error> {
    layout.wasi_global(name).ok_or_else(|| {
        Error::new(ErrorKind::BadNamedGlobalRef(name.to_string()))
            .in_context("imported method".to_string())
    })
}
