//! The fixed registry of host functions the translator can satisfy.
//!
//! A Miden program has no host to call out to, so the few WASI entry
//! points that typically appear in `wasm32-wasi` binaries are provided as
//! MASM method bodies. Each method may own named globals; the layout
//! allocator assigns those one word each, and the method's `init`
//! sequence runs in the program entry block before any entry function.

use crate::masm::Instruction;

/// One instruction of a WASI method body.
///
/// `Load`/`Store` refer to the method's named globals and are resolved to
/// absolute addresses once the memory layout is known; `M` is emitted
/// verbatim.
#[derive(Debug, Clone)]
pub enum WasiInstr {
    M(Instruction),
    Load(&'static str),
    Store(&'static str),
}

/// A host function expressed in MASM.
pub struct WasiMethod {
    /// Local cells of the emitted procedure.
    pub locals: u32,
    /// Named globals the method may `Load`/`Store`.
    pub globals: &'static [&'static str],
    /// Run once in the program entry block.
    pub init: Vec<WasiInstr>,
    /// The procedure body.
    pub body: Vec<WasiInstr>,
}

/// Looks up a host method by import module and field name.
pub fn resolve(module: &str, field: &str) -> Option<WasiMethod> {
    use self::WasiInstr::{Load, Store, M};

    match (module, field) {
        // proc_exit(code) records the exit status and halts the VM.
        ("wasi_snapshot_preview1", "proc_exit") => Some(WasiMethod {
            locals: 0,
            globals: &["status_code"],
            init: vec![M(Instruction::Push(0)), Store("status_code")],
            body: vec![
                Store("status_code"),
                M(Instruction::Push(0)),
                M(Instruction::Assert),
            ],
        }),
        // fd_write(fd, iovs, iovs_len, nwritten) has nowhere to write to;
        // the arguments are discarded and success is reported.
        ("wasi_snapshot_preview1", "fd_write") => Some(WasiMethod {
            locals: 0,
            globals: &[],
            init: vec![],
            body: vec![
                M(Instruction::Drop),
                M(Instruction::Drop),
                M(Instruction::Drop),
                M(Instruction::Drop),
                M(Instruction::Push(0)),
            ],
        }),
        // random_get(buf, buf_len) cannot fill the buffer in a proving
        // context where every run must be reproducible; it advances a
        // deterministic seed and reports success.
        ("wasi_snapshot_preview1", "random_get") => Some(WasiMethod {
            locals: 0,
            globals: &["random_seed"],
            init: vec![M(Instruction::Push(42)), Store("random_seed")],
            body: vec![
                M(Instruction::Drop),
                M(Instruction::Drop),
                Load("random_seed"),
                M(Instruction::Push(1103515245)),
                M(Instruction::IMul),
                M(Instruction::Push(12345)),
                M(Instruction::IAdd),
                Store("random_seed"),
                M(Instruction::Push(0)),
            ],
        }),
        _ => None,
    }
}
