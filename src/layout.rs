use parity_wasm::elements::{GlobalEntry, ValueType};

use crate::error::{Error, ErrorKind};

/// The word every procedure uses to simulate multi-level `br`.
pub const BRANCH_COUNTER: u32 = 0;

/// Number of cells a value of the given type occupies, both on the MASM
/// stack and in word-addressed memory.
pub(crate) fn cell_count(ty: ValueType) -> Result<u32, Error> {
    match ty {
        ValueType::I32 => Ok(1),
        ValueType::I64 => Ok(2),
        other => Err(ErrorKind::UnsupportedArgType(other).into()),
    }
}

/// Static assignment of MASM word addresses.
///
/// Address 0 is the branch counter. The named globals of the WASI methods
/// in use come next, one word each, then the module's own globals (one
/// word for an `i32`, two for an `i64` with the low word at the recorded
/// address). Linear memory starts at the first word after all of them.
///
/// The layout is computed once per module and never changes.
#[derive(Debug)]
pub struct MemoryLayout {
    wasi_globals: Vec<(String, u32)>,
    globals: Vec<(ValueType, u32)>,
    mem_beginning: u32,
}

impl MemoryLayout {
    pub fn new(wasi_globals: &[&str], globals: &[GlobalEntry]) -> Result<MemoryLayout, Error> {
        let mut next = BRANCH_COUNTER + 1;
        let mut named = Vec::with_capacity(wasi_globals.len());
        for name in wasi_globals {
            named.push((name.to_string(), next));
            next += 1;
        }
        let mut cells = Vec::with_capacity(globals.len());
        for entry in globals {
            let ty = entry.global_type().content_type();
            cells.push((ty, next));
            next += cell_count(ty)?;
        }
        Ok(MemoryLayout {
            wasi_globals: named,
            globals: cells,
            mem_beginning: next,
        })
    }

    /// The first word of Wasm linear memory.
    pub fn mem_beginning(&self) -> u32 {
        self.mem_beginning
    }

    /// Address of a WASI named global.
    pub fn wasi_global(&self, name: &str) -> Option<u32> {
        self.wasi_globals
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, addr)| addr)
    }

    /// Type and low-word address of a Wasm global.
    pub fn global(&self, index: u32) -> Option<(ValueType, u32)> {
        self.globals.get(index as usize).copied()
    }

    /// Number of Wasm globals in the layout.
    pub fn global_count(&self) -> u32 {
        self.globals.len() as u32
    }
}
