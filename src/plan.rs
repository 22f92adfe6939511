use std::collections::HashSet;

use parity_wasm::elements::{
    External, FuncBody, FunctionType, ImportEntry, Instruction, Internal, Module, Type,
};

use crate::error::{Error, ErrorKind};

/// Export names that may serve as the program entry, in lookup order.
const MAIN_NAMES: [&str; 3] = ["main", "_start", ""];

/// A view of one Wasm module through its function index space.
///
/// Index `i` refers to the `i`-th function import when `i` is below the
/// import count and to defined function `i - imports` otherwise, matching
/// the Wasm function index space.
pub(crate) struct ModuleContext<'a> {
    module: &'a Module,
    imported_funcs: Vec<&'a ImportEntry>,
}

impl<'a> ModuleContext<'a> {
    pub fn new(module: &'a Module) -> ModuleContext<'a> {
        let imported_funcs = module
            .import_section()
            .map(|section| section.entries())
            .unwrap_or_default()
            .iter()
            .filter(|entry| matches!(entry.external(), External::Function(_)))
            .collect();
        ModuleContext {
            module,
            imported_funcs,
        }
    }

    pub fn module(&self) -> &'a Module {
        self.module
    }

    pub fn import_count(&self) -> u32 {
        self.imported_funcs.len() as u32
    }

    pub fn is_import(&self, index: u32) -> bool {
        index < self.import_count()
    }

    pub fn import(&self, index: u32) -> Option<&'a ImportEntry> {
        self.imported_funcs.get(index as usize).copied()
    }

    /// Signature of the function at `index` in the function index space.
    pub fn func_type(&self, index: u32) -> &'a FunctionType {
        let type_index = if let Some(entry) = self.import(index) {
            match entry.external() {
                External::Function(type_index) => *type_index,
                _ => unreachable!("imported_funcs only holds function imports"),
            }
        } else {
            self.module
                .function_section()
                .expect("index space lookups are preceded by an entry check")
                .entries()
                .get((index - self.import_count()) as usize)
                .expect("function indices come from the same module")
                .type_ref()
        };
        let Type::Function(func_type) = self
            .module
            .type_section()
            .expect("a module with functions has a type section")
            .types()
            .get(type_index as usize)
            .expect("type indices are checked by the decoder");
        func_type
    }

    /// Body of a defined function; `None` for imports.
    pub fn body(&self, index: u32) -> Option<&'a FuncBody> {
        if self.is_import(index) {
            return None;
        }
        self.module
            .code_section()
            .and_then(|section| section.bodies().get((index - self.import_count()) as usize))
    }

    /// Whether the function is defined with an empty body. Such functions
    /// are never emitted; calls to them compile to argument drops.
    pub fn is_elided(&self, index: u32) -> bool {
        self.body(index)
            .map(|body| body.code().elements() == [Instruction::End])
            .unwrap_or(false)
    }

    /// The MASM procedure name for a function index.
    pub fn proc_name(index: u32) -> String {
        format!("f{}", index)
    }

    /// Function indices called from the body of `index`, in body order.
    fn callees(&self, index: u32) -> Vec<u32> {
        self.body(index)
            .map(|body| {
                body.code()
                    .elements()
                    .iter()
                    .filter_map(|instruction| match instruction {
                        Instruction::Call(callee) => Some(*callee),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Discovers the module's entry functions: the start section if present,
/// then the first export named `main`, `_start` or the empty string.
pub(crate) fn entries(ctx: &ModuleContext) -> Result<Vec<u32>, Error> {
    let mut entries = Vec::new();
    if let Some(start) = ctx.module().start_section() {
        entries.push(start);
    }
    if let Some(main) = main_export(ctx.module()) {
        if !entries.contains(&main) {
            entries.push(main);
        }
    }
    if entries.is_empty() {
        return Err(ErrorKind::NoEntry.into());
    }
    Ok(entries)
}

fn main_export(module: &Module) -> Option<u32> {
    let exports = module.export_section()?;
    MAIN_NAMES.iter().find_map(|name| {
        exports.entries().iter().find_map(|export| {
            match export.internal() {
                Internal::Function(index) if export.field() == *name => Some(*index),
                _ => None,
            }
        })
    })
}

/// Orders the functions reachable from `entries` so that every callee
/// precedes its callers: a depth-first traversal of the static call graph
/// collecting functions in post-order, with a visited set shared between
/// entries. Emitting procedures in this order makes every `Exec` refer to
/// an earlier definition (mutual recursion cannot be ordered and is left
/// for the assembler to reject).
pub(crate) fn emit_order(ctx: &ModuleContext, entries: &[u32]) -> Vec<u32> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    for &entry in entries {
        if !visited.insert(entry) {
            continue;
        }
        let mut stack = vec![(entry, ctx.callees(entry), 0usize)];
        loop {
            let next = match stack.last_mut() {
                None => break,
                Some((_, callees, cursor)) => {
                    let callee = callees.get(*cursor).copied();
                    *cursor += 1;
                    callee
                }
            };
            match next {
                Some(callee) => {
                    if visited.insert(callee) {
                        stack.push((callee, ctx.callees(callee), 0));
                    }
                }
                None => {
                    let (index, _, _) = stack.pop().expect("the stack is non-empty");
                    order.push(index);
                }
            }
        }
    }
    order
}
