use core::fmt;
use std::error;

use parity_wasm::elements::{Instruction, ValueType};

/// The reason a module (or one of its functions) could not be translated.
///
/// This is a closed taxonomy: everything the translator can object to maps
/// onto exactly one of these variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    /// The module has neither a start section nor a `main`/`_start`/`""`
    /// function export, so there is nothing to run.
    NoEntry,
    /// An imported function is not present in the WASI registry.
    BadImport { module: String, field: String },
    /// A WASI method body references a named global its registry entry does
    /// not declare.
    BadNamedGlobalRef(String),
    /// A data segment targets a memory other than memory 0.
    MultipleMemories,
    /// A function signature or global uses a value type outside
    /// `i32`/`i64`.
    UnsupportedArgType(ValueType),
    /// A Wasm instruction outside the supported subset.
    UnsupportedInstruction(Instruction),
    /// A 64-bit operation with no MASM counterpart.
    Unsupported64Bit(Instruction),
    /// The simulated operand stack did not hold the operand types the
    /// instruction requires (bottom-to-top order).
    ExpectedStack(Vec<ValueType>),
    /// A polymorphic `drop` found the simulated operand stack empty.
    EmptyStack,
    /// A branch target's result is too wide to shuffle within the
    /// accessible portion of the MASM stack.
    BlockResultTooLarge(u32),
    /// A 64-bit memory access whose static offset is not word-aligned.
    MisalignedI64Access(u32),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::NoEntry => write!(f, "no start or main function"),
            ErrorKind::BadImport { module, field } => {
                write!(f, "import {}::{} is not a known WASI method", module, field)
            }
            ErrorKind::BadNamedGlobalRef(name) => {
                write!(f, "reference to undeclared named global `{}`", name)
            }
            ErrorKind::MultipleMemories => {
                write!(f, "only memory 0 is supported")
            }
            ErrorKind::UnsupportedArgType(ty) => {
                write!(f, "unsupported value type {:?}", ty)
            }
            ErrorKind::UnsupportedInstruction(instruction) => {
                write!(f, "unsupported instruction {}", instruction)
            }
            ErrorKind::Unsupported64Bit(instruction) => {
                write!(f, "no 64-bit lowering for {}", instruction)
            }
            ErrorKind::ExpectedStack(types) => {
                write!(f, "operand stack does not end with {:?}", types)
            }
            ErrorKind::EmptyStack => write!(f, "drop from an empty operand stack"),
            ErrorKind::BlockResultTooLarge(width) => {
                write!(f, "branch target result of {} cells is out of reach", width)
            }
            ErrorKind::MisalignedI64Access(offset) => {
                write!(f, "64-bit memory access at misaligned offset {}", offset)
            }
        }
    }
}

/// A translation error together with the chain of control contexts that
/// was active when it was detected.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    kind: ErrorKind,
    trace: Vec<String>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            trace: Vec::new(),
        }
    }

    /// Appends an enclosing context to the breadcrumb, innermost first.
    pub(crate) fn in_context(mut self, frame: String) -> Self {
        self.trace.push(frame);
        self
    }

    /// The underlying error kind.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for frame in &self.trace {
            write!(f, ", in {}", frame)?;
        }
        Ok(())
    }
}

impl error::Error for Error {}
