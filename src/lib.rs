//! # wasmiden
//!
//! A compiler from WebAssembly 1.0 modules (as produced by `clang` or
//! `rustc` targeting `wasm32`) to Miden Assembly, the stack language of
//! the Miden zero-knowledge VM.
//!
//! The two machines disagree on almost everything: Wasm is a structured,
//! typed, byte-addressed stack machine with multi-level labeled breaks
//! and native 64-bit arithmetic; MASM is flat, untyped, word-addressed,
//! 32-bit, and its only control flow is `if` and `while`. The translator
//! bridges the gap by
//!
//! - simulating labeled breaks with a branch counter held at memory
//!   address 0, decremented by a continue guard at every block exit,
//! - splitting every 64-bit value into two 32-bit words (high word on
//!   top of the stack),
//! - synthesizing byte-granular loads and stores from word accesses plus
//!   shift/mask arithmetic,
//! - compiling signed arithmetic with explicit two's-complement
//!   sequences over unsigned words.
//!
//! Translation is a single pass: the planner discovers the entry
//! functions and orders the call graph so every callee is emitted before
//! its callers, the layout allocator pins globals to word addresses, and
//! each function body is lowered instruction by instruction while a
//! simulated operand stack checks Wasm's typing discipline.
//!
//! Modules are decoded externally by [`parity_wasm`]; this crate starts
//! from the decoded AST.
//!
//! # Example
//!
//! ```rust
//! use parity_wasm::{deserialize_buffer, elements::Module};
//!
//! let wasm = wat::parse_str(
//!     r#"
//!     (module
//!         (func (export "main")
//!             i32.const 42
//!             drop))
//!     "#,
//! )
//! .expect("failed to parse wat");
//!
//! let module = deserialize_buffer::<Module>(&wasm).expect("failed to load wasm");
//! let program = wasmiden::translate_module(&module).expect("translation failed");
//!
//! // The rendered text is ready for the Miden assembler.
//! println!("{}", program);
//! ```

mod emit;
mod error;
mod layout;
pub mod masm;
mod plan;
pub mod runner;
mod translate;
pub mod wasi;

pub use self::{
    error::{Error, ErrorKind},
    layout::{MemoryLayout, BRANCH_COUNTER},
    translate::translate_module,
};
