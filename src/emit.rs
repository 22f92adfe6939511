//! Rendering of a MASM module to Miden assembly text.
//!
//! A mechanical tree walk: every AST instruction maps onto one mnemonic
//! (64-bit operations call into the `std::math::u64` library, which is
//! why the import preamble is always present). The output is fully
//! determined by the AST, so translating the same module twice prints
//! byte-identical text.

use core::fmt;

use crate::masm::{Instruction, Module};

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for import in &self.imports {
            writeln!(f, "use.{}", import)?;
        }
        for (name, proc) in &self.procedures {
            writeln!(f)?;
            if proc.locals == 0 {
                writeln!(f, "proc.{}", name)?;
            } else {
                writeln!(f, "proc.{}.{}", name, proc.locals)?;
            }
            write_body(f, &proc.body, 1)?;
            writeln!(f, "end")?;
        }
        writeln!(f)?;
        writeln!(f, "begin")?;
        write_body(f, &self.program, 1)?;
        writeln!(f, "end")
    }
}

fn write_body(f: &mut fmt::Formatter, body: &[Instruction], indent: usize) -> fmt::Result {
    for instruction in body {
        write_instruction(f, instruction, indent)?;
    }
    Ok(())
}

fn write_indent(f: &mut fmt::Formatter, indent: usize) -> fmt::Result {
    for _ in 0..indent {
        write!(f, "    ")?;
    }
    Ok(())
}

fn write_instruction(f: &mut fmt::Formatter, instruction: &Instruction, indent: usize) -> fmt::Result {
    use self::Instruction::*;

    if let If(then_body, else_body) = instruction {
        write_indent(f, indent)?;
        writeln!(f, "if.true")?;
        write_body(f, then_body, indent + 1)?;
        if !else_body.is_empty() {
            write_indent(f, indent)?;
            writeln!(f, "else")?;
            write_body(f, else_body, indent + 1)?;
        }
        write_indent(f, indent)?;
        return writeln!(f, "end");
    }
    if let While(body) = instruction {
        write_indent(f, indent)?;
        writeln!(f, "while.true")?;
        write_body(f, body, indent + 1)?;
        write_indent(f, indent)?;
        return writeln!(f, "end");
    }

    write_indent(f, indent)?;
    match instruction {
        Push(value) => writeln!(f, "push.{}", value),
        Drop => writeln!(f, "drop"),
        Dup(0) => writeln!(f, "dup"),
        Dup(depth) => writeln!(f, "dup.{}", depth),
        Swap(1) => writeln!(f, "swap"),
        Swap(depth) => writeln!(f, "swap.{}", depth),
        MovUp(depth) => writeln!(f, "movup.{}", depth),
        MemLoad(None) => writeln!(f, "mem_load"),
        MemLoad(Some(addr)) => writeln!(f, "mem_load.{}", addr),
        MemStore(None) => writeln!(f, "mem_store"),
        MemStore(Some(addr)) => writeln!(f, "mem_store.{}", addr),
        LocLoad(cell) => writeln!(f, "loc_load.{}", cell),
        LocStore(cell) => writeln!(f, "loc_store.{}", cell),
        Exec(name) => writeln!(f, "exec.{}", name),
        If(..) | While(..) => unreachable!("handled above"),

        IAdd => writeln!(f, "u32wrapping_add"),
        ISub => writeln!(f, "u32wrapping_sub"),
        IMul => writeln!(f, "u32wrapping_mul"),
        IDiv => writeln!(f, "u32div"),
        IMod => writeln!(f, "u32mod"),
        IDivMod(None) => writeln!(f, "u32divmod"),
        IDivMod(Some(divisor)) => writeln!(f, "u32divmod.{}", divisor),
        IShl => writeln!(f, "u32shl"),
        IShr => writeln!(f, "u32shr"),
        IAnd => writeln!(f, "u32and"),
        IOr => writeln!(f, "u32or"),
        IXor => writeln!(f, "u32xor"),
        INot => writeln!(f, "u32not"),

        IEq(None) => writeln!(f, "eq"),
        IEq(Some(value)) => writeln!(f, "eq.{}", value),
        INeq(None) => writeln!(f, "neq"),
        INeq(Some(value)) => writeln!(f, "neq.{}", value),
        ILt => writeln!(f, "u32lt"),
        IGt => writeln!(f, "u32gt"),
        ILte => writeln!(f, "u32lte"),
        IGte => writeln!(f, "u32gte"),
        IEqz => writeln!(f, "eq.0"),

        IAdd64 => writeln!(f, "exec.u64::wrapping_add"),
        ISub64 => writeln!(f, "exec.u64::wrapping_sub"),
        IMul64 => writeln!(f, "exec.u64::wrapping_mul"),
        IShl64 => writeln!(f, "exec.u64::shl"),
        IShr64 => writeln!(f, "exec.u64::shr"),
        IAnd64 => writeln!(f, "exec.u64::and"),
        IOr64 => writeln!(f, "exec.u64::or"),
        IXor64 => writeln!(f, "exec.u64::xor"),
        IEq64 => writeln!(f, "exec.u64::eq"),
        INeq64 => writeln!(f, "exec.u64::neq"),
        ILt64 => writeln!(f, "exec.u64::lt"),
        IGt64 => writeln!(f, "exec.u64::gt"),
        ILte64 => writeln!(f, "exec.u64::lte"),
        IGte64 => writeln!(f, "exec.u64::gte"),
        IEqz64 => writeln!(f, "exec.u64::eqz"),

        CDrop => writeln!(f, "cdrop"),
        Assert => writeln!(f, "assert"),
    }
}
