use core::slice;

use parity_wasm::elements::{BlockType, Instruction, ValueType};

use crate::{
    error::{Error, ErrorKind},
    layout::{cell_count, MemoryLayout, BRANCH_COUNTER},
    masm,
    plan::ModuleContext,
};

/// How deep into the MASM operand stack a single instruction may reach,
/// the upper bound for `Dup`/`Swap`/`MovUp` immediates.
pub(crate) const ACCESSIBLE_STACK_DEPTH: u32 = 16;

/// Kind of an entered block construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockKind {
    Block,
    Loop,
    If,
}

/// One entry of the control-context stack: what the translator is
/// currently inside of. Used to resolve branch targets and as the
/// breadcrumb attached to errors.
#[derive(Debug, Clone)]
pub(crate) enum Frame {
    /// The body of the function with the given index.
    Function { index: u32, results: Vec<ValueType> },
    /// A `block`/`loop`/`if` construct, with a snapshot of the simulated
    /// operand stack taken when it was entered.
    Block {
        kind: BlockKind,
        block_type: BlockType,
        entering: Vec<ValueType>,
    },
    /// A global initializer expression.
    GlobalsInit,
    /// A data segment offset expression.
    DatasInit,
    /// The body of a registered WASI method.
    Import,
}

impl Frame {
    fn describe(&self) -> String {
        match self {
            Frame::Function { index, .. } => format!("function f{}", index),
            Frame::Block { kind, .. } => match kind {
                BlockKind::Block => "block".to_string(),
                BlockKind::Loop => "loop".to_string(),
                BlockKind::If => "if".to_string(),
            },
            Frame::GlobalsInit => "globals initializer".to_string(),
            Frame::DatasInit => "data segment initializer".to_string(),
            Frame::Import => "imported method".to_string(),
        }
    }
}

/// How a translated sub-sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminator {
    End,
    Else,
}

/// A translated instruction sub-sequence. `diverged` is set when the
/// sequence ended in an unconditional branch, so no fall-through state
/// survives it.
struct Seq {
    code: Vec<masm::Instruction>,
    term: Terminator,
    diverged: bool,
}

fn block_results(block_type: BlockType) -> Vec<ValueType> {
    match block_type {
        BlockType::NoResult => Vec::new(),
        BlockType::Value(ty) => vec![ty],
    }
}

/// Total MASM cells occupied by the given stack types.
fn width(types: &[ValueType]) -> u32 {
    types
        .iter()
        .map(|&ty| cell_count(ty).expect("only i32/i64 reach the operand stack"))
        .sum()
}

/// Stores the value on top of the MASM stack into the global cells at
/// `addr`, consuming it. Shared between `set_global` and the program
/// entry block's globals initialization.
pub(crate) fn global_store(ty: ValueType, addr: u32) -> Vec<masm::Instruction> {
    use crate::masm::Instruction::*;
    let mut code = Vec::new();
    if ty == ValueType::I64 {
        code.push(MemStore(Some(addr + 1)));
        code.push(Drop);
    }
    code.push(MemStore(Some(addr)));
    code.push(Drop);
    code
}

/// Translates the body of the defined function at `index` into a MASM
/// procedure.
pub(crate) fn translate_function(
    ctx: &ModuleContext,
    layout: &MemoryLayout,
    index: u32,
) -> Result<masm::Proc, Error> {
    FuncTranslator::for_function(ctx, layout, index)?.run(index)
}

/// Translates a constant initializer expression. Returns the emitted code
/// and the types it leaves on the stack.
pub(crate) fn translate_init_expr(
    ctx: &ModuleContext,
    layout: &MemoryLayout,
    frame: Frame,
    instructions: &[Instruction],
) -> Result<(Vec<masm::Instruction>, Vec<ValueType>), Error> {
    let mut translator = FuncTranslator::new(ctx, layout, frame);
    let mut iter = instructions.iter();
    let seq = translator.translate_sequence(&mut iter)?;
    Ok((seq.code, translator.stack))
}

/// Per-function translation state: the simulated operand stack, the
/// control-context stack, and the local-variable cell map.
struct FuncTranslator<'a, 'm> {
    ctx: &'a ModuleContext<'m>,
    layout: &'a MemoryLayout,
    /// Simulated operand stack of the *current* block, bottom first.
    stack: Vec<ValueType>,
    frames: Vec<Frame>,
    /// Local index to value type and assigned frame cells, parameters
    /// first.
    locals: Vec<(ValueType, Vec<u32>)>,
    param_count: usize,
    total_cells: u32,
    uses_branch_counter: bool,
}

impl<'a, 'm> FuncTranslator<'a, 'm> {
    fn new(ctx: &'a ModuleContext<'m>, layout: &'a MemoryLayout, frame: Frame) -> Self {
        FuncTranslator {
            ctx,
            layout,
            stack: Vec::new(),
            frames: vec![frame],
            locals: Vec::new(),
            param_count: 0,
            total_cells: 0,
            uses_branch_counter: false,
        }
    }

    fn for_function(
        ctx: &'a ModuleContext<'m>,
        layout: &'a MemoryLayout,
        index: u32,
    ) -> Result<Self, Error> {
        let func_type = ctx.func_type(index);
        let body = ctx
            .body(index)
            .expect("only defined functions are translated");

        let mut translator = Self::new(
            ctx,
            layout,
            Frame::Function {
                index,
                results: func_type.results().to_vec(),
            },
        );
        for &result in func_type.results() {
            cell_count(result)?;
        }
        let mut next = 0u32;
        for &param in func_type.params() {
            let cells = cell_count(param)?;
            translator.locals.push((param, (next..next + cells).collect()));
            next += cells;
        }
        translator.param_count = translator.locals.len();
        for local in body.locals() {
            let ty = local.value_type();
            let cells = cell_count(ty)?;
            for _ in 0..local.count() {
                translator.locals.push((ty, (next..next + cells).collect()));
                next += cells;
            }
        }
        translator.total_cells = next;
        Ok(translator)
    }

    fn run(mut self, index: u32) -> Result<masm::Proc, Error> {
        use crate::masm::Instruction::*;

        let mut code = Vec::new();

        // Arguments arrive on the operand stack with the last one on top;
        // spill them into their cells in reverse parameter order, each
        // multi-cell value high cell first.
        for (_, cells) in self.locals[..self.param_count].iter().rev() {
            for &cell in cells.iter().rev() {
                code.push(LocStore(cell));
                code.push(Drop);
            }
        }

        let body = self
            .ctx
            .body(index)
            .expect("only defined functions are translated");
        let mut iter = body.code().elements().iter();
        let seq = self.translate_sequence(&mut iter)?;
        if seq.term == Terminator::Else {
            return Err(self.err(ErrorKind::UnsupportedInstruction(Instruction::Else)));
        }
        let results = match &self.frames[0] {
            Frame::Function { results, .. } => results.clone(),
            _ => unreachable!("for_function installs a function frame"),
        };
        if !seq.diverged && self.stack != results {
            return Err(self.err(ErrorKind::ExpectedStack(results)));
        }
        code.extend(seq.code);

        // A `return` compiled as a branch past the outermost block leaves
        // the counter at 1; consume it here so it cannot leak into the
        // caller.
        if self.uses_branch_counter {
            code.push(MemLoad(Some(BRANCH_COUNTER)));
            code.push(IEq(Some(1)));
            code.push(If(
                vec![Push(0), MemStore(Some(BRANCH_COUNTER)), Drop],
                vec![],
            ));
        }

        Ok(masm::Proc {
            locals: self.total_cells,
            body: code,
        })
    }

    fn err(&self, kind: ErrorKind) -> Error {
        let mut error = Error::new(kind);
        for frame in self.frames.iter().rev() {
            error = error.in_context(frame.describe());
        }
        error
    }

    fn push_operand(&mut self, ty: ValueType) {
        self.stack.push(ty);
    }

    /// Checks that the simulated stack ends with `expected` (bottom
    /// first) and pops those entries.
    fn pop_operands(&mut self, expected: &[ValueType]) -> Result<(), Error> {
        if self.stack.len() < expected.len()
            || self.stack[self.stack.len() - expected.len()..] != *expected
        {
            return Err(self.err(ErrorKind::ExpectedStack(expected.to_vec())));
        }
        self.stack.truncate(self.stack.len() - expected.len());
        Ok(())
    }

    fn local(&self, index: u32, at: &Instruction) -> Result<(ValueType, Vec<u32>), Error> {
        self.locals
            .get(index as usize)
            .cloned()
            .ok_or_else(|| self.err(ErrorKind::UnsupportedInstruction(at.clone())))
    }

    /// Closes the innermost block frame: checks the fall-through stack
    /// against the block's result (unless the body diverged) and restores
    /// the outer stack with the result on top.
    fn close_block(&mut self, body: &Seq) -> Result<(), Error> {
        let results = match self.frames.last() {
            Some(Frame::Block { block_type, .. }) => block_results(*block_type),
            _ => unreachable!("close_block is only called on block frames"),
        };
        if !body.diverged && self.stack != results {
            return Err(self.err(ErrorKind::ExpectedStack(results)));
        }
        let entering = match self.frames.pop() {
            Some(Frame::Block { entering, .. }) => entering,
            _ => unreachable!("checked just above"),
        };
        self.stack = entering;
        self.stack.extend(results);
        Ok(())
    }

    /// The continue guard wrapped around everything that follows a block
    /// construct. One countdown step of the branch simulation: a counter
    /// of 1 means this level is the branch target (clear it and resume),
    /// 0 means normal flow, anything else is consumed one level further
    /// out (decrement and skip).
    fn continue_guard(&mut self, rest: Vec<masm::Instruction>) -> Vec<masm::Instruction> {
        use crate::masm::Instruction::*;

        self.uses_branch_counter = true;
        vec![
            MemLoad(Some(BRANCH_COUNTER)),
            IEq(Some(1)),
            If(
                vec![Push(0), MemStore(Some(BRANCH_COUNTER)), Drop, Push(1)],
                vec![
                    MemLoad(Some(BRANCH_COUNTER)),
                    IEqz,
                    If(
                        vec![Push(1)],
                        vec![
                            MemLoad(Some(BRANCH_COUNTER)),
                            Push(1),
                            ISub,
                            MemStore(Some(BRANCH_COUNTER)),
                            Drop,
                            Push(0),
                        ],
                    ),
                ],
            ),
            If(rest, vec![]),
        ]
    }

    /// The tail of every compiled loop body: computes the `while`
    /// repetition flag from the branch counter. Normal fall-through exits
    /// the loop; a branch targeting the loop clears the counter and
    /// repeats; anything else exits and leaves the counter for the
    /// continue guard that follows the loop, which owns this level's
    /// countdown step.
    fn loop_continue(&mut self) -> Vec<masm::Instruction> {
        use crate::masm::Instruction::*;

        self.uses_branch_counter = true;
        vec![
            MemLoad(Some(BRANCH_COUNTER)),
            IEqz,
            If(
                vec![Push(0)],
                vec![
                    MemLoad(Some(BRANCH_COUNTER)),
                    IEq(Some(1)),
                    If(
                        vec![Push(0), MemStore(Some(BRANCH_COUNTER)), Drop, Push(1)],
                        vec![Push(0)],
                    ),
                ],
            ),
        ]
    }

    /// Compiles a branch to the frame `depth` levels out: clears the MASM
    /// stack down to the target's result and arms the branch counter with
    /// `depth + 1`.
    fn emit_branch(&mut self, depth: u32, code: &mut Vec<masm::Instruction>) -> Result<(), Error> {
        use crate::masm::Instruction::*;

        let frame_index = match self.frames.len().checked_sub(1 + depth as usize) {
            Some(frame_index) => frame_index,
            None => {
                return Err(self.err(ErrorKind::UnsupportedInstruction(Instruction::Br(depth))))
            }
        };
        let results = match &self.frames[frame_index] {
            // A branch to a loop restarts it and so targets the loop's
            // parameters, which are empty in Wasm 1.0.
            Frame::Block {
                kind: BlockKind::Loop,
                ..
            } => Vec::new(),
            Frame::Block { block_type, .. } => block_results(*block_type),
            Frame::Function { results, .. } => results.clone(),
            _ => {
                return Err(self.err(ErrorKind::UnsupportedInstruction(Instruction::Br(depth))))
            }
        };
        let keep = width(&results);
        if keep >= ACCESSIBLE_STACK_DEPTH {
            return Err(self.err(ErrorKind::BlockResultTooLarge(keep)));
        }
        if self.stack.len() < results.len()
            || self.stack[self.stack.len() - results.len()..] != *results
        {
            return Err(self.err(ErrorKind::ExpectedStack(results)));
        }

        // Everything on the MASM stack between the kept result and the
        // target frame's entering state is unreachable after the branch
        // and must go now; the skipped continue guards will not touch it.
        let mut excess = width(&self.stack) - keep;
        for frame in &self.frames[frame_index + 1..] {
            if let Frame::Block { entering, .. } = frame {
                excess += width(entering);
            }
        }
        for _ in 0..excess {
            match keep {
                0 => code.push(Drop),
                1 => {
                    code.push(Swap(1));
                    code.push(Drop);
                }
                k => {
                    code.push(MovUp(k));
                    code.push(Drop);
                }
            }
        }

        code.push(Push(depth + 1));
        code.push(MemStore(Some(BRANCH_COUNTER)));
        code.push(Drop);
        self.uses_branch_counter = true;
        self.stack = results;
        Ok(())
    }

    /// Consumes the unreachable tail after an unconditional branch up to
    /// the terminator of the current block, without translating it.
    fn skip_dead_code(&self, iter: &mut slice::Iter<Instruction>) -> Terminator {
        let mut depth = 0usize;
        for instruction in iter {
            match instruction {
                Instruction::Block(_) | Instruction::Loop(_) | Instruction::If(_) => depth += 1,
                Instruction::Else if depth == 0 => return Terminator::Else,
                Instruction::End => {
                    if depth == 0 {
                        return Terminator::End;
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }
        Terminator::End
    }

    /// Computes the MASM word address for a byte address on top of the
    /// stack: `addr / 4 + offset / 4 + mem_beginning`. Byte misalignment
    /// of the dynamic address is silently truncated.
    fn word_address(&self, offset: u32, code: &mut Vec<masm::Instruction>) {
        use crate::masm::Instruction::*;

        code.push(Push(4));
        code.push(IDiv);
        code.push(Push(offset / 4 + self.layout.mem_beginning()));
        code.push(IAdd);
    }

    fn require_word_aligned(&self, offset: u32) -> Result<(), Error> {
        if offset % 4 != 0 {
            return Err(self.err(ErrorKind::MisalignedI64Access(offset)));
        }
        Ok(())
    }

    /// `x > 2^31 - 1`, the two's-complement sign test.
    fn is_negative(code: &mut Vec<masm::Instruction>) {
        use crate::masm::Instruction::*;

        code.push(Push(i32::MAX as u32));
        code.push(IGt);
    }

    /// Replaces the top of the stack with its two's-complement negation.
    fn negate() -> Vec<masm::Instruction> {
        use crate::masm::Instruction::*;

        vec![Push(u32::MAX), Swap(1), ISub, Push(1), IAdd]
    }

    /// Replaces the top of the stack with its absolute value.
    fn abs(code: &mut Vec<masm::Instruction>) {
        use crate::masm::Instruction::*;

        code.push(Dup(0));
        Self::is_negative(code);
        code.push(If(Self::negate(), vec![]));
    }

    fn binop32(
        &mut self,
        code: &mut Vec<masm::Instruction>,
        ops: Vec<masm::Instruction>,
    ) -> Result<(), Error> {
        self.pop_operands(&[ValueType::I32, ValueType::I32])?;
        self.push_operand(ValueType::I32);
        code.extend(ops);
        Ok(())
    }

    fn relop32(
        &mut self,
        code: &mut Vec<masm::Instruction>,
        ops: Vec<masm::Instruction>,
    ) -> Result<(), Error> {
        // Same stack shape as a binary operation: two words in, flag out.
        self.binop32(code, ops)
    }

    fn binop64(
        &mut self,
        code: &mut Vec<masm::Instruction>,
        op: masm::Instruction,
    ) -> Result<(), Error> {
        self.pop_operands(&[ValueType::I64, ValueType::I64])?;
        self.push_operand(ValueType::I64);
        code.push(op);
        Ok(())
    }

    fn relop64(
        &mut self,
        code: &mut Vec<masm::Instruction>,
        op: masm::Instruction,
    ) -> Result<(), Error> {
        self.pop_operands(&[ValueType::I64, ValueType::I64])?;
        self.push_operand(ValueType::I32);
        code.push(op);
        Ok(())
    }

    /// Signed 32-bit division: `abs(a) / abs(b)`, negated when exactly
    /// one operand is negative.
    fn div_s(code: &mut Vec<masm::Instruction>) {
        use crate::masm::Instruction::*;

        code.push(Dup(1));
        Self::is_negative(code);
        code.push(Dup(1));
        Self::is_negative(code);
        code.push(IXor);
        code.push(MovUp(2));
        Self::abs(code);
        code.push(MovUp(2));
        Self::abs(code);
        code.push(IDiv);
        code.push(Swap(1));
        code.push(If(Self::negate(), vec![]));
    }

    /// Signed 32-bit shift right: `!((!a) >> b)` for negative `a`.
    fn shr_s(code: &mut Vec<masm::Instruction>) {
        use crate::masm::Instruction::*;

        code.push(Dup(1));
        Self::is_negative(code);
        code.push(If(
            vec![Swap(1), INot, Swap(1), IShr, INot],
            vec![IShr],
        ));
    }

    /// `a OP b` via the sign of a difference, with an optional equality
    /// disjunct for the `>=`/`<=` forms. `flipped` selects `b - a`.
    fn cmp_s(code: &mut Vec<masm::Instruction>, flipped: bool, or_equal: bool) {
        use crate::masm::Instruction::*;

        if or_equal {
            code.push(Dup(1));
            code.push(Dup(1));
            code.push(IEq(None));
            code.push(MovUp(2));
            code.push(MovUp(2));
        }
        if flipped {
            code.push(Swap(1));
        }
        code.push(ISub);
        Self::is_negative(code);
        if or_equal {
            code.push(IOr);
        }
    }

    /// Extracts an unsigned sub-word field after the generic byte-address
    /// arithmetic: `(mem[q] & (mask << 8r)) >> 8r` for `4q + r` the
    /// offset byte address.
    fn subword_load(
        &mut self,
        code: &mut Vec<masm::Instruction>,
        offset: u32,
        mask: u32,
        signed: bool,
    ) -> Result<(), Error> {
        use crate::masm::Instruction::*;

        self.pop_operands(&[ValueType::I32])?;
        self.push_operand(ValueType::I32);

        if offset != 0 {
            code.push(Push(offset));
            code.push(IAdd);
        }
        code.push(IDivMod(Some(4)));
        code.push(Push(8));
        code.push(IMul);
        code.push(Swap(1));
        code.push(Push(self.layout.mem_beginning()));
        code.push(IAdd);
        code.push(MemLoad(None));
        code.push(Dup(1));
        code.push(Push(mask));
        code.push(Swap(1));
        code.push(IShl);
        code.push(IAnd);
        code.push(Swap(1));
        code.push(IShr);

        if signed {
            // Two's complement: a loaded value above the sign threshold
            // becomes `2^32 - ((mask + 1) - v)`.
            let mut extend = vec![Push(mask), Swap(1), ISub, Push(1), IAdd];
            extend.extend(Self::negate());
            code.push(Dup(0));
            code.push(Push(mask >> 1));
            code.push(IGt);
            code.push(If(extend, vec![]));
        }
        Ok(())
    }

    /// Read-modify-write of a sub-word field in one memory word:
    /// `mem[q] := (mem[q] & !(mask << 8r)) | (val << 8r)`.
    fn subword_store32(
        &mut self,
        code: &mut Vec<masm::Instruction>,
        offset: u32,
        mask: u32,
    ) -> Result<(), Error> {
        use crate::masm::Instruction::*;

        self.pop_operands(&[ValueType::I32, ValueType::I32])?;

        code.push(Swap(1));
        if offset != 0 {
            code.push(Push(offset));
            code.push(IAdd);
        }
        code.push(IDivMod(Some(4)));
        code.push(Push(8));
        code.push(IMul);
        code.push(Swap(1));
        code.push(Push(self.layout.mem_beginning()));
        code.push(IAdd);
        code.push(MovUp(2));
        code.push(Dup(2));
        code.push(IShl);
        code.push(MovUp(2));
        code.push(Push(mask));
        code.push(Swap(1));
        code.push(IShl);
        code.push(INot);
        code.push(Dup(2));
        code.push(MemLoad(None));
        code.push(IAnd);
        code.push(IOr);
        code.push(Swap(1));
        code.push(MemStore(None));
        code.push(Drop);
        Ok(())
    }

    /// The same read-modify-write over the two words holding a 64-bit
    /// value, expressed with the 64-bit logical instructions.
    fn subword_store64(
        &mut self,
        code: &mut Vec<masm::Instruction>,
        offset: u32,
        mask: u32,
    ) -> Result<(), Error> {
        use crate::masm::Instruction::*;

        self.pop_operands(&[ValueType::I32, ValueType::I64])?;

        code.push(MovUp(2));
        if offset != 0 {
            code.push(Push(offset));
            code.push(IAdd);
        }
        code.push(IDivMod(Some(4)));
        code.push(Push(8));
        code.push(IMul);
        code.push(Swap(1));
        code.push(Push(self.layout.mem_beginning()));
        code.push(IAdd);
        code.push(MovUp(3));
        code.push(MovUp(3));
        code.push(Dup(3));
        code.push(IShl64);
        code.push(Push(mask));
        code.push(Push(0));
        code.push(Dup(5));
        code.push(IShl64);
        code.push(Push(u32::MAX));
        code.push(Push(u32::MAX));
        code.push(IXor64);
        code.push(Dup(4));
        code.push(Dup(0));
        code.push(MemLoad(None));
        code.push(Swap(1));
        code.push(Push(1));
        code.push(IAdd);
        code.push(MemLoad(None));
        code.push(IAnd64);
        code.push(IOr64);
        code.push(MovUp(2));
        code.push(Swap(1));
        code.push(Dup(1));
        code.push(Push(1));
        code.push(IAdd);
        code.push(MemStore(None));
        code.push(Drop);
        code.push(MemStore(None));
        code.push(Drop);
        code.push(Drop);
        Ok(())
    }

    /// Translates instructions up to the terminator of the current block.
    fn translate_sequence(&mut self, iter: &mut slice::Iter<Instruction>) -> Result<Seq, Error> {
        use crate::masm::Instruction as M;

        let mut code = Vec::new();
        loop {
            let instruction = match iter.next() {
                Some(instruction) => instruction,
                None => {
                    return Ok(Seq {
                        code,
                        term: Terminator::End,
                        diverged: false,
                    })
                }
            };
            match instruction {
                Instruction::End => {
                    return Ok(Seq {
                        code,
                        term: Terminator::End,
                        diverged: false,
                    })
                }
                Instruction::Else => {
                    return Ok(Seq {
                        code,
                        term: Terminator::Else,
                        diverged: false,
                    })
                }
                Instruction::Nop => {}

                Instruction::Block(block_type) => {
                    let entering = core::mem::take(&mut self.stack);
                    self.frames.push(Frame::Block {
                        kind: BlockKind::Block,
                        block_type: *block_type,
                        entering,
                    });
                    let body = self.translate_sequence(iter)?;
                    if body.term != Terminator::End {
                        return Err(
                            self.err(ErrorKind::UnsupportedInstruction(Instruction::Else))
                        );
                    }
                    self.close_block(&body)?;
                    code.extend(body.code);
                    let rest = self.translate_sequence(iter)?;
                    let (term, diverged) = (rest.term, rest.diverged);
                    code.extend(self.continue_guard(rest.code));
                    return Ok(Seq {
                        code,
                        term,
                        diverged,
                    });
                }
                Instruction::Loop(block_type) => {
                    let entering = core::mem::take(&mut self.stack);
                    self.frames.push(Frame::Block {
                        kind: BlockKind::Loop,
                        block_type: *block_type,
                        entering,
                    });
                    let body = self.translate_sequence(iter)?;
                    if body.term != Terminator::End {
                        return Err(
                            self.err(ErrorKind::UnsupportedInstruction(Instruction::Else))
                        );
                    }
                    self.close_block(&body)?;
                    let mut while_body = body.code;
                    while_body.extend(self.loop_continue());
                    code.push(M::Push(1));
                    code.push(M::While(while_body));
                    let rest = self.translate_sequence(iter)?;
                    let (term, diverged) = (rest.term, rest.diverged);
                    code.extend(self.continue_guard(rest.code));
                    return Ok(Seq {
                        code,
                        term,
                        diverged,
                    });
                }
                Instruction::If(block_type) => {
                    self.pop_operands(&[ValueType::I32])?;
                    let entering = core::mem::take(&mut self.stack);
                    self.frames.push(Frame::Block {
                        kind: BlockKind::If,
                        block_type: *block_type,
                        entering,
                    });
                    let results = block_results(*block_type);
                    let then_seq = self.translate_sequence(iter)?;
                    let else_seq = if then_seq.term == Terminator::Else {
                        if !then_seq.diverged && self.stack != results {
                            return Err(self.err(ErrorKind::ExpectedStack(results)));
                        }
                        self.stack = Vec::new();
                        let else_seq = self.translate_sequence(iter)?;
                        if else_seq.term != Terminator::End {
                            return Err(
                                self.err(ErrorKind::UnsupportedInstruction(Instruction::Else))
                            );
                        }
                        Some(else_seq)
                    } else {
                        if !results.is_empty() {
                            // An `if` with a result needs an else arm to
                            // produce it on the false path.
                            return Err(self.err(ErrorKind::ExpectedStack(results)));
                        }
                        None
                    };
                    self.close_block(else_seq.as_ref().unwrap_or(&then_seq))?;

                    let then_code = then_seq.code;
                    let else_code = else_seq.map(|seq| seq.code).unwrap_or_default();
                    if then_code.is_empty() && else_code.is_empty() {
                        code.push(M::Drop);
                    } else if then_code.is_empty() {
                        code.push(M::IEq(Some(0)));
                        code.push(M::If(else_code, vec![]));
                    } else {
                        code.push(M::INeq(Some(0)));
                        code.push(M::If(then_code, else_code));
                    }
                    let rest = self.translate_sequence(iter)?;
                    let (term, diverged) = (rest.term, rest.diverged);
                    code.extend(self.continue_guard(rest.code));
                    return Ok(Seq {
                        code,
                        term,
                        diverged,
                    });
                }

                Instruction::Br(depth) => {
                    self.emit_branch(*depth, &mut code)?;
                    let term = self.skip_dead_code(iter);
                    return Ok(Seq {
                        code,
                        term,
                        diverged: true,
                    });
                }
                Instruction::BrIf(depth) => {
                    self.pop_operands(&[ValueType::I32])?;
                    let saved = self.stack.clone();
                    let mut branch = Vec::new();
                    self.emit_branch(*depth, &mut branch)?;
                    self.stack = saved;
                    let rest = self.translate_sequence(iter)?;
                    let (term, diverged) = (rest.term, rest.diverged);
                    code.push(M::INeq(Some(0)));
                    code.push(M::If(branch, rest.code));
                    return Ok(Seq {
                        code,
                        term,
                        diverged,
                    });
                }
                Instruction::BrTable(table_data) => {
                    self.pop_operands(&[ValueType::I32])?;
                    let saved = self.stack.clone();
                    let mut arm = vec![M::Drop];
                    self.stack = saved.clone();
                    self.emit_branch(table_data.default, &mut arm)?;
                    for (case, &depth) in table_data.table.iter().enumerate().rev() {
                        self.stack = saved.clone();
                        let mut taken = vec![M::Drop];
                        self.emit_branch(depth, &mut taken)?;
                        arm = vec![
                            M::Dup(0),
                            M::IEq(Some(case as u32)),
                            M::If(taken, arm),
                        ];
                    }
                    code.extend(arm);
                    let term = self.skip_dead_code(iter);
                    return Ok(Seq {
                        code,
                        term,
                        diverged: true,
                    });
                }
                Instruction::Return => {
                    let depth = self.frames.len() as u32 - 1;
                    self.emit_branch(depth, &mut code)?;
                    let term = self.skip_dead_code(iter);
                    return Ok(Seq {
                        code,
                        term,
                        diverged: true,
                    });
                }
                Instruction::Unreachable => {
                    code.push(M::Push(0));
                    code.push(M::Assert);
                    let term = self.skip_dead_code(iter);
                    return Ok(Seq {
                        code,
                        term,
                        diverged: true,
                    });
                }

                Instruction::Call(index) => {
                    let func_type = self.ctx.func_type(*index);
                    let params = func_type.params().to_vec();
                    let results = func_type.results().to_vec();
                    for &ty in params.iter().chain(&results) {
                        cell_count(ty).map_err(|_| {
                            self.err(ErrorKind::UnsupportedArgType(ty))
                        })?;
                    }
                    self.pop_operands(&params)?;
                    if self.ctx.is_elided(*index) {
                        // The callee has no body and is never emitted;
                        // its arguments die here.
                        for _ in 0..width(&params) {
                            code.push(M::Drop);
                        }
                    } else {
                        code.push(M::Exec(ModuleContext::proc_name(*index)));
                    }
                    for &result in &results {
                        self.push_operand(result);
                    }
                }

                Instruction::Drop => {
                    match self.stack.pop() {
                        Some(ValueType::I64) => {
                            code.push(M::Drop);
                            code.push(M::Drop);
                        }
                        Some(_) => code.push(M::Drop),
                        None => return Err(self.err(ErrorKind::EmptyStack)),
                    }
                }
                Instruction::Select => {
                    self.pop_operands(&[ValueType::I32])?;
                    let (second, first) = match (self.stack.pop(), self.stack.pop()) {
                        (Some(second), Some(first)) => (second, first),
                        _ => return Err(self.err(ErrorKind::EmptyStack)),
                    };
                    if first != second {
                        return Err(self.err(ErrorKind::ExpectedStack(vec![first, first])));
                    }
                    if first == ValueType::I64 {
                        return Err(
                            self.err(ErrorKind::UnsupportedInstruction(instruction.clone()))
                        );
                    }
                    self.push_operand(first);
                    code.push(M::CDrop);
                }

                Instruction::GetLocal(index) => {
                    let (ty, cells) = self.local(*index, instruction)?;
                    for &cell in &cells {
                        code.push(M::LocLoad(cell));
                    }
                    self.push_operand(ty);
                }
                Instruction::SetLocal(index) => {
                    let (ty, cells) = self.local(*index, instruction)?;
                    self.pop_operands(&[ty])?;
                    for &cell in cells.iter().rev() {
                        code.push(M::LocStore(cell));
                        code.push(M::Drop);
                    }
                }
                Instruction::TeeLocal(index) => {
                    let (ty, cells) = self.local(*index, instruction)?;
                    self.pop_operands(&[ty])?;
                    for &cell in cells.iter().rev() {
                        code.push(M::LocStore(cell));
                        code.push(M::Drop);
                    }
                    for &cell in &cells {
                        code.push(M::LocLoad(cell));
                    }
                    self.push_operand(ty);
                }

                Instruction::GetGlobal(index) => {
                    let (ty, addr) = match self.layout.global(*index) {
                        Some(global) => global,
                        None => {
                            return Err(self
                                .err(ErrorKind::UnsupportedInstruction(instruction.clone())))
                        }
                    };
                    code.push(M::MemLoad(Some(addr)));
                    if ty == ValueType::I64 {
                        code.push(M::MemLoad(Some(addr + 1)));
                    }
                    self.push_operand(ty);
                }
                Instruction::SetGlobal(index) => {
                    let (ty, addr) = match self.layout.global(*index) {
                        Some(global) => global,
                        None => {
                            return Err(self
                                .err(ErrorKind::UnsupportedInstruction(instruction.clone())))
                        }
                    };
                    self.pop_operands(&[ty])?;
                    code.extend(global_store(ty, addr));
                }

                Instruction::I32Const(value) => {
                    code.push(M::Push(*value as u32));
                    self.push_operand(ValueType::I32);
                }
                Instruction::I64Const(value) => {
                    let value = *value as u64;
                    code.push(M::Push(value as u32));
                    code.push(M::Push((value >> 32) as u32));
                    self.push_operand(ValueType::I64);
                }

                Instruction::I32Load(_, offset) => {
                    self.pop_operands(&[ValueType::I32])?;
                    self.word_address(*offset, &mut code);
                    code.push(M::MemLoad(None));
                    self.push_operand(ValueType::I32);
                }
                Instruction::I32Store(_, offset) => {
                    self.pop_operands(&[ValueType::I32, ValueType::I32])?;
                    code.push(M::Swap(1));
                    self.word_address(*offset, &mut code);
                    code.push(M::MemStore(None));
                    code.push(M::Drop);
                }
                Instruction::I64Load(_, offset) => {
                    self.require_word_aligned(*offset)?;
                    self.pop_operands(&[ValueType::I32])?;
                    self.word_address(*offset, &mut code);
                    code.push(M::Dup(0));
                    code.push(M::MemLoad(None));
                    code.push(M::Swap(1));
                    code.push(M::Push(1));
                    code.push(M::IAdd);
                    code.push(M::MemLoad(None));
                    self.push_operand(ValueType::I64);
                }
                Instruction::I64Store(_, offset) => {
                    self.require_word_aligned(*offset)?;
                    self.pop_operands(&[ValueType::I32, ValueType::I64])?;
                    code.push(M::MovUp(2));
                    self.word_address(*offset, &mut code);
                    code.push(M::Swap(1));
                    code.push(M::Dup(1));
                    code.push(M::Push(1));
                    code.push(M::IAdd);
                    code.push(M::MemStore(None));
                    code.push(M::Drop);
                    code.push(M::MemStore(None));
                    code.push(M::Drop);
                }
                Instruction::I32Load8U(_, offset) => {
                    self.subword_load(&mut code, *offset, 0xFF, false)?;
                }
                Instruction::I32Load8S(_, offset) => {
                    self.subword_load(&mut code, *offset, 0xFF, true)?;
                }
                Instruction::I32Load16U(_, offset) => {
                    self.subword_load(&mut code, *offset, 0xFFFF, false)?;
                }
                Instruction::I32Load16S(_, offset) => {
                    self.subword_load(&mut code, *offset, 0xFFFF, true)?;
                }
                Instruction::I32Store8(_, offset) => {
                    self.subword_store32(&mut code, *offset, 0xFF)?;
                }
                Instruction::I32Store16(_, offset) => {
                    self.subword_store32(&mut code, *offset, 0xFFFF)?;
                }
                Instruction::I64Store8(_, offset) => {
                    self.subword_store64(&mut code, *offset, 0xFF)?;
                }
                Instruction::I64Store16(_, offset) => {
                    self.subword_store64(&mut code, *offset, 0xFFFF)?;
                }

                Instruction::I32Add => self.binop32(&mut code, vec![M::IAdd])?,
                Instruction::I32Sub => self.binop32(&mut code, vec![M::ISub])?,
                Instruction::I32Mul => self.binop32(&mut code, vec![M::IMul])?,
                Instruction::I32DivU => self.binop32(&mut code, vec![M::IDiv])?,
                Instruction::I32RemU => self.binop32(&mut code, vec![M::IMod])?,
                Instruction::I32And => self.binop32(&mut code, vec![M::IAnd])?,
                Instruction::I32Or => self.binop32(&mut code, vec![M::IOr])?,
                Instruction::I32Xor => self.binop32(&mut code, vec![M::IXor])?,
                Instruction::I32Shl => self.binop32(&mut code, vec![M::IShl])?,
                Instruction::I32ShrU => self.binop32(&mut code, vec![M::IShr])?,
                Instruction::I32DivS => {
                    let mut ops = Vec::new();
                    Self::div_s(&mut ops);
                    self.binop32(&mut code, ops)?;
                }
                Instruction::I32ShrS => {
                    let mut ops = Vec::new();
                    Self::shr_s(&mut ops);
                    self.binop32(&mut code, ops)?;
                }

                Instruction::I32Eqz => {
                    self.pop_operands(&[ValueType::I32])?;
                    self.push_operand(ValueType::I32);
                    code.push(M::IEq(Some(0)));
                }
                Instruction::I32Eq => self.relop32(&mut code, vec![M::IEq(None)])?,
                Instruction::I32Ne => self.relop32(&mut code, vec![M::INeq(None)])?,
                Instruction::I32LtU => self.relop32(&mut code, vec![M::ILt])?,
                Instruction::I32GtU => self.relop32(&mut code, vec![M::IGt])?,
                Instruction::I32LeU => self.relop32(&mut code, vec![M::ILte])?,
                Instruction::I32GeU => self.relop32(&mut code, vec![M::IGte])?,
                Instruction::I32LtS => {
                    let mut ops = Vec::new();
                    Self::cmp_s(&mut ops, false, false);
                    self.relop32(&mut code, ops)?;
                }
                Instruction::I32GtS => {
                    let mut ops = Vec::new();
                    Self::cmp_s(&mut ops, true, false);
                    self.relop32(&mut code, ops)?;
                }
                Instruction::I32GeS => {
                    let mut ops = Vec::new();
                    Self::cmp_s(&mut ops, true, true);
                    self.relop32(&mut code, ops)?;
                }
                Instruction::I32LeS => {
                    let mut ops = Vec::new();
                    Self::cmp_s(&mut ops, false, true);
                    self.relop32(&mut code, ops)?;
                }

                Instruction::I64Add => self.binop64(&mut code, M::IAdd64)?,
                Instruction::I64Sub => self.binop64(&mut code, M::ISub64)?,
                Instruction::I64Mul => self.binop64(&mut code, M::IMul64)?,
                Instruction::I64And => self.binop64(&mut code, M::IAnd64)?,
                Instruction::I64Or => self.binop64(&mut code, M::IOr64)?,
                Instruction::I64Xor => self.binop64(&mut code, M::IXor64)?,
                Instruction::I64Shl => {
                    self.pop_operands(&[ValueType::I64, ValueType::I64])?;
                    self.push_operand(ValueType::I64);
                    // The shift amount is a 64-bit value whose high word
                    // cannot contribute; only the low word is consumed.
                    code.push(M::Drop);
                    code.push(M::IShl64);
                }
                Instruction::I64ShrU => {
                    self.pop_operands(&[ValueType::I64, ValueType::I64])?;
                    self.push_operand(ValueType::I64);
                    code.push(M::Drop);
                    code.push(M::IShr64);
                }
                Instruction::I64DivU
                | Instruction::I64RemU
                | Instruction::I64DivS
                | Instruction::I64RemS
                | Instruction::I64ShrS
                | Instruction::I64Rotl
                | Instruction::I64Rotr
                | Instruction::I64Clz
                | Instruction::I64Ctz
                | Instruction::I64Popcnt
                | Instruction::I64LtS
                | Instruction::I64GtS
                | Instruction::I64LeS
                | Instruction::I64GeS => {
                    return Err(self.err(ErrorKind::Unsupported64Bit(instruction.clone())))
                }

                Instruction::I64Eqz => {
                    self.pop_operands(&[ValueType::I64])?;
                    self.push_operand(ValueType::I32);
                    code.push(M::Push(0));
                    code.push(M::Push(0));
                    code.push(M::IEq64);
                }
                Instruction::I64Eq => self.relop64(&mut code, M::IEq64)?,
                Instruction::I64Ne => self.relop64(&mut code, M::INeq64)?,
                Instruction::I64LtU => self.relop64(&mut code, M::ILt64)?,
                Instruction::I64GtU => self.relop64(&mut code, M::IGt64)?,
                Instruction::I64LeU => self.relop64(&mut code, M::ILte64)?,
                Instruction::I64GeU => self.relop64(&mut code, M::IGte64)?,

                Instruction::I32WrapI64 => {
                    self.pop_operands(&[ValueType::I64])?;
                    self.push_operand(ValueType::I32);
                    code.push(M::Drop);
                }
                Instruction::I64ExtendUI32 => {
                    self.pop_operands(&[ValueType::I32])?;
                    self.push_operand(ValueType::I64);
                    code.push(M::Push(0));
                }
                Instruction::I64ExtendSI32 => {
                    self.pop_operands(&[ValueType::I32])?;
                    self.push_operand(ValueType::I64);
                    code.push(M::Dup(0));
                    Self::is_negative(&mut code);
                    code.push(M::If(vec![M::Push(u32::MAX)], vec![M::Push(0)]));
                }

                unsupported => {
                    return Err(
                        self.err(ErrorKind::UnsupportedInstruction(unsupported.clone()))
                    )
                }
            }
        }
    }
}
