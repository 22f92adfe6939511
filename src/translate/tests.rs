use assert_matches::assert_matches;
use parity_wasm::{deserialize_buffer, elements::Module};

use super::translate_module;
use crate::{
    masm::{
        self,
        Instruction::{self, *},
    },
    Error, ErrorKind,
};

fn translate(wat: &str) -> masm::Module {
    let wasm = wat::parse_str(wat).unwrap();
    let module = deserialize_buffer::<Module>(&wasm).unwrap();
    translate_module(&module).unwrap()
}

fn translate_err(wat: &str) -> Vec<Error> {
    let wasm = wat::parse_str(wat).unwrap();
    let module = deserialize_buffer::<Module>(&wasm).unwrap();
    translate_module(&module).unwrap_err()
}

fn proc_body(module: &masm::Module, name: &str) -> Vec<Instruction> {
    module.proc(name).unwrap().body.clone()
}

/// Expected shape of the guard wrapped around the continuation of every
/// block construct.
fn continue_guard(rest: Vec<Instruction>) -> Vec<Instruction> {
    vec![
        MemLoad(Some(0)),
        IEq(Some(1)),
        If(
            vec![Push(0), MemStore(Some(0)), Drop, Push(1)],
            vec![
                MemLoad(Some(0)),
                IEqz,
                If(
                    vec![Push(1)],
                    vec![
                        MemLoad(Some(0)),
                        Push(1),
                        ISub,
                        MemStore(Some(0)),
                        Drop,
                        Push(0),
                    ],
                ),
            ],
        ),
        If(rest, vec![]),
    ]
}

/// Expected tail of every compiled loop body.
fn loop_continue() -> Vec<Instruction> {
    vec![
        MemLoad(Some(0)),
        IEqz,
        If(
            vec![Push(0)],
            vec![
                MemLoad(Some(0)),
                IEq(Some(1)),
                If(
                    vec![Push(0), MemStore(Some(0)), Drop, Push(1)],
                    vec![Push(0)],
                ),
            ],
        ),
    ]
}

/// Expected epilogue of a function that touched the branch counter.
fn counter_reset() -> Vec<Instruction> {
    vec![
        MemLoad(Some(0)),
        IEq(Some(1)),
        If(vec![Push(0), MemStore(Some(0)), Drop], vec![]),
    ]
}

fn negate() -> Vec<Instruction> {
    vec![Push(u32::MAX), Swap(1), ISub, Push(1), IAdd]
}

#[test]
fn const_and_drop() {
    let module = translate(
        r#"
        (module
            (func (export "main")
                i32.const 42
                drop))
    "#,
    );
    assert_eq!(proc_body(&module, "f0"), vec![Push(42), Drop]);
    assert_eq!(module.program, vec![Exec("f0".to_string())]);
    assert_eq!(
        module.imports,
        vec!["std::sys".to_string(), "std::math::u64".to_string()]
    );
}

#[test]
fn i32_add() {
    let module = translate(
        r#"
        (module
            (func (export "main") (result i32)
                i32.const 3
                i32.const 4
                i32.add))
    "#,
    );
    assert_eq!(proc_body(&module, "f0"), vec![Push(3), Push(4), IAdd]);
}

#[test]
fn argument_spill_prelude() {
    let module = translate(
        r#"
        (module
            (func (export "main") (param i32) (param i32) (result i32)
                get_local 0
                get_local 1
                i32.add))
    "#,
    );
    assert_eq!(
        proc_body(&module, "f0"),
        vec![
            // Last argument is on top; it goes into its cell first.
            LocStore(1),
            Drop,
            LocStore(0),
            Drop,
            LocLoad(0),
            LocLoad(1),
            IAdd,
        ]
    );
    assert_eq!(module.proc("f0").unwrap().locals, 2);
}

#[test]
fn i64_constants_push_two_words() {
    let module = translate(
        r#"
        (module
            (func (export "main") (result i64)
                i64.const 0x0123456789ABCDEF))
    "#,
    );
    assert_eq!(
        proc_body(&module, "f0"),
        vec![Push(0x89ABCDEF), Push(0x01234567)]
    );
}

#[test]
fn i64_locals_use_two_cells() {
    let module = translate(
        r#"
        (module
            (func (export "main") (param i64) (result i64)
                get_local 0))
    "#,
    );
    assert_eq!(
        proc_body(&module, "f0"),
        vec![LocStore(1), Drop, LocStore(0), Drop, LocLoad(0), LocLoad(1)]
    );
    assert_eq!(module.proc("f0").unwrap().locals, 2);
}

#[test]
fn br_arms_the_counter() {
    let module = translate(
        r#"
        (module
            (func (export "main")
                (block
                    br 0)))
    "#,
    );
    let mut expected = vec![Push(1), MemStore(Some(0)), Drop];
    expected.extend(continue_guard(vec![]));
    expected.extend(counter_reset());
    assert_eq!(proc_body(&module, "f0"), expected);
}

#[test]
fn loop_compiles_to_while() {
    let module = translate(
        r#"
        (module
            (func (export "main")
                (block
                    (loop
                        br 1))))
    "#,
    );
    let mut while_body = vec![Push(2), MemStore(Some(0)), Drop];
    while_body.extend(loop_continue());
    let mut expected = vec![Push(1), While(while_body)];
    expected.extend(continue_guard(vec![]));
    expected.extend(continue_guard(vec![]));
    expected.extend(counter_reset());
    assert_eq!(proc_body(&module, "f0"), expected);
}

#[test]
fn if_with_both_arms() {
    let module = translate(
        r#"
        (module
            (func (export "main") (param i32) (result i32)
                (if (result i32) (get_local 0)
                    (then (i32.const 1))
                    (else (i32.const 2)))))
    "#,
    );
    let mut expected = vec![
        LocStore(0),
        Drop,
        LocLoad(0),
        INeq(Some(0)),
        If(vec![Push(1)], vec![Push(2)]),
    ];
    expected.extend(continue_guard(vec![]));
    expected.extend(counter_reset());
    assert_eq!(proc_body(&module, "f0"), expected);
}

#[test]
fn if_with_empty_arms_pops_the_condition() {
    let module = translate(
        r#"
        (module
            (func (export "main") (param i32)
                (if (get_local 0) (then))))
    "#,
    );
    let mut expected = vec![LocStore(0), Drop, LocLoad(0), Drop];
    expected.extend(continue_guard(vec![]));
    expected.extend(counter_reset());
    assert_eq!(proc_body(&module, "f0"), expected);
}

#[test]
fn if_with_empty_then_swaps_arms() {
    let module = translate(
        r#"
        (module
            (func (export "main") (param i32) (result i32)
                (local i32)
                (if (get_local 0)
                    (then)
                    (else (i32.const 7) (set_local 1)))
                get_local 1))
    "#,
    );
    let mut expected = vec![
        LocStore(0),
        Drop,
        LocLoad(0),
        IEq(Some(0)),
        If(vec![Push(7), LocStore(1), Drop], vec![]),
    ];
    expected.extend(continue_guard(vec![LocLoad(1)]));
    expected.extend(counter_reset());
    assert_eq!(proc_body(&module, "f0"), expected);
}

#[test]
fn br_if_branches_into_the_taken_arm() {
    let module = translate(
        r#"
        (module
            (func (export "main") (result i32)
                (block (result i32)
                    i32.const 1
                    i32.const 1
                    br_if 0
                    drop
                    i32.const 2)))
    "#,
    );
    let mut expected = vec![
        Push(1),
        Push(1),
        INeq(Some(0)),
        If(
            vec![Push(1), MemStore(Some(0)), Drop],
            vec![Drop, Push(2)],
        ),
    ];
    expected.extend(continue_guard(vec![]));
    expected.extend(counter_reset());
    assert_eq!(proc_body(&module, "f0"), expected);
}

#[test]
fn br_table_compiles_to_a_comparison_chain() {
    let module = translate(
        r#"
        (module
            (func (export "main") (param i32)
                (block
                    (block
                        get_local 0
                        br_table 0 1))))
    "#,
    );
    let mut expected = vec![
        LocStore(0),
        Drop,
        LocLoad(0),
        Dup(0),
        IEq(Some(0)),
        If(
            vec![Drop, Push(1), MemStore(Some(0)), Drop],
            vec![Drop, Push(2), MemStore(Some(0)), Drop],
        ),
    ];
    expected.extend(continue_guard(vec![]));
    expected.extend(continue_guard(vec![]));
    expected.extend(counter_reset());
    assert_eq!(proc_body(&module, "f0"), expected);
}

#[test]
fn select_compiles_to_cdrop() {
    let module = translate(
        r#"
        (module
            (func (export "main") (result i32)
                i32.const 10
                i32.const 20
                i32.const 1
                select))
    "#,
    );
    assert_eq!(
        proc_body(&module, "f0"),
        vec![Push(10), Push(20), Push(1), CDrop]
    );
}

#[test]
fn calls_become_execs_in_topological_order() {
    let module = translate(
        r#"
        (module
            (func $add (param i32) (param i32) (result i32)
                get_local 0
                get_local 1
                i32.add)
            (func (export "main") (result i32)
                i32.const 3
                i32.const 4
                call $add))
    "#,
    );
    let names: Vec<&str> = module
        .procedures
        .iter()
        .map(|(name, _)| name.as_str())
        .collect();
    assert_eq!(names, vec!["f0", "f1"]);
    assert_eq!(
        proc_body(&module, "f1"),
        vec![Push(3), Push(4), Exec("f0".to_string())]
    );
}

#[test]
fn calls_to_empty_functions_compile_to_drops() {
    let module = translate(
        r#"
        (module
            (func $sink (param i32) (param i64))
            (func (export "main")
                i32.const 1
                i64.const 2
                call $sink))
    "#,
    );
    // The empty callee is never emitted.
    assert!(module.proc("f0").is_none());
    assert_eq!(
        proc_body(&module, "f1"),
        vec![Push(1), Push(2), Push(0), Drop, Drop, Drop]
    );
}

#[test]
fn globals_live_at_fixed_addresses() {
    let module = translate(
        r#"
        (module
            (global $g (mut i32) (i32.const 5))
            (func (export "main") (result i32)
                get_global 0
                i32.const 1
                i32.add
                set_global 0
                get_global 0))
    "#,
    );
    assert_eq!(
        proc_body(&module, "f0"),
        vec![
            MemLoad(Some(1)),
            Push(1),
            IAdd,
            MemStore(Some(1)),
            Drop,
            MemLoad(Some(1)),
        ]
    );
    assert_eq!(
        module.program,
        vec![Push(5), MemStore(Some(1)), Drop, Exec("f0".to_string())]
    );
}

#[test]
fn i64_globals_take_two_words() {
    let module = translate(
        r#"
        (module
            (global $g (mut i64) (i64.const -1))
            (func (export "main") (result i64)
                get_global 0))
    "#,
    );
    assert_eq!(
        proc_body(&module, "f0"),
        vec![MemLoad(Some(1)), MemLoad(Some(2))]
    );
    assert_eq!(
        module.program,
        vec![
            Push(u32::MAX),
            Push(u32::MAX),
            MemStore(Some(2)),
            Drop,
            MemStore(Some(1)),
            Drop,
            Exec("f0".to_string()),
        ]
    );
}

#[test]
fn data_segments_pack_little_endian_words() {
    let module = translate(
        r#"
        (module
            (memory 1)
            (data (i32.const 4) "abcde")
            (func (export "main")
                nop))
    "#,
    );
    assert_eq!(
        module.program,
        vec![
            Push(4),
            Push(4),
            IDiv,
            Push(1),
            IAdd,
            // "abcd"
            Dup(0),
            Push(0x64636261),
            Swap(1),
            MemStore(None),
            Drop,
            Push(1),
            IAdd,
            // "e" padded with zeroes
            Dup(0),
            Push(0x65),
            Swap(1),
            MemStore(None),
            Drop,
            Push(1),
            IAdd,
            Drop,
            Exec("f0".to_string()),
        ]
    );
}

#[test]
fn word_aligned_i32_load_store() {
    let module = translate(
        r#"
        (module
            (func (export "main") (result i32)
                i32.const 8
                i32.const 7
                i32.store
                i32.const 8
                i32.load offset=4))
    "#,
    );
    assert_eq!(
        proc_body(&module, "f0"),
        vec![
            Push(8),
            Push(7),
            Swap(1),
            Push(4),
            IDiv,
            Push(1),
            IAdd,
            MemStore(None),
            Drop,
            Push(8),
            Push(4),
            IDiv,
            Push(2),
            IAdd,
            MemLoad(None),
        ]
    );
}

#[test]
fn i64_load_splits_into_two_words() {
    let module = translate(
        r#"
        (module
            (func (export "main") (result i64)
                i32.const 8
                i64.load))
    "#,
    );
    assert_eq!(
        proc_body(&module, "f0"),
        vec![
            Push(8),
            Push(4),
            IDiv,
            Push(1),
            IAdd,
            Dup(0),
            MemLoad(None),
            Swap(1),
            Push(1),
            IAdd,
            MemLoad(None),
        ]
    );
}

#[test]
fn sub_word_load_masks_and_shifts() {
    let module = translate(
        r#"
        (module
            (func (export "main") (result i32)
                i32.const 5
                i32.load8_u))
    "#,
    );
    assert_eq!(
        proc_body(&module, "f0"),
        vec![
            Push(5),
            IDivMod(Some(4)),
            Push(8),
            IMul,
            Swap(1),
            Push(1),
            IAdd,
            MemLoad(None),
            Dup(1),
            Push(0xFF),
            Swap(1),
            IShl,
            IAnd,
            Swap(1),
            IShr,
        ]
    );
}

#[test]
fn sign_extending_load_widens_negative_bytes() {
    let module = translate(
        r#"
        (module
            (func (export "main") (result i32)
                i32.const 5
                i32.load8_s))
    "#,
    );
    let body = proc_body(&module, "f0");
    let mut extend = vec![Push(0xFF), Swap(1), ISub, Push(1), IAdd];
    extend.extend(negate());
    let expected_tail = vec![Dup(0), Push(127), IGt, If(extend, vec![])];
    assert_eq!(body[body.len() - expected_tail.len()..], expected_tail[..]);
}

#[test]
fn sub_word_store_preserves_neighbors() {
    let module = translate(
        r#"
        (module
            (func (export "main")
                i32.const 9
                i32.const 0xAB
                i32.store8))
    "#,
    );
    assert_eq!(
        proc_body(&module, "f0"),
        vec![
            Push(9),
            Push(0xAB),
            Swap(1),
            IDivMod(Some(4)),
            Push(8),
            IMul,
            Swap(1),
            Push(1),
            IAdd,
            MovUp(2),
            Dup(2),
            IShl,
            MovUp(2),
            Push(0xFF),
            Swap(1),
            IShl,
            INot,
            Dup(2),
            MemLoad(None),
            IAnd,
            IOr,
            Swap(1),
            MemStore(None),
            Drop,
        ]
    );
}

#[test]
fn signed_division_works_on_magnitudes() {
    let module = translate(
        r#"
        (module
            (func (export "main") (result i32)
                i32.const -10
                i32.const 3
                i32.div_s))
    "#,
    );
    let mut expected = vec![Push(-10i32 as u32), Push(3)];
    expected.extend(vec![Dup(1), Push(i32::MAX as u32), IGt]);
    expected.extend(vec![Dup(1), Push(i32::MAX as u32), IGt, IXor]);
    expected.push(MovUp(2));
    expected.extend(vec![Dup(0), Push(i32::MAX as u32), IGt, If(negate(), vec![])]);
    expected.push(MovUp(2));
    expected.extend(vec![Dup(0), Push(i32::MAX as u32), IGt, If(negate(), vec![])]);
    expected.push(IDiv);
    expected.push(Swap(1));
    expected.push(If(negate(), vec![]));
    assert_eq!(proc_body(&module, "f0"), expected);
}

#[test]
fn wrap_and_extend() {
    let module = translate(
        r#"
        (module
            (func (export "main") (result i64)
                i32.const -1
                i64.extend_i32_s))
    "#,
    );
    assert_eq!(
        proc_body(&module, "f0"),
        vec![
            Push(u32::MAX),
            Dup(0),
            Push(i32::MAX as u32),
            IGt,
            If(vec![Push(u32::MAX)], vec![Push(0)]),
        ]
    );

    let module = translate(
        r#"
        (module
            (func (export "main") (result i32)
                i64.const 7
                i32.wrap_i64))
    "#,
    );
    assert_eq!(proc_body(&module, "f0"), vec![Push(7), Push(0), Drop]);
}

#[test]
fn start_section_runs_before_main() {
    let module = translate(
        r#"
        (module
            (func $init
                nop)
            (func (export "main")
                i32.const 1
                drop)
            (start $init))
    "#,
    );
    assert_eq!(
        module.program,
        vec![Exec("f0".to_string()), Exec("f1".to_string())]
    );
}

#[test]
fn underscore_start_is_an_entry() {
    let module = translate(
        r#"
        (module
            (func (export "_start")
                nop))
    "#,
    );
    assert_eq!(module.program, vec![Exec("f0".to_string())]);
}

#[test]
fn wasi_methods_are_emitted_with_their_init() {
    let module = translate(
        r#"
        (module
            (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
            (func (export "_start")
                i32.const 7
                call $exit))
    "#,
    );
    // status_code lives at address 1, right after the branch counter.
    assert_eq!(
        proc_body(&module, "f0"),
        vec![MemStore(Some(1)), Drop, Push(0), Assert]
    );
    assert_eq!(
        module.program,
        vec![
            Push(0),
            MemStore(Some(1)),
            Drop,
            Exec("f1".to_string()),
        ]
    );
    assert_eq!(proc_body(&module, "f1"), vec![Push(7), Exec("f0".to_string())]);
}

#[test]
fn translation_is_deterministic() {
    let wat = r#"
        (module
            (global $g (mut i32) (i32.const 3))
            (memory 1)
            (data (i32.const 0) "xyz")
            (func $helper (param i32) (result i32)
                get_local 0
                i32.const 2
                i32.mul)
            (func (export "main") (result i32)
                i32.const 21
                call $helper))
    "#;
    let first = translate(wat);
    let second = translate(wat);
    assert_eq!(first, second);
}

#[test]
fn every_exec_refers_to_an_earlier_procedure() {
    let module = translate(
        r#"
        (module
            (func $a (result i32)
                i32.const 1)
            (func $b (result i32)
                call $a)
            (func (export "main") (result i32)
                call $a
                call $b
                i32.add))
    "#,
    );

    fn check(defined: &[String], instructions: &[Instruction]) {
        for instruction in instructions {
            match instruction {
                Exec(name) => assert!(defined.contains(name), "{} executed early", name),
                If(then_body, else_body) => {
                    check(defined, then_body);
                    check(defined, else_body);
                }
                While(body) => check(defined, body),
                _ => {}
            }
        }
    }

    let mut defined = Vec::new();
    for (name, proc) in &module.procedures {
        check(&defined, &proc.body);
        defined.push(name.clone());
    }
    check(&defined, &module.program);
}

#[test]
fn missing_entry_is_rejected() {
    let errors = translate_err(
        r#"
        (module
            (func
                nop))
    "#,
    );
    assert_matches!(*errors[0].kind(), ErrorKind::NoEntry);
}

#[test]
fn unknown_imports_are_rejected() {
    let errors = translate_err(
        r#"
        (module
            (import "env" "mystery" (func $m))
            (func (export "main")
                call $m))
    "#,
    );
    assert_matches!(*errors[0].kind(), ErrorKind::BadImport { .. });
}

#[test]
fn float_signatures_are_rejected() {
    let errors = translate_err(
        r#"
        (module
            (func (export "main") (param f32)
                nop))
    "#,
    );
    assert_matches!(
        errors[0].kind(),
        ErrorKind::UnsupportedArgType(parity_wasm::elements::ValueType::F32)
    );
}

#[test]
fn float_instructions_are_rejected() {
    let errors = translate_err(
        r#"
        (module
            (func (export "main")
                f32.add))
    "#,
    );
    assert_matches!(*errors[0].kind(), ErrorKind::UnsupportedInstruction(_));
}

#[test]
fn signed_64_bit_division_is_rejected() {
    let errors = translate_err(
        r#"
        (module
            (func (export "main")
                i64.const 1
                i64.const 1
                i64.div_u
                drop))
    "#,
    );
    assert_matches!(*errors[0].kind(), ErrorKind::Unsupported64Bit(_));
}

#[test]
fn misaligned_i64_access_is_rejected() {
    let errors = translate_err(
        r#"
        (module
            (func (export "main") (result i64)
                i32.const 0
                i64.load offset=2))
    "#,
    );
    assert_matches!(*errors[0].kind(), ErrorKind::MisalignedI64Access(2));
}

#[test]
fn drop_from_an_empty_stack_is_rejected() {
    let errors = translate_err(
        r#"
        (module
            (func (export "main")
                drop))
    "#,
    );
    assert_matches!(*errors[0].kind(), ErrorKind::EmptyStack);
}

#[test]
fn operand_type_mismatches_are_rejected() {
    let errors = translate_err(
        r#"
        (module
            (func (export "main") (result i32)
                i32.const 1
                i32.add))
    "#,
    );
    assert_matches!(*errors[0].kind(), ErrorKind::ExpectedStack(_));
}

#[test]
fn errors_accumulate_across_functions() {
    let errors = translate_err(
        r#"
        (module
            (func $bad1
                drop)
            (func $bad2 (result i32)
                i32.const 1
                i32.add)
            (func (export "main")
                call $bad1
                call $bad2
                drop))
    "#,
    );
    assert_eq!(errors.len(), 2);
}
