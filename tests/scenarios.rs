use lua_dec_rs::chunk::Instruction::*;
use lua_dec_rs::chunk::{BinOp, CompareOp, Constant, FunctionId, Instruction, LocalVar, Operand, Prototype, Upvalue};
use lua_dec_rs::error::ErrorKind;
use lua_dec_rs::{DecompileOptions, Decompiler};

fn main_chunk(code: Vec<Instruction>, constants: &[&str]) -> Prototype {
    let mut proto = Prototype::new(
        code,
        constants.iter().map(|c| Constant::String((*c).into())).collect(),
        8,
    );
    proto.upvalues = vec![Upvalue {
        in_stack: true,
        index: 0,
        name: Some("_ENV".to_string()),
    }];
    proto.is_vararg = true;
    proto
}

fn local(name: &str, start_pc: usize, end_pc: usize) -> LocalVar {
    LocalVar {
        name: name.to_string(),
        start_pc,
        end_pc,
    }
}

fn global(a: usize, constant: usize) -> Instruction {
    GetTabUp {
        a,
        upvalue: 0,
        key: Operand::Constant(constant),
    }
}

fn call(a: usize, args: usize) -> Instruction {
    Call {
        a,
        args: Some(args),
        results: Some(0),
    }
}

fn ret() -> Instruction {
    Return { a: 0, count: Some(0) }
}

fn decompiler() -> Decompiler {
    Decompiler::new(DecompileOptions {
        indent: "  ".to_string(),
        ..DecompileOptions::default()
    })
}

fn decompile(proto: &Prototype) -> String {
    let report = decompiler().decompile(proto);
    assert!(report.is_complete(), "unexpected failures: {:?}", report.failures);
    report.text
}

fn numeric_for(step: i64) -> Vec<Instruction> {
    vec![
        LoadInt { a: 0, value: 0 },
        LoadInt { a: 1, value: 9 },
        LoadInt { a: 2, value: step },
        ForPrep { a: 0, offset: 0 },
        ForLoop { a: 0, offset: -1 },
        ret(),
    ]
}

#[test]
fn test_numeric_for_uses_debug_name() {
    let mut proto = main_chunk(numeric_for(1), &[]);
    proto.locals = vec![
        local("(for state)", 3, 5),
        local("(for state)", 3, 5),
        local("(for state)", 3, 5),
        local("i", 4, 5),
    ];
    assert_eq!(decompile(&proto), "for i = 0, 9 do\nend\n");
}

#[test]
fn test_numeric_for_step_is_printed_unless_one() {
    let stripped = main_chunk(numeric_for(2), &[]);
    assert_eq!(decompile(&stripped), "for L0_1 = 0, 9, 2 do\nend\n");
    let unit = main_chunk(numeric_for(1), &[]);
    assert_eq!(decompile(&unit), "for L0_1 = 0, 9 do\nend\n");
}

#[test]
fn test_unprotected_while_declares_body_local_before_end() {
    let mut proto = main_chunk(
        vec![
            Jmp { offset: 1 },
            LoadInt { a: 0, value: 1 },
            global(0, 0),
            Test { a: 0, k: true },
            Jmp { offset: -4 },
            ret(),
        ],
        &["c"],
    );
    proto.locals = vec![local("y", 2, 2)];
    assert_eq!(decompile(&proto), "while c do\n  local y = 1\nend\n");
}

#[test]
fn test_if_else() {
    let proto = main_chunk(
        vec![
            global(0, 0),
            Test { a: 0, k: false },
            Jmp { offset: 4 },
            global(0, 1),
            LoadInt { a: 1, value: 1 },
            call(0, 1),
            Jmp { offset: 3 },
            global(0, 1),
            LoadInt { a: 1, value: 2 },
            call(0, 1),
            ret(),
        ],
        &["x", "print"],
    );
    assert_eq!(
        decompile(&proto),
        "if x then\n  print(1)\nelse\n  print(2)\nend\n"
    );
}

#[test]
fn test_elseif_chain() {
    let proto = main_chunk(
        vec![
            global(0, 0),
            Test { a: 0, k: false },
            Jmp { offset: 3 },
            global(0, 1),
            call(0, 0),
            Jmp { offset: 5 },
            global(0, 2),
            Test { a: 0, k: false },
            Jmp { offset: 2 },
            global(0, 3),
            call(0, 0),
            ret(),
        ],
        &["a", "f", "b", "g"],
    );
    let expected = "if a then\n  f()\nelseif b then\n  g()\nend\n";
    assert_eq!(decompile(&proto), expected);

    let nested = Decompiler::new(DecompileOptions {
        indent: "  ".to_string(),
        elseif_chains: false,
        ..DecompileOptions::default()
    })
    .decompile(&proto);
    assert_eq!(
        nested.text,
        "if a then\n  f()\nelse\n  if b then\n    g()\n  end\nend\n"
    );
}

#[test]
fn test_generic_for_with_debug_names() {
    let mut proto = main_chunk(
        vec![
            global(0, 0),
            global(1, 1),
            Call {
                a: 0,
                args: Some(1),
                results: Some(4),
            },
            TForPrep { a: 0, offset: 3 },
            global(6, 2),
            Move { a: 7, b: 4 },
            call(6, 1),
            TForCall { a: 0, results: 2 },
            TForLoop { a: 0, offset: -5 },
            ret(),
        ],
        &["pairs", "t", "print"],
    );
    proto.locals = vec![
        local("(for state)", 3, 9),
        local("(for state)", 3, 9),
        local("(for state)", 3, 9),
        local("(for state)", 3, 9),
        local("k", 4, 7),
        local("v", 4, 7),
    ];
    assert_eq!(
        decompile(&proto),
        "for k, v in pairs(t) do\n  print(k)\nend\n"
    );
}

#[test]
fn test_repeat_until() {
    let mut proto = main_chunk(
        vec![
            LoadInt { a: 0, value: 0 },
            Binary {
                a: 0,
                op: BinOp::Add,
                left: Operand::Register(0),
                right: Operand::Integer(1),
            },
            Compare {
                op: CompareOp::Lt,
                left: Operand::Integer(3),
                right: Operand::Register(0),
                k: false,
            },
            Jmp { offset: -3 },
            ret(),
        ],
        &[],
    );
    proto.locals = vec![local("i", 1, 5)];
    assert_eq!(
        decompile(&proto),
        "local i = 0\nrepeat\n  i = i + 1\nuntil 3 < i\n"
    );
}

#[test]
fn test_method_call() {
    let proto = main_chunk(
        vec![
            global(0, 0),
            Method {
                a: 0,
                object: 0,
                key: Operand::Constant(1),
            },
            LoadInt { a: 2, value: 1 },
            call(0, 2),
            ret(),
        ],
        &["obj", "go"],
    );
    assert_eq!(decompile(&proto), "obj:go(1)\n");
}

#[test]
fn test_recursive_local_function() {
    let mut child = Prototype::new(
        vec![
            GetUpval { a: 0, upvalue: 0 },
            Return { a: 0, count: Some(1) },
            ret(),
        ],
        vec![],
        1,
    );
    child.upvalues = vec![Upvalue {
        in_stack: true,
        index: 0,
        name: Some("fact".to_string()),
    }];
    let mut main = main_chunk(vec![Closure { a: 0, proto: 0 }, ret()], &[]);
    main.prototypes.push(child);
    main.locals = vec![local("fact", 1, 2)];
    assert_eq!(
        decompile(&main),
        "local function fact()\n  return fact\nend\n"
    );
}

#[test]
fn test_straddling_jump_fails_only_its_function() {
    let broken = Prototype::new(
        vec![Jmp { offset: 1 }, LoadInt { a: 0, value: 1 }, ret()],
        vec![],
        1,
    );
    let mut main = main_chunk(
        vec![
            Closure { a: 0, proto: 0 },
            SetTabUp {
                upvalue: 0,
                key: Operand::Constant(0),
                value: Operand::Register(0),
            },
            ret(),
        ],
        &["f"],
    );
    main.prototypes.push(broken);

    let report = decompiler().decompile(&main);
    assert_eq!(report.text, "f = function(...) --[[ decompilation failed ]] end\n");
    assert_eq!(report.failures.len(), 1);
    let failure = &report.failures[0];
    assert_eq!(failure.function, FunctionId::from_path(vec![0]));
    assert_eq!(failure.error.kind(), ErrorKind::StructuralInconsistency);
    assert_eq!(failure.error.pc(), Some(0));
}

#[test]
fn test_printing_is_deterministic() {
    let proto = main_chunk(
        vec![
            global(0, 0),
            Test { a: 0, k: false },
            Jmp { offset: 4 },
            global(0, 1),
            LoadInt { a: 1, value: 1 },
            call(0, 1),
            Jmp { offset: 3 },
            global(0, 1),
            LoadInt { a: 1, value: 2 },
            call(0, 1),
            ret(),
        ],
        &["x", "print"],
    );
    let first = decompile(&proto);
    let second = decompile(&proto);
    assert_eq!(first, second);

    let sequential = Decompiler::new(DecompileOptions {
        indent: "  ".to_string(),
        parallel: false,
        ..DecompileOptions::default()
    })
    .decompile(&proto);
    assert_eq!(first, sequential.text);
}

#[test]
fn test_closure_below_failed_function_is_printed_on_its_own() {
    let grandchild = Prototype::new(
        vec![LoadInt { a: 0, value: 7 }, Return { a: 0, count: Some(1) }, ret()],
        vec![],
        1,
    );
    let mut broken = Prototype::new(
        vec![
            Closure { a: 0, proto: 0 },
            Jmp { offset: 1 },
            LoadInt { a: 0, value: 1 },
            ret(),
        ],
        vec![],
        1,
    );
    broken.prototypes.push(grandchild);
    let mut main = main_chunk(
        vec![
            Closure { a: 0, proto: 0 },
            SetTabUp {
                upvalue: 0,
                key: Operand::Constant(0),
                value: Operand::Register(0),
            },
            ret(),
        ],
        &["f"],
    );
    main.prototypes.push(broken);

    let report = decompiler().decompile(&main);
    assert_eq!(
        report.text,
        "f = function(...) --[[ decompilation failed ]] end\n\
         -- function main/0/0\n\
         function main_0_0()\n  return 7\nend\n"
    );
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].function, FunctionId::from_path(vec![0]));
}

#[test]
fn test_to_be_closed_local_gets_its_own_scope() {
    let mut proto = main_chunk(
        vec![
            global(0, 0),
            Call {
                a: 0,
                args: Some(0),
                results: Some(1),
            },
            Tbc { a: 0 },
            Close { a: 0 },
            global(0, 1),
            call(0, 0),
            ret(),
        ],
        &["open", "after"],
    );
    proto.locals = vec![local("handle", 2, 3)];
    assert_eq!(
        decompile(&proto),
        "do\n  local handle <close> = open()\nend\nafter()\n"
    );
}

#[test]
fn test_testset_folds_into_and_or() {
    for (k, op) in [(true, "or"), (false, "and")] {
        let mut proto = main_chunk(
            vec![
                global(0, 0),
                TestSet { a: 1, b: 0, k },
                Jmp { offset: 1 },
                LoadInt { a: 1, value: 5 },
                global(2, 1),
                Move { a: 3, b: 1 },
                call(2, 1),
                ret(),
            ],
            &["a", "print"],
        );
        proto.locals = vec![local("x", 1, 8), local("y", 4, 8)];
        assert_eq!(
            decompile(&proto),
            format!("local x = a\nlocal y = x {} 5\nprint(y)\n", op)
        );
    }
}

#[test]
fn test_unassigned_register_fails_only_its_function() {
    let unassigned = Prototype::new(vec![Return { a: 0, count: Some(1) }, ret()], vec![], 1);
    let one = Prototype::new(
        vec![LoadInt { a: 0, value: 1 }, Return { a: 0, count: Some(1) }, ret()],
        vec![],
        1,
    );
    let store = |constant| SetTabUp {
        upvalue: 0,
        key: Operand::Constant(constant),
        value: Operand::Register(0),
    };
    let mut main = main_chunk(
        vec![
            Closure { a: 0, proto: 0 },
            store(0),
            Closure { a: 0, proto: 1 },
            store(1),
            ret(),
        ],
        &["f", "g"],
    );
    main.prototypes.push(unassigned);
    main.prototypes.push(one);

    let report = decompiler().decompile(&main);
    assert_eq!(
        report.text,
        "f = function(...) --[[ decompilation failed ]] end\ng = function()\n  return 1\nend\n"
    );
    assert_eq!(report.failures.len(), 1);
    let failure = &report.failures[0];
    assert_eq!(failure.function, FunctionId::from_path(vec![0]));
    assert_eq!(failure.error.kind(), ErrorKind::UnresolvableReference);
    assert_eq!(failure.error.pc(), Some(0));
}

#[test]
fn test_raw_string_bytes_are_escaped() {
    let mut proto = main_chunk(
        vec![global(0, 0), LoadK { a: 1, constant: 1 }, call(0, 1), ret()],
        &["print"],
    );
    proto.constants.push(Constant::String(vec![0xff, b'!'].into()));
    assert_eq!(decompile(&proto), "print(\"\\255!\")\n");
}
