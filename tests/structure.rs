use lua_dec_rs::chunk::Instruction::*;
use lua_dec_rs::chunk::{BinOp, Instruction, Operand, Prototype};
use lua_dec_rs::{structure, Block, BlockKind};

fn ret() -> Instruction {
    Return { a: 0, count: Some(0) }
}

fn shape(block: &Block) -> Vec<(String, usize, usize, usize)> {
    let mut out = Vec::new();
    collect(block, 0, &mut out);
    out
}

fn collect(block: &Block, depth: usize, out: &mut Vec<(String, usize, usize, usize)>) {
    out.push((block.kind.name().to_string(), depth, block.begin, block.end));
    for child in &block.children {
        collect(child, depth + 1, out);
    }
}

/// `while r{cond} do r{acc} = r{acc} + 1 end` with a leading if.
fn loop_with_if(cond: usize, acc: usize) -> Vec<Instruction> {
    vec![
        Test { a: cond, k: false },
        Jmp { offset: 1 },
        LoadInt { a: acc, value: 0 },
        Test { a: cond, k: false },
        Jmp { offset: 2 },
        Binary { a: acc, op: BinOp::Add, left: Operand::Register(acc), right: Operand::Integer(1) },
        Jmp { offset: -4 },
        ret(),
    ]
}

#[test]
fn test_block_shape_ignores_register_choice() {
    let first = structure(&Prototype::new(loop_with_if(0, 1), vec![], 8)).unwrap();
    let second = structure(&Prototype::new(loop_with_if(5, 2), vec![], 8)).unwrap();
    assert_eq!(shape(&first), shape(&second));
    assert_eq!(
        shape(&first),
        vec![
            ("function".to_string(), 0, 0, 8),
            ("if".to_string(), 1, 0, 3),
            ("sequence".to_string(), 2, 2, 3),
            ("while".to_string(), 1, 3, 7),
            ("sequence".to_string(), 2, 5, 6),
            ("sequence".to_string(), 1, 7, 8),
        ]
    );
}

#[test]
fn test_structuring_is_repeatable() {
    let proto = Prototype::new(loop_with_if(0, 1), vec![], 8);
    let first = structure(&proto).unwrap();
    let second = structure(&proto).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.dump(), second.dump());
}

#[test]
fn test_structured_trees_nest() {
    let programs = vec![
        loop_with_if(0, 1),
        vec![
            ForPrep { a: 0, offset: 1 },
            Move { a: 4, b: 3 },
            ForLoop { a: 0, offset: -2 },
            ret(),
        ],
        vec![
            TForPrep { a: 0, offset: 1 },
            Move { a: 7, b: 4 },
            TForCall { a: 0, results: 2 },
            TForLoop { a: 0, offset: -3 },
            ret(),
        ],
    ];
    for code in programs {
        let root = structure(&Prototype::new(code, vec![], 8)).unwrap();
        root.validate().unwrap();
        assert_eq!(root.kind, BlockKind::Function);
        for child in &root.children {
            assert!(child.begin >= root.begin && child.end <= root.end);
        }
    }
}

#[test]
fn test_bottom_tested_loop_scope_ends_before_its_test() {
    let code = vec![
        Jmp { offset: 1 },
        LoadInt { a: 1, value: 1 },
        Test { a: 0, k: true },
        Jmp { offset: -4 },
        ret(),
    ];
    let root = structure(&Prototype::new(code, vec![], 8)).unwrap();
    let looped = &root.children[0];
    assert!(looped.is_unprotected());
    assert_eq!(looped.unprotected_target(), Some(2));
    assert_eq!(looped.scope_end(), 1);
}

#[test]
fn test_only_bottom_tested_loops_are_unprotected() {
    let root = structure(&Prototype::new(loop_with_if(0, 1), vec![], 8)).unwrap();
    let looped = &root.children[1];
    assert!(matches!(looped.kind, BlockKind::While(_)));
    assert!(!looped.is_unprotected());
    assert_eq!(looped.scope_end(), 5);
}
