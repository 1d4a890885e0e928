//! Decoded function prototypes
//!
//! This is the boundary with the chunk loader: everything in here is
//! produced once per chunk and never mutated by the decompiler.

pub mod constant;
pub mod instruction;

pub use constant::{Constant, ConstantContext, ConstantKind, ConstantTagTable, LuaString, Version};
pub use instruction::{BinOp, CompareOp, Instruction, Operand, Register, UnOp};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Upvalue descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upvalue {
    /// Captured from the enclosing function's registers (`true`) or its upvalues.
    pub in_stack: bool,
    pub index: usize,
    #[serde(default)]
    pub name: Option<String>,
}

/// Local variable debug entry; active for `start_pc <= pc < end_pc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVar {
    pub name: String,
    pub start_pc: usize,
    pub end_pc: usize,
}

impl LocalVar {
    /// Compiler-internal entries such as `(for state)`.
    pub fn is_internal(&self) -> bool {
        self.name.starts_with('(')
    }
}

/// One compiled function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prototype {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub line_defined: usize,
    pub code: Vec<Instruction>,
    #[serde(default)]
    pub constants: Vec<Constant>,
    #[serde(default)]
    pub upvalues: Vec<Upvalue>,
    #[serde(default)]
    pub prototypes: Vec<Prototype>,
    pub max_registers: usize,
    #[serde(default)]
    pub num_params: usize,
    #[serde(default)]
    pub is_vararg: bool,
    /// Source line per instruction; empty when stripped.
    #[serde(default)]
    pub lines: Vec<usize>,
    /// Local variable debug table; empty when stripped.
    #[serde(default)]
    pub locals: Vec<LocalVar>,
}

impl Prototype {
    pub fn new(code: Vec<Instruction>, constants: Vec<Constant>, max_registers: usize) -> Self {
        Self {
            code,
            constants,
            max_registers,
            ..Default::default()
        }
    }

    pub fn constant(&self, index: usize) -> Option<&Constant> {
        self.constants.get(index)
    }

    pub fn line(&self, pc: usize) -> Option<usize> {
        self.lines.get(pc).copied()
    }

    pub fn has_debug_locals(&self) -> bool {
        !self.locals.is_empty()
    }

    /// Debug locals paired with the register each one occupies.
    ///
    /// Active locals form a stack, so a local's register is the number of
    /// earlier locals still alive at its first instruction.
    pub fn local_registers(&self) -> Vec<(Register, &LocalVar)> {
        self.locals
            .iter()
            .enumerate()
            .map(|(i, local)| {
                let register = self.locals[..i]
                    .iter()
                    .filter(|earlier| {
                        earlier.start_pc <= local.start_pc && local.start_pc < earlier.end_pc
                    })
                    .count();
                (register, local)
            })
            .collect()
    }

    /// Resolve a function id relative to this prototype.
    pub fn find(&self, id: &FunctionId) -> Option<&Prototype> {
        id.path()
            .iter()
            .try_fold(self, |proto, index| proto.prototypes.get(*index))
    }

    /// This prototype and all nested ones in declaration (pre-)order.
    pub fn flatten(&self) -> Vec<(FunctionId, &Prototype)> {
        let mut out = Vec::new();
        self.flatten_into(FunctionId::main(), &mut out);
        out
    }

    fn flatten_into<'a>(&'a self, id: FunctionId, out: &mut Vec<(FunctionId, &'a Prototype)>) {
        out.push((id.clone(), self));
        for (index, child) in self.prototypes.iter().enumerate() {
            child.flatten_into(id.child(index), out);
        }
    }
}

/// Identity of a prototype inside its chunk: the child indices leading to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FunctionId(Vec<usize>);

impl FunctionId {
    pub fn main() -> Self {
        FunctionId(Vec::new())
    }

    pub fn from_path(path: Vec<usize>) -> Self {
        FunctionId(path)
    }

    pub fn child(&self, index: usize) -> Self {
        let mut path = self.0.clone();
        path.push(index);
        FunctionId(path)
    }

    pub fn parent(&self) -> Option<Self> {
        let (_, rest) = self.0.split_last()?;
        Some(FunctionId(rest.to_vec()))
    }

    pub fn path(&self) -> &[usize] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Parse `main`, `main/0/2` or `0/2`.
    pub fn parse(text: &str) -> Option<Self> {
        let path = text
            .split('/')
            .filter(|part| !part.is_empty() && *part != "main")
            .map(|part| part.parse::<usize>().ok())
            .collect::<Option<Vec<_>>>()?;
        Some(FunctionId(path))
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "main")?;
        for index in &self.0 {
            write!(f, "/{}", index)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(name: &str, start_pc: usize, end_pc: usize) -> LocalVar {
        LocalVar {
            name: name.to_string(),
            start_pc,
            end_pc,
        }
    }

    #[test]
    fn test_local_registers_follow_stack_discipline() {
        let mut proto = Prototype::new(Vec::new(), Vec::new(), 4);
        proto.locals = vec![local("a", 1, 10), local("b", 2, 5), local("c", 6, 10)];
        let regs: Vec<_> = proto
            .local_registers()
            .into_iter()
            .map(|(r, l)| (r, l.name.as_str()))
            .collect();
        assert_eq!(regs, vec![(0, "a"), (1, "b"), (1, "c")]);
    }

    #[test]
    fn test_flatten_is_preorder() {
        let mut leaf = Prototype::default();
        leaf.max_registers = 1;
        let mut mid = Prototype::default();
        mid.prototypes.push(leaf.clone());
        let mut main = Prototype::default();
        main.prototypes.push(mid);
        main.prototypes.push(leaf);
        let ids: Vec<String> = main.flatten().iter().map(|(id, _)| id.to_string()).collect();
        assert_eq!(ids, vec!["main", "main/0", "main/0/0", "main/1"]);
        assert!(main.find(&FunctionId::from_path(vec![0, 0])).is_some());
        assert!(main.find(&FunctionId::from_path(vec![2])).is_none());
    }

    #[test]
    fn test_function_id_parse() {
        assert_eq!(FunctionId::parse("main"), Some(FunctionId::main()));
        assert_eq!(FunctionId::parse("main/1/3"), Some(FunctionId::from_path(vec![1, 3])));
        assert_eq!(FunctionId::parse("x"), None);
        assert_eq!(FunctionId::from_path(vec![1, 3]).parent(), Some(FunctionId::from_path(vec![1])));
    }
}
