//! Symbolic expressions recovered from register contents

use crate::chunk::{BinOp, CompareOp, Constant, FunctionId, LuaString, UnOp};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid")
});

static KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if",
        "in", "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
    ]
    .into_iter()
    .collect()
});

/// Whether `name` can be printed as a bare Lua name.
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name) && !KEYWORDS.contains(name)
}

/// Operator precedence levels (higher binds tighter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Precedence(pub u8);

impl Precedence {
    pub const OR: Self = Precedence(1);
    pub const AND: Self = Precedence(2);
    pub const COMPARE: Self = Precedence(3);
    pub const BOR: Self = Precedence(4);
    pub const BXOR: Self = Precedence(5);
    pub const BAND: Self = Precedence(6);
    pub const SHIFT: Self = Precedence(7);
    pub const CONCAT: Self = Precedence(8);
    pub const ADD: Self = Precedence(9);
    pub const MUL: Self = Precedence(10);
    pub const UNARY: Self = Precedence(11);
    pub const POW: Self = Precedence(12);
    pub const ATOM: Self = Precedence(20);
}

/// Binary operators, including the comparison and logical ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    And,
    Or,
}

impl BinaryOp {
    pub fn precedence(self) -> Precedence {
        match self {
            BinaryOp::Or => Precedence::OR,
            BinaryOp::And => Precedence::AND,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le => Precedence::COMPARE,
            BinaryOp::BOr => Precedence::BOR,
            BinaryOp::BXor => Precedence::BXOR,
            BinaryOp::BAnd => Precedence::BAND,
            BinaryOp::Shl | BinaryOp::Shr => Precedence::SHIFT,
            BinaryOp::Add | BinaryOp::Sub => Precedence::ADD,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::IDiv | BinaryOp::Mod => Precedence::MUL,
            BinaryOp::Pow => Precedence::POW,
        }
    }

    pub fn is_right_associative(self) -> bool {
        matches!(self, BinaryOp::Pow)
    }

    /// `a op (b op c)` means the same as `(a op b) op c`.
    pub fn is_associative(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::IDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "^",
            BinaryOp::BAnd => "&",
            BinaryOp::BOr => "|",
            BinaryOp::BXor => "~",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "~=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }
}

impl From<BinOp> for BinaryOp {
    fn from(op: BinOp) -> Self {
        match op {
            BinOp::Add => BinaryOp::Add,
            BinOp::Sub => BinaryOp::Sub,
            BinOp::Mul => BinaryOp::Mul,
            BinOp::Div => BinaryOp::Div,
            BinOp::IDiv => BinaryOp::IDiv,
            BinOp::Mod => BinaryOp::Mod,
            BinOp::Pow => BinaryOp::Pow,
            BinOp::BAnd => BinaryOp::BAnd,
            BinOp::BOr => BinaryOp::BOr,
            BinOp::BXor => BinaryOp::BXor,
            BinOp::Shl => BinaryOp::Shl,
            BinOp::Shr => BinaryOp::Shr,
        }
    }
}

impl From<CompareOp> for BinaryOp {
    fn from(op: CompareOp) -> Self {
        match op {
            CompareOp::Eq => BinaryOp::Eq,
            CompareOp::Lt => BinaryOp::Lt,
            CompareOp::Le => BinaryOp::Le,
        }
    }
}

/// How a closure's upvalue is named in the enclosing function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpvalueRef {
    /// A local of the enclosing function.
    Local(String),
    /// One of the enclosing function's own upvalues.
    Parent(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Closure {
    pub function: FunctionId,
    pub upvalues: Vec<UpvalueRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallExpression {
    pub function: Expression,
    /// Set for `object:name(...)` calls; `function` is then the object.
    pub method: Option<String>,
    pub args: Vec<Expression>,
    /// Whether every result is kept (open result count).
    pub multi: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableEntry {
    Positional(Expression),
    Keyed(Expression, Expression),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableConstructor {
    pub entries: Vec<TableEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Constant(Constant),
    Local(String),
    Global(String),
    Upvalue(usize),
    Index {
        table: Box<Expression>,
        key: Box<Expression>,
    },
    /// `object:name`, only meaningful as the callee of a call.
    Method {
        object: Box<Expression>,
        name: String,
    },
    /// The receiver copy written next to a method reference.
    SelfArgument,
    Unary {
        op: UnOp,
        operand: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Concat(Vec<Expression>),
    Call(Box<CallExpression>),
    VarArg {
        multi: bool,
    },
    Table(TableConstructor),
    Closure(Closure),
}

impl Expression {
    pub fn nil() -> Self {
        Expression::Constant(Constant::Nil)
    }

    pub fn boolean(value: bool) -> Self {
        Expression::Constant(Constant::Boolean(value))
    }

    pub fn integer(value: i64) -> Self {
        Expression::Constant(Constant::Integer(value))
    }

    pub fn string(value: impl Into<LuaString>) -> Self {
        Expression::Constant(Constant::String(value.into()))
    }

    pub fn binary(op: BinaryOp, left: Expression, right: Expression) -> Self {
        Expression::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn unary(op: UnOp, operand: Expression) -> Self {
        Expression::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn index(table: Expression, key: Expression) -> Self {
        Expression::Index {
            table: Box::new(table),
            key: Box::new(key),
        }
    }

    /// Logical negation, folding `not (a == b)` into `a ~= b`.
    pub fn negate(self) -> Self {
        match self {
            Expression::Binary {
                op: BinaryOp::Eq,
                left,
                right,
            } => Expression::Binary {
                op: BinaryOp::Ne,
                left,
                right,
            },
            Expression::Binary {
                op: BinaryOp::Ne,
                left,
                right,
            } => Expression::Binary {
                op: BinaryOp::Eq,
                left,
                right,
            },
            Expression::Unary {
                op: UnOp::Not,
                operand,
            } if operand.is_boolean_valued() => *operand,
            Expression::Constant(Constant::Boolean(value)) => Expression::boolean(!value),
            other => Expression::unary(UnOp::Not, other),
        }
    }

    /// Whether this is the integer literal `value`.
    pub fn is_integer(&self, value: i64) -> bool {
        matches!(self, Expression::Constant(c) if c.is_integer(value))
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Expression::Constant(_))
    }

    /// A string constant that can be printed as a bare name.
    pub fn as_identifier(&self) -> Option<&str> {
        match self {
            Expression::Constant(constant) => constant.as_str().filter(|name| is_identifier(name)),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Expression::Constant(Constant::Nil))
    }

    /// Expressions that always evaluate to a boolean.
    pub fn is_boolean_valued(&self) -> bool {
        match self {
            Expression::Constant(Constant::Boolean(_)) => true,
            Expression::Unary { op: UnOp::Not, .. } => true,
            Expression::Binary { op, .. } => matches!(
                op,
                BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le
            ),
            _ => false,
        }
    }

    /// Calls and varargs that expand to every value they produce.
    pub fn is_multi(&self) -> bool {
        match self {
            Expression::Call(call) => call.multi,
            Expression::VarArg { multi } => *multi,
            _ => false,
        }
    }

    /// Calls and varargs truncated to a single value.
    pub fn is_truncated(&self) -> bool {
        match self {
            Expression::Call(call) => !call.multi,
            Expression::VarArg { multi } => !multi,
            _ => false,
        }
    }

    /// Whether the expression may be printed as the prefix of a call or index.
    pub fn is_prefix(&self) -> bool {
        matches!(
            self,
            Expression::Local(_)
                | Expression::Global(_)
                | Expression::Upvalue(_)
                | Expression::Index { .. }
                | Expression::Call(_)
        )
    }

    pub fn precedence(&self) -> Precedence {
        match self {
            Expression::Binary { op, .. } => op.precedence(),
            Expression::Unary { .. } => Precedence::UNARY,
            Expression::Concat(_) => Precedence::CONCAT,
            Expression::Constant(Constant::Integer(v)) if *v < 0 => Precedence::UNARY,
            Expression::Constant(Constant::Float(v)) if v.is_sign_negative() && !v.is_nan() => {
                Precedence::UNARY
            }
            _ => Precedence::ATOM,
        }
    }
}
