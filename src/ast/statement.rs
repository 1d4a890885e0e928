//! Statements of the recovered source tree

use crate::ast::expression::{CallExpression, Closure, Expression};
use crate::ast::target::Target;

/// Local variable attribute (Lua 5.4).
///
/// `<const>` locals compile to plain registers or folded constants, so only
/// `<close>` is recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    Close,
}

impl Attribute {
    pub fn keyword(self) -> &'static str {
        match self {
            Attribute::Close => "close",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalDeclaration {
    pub name: String,
    pub attribute: Option<Attribute>,
}

impl LocalDeclaration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attribute: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Local {
        declarations: Vec<LocalDeclaration>,
        values: Vec<Expression>,
    },
    Assign {
        targets: Vec<Target>,
        values: Vec<Expression>,
    },
    Call(CallExpression),
    Return(Vec<Expression>),
    Break,
    LocalFunction {
        name: String,
        function: Closure,
    },
    If {
        condition: Expression,
        then_body: Vec<Statement>,
        else_body: Option<Vec<Statement>>,
    },
    While {
        condition: Expression,
        body: Vec<Statement>,
    },
    Repeat {
        body: Vec<Statement>,
        condition: Expression,
    },
    NumericFor {
        variable: String,
        start: Expression,
        stop: Expression,
        step: Expression,
        body: Vec<Statement>,
    },
    GenericFor {
        variables: Vec<String>,
        iterators: Vec<Expression>,
        body: Vec<Statement>,
    },
    Do(Vec<Statement>),
    /// Placeholder for code that could not be recovered.
    Failure { message: String },
}

impl Statement {
    pub fn local(name: impl Into<String>, value: Option<Expression>) -> Self {
        Statement::Local {
            declarations: vec![LocalDeclaration::new(name)],
            values: value.into_iter().collect(),
        }
    }

    pub fn assign(target: Target, value: Expression) -> Self {
        Statement::Assign {
            targets: vec![target],
            values: vec![value],
        }
    }

    /// Whether this statement declares a local named `name` in the enclosing scope.
    pub fn declares(&self, name: &str) -> bool {
        match self {
            Statement::Local { declarations, .. } => declarations.iter().any(|d| d.name == name),
            Statement::LocalFunction { name: declared, .. } => declared == name,
            _ => false,
        }
    }

    /// `return`, `break` and other statements that must end a block.
    pub fn is_terminator(&self) -> bool {
        matches!(self, Statement::Return(_) | Statement::Break)
    }
}

/// A fully assembled function: parameters plus body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionBody {
    pub params: Vec<String>,
    pub is_vararg: bool,
    pub body: Vec<Statement>,
    /// Upvalue names known from debug info, used when no parent supplies them.
    pub upvalue_names: Vec<Option<String>>,
}
