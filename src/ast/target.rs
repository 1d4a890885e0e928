//! Assignment targets

use crate::ast::expression::Expression;

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Local(String),
    Global(String),
    Upvalue(usize),
    Index { table: Expression, key: Expression },
}
