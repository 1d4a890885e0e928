//! Source-level tree and its construction
//!
//! - `condition`/`expression`/`target`/`statement`: the recovered tree
//! - `register_manager`: register file simulation
//! - `statement_builder`: block tree to statements
//! - `walker`/`printer`: traversal and rendering

pub mod condition;
pub mod expression;
pub mod printer;
pub mod register_manager;
pub mod statement;
pub mod statement_builder;
pub mod target;
pub mod walker;

pub use condition::{Condition, Resolver};
pub use expression::{BinaryOp, CallExpression, Closure, Expression, TableConstructor, TableEntry, UpvalueRef};
pub use printer::{FunctionTable, Output, Printer};
pub use register_manager::{RegisterManager, Slot};
pub use statement::{Attribute, FunctionBody, LocalDeclaration, Statement};
pub use statement_builder::{assemble, AssemblyOptions, StatementBuilder};
pub use target::Target;
pub use walker::{walk_block, walk_expression, walk_statement, ClosureCollector, StatementCounter, Walker};
