//! lua-dec-rs: decompiler for Lua bytecode
//!
//! This library turns decoded Lua 5.0-5.4 function prototypes back into
//! readable Lua source. The pipeline is: [`cfg`] recovers nested control
//! blocks from the jump graph, [`ast`] simulates registers and assembles
//! statements, and [`ast::printer`] renders them.

pub mod ast;
pub mod cfg;
pub mod chunk;
pub mod cli;
pub mod decompiler;
pub mod error;

pub use decompiler::{DecompileOptions, DecompileReport, Decompiler};
pub use error::{Error as DecompilerError, Result as DecompilerResult};

// Re-export commonly used types
pub use ast::{FunctionBody, Printer, RegisterManager, Statement};
pub use cfg::{structure, Block, BlockKind};
pub use chunk::{FunctionId, Instruction, Prototype};
