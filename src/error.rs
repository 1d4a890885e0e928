use crate::chunk::{FunctionId, Version};
use miette::Diagnostic;
use thiserror::Error;

/// Result type for decompiler operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the Lua decompiler
#[derive(Error, Debug, Diagnostic, Clone, PartialEq)]
pub enum Error {
    #[error("I/O error: {0}")]
    #[diagnostic(code(lua_dec::io_error))]
    Io(String),

    #[error("JSON error: {0}")]
    #[diagnostic(code(lua_dec::json_error))]
    Json(String),

    #[error("Parse error at offset {offset}: {message}")]
    #[diagnostic(code(lua_dec::parse_error))]
    Parse { offset: usize, message: String },

    #[error("Unknown constant tag 0x{tag:02X} for Lua {version}")]
    #[diagnostic(code(lua_dec::unknown_constant_tag))]
    UnknownConstantTag { tag: u8, version: Version },

    #[error("Structural inconsistency at instruction {pc}: {message}")]
    #[diagnostic(
        code(lua_dec::structural_inconsistency),
        help("the jump graph does not nest into source-level control constructs")
    )]
    StructuralInconsistency { pc: usize, message: String },

    #[error("Unresolvable reference at instruction {pc}: {message}")]
    #[diagnostic(code(lua_dec::unresolvable_reference))]
    UnresolvableReference { pc: usize, message: String },

    #[error("Unsupported construct at instruction {pc}: {message}")]
    #[diagnostic(code(lua_dec::unsupported_construct))]
    UnsupportedConstruct { pc: usize, message: String },

    #[error("Invalid arguments: {message}")]
    #[diagnostic(code(lua_dec::invalid_args))]
    InvalidArgs { message: String },

    #[error("Internal error: {message}")]
    #[diagnostic(code(lua_dec::internal_error))]
    Internal { message: String },
}

/// Coarse failure category, used in reports and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Io,
    Input,
    StructuralInconsistency,
    UnresolvableReference,
    UnsupportedConstruct,
    Internal,
}

impl Error {
    pub fn parse(offset: usize, message: impl Into<String>) -> Self {
        Error::Parse {
            offset,
            message: message.into(),
        }
    }

    pub fn structural(pc: usize, message: impl Into<String>) -> Self {
        Error::StructuralInconsistency {
            pc,
            message: message.into(),
        }
    }

    pub fn unresolvable(pc: usize, message: impl Into<String>) -> Self {
        Error::UnresolvableReference {
            pc,
            message: message.into(),
        }
    }

    pub fn unsupported(pc: usize, message: impl Into<String>) -> Self {
        Error::UnsupportedConstruct {
            pc,
            message: message.into(),
        }
    }

    /// Bad user input that is not part of the chunk itself.
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Error::InvalidArgs {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// Instruction index the failure was detected at, if it is tied to one.
    pub fn pc(&self) -> Option<usize> {
        match self {
            Error::StructuralInconsistency { pc, .. }
            | Error::UnresolvableReference { pc, .. }
            | Error::UnsupportedConstruct { pc, .. } => Some(*pc),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::Json(_)
            | Error::Parse { .. }
            | Error::UnknownConstantTag { .. }
            | Error::InvalidArgs { .. } => ErrorKind::Input,
            Error::StructuralInconsistency { .. } => ErrorKind::StructuralInconsistency,
            Error::UnresolvableReference { .. } => ErrorKind::UnresolvableReference,
            Error::UnsupportedConstruct { .. } => ErrorKind::UnsupportedConstruct,
            Error::Internal { .. } => ErrorKind::Internal,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err.to_string())
    }
}

impl From<scroll::Error> for Error {
    fn from(err: scroll::Error) -> Self {
        let offset = match &err {
            scroll::Error::BadOffset(offset) => *offset,
            _ => 0,
        };
        Error::Parse {
            offset,
            message: err.to_string(),
        }
    }
}

/// A prototype that could not be decompiled.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionFailure {
    pub function: FunctionId,
    pub error: Error,
}

impl std::fmt::Display for FunctionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.function, self.error)
    }
}
