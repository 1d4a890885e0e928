//! Command-line interface module
//!
//! This module contains the implementations for the CLI subcommands. Input
//! chunks are JSON dumps of the decoded main prototype.

pub mod blocks;
pub mod decompile;
pub mod tags;

use crate::chunk::{FunctionId, Prototype};
use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

/// Read a JSON-serialized main prototype.
pub fn read_prototype(path: &Path) -> Result<Prototype> {
    let text = fs::read_to_string(path)?;
    let proto: Prototype = serde_json::from_str(&text)?;
    log::debug!(
        "loaded {} ({} prototypes)",
        path.display(),
        proto.flatten().len()
    );
    Ok(proto)
}

/// Write to `path`, or to stdout when no path is given.
pub fn write_output(path: Option<&Path>, text: &str) -> Result<()> {
    match path {
        Some(path) => {
            fs::write(path, text)?;
            log::info!("output written to {}", path.display());
        }
        None => print!("{}", text),
    }
    Ok(())
}

/// Parse a function path such as `main/0/1` and check that the chunk has it.
pub fn function_id(main: &Prototype, text: &str) -> Result<FunctionId> {
    let id = FunctionId::parse(text)
        .ok_or_else(|| Error::invalid_args(format!("malformed function path {:?}", text)))?;
    if main.find(&id).is_none() {
        return Err(Error::invalid_args(format!("no function {} in chunk", id)));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Instruction;

    #[test]
    fn test_function_paths_are_checked() {
        let ret = || vec![Instruction::Return { a: 0, count: Some(0) }];
        let mut main = Prototype::new(ret(), vec![], 1);
        main.prototypes.push(Prototype::new(ret(), vec![], 1));

        assert_eq!(function_id(&main, "main/0").unwrap(), FunctionId::from_path(vec![0]));
        assert_eq!(function_id(&main, "main").unwrap(), FunctionId::main());
        assert!(matches!(function_id(&main, "main/x"), Err(Error::InvalidArgs { .. })));
        assert!(matches!(function_id(&main, "main/3"), Err(Error::InvalidArgs { .. })));
    }
}
