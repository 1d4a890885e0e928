use crate::cfg::{structure, JumpGraph};
use crate::cli::{function_id, read_prototype, write_output};
use crate::error::Result;
use std::fmt::Write;
use std::path::Path;

/// Output format of the blocks subcommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockFormat {
    /// Indented block tree, one line per block.
    Tree,
    /// Block tree as JSON.
    Json,
    /// Instruction-level jump graph in DOT format.
    Dot,
}

/// Run the blocks subcommand: dump the block tree of one function, or of all.
pub fn blocks(input: &Path, function: Option<&str>, format: BlockFormat) -> Result<()> {
    let main = read_prototype(input)?;
    let selected = match function {
        Some(text) => {
            let id = function_id(&main, text)?;
            main.find(&id).map(|proto| vec![(id, proto)]).unwrap_or_default()
        }
        None => main.flatten(),
    };

    let mut out = String::new();
    for (id, proto) in selected {
        match format {
            BlockFormat::Dot => {
                let graph = JumpGraph::build(&proto.code)?;
                let _ = writeln!(out, "// {}", id);
                out.push_str(&graph.to_dot());
            }
            BlockFormat::Json => {
                out.push_str(&serde_json::to_string_pretty(&structure(proto)?)?);
                out.push('\n');
            }
            BlockFormat::Tree => {
                let root = structure(proto)?;
                let _ = writeln!(out, "-- {}", id);
                let dead = JumpGraph::build(&proto.code)?.unreachable();
                if !dead.is_empty() {
                    let _ = writeln!(out, "-- unreachable: {:?}", dead);
                }
                out.push_str(&root.dump());
            }
        }
    }
    write_output(None, &out)
}
