use crate::cli::{function_id, read_prototype, write_output};
use crate::decompiler::{DecompileOptions, Decompiler};
use crate::error::Result;
use std::path::PathBuf;

/// Arguments for the decompile command
#[derive(Debug, Clone)]
pub struct DecompileArgs {
    pub input_path: PathBuf,
    pub output_path: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub sequential: bool,
    pub indent: Option<usize>,
    /// Fail instead of printing placeholders for broken functions.
    pub strict: bool,
    /// Function path to decompile on its own.
    pub function: Option<String>,
}

impl DecompileArgs {
    pub fn to_options(&self) -> Result<DecompileOptions> {
        DecompileOptions::from_cli(self.config_path.as_deref(), self.sequential, self.indent)
    }
}

/// Run the decompile subcommand
pub fn decompile(args: &DecompileArgs) -> Result<()> {
    let proto = read_prototype(&args.input_path)?;
    let decompiler = Decompiler::new(args.to_options()?);

    if let Some(path) = &args.function {
        let id = function_id(&proto, path)?;
        let text = decompiler.decompile_single(&proto, &id)?;
        return write_output(args.output_path.as_deref(), &text);
    }

    let report = decompiler.decompile(&proto);
    for failure in &report.failures {
        eprintln!("warning: {}", failure);
    }
    if args.strict {
        if let Some(failure) = report.failures.first() {
            return Err(failure.error.clone());
        }
    }
    write_output(args.output_path.as_deref(), &report.text)
}
