use clap::{Parser, Subcommand};
use miette::{miette, Result};
use std::path::PathBuf;

use lua_dec_rs::cli;
use lua_dec_rs::cli::blocks::BlockFormat;

#[derive(Parser)]
#[command(name = "lua-dec-rs")]
#[command(about = "Decompiler for Lua 5.0-5.4 bytecode")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decompile a chunk (JSON-serialized main prototype) to Lua source
    Decompile {
        /// Input chunk dump
        input: PathBuf,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// JSON file with decompile options
        #[arg(long)]
        config: Option<PathBuf>,

        /// Decompile functions one after another instead of in parallel
        #[arg(long)]
        sequential: bool,

        /// Spaces per indentation level
        #[arg(long)]
        indent: Option<usize>,

        /// Exit with an error if any function fails to decompile
        #[arg(long)]
        strict: bool,

        /// Decompile only this function, e.g. `main/0/1`
        #[arg(short, long)]
        function: Option<String>,
    },

    /// Print the constant tag table of a bytecode dialect as JSON
    Tags {
        /// Lua version (5.0 to 5.4)
        #[arg(long = "version", value_name = "VERSION")]
        lua_version: String,
    },

    /// Dump the recovered block tree
    Blocks {
        /// Input chunk dump
        input: PathBuf,

        /// Function path such as `main/0/1` (all functions if omitted)
        #[arg(short, long)]
        function: Option<String>,

        /// Emit the tree as JSON
        #[arg(long, conflicts_with = "dot")]
        json: bool,

        /// Emit the instruction jump graph in DOT format instead
        #[arg(long)]
        dot: bool,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Decompile {
            input,
            output,
            config,
            sequential,
            indent,
            strict,
            function,
        } => {
            let args = cli::decompile::DecompileArgs {
                input_path: input,
                output_path: output,
                config_path: config,
                sequential,
                indent,
                strict,
                function,
            };
            cli::decompile::decompile(&args).map_err(|e| miette!("{}", e))
        }
        Commands::Tags { lua_version } => cli::tags::tags(&lua_version).map_err(|e| miette!("{}", e)),
        Commands::Blocks {
            input,
            function,
            json,
            dot,
        } => {
            let format = if dot {
                BlockFormat::Dot
            } else if json {
                BlockFormat::Json
            } else {
                BlockFormat::Tree
            };
            cli::blocks::blocks(&input, function.as_deref(), format).map_err(|e| miette!("{}", e))
        }
    }
}
