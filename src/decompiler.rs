//! Main decompiler module
//!
//! This module orchestrates the decompilation of a whole chunk: every
//! prototype is structured and assembled on its own, then the results are
//! printed together starting from the main function.

use crate::ast::{
    assemble, walk_block, AssemblyOptions, ClosureCollector, FunctionBody, FunctionTable, Printer,
    StatementCounter,
};
use crate::cfg::structure;
use crate::chunk::{FunctionId, Prototype};
use crate::error::{Error, FunctionFailure, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Options controlling decompilation and output layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompileOptions {
    /// Decompile prototypes on the rayon thread pool.
    pub parallel: bool,
    /// One level of indentation.
    pub indent: String,
    /// Print `else if` nests as `elseif`.
    pub elseif_chains: bool,
    pub fold_table_constructors: bool,
    pub keep_trailing_return: bool,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            indent: "    ".to_string(),
            elseif_chains: true,
            fold_table_constructors: true,
            keep_trailing_return: false,
        }
    }
}

impl DecompileOptions {
    /// Load options from a JSON file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Options from command-line flags, layered over an optional config file.
    pub fn from_cli(config: Option<&Path>, sequential: bool, indent: Option<usize>) -> Result<Self> {
        let mut options = match config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if sequential {
            options.parallel = false;
        }
        if let Some(width) = indent {
            options.indent = " ".repeat(width);
        }
        Ok(options)
    }

    pub fn assembly(&self) -> AssemblyOptions {
        AssemblyOptions {
            fold_table_constructors: self.fold_table_constructors,
            keep_trailing_return: self.keep_trailing_return,
        }
    }
}

/// Printed source plus every prototype that could not be recovered.
#[derive(Debug, Clone)]
pub struct DecompileReport {
    pub text: String,
    pub failures: Vec<FunctionFailure>,
}

impl DecompileReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Main decompiler struct
#[derive(Debug, Clone, Default)]
pub struct Decompiler {
    options: DecompileOptions,
}

impl Decompiler {
    pub fn new(options: DecompileOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &DecompileOptions {
        &self.options
    }

    /// Decompile a chunk, printing whatever could be recovered.
    pub fn decompile(&self, main: &Prototype) -> DecompileReport {
        let functions = self.functions(main);
        let failures: Vec<FunctionFailure> = functions
            .iter()
            .filter_map(|(id, result)| {
                result.as_ref().err().map(|error| FunctionFailure {
                    function: id.clone(),
                    error: error.clone(),
                })
            })
            .collect();
        for failure in &failures {
            log::warn!("{}", failure);
        }

        let mut printer = Printer::new(&functions, &self.options.indent, self.options.elseif_chains);
        match functions.get(&FunctionId::main()) {
            Some(Ok(body)) => printer.chunk(body, upvalue_names(body)),
            Some(Err(error)) => {
                printer.comment(&format!("decompilation failed: {}: {}", FunctionId::main(), error));
            }
            None => {}
        }
        for id in survivors(&functions) {
            if let Some(Ok(body)) = functions.get(&id) {
                printer.comment(&format!("function {}", id));
                printer.function_statement(&fallback_name(&id), body, upvalue_names(body));
            }
        }
        let text = printer.finish();

        log::info!(
            "decompiled {} of {} functions",
            functions.len() - failures.len(),
            functions.len()
        );
        DecompileReport { text, failures }
    }

    /// Decompile every prototype of the chunk independently.
    pub fn functions(&self, main: &Prototype) -> FunctionTable {
        let prototypes = main.flatten();
        let environments = environments(&prototypes);
        let run = |(id, proto): &(FunctionId, &Prototype)| {
            let env = environments.get(id).copied().flatten();
            (id.clone(), self.decompile_function(proto, id, env))
        };
        if self.options.parallel {
            prototypes.par_iter().map(run).collect()
        } else {
            prototypes.iter().map(run).collect()
        }
    }

    /// Structure and assemble a single prototype.
    pub fn decompile_function(&self, proto: &Prototype, id: &FunctionId, env: Option<usize>) -> Result<FunctionBody> {
        let root = structure(proto)?;
        root.validate()?;
        log::debug!("{}: block tree\n{}", id, root.dump());
        let body = assemble(proto, id, env, &root, self.options.assembly())?;
        let mut counter = StatementCounter::default();
        walk_block(&mut counter, &body.body);
        log::debug!("{}: {} statements", id, counter.count);
        Ok(body)
    }

    /// Decompile and print one prototype, with the functions nested in it,
    /// as a standalone function.
    pub fn decompile_single(&self, main: &Prototype, id: &FunctionId) -> Result<String> {
        let prototypes = main.flatten();
        let environments = environments(&prototypes);
        let functions: FunctionTable = prototypes
            .iter()
            .filter(|(other, _)| other.path().starts_with(id.path()))
            .map(|(other, proto)| {
                let env = environments.get(other).copied().flatten();
                (other.clone(), self.decompile_function(proto, other, env))
            })
            .collect();
        let body = match functions.get(id) {
            Some(Ok(body)) => body,
            Some(Err(error)) => return Err(error.clone()),
            None => return Err(Error::invalid_args(format!("no function {} in chunk", id))),
        };
        let mut printer = Printer::new(&functions, &self.options.indent, self.options.elseif_chains);
        printer.function_statement(&fallback_name(id), body, upvalue_names(body));
        Ok(printer.finish())
    }
}

/// The upvalue holding `_ENV` in each prototype, if any.
///
/// Main's is the upvalue named `_ENV`, or its first upvalue in stripped
/// chunks. Nested functions inherit it through upvalues that capture the
/// parent's `_ENV` upvalue.
fn environments(prototypes: &[(FunctionId, &Prototype)]) -> HashMap<FunctionId, Option<usize>> {
    let mut out: HashMap<FunctionId, Option<usize>> = HashMap::new();
    for (id, proto) in prototypes {
        let named = proto
            .upvalues
            .iter()
            .position(|upvalue| upvalue.name.as_deref() == Some("_ENV"));
        let env = match id.parent() {
            None => named.or_else(|| (!proto.upvalues.is_empty()).then_some(0)),
            Some(parent) => {
                let inherited = out.get(&parent).copied().flatten();
                named.or_else(|| {
                    proto
                        .upvalues
                        .iter()
                        .position(|upvalue| !upvalue.in_stack && Some(upvalue.index) == inherited)
                })
            }
        };
        out.insert(id.clone(), env);
    }
    out
}

/// Successful prototypes that are not printed inside their parent.
///
/// A prototype is printed inline when its parent is printed and the parent's
/// body creates it as a closure; main is printed as the chunk itself. Every
/// other successful prototype is emitted on its own, in chunk order.
fn survivors(functions: &FunctionTable) -> Vec<FunctionId> {
    let mut printed: HashSet<FunctionId> = HashSet::new();
    let mut out = Vec::new();
    for (id, result) in functions {
        if result.is_err() {
            continue;
        }
        let inline = match id.parent() {
            None => true,
            Some(parent) => printed.contains(&parent) && creates(functions, &parent, id),
        };
        if !inline {
            out.push(id.clone());
        }
        printed.insert(id.clone());
    }
    out
}

/// Whether the successful `parent` creates a closure of `child`.
fn creates(functions: &FunctionTable, parent: &FunctionId, child: &FunctionId) -> bool {
    let Some(Ok(body)) = functions.get(parent) else {
        return false;
    };
    let mut collector = ClosureCollector::default();
    walk_block(&mut collector, &body.body);
    collector.functions.contains(child)
}

fn fallback_name(id: &FunctionId) -> String {
    let mut name = "main".to_string();
    for index in id.path() {
        name.push('_');
        name.push_str(&index.to_string());
    }
    name
}

fn upvalue_names(body: &FunctionBody) -> Vec<String> {
    body.upvalue_names
        .iter()
        .enumerate()
        .map(|(i, name)| name.clone().unwrap_or_else(|| format!("upvalue_{}", i)))
        .collect()
}
