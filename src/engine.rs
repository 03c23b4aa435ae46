// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::{Program, Ref};
use crate::interpreter::{EvalResults, Extension, InputResolver, Interpreter};
use crate::lexer::Source;
use crate::parser::Parser;
use crate::path::ResourcePath;
use crate::value::Value;

use core::str::FromStr;

use anyhow::{bail, Result};

/// The top-level handle for evaluating Stratus programs.
///
/// Typical usage: add one or more sources, optionally bind inputs and host
/// extensions, then call [`Engine::eval`]. Declarations in any added source
/// can reference declarations in any other, regardless of order. After
/// evaluation the engine can be queried for individual instances and their
/// dependency edges.
pub struct Engine {
    programs: Vec<Ref<Program>>,
    interpreter: Interpreter,
    results: Option<EvalResults>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            programs: vec![],
            interpreter: Interpreter::new(),
            results: None,
        }
    }

    /// Add a Stratus source file. Parse errors are reported immediately;
    /// evaluation errors only at [`Engine::eval`].
    pub fn add_source(&mut self, file: &str, contents: &str) -> Result<()> {
        let source = Source::from_contents(file.to_string(), contents.to_string())?;
        self.add_parsed(&source)
    }

    pub fn add_source_from_file<P: AsRef<std::path::Path>>(&mut self, path: P) -> Result<()> {
        let source = Source::from_file(path)?;
        self.add_parsed(&source)
    }

    fn add_parsed(&mut self, source: &Source) -> Result<()> {
        if self.results.is_some() {
            bail!("cannot add sources after evaluation");
        }
        let program = Parser::new(source)?.parse()?;
        self.programs.push(Ref::new(program));
        Ok(())
    }

    /// Bind the inputs document consulted for `input` properties. Must be an
    /// object, either flat (`"prop": value`) or sectioned by schema name.
    pub fn set_inputs(&mut self, inputs: Value) -> Result<()> {
        if inputs.as_object().is_err() {
            bail!("inputs must be an object, got {}", inputs.type_name());
        }
        self.interpreter.set_inputs(inputs);
        Ok(())
    }

    /// Register a callback consulted for `input` properties not present in
    /// the inputs document.
    pub fn set_input_resolver(&mut self, resolver: InputResolver) {
        self.interpreter.set_input_resolver(resolver);
    }

    /// Register a host function callable from Stratus code.
    pub fn add_extension(&mut self, name: String, nargs: u8, extension: Extension) -> Result<()> {
        self.interpreter.add_extension(name, nargs, extension)
    }

    /// Evaluate all added sources. Idempotent: repeated calls return the
    /// results of the first evaluation.
    pub fn eval(&mut self) -> Result<EvalResults> {
        if let Some(results) = &self.results {
            return Ok(results.clone());
        }
        let outputs = self.interpreter.eval_programs(&self.programs)?;
        let results = EvalResults { outputs };
        self.results = Some(results.clone());
        Ok(results)
    }

    /// Look up an evaluated instance by resource path, e.g.
    /// `virtualNetwork.main` or `subnet.workers[2]`.
    pub fn lookup_instance(&self, path: &str) -> Result<Value> {
        let path = ResourcePath::from_str(path)?;
        self.interpreter.lookup_instance(&path)
    }

    /// The paths of the instances a given instance read while it was being
    /// evaluated.
    pub fn instance_dependencies(&self, path: &str) -> Result<Vec<String>> {
        let path = ResourcePath::from_str(path)?;
        Ok(self
            .interpreter
            .instance_dependencies(&path)?
            .iter()
            .map(ToString::to_string)
            .collect())
    }

    pub fn instance_count(&self) -> usize {
        self.interpreter.instance_count()
    }

    pub fn cached_imports(&self) -> usize {
        self.interpreter.cached_imports()
    }

    pub fn clear_import_cache(&mut self) {
        self.interpreter.clear_import_cache();
    }
}
