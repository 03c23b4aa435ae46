// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::errors::EvalError;
use crate::value::Value;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{bail, Result};

/// The top-level bindings produced by evaluating an imported file once.
pub type ModuleBindings = Rc<BTreeMap<Rc<str>, Value>>;

/// Per-engine store of evaluated import modules.
///
/// Modules are keyed by canonical path, so the same file reached through
/// different relative specs is still evaluated exactly once (diamond imports
/// share one evaluation). The `loading` stack holds the files currently being
/// evaluated; re-entering one of them is a circular import and is reported as
/// a cycle over file names.
#[derive(Default)]
pub struct ImportCache {
    modules: BTreeMap<PathBuf, ModuleBindings>,
    loading: Vec<PathBuf>,
}

impl ImportCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve an import spec against the directory of the importing file.
    pub fn resolve(base: Option<&Path>, spec: &str) -> Result<PathBuf> {
        let raw = Path::new(spec);
        let joined = match (raw.is_absolute(), base) {
            (false, Some(dir)) => dir.join(raw),
            _ => raw.to_path_buf(),
        };
        match joined.canonicalize() {
            Ok(path) => Ok(path),
            Err(e) => bail!("could not resolve import `{spec}`. {e}"),
        }
    }

    pub fn lookup(&self, path: &Path) -> Option<ModuleBindings> {
        self.modules.get(path).cloned()
    }

    /// Mark a module as being evaluated. Fails if it is already on the
    /// loading stack.
    pub fn begin(&mut self, path: &Path) -> Result<()> {
        if let Some(pos) = self.loading.iter().position(|p| p == path) {
            let mut chain: Vec<String> = self.loading[pos..]
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            chain.push(path.display().to_string());
            bail!(EvalError::Cycle { chain });
        }
        self.loading.push(path.to_path_buf());
        Ok(())
    }

    pub fn finish(&mut self, path: &Path, bindings: BTreeMap<Rc<str>, Value>) -> ModuleBindings {
        self.loading.retain(|p| p != path);
        let bindings = Rc::new(bindings);
        self.modules.insert(path.to_path_buf(), bindings.clone());
        bindings
    }

    /// Unwind the loading mark after a failed evaluation.
    pub fn abort(&mut self, path: &Path) {
        self.loading.retain(|p| p != path);
    }

    pub fn clear(&mut self) {
        self.modules.clear();
        self.loading.clear();
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
