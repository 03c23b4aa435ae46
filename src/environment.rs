// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::errors::EvalError;
use crate::value::Value;

use core::fmt::{self, Debug, Formatter};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::Result;

struct Scope {
    name: Option<Rc<str>>,
    parent: Option<Environment>,
    vars: BTreeMap<Rc<str>, Value>,
}

/// A node in the chain of lexically nested scopes.
///
/// Environments are cheap reference-counted handles; cloning one shares the
/// underlying scope. A closure value stores the environment active at its
/// definition site, which keeps the whole parent chain alive for as long as
/// the closure is reachable. Lookup and mutation walk the parent chain, which
/// is what lets nested functions read and write their defining scope's
/// bindings (static scoping, never dynamic).
#[derive(Clone)]
pub struct Environment {
    scope: Rc<RefCell<Scope>>,
}

impl Environment {
    pub fn new() -> Self {
        Self::make(None, None)
    }

    pub fn named(name: &str) -> Self {
        Self::make(Some(name.into()), None)
    }

    /// Create a fresh innermost scope with `self` as parent. Called on every
    /// block, loop-iteration, function-call and instance-body entry.
    pub fn child(&self, name: &str) -> Self {
        Self::make(Some(name.into()), Some(self.clone()))
    }

    fn make(name: Option<Rc<str>>, parent: Option<Environment>) -> Self {
        Self {
            scope: Rc::new(RefCell::new(Scope {
                name,
                parent,
                vars: BTreeMap::new(),
            })),
        }
    }

    /// Insert into the innermost scope. Redeclaration in the same scope
    /// overwrites; import merging relies on this. The interpreter rejects
    /// duplicate `var` declarations before calling this.
    pub fn declare(&self, name: &str, value: Value) -> Value {
        self.scope
            .borrow_mut()
            .vars
            .insert(name.into(), value.clone());
        value
    }

    /// Walk the parent chain until the name is found.
    pub fn lookup(&self, name: &str) -> Result<Value> {
        match self.get(name) {
            Some(v) => Ok(v),
            None => Err(EvalError::NotFound(name.to_string()).into()),
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        let scope = self.scope.borrow();
        if let Some(v) = scope.vars.get(name) {
            return Some(v.clone());
        }
        match &scope.parent {
            Some(parent) => parent.get(name),
            None => None,
        }
    }

    /// True if the name is declared in this scope or any ancestor.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// True if the name is declared in this scope itself.
    pub fn declared_here(&self, name: &str) -> bool {
        self.scope.borrow().vars.contains_key(name)
    }

    /// Walk the parent chain to the owning scope and mutate in place.
    /// Assignment to an undeclared name is always an error; this is what
    /// prevents accidental globals.
    pub fn set(&self, name: &str, value: Value) -> Result<()> {
        {
            let mut scope = self.scope.borrow_mut();
            if let Some(slot) = scope.vars.get_mut(name) {
                *slot = value;
                return Ok(());
            }
        }
        let parent = self.scope.borrow().parent.clone();
        match parent {
            Some(parent) => parent.set(name, value),
            None => Err(EvalError::NotFound(name.to_string()).into()),
        }
    }

    /// Names declared directly in this scope, in insertion-independent
    /// (sorted) order. Used when merging import fragments.
    pub fn local_bindings(&self) -> BTreeMap<Rc<str>, Value> {
        self.scope.borrow().vars.clone()
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Environment {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let scope = self.scope.borrow();
        let name = scope.name.as_deref().unwrap_or("<anon>");
        write!(f, "Environment({name}, vars: {:?})", scope.vars.keys())?;
        if let Some(parent) = &scope.parent {
            write!(f, " <- {parent:?}")?;
        }
        Ok(())
    }
}
