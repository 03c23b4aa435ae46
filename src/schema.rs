// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::{Property, Ref, Statement};
use crate::environment::Environment;
use crate::errors::EvalError;
use crate::path::ResourcePath;

use core::fmt::{self, Debug, Formatter};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use anyhow::{bail, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    Resource,
    Component,
}

/// A registered `schema` or `component` definition.
///
/// Created once when the declaration statement is evaluated and immutable
/// afterwards. The definition environment is kept so that property default
/// expressions are re-evaluated in their defining scope, freshly for each
/// instance.
pub struct Schema {
    name: Rc<str>,
    kind: SchemaKind,
    decl: Ref<Statement>,
    env: Environment,
}

impl Schema {
    pub fn new(name: Rc<str>, kind: SchemaKind, decl: Ref<Statement>, env: Environment) -> Self {
        Self {
            name,
            kind,
            decl,
            env,
        }
    }

    pub fn name(&self) -> &Rc<str> {
        &self.name
    }

    pub fn kind(&self) -> SchemaKind {
        self.kind
    }

    /// The environment the schema was declared in.
    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn properties(&self) -> &[Property] {
        match self.decl.as_ref() {
            Statement::Schema { properties, .. }
            | Statement::ComponentDef { properties, .. } => properties,
            _ => &[],
        }
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties().iter().find(|p| p.name.text() == name)
    }

    /// Body statements of a component definition; empty for plain schemas.
    pub fn body(&self) -> &[Ref<Statement>] {
        match self.decl.as_ref() {
            Statement::ComponentDef { body, .. } => body,
            _ => &[],
        }
    }
}

impl Debug for Schema {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Schema({:?}, {:?})", self.name, self.kind)
    }
}

/// Evaluation state of a resource/component instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalState {
    Unvisited,
    InProgress,
    Done,
}

/// A materialized resource/component instance.
///
/// The instance environment holds one slot per schema property; values are
/// memoized there, so re-reading a field never re-runs its initializer. The
/// dependency set records every other instance referenced while this one was
/// being evaluated; it exists for introspection only.
pub struct Instance {
    schema: Rc<Schema>,
    path: ResourcePath,
    env: Environment,
    state: Cell<EvalState>,
    deps: RefCell<BTreeSet<ResourcePath>>,
}

impl Instance {
    pub fn new(schema: Rc<Schema>, path: ResourcePath, env: Environment) -> Rc<Self> {
        Rc::new(Self {
            schema,
            path,
            env,
            state: Cell::new(EvalState::Unvisited),
            deps: RefCell::new(BTreeSet::new()),
        })
    }

    pub fn schema(&self) -> &Rc<Schema> {
        &self.schema
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn state(&self) -> EvalState {
        self.state.get()
    }

    pub fn set_state(&self, state: EvalState) {
        self.state.set(state);
    }

    pub fn add_dependency(&self, path: ResourcePath) {
        self.deps.borrow_mut().insert(path);
    }

    pub fn dependencies(&self) -> Vec<ResourcePath> {
        self.deps.borrow().iter().cloned().collect()
    }
}

impl Debug for Instance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Instance({}, {:?})", self.path, self.state.get())
    }
}

/// One schema definition per global type name, each owning a keyed store of
/// its materialized instances. Scoped to a single interpreter run; parallel
/// evaluations use independent registries.
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<Rc<str>, Rc<Schema>>,
    // Per-schema instance stores, keyed by the resource path.
    instances: BTreeMap<Rc<str>, BTreeMap<ResourcePath, Rc<Instance>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare_schema(&mut self, schema: Schema) -> Result<Rc<Schema>> {
        let name = schema.name().clone();
        if self.schemas.contains_key(&name) {
            bail!(EvalError::Duplicate(name.to_string()));
        }
        let schema = Rc::new(schema);
        self.schemas.insert(name.clone(), schema.clone());
        self.instances.insert(name, BTreeMap::new());
        Ok(schema)
    }

    pub fn schema(&self, name: &str) -> Option<&Rc<Schema>> {
        self.schemas.get(name)
    }

    pub fn add_instance(&mut self, instance: Rc<Instance>) -> Result<()> {
        let type_name = instance.schema().name().clone();
        let store = self
            .instances
            .entry(type_name)
            .or_default();
        let path = instance.path().clone();
        if store.contains_key(&path) {
            bail!(EvalError::Duplicate(path.to_string()));
        }
        store.insert(path, instance);
        Ok(())
    }

    /// Look up by the literal key used at creation time.
    pub fn find_instance(&self, path: &ResourcePath) -> Option<&Rc<Instance>> {
        self.instances.get(path.type_name())?.get(path)
    }

    /// All instances of a schema, in path order.
    pub fn instances_of(&self, type_name: &str) -> Vec<Rc<Instance>> {
        match self.instances.get(type_name) {
            Some(store) => store.values().cloned().collect(),
            None => vec![],
        }
    }

    /// Find instances by bare name within a parent scope, any schema.
    /// Used for `instance.field` references inside a component body.
    pub fn find_named(&self, parent: &[Rc<str>], name: &str) -> Vec<Rc<Instance>> {
        let mut found = vec![];
        for store in self.instances.values() {
            for (path, instance) in store {
                if path.name() == name && path.parent_segments() == parent {
                    found.push(instance.clone());
                }
            }
        }
        found
    }

    pub fn instance_count(&self) -> usize {
        self.instances.values().map(BTreeMap::len).sum()
    }
}
