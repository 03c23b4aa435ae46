// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::*;
use crate::builtins;
use crate::environment::Environment;
use crate::errors::EvalError;
use crate::imports::{ImportCache, ModuleBindings};
use crate::lexer::{unescape, Source, Span};
use crate::parser::Parser;
use crate::path::{ResourcePath, Subscript};
use crate::schema::{EvalState, Instance, Schema, SchemaKind, SchemaRegistry};
use crate::value::Value;

use core::mem;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::rc::Rc;

use anyhow::{bail, Result};
use serde::Serialize;

/// A host-registered function callable from Stratus code.
pub type Extension = Box<dyn FnMut(Vec<Value>) -> Result<Value>>;

/// A host callback consulted for `input` properties that have no binding in
/// the inputs document. Receives the schema name and the property name.
pub type InputResolver = Box<dyn FnMut(&str, &str) -> Result<Option<Value>>>;

/// One `output` statement's evaluated result.
#[derive(Debug, Clone, Serialize)]
pub struct EvalOutput {
    pub name: String,
    pub ty: String,
    pub sensitive: bool,
    pub value: Value,
}

/// All outputs of an evaluation, in statement order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvalResults {
    pub outputs: Vec<EvalOutput>,
}

impl core::fmt::Display for EvalResults {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for o in &self.outputs {
            if o.sensitive {
                writeln!(f, "output {} {} = <sensitive value>", o.ty, o.name)?;
            } else {
                let json = o.value.to_json_str().map_err(|_| core::fmt::Error)?;
                writeln!(f, "output {} {} = {}", o.ty, o.name, json)?;
            }
        }
        Ok(())
    }
}

/// Statement-level control flow. `Return` unwinds to the nearest function
/// call; everywhere else it is an error.
enum Flow {
    Normal,
    Return(Value),
}

// A declaration statement that the in-order walk has not reached yet.
// Forward references force these on demand; the saved environment, owner
// and loop keys reproduce the context the statement would have run in.
struct PendingDecl {
    stmt: Ref<Statement>,
    env: Environment,
    owner: Option<ResourcePath>,
    loop_keys: Vec<Subscript>,
    done: Cell<bool>,
}

pub struct Interpreter {
    globals: Environment,
    registry: SchemaRegistry,
    inputs: Value,
    input_resolver: Option<InputResolver>,
    extensions: HashMap<String, (u8, Rc<RefCell<Extension>>)>,
    imports: ImportCache,
    outputs: Vec<EvalOutput>,

    // Paths of instances currently being evaluated, outermost first.
    active: Vec<ResourcePath>,
    // Declaration statements not yet executed by the in-order walk.
    pending: Vec<PendingDecl>,
    // Subscripts contributed by enclosing `for` loops, outermost first.
    loop_keys: Vec<Subscript>,
    // Path of the enclosing component instance, if any.
    owner: Option<ResourcePath>,
    // Depth of nested import evaluation; outputs are only recorded at 0.
    import_depth: u32,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self {
            globals: Environment::named("globals"),
            registry: SchemaRegistry::new(),
            inputs: Value::new_object(),
            input_resolver: None,
            extensions: HashMap::new(),
            imports: ImportCache::new(),
            outputs: vec![],
            active: vec![],
            pending: vec![],
            loop_keys: vec![],
            owner: None,
            import_depth: 0,
        }
    }

    pub fn set_inputs(&mut self, inputs: Value) {
        self.inputs = inputs;
    }

    pub fn set_input_resolver(&mut self, resolver: InputResolver) {
        self.input_resolver = Some(resolver);
    }

    pub fn add_extension(&mut self, name: String, nargs: u8, extension: Extension) -> Result<()> {
        if builtins::BUILTINS.contains_key(name.as_str()) {
            bail!("`{name}` is a builtin function and cannot be overridden");
        }
        match self.extensions.entry(name) {
            std::collections::hash_map::Entry::Occupied(e) => {
                bail!("extension `{}` is already registered", e.key());
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert((nargs, Rc::new(RefCell::new(extension))));
            }
        }
        Ok(())
    }

    /// Evaluate all given programs as one unit. Declarations in any file may
    /// be referenced from any other, regardless of order.
    pub fn eval_programs(&mut self, programs: &[Ref<Program>]) -> Result<Vec<EvalOutput>> {
        let mut pairs: Vec<(Ref<Statement>, Environment)> = vec![];
        for program in programs {
            let env = self.globals.child(program.source.file());
            for stmt in &program.statements {
                pairs.push((stmt.clone(), env.clone()));
            }
        }

        let mark = self.pending.len();
        let mut idxs = Vec::with_capacity(pairs.len());
        for (stmt, env) in &pairs {
            idxs.push(self.register_pending(stmt, env));
        }

        let result = (|| {
            for ((stmt, env), idx) in pairs.iter().zip(&idxs) {
                let flow = match idx {
                    Some(idx) => self.force_pending(*idx)?,
                    None => self.eval_statement(stmt, env)?,
                };
                if let Flow::Return(_) = flow {
                    bail!(stmt.span().error("`return` outside of a function"));
                }
            }
            Ok(())
        })();
        self.pending.truncate(mark);
        result?;

        Ok(mem::take(&mut self.outputs))
    }

    /// Registry lookup by path, used by [`crate::Engine::lookup_instance`].
    pub fn lookup_instance(&self, path: &ResourcePath) -> Result<Value> {
        let instance = self.find_registered(path)?;
        Ok(Self::instance_value(&instance))
    }

    pub fn instance_dependencies(&self, path: &ResourcePath) -> Result<Vec<ResourcePath>> {
        Ok(self.find_registered(path)?.dependencies())
    }

    fn find_registered(&self, path: &ResourcePath) -> Result<Rc<Instance>> {
        if let Some(instance) = self.registry.find_instance(path) {
            return Ok(instance.clone());
        }
        // A file qualifier that was never recorded still addresses the
        // same instance.
        if path.file().is_some() {
            if let Some(instance) = self.registry.find_instance(&path.without_file()) {
                return Ok(instance.clone());
            }
        }
        bail!(EvalError::NotFound(path.to_string()))
    }

    pub fn instance_count(&self) -> usize {
        self.registry.instance_count()
    }

    pub fn cached_imports(&self) -> usize {
        self.imports.len()
    }

    pub fn clear_import_cache(&mut self) {
        self.imports.clear();
    }

    // Statement evaluation

    fn is_declarator(stmt: &Statement) -> bool {
        matches!(
            stmt,
            Statement::Schema { .. }
                | Statement::ComponentDef { .. }
                | Statement::Instance { .. }
                | Statement::For { .. }
                | Statement::If { .. }
        )
    }

    fn register_pending(&mut self, stmt: &Ref<Statement>, env: &Environment) -> Option<usize> {
        if !Self::is_declarator(stmt) {
            return None;
        }
        self.pending.push(PendingDecl {
            stmt: stmt.clone(),
            env: env.clone(),
            owner: self.owner.clone(),
            loop_keys: self.loop_keys.clone(),
            done: Cell::new(false),
        });
        Some(self.pending.len() - 1)
    }

    // Run a not-yet-executed declaration in the context it was registered
    // with. Marked done up front so that self references surface as cycles
    // rather than unbounded recursion.
    fn force_pending(&mut self, idx: usize) -> Result<Flow> {
        let p = &self.pending[idx];
        if p.done.get() {
            return Ok(Flow::Normal);
        }
        p.done.set(true);
        let stmt = p.stmt.clone();
        let env = p.env.clone();
        let owner = p.owner.clone();
        let loop_keys = p.loop_keys.clone();

        let saved_owner = mem::replace(&mut self.owner, owner);
        let saved_keys = mem::replace(&mut self.loop_keys, loop_keys);
        let result = self.eval_statement(&stmt, &env);
        self.owner = saved_owner;
        self.loop_keys = saved_keys;
        result
    }

    // Could executing this statement declare `name` as a schema, component
    // or instance? Conditionals and loops are scanned without evaluation.
    fn could_declare(stmt: &Statement, name: &str) -> bool {
        match stmt {
            Statement::Schema { name: n, .. } | Statement::ComponentDef { name: n, .. } => {
                n.text() == name
            }
            Statement::Instance { name: n, .. } => n.text() == name,
            Statement::For { body, .. } => body.iter().any(|s| Self::could_declare(s, name)),
            Statement::If {
                then_body,
                else_body,
                ..
            } => {
                then_body.iter().any(|s| Self::could_declare(s, name))
                    || else_body.iter().any(|s| Self::could_declare(s, name))
            }
            _ => false,
        }
    }

    /// Force every pending declaration that could introduce `name`. Returns
    /// true if anything ran, in which case the caller should retry its
    /// lookup.
    fn force_declarators(&mut self, name: &str) -> Result<bool> {
        let mut forced = false;
        loop {
            let next = self.pending.iter().position(|p| {
                !p.done.get() && Self::could_declare(&p.stmt, name)
            });
            match next {
                Some(idx) => {
                    let span = self.pending[idx].stmt.span().clone();
                    if let Flow::Return(_) = self.force_pending(idx)? {
                        bail!(span.error("`return` outside of a function"));
                    }
                    forced = true;
                }
                None => return Ok(forced),
            }
        }
    }

    fn eval_block(&mut self, stmts: &[Ref<Statement>], env: &Environment) -> Result<Flow> {
        let mark = self.pending.len();
        let mut idxs = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            idxs.push(self.register_pending(stmt, env));
        }
        let result = (|| {
            for (stmt, idx) in stmts.iter().zip(&idxs) {
                let flow = match idx {
                    Some(idx) => self.force_pending(*idx)?,
                    None => self.eval_statement(stmt, env)?,
                };
                if let flow @ Flow::Return(_) = flow {
                    return Ok(flow);
                }
            }
            Ok(Flow::Normal)
        })();
        self.pending.truncate(mark);
        result
    }

    fn eval_statement(&mut self, stmt: &Ref<Statement>, env: &Environment) -> Result<Flow> {
        match stmt.as_ref() {
            Statement::Schema { name, .. } => {
                self.declare_schema(name, SchemaKind::Resource, stmt, env)?;
            }
            Statement::ComponentDef { name, .. } => {
                self.declare_schema(name, SchemaKind::Component, stmt, env)?;
            }
            Statement::Instance {
                kind,
                type_name,
                name,
                fields,
                ..
            } => {
                self.eval_instance(*kind, type_name, name, fields, env)?;
            }
            Statement::Var { name, value, .. } => {
                if env.declared_here(name.text()) {
                    return Err(EvalError::Duplicate(name.text().to_string()).at(name));
                }
                let v = self.eval_expr(value, env)?;
                env.declare(name.text(), v);
            }
            Statement::Assign { target, value, .. } => {
                self.eval_assign(target, value, env)?;
            }
            Statement::Function {
                name, params, body, ..
            } => {
                if env.declared_here(name.text()) {
                    return Err(EvalError::Duplicate(name.text().to_string()).at(name));
                }
                let closure = crate::value::Closure::new(crate::value::ClosureInternal {
                    name: Some(name.text().into()),
                    params: params.iter().map(|p| p.text().into()).collect(),
                    body: body.to_vec(),
                    env: env.clone(),
                });
                env.declare(name.text(), Value::Closure(closure));
            }
            Statement::Return { value, .. } => {
                let v = match value {
                    Some(expr) => self.eval_expr(expr, env)?,
                    None => Value::Null,
                };
                return Ok(Flow::Return(v));
            }
            Statement::For {
                item,
                index,
                iterable,
                body,
                ..
            } => {
                return self.eval_for(item, index.as_ref(), iterable, body, env);
            }
            Statement::If {
                cond,
                then_body,
                else_body,
                ..
            } => {
                let c = self.eval_expr(cond, env)?;
                let c = *c
                    .as_bool()
                    .map_err(|_| cond.span().error("`if` condition must be a boolean"))?;
                let branch = if c { then_body } else { else_body };
                return self.eval_block(branch, &env.child("if"));
            }
            Statement::Output {
                ty,
                name,
                sensitive,
                value,
                ..
            } => {
                let v = self.eval_expr(value, env)?;
                Self::check_value_type(name, *ty, &v)?;
                if self.import_depth == 0 {
                    if self.outputs.iter().any(|o| o.name == name.text()) {
                        return Err(EvalError::Duplicate(name.text().to_string()).at(name));
                    }
                    self.outputs.push(EvalOutput {
                        name: name.text().to_string(),
                        ty: ty.as_str().to_string(),
                        sensitive: *sensitive,
                        value: v,
                    });
                }
            }
            Statement::Import {
                span, path, alias, ..
            } => {
                self.eval_import(span, path, alias.as_ref(), env)?;
            }
            Statement::Expr { expr, .. } => {
                self.eval_expr(expr, env)?;
            }
        }
        Ok(Flow::Normal)
    }

    fn declare_schema(
        &mut self,
        name: &Span,
        kind: SchemaKind,
        stmt: &Ref<Statement>,
        env: &Environment,
    ) -> Result<()> {
        if self.registry.schema(name.text()).is_some() {
            return Err(EvalError::Duplicate(name.text().to_string()).at(name));
        }
        self.registry.declare_schema(Schema::new(
            name.text().into(),
            kind,
            stmt.clone(),
            env.clone(),
        ))?;
        Ok(())
    }

    fn eval_for(
        &mut self,
        item: &Span,
        index: Option<&Span>,
        iterable: &ExprRef,
        body: &[Ref<Statement>],
        env: &Environment,
    ) -> Result<Flow> {
        let collection = self.eval_expr(iterable, env)?;
        let entries = match Self::iter_entries(&collection) {
            Some(entries) => entries,
            None => {
                return Err(iterable.span().error(
                    format!(
                        "`for` expects an array, object or string, got {}",
                        collection.type_name()
                    )
                    .as_str(),
                ))
            }
        };

        for (value, key) in entries {
            let ienv = env.child("for");
            // A single-variable array loop keys derived instances by the
            // element itself: `for i in ["prod","test"]` yields
            // `main["prod"]` and `main["test"]`. With an index binding, and
            // for object and string loops, the key or position wins.
            let subscript = match (&collection, index) {
                (Value::Array(_), None) => Self::subscript_for(&value),
                _ => Self::subscript_for(&key),
            };
            ienv.declare(item.text(), value);
            if let Some(index) = index {
                ienv.declare(index.text(), key.clone());
            }
            self.loop_keys.push(subscript);
            let flow = self.eval_block(body, &ienv);
            self.loop_keys.pop();
            match flow? {
                Flow::Normal => (),
                flow @ Flow::Return(_) => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    // (value, key) pairs for each iterable kind. Array positions and string
    // characters are index-keyed; object entries carry their field key.
    fn iter_entries(collection: &Value) -> Option<Vec<(Value, Value)>> {
        match collection {
            Value::Array(items) => Some(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (v.clone(), Value::from(i)))
                    .collect(),
            ),
            Value::Object(map) => Some(map.iter().map(|(k, v)| (v.clone(), k.clone())).collect()),
            Value::String(s) => Some(
                s.chars()
                    .enumerate()
                    .map(|(i, ch)| (Value::from(ch.to_string()), Value::from(i)))
                    .collect(),
            ),
            _ => None,
        }
    }

    // The instance key an iteration contributes: array positions become
    // index subscripts, object keys become key subscripts.
    fn subscript_for(key: &Value) -> Subscript {
        match key {
            Value::String(s) => Subscript::Key(s.clone()),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Subscript::Index(i),
                None => Subscript::Key(n.to_string().into()),
            },
            other => Subscript::Key(
                other
                    .to_json_str()
                    .unwrap_or_else(|_| "?".to_string())
                    .into(),
            ),
        }
    }

    // Instances

    fn eval_instance(
        &mut self,
        kind: InstanceKind,
        type_name: &Span,
        name: &Span,
        fields: &[Field],
        env: &Environment,
    ) -> Result<()> {
        let schema = self.lookup_schema(type_name)?;
        match (schema.kind(), kind) {
            (SchemaKind::Resource, InstanceKind::Resource)
            | (SchemaKind::Component, InstanceKind::Component) => (),
            (SchemaKind::Resource, InstanceKind::Component) => {
                return Err(type_name.error(
                    format!("`{}` is a schema; use `resource`", type_name.text()).as_str(),
                ))
            }
            (SchemaKind::Component, InstanceKind::Resource) => {
                return Err(type_name.error(
                    format!("`{}` is a component; use `component`", type_name.text()).as_str(),
                ))
            }
        }

        let base = match &self.owner {
            Some(owner) => owner.child(type_name.text(), name.text()),
            None => ResourcePath::new(type_name.text(), name.text()),
        };
        let path = self
            .loop_keys
            .iter()
            .fold(base, |p, s| p.append(s.clone()));

        if self.registry.find_instance(&path).is_some() {
            return Err(EvalError::Duplicate(path.to_string()).at(name));
        }

        let ienv = env.child(name.text());
        let instance = Instance::new(schema.clone(), path.clone(), ienv);
        self.registry.add_instance(instance.clone())?;
        instance.set_state(EvalState::InProgress);
        self.active.push(path);

        let result = match schema.kind() {
            SchemaKind::Resource => self.eval_resource_fields(&schema, &instance, fields),
            SchemaKind::Component => self.eval_component_instance(&schema, &instance, fields, env),
        };

        self.active.pop();
        if result.is_ok() {
            instance.set_state(EvalState::Done);
        }
        result
    }

    fn lookup_schema(&mut self, type_name: &Span) -> Result<Rc<Schema>> {
        if let Some(schema) = self.registry.schema(type_name.text()) {
            return Ok(schema.clone());
        }
        if self.force_declarators(type_name.text())? {
            if let Some(schema) = self.registry.schema(type_name.text()) {
                return Ok(schema.clone());
            }
        }
        Err(EvalError::NotFound(type_name.text().to_string()).at(type_name))
    }

    fn eval_resource_fields(
        &mut self,
        schema: &Rc<Schema>,
        instance: &Rc<Instance>,
        fields: &[Field],
    ) -> Result<()> {
        // Explicit assignments first, in body order. Fields may reference
        // earlier fields of the same instance by name.
        for field in fields {
            let fname = field.name.text();
            let prop = match schema.property(fname) {
                Some(prop) => prop,
                None => {
                    return Err(EvalError::NotFound(format!("{}.{fname}", schema.name()))
                        .at(&field.name))
                }
            };
            if prop.cloud {
                return Err(field
                    .name
                    .error(format!("cloud property `{fname}` cannot be assigned").as_str()));
            }
            let ienv = instance.env().clone();
            let v = self.eval_expr(&field.value, &ienv)?;
            Self::check_value_type(&field.name, prop.ty, &v)?;
            ienv.declare(fname, v);
        }

        // Remaining properties in declaration order. Defaults run in the
        // schema's defining scope, with already-computed properties of this
        // instance layered on top.
        for prop in schema.properties() {
            let pname = prop.name.text();
            if instance.env().declared_here(pname) {
                continue;
            }
            if prop.cloud {
                instance.env().declare(pname, Value::Undefined);
                continue;
            }
            if let Some(default) = &prop.default {
                let denv = schema.env().child(schema.name());
                for (k, v) in instance.env().local_bindings() {
                    denv.declare(&k, v);
                }
                let v = self.eval_expr(default, &denv)?;
                Self::check_value_type(&prop.name, prop.ty, &v)?;
                instance.env().declare(pname, v);
                continue;
            }
            match prop.role {
                PropertyRole::Input => {
                    let v = self.resolve_input(schema.name(), pname)?.ok_or_else(|| {
                        EvalError::MissingInput(format!("{}.{pname}", schema.name()))
                            .at(&prop.name)
                    })?;
                    Self::check_value_type(&prop.name, prop.ty, &v)?;
                    instance.env().declare(pname, v);
                }
                PropertyRole::Output => {
                    instance.env().declare(pname, Value::Undefined);
                }
                PropertyRole::Regular => {
                    instance.env().declare(pname, Value::Null);
                }
            }
        }
        Ok(())
    }

    fn eval_component_instance(
        &mut self,
        schema: &Rc<Schema>,
        instance: &Rc<Instance>,
        fields: &[Field],
        caller_env: &Environment,
    ) -> Result<()> {
        // Body scope is lexical: a child of the definition environment.
        let benv = schema.env().child(schema.name());

        // Instantiation fields bind input properties; they are evaluated in
        // the caller's scope.
        for field in fields {
            let fname = field.name.text();
            match schema.property(fname) {
                Some(prop) if prop.role == PropertyRole::Input => {
                    let v = self.eval_expr(&field.value, caller_env)?;
                    Self::check_value_type(&field.name, prop.ty, &v)?;
                    instance.env().declare(fname, v.clone());
                    benv.declare(fname, v);
                }
                _ => {
                    return Err(field.name.error(
                        format!("`{fname}` is not an input of component `{}`", schema.name())
                            .as_str(),
                    ))
                }
            }
        }

        for prop in schema.properties() {
            let pname = prop.name.text();
            if prop.role != PropertyRole::Input || benv.declared_here(pname) {
                continue;
            }
            let v = match &prop.default {
                Some(default) => self.eval_expr(default, &benv)?,
                None => self.resolve_input(schema.name(), pname)?.ok_or_else(|| {
                    EvalError::MissingInput(format!("{}.{pname}", schema.name())).at(&prop.name)
                })?,
            };
            Self::check_value_type(&prop.name, prop.ty, &v)?;
            instance.env().declare(pname, v.clone());
            benv.declare(pname, v);
        }

        // Body statements run with this instance as owner; loop keys of the
        // instantiation site do not leak into the body.
        let saved_owner = mem::replace(&mut self.owner, Some(instance.path().clone()));
        let saved_keys = mem::take(&mut self.loop_keys);
        let flow = self.eval_block(schema.body(), &benv);
        self.owner = saved_owner;
        self.loop_keys = saved_keys;
        match flow? {
            Flow::Normal => (),
            Flow::Return(_) => {
                return Err(schema
                    .body()
                    .first()
                    .map(|s| s.span().error("`return` outside of a function"))
                    .unwrap_or_else(|| anyhow::anyhow!("`return` outside of a function")))
            }
        }

        // Outputs come from body bindings of the same name, falling back to
        // the (computed) default expression.
        for prop in schema.properties() {
            let pname = prop.name.text();
            if prop.role != PropertyRole::Output {
                continue;
            }
            let v = if benv.declared_here(pname) {
                benv.lookup(pname)?
            } else if let Some(default) = &prop.default {
                self.eval_expr(default, &benv)?
            } else {
                return Err(
                    EvalError::MissingOutput(format!("{}.{pname}", schema.name())).at(&prop.name)
                );
            };
            Self::check_value_type(&prop.name, prop.ty, &v)?;
            instance.env().declare(pname, v);
        }
        Ok(())
    }

    fn check_value_type(span: &Span, ty: TypeName, value: &Value) -> Result<()> {
        let ok = match ty {
            TypeName::Any => true,
            TypeName::String => matches!(value, Value::String(_)),
            TypeName::Number => matches!(value, Value::Number(_)),
            TypeName::Bool => matches!(value, Value::Bool(_)),
            TypeName::Object => matches!(value, Value::Object(_)),
            TypeName::Array => matches!(value, Value::Array(_)),
        };
        if ok || value.is_null() || value.is_undefined() {
            Ok(())
        } else {
            Err(span.error(
                format!(
                    "expected a value of type {}, got {}",
                    ty.as_str(),
                    value.type_name()
                )
                .as_str(),
            ))
        }
    }

    fn resolve_input(&mut self, type_name: &str, prop_name: &str) -> Result<Option<Value>> {
        if let Ok(doc) = self.inputs.as_object() {
            // Nested form: { "Type": { "prop": ... } }, then flat "prop".
            if let Some(section) = doc.get(&Value::String(type_name.into())) {
                if let Ok(section) = section.as_object() {
                    if let Some(v) = section.get(&Value::String(prop_name.into())) {
                        return Ok(Some(v.clone()));
                    }
                }
            }
            if let Some(v) = doc.get(&Value::String(prop_name.into())) {
                return Ok(Some(v.clone()));
            }
        }
        match self.input_resolver.as_mut() {
            Some(resolver) => resolver(type_name, prop_name),
            None => Ok(None),
        }
    }

    // References to instances

    /// The instance as a value: an object of its evaluated properties.
    fn instance_value(instance: &Rc<Instance>) -> Value {
        let map: BTreeMap<Value, Value> = instance
            .env()
            .local_bindings()
            .into_iter()
            .map(|(k, v)| (Value::String(k), v))
            .collect();
        Value::from(map)
    }

    // Reading another instance records a dependency edge and fails with the
    // full chain if that instance is still being evaluated.
    fn instance_ref_value(&mut self, instance: &Rc<Instance>, span: &Span) -> Result<Value> {
        if let Some(current) = self.active.last() {
            if current != instance.path() {
                let current = current.clone();
                if let Some(from) = self.registry.find_instance(&current) {
                    from.add_dependency(instance.path().clone());
                }
            }
        }
        match instance.state() {
            EvalState::InProgress => {
                let pos = self
                    .active
                    .iter()
                    .position(|p| p == instance.path())
                    .unwrap_or(0);
                let mut chain: Vec<String> =
                    self.active[pos..].iter().map(ToString::to_string).collect();
                chain.push(instance.path().to_string());
                Err(EvalError::Cycle { chain }.at(span))
            }
            _ => Ok(Self::instance_value(instance)),
        }
    }

    // Scopes to search for a sibling instance: the enclosing component's
    // children first, then the top level.
    fn instance_scopes(&self) -> Vec<Vec<Rc<str>>> {
        match &self.owner {
            Some(owner) => vec![owner.child_scope(), vec![]],
            None => vec![vec![]],
        }
    }

    fn lookup_instance_by_name(&mut self, name: &str, span: &Span) -> Result<Option<Value>> {
        for scope in self.instance_scopes() {
            let found = self.registry.find_named(&scope, name);
            if found.is_empty() {
                continue;
            }
            let plain: Vec<Rc<Instance>> = found
                .iter()
                .filter(|i| i.path().is_collection())
                .cloned()
                .collect();
            match plain.len() {
                1 => return Ok(Some(self.instance_ref_value(&plain[0], span)?)),
                0 => return Ok(Some(self.collection_value(&found, span)?)),
                _ => {
                    return Err(span.error(
                        format!("`{name}` names more than one instance in this scope").as_str(),
                    ))
                }
            }
        }
        Ok(None)
    }

    // The value of a keyed family: nested objects indexed by the loop
    // subscripts, integers for index keys and strings for key keys.
    fn collection_value(&mut self, instances: &[Rc<Instance>], span: &Span) -> Result<Value> {
        let mut root = Value::new_object();
        for instance in instances {
            let v = self.instance_ref_value(instance, span)?;
            let keys: Vec<Value> = instance
                .path()
                .subscripts()
                .iter()
                .map(|s| match s {
                    Subscript::Index(i) => Value::from(*i),
                    Subscript::Key(k) => Value::String(k.clone()),
                })
                .collect();
            Self::assign_in(&mut root, &keys, v, span)?;
        }
        Ok(root)
    }

    // `Type.name` addressing: only consulted when `Type` is not a variable.
    fn lookup_typed_instance(&mut self, type_name: &Span, name: &Span) -> Result<Option<Value>> {
        if self.registry.schema(type_name.text()).is_none() {
            self.force_declarators(type_name.text())?;
            if self.registry.schema(type_name.text()).is_none() {
                return Ok(None);
            }
        }

        for attempt in 0..2 {
            for scope in self.instance_scopes() {
                let found: Vec<Rc<Instance>> = self
                    .registry
                    .instances_of(type_name.text())
                    .into_iter()
                    .filter(|i| {
                        i.path().name() == name.text()
                            && i.path().parent_segments() == scope.as_slice()
                    })
                    .collect();
                if found.is_empty() {
                    continue;
                }
                if let Some(plain) = found.iter().find(|i| i.path().is_collection()) {
                    let plain = plain.clone();
                    return Ok(Some(self.instance_ref_value(&plain, name)?));
                }
                return Ok(Some(self.collection_value(&found, name)?));
            }
            // Not materialized yet; give forward declarations a chance.
            if attempt == 0 && !self.force_declarators(name.text())? {
                break;
            }
        }
        Err(EvalError::NotFound(format!("{}.{}", type_name.text(), name.text())).at(name))
    }

    // Expression evaluation

    fn eval_expr(&mut self, expr: &ExprRef, env: &Environment) -> Result<Value> {
        match expr.as_ref() {
            Expr::String { value, .. } | Expr::Number { value, .. } => Ok(value.clone()),
            Expr::Bool { value, .. } => Ok(Value::Bool(*value)),
            Expr::Null { .. } => Ok(Value::Null),
            Expr::Var { span } => self.eval_var(span, env),
            Expr::Array { items, .. } => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval_expr(item, env)?);
                }
                Ok(Value::from(out))
            }
            Expr::Object { fields, .. } => {
                let mut map = BTreeMap::new();
                for (key_span, key, value) in fields {
                    let k = self.eval_expr(key, env)?;
                    if map.contains_key(&k) {
                        return Err(key_span.error("duplicate object key"));
                    }
                    map.insert(k, self.eval_expr(value, env)?);
                }
                Ok(Value::from(map))
            }
            Expr::ArrayCompr { compr, .. } => self.eval_comprehension(compr, env),
            Expr::Call { span, fcn, params } => self.eval_call(span, fcn, params, env),
            Expr::UnaryExpr { span, op, expr } => {
                let v = self.eval_expr(expr, env)?;
                self.eval_unary(span, *op, v)
            }
            Expr::RefDot { refr, field, .. } => {
                if let Expr::Var { span } = refr.as_ref() {
                    if !env.contains(span.text()) {
                        if let Some(v) = self.lookup_typed_instance(span, field)? {
                            return Ok(v);
                        }
                    }
                }
                let base = self.eval_expr(refr, env)?;
                Self::value_field(&base, field)
            }
            Expr::RefBrack { refr, index, .. } => {
                let base = self.eval_expr(refr, env)?;
                let idx = self.eval_expr(index, env)?;
                Self::value_index(&base, &idx, index.span())
            }
            Expr::ArithExpr { span, op, lhs, rhs } => {
                let l = self.eval_expr(lhs, env)?;
                let r = self.eval_expr(rhs, env)?;
                Self::eval_arith(span, *op, &l, &r)
            }
            Expr::BoolExpr { span, op, lhs, rhs } => {
                let l = self.eval_expr(lhs, env)?;
                let r = self.eval_expr(rhs, env)?;
                Self::eval_compare(span, *op, &l, &r)
            }
            Expr::LogicExpr { op, lhs, rhs, .. } => {
                let l = self.eval_expr(lhs, env)?;
                if l.is_undefined() {
                    return Ok(Value::Undefined);
                }
                let l = *l
                    .as_bool()
                    .map_err(|_| lhs.span().error("logical operand must be a boolean"))?;
                match (*op, l) {
                    (LogicOp::And, false) => Ok(Value::Bool(false)),
                    (LogicOp::Or, true) => Ok(Value::Bool(true)),
                    _ => {
                        let r = self.eval_expr(rhs, env)?;
                        if r.is_undefined() {
                            return Ok(Value::Undefined);
                        }
                        r.as_bool()
                            .map(|b| Value::Bool(*b))
                            .map_err(|_| rhs.span().error("logical operand must be a boolean"))
                    }
                }
            }
        }
    }

    fn eval_var(&mut self, span: &Span, env: &Environment) -> Result<Value> {
        let name = span.text();
        if let Some(v) = env.get(name) {
            return Ok(v);
        }
        if let Some(v) = self.lookup_instance_by_name(name, span)? {
            return Ok(v);
        }
        if self.force_declarators(name)? {
            if let Some(v) = env.get(name) {
                return Ok(v);
            }
            if let Some(v) = self.lookup_instance_by_name(name, span)? {
                return Ok(v);
            }
        }
        Err(EvalError::NotFound(name.to_string()).at(span))
    }

    fn value_field(base: &Value, field: &Span) -> Result<Value> {
        match base {
            Value::Undefined => Ok(Value::Undefined),
            Value::Object(map) => match map.get(&Value::String(field.text().into())) {
                Some(v) => Ok(v.clone()),
                None => Err(EvalError::NotFound(field.text().to_string()).at(field)),
            },
            other => Err(field.error(
                format!("cannot access field `{}` of {}", field.text(), other.type_name())
                    .as_str(),
            )),
        }
    }

    fn value_index(base: &Value, idx: &Value, span: &Span) -> Result<Value> {
        match (base, idx) {
            (Value::Undefined, _) | (_, Value::Undefined) => Ok(Value::Undefined),
            (Value::Array(items), Value::Number(n)) => {
                let i = n
                    .as_i64()
                    .filter(|i| *i >= 0 && (*i as usize) < items.len())
                    .ok_or_else(|| {
                        span.error(format!("index {n} out of bounds (length {})", items.len())
                            .as_str())
                    })?;
                Ok(items[i as usize].clone())
            }
            (Value::Object(map), key) => match map.get(key) {
                Some(v) => Ok(v.clone()),
                None => Err(EvalError::NotFound(
                    key.to_json_str().unwrap_or_else(|_| "?".to_string()),
                )
                .at(span)),
            },
            (other, _) => {
                Err(span.error(format!("cannot index into {}", other.type_name()).as_str()))
            }
        }
    }

    fn eval_unary(&mut self, span: &Span, op: UnaryOp, v: Value) -> Result<Value> {
        if v.is_undefined() {
            return Ok(Value::Undefined);
        }
        match op {
            UnaryOp::Neg => {
                let n = v
                    .as_number()
                    .map_err(|_| span.error("unary `-` expects a number"))?;
                Ok(Value::from(n.neg().map_err(|e| span.error(&e.to_string()))?))
            }
            UnaryOp::Not => {
                let b = v
                    .as_bool()
                    .map_err(|_| span.error("`!` expects a boolean"))?;
                Ok(Value::Bool(!b))
            }
        }
    }

    fn eval_arith(span: &Span, op: ArithOp, lhs: &Value, rhs: &Value) -> Result<Value> {
        if lhs.is_undefined() || rhs.is_undefined() {
            return Ok(Value::Undefined);
        }
        if let (ArithOp::Add, Value::String(a), Value::String(b)) = (op, lhs, rhs) {
            return Ok(Value::String(format!("{a}{b}").into()));
        }
        let (a, b) = match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => (a, b),
            _ => {
                return Err(span.error(
                    format!(
                        "arithmetic expects numbers, got {} and {}",
                        lhs.type_name(),
                        rhs.type_name()
                    )
                    .as_str(),
                ))
            }
        };
        let n = match op {
            ArithOp::Add => a.add(b),
            ArithOp::Sub => a.sub(b),
            ArithOp::Mul => a.mul(b),
            ArithOp::Div => a.divide(b),
            ArithOp::Mod => a.modulo(b),
        }
        .map_err(|e| span.error(&e.to_string()))?;
        Ok(Value::from(n))
    }

    fn eval_compare(span: &Span, op: BoolOp, lhs: &Value, rhs: &Value) -> Result<Value> {
        if lhs.is_undefined() || rhs.is_undefined() {
            return Ok(Value::Undefined);
        }
        let r = match op {
            BoolOp::Eq => lhs == rhs,
            BoolOp::Ne => lhs != rhs,
            BoolOp::Lt | BoolOp::Le | BoolOp::Gt | BoolOp::Ge => {
                let ord = match (lhs, rhs) {
                    (Value::Number(_), Value::Number(_)) | (Value::String(_), Value::String(_)) => {
                        lhs.cmp(rhs)
                    }
                    _ => {
                        return Err(span.error(
                            format!(
                                "cannot order {} and {}",
                                lhs.type_name(),
                                rhs.type_name()
                            )
                            .as_str(),
                        ))
                    }
                };
                match op {
                    BoolOp::Lt => ord.is_lt(),
                    BoolOp::Le => ord.is_le(),
                    BoolOp::Gt => ord.is_gt(),
                    _ => ord.is_ge(),
                }
            }
        };
        Ok(Value::Bool(r))
    }

    fn eval_comprehension(&mut self, compr: &Comprehension, env: &Environment) -> Result<Value> {
        let collection = self.eval_expr(&compr.iterable, env)?;
        if collection.is_undefined() {
            return Ok(Value::Undefined);
        }
        let entries = match Self::iter_entries(&collection) {
            Some(entries) => entries,
            None => {
                return Err(compr.iterable.span().error(
                    format!(
                        "comprehension expects an array, object or string, got {}",
                        collection.type_name()
                    )
                    .as_str(),
                ))
            }
        };

        let mut out = vec![];
        for (value, key) in entries {
            let cenv = env.child("comprehension");
            cenv.declare(compr.item.text(), value);
            if let Some(index) = &compr.index {
                cenv.declare(index.text(), key);
            }
            match &compr.guard {
                Some(guard) => {
                    let c = self.eval_expr(&guard.cond, &cenv)?;
                    let keep = *c.as_bool().map_err(|_| {
                        guard.cond.span().error("comprehension guard must be a boolean")
                    })?;
                    if keep {
                        out.push(self.eval_expr(&compr.term, &cenv)?);
                    } else if let Some(otherwise) = &guard.otherwise {
                        out.push(self.eval_expr(otherwise, &cenv)?);
                    }
                }
                None => out.push(self.eval_expr(&compr.term, &cenv)?),
            }
        }
        Ok(Value::from(out))
    }

    // Calls

    fn eval_params(&mut self, params: &[ExprRef], env: &Environment) -> Result<Vec<Value>> {
        let mut args = Vec::with_capacity(params.len());
        for param in params {
            args.push(self.eval_expr(param, env)?);
        }
        Ok(args)
    }

    fn eval_call(
        &mut self,
        span: &Span,
        fcn: &ExprRef,
        params: &[ExprRef],
        env: &Environment,
    ) -> Result<Value> {
        if let Expr::Var { span: fspan } = fcn.as_ref() {
            let name = fspan.text();
            match env.get(name) {
                Some(Value::Closure(closure)) => {
                    let args = self.eval_params(params, env)?;
                    return self.call_closure(span, &closure, args);
                }
                Some(v) => {
                    return Err(fspan.error(
                        format!("`{name}` is a {}, not a function", v.type_name()).as_str(),
                    ))
                }
                None => (),
            }
            if let Some((nargs, fcn)) = self
                .extensions
                .get(name)
                .map(|(n, f)| (*n, f.clone()))
            {
                if params.len() != nargs as usize {
                    return Err(span.error(
                        format!("`{name}` expects {nargs} argument(s)").as_str(),
                    ));
                }
                let args = self.eval_params(params, env)?;
                if args.iter().any(Value::is_undefined) {
                    return Ok(Value::Undefined);
                }
                let mut fcn = fcn.borrow_mut();
                return fcn(args).map_err(|e| span.error(&e.to_string()));
            }
            if let Some((fcn, _)) = builtins::BUILTINS.get(name).copied() {
                let args = self.eval_params(params, env)?;
                if args.iter().any(Value::is_undefined) {
                    return Ok(Value::Undefined);
                }
                return fcn(span, params, &args);
            }
            return Err(EvalError::NotFound(name.to_string()).at(fspan));
        }

        let v = self.eval_expr(fcn, env)?;
        match &v {
            Value::Closure(closure) => {
                let closure = closure.clone();
                let args = self.eval_params(params, env)?;
                self.call_closure(span, &closure, args)
            }
            other => Err(fcn
                .span()
                .error(format!("{} is not callable", other.type_name()).as_str())),
        }
    }

    fn call_closure(
        &mut self,
        span: &Span,
        closure: &crate::value::Closure,
        args: Vec<Value>,
    ) -> Result<Value> {
        if args.len() != closure.params.len() {
            let name = closure.name.as_deref().unwrap_or("function");
            return Err(span.error(
                format!(
                    "`{name}` expects {} argument(s), got {}",
                    closure.params.len(),
                    args.len()
                )
                .as_str(),
            ));
        }
        let fenv = closure
            .env
            .child(closure.name.as_deref().unwrap_or("call"));
        for (param, arg) in closure.params.iter().zip(args) {
            fenv.declare(param, arg);
        }
        match self.eval_block(&closure.body, &fenv)? {
            Flow::Return(v) => Ok(v),
            Flow::Normal => Ok(Value::Null),
        }
    }

    // Assignment

    fn eval_assign(&mut self, target: &ExprRef, value: &ExprRef, env: &Environment) -> Result<()> {
        // Flatten the target into its root variable and accessor chain.
        let mut accessors: Vec<AccessStep> = vec![];
        let mut root = target;
        loop {
            match root.as_ref() {
                Expr::RefDot { refr, field, .. } => {
                    accessors.push(AccessStep::Field(field.clone()));
                    root = refr;
                }
                Expr::RefBrack { refr, index, .. } => {
                    accessors.push(AccessStep::Index(index.clone()));
                    root = refr;
                }
                _ => break,
            }
        }
        accessors.reverse();
        let root_span = match root.as_ref() {
            Expr::Var { span } => span.clone(),
            _ => return Err(root.span().error("invalid assignment target")),
        };
        let name = root_span.text().to_string();

        if env.contains(&name) {
            let new_value = self.eval_expr(value, env)?;
            if accessors.is_empty() {
                return env
                    .set(&name, new_value)
                    .map_err(|_| EvalError::NotFound(name.clone()).at(&root_span));
            }
            let mut keys = Vec::with_capacity(accessors.len());
            for step in &accessors {
                keys.push(match step {
                    AccessStep::Field(field) => Value::String(field.text().into()),
                    AccessStep::Index(index) => self.eval_expr(index, env)?,
                });
            }
            let mut current = env.lookup(&name)?;
            Self::assign_in(&mut current, &keys, new_value, target.span())?;
            return env
                .set(&name, current)
                .map_err(|_| EvalError::NotFound(name.clone()).at(&root_span));
        }

        // Not a variable: a constructed instance or a `Type.name` address.
        // Instance fields are write-once; any such target is a mutation.
        if let Some(path) = self.named_instance_path(&name) {
            let field = match accessors.first() {
                Some(AccessStep::Field(f)) => f.text().to_string(),
                _ => path.name().to_string(),
            };
            return Err(EvalError::Mutation {
                path: path.to_string(),
                field,
            }
            .at(target.span()));
        }
        if self.registry.schema(&name).is_some() {
            if let Some(AccessStep::Field(instance_name)) = accessors.first() {
                let field = match accessors.get(1) {
                    Some(AccessStep::Field(f)) => f.text().to_string(),
                    _ => instance_name.text().to_string(),
                };
                return Err(EvalError::Mutation {
                    path: format!("{name}.{}", instance_name.text()),
                    field,
                }
                .at(target.span()));
            }
        }
        Err(EvalError::NotFound(name).at(&root_span))
    }

    fn named_instance_path(&self, name: &str) -> Option<ResourcePath> {
        for scope in self.instance_scopes() {
            let found = self.registry.find_named(&scope, name);
            if let Some(instance) = found.first() {
                return Some(instance.path().clone());
            }
        }
        None
    }

    fn assign_in(v: &mut Value, keys: &[Value], new_value: Value, span: &Span) -> Result<()> {
        if keys.is_empty() {
            *v = new_value;
            return Ok(());
        }
        match v {
            Value::Object(_) => {
                let map = v.as_object_mut()?;
                let slot = map.entry(keys[0].clone()).or_insert(Value::Null);
                if keys.len() > 1 && slot.is_null() {
                    *slot = Value::new_object();
                }
                Self::assign_in(slot, &keys[1..], new_value, span)
            }
            Value::Array(_) => {
                let i = keys[0]
                    .as_i64()
                    .map_err(|_| span.error("array index must be a number"))?;
                let items = v.as_array_mut()?;
                if i < 0 || i as usize >= items.len() {
                    return Err(span.error(
                        format!("index {i} out of bounds (length {})", items.len()).as_str(),
                    ));
                }
                Self::assign_in(&mut items[i as usize], &keys[1..], new_value, span)
            }
            other => {
                Err(span.error(format!("cannot assign into {}", other.type_name()).as_str()))
            }
        }
    }

    // Imports

    fn eval_import(
        &mut self,
        span: &Span,
        path: &Span,
        alias: Option<&Span>,
        env: &Environment,
    ) -> Result<()> {
        let spec = unescape(path.text()).map_err(|e| path.error(&e.to_string()))?;
        let base = Path::new(span.source.file().as_str())
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
        let resolved = ImportCache::resolve(base.as_deref(), &spec)
            .map_err(|e| path.error(&e.to_string()))?;

        let bindings = match self.imports.lookup(&resolved) {
            Some(bindings) => bindings,
            None => self.load_module(&resolved, path)?,
        };

        match alias {
            Some(alias) => {
                let map: BTreeMap<Value, Value> = bindings
                    .iter()
                    .map(|(k, v)| (Value::String(k.clone()), v.clone()))
                    .collect();
                env.declare(alias.text(), Value::from(map));
            }
            None => {
                for (k, v) in bindings.iter() {
                    env.declare(k, v.clone());
                }
            }
        }
        Ok(())
    }

    fn load_module(&mut self, resolved: &Path, at: &Span) -> Result<ModuleBindings> {
        self.imports.begin(resolved).map_err(|e| {
            match e.downcast_ref::<EvalError>() {
                Some(kind) => kind.clone().at(at),
                None => e,
            }
        })?;

        let result = (|| -> Result<BTreeMap<Rc<str>, Value>> {
            let source = Source::from_file(resolved)?;
            let program = Parser::new(&source)?.parse()?;

            let menv = self.globals.child(source.file());
            let saved_owner = mem::take(&mut self.owner);
            let saved_keys = mem::take(&mut self.loop_keys);
            self.import_depth += 1;
            let flow = self.eval_block(&program.statements, &menv);
            self.import_depth -= 1;
            self.owner = saved_owner;
            self.loop_keys = saved_keys;

            match flow? {
                Flow::Normal => (),
                Flow::Return(_) => bail!(at.error("`return` outside of a function")),
            }
            Ok(menv.local_bindings())
        })();

        match result {
            Ok(bindings) => Ok(self.imports.finish(resolved, bindings)),
            Err(e) => {
                self.imports.abort(resolved);
                Err(e)
            }
        }
    }
}

enum AccessStep {
    Field(Span),
    Index(ExprRef),
}
