// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::lexer::{Source, Span};
use crate::value::Value;

use core::{cmp, fmt, ops::Deref};
use std::rc::Rc;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BoolOp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
    Ne,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LogicOp {
    And,
    Or,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Shared AST node. Equality and ordering are by node identity, which lets
/// nodes act as map keys during evaluation.
pub struct NodeRef<T> {
    node: Rc<T>,
}

impl<T> NodeRef<T> {
    pub fn new(node: T) -> Self {
        Self {
            node: Rc::new(node),
        }
    }
}

impl<T> Clone for NodeRef<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for NodeRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.node.fmt(f)
    }
}

impl<T> cmp::PartialEq for NodeRef<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.node, &other.node)
    }
}

impl<T> cmp::Eq for NodeRef<T> {}

impl<T> cmp::PartialOrd for NodeRef<T> {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> cmp::Ord for NodeRef<T> {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        Rc::as_ptr(&self.node).cmp(&Rc::as_ptr(&other.node))
    }
}

impl<T> Deref for NodeRef<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.node
    }
}

impl<T> AsRef<T> for NodeRef<T> {
    fn as_ref(&self) -> &T {
        self
    }
}

pub type Ref<T> = NodeRef<T>;

#[derive(Debug)]
pub enum Expr {
    // Literals carry their decoded value.
    String {
        span: Span,
        value: Value,
    },

    Number {
        span: Span,
        value: Value,
    },

    Bool {
        span: Span,
        value: bool,
    },

    Null {
        span: Span,
    },

    Var {
        span: Span,
    },

    Array {
        span: Span,
        items: Vec<Ref<Expr>>,
    },

    Object {
        span: Span,
        fields: Vec<(Span, Ref<Expr>, Ref<Expr>)>,
    },

    // [for x, i in xs: term if cond else other]
    ArrayCompr {
        span: Span,
        compr: Ref<Comprehension>,
    },

    Call {
        span: Span,
        fcn: Ref<Expr>,
        params: Vec<Ref<Expr>>,
    },

    UnaryExpr {
        span: Span,
        op: UnaryOp,
        expr: Ref<Expr>,
    },

    // ref
    RefDot {
        span: Span,
        refr: Ref<Expr>,
        field: Span,
    },

    RefBrack {
        span: Span,
        refr: Ref<Expr>,
        index: Ref<Expr>,
    },

    // Infix expressions
    ArithExpr {
        span: Span,
        op: ArithOp,
        lhs: Ref<Expr>,
        rhs: Ref<Expr>,
    },

    BoolExpr {
        span: Span,
        op: BoolOp,
        lhs: Ref<Expr>,
        rhs: Ref<Expr>,
    },

    LogicExpr {
        span: Span,
        op: LogicOp,
        lhs: Ref<Expr>,
        rhs: Ref<Expr>,
    },
}

impl Expr {
    pub const fn span(&self) -> &Span {
        match *self {
            Self::String { ref span, .. }
            | Self::Number { ref span, .. }
            | Self::Bool { ref span, .. }
            | Self::Null { ref span, .. }
            | Self::Var { ref span, .. }
            | Self::Array { ref span, .. }
            | Self::Object { ref span, .. }
            | Self::ArrayCompr { ref span, .. }
            | Self::Call { ref span, .. }
            | Self::UnaryExpr { ref span, .. }
            | Self::RefDot { ref span, .. }
            | Self::RefBrack { ref span, .. }
            | Self::ArithExpr { ref span, .. }
            | Self::BoolExpr { ref span, .. }
            | Self::LogicExpr { ref span, .. } => span,
        }
    }

    /// True for expressions that are literal values at the top level.
    /// Cloud-computed properties must not carry one as initializer.
    pub const fn is_literal(&self) -> bool {
        matches!(
            *self,
            Self::String { .. }
                | Self::Number { .. }
                | Self::Bool { .. }
                | Self::Null { .. }
                | Self::Array { .. }
                | Self::Object { .. }
        )
    }
}

pub type ExprRef = Ref<Expr>;

#[derive(Debug)]
pub struct Comprehension {
    pub span: Span,
    pub item: Span,
    pub index: Option<Span>,
    pub iterable: ExprRef,
    pub term: ExprRef,
    pub guard: Option<Guard>,
}

/// The `if cond [else other]` tail of a comprehension. `if` alone filters;
/// with `else` it selects between two terms.
#[derive(Debug)]
pub struct Guard {
    pub cond: ExprRef,
    pub otherwise: Option<ExprRef>,
}

/// Declared type of a schema property or output.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TypeName {
    String,
    Number,
    Bool,
    Object,
    Array,
    Any,
}

impl TypeName {
    pub fn from_text(text: &str) -> Option<TypeName> {
        match text {
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "bool" => Some(Self::Bool),
            "object" => Some(Self::Object),
            "array" => Some(Self::Array),
            "any" => Some(Self::Any),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PropertyRole {
    Regular,
    Input,
    Output,
}

#[derive(Debug)]
pub struct Property {
    pub span: Span,
    pub name: Span,
    pub ty: TypeName,
    pub role: PropertyRole,
    /// Value computed externally; must not carry a literal initializer.
    pub cloud: bool,
    pub default: Option<ExprRef>,
}

/// A `name = expr` entry in a resource/component instantiation body.
#[derive(Debug)]
pub struct Field {
    pub span: Span,
    pub name: Span,
    pub value: ExprRef,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum InstanceKind {
    Resource,
    Component,
}

#[derive(Debug)]
pub enum Statement {
    Schema {
        span: Span,
        name: Span,
        properties: Vec<Property>,
    },

    // component <name> { inputs/outputs + body }
    ComponentDef {
        span: Span,
        name: Span,
        properties: Vec<Property>,
        body: Vec<Ref<Statement>>,
    },

    // resource <type> <name> { fields } or component <type> <name> { fields }
    Instance {
        span: Span,
        kind: InstanceKind,
        type_name: Span,
        name: Span,
        fields: Vec<Field>,
    },

    Var {
        span: Span,
        name: Span,
        value: ExprRef,
    },

    Assign {
        span: Span,
        target: ExprRef,
        value: ExprRef,
    },

    Function {
        span: Span,
        name: Span,
        params: Vec<Span>,
        body: Vec<Ref<Statement>>,
    },

    Return {
        span: Span,
        value: Option<ExprRef>,
    },

    For {
        span: Span,
        item: Span,
        index: Option<Span>,
        iterable: ExprRef,
        body: Vec<Ref<Statement>>,
    },

    If {
        span: Span,
        cond: ExprRef,
        then_body: Vec<Ref<Statement>>,
        else_body: Vec<Ref<Statement>>,
    },

    Output {
        span: Span,
        ty: TypeName,
        name: Span,
        sensitive: bool,
        value: ExprRef,
    },

    Import {
        span: Span,
        path: Span,
        alias: Option<Span>,
    },

    Expr {
        span: Span,
        expr: ExprRef,
    },
}

impl Statement {
    pub const fn span(&self) -> &Span {
        match *self {
            Self::Schema { ref span, .. }
            | Self::ComponentDef { ref span, .. }
            | Self::Instance { ref span, .. }
            | Self::Var { ref span, .. }
            | Self::Assign { ref span, .. }
            | Self::Function { ref span, .. }
            | Self::Return { ref span, .. }
            | Self::For { ref span, .. }
            | Self::If { ref span, .. }
            | Self::Output { ref span, .. }
            | Self::Import { ref span, .. }
            | Self::Expr { ref span, .. } => span,
        }
    }
}

/// A parsed source file.
#[derive(Debug)]
pub struct Program {
    pub source: Source,
    pub statements: Vec<Ref<Statement>>,
}
