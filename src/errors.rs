// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::lexer::Span;

use thiserror::Error;

/// The closed set of failure kinds raised by evaluation.
///
/// Every kind is fatal: evaluation aborts at the first failure and no partial
/// results are produced. Callers can recover the kind from an `anyhow` error
/// chain via `downcast_ref::<EvalError>()`.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    /// Duplicate schema/component definition or duplicate instance key.
    #[error("`{0}` is already declared")]
    Duplicate(String),

    /// Reference to an undeclared variable, field or schema property.
    #[error("`{0}` is not defined")]
    NotFound(String),

    /// The instance reference graph contains a cycle. The chain lists the
    /// instance identities from the cycle entry back to itself.
    #[error("cyclic reference: {}", chain.join(" -> "))]
    Cycle { chain: Vec<String> },

    /// Assignment to a field of an already constructed instance from outside
    /// its own body. Fields are write-once at construction time.
    #[error("cannot assign to field `{field}` of constructed instance `{path}`")]
    Mutation { path: String, field: String },

    /// An `input` property with no binding, no default and no resolver value.
    #[error("no value could be resolved for input `{0}`")]
    MissingInput(String),

    /// A declared output that was never computed.
    #[error("output `{0}` could not be computed")]
    MissingOutput(String),

    /// A resource path string that does not match the path grammar.
    #[error("malformed resource path `{0}`")]
    MalformedPath(String),
}

impl EvalError {
    /// Attach a source position to this error, keeping the typed kind
    /// downcastable through the anyhow chain.
    pub fn at(self, span: &Span) -> anyhow::Error {
        let msg = span.message("error", &self.to_string());
        anyhow::Error::new(self).context(msg)
    }
}
