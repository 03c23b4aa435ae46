// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Stratus is an interpreter for a declarative infrastructure description
//! language. Programs declare schemas (record shapes), resources (typed
//! instances) and components (parameterized groups with inputs and outputs);
//! the interpreter materializes every instance exactly once, resolves
//! forward references on demand, and reports reference cycles with the full
//! chain of instances involved.
//!
//! ```rust
//! use stratus::Engine;
//!
//! fn example() -> anyhow::Result<()> {
//!     let mut engine = Engine::new();
//!     engine.add_source(
//!         "main.strat",
//!         r#"
//!         schema bucket {
//!             string name
//!             bool versioned = false
//!         }
//!
//!         resource bucket logs { name = "logs" }
//!
//!         output string bucketName = logs.name
//!         "#,
//!     )?;
//!     let results = engine.eval()?;
//!     println!("{results}");
//!     Ok(())
//! }
//! ```

mod ast;
mod builtins;
mod engine;
mod environment;
mod errors;
mod imports;
mod interpreter;
mod lexer;
mod number;
mod parser;
mod path;
mod schema;
mod value;

pub use engine::Engine;
pub use errors::EvalError;
pub use interpreter::{EvalOutput, EvalResults, Extension, InputResolver};
pub use number::Number;
pub use path::{ResourcePath, Subscript};
pub use value::Value;

/// Access to lower-level building blocks. These interfaces are not subject
/// to the same stability expectations as the crate root.
pub mod unstable {
    pub use crate::ast::*;
    pub use crate::environment::Environment;
    pub use crate::lexer::{unescape, Lexer, Source, Span, Token, TokenKind};
    pub use crate::parser::Parser;
}
