//! Compiler pipeline and compiled-script cache for a bullet-hell scripting
//! language. Scripts arrive as ASTs from an external front end, are checked,
//! pruned to reachable code, lowered to source for an embedded dynamic runtime
//! and cached by signature.

pub mod artifact;
pub mod cache;
pub mod dsl;
pub mod error;
pub mod fs;
pub mod parser;
pub mod paths;
pub mod persist;
pub mod runtime;
pub mod settings;
