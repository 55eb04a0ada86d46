//! Compiled-script cache: a generic flyweight cache bound to the compile
//! pipeline and keyed by script signature.

pub mod flyweight;
pub mod script_cache;
pub mod signature;

pub use flyweight::{Abandon, Completion, FlyweightCache, LoadHandle};
pub use script_cache::{ScriptCache, ScriptHandle};
pub use signature::{ScriptKind, Signature};
