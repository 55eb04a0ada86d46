//! The compiled-script artifact shared by every consumer of a signature.

use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::cache::signature::{ScriptKind, Signature};
use crate::dsl::source_map::SourceMap;
use crate::runtime::Bytecode;

/// Metadata stored (serialized) in every artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptHeader {
    pub path: PathBuf,
    pub kind: ScriptKind,
    pub version: String,
    /// Serial that prefixes this script's mangled names.
    pub script_id: u64,
    /// `#Key[value]` lines of the script, in source order.
    pub headers: IndexMap<String, String>,
    pub files: Vec<String>,
    pub reachable: usize,
    pub eliminated: usize,
}

/// Immutable once built. Header and source map are kept in serialized form;
/// decode them on demand with [`CompiledScript::header`] and
/// [`CompiledScript::source_map`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledScript {
    signature: Signature,
    header: Vec<u8>,
    source_map: Vec<u8>,
    bytecode: Bytecode,
    entry_points: IndexMap<String, String>,
}

impl CompiledScript {
    pub fn new(
        signature: Signature,
        header: &ScriptHeader,
        source_map: &SourceMap,
        bytecode: Bytecode,
        entry_points: IndexMap<String, String>,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            signature,
            header: serde_json::to_vec(header)?,
            source_map: source_map.to_json()?,
            bytecode,
            entry_points,
        })
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn header_bytes(&self) -> &[u8] {
        &self.header
    }

    pub fn source_map_bytes(&self) -> &[u8] {
        &self.source_map
    }

    pub fn bytecode(&self) -> &Bytecode {
        &self.bytecode
    }

    /// Entry routine name → mangled global name.
    pub fn entry_points(&self) -> &IndexMap<String, String> {
        &self.entry_points
    }

    pub fn mangled_entry(&self, name: &str) -> Option<&str> {
        self.entry_points.get(name).map(String::as_str)
    }

    pub fn header(&self) -> serde_json::Result<ScriptHeader> {
        serde_json::from_slice(&self.header)
    }

    pub fn source_map(&self) -> serde_json::Result<SourceMap> {
        SourceMap::from_json(&self.source_map)
    }

    /// Opaque on-disk form.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
