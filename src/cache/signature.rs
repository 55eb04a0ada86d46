use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::dsl::ast::Script;

/// Header whose value names the script kind.
pub const KIND_HEADER: &str = "TouhouDanmakufu";

/// Script kind as declared by the `#TouhouDanmakufu[...]` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptKind {
    Player,
    Single,
    Plural,
    Stage,
    Package,
    ShotData,
    ItemData,
    #[default]
    Unknown,
}

impl ScriptKind {
    pub const ALL: [ScriptKind; 8] = [
        ScriptKind::Player,
        ScriptKind::Single,
        ScriptKind::Plural,
        ScriptKind::Stage,
        ScriptKind::Package,
        ScriptKind::ShotData,
        ScriptKind::ItemData,
        ScriptKind::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ScriptKind::Player => "player",
            ScriptKind::Single => "single",
            ScriptKind::Plural => "plural",
            ScriptKind::Stage => "stage",
            ScriptKind::Package => "package",
            ScriptKind::ShotData => "shot_data",
            ScriptKind::ItemData => "item_data",
            ScriptKind::Unknown => "unknown",
        }
    }

    /// Kind named by a header value such as `Single` or `ShotData`.
    pub fn from_header(value: &str) -> ScriptKind {
        let folded: String = value
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        ScriptKind::ALL
            .into_iter()
            .find(|k| k.as_str().replace('_', "") == folded)
            .unwrap_or(ScriptKind::Unknown)
    }

    /// Kind declared by the script's own header, `Unknown` without one.
    pub fn declared_by(script: &Script) -> ScriptKind {
        script.header(KIND_HEADER).map_or(ScriptKind::Unknown, ScriptKind::from_header)
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScriptKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScriptKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = ScriptKind::ALL.iter().map(|k| k.as_str()).collect();
                format!("unknown script kind '{s}' (expected one of: {})", names.join(", "))
            })
    }
}

/// Identity of one compiled artifact. Any field change is a different key, so
/// editing a file (new timestamp) never reuses the old artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    /// Canonical path.
    pub path: PathBuf,
    pub kind: ScriptKind,
    pub version: String,
    pub modified: SystemTime,
}

impl Signature {
    pub fn new(path: impl Into<PathBuf>, kind: ScriptKind, version: impl Into<String>, modified: SystemTime) -> Self {
        Self {
            path: path.into(),
            kind,
            version: version.into(),
            modified,
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{} {}]", self.path.display(), self.kind, self.version)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    use crate::dsl::ast::{Header, SourcePos};

    #[test]
    fn every_field_is_part_of_the_key() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        let base = Signature::new("/a.dnh", ScriptKind::Single, "ph3", t);
        let variants = [
            Signature { path: "/b.dnh".into(), ..base.clone() },
            Signature { kind: ScriptKind::Stage, ..base.clone() },
            Signature { version: "0.12m".into(), ..base.clone() },
            Signature { modified: t + Duration::from_secs(1), ..base.clone() },
        ];
        let mut set = HashSet::new();
        set.insert(base.clone());
        for v in variants {
            assert_ne!(v, base);
            assert!(set.insert(v));
        }
        assert!(!set.insert(base));
    }

    #[test]
    fn kind_parsing() {
        assert_eq!("shot_data".parse::<ScriptKind>().unwrap(), ScriptKind::ShotData);
        assert!("boss".parse::<ScriptKind>().is_err());
        assert_eq!(ScriptKind::from_header("Single"), ScriptKind::Single);
        assert_eq!(ScriptKind::from_header("ShotData"), ScriptKind::ShotData);
        assert_eq!(ScriptKind::from_header("Mystery"), ScriptKind::Unknown);
    }

    #[test]
    fn kind_from_script_header() {
        let mut script = crate::dsl::build::script(vec![]);
        assert_eq!(ScriptKind::declared_by(&script), ScriptKind::Unknown);
        script.headers.push(Header {
            key: KIND_HEADER.to_string(),
            value: "Plural".to_string(),
            pos: SourcePos::default(),
        });
        assert_eq!(ScriptKind::declared_by(&script), ScriptKind::Plural);
    }
}
