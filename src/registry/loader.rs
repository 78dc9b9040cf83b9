use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};

use super::{BlockDefinition, BlockNumber, Registry};
use crate::core::errors::RegistryError;

/// On-disk format of a registry document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryFormat {
    Yaml,
    Json,
}

impl RegistryFormat {
    /// Pick the format from a file extension; anything but `.json` is YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => RegistryFormat::Json,
            _ => RegistryFormat::Yaml,
        }
    }
}

/// A block record as written in a registry file
#[derive(Debug, Clone, Deserialize)]
pub struct RawBlock {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(alias = "blockNumber")]
    pub block_number: BlockNumber,
    #[serde(default, alias = "story_points")]
    pub weight: u32,
    #[serde(default)]
    pub dependencies: RawDependencies,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDependencies {
    #[serde(default)]
    pub blocks: Vec<BlockNumber>,
}

impl From<RawBlock> for BlockDefinition {
    fn from(raw: RawBlock) -> Self {
        BlockDefinition {
            name: raw.name.unwrap_or_else(|| raw.id.clone()),
            id: raw.id,
            block_number: raw.block_number,
            weight: raw.weight,
            depends_on: raw.dependencies.blocks.into_iter().collect(),
        }
    }
}

/// `{ blocks: [...] }` or `{ agents: [...] }`; a bare list is parsed directly
#[derive(Debug, Deserialize)]
struct WrappedDocument {
    #[serde(alias = "agents")]
    blocks: Vec<RawBlock>,
}

impl RegistryFormat {
    /// Decide the document shape from a generic parse, then parse the source
    /// again as that shape so errors keep their line and column.
    fn parse_records(self, content: &str) -> Result<Vec<RawBlock>, String> {
        match self {
            RegistryFormat::Json => {
                let shape: serde_json::Value =
                    serde_json::from_str(content).map_err(|e| e.to_string())?;
                if shape.is_array() {
                    serde_json::from_str(content).map_err(|e| e.to_string())
                } else {
                    serde_json::from_str::<WrappedDocument>(content)
                        .map(|d| d.blocks)
                        .map_err(|e| e.to_string())
                }
            }
            RegistryFormat::Yaml => {
                let shape: serde_yaml::Value =
                    serde_yaml::from_str(content).map_err(|e| e.to_string())?;
                if shape.is_sequence() {
                    serde_yaml::from_str(content).map_err(|e| e.to_string())
                } else {
                    serde_yaml::from_str::<WrappedDocument>(content)
                        .map(|d| d.blocks)
                        .map_err(|e| e.to_string())
                }
            }
        }
    }
}

/// Parses registry sources into a validated [`Registry`]
#[derive(Debug, Clone, Default)]
pub struct RegistryLoader {
    allow_cycles: bool,
}

impl RegistryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept cyclic registries instead of failing. Cyclic blocks never run.
    pub fn allow_cycles(mut self, allow: bool) -> Self {
        self.allow_cycles = allow;
        self
    }

    /// Load a registry file, choosing the format by extension
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Registry, RegistryError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let registry = self.load_str(&content, RegistryFormat::from_path(path))?;
        info!(
            "Registry: loaded {} blocks from {}",
            registry.len(),
            path.display()
        );
        Ok(registry)
    }

    /// Parse a registry document held in memory
    pub fn load_str(&self, content: &str, format: RegistryFormat) -> Result<Registry, RegistryError> {
        let records = format
            .parse_records(content)
            .map_err(|message| RegistryError::Parse { message })?;
        self.load_records(records)
    }

    /// Validate already-parsed records
    pub fn load_records(&self, records: Vec<RawBlock>) -> Result<Registry, RegistryError> {
        debug!("Registry: validating {} records", records.len());
        let blocks = records.into_iter().map(BlockDefinition::from).collect();
        if self.allow_cycles {
            Registry::new_allowing_cycles(blocks)
        } else {
            Registry::new(blocks)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    const AGENTS_YAML: &str = r#"
agents:
  - id: frontend-architect
    name: Frontend Architect
    block_number: 2
    story_points: 8
    dependencies:
      blocks: [1]
  - id: foundation
    name: Foundation
    block_number: 1
    story_points: 5
  - id: integration
    block_number: 3
    dependencies:
      blocks: [1, 2]
"#;

    #[test]
    fn test_load_agents_layout() {
        let registry = RegistryLoader::new()
            .load_str(AGENTS_YAML, RegistryFormat::Yaml)
            .unwrap();

        let numbers: Vec<_> = registry.block_numbers().collect();
        assert_eq!(numbers, vec![1, 2, 3]);

        let architect = registry.get(2).unwrap();
        assert_eq!(architect.name, "Frontend Architect");
        assert_eq!(architect.weight, 8);
        assert_eq!(architect.depends_on, [1].into_iter().collect::<BTreeSet<_>>());

        let integration = registry.get(3).unwrap();
        assert_eq!(integration.name, "integration");
        assert_eq!(integration.weight, 0);
    }

    #[test]
    fn test_load_json_list() {
        let json = r#"[
            {"id": "a", "name": "A", "blockNumber": 10, "weight": 3, "dependencies": {"blocks": []}},
            {"id": "b", "name": "B", "blockNumber": 20, "weight": 1, "dependencies": {"blocks": [10]}}
        ]"#;
        let registry = RegistryLoader::new()
            .load_str(json, RegistryFormat::Json)
            .unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.get(20).unwrap().depends_on.contains(&10));
    }

    #[test]
    fn test_unparsable_source() {
        let err = RegistryLoader::new()
            .load_str("agents: [ {id: 1", RegistryFormat::Yaml)
            .unwrap_err();
        assert!(matches!(err, RegistryError::Parse { .. }));
    }

    #[test]
    fn test_parse_errors_point_at_the_record() {
        let yaml = "agents:\n  - id: foundation\n    story_points: 5\n";
        let message = match RegistryLoader::new().load_str(yaml, RegistryFormat::Yaml) {
            Err(RegistryError::Parse { message }) => message,
            other => panic!("expected a parse error, got {other:?}"),
        };
        assert!(message.contains("missing field `block_number`"), "{message}");
        assert!(message.contains("line"), "{message}");

        let json = r#"[{"id": "a", "blockNumber": "ten"}]"#;
        let message = match RegistryLoader::new().load_str(json, RegistryFormat::Json) {
            Err(RegistryError::Parse { message }) => message,
            other => panic!("expected a parse error, got {other:?}"),
        };
        assert!(message.contains("line 1"), "{message}");
        assert!(!message.contains("did not match any variant"), "{message}");
    }

    #[test]
    fn test_cycle_allowed_when_lenient() {
        let yaml = r#"
blocks:
  - {id: one, block_number: 1, dependencies: {blocks: [2]}}
  - {id: two, block_number: 2, dependencies: {blocks: [1]}}
"#;
        assert!(matches!(
            RegistryLoader::new().load_str(yaml, RegistryFormat::Yaml),
            Err(RegistryError::Cycle { .. })
        ));
        let registry = RegistryLoader::new()
            .allow_cycles(true)
            .load_str(yaml, RegistryFormat::Yaml)
            .unwrap();
        assert_eq!(registry.cycles(), vec![vec![1, 2]]);
    }

    #[test]
    fn test_load_file_picks_format_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(
            &path,
            r#"{"agents": [{"id": "solo", "block_number": 1}]}"#,
        )
        .unwrap();
        let registry = RegistryLoader::new().load_file(&path).unwrap();
        assert_eq!(registry.get(1).unwrap().id, "solo");

        let missing = RegistryLoader::new().load_file(dir.path().join("nope.yml"));
        assert!(matches!(missing, Err(RegistryError::Read { .. })));
    }
}
