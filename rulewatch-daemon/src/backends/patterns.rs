use std::path::PathBuf;

use async_trait::async_trait;
use rulewatch_core::codec::load_record;
use rulewatch_core::collaborators::{PatternLookup, WorkflowPattern};
use rulewatch_core::error::{EngineError, Result};

/// Reads workflow patterns from `<root>/<pattern_id>.json`.
#[derive(Debug, Clone)]
pub struct PatternDirectory {
    root: Option<PathBuf>,
}

impl PatternDirectory {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }
}

fn valid_pattern_id(pattern_id: &str) -> bool {
    !pattern_id.is_empty()
        && !pattern_id.starts_with('.')
        && !pattern_id.contains(['/', '\\'])
}

#[async_trait]
impl PatternLookup for PatternDirectory {
    async fn get_pattern(&self, pattern_id: &str) -> Result<Option<WorkflowPattern>> {
        let Some(root) = &self.root else {
            return Ok(None);
        };
        if !valid_pattern_id(pattern_id) {
            return Err(EngineError::InvalidRule(format!("invalid pattern id '{pattern_id}'")));
        }
        let path = root.join(format!("{pattern_id}.json"));
        if !path.is_file() {
            return Ok(None);
        }
        load_record(&path).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    #[tokio::test]
    async fn loads_pattern_records_by_id() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("sweep.json"),
            r#"{"persistence_id": "sweep", "name": "Sweep", "parameterize_over": {"x": {"start": 0, "stop": 2, "step": 1}}}"#,
        )
        .unwrap();
        let patterns = PatternDirectory::new(Some(tmp.path().to_path_buf()));

        let pattern = patterns.get_pattern("sweep").await.unwrap().expect("pattern");
        assert_eq!(pattern.name, "Sweep");
        assert_eq!(pattern.parameterize_over["x"].stop, 2.0);

        assert!(patterns.get_pattern("absent").await.unwrap().is_none());
        assert!(patterns.get_pattern("../sweep").await.is_err());
        assert!(PatternDirectory::new(None).get_pattern("sweep").await.unwrap().is_none());
    }
}
