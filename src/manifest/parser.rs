//! Manifest Parser
//!
//! Loads manifests from YAML or JSON files. JSON is chosen by the `.json`
//! extension; everything else is read as YAML (JSON is valid YAML too, so
//! this only matters for error messages).

use std::fs;
use std::path::Path;

use log::info;

use super::model::Manifest;
use super::validator::{validate_manifest, ManifestError};

/// Parses manifest text without validating it.
pub fn parse_manifest(content: &str, json: bool) -> Result<Manifest, ManifestError> {
    if json {
        serde_json::from_str(content).map_err(|e| ManifestError::Parse(e.to_string()))
    } else {
        serde_yaml::from_str(content).map_err(|e| ManifestError::Parse(e.to_string()))
    }
}

/// Loads and validates a manifest file.
///
/// # Example
///
/// ```no_run
/// use piperunner::manifest::load_manifest;
///
/// let manifest = load_manifest("pipeline.yaml").unwrap();
/// println!("{} steps", manifest.len());
/// ```
pub fn load_manifest<P: AsRef<Path>>(path: P) -> Result<Manifest, ManifestError> {
    let path = path.as_ref();
    info!("Loading manifest: {}", path.display());

    let content = fs::read_to_string(path)
        .map_err(|e| ManifestError::Io(format!("{}: {}", path.display(), e)))?;

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    let manifest = parse_manifest(&content, is_json)?;
    validate_manifest(&manifest)?;
    Ok(manifest)
}

/// Writes a manifest as YAML.
pub fn save_manifest<P: AsRef<Path>>(manifest: &Manifest, path: P) -> Result<(), ManifestError> {
    let yaml = serde_yaml::to_string(manifest).map_err(|e| ManifestError::Parse(e.to_string()))?;
    fs::write(path.as_ref(), yaml).map_err(|e| ManifestError::Io(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::StepSpec;
    use tempfile::tempdir;

    const PIPELINE: &str = r#"
steps:
  - id: extract
    implementation: builtin.generate
    config:
      rows: 1000
  - id: transform
    implementation: builtin.filter
    config: { column: value, op: gt, value: 500 }
    depends_on: extract
  - id: write
    implementation: builtin.export
    config:
      path: out.jsonl
    depends_on: [transform]
"#;

    #[test]
    fn test_load_manifest_valid_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        fs::write(&path, PIPELINE).unwrap();

        let manifest = load_manifest(&path).unwrap();
        assert_eq!(manifest.len(), 3);
        assert_eq!(manifest.steps[1].config["op"], serde_json::json!("gt"));
        assert_eq!(manifest.steps[2].depends_on, vec!["transform"]);
    }

    #[test]
    fn test_load_manifest_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        fs::write(
            &path,
            r#"{"steps":[{"id":"a","implementation":"builtin.generate","config":{"rows":5}}]}"#,
        )
        .unwrap();
        let manifest = load_manifest(&path).unwrap();
        assert_eq!(manifest.steps[0].config["rows"], serde_json::json!(5));
    }

    #[test]
    fn test_load_manifest_file_not_found() {
        let result = load_manifest("/nonexistent/pipeline.yaml");
        assert!(matches!(result, Err(ManifestError::Io(_))));
    }

    #[test]
    fn test_load_manifest_invalid_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "steps: [ { id: a, implementation").unwrap();
        assert!(matches!(load_manifest(&path), Err(ManifestError::Parse(_))));
    }

    #[test]
    fn test_load_manifest_runs_validation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cycle.yaml");
        fs::write(
            &path,
            "steps:\n  - {id: a, implementation: x, depends_on: b}\n  - {id: b, implementation: x, depends_on: a}\n",
        )
        .unwrap();
        assert!(matches!(
            load_manifest(&path),
            Err(ManifestError::CyclicDependency(_))
        ));
    }

    #[test]
    fn test_save_manifest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("saved.yaml");
        let manifest = Manifest::new()
            .with_step(StepSpec::new("a", "builtin.generate").with_config("rows", 3));
        save_manifest(&manifest, &path).unwrap();
        assert_eq!(load_manifest(&path).unwrap(), manifest);
    }
}
