/// Trust records persisted between CLI runs.
///
/// One pretty-printed JSON object mapping script path → `PermissionRecord`.
/// A missing file is an empty store.
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::trust::PermissionRecord;

pub fn load(path: &Path) -> Result<HashMap<String, PermissionRecord>> {
    if !path.exists() {
        debug!("No trust store at {}, starting empty", path.display());
        return Ok(HashMap::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Cannot read trust store {}", path.display()))?;
    let records: HashMap<String, PermissionRecord> = serde_json::from_str(&content)
        .with_context(|| format!("Invalid trust store {}", path.display()))?;
    info!("Loaded {} permission records from {}", records.len(), path.display());
    Ok(records)
}

pub fn save(path: &Path, records: &HashMap<String, PermissionRecord>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(records)?;
    fs::write(path, content)
        .with_context(|| format!("Cannot write trust store {}", path.display()))?;
    debug!("Saved {} permission records to {}", records.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::TrustRegistry;

    #[test]
    fn test_missing_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let records = load(&dir.path().join("trust.json")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("trust.json");

        let mut registry = TrustRegistry::new(true, HashMap::new());
        registry.approve("scripts/a.py", b"print(1)");
        registry.grant("scripts/a.py", "network");
        save(&path, registry.records()).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(&loaded, registry.records());
        let mut reloaded = TrustRegistry::new(true, loaded);
        assert!(reloaded.authorize("scripts/a.py", b"print(1)").is_allowed());
        assert!(reloaded.has_permission("scripts/a.py", "network"));
    }

    #[test]
    fn test_corrupt_store_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trust.json");
        fs::write(&path, "{not json").unwrap();
        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid trust store"));
    }
}
