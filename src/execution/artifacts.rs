//! Artifact layout of a run directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use walkdir::WalkDir;

use crate::store::{StoreError, TableStore};

pub const TABLES_DIR: &str = "tables";
pub const OUTPUTS_DIR: &str = "outputs";
pub const LOGS_DIR: &str = "logs";
pub const STORE_FILE: &str = "store.db";
pub const EVENTS_FILE: &str = "events.jsonl";
pub const METRICS_FILE: &str = "metrics.jsonl";
pub const STATUS_FILE: &str = "status.json";
pub const PACKAGE_FILE: &str = "run.json";

/// Exports every table to `tables/<name>.jsonl` under `dir`.
pub fn export_tables(store: &TableStore, dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut exported = Vec::new();
    for table in store.tables()? {
        let relative = Path::new(TABLES_DIR).join(format!("{}.jsonl", table));
        let rows = store.export_jsonl(&table, &dir.join(&relative))?;
        debug!("Exported table '{}' ({} rows)", table, rows);
        exported.push(relative);
    }
    Ok(exported)
}

/// Files steps wrote under `outputs/`, relative to `dir`, sorted.
pub fn list_outputs(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let root = dir.join(OUTPUTS_DIR);
    if !root.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(&root).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(dir) {
            files.push(relative.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

/// Exported tables followed by step output files.
pub fn collect_local(store: &TableStore, dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    fs::create_dir_all(dir.join(TABLES_DIR))?;
    let mut files = export_tables(store, dir)?;
    files.extend(list_outputs(dir)?);
    Ok(files)
}
