//! One JSON document per row, one directory per table.
//!
//! Writes go to a dot-prefixed temp file in the table directory and are
//! renamed into place, so a crash mid-write never exposes a torn row.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use strato_core::error::{CoreError, Result};

pub(crate) const TABLES: [&str; 8] = [
    "tenants",
    "limits",
    "workloads",
    "instances",
    "volumes",
    "attachments",
    "pools",
    "mappings",
];

fn row_path(dir: &Path, table: &str, key: &str) -> PathBuf {
    dir.join(table).join(format!("{key}.json"))
}

/// Durably write one row; the caller mutates its in-memory copy only
/// after this returns Ok.
pub(crate) async fn write_row<T: Serialize>(
    dir: &Path,
    table: &str,
    key: &str,
    row: &T,
) -> Result<()> {
    let path = row_path(dir, table, key);
    let tmp = dir.join(table).join(format!(".{key}.tmp"));

    let json = serde_json::to_vec_pretty(row)
        .map_err(|e| CoreError::Fatal(format!("cannot serialize {table}/{key}: {e}")))?;
    tokio::fs::write(&tmp, &json)
        .await
        .map_err(|e| CoreError::Fatal(format!("cannot write {}: {e}", tmp.display())))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .map_err(|e| CoreError::Fatal(format!("cannot commit {}: {e}", path.display())))?;
    Ok(())
}

/// Remove one row; missing rows are not an error (removal is idempotent).
pub(crate) async fn remove_row(dir: &Path, table: &str, key: &str) -> Result<()> {
    let path = row_path(dir, table, key);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CoreError::Fatal(format!(
            "cannot remove {}: {e}",
            path.display()
        ))),
    }
}

/// Replay a whole table at open. Rows that fail to parse are skipped with
/// a warning rather than wedging the controller on one corrupt file.
pub(crate) fn load_table<T: DeserializeOwned>(dir: &Path, table: &str) -> Result<Vec<T>> {
    let table_dir = dir.join(table);
    let entries = std::fs::read_dir(&table_dir)
        .map_err(|e| CoreError::Fatal(format!("cannot read {}: {e}", table_dir.display())))?;

    let mut rows = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| CoreError::Fatal(format!("cannot scan {table} table: {e}")))?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || !name.ends_with(".json") {
            continue;
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| CoreError::Fatal(format!("cannot read {}: {e}", path.display())))?;
        match serde_json::from_str(&raw) {
            Ok(row) => rows.push(row),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unparseable row"),
        }
    }
    Ok(rows)
}

/// Create the table directories under `dir` if absent.
pub(crate) fn prepare(dir: &Path) -> Result<()> {
    for table in TABLES {
        std::fs::create_dir_all(dir.join(table))
            .map_err(|e| CoreError::Fatal(format!("cannot create table dir {table}: {e}")))?;
    }
    Ok(())
}
