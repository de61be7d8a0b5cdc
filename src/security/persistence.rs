//! On-disk formats for the security manager.
//!
//! - Blacklist / whitelist: JSON `{metadata, entries: [IpEntry]}`, rewritten whole.
//! - Active bans: JSON `{metadata, active_bans: [TempBan]}`, present only while a
//!   ban is outstanding and deleted once loaded.
//! - Ban history: CSV with a fixed header, one row per ban.
//!
//! Every write goes to a temp file first and is renamed into place.

use super::types::{BanRecord, IpEntry, TempBan};
use crate::error::PersistenceError;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

const FORMAT_VERSION: &str = "1.0";

pub const HISTORY_HEADER: [&str; 11] = [
    "ip",
    "failed_attempts",
    "unban_time",
    "remark",
    "created_at",
    "created_by",
    "duration",
    "protocol",
    "removed_at",
    "removed_by",
    "removed_reason",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub version: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_entries: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ListFile {
    metadata: Metadata,
    #[serde(default)]
    entries: Vec<IpEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ActiveBansFile {
    metadata: Metadata,
    #[serde(default)]
    active_bans: Vec<TempBan>,
}

/// now_iso is the local wall-clock time used for `created_at` style fields
pub fn now_iso() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// write_atomic writes through a sibling temp file and renames it over `path`
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;
    }

    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = Path::new(&temp);

    fs::write(temp, bytes).map_err(|e| PersistenceError::io(temp, e))?;
    fs::rename(temp, path).map_err(|e| PersistenceError::io(path, e))?;
    debug!(path = %path.display(), "security state saved");
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), PersistenceError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PersistenceError::io(path, e)),
    }
}

/// ensure_list creates an empty list document if none exists
pub fn ensure_list(path: &Path, description: &str) -> Result<(), PersistenceError> {
    if path.exists() {
        return Ok(());
    }
    let doc = ListFile {
        metadata: Metadata {
            version: FORMAT_VERSION.into(),
            description: description.into(),
            created_at: Some(now_iso()),
            updated_at: None,
            total_entries: None,
        },
        entries: Vec::new(),
    };
    write_atomic(path, &serde_json::to_vec_pretty(&doc)?)
}

pub fn load_list(path: &Path) -> Result<Vec<IpEntry>, PersistenceError> {
    let text = fs::read(path).map_err(|e| PersistenceError::io(path, e))?;
    let doc: ListFile = serde_json::from_slice(&text)?;
    Ok(doc.entries)
}

pub fn save_list(path: &Path, description: &str, entries: &[IpEntry]) -> Result<(), PersistenceError> {
    let doc = ListFile {
        metadata: Metadata {
            version: FORMAT_VERSION.into(),
            description: description.into(),
            created_at: None,
            updated_at: Some(now_iso()),
            total_entries: Some(entries.len()),
        },
        entries: entries.to_vec(),
    };
    write_atomic(path, &serde_json::to_vec_pretty(&doc)?)
}

/// take_active_bans loads the snapshot and deletes it
///
/// A missing file is an empty snapshot. Expiry filtering is up to the caller.
pub fn take_active_bans(path: &Path) -> Result<Vec<TempBan>, PersistenceError> {
    let text = match fs::read(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PersistenceError::io(path, e)),
    };
    let doc: ActiveBansFile = serde_json::from_slice(&text)?;
    remove_if_exists(path)?;
    Ok(doc.active_bans)
}

/// save_active_bans writes the snapshot, or removes it when nothing is outstanding
pub fn save_active_bans(path: &Path, bans: &[TempBan]) -> Result<(), PersistenceError> {
    if bans.is_empty() {
        return remove_if_exists(path);
    }
    let doc = ActiveBansFile {
        metadata: Metadata {
            version: FORMAT_VERSION.into(),
            description: "active temporary bans".into(),
            created_at: None,
            updated_at: Some(now_iso()),
            total_entries: Some(bans.len()),
        },
        active_bans: bans.to_vec(),
    };
    write_atomic(path, &serde_json::to_vec_pretty(&doc)?)
}

pub fn load_history(path: &Path) -> Result<Vec<BanRecord>, PersistenceError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::Reader::from_path(path)?;
    reader
        .deserialize()
        .collect::<Result<Vec<BanRecord>, _>>()
        .map_err(PersistenceError::from)
}

/// save_history rewrites the log; the header row is always present
pub fn save_history(path: &Path, records: &[BanRecord]) -> Result<(), PersistenceError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(HISTORY_HEADER)?;
    for record in records {
        writer.serialize(record)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| PersistenceError::io(path, e.into_error()))?;
    write_atomic(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ban(ip: &str, unban_time: f64) -> TempBan {
        TempBan {
            ip: ip.parse().unwrap(),
            failed_attempts: 5,
            unban_time,
            remark: "SOCKS5 auth failures over limit".into(),
            created_at: now_iso(),
            created_by: "system:auto:auth_failure".into(),
            duration: 3600,
            protocol: "socks5".into(),
        }
    }

    #[test]
    fn list_document_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("blacklist.json");

        ensure_list(&path, "blacklist").unwrap();
        assert!(load_list(&path).unwrap().is_empty());

        let entry = IpEntry {
            ip: "10.0.0.0/8".into(),
            remark: "lab".into(),
            created_at: now_iso(),
            created_by: "user:manual:admin".into(),
        };
        save_list(&path, "blacklist", &[entry.clone()]).unwrap();

        let raw: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["metadata"]["total_entries"], 1);
        assert_eq!(raw["entries"][0]["ip"], "10.0.0.0/8");
        assert_eq!(load_list(&path).unwrap(), vec![entry]);
    }

    #[test]
    fn entries_without_created_by_are_legacy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("whitelist.json");
        fs::write(
            &path,
            r#"{"metadata":{"version":"1.0","description":"whitelist"},"entries":[{"ip":"192.0.2.1"}]}"#,
        )
        .unwrap();
        let entries = load_list(&path).unwrap();
        assert_eq!(entries[0].created_by, "system:auto:legacy");
    }

    #[test]
    fn active_bans_are_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".active_bans.json");

        save_active_bans(&path, &[ban("192.0.2.1", 4_000_000_000.0)]).unwrap();
        assert!(path.exists());

        let bans = take_active_bans(&path).unwrap();
        assert_eq!(bans.len(), 1);
        assert!(!path.exists());
        assert!(take_active_bans(&path).unwrap().is_empty());

        save_active_bans(&path, &[ban("192.0.2.1", 1.0)]).unwrap();
        save_active_bans(&path, &[]).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn history_keeps_header_and_optional_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ban_history.csv");

        save_history(&path, &[]).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.trim_end(), HISTORY_HEADER.join(","));

        let mut removed = BanRecord::from(&ban("192.0.2.2", 10.5));
        removed.removed_at = Some(now_iso());
        removed.removed_reason = Some("expired".into());
        let open = BanRecord::from(&ban("192.0.2.3", 20.0));
        save_history(&path, &[removed.clone(), open.clone()]).unwrap();

        let loaded = load_history(&path).unwrap();
        assert_eq!(loaded, vec![removed, open]);
        assert_eq!(loaded[1].removed_by, None);
    }
}
