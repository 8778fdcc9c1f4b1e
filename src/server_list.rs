//! Server entry store
//!
//! Ordered list of relays; position 0 is the current/preferred server.
//! Every operation runs under one mutex and every mutation is written
//! through to disk.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    error::ServerEntryError,
    server_entry::ServerEntry,
    types::SERVER_ENTRIES_KEY,
};

/// On-disk form: `{"serverEntries": ["<hex>", ...]}`
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedServerList {
    #[serde(rename = "serverEntries")]
    server_entries: Vec<String>,
}

/// Ranked, persisted list of relay candidates
pub struct ServerList {
    /// Persistence file
    path: PathBuf,
    /// Entries in priority order
    entries: Mutex<Vec<ServerEntry>>,
}

impl ServerList {
    /// Create an empty store backed by `path`. Nothing is read until `load`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ServerEntry>> {
        // A panic while holding the lock leaves a valid Vec behind.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load persisted entries in file order, then merge the embedded
    /// newline-separated list. The result is written back once.
    pub fn load(&self, embedded_list: &str) {
        let mut entries = self.lock();

        match fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str::<PersistedServerList>(&content) {
                Ok(stored) => {
                    for encoded in &stored.server_entries {
                        match ServerEntry::decode(encoded) {
                            Ok(entry) => {
                                if !entries.iter().any(|e| e.ip_address == entry.ip_address) {
                                    entries.push(entry);
                                }
                            }
                            Err(e) => warn!("⚠️ Ignoring malformed stored entry: {}", e),
                        }
                    }
                    info!("📂 Loaded {} stored server entries", entries.len());
                }
                Err(e) => warn!("⚠️ Failed to parse stored server entries: {}", e),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no stored server entries at {}", self.path.display());
            }
            Err(e) => warn!("⚠️ Failed to read stored server entries: {}", e),
        }

        for encoded in embedded_list.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let _ = Self::merge_locked(&mut entries, encoded, true);
        }

        Self::save_locked(&entries, &self.path);
        info!("📋 Server list ready: {} entries", entries.len());
    }

    /// Merge one encoded entry.
    ///
    /// Discovered entries replace an existing entry with the same address;
    /// embedded ones never do. New entries go to index 1 so the current
    /// server keeps index 0.
    pub fn add_server_entry(
        &self,
        encoded: &str,
        is_embedded: bool,
    ) -> Result<(), ServerEntryError> {
        let mut entries = self.lock();
        if Self::merge_locked(&mut entries, encoded, is_embedded)? {
            Self::save_locked(&entries, &self.path);
        }
        Ok(())
    }

    /// `Ok(true)` when the list changed.
    fn merge_locked(
        entries: &mut Vec<ServerEntry>,
        encoded: &str,
        is_embedded: bool,
    ) -> Result<bool, ServerEntryError> {
        let new_entry = match ServerEntry::decode(encoded) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("⚠️ Ignoring malformed server entry: {}", e);
                return Err(e);
            }
        };

        match entries
            .iter()
            .position(|e| e.ip_address == new_entry.ip_address)
        {
            Some(existing) => {
                if is_embedded {
                    return Ok(false);
                }
                entries[existing] = new_entry;
            }
            None => {
                let index = if entries.is_empty() { 0 } else { 1 };
                entries.insert(index, new_entry);
            }
        }
        Ok(true)
    }

    /// Copy of the entry at index 0.
    pub fn current_server_entry(&self) -> Option<ServerEntry> {
        self.lock().first().cloned()
    }

    /// Rotate the current server to the end of the list.
    pub fn mark_current_server_failed(&self) {
        let mut entries = self.lock();
        if entries.is_empty() {
            return;
        }

        entries.rotate_left(1);
        if let Some(last) = entries.last() {
            info!("↪️ Server {} moved to the end of the list", last.ip_address);
        }
        Self::save_locked(&entries, &self.path);
    }

    /// Put `front` first, in the given order, followed by every other entry
    /// in its previous relative order. Entries are matched by address;
    /// addresses not in the store are skipped.
    pub fn move_entries_to_front(&self, front: &[ServerEntry]) {
        let mut entries = self.lock();

        let mut remaining = std::mem::take(&mut *entries);
        let mut reordered = Vec::with_capacity(remaining.len());

        for wanted in front {
            if let Some(pos) = remaining
                .iter()
                .position(|e| e.ip_address == wanted.ip_address)
            {
                reordered.push(remaining.remove(pos));
            }
        }
        reordered.append(&mut remaining);
        *entries = reordered;

        Self::save_locked(&entries, &self.path);
    }

    /// Write the whole list to disk.
    pub fn save_server_entries(&self) {
        let entries = self.lock();
        Self::save_locked(&entries, &self.path);
    }

    fn save_locked(entries: &[ServerEntry], path: &Path) {
        let persisted = PersistedServerList {
            server_entries: entries.iter().map(|e| e.encoded_entry.clone()).collect(),
        };

        if let Err(e) = write_atomically(path, &persisted) {
            warn!(
                "⚠️ Failed to store server entries to {}: {}",
                path.display(),
                e
            );
        }
    }

    /// Copy of the whole list.
    pub fn snapshot(&self) -> Vec<ServerEntry> {
        self.lock().clone()
    }

    /// Addresses in priority order.
    pub fn known_ips(&self) -> Vec<String> {
        self.lock().iter().map(|e| e.ip_address.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Write to a sibling temp file, then rename over the target.
fn write_atomically(path: &Path, persisted: &PersistedServerList) -> io::Result<()> {
    let body = serde_json::to_vec(&serde_json::json!({
        SERVER_ENTRIES_KEY: persisted.server_entries,
    }))?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }

    let tmp = path.with_extension("json.tmp");
    {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp)?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server_entry::tests::sample_entry;

    fn store() -> (tempfile::TempDir, ServerList) {
        let dir = tempfile::tempdir().unwrap();
        let list = ServerList::new(dir.path().join("servers.json"));
        (dir, list)
    }

    fn with_port(ip: &str, port: u16) -> ServerEntry {
        let mut entry = sample_entry(ip);
        entry.web_server_port = port;
        entry.encoded_entry = entry.encode();
        entry
    }

    #[test]
    fn test_insert_preserves_current_slot() {
        let (_dir, list) = store();
        list.add_server_entry(&sample_entry("1.1.1.1").encoded_entry, false).unwrap();
        list.add_server_entry(&sample_entry("2.2.2.2").encoded_entry, false).unwrap();
        list.add_server_entry(&sample_entry("3.3.3.3").encoded_entry, true).unwrap();

        assert_eq!(list.known_ips(), vec!["1.1.1.1", "3.3.3.3", "2.2.2.2"]);
    }

    #[test]
    fn test_dedup_discovered_replaces_embedded_ignored() {
        let (_dir, list) = store();
        list.add_server_entry(&with_port("1.1.1.1", 1000).encoded_entry, false).unwrap();
        list.add_server_entry(&with_port("2.2.2.2", 1000).encoded_entry, false).unwrap();

        // embedded copy must not overwrite
        list.add_server_entry(&with_port("2.2.2.2", 2000).encoded_entry, true).unwrap();
        assert_eq!(list.snapshot()[1].web_server_port, 1000);

        // discovered copy replaces in place
        list.add_server_entry(&with_port("2.2.2.2", 3000).encoded_entry, false).unwrap();
        let entries = list.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].ip_address, "2.2.2.2");
        assert_eq!(entries[1].web_server_port, 3000);

        // replacing the current entry keeps it at index 0
        list.add_server_entry(&with_port("1.1.1.1", 4000).encoded_entry, false).unwrap();
        assert_eq!(list.snapshot()[0].web_server_port, 4000);
    }

    #[test]
    fn test_malformed_entry_leaves_store_untouched() {
        let (_dir, list) = store();
        list.add_server_entry(&sample_entry("1.1.1.1").encoded_entry, false).unwrap();

        let bad = hex::encode("a b c d {not json");
        assert!(list.add_server_entry(&bad, false).is_err());
        assert!(list.add_server_entry("not-hex", true).is_err());
        assert_eq!(list.known_ips(), vec!["1.1.1.1"]);
    }

    #[test]
    fn test_current_entry_is_a_copy() {
        let (_dir, list) = store();
        list.add_server_entry(&sample_entry("1.1.1.1").encoded_entry, false).unwrap();

        let mut current = list.current_server_entry().unwrap();
        current.ip_address = "9.9.9.9".to_string();
        assert_eq!(list.current_server_entry().unwrap().ip_address, "1.1.1.1");
    }

    #[test]
    fn test_mark_current_failed_rotates_once() {
        let (_dir, list) = store();
        for ip in ["1.1.1.1", "2.2.2.2", "3.3.3.3"] {
            list.add_server_entry(&sample_entry(ip).encoded_entry, false).unwrap();
        }
        // order: 1, 3, 2
        list.mark_current_server_failed();
        assert_eq!(list.known_ips(), vec!["3.3.3.3", "2.2.2.2", "1.1.1.1"]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_move_entries_to_front() {
        let (_dir, list) = store();
        for ip in ["1.1.1.1", "2.2.2.2", "3.3.3.3", "4.4.4.4"] {
            list.add_server_entry(&sample_entry(ip).encoded_entry, false).unwrap();
        }
        // order: 1, 4, 3, 2
        list.move_entries_to_front(&[sample_entry("2.2.2.2"), sample_entry("3.3.3.3")]);
        assert_eq!(
            list.known_ips(),
            vec!["2.2.2.2", "3.3.3.3", "1.1.1.1", "4.4.4.4"]
        );

        list.move_entries_to_front(&[sample_entry("8.8.8.8")]);
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let (dir, list) = store();
        for ip in ["1.1.1.1", "2.2.2.2", "3.3.3.3"] {
            list.add_server_entry(&sample_entry(ip).encoded_entry, false).unwrap();
        }
        list.mark_current_server_failed();
        let before: Vec<String> = list.snapshot().into_iter().map(|e| e.encoded_entry).collect();

        let reloaded = ServerList::new(dir.path().join("servers.json"));
        reloaded.load("");
        let after: Vec<String> = reloaded.snapshot().into_iter().map(|e| e.encoded_entry).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_reload_keeps_stored_order() {
        let (dir, list) = store();
        for ip in ["1.1.1.1", "2.2.2.2", "3.3.3.3", "4.4.4.4"] {
            list.add_server_entry(&sample_entry(ip).encoded_entry, false).unwrap();
        }
        assert_eq!(list.known_ips(), vec!["1.1.1.1", "4.4.4.4", "3.3.3.3", "2.2.2.2"]);

        let reloaded = ServerList::new(dir.path().join("servers.json"));
        reloaded.load("");
        assert_eq!(reloaded.known_ips(), list.known_ips());

        // the order written back survives a second restart too
        let again = ServerList::new(dir.path().join("servers.json"));
        again.load(&sample_entry("5.5.5.5").encoded_entry);
        assert_eq!(
            again.known_ips(),
            vec!["1.1.1.1", "5.5.5.5", "4.4.4.4", "3.3.3.3", "2.2.2.2"]
        );
    }

    #[test]
    fn test_load_corrupt_file_falls_back_to_embedded() {
        let (dir, list) = store();
        fs::write(dir.path().join("servers.json"), b"{broken").unwrap();

        let embedded = format!(
            "{}\n\n{}\n",
            sample_entry("1.1.1.1").encoded_entry,
            sample_entry("2.2.2.2").encoded_entry
        );
        list.load(&embedded);
        assert_eq!(list.known_ips(), vec!["1.1.1.1", "2.2.2.2"]);
    }

    #[test]
    fn test_embedded_does_not_override_stored() {
        let (dir, list) = store();
        list.add_server_entry(&with_port("1.1.1.1", 1111).encoded_entry, false).unwrap();

        let reloaded = ServerList::new(dir.path().join("servers.json"));
        reloaded.load(&with_port("1.1.1.1", 2222).encoded_entry);
        assert_eq!(reloaded.snapshot()[0].web_server_port, 1111);
    }

    #[test]
    fn test_persisted_file_format() {
        let (dir, list) = store();
        let entry = sample_entry("1.1.1.1");
        list.add_server_entry(&entry.encoded_entry, false).unwrap();

        let raw = fs::read_to_string(dir.path().join("servers.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["serverEntries"][0], entry.encoded_entry);
    }
}
