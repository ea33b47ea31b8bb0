// src/catalog.rs

//! Content-addressed catalog of shortcut descriptors
//!
//! The catalog maps the full SHA-256 of an executable to exactly one
//! descriptor. Insertion order is preserved for presentation: a map
//! plus an ordered key list, with new entries going to the head (the
//! most recently created shortcut is shown first).
//!
//! Reads may happen concurrently, but all mutation goes through the
//! owning loop (or via a posted idle job), matching the one-writer
//! rule of the concurrency model.

use crate::descriptor::{Descriptor, CHARM_EXT};
use crate::error::{Error, Result};
use crate::paths::home_dir;
use crate::pe;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Descriptor scan depth below the prefixes root: the prefixes root
/// itself, prefix directories, and files directly inside them.
const SCAN_DEPTH: usize = 2;

/// Sortable presentation fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Progname,
    Wineprefix,
    Mtime,
}

/// Ordered `sha256sum -> Descriptor` map
#[derive(Debug, Default)]
pub struct Catalog {
    entries: HashMap<String, Descriptor>,
    /// Presentation order, head first
    order: Vec<String>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan `dir` (depth ≤ 2) for descriptor files and load them.
    /// Unreadable descriptors are skipped with a warning; on-disk
    /// files carrying absolute home paths are rewritten tildified.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut catalog = Self::new();
        if !dir.is_dir() {
            return Ok(catalog);
        }
        let mut paths: Vec<PathBuf> = WalkDir::new(dir)
            .max_depth(SCAN_DEPTH)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| p.extension().map(|x| x == CHARM_EXT).unwrap_or(false))
            .collect();
        paths.sort();

        for path in paths {
            match Descriptor::load(&path) {
                Ok(descriptor) => {
                    retildify_on_disk(&descriptor, &path);
                    catalog.put(descriptor);
                }
                Err(e) => warn!("skipping descriptor {}: {}", path.display(), e),
            }
        }
        debug!("catalog loaded: {} descriptors", catalog.len());
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Descriptor> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Keys in presentation order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Descriptors in presentation order
    pub fn iter(&self) -> impl Iterator<Item = &Descriptor> {
        self.order.iter().filter_map(|k| self.entries.get(k))
    }

    /// Insert or replace. A replaced key keeps its position; a new key
    /// is appended to the tail (loading preserves scan order).
    pub fn put(&mut self, descriptor: Descriptor) {
        let key = descriptor.sha256sum.clone();
        if self.entries.insert(key.clone(), descriptor).is_none() {
            self.order.push(key);
        }
    }

    /// Insert at the head of the presentation order; an existing entry
    /// with the same key is removed first so the map stays
    /// single-valued.
    pub fn put_front(&mut self, descriptor: Descriptor) {
        let key = descriptor.sha256sum.clone();
        self.order.retain(|k| k != &key);
        self.order.insert(0, key.clone());
        self.entries.insert(key, descriptor);
    }

    /// Drop an entry from the in-memory map (files are untouched)
    pub fn remove(&mut self, key: &str) -> Option<Descriptor> {
        self.order.retain(|k| k != key);
        self.entries.remove(key)
    }

    /// Delete a descriptor: remove the file, its icon, and the entry
    pub fn delete(&mut self, key: &str) -> Result<()> {
        let descriptor = self
            .remove(key)
            .ok_or_else(|| Error::invalid("catalog", format!("no entry for {key}")))?;
        if descriptor.script_path.is_file() {
            std::fs::remove_file(&descriptor.script_path)?;
        }
        let icon = descriptor.icon_path();
        if icon.is_file() {
            std::fs::remove_file(icon)?;
        }
        Ok(())
    }

    /// Rename the display name: descriptor file and sibling icon move
    /// to the new stem, `script_path` is rewritten, the key (hash) is
    /// unchanged.
    pub fn rename(&mut self, key: &str, new_progname: &str) -> Result<()> {
        let descriptor = self
            .entries
            .get_mut(key)
            .ok_or_else(|| Error::invalid("catalog", format!("no entry for {key}")))?;

        let new_stem = pe::safe_stem(new_progname);
        if new_stem.is_empty() {
            return Err(Error::invalid("rename", "empty target name"));
        }
        let new_script = descriptor
            .script_path
            .with_file_name(format!("{new_stem}.{CHARM_EXT}"));
        if new_script == descriptor.script_path {
            descriptor.progname = new_progname.to_string();
            return descriptor.save();
        }
        if new_script.exists() {
            return Err(Error::Conflict { path: new_script });
        }

        let old_icon = descriptor.icon_path();
        std::fs::rename(&descriptor.script_path, &new_script)?;
        descriptor.script_path = new_script;
        descriptor.progname = new_progname.to_string();
        if old_icon.is_file() {
            std::fs::rename(&old_icon, descriptor.icon_path())?;
        }
        descriptor.save()
    }

    /// Move the descriptor file aside to `<name>.bak` and drop the
    /// entry, returning the descriptor for regeneration by the prefix
    /// builder.
    pub fn take_to_bak(&mut self, key: &str) -> Result<Descriptor> {
        let descriptor = self
            .remove(key)
            .ok_or_else(|| Error::invalid("catalog", format!("no entry for {key}")))?;
        if descriptor.script_path.is_file() {
            let bak = descriptor.script_path.with_extension("bak");
            std::fs::rename(&descriptor.script_path, bak)?;
        }
        Ok(descriptor)
    }

    /// Ordered view by field, tie-broken by key. The catalog itself is
    /// not reordered.
    pub fn sorted(&self, field: SortField, descending: bool) -> Vec<&Descriptor> {
        let mut view: Vec<&Descriptor> = self.iter().collect();
        view.sort_by(|a, b| {
            let ord = match field {
                SortField::Progname => a
                    .progname
                    .to_lowercase()
                    .cmp(&b.progname.to_lowercase()),
                SortField::Wineprefix => a.wineprefix.cmp(&b.wineprefix),
                SortField::Mtime => a.mtime.cmp(&b.mtime),
            };
            let ord = ord.then_with(|| a.sha256sum.cmp(&b.sha256sum));
            if descending {
                ord.reverse()
            } else {
                ord
            }
        });
        view
    }

    /// Entries whose prefix is `prefix`, in presentation order
    pub fn in_prefix(&self, prefix: &Path) -> Vec<&Descriptor> {
        self.iter().filter(|d| d.wineprefix == prefix).collect()
    }
}

/// Rewrite the descriptor file when the on-disk text still spells the
/// absolute home path. Failure is cosmetic and only logged.
fn retildify_on_disk(descriptor: &Descriptor, path: &Path) {
    let Ok(home) = home_dir() else { return };
    let home = home.to_string_lossy().into_owned();
    match std::fs::read_to_string(path) {
        Ok(text) if text.contains(&home) => {
            if let Err(e) = descriptor.save() {
                warn!("cannot tildify {}: {}", path.display(), e);
            }
        }
        _ => {}
    }
}
