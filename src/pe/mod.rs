// src/pe/mod.rs

//! PE (Portable Executable) inspection
//!
//! Given an `.exe`/`.msi` target this module produces everything the
//! prefix builder needs:
//!
//! - the full SHA-256 of the file bytes (streamed, 4 KiB chunks),
//! - a best-effort product name from the version resource,
//! - a PNG icon extracted from the icon-group resource.
//!
//! Header and section parsing is done with goblin; the `.rsrc`
//! directory itself is walked manually since it is a simple
//! fixed-layout tree (see [`resource`]).

pub mod icon;
pub mod resource;

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

/// Read buffer for hashing
const HASH_CHUNK: usize = 4096;

/// Result of inspecting one PE file
#[derive(Debug, Clone)]
pub struct Inspection {
    /// Full 64-char hex digest of the file bytes
    pub sha256sum: String,
    /// Display name per the derivation rule
    pub progname: String,
    /// Largest extracted icon, PNG-encoded; `None` when extraction
    /// failed (a default icon is substituted at display time)
    pub icon_png: Option<Vec<u8>>,
}

/// Inspect a PE file. Hashing failures are fatal to the caller;
/// name/icon extraction failures degrade gracefully.
pub fn inspect(path: &Path) -> Result<Inspection> {
    if !path.is_file() {
        return Err(Error::not_found(path));
    }
    let sha256sum = sha256_file(path)?;

    let bytes = std::fs::read(path)?;
    let (product_name, icon_png) = match resource::ResourceTable::parse(&bytes) {
        Ok(table) => {
            let name = table.product_name();
            let icon = match icon::extract_largest_png(&table) {
                Ok(png) => png,
                Err(e) => {
                    debug!("icon extraction failed for {}: {}", path.display(), e);
                    None
                }
            };
            (name, icon)
        }
        Err(e) => {
            warn!("cannot parse resources of {}: {}", path.display(), e);
            (None, None)
        }
    };

    let progname = derive_progname(product_name.as_deref(), path);
    Ok(Inspection {
        sha256sum,
        progname,
        icon_png,
    })
}

/// Streamed SHA-256 of a file
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|_| Error::not_found(path))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; HASH_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// First 10 hex chars, used in prefix directory names only — the
/// catalog key is always the full digest.
pub fn short_hash(full: &str) -> &str {
    &full[..full.len().min(10)]
}

/// Derive a display name from the version-resource product name and
/// the executable stem:
///
/// 1. if either contains "setup" or "install" (case-insensitive),
///    append "Setup" to the product name;
/// 2. else prefer a printable-ASCII, digit-free product name;
/// 3. else fall back to the stem with spaces replaced by `_`.
pub fn derive_progname(product_name: Option<&str>, exe: &Path) -> String {
    let stem = exe
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let product = product_name.unwrap_or("").trim();

    let lower_product = product.to_lowercase();
    let lower_stem = stem.to_lowercase();
    let installerish = ["setup", "install"]
        .iter()
        .any(|t| lower_product.contains(t) || lower_stem.contains(t));

    if installerish {
        return format!("{} Setup", product).trim().to_string();
    }
    if !product.is_empty()
        && product.chars().all(|c| c.is_ascii() && !c.is_control())
        && !product.chars().any(|c| c.is_ascii_digit())
    {
        return product.to_string();
    }
    stem.replace(' ', "_")
}

/// Turn a display name into a filesystem-friendly stem
pub fn safe_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| if c == ' ' { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        .collect();
    if stem.is_empty() {
        "unnamed".to_string()
    } else {
        stem
    }
}
