// src/archive/mod.rs

//! Archive engine: portable prefix snapshots
//!
//! All archive flavors are tar streams compressed with zstd. Path
//! portability is achieved with archive-level *name transforms* while
//! packing/unpacking — the tree on disk is never walked after the
//! fact. Only `*.reg` files and descriptor-like text files are edited
//! in place (and reverted after packing), see [`rewrite`].
//!
//! | Flavor | Contents | Extension |
//! |---|---|---|
//! | Prefix | one prefix tree | `.prefix` |
//! | Bottle | prefix + bundled runner / game dir | `.bottle` |
//! | Legacy | third-party backups, import only | `.wzt` |

pub mod create;
pub mod import;
pub mod restore;
pub mod rewrite;

pub use create::{create_archive, CreateOptions};
pub use import::import_wine_directory;
pub use restore::restore_archive;

use crate::error::{Error, Result};
use crate::task::StopFlag;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Archive flavors, by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Prefix,
    Bottle,
    Legacy,
}

impl Flavor {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "prefix" => Some(Self::Prefix),
            "bottle" => Some(Self::Bottle),
            "wzt" => Some(Self::Legacy),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Prefix => "prefix",
            Self::Bottle => "bottle",
            Self::Legacy => "wzt",
        }
    }
}

/// One directory mapped into the archive under a relative root.
/// A plain prefix backup has a single source; a bottle adds the
/// bundled game directory and runner as further sources whose `rel`
/// places them inside the prefix entry.
pub struct PackSource {
    pub dir: PathBuf,
    pub rel: PathBuf,
}

/// Entry-name rewriting applied while streaming. Returning `None`
/// keeps the name unchanged.
pub type NameTransform<'a> = &'a dyn Fn(&Path) -> Option<PathBuf>;

/// Stream `sources` into a zstd-compressed tar at `dest`.
///
/// Symlinks are stored verbatim. The stop flag is polled between
/// entries; on cancellation the partial output is unlinked.
pub fn pack(
    dest: &Path,
    sources: &[PackSource],
    transform: NameTransform<'_>,
    stop: &StopFlag,
) -> Result<()> {
    let result = pack_inner(dest, sources, transform, stop);
    if result.is_err() {
        let _ = std::fs::remove_file(dest);
    }
    result
}

fn pack_inner(
    dest: &Path,
    sources: &[PackSource],
    transform: NameTransform<'_>,
    stop: &StopFlag,
) -> Result<()> {
    let file = File::create(dest)?;
    let mut encoder = zstd::Encoder::new(BufWriter::new(file), 3)?;
    let workers = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    encoder.multithread(workers)?;

    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for source in sources {
        if !source.dir.is_dir() {
            return Err(Error::not_found(&source.dir));
        }
        for entry in WalkDir::new(&source.dir).follow_links(false) {
            stop.check()?;
            let entry = entry.map_err(|e| {
                Error::invalid("archive source", format!("{}: {}", source.dir.display(), e))
            })?;
            let rel = entry
                .path()
                .strip_prefix(&source.dir)
                .map_err(|_| Error::invalid("archive source", "walk escaped the source root"))?;
            let name = if rel.as_os_str().is_empty() {
                source.rel.clone()
            } else {
                source.rel.join(rel)
            };
            let name = transform(&name).unwrap_or(name);
            builder.append_path_with_name(entry.path(), &name)?;
        }
    }

    let encoder = builder.into_inner()?;
    encoder.finish()?;
    debug!("packed {} source(s) into {}", sources.len(), dest.display());
    Ok(())
}

/// Extract a zstd tar into `dest_dir`, applying the reverse name
/// transform entry by entry. With `expect_top` set, every entry must
/// live under that top-level name; anything else aborts the
/// extraction. The stop flag is polled per entry; the caller owns
/// cleanup of a partial extraction.
pub fn unpack(
    archive: &Path,
    dest_dir: &Path,
    transform: NameTransform<'_>,
    expect_top: Option<&str>,
    stop: &StopFlag,
) -> Result<()> {
    let file = File::open(archive).map_err(|_| Error::not_found(archive))?;
    let decoder = zstd::Decoder::new(BufReader::new(file))?;
    let mut tar = tar::Archive::new(decoder);
    tar.set_preserve_permissions(true);

    for entry in tar.entries()? {
        stop.check()?;
        let mut entry = entry?;
        let rel = entry.path()?.into_owned();
        let rel = sanitize_entry(&rel)?;
        if let Some(top) = expect_top {
            let first = match rel.components().next() {
                Some(std::path::Component::Normal(c)) => c.to_string_lossy().into_owned(),
                _ => String::new(),
            };
            if first != top {
                return Err(Error::invalid(
                    "archive",
                    format!("entry outside {}: {}", top, rel.display()),
                ));
            }
        }
        let rel = transform(&rel).unwrap_or(rel);
        entry.unpack(dest_dir.join(rel))?;
    }
    Ok(())
}

/// Entry paths and sizes, for the space pre-check and to learn the
/// top-level prefix name without extracting.
pub fn list_entries(archive: &Path) -> Result<Vec<(PathBuf, u64)>> {
    let file = File::open(archive).map_err(|_| Error::not_found(archive))?;
    let decoder = zstd::Decoder::new(BufReader::new(file))?;
    let mut tar = tar::Archive::new(decoder);
    let mut out = Vec::new();
    for entry in tar.entries()? {
        let entry = entry?;
        out.push((entry.path()?.into_owned(), entry.size()));
    }
    Ok(out)
}

/// Name of the top-level directory the archive unpacks to
pub fn top_level_name(archive: &Path) -> Result<String> {
    for (path, _) in list_entries(archive)? {
        if let Some(std::path::Component::Normal(first)) = path.components().next() {
            return Ok(first.to_string_lossy().into_owned());
        }
    }
    Err(Error::invalid("archive", "no entries"))
}

/// Refuse absolute entries and parent traversal from untrusted tars
fn sanitize_entry(rel: &Path) -> Result<PathBuf> {
    use std::path::Component;
    let mut clean = PathBuf::new();
    for component in rel.components() {
        match component {
            Component::Normal(c) => clean.push(c),
            Component::CurDir => {}
            _ => {
                return Err(Error::invalid(
                    "archive",
                    format!("hostile entry path: {}", rel.display()),
                ))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(Error::invalid("archive", "empty entry path"));
    }
    Ok(clean)
}
