// src/runner.rs

//! Runner registry: alternative Wine builds under `Runners/`
//!
//! A runner is any directory whose `bin/wine` answers `--version`
//! within a deadline. The registry enumerates and validates local
//! runners, keeps a time-limited cache of the downloadable-runner
//! list, and downloads/extracts new builds. Runner archives from the
//! download site come as `.tar.zst` or `.tar.xz`; runner backups made
//! here are always `.tar.zst`.

use crate::archive::{pack, PackSource};
use crate::error::{Error, Result};
use crate::exec;
use crate::notify::Notifier;
use crate::paths::DataRoot;
use crate::task::TaskControl;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Deadline for `wine --version` during validation
pub const VALIDATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Age after which the downloadable-runner list is re-fetched
const CACHE_TTL_SECS: i64 = 3600;

/// Source of the downloadable-runner list
const RELEASES_URL: &str = "https://api.github.com/repos/Kron4ek/Wine-Builds/releases";

/// A runner installed under `Runners/<name>/bin/wine`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRunner {
    pub name: String,
    pub wine: PathBuf,
}

/// A downloadable runner build
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteRunner {
    pub name: String,
    pub url: String,
}

/// On-disk cache of the remote list
#[derive(Debug, Serialize, Deserialize)]
struct RunnerCache {
    fetched_at: DateTime<Utc>,
    runners: Vec<RemoteRunner>,
}

/// Release metadata as served by the download site
#[derive(Debug, Deserialize)]
struct Release {
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

pub struct RunnerRegistry<'a> {
    root: &'a DataRoot,
}

impl<'a> RunnerRegistry<'a> {
    pub fn new(root: &'a DataRoot) -> Self {
        Self { root }
    }

    /// Runner directories that carry a `bin/wine`. No validation is
    /// run here; listing must stay cheap.
    pub fn list_local(&self) -> Result<Vec<LocalRunner>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(self.root.runners_dir())? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let wine = entry.path().join("bin").join("wine");
            if wine.is_file() {
                out.push(LocalRunner {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    wine,
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// A runner is valid when its binary answers `--version` in time.
    /// Any failure mode (missing, not executable, hang) is "invalid".
    pub fn validate(wine: &Path) -> bool {
        if !wine.is_file() {
            return false;
        }
        let mut cmd = Command::new(wine);
        cmd.arg("--version");
        exec::run_with_timeout(&mut cmd, VALIDATE_TIMEOUT)
    }

    /// Resolve the wine binary for a configured runner path, falling
    /// back to the system wine when none is configured.
    pub fn resolve(&self, configured: Option<&Path>) -> Result<PathBuf> {
        match configured {
            Some(wine) => {
                if Self::validate(wine) {
                    Ok(wine.to_path_buf())
                } else {
                    Err(Error::InvalidRunner(wine.to_path_buf()))
                }
            }
            None => which::which("wine").map_err(|_| Error::InvalidRunner("wine".into())),
        }
    }

    /// The downloadable-runner list, served from the cache while it is
    /// fresh. A failed fetch falls back to a stale cache when one
    /// exists.
    pub fn remote_runners(&self) -> Result<Vec<RemoteRunner>> {
        self.remote_runners_with(fetch_release_list)
    }

    fn remote_runners_with<F>(&self, fetch: F) -> Result<Vec<RemoteRunner>>
    where
        F: FnOnce() -> Result<Vec<RemoteRunner>>,
    {
        let cache = self.read_cache();
        if let Some(cache) = &cache {
            let age = Utc::now().signed_duration_since(cache.fetched_at);
            if age.num_seconds() < CACHE_TTL_SECS {
                debug!("runner list served from cache ({}s old)", age.num_seconds());
                return Ok(cache.runners.clone());
            }
        }
        match fetch() {
            Ok(runners) => {
                self.write_cache(&runners);
                Ok(runners)
            }
            Err(e) => match cache {
                Some(stale) => {
                    warn!("runner list fetch failed ({}), serving stale cache", e);
                    Ok(stale.runners)
                }
                None => Err(e),
            },
        }
    }

    fn read_cache(&self) -> Option<RunnerCache> {
        let text = fs::read_to_string(self.root.runner_cache_file()).ok()?;
        serde_yaml::from_str(&text).ok()
    }

    fn write_cache(&self, runners: &[RemoteRunner]) {
        let cache = RunnerCache {
            fetched_at: Utc::now(),
            runners: runners.to_vec(),
        };
        match serde_yaml::to_string(&cache) {
            Ok(text) => {
                if let Err(e) = fs::write(self.root.runner_cache_file(), text) {
                    warn!("cannot write runner cache: {}", e);
                }
            }
            Err(e) => warn!("cannot serialize runner cache: {}", e),
        }
    }

    /// Download a runner build and extract it under `Runners/`.
    /// Returns the new runner directory.
    pub fn download(
        &self,
        remote: &RemoteRunner,
        ctl: &TaskControl,
        notifier: &dyn Notifier,
    ) -> Result<PathBuf> {
        notifier.status(&format!("Downloading {}...", remote.name));
        let staged = self
            .root
            .tmp_dir()
            .join(format!("runner-download-{}", std::process::id()));
        let result = (|| -> Result<PathBuf> {
            download_to(&remote.url, &staged, ctl)?;
            ctl.check()?;
            notifier.status(&format!("Extracting {}...", remote.name));
            let dir = extract_runner_archive(&staged, &remote.url, &self.root.runners_dir(), ctl)?;
            Ok(dir)
        })();
        let _ = fs::remove_file(&staged);
        let dir = result?;

        let wine = dir.join("bin").join("wine");
        if !Self::validate(&wine) {
            let _ = fs::remove_dir_all(&dir);
            return Err(Error::InvalidRunner(wine));
        }
        info!("installed runner {} at {}", remote.name, dir.display());
        notifier.status(&format!("Runner {} ready", remote.name));
        Ok(dir)
    }

    /// Archive a local runner as `.tar.zst` at `dest`.
    pub fn backup(&self, name: &str, dest: &Path, ctl: &TaskControl) -> Result<()> {
        let dir = self.root.runners_dir().join(name);
        if !dir.join("bin").join("wine").is_file() {
            return Err(Error::InvalidRunner(dir));
        }
        pack(
            dest,
            &[PackSource {
                dir,
                rel: PathBuf::from(name),
            }],
            &|_| None,
            &ctl.stop_flag(),
        )
    }

    /// Bring a runner backup (or any runner tarball on disk) back
    /// under `Runners/`.
    pub fn restore_backup(&self, archive: &Path, ctl: &TaskControl) -> Result<PathBuf> {
        let name = archive
            .to_string_lossy()
            .into_owned();
        extract_runner_archive(archive, &name, &self.root.runners_dir(), ctl)
    }
}

/// Stream a URL to a staging file, polling the stop flag per chunk
fn download_to(url: &str, staged: &Path, ctl: &TaskControl) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("winecharm/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Fatal(format!("cannot build http client: {e}")))?;
    let response = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| Error::External {
            step: "download",
            status: "failed".into(),
            stderr: e.to_string(),
        })?;

    let mut reader = response;
    let mut out = File::create(staged)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        ctl.check()?;
        let n = reader
            .read(&mut buf)
            .map_err(|e| Error::External {
                step: "download",
                status: "failed".into(),
                stderr: e.to_string(),
            })?;
        if n == 0 {
            break;
        }
        std::io::Write::write_all(&mut out, &buf[..n])?;
    }
    Ok(())
}

/// Extract a `.tar.zst` or `.tar.xz` runner archive into `dest_root`.
/// Returns the top-level directory it unpacked to.
fn extract_runner_archive(
    archive: &Path,
    url_or_name: &str,
    dest_root: &Path,
    ctl: &TaskControl,
) -> Result<PathBuf> {
    let file = File::open(archive).map_err(|_| Error::not_found(archive))?;
    let reader = BufReader::new(file);
    let decoder: Box<dyn Read> = if url_or_name.ends_with(".tar.xz") {
        Box::new(xz2::read::XzDecoder::new(reader))
    } else {
        Box::new(zstd::Decoder::new(reader)?)
    };

    let mut tar = tar::Archive::new(decoder);
    tar.set_preserve_permissions(true);
    let mut top: Option<PathBuf> = None;
    for entry in tar.entries()? {
        ctl.check()?;
        let mut entry = entry?;
        let rel = entry.path()?.into_owned();
        if let Some(std::path::Component::Normal(first)) = rel.components().next() {
            top.get_or_insert_with(|| dest_root.join(first));
        }
        entry.unpack(dest_root.join(rel))?;
    }
    top.ok_or_else(|| Error::invalid("runner archive", "no entries"))
}

/// Fetch and flatten the release list into runner entries
fn fetch_release_list() -> Result<Vec<RemoteRunner>> {
    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("winecharm/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Fatal(format!("cannot build http client: {e}")))?;
    let releases: Vec<Release> = client
        .get(RELEASES_URL)
        .send()
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.json())
        .map_err(|e| Error::External {
            step: "runner list",
            status: "failed".into(),
            stderr: e.to_string(),
        })?;

    let mut out = Vec::new();
    for release in releases {
        for asset in release.assets {
            if !(asset.name.ends_with(".tar.xz") || asset.name.ends_with(".tar.zst")) {
                continue;
            }
            let name = asset
                .name
                .trim_end_matches(".tar.xz")
                .trim_end_matches(".tar.zst")
                .to_string();
            out.push(RemoteRunner {
                name,
                url: asset.browser_download_url,
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn root(tmp: &TempDir) -> DataRoot {
        DataRoot::at(tmp.path().join("wc")).unwrap()
    }

    fn install_fake_runner(root: &DataRoot, name: &str, body: &str) -> PathBuf {
        let bin = root.runners_dir().join(name).join("bin");
        fs::create_dir_all(&bin).unwrap();
        let wine = bin.join("wine");
        fs::write(&wine, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&wine, fs::Permissions::from_mode(0o755)).unwrap();
        wine
    }

    #[test]
    fn list_local_finds_complete_runners_only() {
        let tmp = TempDir::new().unwrap();
        let root = root(&tmp);
        install_fake_runner(&root, "wine-9.0", "true");
        // An incomplete runner directory is not listed
        fs::create_dir_all(root.runners_dir().join("broken/share")).unwrap();

        let registry = RunnerRegistry::new(&root);
        let local = registry.list_local().unwrap();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].name, "wine-9.0");
        assert!(local[0].wine.ends_with("wine-9.0/bin/wine"));
    }

    #[test]
    fn validation_accepts_answering_binary() {
        let tmp = TempDir::new().unwrap();
        let root = root(&tmp);
        let good = install_fake_runner(&root, "good", "echo wine-9.0");
        let bad = install_fake_runner(&root, "bad", "exit 1");
        assert!(RunnerRegistry::validate(&good));
        assert!(!RunnerRegistry::validate(&bad));
        assert!(!RunnerRegistry::validate(Path::new("/no/such/wine")));
    }

    #[test]
    fn resolve_collapses_failures_to_invalid_runner() {
        let tmp = TempDir::new().unwrap();
        let root = root(&tmp);
        let registry = RunnerRegistry::new(&root);
        let missing = PathBuf::from("/no/such/wine");
        assert!(matches!(
            registry.resolve(Some(&missing)),
            Err(Error::InvalidRunner(p)) if p == missing
        ));
    }

    #[test]
    fn fresh_cache_short_circuits_fetch() {
        let tmp = TempDir::new().unwrap();
        let root = root(&tmp);
        let registry = RunnerRegistry::new(&root);
        let runners = vec![RemoteRunner {
            name: "wine-9.0-amd64".into(),
            url: "https://example.invalid/wine-9.0-amd64.tar.xz".into(),
        }];
        registry.write_cache(&runners);

        let got = registry
            .remote_runners_with(|| panic!("fetch must not run with a fresh cache"))
            .unwrap();
        assert_eq!(got, runners);
    }

    #[test]
    fn stale_cache_survives_failed_fetch() {
        let tmp = TempDir::new().unwrap();
        let root = root(&tmp);
        let registry = RunnerRegistry::new(&root);
        let runners = vec![RemoteRunner {
            name: "old".into(),
            url: "https://example.invalid/old.tar.zst".into(),
        }];
        let stale = RunnerCache {
            fetched_at: Utc::now() - chrono::Duration::seconds(CACHE_TTL_SECS + 60),
            runners: runners.clone(),
        };
        fs::write(
            root.runner_cache_file(),
            serde_yaml::to_string(&stale).unwrap(),
        )
        .unwrap();

        let got = registry
            .remote_runners_with(|| Err(Error::Fatal("offline".into())))
            .unwrap();
        assert_eq!(got, runners);

        // With no cache at all, the fetch error surfaces
        fs::remove_file(root.runner_cache_file()).unwrap();
        assert!(registry
            .remote_runners_with(|| Err(Error::Fatal("offline".into())))
            .is_err());
    }

    #[test]
    fn successful_fetch_refreshes_cache() {
        let tmp = TempDir::new().unwrap();
        let root = root(&tmp);
        let registry = RunnerRegistry::new(&root);
        let fresh = vec![RemoteRunner {
            name: "new".into(),
            url: "https://example.invalid/new.tar.xz".into(),
        }];
        let want = fresh.clone();
        let got = registry.remote_runners_with(|| Ok(fresh)).unwrap();
        assert_eq!(got, want);
        let cached = registry.read_cache().unwrap();
        assert_eq!(cached.runners, want);
    }

    #[test]
    fn backup_and_restore_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let root = root(&tmp);
        install_fake_runner(&root, "wine-9.0", "echo wine-9.0");
        let registry = RunnerRegistry::new(&root);

        let dest = tmp.path().join("wine-9.0.tar.zst");
        registry
            .backup("wine-9.0", &dest, &TaskControl::new())
            .unwrap();
        assert!(dest.is_file());

        fs::remove_dir_all(root.runners_dir().join("wine-9.0")).unwrap();
        let restored = registry
            .restore_backup(&dest, &TaskControl::new())
            .unwrap();
        assert_eq!(restored, root.runners_dir().join("wine-9.0"));
        assert!(restored.join("bin/wine").is_file());
    }

    #[test]
    fn backup_refuses_incomplete_runner() {
        let tmp = TempDir::new().unwrap();
        let root = root(&tmp);
        let registry = RunnerRegistry::new(&root);
        assert!(matches!(
            registry.backup("nope", &tmp.path().join("x.tar.zst"), &TaskControl::new()),
            Err(Error::InvalidRunner(_))
        ));
    }

    #[test]
    fn xz_runner_archive_extracts() {
        let tmp = TempDir::new().unwrap();
        let root = root(&tmp);

        // Build a small .tar.xz by hand
        let stage = tmp.path().join("wine-8.0/bin");
        fs::create_dir_all(&stage).unwrap();
        fs::write(stage.join("wine"), "#!/bin/sh\ntrue\n").unwrap();
        let archive = tmp.path().join("wine-8.0.tar.xz");
        let xz = xz2::write::XzEncoder::new(File::create(&archive).unwrap(), 1);
        let mut builder = tar::Builder::new(xz);
        builder
            .append_dir_all("wine-8.0", tmp.path().join("wine-8.0"))
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let dir = extract_runner_archive(
            &archive,
            "wine-8.0.tar.xz",
            &root.runners_dir(),
            &TaskControl::new(),
        )
        .unwrap();
        assert_eq!(dir, root.runners_dir().join("wine-8.0"));
        assert!(dir.join("bin/wine").is_file());
    }
}
