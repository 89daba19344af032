//! Content-addressed archive cache.
//!
//! Archives are keyed by their build fingerprint. Layout under the cache
//! root:
//!
//! ```text
//! archives/<fp[0..2]>/<fp>.cpio   finished (possibly compressed) archive
//! entries/<fp>.json               CacheEntry describing the archive
//! locks/<fp>.lock                 advisory lock, held while building
//! tmp/                            staging area, renamed into place
//! ```
//!
//! Readers never lock: every file is written under `tmp/` and renamed, so a
//! reader sees either the old state or the new one. Writers for one
//! fingerprint serialize on its lock file, and re-check the cache after
//! acquiring it so concurrent requests for the same fingerprint build once.
//!
//! A damaged entry (missing archive, wrong size, wrong hash, unparseable
//! JSON) is a miss, never an error. The next build replaces it.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::artifact::Compression;
use crate::error::{BuildError, BuildResult};
use crate::hash::{is_sha256_hex, sha256_bytes, sha256_file};

/// Default wait for another process's build of the same fingerprint.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(600);

/// Temp files older than this are considered abandoned by `gc`.
pub const STALE_TMP_AGE: Duration = Duration::from_secs(60 * 60);

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Persistent record for one cached archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub archive_sha256: String,
    pub size_bytes: u64,
    pub compression: Compression,
    pub stored_at_unix: u64,
    /// The canonical inputs the fingerprint was computed from.
    #[serde(default)]
    pub manifest: serde_json::Value,
}

/// A verified archive in the cache.
#[derive(Debug, Clone)]
pub struct CachedArchive {
    pub entry: CacheEntry,
    pub path: PathBuf,
}

/// Freshly built archive waiting to be published.
#[derive(Debug, Clone)]
pub struct NewArchive {
    pub bytes: Vec<u8>,
    pub compression: Compression,
    pub manifest: serde_json::Value,
}

/// Result of [`CacheStore::get_or_build`].
#[derive(Debug, Clone)]
pub enum CacheOutcome {
    /// Served from the cache, no build work done.
    Hit(CachedArchive),
    /// Built by this call and published.
    Built(CachedArchive),
}

impl CacheOutcome {
    pub fn archive(&self) -> &CachedArchive {
        match self {
            Self::Hit(a) | Self::Built(a) => a,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }
}

/// Counts returned by [`CacheStore::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStatus {
    pub root: PathBuf,
    pub entries: u64,
    pub archives: u64,
    pub archive_bytes: u64,
}

/// What [`CacheStore::gc`] removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub orphan_archives: usize,
    pub stale_tmp_files: usize,
}

/// Cache rooted at a directory shared by all fingerprints.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    lock_timeout: Duration,
}

impl CacheStore {
    /// Open (and create if needed) the cache at `root`.
    pub fn open(root: &Path) -> BuildResult<Self> {
        let store = Self {
            root: root.to_path_buf(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        };
        store.ensure_layout()?;
        Ok(store)
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_layout(&self) -> BuildResult<()> {
        for dir in [
            self.archives_dir(),
            self.entries_dir(),
            self.locks_dir(),
            self.tmp_dir(),
        ] {
            fs::create_dir_all(&dir)
                .map_err(|e| BuildError::io(format!("creating {}", dir.display()), e))?;
        }
        Ok(())
    }

    fn archives_dir(&self) -> PathBuf {
        self.root.join("archives")
    }

    fn entries_dir(&self) -> PathBuf {
        self.root.join("entries")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn entry_path(&self, fp: &str) -> PathBuf {
        self.entries_dir().join(format!("{fp}.json"))
    }

    fn lock_path(&self, fp: &str) -> PathBuf {
        self.locks_dir().join(format!("{fp}.lock"))
    }

    /// Where the archive for `fp` lives (whether or not it exists).
    pub fn archive_path(&self, fp: &str) -> PathBuf {
        self.archives_dir()
            .join(&fp[..2.min(fp.len())])
            .join(format!("{fp}.cpio"))
    }

    /// Look up a verified archive.
    ///
    /// Verification re-hashes the archive, so a hit always means the bytes
    /// on disk are the ones that were published.
    pub fn lookup(&self, fp: &str) -> BuildResult<Option<CachedArchive>> {
        validate_fingerprint(fp)?;
        let entry_path = self.entry_path(fp);
        let bytes = match fs::read(&entry_path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!("cache entry {} unreadable ({}), ignoring", entry_path.display(), e);
                return Ok(None);
            }
        };
        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("cache entry {} is corrupt ({}), ignoring", entry_path.display(), e);
                return Ok(None);
            }
        };
        if entry.fingerprint != fp {
            warn!(
                "cache entry {} records fingerprint {}, ignoring",
                entry_path.display(),
                entry.fingerprint
            );
            return Ok(None);
        }

        let path = self.archive_path(fp);
        match verify_archive(&path, &entry) {
            Ok(()) => Ok(Some(CachedArchive { entry, path })),
            Err(reason) => {
                warn!("cached archive for {} is damaged ({}), rebuilding", short(fp), reason);
                Ok(None)
            }
        }
    }

    /// Publish `archive` under `fp`.
    ///
    /// A valid existing entry wins and is returned unchanged.
    pub fn publish(&self, fp: &str, archive: NewArchive) -> BuildResult<CachedArchive> {
        validate_fingerprint(fp)?;
        let _lock = self.acquire_lock(fp)?;
        if let Some(existing) = self.lookup(fp)? {
            return Ok(existing);
        }
        self.publish_locked(fp, archive)
    }

    /// Serve `fp` from the cache, or run `build` and publish its result.
    ///
    /// At most one caller per fingerprint runs `build` at a time; callers
    /// that waited on the lock pick up the published archive.
    pub fn get_or_build<F>(&self, fp: &str, build: F) -> BuildResult<CacheOutcome>
    where
        F: FnOnce() -> BuildResult<NewArchive>,
    {
        if let Some(hit) = self.lookup(fp)? {
            debug!("cache hit for {}", short(fp));
            return Ok(CacheOutcome::Hit(hit));
        }

        let _lock = self.acquire_lock(fp)?;
        if let Some(hit) = self.lookup(fp)? {
            debug!("cache hit for {} after waiting on lock", short(fp));
            return Ok(CacheOutcome::Hit(hit));
        }

        let archive = build()?;
        let published = self.publish_locked(fp, archive)?;
        Ok(CacheOutcome::Built(published))
    }

    fn publish_locked(&self, fp: &str, archive: NewArchive) -> BuildResult<CachedArchive> {
        let entry = CacheEntry {
            fingerprint: fp.to_string(),
            archive_sha256: sha256_bytes(&archive.bytes),
            size_bytes: archive.bytes.len() as u64,
            compression: archive.compression,
            stored_at_unix: now_unix(),
            manifest: archive.manifest,
        };

        // Archive first: an entry must never point at a missing archive.
        let path = self.archive_path(fp);
        let tmp = self.tmp_dir().join(tmp_name(&format!("archive-{}", short(fp))));
        write_file(&tmp, &archive.bytes)?;
        atomic_rename(&tmp, &path)?;

        let json = serde_json::to_vec_pretty(&entry)?;
        let tmp = self.tmp_dir().join(tmp_name(&format!("entry-{}", short(fp))));
        write_file(&tmp, &json)?;
        atomic_rename(&tmp, &self.entry_path(fp))?;

        info!(
            "cached {} ({} bytes, {})",
            short(fp),
            entry.size_bytes,
            entry.compression
        );
        Ok(CachedArchive { entry, path })
    }

    /// Copy a cached archive to `dest` atomically and check the copy.
    pub fn materialize_to(&self, archive: &CachedArchive, dest: &Path) -> BuildResult<()> {
        let parent = output_parent(dest);
        let mut tmp = tempfile::Builder::new()
            .prefix(".initramfs-")
            .tempfile_in(parent)
            .map_err(|e| BuildError::archive_write(dest, e))?;
        let mut src = File::open(&archive.path)
            .map_err(|e| BuildError::io(format!("opening {}", archive.path.display()), e))?;
        std::io::copy(&mut src, tmp.as_file_mut()).map_err(|e| BuildError::archive_write(dest, e))?;
        tmp.as_file_mut()
            .flush()
            .map_err(|e| BuildError::archive_write(dest, e))?;

        let (sha, size) = sha256_file(tmp.path())?;
        if sha != archive.entry.archive_sha256 || size != archive.entry.size_bytes {
            return Err(BuildError::CacheInconsistent {
                fingerprint: archive.entry.fingerprint.clone(),
                reason: format!("archive changed while copying to {}", dest.display()),
            });
        }
        persist_output(tmp, dest)
    }

    /// Entries, newest first. Unparseable entries are skipped.
    pub fn list(&self) -> BuildResult<Vec<CacheEntry>> {
        let dir = self.entries_dir();
        let mut out = Vec::new();
        for ent in fs::read_dir(&dir)
            .map_err(|e| BuildError::io(format!("reading {}", dir.display()), e))?
        {
            let ent = ent.map_err(|e| BuildError::io(format!("reading {}", dir.display()), e))?;
            let path = ent.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path)
                .ok()
                .and_then(|b| serde_json::from_slice::<CacheEntry>(&b).ok())
            {
                Some(entry) => out.push(entry),
                None => warn!("skipping unreadable cache entry {}", path.display()),
            }
        }
        out.sort_by(|a, b| {
            b.stored_at_unix
                .cmp(&a.stored_at_unix)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        Ok(out)
    }

    /// Find the entry whose fingerprint is `prefix` or starts with it.
    pub fn find(&self, prefix: &str) -> BuildResult<Option<CacheEntry>> {
        if prefix.len() < 4 || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BuildError::InvalidRequest(format!(
                "'{prefix}' is not a fingerprint (need at least 4 hex digits)"
            )));
        }
        let prefix = prefix.to_ascii_lowercase();
        let mut matches: Vec<CacheEntry> = self
            .list()?
            .into_iter()
            .filter(|e| e.fingerprint.starts_with(&prefix))
            .collect();
        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            n => Err(BuildError::InvalidRequest(format!(
                "fingerprint prefix '{prefix}' is ambiguous ({n} entries)"
            ))),
        }
    }

    /// Entry and archive totals.
    pub fn status(&self) -> BuildResult<StoreStatus> {
        let entries = self.list()?.len() as u64;
        let mut archives = 0u64;
        let mut archive_bytes = 0u64;
        for ent in WalkDir::new(self.archives_dir())
            .into_iter()
            .filter_map(Result::ok)
        {
            if !ent.file_type().is_file() {
                continue;
            }
            if let Ok(md) = ent.metadata() {
                archives += 1;
                archive_bytes += md.len();
            }
        }
        Ok(StoreStatus {
            root: self.root.clone(),
            entries,
            archives,
            archive_bytes,
        })
    }

    /// Keep the newest `keep_last` entries and drop the rest with their
    /// archives. Fingerprints that are currently locked are left alone.
    /// Returns the number of entries removed.
    pub fn prune_keep_last(&self, keep_last: usize) -> BuildResult<usize> {
        if keep_last == 0 {
            return Err(BuildError::InvalidRequest("keep_last must be >= 1".into()));
        }
        let mut removed = 0usize;
        for entry in self.list()?.into_iter().skip(keep_last) {
            let fp = entry.fingerprint;
            if validate_fingerprint(&fp).is_err() {
                continue;
            }
            let Some(_lock) = self.try_lock(&fp)? else {
                debug!("prune: {} is locked, skipping", short(&fp));
                continue;
            };
            remove_if_present(&self.entry_path(&fp))?;
            remove_if_present(&self.archive_path(&fp))?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Remove archives without an entry and abandoned temp files.
    pub fn gc(&self) -> BuildResult<GcReport> {
        let mut report = GcReport::default();

        for ent in WalkDir::new(self.archives_dir())
            .into_iter()
            .filter_map(Result::ok)
        {
            if !ent.file_type().is_file() {
                continue;
            }
            let name = ent.file_name().to_string_lossy().to_string();
            let Some(fp) = name.strip_suffix(".cpio") else {
                continue;
            };
            if !is_sha256_hex(fp) || self.entry_path(fp).exists() {
                continue;
            }
            // A locked fingerprint may be between archive and entry rename.
            let Some(_lock) = self.try_lock(fp)? else {
                continue;
            };
            if self.entry_path(fp).exists() {
                continue;
            }
            remove_if_present(ent.path())?;
            report.orphan_archives += 1;
        }

        let now = SystemTime::now();
        let tmp = self.tmp_dir();
        for ent in fs::read_dir(&tmp)
            .map_err(|e| BuildError::io(format!("reading {}", tmp.display()), e))?
            .filter_map(Result::ok)
        {
            let stale = ent
                .metadata()
                .and_then(|md| md.modified())
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .is_some_and(|age| age >= STALE_TMP_AGE);
            if stale && ent.path().is_file() {
                remove_if_present(&ent.path())?;
                report.stale_tmp_files += 1;
            }
        }

        Ok(report)
    }

    /// Block until the lock for `fp` is ours or the lock timeout elapses.
    fn acquire_lock(&self, fp: &str) -> BuildResult<CacheLock> {
        let start = Instant::now();
        let mut announced = false;
        loop {
            if let Some(lock) = self.try_lock(fp)? {
                return Ok(lock);
            }
            let waited = start.elapsed();
            if waited >= self.lock_timeout {
                return Err(BuildError::LockTimeout {
                    fingerprint: fp.to_string(),
                    waited,
                });
            }
            if !announced {
                info!("waiting for another build of {}", short(fp));
                announced = true;
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    fn try_lock(&self, fp: &str) -> BuildResult<Option<CacheLock>> {
        let lock_path = self.lock_path(fp);

        // Lock files are never unlinked. Removing a held lock file would let a
        // second process lock a fresh inode at the same path.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| BuildError::io(format!("opening lock {}", lock_path.display()), e))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(CacheLock { _file: file })),
            Err(e) if is_lock_contention(&e) => Ok(None),
            Err(e) => Err(BuildError::io(format!("locking {}", lock_path.display()), e)),
        }
    }
}

/// Only contention is worth waiting on. ENOLCK and friends never clear.
fn is_lock_contention(err: &std::io::Error) -> bool {
    err.raw_os_error().is_some()
        && err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Held while building or publishing one fingerprint; released on drop.
struct CacheLock {
    _file: File,
}

/// Default cache root: `$XDG_CACHE_HOME/initramfs-builder` on Linux.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("initramfs-builder")
}

/// Write `bytes` to `dest` through a temp file in the same directory.
pub fn write_output(dest: &Path, bytes: &[u8]) -> BuildResult<()> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".initramfs-")
        .tempfile_in(output_parent(dest))
        .map_err(|e| BuildError::archive_write(dest, e))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.flush())
        .map_err(|e| BuildError::archive_write(dest, e))?;
    persist_output(tmp, dest)
}

fn output_parent(dest: &Path) -> &Path {
    match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn persist_output(tmp: tempfile::NamedTempFile, dest: &Path) -> BuildResult<()> {
    use std::os::unix::fs::PermissionsExt;

    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(0o644))
        .map_err(|e| BuildError::archive_write(dest, e))?;
    tmp.persist(dest)
        .map_err(|e| BuildError::archive_write(dest, e.error))?;
    Ok(())
}

fn verify_archive(path: &Path, entry: &CacheEntry) -> Result<(), String> {
    let md = fs::metadata(path).map_err(|e| format!("{}: {e}", path.display()))?;
    if md.len() != entry.size_bytes {
        return Err(format!(
            "size {} does not match recorded {}",
            md.len(),
            entry.size_bytes
        ));
    }
    let (sha, _) = sha256_file(path).map_err(|e| e.to_string())?;
    if sha != entry.archive_sha256 {
        return Err(format!("sha256 {} does not match recorded", short(&sha)));
    }
    Ok(())
}

fn validate_fingerprint(fp: &str) -> BuildResult<()> {
    if is_sha256_hex(fp) && !fp.chars().any(|c| c.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(BuildError::InvalidRequest(format!(
            "invalid fingerprint '{fp}'"
        )))
    }
}

/// First 12 hex digits, for log lines.
pub fn short(fp: &str) -> &str {
    &fp[..12.min(fp.len())]
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn tmp_name(prefix: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{n}-{seq}", std::process::id())
}

fn write_file(path: &Path, bytes: &[u8]) -> BuildResult<()> {
    fs::write(path, bytes).map_err(|e| BuildError::io(format!("writing {}", path.display()), e))
}

fn atomic_rename(src: &Path, dst: &Path) -> BuildResult<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| BuildError::io(format!("creating {}", parent.display()), e))?;
    }
    // tmp/ and the destination share the cache root, so this is a rename.
    fs::rename(src, dst).map_err(|e| {
        let _ = fs::remove_file(src);
        BuildError::io(
            format!("renaming {} to {}", src.display(), dst.display()),
            e,
        )
    })
}

fn remove_if_present(path: &Path) -> BuildResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BuildError::io(format!("removing {}", path.display()), e)),
    }
}
