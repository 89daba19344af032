//! Module inspection - hashing, decompression and metadata extraction.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::debug;

use super::modinfo::parse_modinfo;
use super::{name_from_path, ModuleCompression, ModuleDescriptor};
use crate::error::{BuildError, BuildResult};
use crate::hash::sha256_bytes;
use crate::tool::{ToolCommand, ToolRunner};

/// Inspects module files through an injectable [`ToolRunner`].
pub struct ModuleInspector<'a> {
    runner: &'a dyn ToolRunner,
}

impl<'a> ModuleInspector<'a> {
    pub fn new(runner: &'a dyn ToolRunner) -> Self {
        Self { runner }
    }

    /// Inspect one module. The file on disk is never modified.
    pub fn inspect(&self, path: &Path) -> BuildResult<ModuleDescriptor> {
        let raw = fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BuildError::unreadable(path, "file not found"),
            _ => BuildError::unreadable(path, e.to_string()),
        })?;
        if raw.is_empty() {
            return Err(BuildError::unreadable(path, "file is empty"));
        }

        let compression = ModuleCompression::detect(path);
        let plain = self.decompress(path, &raw, compression)?;
        if plain.is_empty() {
            return Err(BuildError::unreadable(path, "decompressed module is empty"));
        }

        let text = match compression {
            ModuleCompression::None => self.modinfo(path, path)?,
            _ => {
                // modinfo wants a path; hand it a private plain copy.
                let mut scratch = tempfile::Builder::new()
                    .prefix("module-inspect-")
                    .suffix(".ko")
                    .tempfile()
                    .map_err(|e| BuildError::io("creating inspection scratch file", e))?;
                scratch
                    .write_all(&plain)
                    .and_then(|_| scratch.flush())
                    .map_err(|e| BuildError::io("writing inspection scratch file", e))?;
                self.modinfo(path, scratch.path())?
            }
        };

        let meta = parse_modinfo(&text).map_err(|reason| BuildError::malformed(path, reason))?;
        let name = match meta.name {
            Some(name) => name,
            None => {
                let derived = name_from_path(path).ok_or_else(|| {
                    BuildError::malformed(path, "no name field and file name is not a module name")
                })?;
                debug!(
                    "{}: metadata has no name field, using '{}'",
                    path.display(),
                    derived
                );
                derived
            }
        };

        let descriptor = ModuleDescriptor {
            name,
            source_path: path.to_path_buf(),
            dependencies: meta.depends,
            content_hash: sha256_bytes(&plain),
            archive_hash: sha256_bytes(&raw),
            compression,
        };
        debug!(
            "inspected {} -> {} (depends: [{}])",
            path.display(),
            descriptor.name,
            descriptor.dependencies.join(", ")
        );
        Ok(descriptor)
    }

    /// Inspect every path on up to `jobs` worker threads.
    ///
    /// Results keep input order. If several modules fail, the error of the
    /// earliest one in input order is returned so failures are reproducible.
    pub fn inspect_all(&self, paths: &[PathBuf], jobs: usize) -> BuildResult<Vec<ModuleDescriptor>> {
        let workers = jobs.max(1).min(paths.len());
        if workers <= 1 {
            return paths.iter().map(|p| self.inspect(p)).collect();
        }

        let next = AtomicUsize::new(0);
        let slots: Mutex<Vec<Option<BuildResult<ModuleDescriptor>>>> =
            Mutex::new((0..paths.len()).map(|_| None).collect());

        std::thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| loop {
                    let idx = next.fetch_add(1, Ordering::SeqCst);
                    let Some(path) = paths.get(idx) else {
                        break;
                    };
                    let result = self.inspect(path);
                    if let Ok(mut slots) = slots.lock() {
                        slots[idx] = Some(result);
                    }
                });
            }
        });

        slots
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .into_iter()
            .zip(paths)
            .map(|(slot, path)| {
                slot.unwrap_or_else(|| Err(BuildError::unreadable(path, "inspection did not run")))
            })
            .collect()
    }

    fn decompress(
        &self,
        path: &Path,
        raw: &[u8],
        compression: ModuleCompression,
    ) -> BuildResult<Vec<u8>> {
        let result = match compression {
            ModuleCompression::None => return Ok(raw.to_vec()),
            ModuleCompression::Zstd => {
                return zstd::stream::decode_all(raw)
                    .map_err(|e| BuildError::unreadable(path, format!("corrupt zstd stream: {e}")));
            }
            ModuleCompression::Gzip => self
                .runner
                .run(&ToolCommand::new("gzip").args(["-d", "-c"]).stdin(raw)),
            ModuleCompression::Xz => self
                .runner
                .run(&ToolCommand::new("xz").args(["-d", "-c"]).stdin(raw)),
        };
        result.map_err(|e| match e {
            BuildError::ToolFailed { tool, stderr, .. } => {
                BuildError::unreadable(path, format!("{tool} could not decompress: {stderr}"))
            }
            other => other,
        })
    }

    fn modinfo(&self, module: &Path, target: &Path) -> BuildResult<String> {
        let out = self
            .runner
            .run(&ToolCommand::new("modinfo").arg_path(target))
            .map_err(|e| match e {
                BuildError::ToolFailed { stderr, .. } => {
                    BuildError::unreadable(module, format!("modinfo rejected module: {stderr}"))
                }
                other => other,
            })?;
        String::from_utf8(out)
            .map_err(|_| BuildError::malformed(module, "metadata is not valid UTF-8"))
    }
}
