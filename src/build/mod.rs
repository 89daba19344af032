//! Build orchestration.
//!
//! - [`context`] - Process-wide settings (cache dir, timeouts, jobs)
//! - [`request`] - What to build
//! - [`fingerprint`] - Canonical manifest and its hash
//!
//! [`build_initramfs`] ties everything together:
//!
//! ```text
//! validate -> preflight -> inspect (parallel) -> sort by name -> resolve
//!          -> fingerprint -> cache hit? copy : serialize + compress + publish
//! ```

pub mod context;
pub mod fingerprint;
pub mod request;

pub use context::BuildSettings;
pub use fingerprint::FingerprintManifest;
pub use request::BuildRequest;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::artifact::initramfs::module_file_name;
use crate::artifact::{build_archive, ArchiveContents, ArchiveModule};
use crate::artifact_store::{short, write_output, CacheOutcome, CacheStore, NewArchive};
use crate::error::{BuildError, BuildResult};
use crate::hash::sha256_bytes;
use crate::module::{resolve_load_order, LoadOrder, ModuleInspector};
use crate::preflight::{check_required_tools, required_tools};
use crate::tool::ToolRunner;

/// How the output archive was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Copied from the cache without rebuilding.
    CacheHit,
    /// Built, published to the cache, then copied.
    Built,
    /// Built straight to the output; cache untouched.
    Uncached,
}

/// Summary of a successful build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub fingerprint: String,
    pub load_order: LoadOrder,
    pub outcome: BuildOutcome,
    pub output: PathBuf,
    pub size_bytes: u64,
}

/// Produce `request.output`, reusing a cached archive when the fingerprint
/// matches a previous build.
///
/// Fails without writing the output if any module cannot be inspected or
/// ordered.
pub fn build_initramfs(
    request: &BuildRequest,
    settings: &BuildSettings,
    runner: &dyn ToolRunner,
) -> BuildResult<BuildReport> {
    request.validate()?;
    check_required_tools(
        &required_tools(&request.modules, request.options.compression),
        runner,
    )?;

    info!("inspecting {} module(s)", request.modules.len());
    let mut descriptors =
        ModuleInspector::new(runner).inspect_all(&request.modules, settings.jobs)?;
    // Caller order must not change the fingerprint.
    descriptors.sort_by(|a, b| a.name.cmp(&b.name));

    let load_order = resolve_load_order(descriptors)?;
    for ext in &load_order.external {
        warn!(
            "{} depends on {}, which is not in the module set; assuming the kernel provides it",
            ext.module, ext.dependency
        );
    }
    if !load_order.is_empty() {
        info!("load order: {}", load_order.names().join(", "));
    }

    let init = read_input(&request.init)?;
    let mut extras = BTreeMap::new();
    for (name, path) in &request.extras {
        extras.insert(name.clone(), read_input(path)?);
    }
    let extra_hashes: BTreeMap<String, String> = extras
        .iter()
        .map(|(name, data)| (name.clone(), sha256_bytes(data)))
        .collect();

    let manifest = FingerprintManifest::new(
        &sha256_bytes(&init),
        &load_order,
        &extra_hashes,
        &request.options,
    );
    let fingerprint = manifest.fingerprint()?;
    info!("fingerprint {}", short(&fingerprint));

    let assemble = || -> BuildResult<Vec<u8>> {
        let module_bytes = read_modules(&load_order)?;
        let contents = ArchiveContents {
            init: &init,
            modules: load_order
                .modules
                .iter()
                .zip(&module_bytes)
                .enumerate()
                .map(|(i, (m, data))| ArchiveModule {
                    file_name: module_file_name(i, load_order.modules.len(), m, &request.options),
                    data,
                })
                .collect(),
            extras: extras.iter().map(|(k, v)| (k.clone(), v.as_slice())).collect(),
        };
        debug!("serializing archive for {}", short(&fingerprint));
        build_archive(&contents, &request.options, runner)
    };

    let (outcome, size_bytes) = if request.use_cache {
        let store =
            CacheStore::open(&settings.cache_dir)?.with_lock_timeout(settings.lock_timeout);
        let cached = store.get_or_build(&fingerprint, || {
            Ok(NewArchive {
                bytes: assemble()?,
                compression: request.options.compression,
                manifest: manifest.to_value()?,
            })
        })?;
        store.materialize_to(cached.archive(), &request.output)?;
        let outcome = match cached {
            CacheOutcome::Hit(_) => BuildOutcome::CacheHit,
            CacheOutcome::Built(_) => BuildOutcome::Built,
        };
        (outcome, cached.archive().entry.size_bytes)
    } else {
        let bytes = assemble()?;
        write_output(&request.output, &bytes)?;
        (BuildOutcome::Uncached, bytes.len() as u64)
    };

    info!(
        "wrote {} ({} bytes, {})",
        request.output.display(),
        size_bytes,
        match outcome {
            BuildOutcome::CacheHit => "cache hit",
            BuildOutcome::Built => "built",
            BuildOutcome::Uncached => "built, cache bypassed",
        }
    );

    Ok(BuildReport {
        fingerprint,
        load_order,
        outcome,
        output: request.output.clone(),
        size_bytes,
    })
}

fn read_input(path: &Path) -> BuildResult<Vec<u8>> {
    fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => BuildError::MissingInput(path.to_path_buf()),
        _ => BuildError::io(format!("reading {}", path.display()), e),
    })
}

/// Read module bytes for archiving, checking they still match inspection.
fn read_modules(load_order: &LoadOrder) -> BuildResult<Vec<Vec<u8>>> {
    load_order
        .modules
        .iter()
        .map(|m| {
            let data = fs::read(&m.source_path)
                .map_err(|e| BuildError::unreadable(&m.source_path, e.to_string()))?;
            if sha256_bytes(&data) != m.archive_hash {
                return Err(BuildError::unreadable(
                    &m.source_path,
                    "file changed between inspection and archiving",
                ));
            }
            Ok(data)
        })
        .collect()
}
