//! Build requests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::artifact::initramfs::is_safe_segment;
use crate::artifact::{ArchiveOptions, Compression};
use crate::error::{BuildError, BuildResult};

/// Default output file stem, relative to the working directory.
pub const DEFAULT_OUTPUT_STEM: &str = "initramfs";

/// `initramfs.cpio`, `initramfs.cpio.zst`, ...
pub fn default_output(compression: Compression) -> PathBuf {
    PathBuf::from(format!("{DEFAULT_OUTPUT_STEM}{}", compression.archive_suffix()))
}

/// Everything needed to produce one archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub init: PathBuf,
    /// Module paths in the order the caller gave them.
    pub modules: Vec<PathBuf>,
    /// Logical name (placed at `/bin/<name>`) -> source path.
    pub extras: BTreeMap<String, PathBuf>,
    pub output: PathBuf,
    pub options: ArchiveOptions,
    /// Consult and populate the cache. Off means build straight to `output`.
    pub use_cache: bool,
}

impl BuildRequest {
    pub fn new(init: impl Into<PathBuf>) -> Self {
        Self {
            init: init.into(),
            modules: Vec::new(),
            extras: BTreeMap::new(),
            output: default_output(Compression::None),
            options: ArchiveOptions::default(),
            use_cache: true,
        }
    }

    pub fn module(mut self, path: impl Into<PathBuf>) -> Self {
        self.modules.push(path.into());
        self
    }

    pub fn extra(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.extras.insert(name.into(), path.into());
        self
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = path.into();
        self
    }

    pub fn options(mut self, options: ArchiveOptions) -> Self {
        self.options = options;
        self
    }

    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// Reject requests that cannot succeed before doing any work.
    ///
    /// Module paths are checked by inspection, which reports them as
    /// unreadable modules rather than missing inputs.
    pub fn validate(&self) -> BuildResult<()> {
        require_file(&self.init)?;
        for (name, path) in &self.extras {
            if !is_safe_segment(name) {
                return Err(BuildError::InvalidRequest(format!(
                    "extra name '{name}' must be a plain file name"
                )));
            }
            require_file(path)?;
        }
        if self.output.as_os_str().is_empty() || self.output.is_dir() {
            return Err(BuildError::InvalidRequest(format!(
                "output '{}' must be a file path",
                self.output.display()
            )));
        }
        self.options.validate()
    }
}

fn require_file(path: &Path) -> BuildResult<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(BuildError::MissingInput(path.to_path_buf()))
    }
}

/// Parse `name=path` as given to `--extra`.
pub fn parse_extra(spec: &str) -> Result<(String, PathBuf), String> {
    let (name, path) = spec
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PATH, got '{spec}'"))?;
    if !is_safe_segment(name) {
        return Err(format!("'{name}' is not a valid file name"));
    }
    if path.is_empty() {
        return Err(format!("missing path for extra '{name}'"));
    }
    Ok((name.to_string(), PathBuf::from(path)))
}

/// Collect `--extra` pairs. A name given twice is rejected, not overwritten.
pub fn collect_extras(
    pairs: impl IntoIterator<Item = (String, PathBuf)>,
) -> BuildResult<BTreeMap<String, PathBuf>> {
    let mut extras: BTreeMap<String, PathBuf> = BTreeMap::new();
    for (name, path) in pairs {
        if let Some(first) = extras.get(&name) {
            return Err(BuildError::InvalidRequest(format!(
                "extra '{name}' given twice: {} and {}",
                first.display(),
                path.display()
            )));
        }
        extras.insert(name, path);
    }
    Ok(extras)
}
