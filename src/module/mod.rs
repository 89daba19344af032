//! Kernel module inputs.
//!
//! - [`inspect`] - Turn a module path into a [`ModuleDescriptor`]
//! - [`modinfo`] - Parse `modinfo` key/value output
//! - [`resolve`] - Order descriptors by their declared dependencies

pub mod inspect;
pub mod modinfo;
pub mod resolve;

pub use inspect::ModuleInspector;
pub use resolve::{resolve_load_order, LoadOrder};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Single-file compression a module may ship with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleCompression {
    None,
    Gzip,
    Xz,
    Zstd,
}

impl ModuleCompression {
    /// Detect compression from the file name.
    pub fn detect(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if name.ends_with(".gz") {
            Self::Gzip
        } else if name.ends_with(".xz") {
            Self::Xz
        } else if name.ends_with(".zst") {
            Self::Zstd
        } else {
            Self::None
        }
    }

    /// Extension the module keeps inside the archive.
    pub fn module_extension(self) -> &'static str {
        match self {
            Self::None => ".ko",
            Self::Gzip => ".ko.gz",
            Self::Xz => ".ko.xz",
            Self::Zstd => ".ko.zst",
        }
    }
}

/// Identity and metadata for one kernel module input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    /// Canonical name from the module's own metadata.
    pub name: String,
    pub source_path: PathBuf,
    /// Declared dependencies, first occurrence order, no duplicates.
    pub dependencies: Vec<String>,
    /// sha256 of the decompressed module.
    pub content_hash: String,
    /// sha256 of the bytes on disk; these are what get archived.
    pub archive_hash: String,
    pub compression: ModuleCompression,
}

impl ModuleDescriptor {
    /// File name inside the module directory, without load-order prefix.
    pub fn archive_file_name(&self) -> String {
        format!("{}{}", self.name, self.compression.module_extension())
    }
}

/// Valid kernel module identifier: `[A-Za-z0-9_-]+`.
pub fn is_module_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Module name derived from a file name, as the kernel would see it.
///
/// `virtio-pci.ko.xz` -> `virtio_pci`
pub fn name_from_path(path: &Path) -> Option<String> {
    let mut name = path.file_name()?.to_string_lossy().to_string();
    for ext in [".gz", ".xz", ".zst"] {
        if let Some(stripped) = name.strip_suffix(ext) {
            name = stripped.to_string();
            break;
        }
    }
    let name = name.strip_suffix(".ko").unwrap_or(&name).replace('-', "_");
    if is_module_identifier(&name) {
        Some(name)
    } else {
        None
    }
}

#[cfg(test)]
pub(crate) fn descriptor(name: &str, deps: &[&str]) -> ModuleDescriptor {
    ModuleDescriptor {
        name: name.to_string(),
        source_path: PathBuf::from(format!("/mods/{name}.ko")),
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        content_hash: crate::hash::sha256_bytes(name.as_bytes()),
        archive_hash: crate::hash::sha256_bytes(name.as_bytes()),
        compression: ModuleCompression::None,
    }
}
