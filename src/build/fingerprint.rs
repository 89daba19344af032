//! Build fingerprints.
//!
//! A fingerprint is the sha256 of a canonical JSON manifest of everything
//! that ends up in the archive. Struct fields serialize in declaration order
//! and maps are `BTreeMap`s, so the JSON is canonical without any extra
//! normalization step.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::artifact::initramfs::module_file_name;
use crate::artifact::ArchiveOptions;
use crate::error::BuildResult;
use crate::hash::sha256_bytes;
use crate::module::LoadOrder;

/// Bumped whenever archive layout changes for identical inputs.
pub const FORMAT_VERSION: u32 = 1;

/// One module as it will appear in the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestModule {
    pub name: String,
    pub file_name: String,
    /// sha256 of the archived (on-disk) bytes.
    pub archive_hash: String,
}

/// Canonical description of one archive's inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintManifest {
    pub format_version: u32,
    pub init: String,
    /// In load order.
    pub modules: Vec<ManifestModule>,
    pub extras: BTreeMap<String, String>,
    pub options: ArchiveOptions,
}

impl FingerprintManifest {
    pub fn new(
        init_hash: &str,
        load_order: &LoadOrder,
        extra_hashes: &BTreeMap<String, String>,
        options: &ArchiveOptions,
    ) -> Self {
        let count = load_order.modules.len();
        let modules = load_order
            .modules
            .iter()
            .enumerate()
            .map(|(i, m)| ManifestModule {
                name: m.name.clone(),
                file_name: module_file_name(i, count, m, options),
                archive_hash: m.archive_hash.clone(),
            })
            .collect();
        Self {
            format_version: FORMAT_VERSION,
            init: init_hash.to_string(),
            modules,
            extras: extra_hashes.clone(),
            options: options.clone(),
        }
    }

    pub fn fingerprint(&self) -> BuildResult<String> {
        Ok(sha256_bytes(&serde_json::to_vec(self)?))
    }

    pub fn to_value(&self) -> BuildResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Compression;
    use crate::module::{descriptor, resolve_load_order};

    fn order(names: &[(&str, &[&str])]) -> LoadOrder {
        resolve_load_order(names.iter().map(|(n, d)| descriptor(n, d)).collect()).unwrap()
    }

    #[test]
    fn same_inputs_same_fingerprint() {
        let lo = order(&[("a", &[]), ("b", &["a"])]);
        let extras = BTreeMap::from([("sh".to_string(), "11".repeat(32))]);
        let options = ArchiveOptions::default();
        let a = FingerprintManifest::new("aa", &lo, &extras, &options);
        let b = FingerprintManifest::new("aa", &lo, &extras, &options);
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        assert_eq!(a.fingerprint().unwrap().len(), 64);
    }

    #[test]
    fn every_input_is_covered() {
        let lo = order(&[("a", &[]), ("b", &["a"])]);
        let extras = BTreeMap::new();
        let options = ArchiveOptions::default();
        let base = FingerprintManifest::new("aa", &lo, &extras, &options)
            .fingerprint()
            .unwrap();

        let other_init = FingerprintManifest::new("ab", &lo, &extras, &options);
        assert_ne!(other_init.fingerprint().unwrap(), base);

        let fewer = FingerprintManifest::new("aa", &order(&[("a", &[])]), &extras, &options);
        assert_ne!(fewer.fingerprint().unwrap(), base);

        let with_extra = FingerprintManifest::new(
            "aa",
            &lo,
            &BTreeMap::from([("sh".to_string(), "00".repeat(32))]),
            &options,
        );
        assert_ne!(with_extra.fingerprint().unwrap(), base);

        for changed in [
            ArchiveOptions {
                compression: Compression::Zstd,
                ..Default::default()
            },
            ArchiveOptions {
                module_dir: "/lib/modules".into(),
                ..Default::default()
            },
            ArchiveOptions {
                order_prefix: false,
                ..Default::default()
            },
        ] {
            let m = FingerprintManifest::new("aa", &lo, &extras, &changed);
            assert_ne!(m.fingerprint().unwrap(), base);
        }
    }

    #[test]
    fn manifest_records_archive_names() {
        let lo = order(&[("b", &["a"]), ("a", &[])]);
        let m = FingerprintManifest::new("aa", &lo, &BTreeMap::new(), &ArchiveOptions::default());
        let names: Vec<_> = m.modules.iter().map(|m| m.file_name.as_str()).collect();
        assert_eq!(names, vec!["00-a.ko", "01-b.ko"]);
        let value = m.to_value().unwrap();
        assert_eq!(value["format_version"], FORMAT_VERSION);
        assert_eq!(value["options"]["module_dir"], "/init-modules");
    }
}
