//! Initramfs layout and serialization.
//!
//! Places the init binary, the ordered kernel modules and any extra
//! binaries into a newc stream:
//!
//! ```text
//! /init                          0755
//! /init-modules/                 0755   (only with modules)
//! /init-modules/00-virtio.ko     0644
//! /init-modules/01-fuse.ko.xz    0644
//! /bin/                          0755   (only with extras)
//! /bin/busybox                   0755
//! ```
//!
//! The init only has to walk the module directory in name order to load
//! modules in dependency order.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::compress::{compress_archive, Compression};
use super::cpio::CpioWriter;
use crate::error::{BuildError, BuildResult};
use crate::module::ModuleDescriptor;
use crate::tool::ToolRunner;

/// Archive path of the init binary.
pub const INIT_PATH: &str = "init";

/// Default directory for kernel modules inside the image.
pub const DEFAULT_MODULE_DIR: &str = "/init-modules";

/// Directory for extra binaries inside the image.
pub const EXTRA_BIN_DIR: &str = "bin";

const DIR_MODE: u32 = 0o755;
const EXEC_MODE: u32 = 0o755;
const MODULE_MODE: u32 = 0o644;

/// Options that change the archive bytes. All of them are fingerprinted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveOptions {
    pub compression: Compression,
    /// Absolute directory for modules inside the image.
    pub module_dir: String,
    /// Prefix module files with their two-digit load position (`00-`).
    pub order_prefix: bool,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            compression: Compression::None,
            module_dir: DEFAULT_MODULE_DIR.to_string(),
            order_prefix: true,
        }
    }
}

impl ArchiveOptions {
    pub fn validate(&self) -> BuildResult<()> {
        let dir = self.module_dir.trim_matches('/');
        if dir.is_empty() {
            return Err(BuildError::InvalidRequest(
                "module directory must not be the image root".into(),
            ));
        }
        if dir == INIT_PATH || dir.starts_with("init/") {
            return Err(BuildError::InvalidRequest(format!(
                "module directory '{}' collides with /{}",
                self.module_dir, INIT_PATH
            )));
        }
        if !dir
            .split('/')
            .all(is_safe_segment)
        {
            return Err(BuildError::InvalidRequest(format!(
                "module directory '{}' is not a clean path",
                self.module_dir
            )));
        }
        Ok(())
    }

    /// Module directory relative to the image root.
    fn module_dir_rel(&self) -> &str {
        self.module_dir.trim_matches('/')
    }
}

/// A path component safe to use inside the image.
pub fn is_safe_segment(seg: &str) -> bool {
    !seg.is_empty()
        && seg != "."
        && seg != ".."
        && !seg.contains('/')
        && !seg.contains('\0')
        && !seg.contains('\\')
}

/// File name of the module at `position` out of `count` in load order.
///
/// The prefix is at least two digits and wide enough for `count`, so names
/// sort in load order.
pub fn module_file_name(
    position: usize,
    count: usize,
    module: &ModuleDescriptor,
    options: &ArchiveOptions,
) -> String {
    if options.order_prefix {
        let width = count.saturating_sub(1).to_string().len().max(2);
        format!("{:0width$}-{}", position, module.archive_file_name())
    } else {
        module.archive_file_name()
    }
}

/// A module file ready to be archived.
#[derive(Debug, Clone)]
pub struct ArchiveModule<'a> {
    /// Name inside the module directory (see [`module_file_name`]).
    pub file_name: String,
    pub data: &'a [u8],
}

/// Everything that goes into one image.
#[derive(Debug, Clone, Default)]
pub struct ArchiveContents<'a> {
    pub init: &'a [u8],
    /// In load order.
    pub modules: Vec<ArchiveModule<'a>>,
    /// Logical name -> contents, serialized in name order.
    pub extras: BTreeMap<String, &'a [u8]>,
}

/// Serialize `contents` into an uncompressed newc stream.
///
/// Pure function of its inputs; no filesystem access.
pub fn serialize_archive(contents: &ArchiveContents<'_>, options: &ArchiveOptions) -> BuildResult<Vec<u8>> {
    options.validate()?;

    let mut layout = Layout::new(CpioWriter::new(Vec::new()));
    layout.file(INIT_PATH, EXEC_MODE, contents.init)?;

    if !contents.modules.is_empty() {
        let dir = options.module_dir_rel();
        layout.dirs(dir)?;
        for module in &contents.modules {
            if !is_safe_segment(&module.file_name) {
                return Err(BuildError::InvalidRequest(format!(
                    "invalid module file name '{}'",
                    module.file_name
                )));
            }
            layout.file(&format!("{dir}/{}", module.file_name), MODULE_MODE, module.data)?;
        }
    }

    if !contents.extras.is_empty() {
        layout.dirs(EXTRA_BIN_DIR)?;
        for (name, data) in &contents.extras {
            if !is_safe_segment(name) {
                return Err(BuildError::InvalidRequest(format!(
                    "invalid extra file name '{name}'"
                )));
            }
            layout.file(&format!("{EXTRA_BIN_DIR}/{name}"), EXEC_MODE, data)?;
        }
    }

    layout.finish()
}

/// Serialize, then compress as requested.
pub fn build_archive(
    contents: &ArchiveContents<'_>,
    options: &ArchiveOptions,
    runner: &dyn ToolRunner,
) -> BuildResult<Vec<u8>> {
    let raw = serialize_archive(contents, options)?;
    compress_archive(raw, options.compression, runner)
}

/// Tracks emitted paths so parents come first and nothing is written twice.
struct Layout {
    cpio: CpioWriter<Vec<u8>>,
    dirs: BTreeSet<String>,
    files: BTreeSet<String>,
}

impl Layout {
    fn new(cpio: CpioWriter<Vec<u8>>) -> Self {
        Self {
            cpio,
            dirs: BTreeSet::new(),
            files: BTreeSet::new(),
        }
    }

    /// Emit `path` and every missing ancestor.
    fn dirs(&mut self, path: &str) -> BuildResult<()> {
        let mut current = String::new();
        for seg in path.split('/') {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(seg);
            if self.files.contains(&current) {
                return Err(BuildError::InvalidRequest(format!(
                    "directory /{current} collides with a file"
                )));
            }
            if self.dirs.insert(current.clone()) {
                self.cpio
                    .append_dir(&current, DIR_MODE)
                    .map_err(|e| BuildError::archive_write(&current, e))?;
            }
        }
        Ok(())
    }

    fn file(&mut self, path: &str, perm: u32, data: &[u8]) -> BuildResult<()> {
        if self.dirs.contains(path) || !self.files.insert(path.to_string()) {
            return Err(BuildError::InvalidRequest(format!(
                "archive path /{path} would be written twice"
            )));
        }
        self.cpio
            .append_file(path, perm, data)
            .map_err(|e| BuildError::archive_write(path, e))
    }

    fn finish(self) -> BuildResult<Vec<u8>> {
        self.cpio
            .finish()
            .map_err(|e| BuildError::archive_write("TRAILER!!!", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::cpio::{parse_newc, S_IFDIR, S_IFREG};
    use crate::module::{descriptor, ModuleCompression};
    use crate::tool::testing::ScriptedRunner;

    fn names(bytes: &[u8]) -> Vec<String> {
        parse_newc(bytes).into_iter().map(|e| e.name).collect()
    }

    #[test]
    fn init_alone_is_one_entry() {
        let contents = ArchiveContents {
            init: b"\x7fELF init",
            ..Default::default()
        };
        let out = serialize_archive(&contents, &ArchiveOptions::default()).unwrap();
        let entries = parse_newc(&out);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "init");
        assert_eq!(entries[0].mode, S_IFREG | 0o755);
        assert_eq!(entries[0].data, b"\x7fELF init");
    }

    #[test]
    fn modules_follow_load_order_with_prefix() {
        let contents = ArchiveContents {
            init: b"init",
            modules: vec![
                ArchiveModule {
                    file_name: "00-virtio.ko".into(),
                    data: b"v",
                },
                ArchiveModule {
                    file_name: "01-fuse.ko.xz".into(),
                    data: b"f",
                },
            ],
            extras: BTreeMap::from([
                ("sh".to_string(), &b"sh"[..]),
                ("busybox".to_string(), &b"bb"[..]),
            ]),
        };
        let out = serialize_archive(&contents, &ArchiveOptions::default()).unwrap();
        assert_eq!(
            names(&out),
            vec![
                "init",
                "init-modules",
                "init-modules/00-virtio.ko",
                "init-modules/01-fuse.ko.xz",
                "bin",
                "bin/busybox",
                "bin/sh",
            ]
        );
        let entries = parse_newc(&out);
        assert_eq!(entries[1].mode, S_IFDIR | 0o755);
        assert_eq!(entries[2].mode, S_IFREG | 0o644);
        assert_eq!(entries[5].mode, S_IFREG | 0o755);
    }

    #[test]
    fn nested_module_dir_emits_parents() {
        let options = ArchiveOptions {
            module_dir: "/lib/modules/extra".into(),
            ..Default::default()
        };
        let contents = ArchiveContents {
            init: b"init",
            modules: vec![ArchiveModule {
                file_name: "a.ko".into(),
                data: b"a",
            }],
            ..Default::default()
        };
        let out = serialize_archive(&contents, &options).unwrap();
        assert_eq!(
            names(&out),
            vec!["init", "lib", "lib/modules", "lib/modules/extra", "lib/modules/extra/a.ko"]
        );
    }

    #[test]
    fn module_dir_shared_with_bin_is_emitted_once() {
        let options = ArchiveOptions {
            module_dir: "/bin".into(),
            ..Default::default()
        };
        let contents = ArchiveContents {
            init: b"init",
            modules: vec![ArchiveModule {
                file_name: "00-a.ko".into(),
                data: b"a",
            }],
            extras: BTreeMap::from([("tool".to_string(), &b"t"[..])]),
        };
        let out = serialize_archive(&contents, &options).unwrap();
        assert_eq!(names(&out), vec!["init", "bin", "bin/00-a.ko", "bin/tool"]);
    }

    #[test]
    fn colliding_paths_are_rejected() {
        let options = ArchiveOptions {
            module_dir: "/bin".into(),
            order_prefix: false,
            ..Default::default()
        };
        let contents = ArchiveContents {
            init: b"init",
            modules: vec![ArchiveModule {
                file_name: "x.ko".into(),
                data: b"a",
            }],
            extras: BTreeMap::from([("x.ko".to_string(), &b"t"[..])]),
        };
        let err = serialize_archive(&contents, &options).unwrap_err();
        assert!(matches!(err, BuildError::InvalidRequest(_)));
    }

    #[test]
    fn bad_options_are_rejected() {
        for dir in ["/", "", "/init", "/a/../b", "/a//b"] {
            let options = ArchiveOptions {
                module_dir: dir.into(),
                ..Default::default()
            };
            assert!(options.validate().is_err(), "{dir} accepted");
        }
        let err = serialize_archive(
            &ArchiveContents {
                init: b"i",
                extras: BTreeMap::from([("../evil".to_string(), &b"x"[..])]),
                ..Default::default()
            },
            &ArchiveOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::InvalidRequest(_)));
    }

    #[test]
    fn module_file_names() {
        let mut d = descriptor("fuse", &[]);
        d.compression = ModuleCompression::Xz;
        let mut options = ArchiveOptions::default();
        assert_eq!(module_file_name(3, 10, &d, &options), "03-fuse.ko.xz");
        options.order_prefix = false;
        assert_eq!(module_file_name(3, 10, &d, &options), "fuse.ko.xz");
        options.order_prefix = true;
        assert_eq!(module_file_name(7, 150, &d, &options), "007-fuse.ko.xz");
        assert_eq!(module_file_name(120, 150, &d, &options), "120-fuse.ko.xz");
        assert_eq!(module_file_name(7, 100, &d, &options), "07-fuse.ko.xz");
        assert_eq!(module_file_name(7, 101, &d, &options), "007-fuse.ko.xz");
    }

    #[test]
    fn compression_runs_after_serialization() {
        let runner = ScriptedRunner::new(|program, _, stdin| {
            assert_eq!(program, "xz");
            // The filter must see a complete newc stream.
            let input = stdin.unwrap();
            assert_eq!(&input[..6], b"070701");
            assert!(input
                .windows(b"TRAILER!!!".len())
                .any(|w| w == b"TRAILER!!!"));
            Ok(b"xz-bytes".to_vec())
        });
        let options = ArchiveOptions {
            compression: Compression::Xz,
            ..Default::default()
        };
        let contents = ArchiveContents {
            init: b"init",
            ..Default::default()
        };
        let out = build_archive(&contents, &options, &runner).unwrap();
        assert_eq!(out, b"xz-bytes");
        assert_eq!(runner.calls(), 1);
    }
}
