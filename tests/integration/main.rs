//! Integration tests for initramfs-builder

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn builder(cache: &Path) -> Command {
        let mut cmd = cargo_bin_cmd!("initramfs-builder");
        cmd.env("INITRAMFS_BUILDER_CACHE_DIR", cache)
            .env_remove("RUST_LOG");
        cmd
    }

    struct Workspace {
        tmp: TempDir,
    }

    impl Workspace {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            fs::write(tmp.path().join("init"), b"\x7fELF test init").unwrap();
            Self { tmp }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.tmp.path().join(name)
        }

        fn cache(&self) -> PathBuf {
            self.path("cache")
        }
    }

    #[test]
    fn help_displays() {
        let ws = Workspace::new();
        builder(&ws.cache())
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("initramfs"));
    }

    #[test]
    fn version_displays() {
        let ws = Workspace::new();
        builder(&ws.cache())
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("initramfs-builder"));
    }

    #[test]
    fn init_only_build_without_cache() {
        let ws = Workspace::new();
        let out = ws.path("initramfs.cpio");
        builder(&ws.cache())
            .args(["build", "initramfs", "--no-cache", "-o"])
            .arg(&out)
            .arg(ws.path("init"))
            .assert()
            .success()
            .stdout(predicate::str::contains("cache bypassed"));

        let bytes = fs::read(&out).unwrap();
        assert_eq!(&bytes[..6], b"070701");
        assert_eq!(bytes.len() % 4, 0);
        assert!(!ws.cache().exists());
    }

    #[test]
    fn second_build_hits_cache() {
        let ws = Workspace::new();
        for (out, expected) in [("a.cpio", "built"), ("b.cpio", "cache hit")] {
            builder(&ws.cache())
                .args(["build", "initramfs"])
                .arg(ws.path("init"))
                .arg("--output")
                .arg(ws.path(out))
                .assert()
                .success()
                .stdout(predicate::str::contains(expected));
        }
        assert_eq!(
            fs::read(ws.path("a.cpio")).unwrap(),
            fs::read(ws.path("b.cpio")).unwrap()
        );

        builder(&ws.cache())
            .args(["cache", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("FINGERPRINT"));
        builder(&ws.cache())
            .args(["cache", "status"])
            .assert()
            .success()
            .stdout(predicate::str::contains("entries:   1"));
    }

    #[test]
    fn zstd_output_is_compressed() {
        let ws = Workspace::new();
        let out = ws.path("initramfs.cpio.zst");
        builder(&ws.cache())
            .args(["build", "initramfs", "--compress", "zstd", "-o"])
            .arg(&out)
            .arg(ws.path("init"))
            .assert()
            .success();
        let bytes = fs::read(&out).unwrap();
        assert_eq!(&bytes[..4], &[0x28, 0xb5, 0x2f, 0xfd]);
    }

    #[test]
    fn extras_land_in_bin() {
        let ws = Workspace::new();
        fs::write(ws.path("busybox"), b"busybox").unwrap();
        let out = ws.path("out.cpio");
        builder(&ws.cache())
            .args(["build", "initramfs", "--no-cache", "-o"])
            .arg(&out)
            .arg("--extra")
            .arg(format!("busybox={}", ws.path("busybox").display()))
            .arg(ws.path("init"))
            .assert()
            .success();
        let bytes = fs::read(&out).unwrap();
        assert!(bytes.windows(11).any(|w| w == b"bin/busybox"));
    }

    #[test]
    fn default_output_name_follows_compression() {
        let ws = Workspace::new();
        builder(&ws.cache())
            .current_dir(ws.tmp.path())
            .args(["build", "initramfs", "--no-cache", "--compress", "zstd"])
            .arg(ws.path("init"))
            .assert()
            .success();
        assert!(ws.path("initramfs.cpio.zst").is_file());
        assert!(!ws.path("initramfs.cpio").exists());
    }

    #[test]
    fn repeated_extra_name_is_request_error() {
        let ws = Workspace::new();
        fs::write(ws.path("dash"), b"dash").unwrap();
        fs::write(ws.path("bash"), b"bash").unwrap();
        builder(&ws.cache())
            .args(["build", "initramfs", "--no-cache"])
            .arg("--extra")
            .arg(format!("sh={}", ws.path("dash").display()))
            .arg("--extra")
            .arg(format!("sh={}", ws.path("bash").display()))
            .arg("-o")
            .arg(ws.path("out.cpio"))
            .arg(ws.path("init"))
            .assert()
            .code(2)
            .stderr(predicate::str::contains("error[InvalidRequest]"))
            .stderr(predicate::str::contains("given twice"));
        assert!(!ws.path("out.cpio").exists());
    }

    #[test]
    fn missing_init_is_request_error() {
        let ws = Workspace::new();
        builder(&ws.cache())
            .args(["build", "initramfs"])
            .arg(ws.path("no-such-init"))
            .arg("-o")
            .arg(ws.path("out.cpio"))
            .assert()
            .code(2)
            .stderr(predicate::str::contains("error[MissingInput]"));
        assert!(!ws.path("out.cpio").exists());
    }

    #[test]
    fn malformed_extra_is_rejected() {
        let ws = Workspace::new();
        builder(&ws.cache())
            .args(["build", "initramfs", "--extra", "no-equals-sign"])
            .arg(ws.path("init"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("NAME=PATH"));
    }

    #[test]
    fn unknown_compression_is_rejected() {
        let ws = Workspace::new();
        builder(&ws.cache())
            .args(["build", "initramfs", "--compress", "lz4"])
            .arg(ws.path("init"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("unknown compression"));
    }

    #[test]
    fn cache_path_prints_dir() {
        let ws = Workspace::new();
        builder(&ws.cache())
            .args(["cache", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains(ws.cache().display().to_string()));
    }

    #[test]
    fn cache_list_empty() {
        let ws = Workspace::new();
        builder(&ws.cache())
            .args(["cache", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cached archives"));
    }

    #[test]
    fn cache_show_unknown_fingerprint() {
        let ws = Workspace::new();
        builder(&ws.cache())
            .args(["cache", "show", "deadbeef"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("no cache entry"));
    }

    #[test]
    fn cache_prune_requires_positive_keep() {
        let ws = Workspace::new();
        builder(&ws.cache())
            .args(["cache", "prune", "--keep-last", "0"])
            .assert()
            .code(2)
            .stderr(predicate::str::contains("error[InvalidRequest]"));
    }
}
