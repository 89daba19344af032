//! Whole-archive compression.
//!
//! Applied to the finished newc stream, never to individual entries.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{BuildError, BuildResult};
use crate::tool::{ToolCommand, ToolRunner};

/// zstd level for archives; single-threaded so output is reproducible.
pub const ZSTD_LEVEL: i32 = 19;

/// Compression applied to the serialized archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    pub const ALL: [Compression; 4] = [Self::None, Self::Gzip, Self::Xz, Self::Zstd];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
        }
    }

    /// Host tool needed for this compression, if any.
    pub fn required_tool(self) -> Option<&'static str> {
        match self {
            Self::Gzip => Some("gzip"),
            Self::Xz => Some("xz"),
            Self::None | Self::Zstd => None,
        }
    }

    /// Conventional file suffix for an archive with this compression.
    pub fn archive_suffix(self) -> &'static str {
        match self {
            Self::None => ".cpio",
            Self::Gzip => ".cpio.gz",
            Self::Xz => ".cpio.xz",
            Self::Zstd => ".cpio.zst",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "gzip" | "gz" => Ok(Self::Gzip),
            "xz" => Ok(Self::Xz),
            "zstd" | "zst" => Ok(Self::Zstd),
            other => Err(format!(
                "unknown compression '{other}'; expected one of: none, gzip, xz, zstd"
            )),
        }
    }
}

/// Compress a finished archive.
///
/// `gzip -n` drops the name and timestamp from the header, and xz uses the
/// crc32 check the kernel's decompressor requires.
pub fn compress_archive(
    data: Vec<u8>,
    compression: Compression,
    runner: &dyn ToolRunner,
) -> BuildResult<Vec<u8>> {
    match compression {
        Compression::None => Ok(data),
        Compression::Zstd => zstd::stream::encode_all(&data[..], ZSTD_LEVEL)
            .map_err(|e| BuildError::io("zstd compression of archive", e)),
        Compression::Gzip => {
            runner.run(&ToolCommand::new("gzip").args(["-n", "-9", "-c"]).stdin(&data))
        }
        Compression::Xz => runner.run(
            &ToolCommand::new("xz")
                .args(["--check=crc32", "--lzma2=dict=1MiB", "-T1", "-c"])
                .stdin(&data),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::testing::ScriptedRunner;
    use crate::tool::SystemToolRunner;

    #[test]
    fn parses_names_and_aliases() {
        assert_eq!("gz".parse::<Compression>().unwrap(), Compression::Gzip);
        assert_eq!("ZSTD".parse::<Compression>().unwrap(), Compression::Zstd);
        assert!("lz4".parse::<Compression>().is_err());
        for c in Compression::ALL {
            assert_eq!(c.as_str().parse::<Compression>().unwrap(), c);
        }
    }

    #[test]
    fn none_is_passthrough() {
        let runner = ScriptedRunner::new(|_, _, _| panic!("no tool expected"));
        let out = compress_archive(b"abc".to_vec(), Compression::None, &runner).unwrap();
        assert_eq!(out, b"abc");
    }

    #[test]
    fn zstd_is_in_process_and_deterministic() {
        let runner = ScriptedRunner::new(|_, _, _| panic!("no tool expected"));
        let data = b"newc archive bytes ".repeat(100);
        let a = compress_archive(data.clone(), Compression::Zstd, &runner).unwrap();
        let b = compress_archive(data.clone(), Compression::Zstd, &runner).unwrap();
        assert_eq!(a, b);
        assert_eq!(zstd::stream::decode_all(&a[..]).unwrap(), data);
        assert_eq!(runner.calls(), 0);
    }

    #[test]
    fn gzip_goes_through_runner_with_reproducible_flags() {
        let runner = ScriptedRunner::new(|program, args, stdin| {
            assert_eq!(program, "gzip");
            assert!(args.iter().any(|a| a == "-n"));
            Ok(stdin.unwrap().iter().rev().copied().collect())
        });
        let out = compress_archive(b"abc".to_vec(), Compression::Gzip, &runner).unwrap();
        assert_eq!(out, b"cba");
    }

    #[test]
    fn real_gzip_is_reproducible() {
        if !crate::tool::tool_exists("gzip") {
            return;
        }
        let runner = SystemToolRunner::default();
        let data = b"0123456789".repeat(1000);
        let a = compress_archive(data.clone(), Compression::Gzip, &runner).unwrap();
        let b = compress_archive(data, Compression::Gzip, &runner).unwrap();
        assert_eq!(a, b);
        assert_eq!(&a[..2], &[0x1f, 0x8b]);
    }
}
