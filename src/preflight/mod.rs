//! Preflight checks for build validation.
//!
//! Works out which host tools a request needs and fails before any module
//! is read if one of them is missing, instead of halfway through inspection.
//!
//! # Example
//!
//! ```rust,ignore
//! use initramfs_builder::preflight::{check_required_tools, required_tools};
//!
//! let tools = required_tools(&module_paths, Compression::Xz);
//! check_required_tools(&tools, &SystemToolRunner::default())?;
//! ```

use std::path::PathBuf;

use crate::artifact::Compression;
use crate::error::{BuildError, BuildResult};
use crate::module::ModuleCompression;
use crate::tool::ToolRunner;

/// A host tool and the package that usually provides it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HostTool {
    pub command: &'static str,
    pub package: &'static str,
}

const MODINFO: HostTool = HostTool {
    command: "modinfo",
    package: "kmod",
};
const GZIP: HostTool = HostTool {
    command: "gzip",
    package: "gzip",
};
const XZ: HostTool = HostTool {
    command: "xz",
    package: "xz-utils",
};

/// Tools needed to inspect `modules` and compress with `compression`.
///
/// Sorted and deduplicated. zstd runs in-process and never shows up here.
pub fn required_tools(modules: &[PathBuf], compression: Compression) -> Vec<HostTool> {
    let mut tools = Vec::new();
    if !modules.is_empty() {
        tools.push(MODINFO);
    }
    for path in modules {
        match ModuleCompression::detect(path) {
            ModuleCompression::Gzip => tools.push(GZIP),
            ModuleCompression::Xz => tools.push(XZ),
            ModuleCompression::None | ModuleCompression::Zstd => {}
        }
    }
    match compression {
        Compression::Gzip => tools.push(GZIP),
        Compression::Xz => tools.push(XZ),
        Compression::None | Compression::Zstd => {}
    }
    tools.sort();
    tools.dedup();
    tools
}

/// Check that specific tools are available to `runner`.
///
/// Reports the first missing tool; every missing one is logged.
pub fn check_required_tools(tools: &[HostTool], runner: &dyn ToolRunner) -> BuildResult<()> {
    check_with(tools, |tool| runner.is_available(tool))
}

fn check_with(tools: &[HostTool], exists: impl Fn(&str) -> bool) -> BuildResult<()> {
    let missing: Vec<&HostTool> = tools.iter().filter(|t| !exists(t.command)).collect();
    for tool in &missing {
        tracing::debug!("missing host tool {} (install: {})", tool.command, tool.package);
    }
    match missing.first() {
        Some(tool) => Err(BuildError::ToolUnavailable {
            tool: tool.command.to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commands(tools: &[HostTool]) -> Vec<&'static str> {
        tools.iter().map(|t| t.command).collect()
    }

    #[test]
    fn init_only_needs_nothing() {
        assert!(required_tools(&[], Compression::None).is_empty());
        assert!(required_tools(&[], Compression::Zstd).is_empty());
    }

    #[test]
    fn modules_need_modinfo_and_their_decompressors() {
        let modules = vec![
            PathBuf::from("a.ko"),
            PathBuf::from("b.ko.xz"),
            PathBuf::from("c.ko.xz"),
            PathBuf::from("d.ko.zst"),
        ];
        assert_eq!(
            commands(&required_tools(&modules, Compression::Gzip)),
            vec!["gzip", "modinfo", "xz"]
        );
    }

    #[test]
    fn reports_missing_tool() {
        let tools = [MODINFO, XZ];
        let err = check_with(&tools, |cmd| cmd != "xz").unwrap_err();
        assert!(matches!(err, BuildError::ToolUnavailable { ref tool } if tool == "xz"));
        assert!(check_with(&tools, |_| true).is_ok());
    }

    #[test]
    fn real_lookup_finds_nothing_bogus() {
        let bogus = HostTool {
            command: "definitely_not_a_real_command_12345",
            package: "fake-package",
        };
        let runner = crate::tool::SystemToolRunner::default();
        assert!(check_required_tools(&[bogus], &runner).is_err());
        assert!(check_required_tools(&[], &runner).is_ok());
    }
}
