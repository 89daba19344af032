//! `build initramfs`

use initramfs_builder::artifact::ArchiveOptions;
use initramfs_builder::artifact_store::short;
use initramfs_builder::build::request::{collect_extras, default_output};
use initramfs_builder::tool::SystemToolRunner;
use initramfs_builder::{build_initramfs, BuildOutcome, BuildRequest, BuildResult, BuildSettings};

use crate::InitramfsArgs;

pub(crate) fn execute(args: InitramfsArgs, settings: &BuildSettings) -> BuildResult<()> {
    let request = BuildRequest {
        init: args.init,
        modules: args.modules,
        extras: collect_extras(args.extras)?,
        output: args.output.unwrap_or_else(|| default_output(args.compress)),
        options: ArchiveOptions {
            compression: args.compress,
            module_dir: args.moddir,
            order_prefix: !args.no_order_prefix,
        },
        use_cache: !args.no_cache,
    };
    let runner = SystemToolRunner::new(settings.tool_timeout);
    let report = build_initramfs(&request, settings, &runner)?;

    let how = match report.outcome {
        BuildOutcome::CacheHit => "cache hit",
        BuildOutcome::Built => "built",
        BuildOutcome::Uncached => "built, cache bypassed",
    };
    println!(
        "{} ({} bytes, {} module(s), fingerprint {}, {})",
        report.output.display(),
        report.size_bytes,
        report.load_order.modules.len(),
        short(&report.fingerprint),
        how
    );
    Ok(())
}
