//! Deterministic, cached initramfs assembly.
//!
//! Takes an init binary, a set of kernel modules and optional extra
//! binaries, orders the modules by their declared dependencies and writes a
//! newc cpio archive the kernel can unpack as its initramfs. Archives are
//! cached by a fingerprint of their inputs, so rebuilding an unchanged set
//! is a copy.
//!
//! - **Modules** - Inspection through `modinfo` and dependency ordering
//! - **Artifact** - newc serialization, image layout and compression
//! - **Artifact store** - Content-addressed archive cache with per-fingerprint locks
//! - **Build** - Request validation, fingerprinting and orchestration
//! - **Preflight** - Host tool checks before any work starts
//!
//! # Architecture
//!
//! ```text
//! build::build_initramfs
//!     │
//!     ├── preflight ─────────── tool (which)
//!     ├── module::inspect ───── tool (modinfo, gzip -d, xz -d), hash
//!     ├── module::resolve
//!     ├── build::fingerprint ── hash
//!     ├── artifact_store ────── fs2 locks, tmp + rename
//!     └── artifact::{initramfs, cpio, compress}
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use initramfs_builder::build::{build_initramfs, BuildRequest, BuildSettings};
//! use initramfs_builder::tool::SystemToolRunner;
//!
//! let request = BuildRequest::new("target/init")
//!     .module("/lib/modules/6.6.0/kernel/fs/fuse/fuse.ko.xz")
//!     .module("/lib/modules/6.6.0/kernel/fs/fuse/virtiofs.ko.xz")
//!     .output("initramfs.cpio");
//! let settings = BuildSettings::default();
//! let runner = SystemToolRunner::new(settings.tool_timeout);
//! let report = build_initramfs(&request, &settings, &runner)?;
//! println!("{}", report.fingerprint);
//! ```

pub mod artifact;
pub mod artifact_store;
pub mod build;
pub mod error;
pub mod hash;
pub mod module;
pub mod preflight;
pub mod tool;

pub use build::{build_initramfs, BuildOutcome, BuildReport, BuildRequest, BuildSettings};
pub use error::{BuildError, BuildResult, ErrorClass};
