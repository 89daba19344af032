//! Archive assembly.
//!
//! - [`cpio`] - newc stream writer
//! - [`initramfs`] - Image layout (init, modules, extras) on top of [`cpio`]
//! - [`compress`] - Whole-archive compression
//!
//! Nothing here touches the filesystem; callers hand in bytes and get bytes
//! back, which is what makes archives reproducible from their fingerprint.

pub mod compress;
pub mod cpio;
pub mod initramfs;

pub use compress::Compression;
pub use initramfs::{build_archive, ArchiveContents, ArchiveModule, ArchiveOptions};
