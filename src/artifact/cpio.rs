//! CPIO archive writing for initramfs.
//!
//! Writes the SVR4 "newc" format (magic `070701`) that the kernel's
//! initramfs unpacker reads. Every header field is fixed except the ones
//! derived from the entry itself, so identical entries always serialize to
//! identical bytes:
//! - uid/gid 0, mtime 0
//! - inode numbers assigned sequentially from 1
//! - no device numbers
//!
//! # Example
//!
//! ```rust,ignore
//! use initramfs_builder::artifact::cpio::CpioWriter;
//!
//! let mut cpio = CpioWriter::new(Vec::new());
//! cpio.append_file("init", 0o755, &init_bytes)?;
//! let archive = cpio.finish()?;
//! ```

use std::io::{self, Write};

/// newc magic without CRC.
pub const NEWC_MAGIC: &str = "070701";

/// Name of the end-of-archive entry.
pub const TRAILER_NAME: &str = "TRAILER!!!";

pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;

const HEADER_LEN: usize = 110;

/// Streaming newc writer.
pub struct CpioWriter<W: Write> {
    inner: W,
    next_ino: u32,
    offset: u64,
}

impl<W: Write> CpioWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            next_ino: 1,
            offset: 0,
        }
    }

    /// Append a directory. `perm` holds only permission bits.
    pub fn append_dir(&mut self, path: &str, perm: u32) -> io::Result<()> {
        let name = entry_name(path)?;
        let ino = self.take_ino();
        self.write_entry(ino, S_IFDIR | (perm & 0o7777), 2, name, &[])
    }

    /// Append a regular file. `perm` holds only permission bits.
    pub fn append_file(&mut self, path: &str, perm: u32, data: &[u8]) -> io::Result<()> {
        let name = entry_name(path)?;
        let ino = self.take_ino();
        self.write_entry(ino, S_IFREG | (perm & 0o7777), 1, name, data)
    }

    /// Write the trailer and hand back the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.write_entry(0, 0, 1, TRAILER_NAME, &[])?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn take_ino(&mut self) -> u32 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    fn write_entry(
        &mut self,
        ino: u32,
        mode: u32,
        nlink: u32,
        name: &str,
        data: &[u8],
    ) -> io::Result<()> {
        let filesize = u32::try_from(data.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{name}: entry larger than 4 GiB"),
            )
        })?;
        // namesize counts the trailing NUL.
        let namesize = name.len() as u32 + 1;

        let header = format!(
            "{NEWC_MAGIC}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}",
            ino, mode, 0, 0, nlink, 0, filesize, 0, 0, 0, 0, namesize, 0
        );
        debug_assert_eq!(header.len(), HEADER_LEN);

        self.write_raw(header.as_bytes())?;
        self.write_raw(name.as_bytes())?;
        self.write_raw(&[0])?;
        self.pad()?;
        self.write_raw(data)?;
        self.pad()
    }

    fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    fn pad(&mut self) -> io::Result<()> {
        let rem = (self.offset % 4) as usize;
        if rem != 0 {
            self.write_raw(&[0u8; 3][..4 - rem])?;
        }
        Ok(())
    }
}

/// Archive-relative entry name: no leading `/`, no empty or `..` segments.
fn entry_name(path: &str) -> io::Result<&str> {
    let name = path.trim_start_matches('/');
    let valid = !name.is_empty()
        && !name.contains('\0')
        && name != TRAILER_NAME
        && name.split('/').all(|seg| !seg.is_empty() && seg != "." && seg != "..");
    if valid {
        Ok(name)
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid archive path '{path}'"),
        ))
    }
}

/// One decoded newc entry.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedEntry {
    pub ino: u32,
    pub mode: u32,
    pub nlink: u32,
    pub name: String,
    pub data: Vec<u8>,
}

/// Decode a newc stream up to (not including) the trailer.
#[cfg(test)]
pub(crate) fn parse_newc(bytes: &[u8]) -> Vec<ParsedEntry> {
    fn field(h: &[u8], idx: usize) -> u32 {
        let start = 6 + idx * 8;
        u32::from_str_radix(std::str::from_utf8(&h[start..start + 8]).unwrap(), 16).unwrap()
    }
    fn align(n: usize) -> usize {
        (n + 3) & !3
    }

    let mut entries = Vec::new();
    let mut pos = 0;
    loop {
        let h = &bytes[pos..pos + HEADER_LEN];
        assert_eq!(&h[..6], NEWC_MAGIC.as_bytes(), "bad magic at {pos}");
        let namesize = field(h, 11) as usize;
        let filesize = field(h, 6) as usize;
        let name_start = pos + HEADER_LEN;
        let name = std::str::from_utf8(&bytes[name_start..name_start + namesize - 1])
            .unwrap()
            .to_string();
        assert_eq!(bytes[name_start + namesize - 1], 0);
        let data_start = align(name_start + namesize);
        let data = bytes[data_start..data_start + filesize].to_vec();
        pos = align(data_start + filesize);
        if name == TRAILER_NAME {
            assert_eq!(pos, bytes.len(), "bytes after trailer");
            return entries;
        }
        entries.push(ParsedEntry {
            ino: field(h, 0),
            mode: field(h, 1),
            nlink: field(h, 4),
            name,
            data,
        });
    }
}
