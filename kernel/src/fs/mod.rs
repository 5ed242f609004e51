//! Read-only ramdisk filesystem
//!
//! A single global [`TarReader`] over the archive the loader left in RAM.
//! The open/read surface mirrors the original block-device design: `open`
//! returns the file's size and parks the cursor at its data, and `read`
//! streams from wherever the cursor is — i.e. from the most recently
//! opened file.

pub mod tar;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
pub use tar::TarReader;

static RAMDISK: Mutex<Option<TarReader<'static>>> = Mutex::new(None);

/// Install the in-RAM archive. Called once during bootstrap, after the
/// archive has been mapped into the kernel window.
pub fn init(archive: &'static [u8]) {
    log::info!("ramdisk: {} KiB archive", archive.len() / 1024);
    *RAMDISK.lock() = Some(TarReader::new(archive));
}

/// Look up a file; returns its size and positions the shared cursor at
/// its first byte.
pub fn open(path: &str) -> KernelResult<usize> {
    let mut guard = RAMDISK.lock();
    let reader = guard.as_mut().ok_or(KernelError::FileNotFound)?;
    reader.find(path).ok_or(KernelError::FileNotFound)
}

/// Read from the shared cursor.
pub fn read(buf: &mut [u8]) -> usize {
    let mut guard = RAMDISK.lock();
    match guard.as_mut() {
        Some(reader) => reader.read(buf),
        None => 0,
    }
}

/// Read a whole file into a fresh buffer.
#[allow(clippy::module_name_repetitions)]
pub fn read_file(path: &str) -> KernelResult<alloc::vec::Vec<u8>> {
    let size = open(path)?;
    let mut buf = alloc::vec![0u8; size];
    let got = read(&mut buf);
    buf.truncate(got);
    Ok(buf)
}
