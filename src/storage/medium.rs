//! # Backing Medium Abstraction
//!
//! The page store talks to its storage through the byte-addressed [`Medium`]
//! trait so that the same engine runs against a file during development and
//! against a raw flash region on target hardware. The trait deliberately
//! mirrors what flash gives you: reads and writes at arbitrary offsets plus
//! an explicit erase primitive for whole block ranges.
//!
//! ## FileMedium
//!
//! [`FileMedium`] memory-maps a fixed-size file. The index region never
//! grows — its size is decided by the configuration's address range — so the
//! mapping is created once and the usual remap hazards of growable mmaps do
//! not arise. `erase` is a no-op: files tolerate in-place overwrite, and the
//! engine never assumes erased bytes read back as any particular value.
//!
//! Raw flash implementations are expected to perform the real block erase
//! and may reject writes into non-erased ranges.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

/// Byte-addressed storage underneath the page store.
pub trait Medium {
    fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<()>;
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()>;
    fn erase(&mut self, addr: u64, len: u64) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
    fn size(&self) -> u64;
}

/// Fixed-size memory-mapped file backend.
pub struct FileMedium {
    _file: File,
    mmap: MmapMut,
    size: u64,
}

impl FileMedium {
    /// Creates (or truncates) a file of exactly `size` bytes.
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> Result<Self> {
        let path = path.as_ref();

        ensure!(size > 0, "medium size must be non-zero");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create medium file '{}'", path.display()))?;

        file.set_len(size)
            .wrap_err_with(|| format!("failed to size medium file to {} bytes", size))?;

        // SAFETY: map_mut is unsafe because externally modified mappings are
        // undefined behavior. The file was just created with exclusive
        // read-write access and is owned by this FileMedium for the lifetime
        // of the mapping; all access is bounds-checked against `size`.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            _file: file,
            mmap,
            size,
        })
    }

    /// Opens an existing medium file, adopting its current size.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open medium file '{}'", path.display()))?;

        let size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(size > 0, "medium file '{}' is empty", path.display());

        // SAFETY: same argument as in `create`; the mapping's lifetime is
        // tied to this FileMedium and the file is opened read-write.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            _file: file,
            mmap,
            size,
        })
    }

    fn check_range(&self, addr: u64, len: usize) -> Result<usize> {
        let end = addr
            .checked_add(len as u64)
            .ok_or_else(|| eyre::eyre!("address range overflow at {:#x}+{}", addr, len))?;
        ensure!(
            end <= self.size,
            "access [{:#x}, {:#x}) beyond medium end {:#x}",
            addr,
            end,
            self.size
        );
        Ok(addr as usize)
    }
}

impl Medium for FileMedium {
    fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let start = self.check_range(addr, buf.len())?;
        buf.copy_from_slice(&self.mmap[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let start = self.check_range(addr, data.len())?;
        self.mmap[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn erase(&mut self, _addr: u64, _len: u64) -> Result<()> {
        // Files tolerate overwrite; nothing to do.
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync medium to disk")
    }

    fn size(&self) -> u64 {
        self.size
    }
}
