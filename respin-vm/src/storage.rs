//! Executable code storage.
//!
//! A page-aligned anonymous mapping that generated instructions are
//! written into. The region starts writable; [`CodeStorage::make_executable`]
//! flips it to read+execute once encoding finishes, so W^X-strict
//! platforms are served by the same API. Pointers into the region are
//! stable across protection flips.

use crate::error::{Result, RewriteError};

use memmap2::{Mmap, MmapMut, MmapOptions};

use tracing::debug;

enum Region {
    Writable(MmapMut),
    Executable(Mmap),
    /// Transient state while flipping protections.
    Poisoned,
}

impl Region {
    fn base(&self) -> *const u8 {
        match self {
            Self::Writable(m) => m.as_ptr(),
            Self::Executable(m) => m.as_ptr(),
            Self::Poisoned => unreachable!("storage poisoned"),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Writable(m) => m.len(),
            Self::Executable(m) => m.len(),
            Self::Poisoned => unreachable!("storage poisoned"),
        }
    }
}

/// Read/write/execute arena for generated instructions.
pub struct CodeStorage {
    region: Region,
    used: usize,
}

impl CodeStorage {
    /// Map a fresh region of at least `capacity` bytes, rounded up to the
    /// page size by the OS mapping.
    pub fn new(capacity: usize) -> Result<Self> {
        let map = MmapOptions::new().len(capacity.max(1)).map_anon()?;
        debug!(capacity = map.len(), base = ?map.as_ptr(), "mapped code storage");
        Ok(Self {
            region: Region::Writable(map),
            used: 0,
        })
    }

    /// Base address of the region.
    pub fn base(&self) -> u64 {
        self.region.base() as u64
    }

    /// Total mapped bytes.
    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    /// Bytes committed so far.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes still available.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.used
    }

    /// Address `n` bytes would be written at, without committing them.
    pub fn reserve(&self, n: usize) -> Result<u64> {
        if n > self.remaining() {
            return Err(RewriteError::CodeCapacity {
                needed: self.used + n,
                capacity: self.capacity(),
            });
        }
        Ok(self.base() + self.used as u64)
    }

    /// Copy `bytes` at the cursor and commit them. The region must be
    /// writable.
    pub fn push(&mut self, bytes: &[u8]) -> Result<u64> {
        let at = self.reserve(bytes.len())?;
        match &mut self.region {
            Region::Writable(map) => {
                map[self.used..self.used + bytes.len()].copy_from_slice(bytes);
            }
            _ => {
                return Err(RewriteError::Map(std::io::Error::other(
                    "code storage is not writable",
                )))
            }
        }
        self.used += bytes.len();
        Ok(at)
    }

    /// Discard all committed bytes, keeping the mapping.
    pub fn clear(&mut self) -> Result<()> {
        self.make_writable()?;
        self.used = 0;
        Ok(())
    }

    /// Flip the region to read+execute.
    pub fn make_executable(&mut self) -> Result<()> {
        if let Region::Writable(_) = self.region {
            let Region::Writable(map) = std::mem::replace(&mut self.region, Region::Poisoned)
            else {
                unreachable!()
            };
            self.region = Region::Executable(map.make_exec()?);
        }
        Ok(())
    }

    /// Flip the region back to read+write for another rewrite.
    pub fn make_writable(&mut self) -> Result<()> {
        if let Region::Executable(_) = self.region {
            let Region::Executable(map) = std::mem::replace(&mut self.region, Region::Poisoned)
            else {
                unreachable!()
            };
            self.region = Region::Writable(map.make_mut()?);
        }
        Ok(())
    }
}

impl std::fmt::Debug for CodeStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeStorage")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("capacity", &self.capacity())
            .field("used", &self.used)
            .finish()
    }
}
