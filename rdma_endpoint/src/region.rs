//! Shared memory region manager.
//!
//! One region is allocated per endpoint and shared by every connection.
//! Local code reads and writes it by offset; the device layer writes into it
//! on behalf of remote peers, so the mapping is accessed through a raw
//! pointer rather than a `&mut [u8]`.

use crate::device::Device;
use crate::error::{EndpointError, EndpointResult};
use crate::platform::{create_region_mmap, get_current_pid, shm_dir};
use bitflags::bitflags;
use memmap2::MmapMut;
use rdma_common::consts::SHM_MAX_SIZE;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

static REGION_SEQ: AtomicU64 = AtomicU64::new(0);

bitflags! {
    /// Access rights granted by a memory registration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        /// Device may write into the region on behalf of local operations.
        const LOCAL_WRITE = 1 << 0;
        /// Peers may write into the region.
        const REMOTE_WRITE = 1 << 1;
        /// Peers may read from the region.
        const REMOTE_READ = 1 << 2;
    }
}

impl AccessFlags {
    /// Rights every connection registers the endpoint region with.
    pub const fn connection_default() -> Self {
        Self::LOCAL_WRITE
            .union(Self::REMOTE_WRITE)
            .union(Self::REMOTE_READ)
    }
}

/// Fixed-size block of memory backed by a file under the shm directory.
///
/// The backing file is unlinked when the last owner drops the region.
pub struct SharedRegion {
    name: String,
    path: PathBuf,
    ptr: NonNull<u8>,
    len: usize,
    // Keeps the mapping alive; never touched after construction.
    _mmap: MmapMut,
}

// SAFETY: the mapping lives as long as the struct and is only accessed
// through bounds-checked copies. Concurrent writers to the same bytes
// race exactly as RDMA hardware would; callers coordinate through
// completions.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Reserve a region of exactly `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns `EndpointError::Allocation` if the size is 0, above
    /// `SHM_MAX_SIZE`, or the mapping cannot be created.
    pub fn create(name: &str, size: usize) -> EndpointResult<Self> {
        if size == 0 || size > SHM_MAX_SIZE {
            return Err(EndpointError::Allocation {
                size,
                reason: format!("size must be within 1..={SHM_MAX_SIZE}"),
            });
        }

        let seq = REGION_SEQ.fetch_add(1, Ordering::Relaxed);
        let file_name = format!(
            "rdma_{}_{}_{}",
            sanitize(name),
            get_current_pid(),
            seq
        );
        let path = shm_dir().join(file_name);

        let mut mmap = create_region_mmap(&path, size).map_err(|e| EndpointError::Allocation {
            size,
            reason: format!("{}: {e}", path.display()),
        })?;

        let ptr = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| EndpointError::Allocation {
            size,
            reason: "mapping returned a null address".to_string(),
        })?;

        debug!(path = %path.display(), size, "Region mapped");

        Ok(Self {
            name: name.to_string(),
            path,
            ptr,
            len: size,
            _mmap: mmap,
        })
    }

    /// Logical name the region was created with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Base virtual address.
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Region length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false: zero-sized regions are rejected at creation.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `offset..offset+len` lies inside the region.
    pub fn contains(&self, offset: usize, len: usize) -> bool {
        offset
            .checked_add(len)
            .is_some_and(|end| end <= self.len)
    }

    fn check(&self, offset: usize, len: usize) -> EndpointResult<()> {
        if self.contains(offset, len) {
            Ok(())
        } else {
            Err(EndpointError::OutOfBounds {
                offset,
                len,
                region_len: self.len,
            })
        }
    }

    /// Copy `len` bytes starting at `offset` out of the region.
    pub fn read_at(&self, offset: usize, len: usize) -> EndpointResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(offset, &mut buf)?;
        Ok(buf)
    }

    /// Fill `buf` from the region starting at `offset`.
    pub fn read_into(&self, offset: usize, buf: &mut [u8]) -> EndpointResult<()> {
        self.check(offset, buf.len())?;
        // SAFETY: range checked above; `buf` cannot overlap the mapping
        // because it is a distinct Rust allocation or a borrowed slice.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Copy `data` into the region starting at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> EndpointResult<()> {
        self.check(offset, data.len())?;
        // SAFETY: range checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.ptr.as_ptr().add(offset),
                data.len(),
            );
        }
        Ok(())
    }

    /// Set every byte in `offset..offset+len` to `value`.
    pub fn fill(&self, offset: usize, len: usize, value: u8) -> EndpointResult<()> {
        self.check(offset, len)?;
        // SAFETY: range checked above.
        unsafe {
            std::ptr::write_bytes(self.ptr.as_ptr().add(offset), value, len);
        }
        Ok(())
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to unlink region file");
        }
    }
}

/// Peer's region as learned from the rendezvous record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteRegion {
    /// Base virtual address in the peer's address space.
    pub addr: u64,
    /// Length in bytes.
    pub len: u64,
    /// Remote access key.
    pub rkey: u32,
}

impl RemoteRegion {
    /// Translate an offset range into a remote virtual address.
    pub fn address_of(&self, offset: usize, len: usize) -> EndpointResult<u64> {
        let end = (offset as u64).checked_add(len as u64);
        match end {
            Some(end) if end <= self.len => Ok(self.addr + offset as u64),
            _ => Err(EndpointError::OutOfBounds {
                offset,
                len,
                region_len: self.len as usize,
            }),
        }
    }
}

/// Reserve the endpoint region and check the device can register it.
///
/// # Errors
///
/// `EndpointError::Allocation` when the size exceeds the device's maximum
/// registration size or the reservation fails.
pub fn allocate(device: &dyn Device, name: &str, size: usize) -> EndpointResult<Arc<SharedRegion>> {
    let max_mr_size = device.attributes().max_mr_size;
    if size > max_mr_size {
        return Err(EndpointError::Allocation {
            size,
            reason: format!(
                "device {} registers at most {max_mr_size} bytes",
                device.name()
            ),
        });
    }

    let region = SharedRegion::create(name, size)?;
    info!(
        name = region.name(),
        size,
        addr = format_args!("{:#x}", region.addr()),
        "Shared region allocated"
    );
    Ok(Arc::new(region))
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
