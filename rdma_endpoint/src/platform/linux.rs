//! Linux-specific shared memory operations

use memmap2::{MmapMut, MmapOptions};
use nix::unistd::getpid;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Directory holding region backing files.
///
/// `/dev/shm` when present (tmpfs), the system temp dir otherwise.
pub fn shm_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Create a fresh backing file of `size` bytes and map it.
///
/// Fails if the file already exists, so two regions never alias.
pub fn create_region_mmap(path: &Path, size: usize) -> io::Result<MmapMut> {
    let file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .mode(0o600) // Owner read/write only
        .open(path)?;

    file.set_len(size as u64)?;

    // Prefault so the first remote write does not page-fault.
    let mut mmap_options = MmapOptions::new();
    mmap_options.populate();

    let mmap = unsafe { mmap_options.map_mut(&file) };
    if mmap.is_err() {
        let _ = std::fs::remove_file(path);
    }
    mmap
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}
