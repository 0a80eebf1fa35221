//! Listener readiness publication.
//!
//! A listener announces its bound address and then its readiness; a
//! connector may wait for the readiness before dialing. [`FileSync`] does
//! this through two files, [`MemorySync`] in process memory.

use crate::error::{EndpointError, EndpointResult};
use parking_lot::{Condvar, Mutex};
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What a listener publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenInfo {
    /// Bound address, after resolving port 0.
    pub addr: SocketAddr,
}

/// Publication channel between a listener and its connectors.
pub trait RendezvousSync: Send {
    /// Publish `info`, then mark the listener ready.
    fn publish(&self, info: &ListenInfo) -> EndpointResult<()>;

    /// Wait until the listener is ready.
    ///
    /// Returns `Ok(None)` immediately when this sync has no readiness
    /// signal configured, `Ok(Some(info))` once ready, and
    /// `EndpointError::NotReady` after `timeout`.
    fn wait_ready(&self, timeout: Duration, poll_interval: Duration) -> EndpointResult<Option<ListenInfo>>;

    /// Retract the readiness marker and the published info. Idempotent.
    fn withdraw(&self) -> EndpointResult<()>;
}

/// File-based sync: an info file holding `ip:port` and a ready marker.
///
/// Each file is written to a temporary sibling and renamed into place, and
/// the info file always lands before the ready file.
#[derive(Debug, Clone, Default)]
pub struct FileSync {
    info_path: Option<PathBuf>,
    ready_path: Option<PathBuf>,
}

impl FileSync {
    /// Sync over the given paths; `None` disables that step.
    pub fn new(info_path: Option<PathBuf>, ready_path: Option<PathBuf>) -> Self {
        Self {
            info_path,
            ready_path,
        }
    }

    /// Info file path, if configured.
    pub fn info_path(&self) -> Option<&Path> {
        self.info_path.as_deref()
    }

    /// Ready marker path, if configured.
    pub fn ready_path(&self) -> Option<&Path> {
        self.ready_path.as_deref()
    }

    fn read_info(&self) -> EndpointResult<Option<ListenInfo>> {
        let Some(path) = &self.info_path else {
            return Ok(None);
        };
        let text = fs::read_to_string(path)?;
        let addr = text.trim().parse::<SocketAddr>().map_err(|e| {
            EndpointError::protocol(format!("{}: {e}", path.display()))
        })?;
        Ok(Some(ListenInfo { addr }))
    }
}

/// Write `contents` next to `path` and rename it into place.
fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl RendezvousSync for FileSync {
    fn publish(&self, info: &ListenInfo) -> EndpointResult<()> {
        if let Some(path) = &self.info_path {
            write_atomic(path, &format!("{}\n", info.addr))?;
            debug!(path = %path.display(), addr = %info.addr, "Listen info written");
        }
        if let Some(path) = &self.ready_path {
            write_atomic(path, "ready\n")?;
            debug!(path = %path.display(), "Ready marker written");
        }
        Ok(())
    }

    fn wait_ready(&self, timeout: Duration, poll_interval: Duration) -> EndpointResult<Option<ListenInfo>> {
        let Some(ready) = &self.ready_path else {
            return Ok(None);
        };

        let start = Instant::now();
        while !ready.exists() {
            let waited = start.elapsed();
            if waited >= timeout {
                return Err(EndpointError::NotReady {
                    waited_ms: waited.as_millis() as u64,
                });
            }
            std::thread::sleep(poll_interval.min(timeout - waited));
        }
        debug!(path = %ready.display(), "Listener ready");
        self.read_info()
    }

    fn withdraw(&self) -> EndpointResult<()> {
        // Reverse order: a reader never sees ready without info.
        if let Some(path) = &self.ready_path {
            remove_if_present(path)?;
        }
        if let Some(path) = &self.info_path {
            remove_if_present(path)?;
        }
        Ok(())
    }
}

/// In-process sync for listeners and connectors sharing an address space.
#[derive(Debug, Clone, Default)]
pub struct MemorySync {
    inner: Arc<(Mutex<Option<ListenInfo>>, Condvar)>,
}

impl MemorySync {
    /// Create an unpublished sync.
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently published info.
    pub fn current(&self) -> Option<ListenInfo> {
        *self.inner.0.lock()
    }
}

impl RendezvousSync for MemorySync {
    fn publish(&self, info: &ListenInfo) -> EndpointResult<()> {
        let (slot, ready) = &*self.inner;
        *slot.lock() = Some(*info);
        ready.notify_all();
        Ok(())
    }

    fn wait_ready(&self, timeout: Duration, _poll_interval: Duration) -> EndpointResult<Option<ListenInfo>> {
        let (slot, ready) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut guard = slot.lock();
        while guard.is_none() {
            if ready.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        match *guard {
            Some(info) => Ok(Some(info)),
            None => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Listener never published");
                Err(EndpointError::NotReady {
                    waited_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn withdraw(&self) -> EndpointResult<()> {
        *self.inner.0.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    fn info() -> ListenInfo {
        ListenInfo {
            addr: "127.0.0.1:4791".parse().unwrap(),
        }
    }

    #[test]
    fn file_sync_publish_then_wait() {
        let dir = TempDir::new().unwrap();
        let sync = FileSync::new(Some(dir.path().join("info")), Some(dir.path().join("ready")));

        sync.publish(&info()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("info")).unwrap(),
            "127.0.0.1:4791\n"
        );
        assert!(dir.path().join("ready").exists());
        assert!(!dir.path().join("info.tmp").exists());

        let seen = sync
            .wait_ready(Duration::from_millis(10), Duration::from_millis(1))
            .unwrap();
        assert_eq!(seen, Some(info()));
    }

    #[test]
    fn file_sync_without_paths_is_noop() {
        let sync = FileSync::default();
        sync.publish(&info()).unwrap();
        assert_eq!(
            sync.wait_ready(Duration::from_millis(1), Duration::from_millis(1))
                .unwrap(),
            None
        );
        sync.withdraw().unwrap();
    }

    #[test]
    fn file_sync_wait_times_out() {
        let dir = TempDir::new().unwrap();
        let sync = FileSync::new(None, Some(dir.path().join("ready")));
        let err = sync
            .wait_ready(Duration::from_millis(30), Duration::from_millis(5))
            .unwrap_err();
        assert!(matches!(err, EndpointError::NotReady { .. }));
    }

    #[test]
    fn file_sync_withdraw_removes_both() {
        let dir = TempDir::new().unwrap();
        let sync = FileSync::new(Some(dir.path().join("info")), Some(dir.path().join("ready")));
        sync.publish(&info()).unwrap();
        sync.withdraw().unwrap();
        sync.withdraw().unwrap();
        assert!(!dir.path().join("info").exists());
        assert!(!dir.path().join("ready").exists());
    }

    #[test]
    fn file_sync_garbage_info_is_protocol_error() {
        let dir = TempDir::new().unwrap();
        let sync = FileSync::new(Some(dir.path().join("info")), Some(dir.path().join("ready")));
        fs::write(dir.path().join("info"), "not an address").unwrap();
        fs::write(dir.path().join("ready"), "ready").unwrap();
        assert!(matches!(
            sync.wait_ready(Duration::from_millis(10), Duration::from_millis(1)),
            Err(EndpointError::Protocol { .. })
        ));
    }

    #[test]
    fn memory_sync_wakes_waiter() {
        let sync = MemorySync::new();
        let waiter = {
            let sync = sync.clone();
            thread::spawn(move || sync.wait_ready(Duration::from_secs(5), Duration::ZERO))
        };
        thread::sleep(Duration::from_millis(20));
        sync.publish(&info()).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), Some(info()));
        assert_eq!(sync.current(), Some(info()));

        sync.withdraw().unwrap();
        assert!(sync.current().is_none());
        assert!(sync
            .wait_ready(Duration::from_millis(10), Duration::ZERO)
            .is_err());
    }
}
