//! Linux-specific shared memory operations

use crate::error::{ShmError, ShmResult};
use memmap2::{MmapMut, MmapOptions};
use nix::sys::signal::{Signal, kill};
use nix::sys::time::TimeSpec;
use nix::time::{ClockId, clock_gettime};
use nix::unistd::{Pid, getpid};
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Instant;

/// Linux-specific memory mapping configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxMemoryConfig {
    /// Pre-fault pages at map time (MAP_POPULATE)
    pub populate: bool,
}

/// Create a new file of `size` bytes and map it.
///
/// Fails with [`ShmError::AlreadyExists`] if `path` exists; a live resource
/// is never silently reused.
pub fn create_mapping(path: &Path, size: usize, config: &LinuxMemoryConfig) -> ShmResult<MmapMut> {
    let file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .mode(0o600) // Owner read/write only
        .open(path)
        .map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => ShmError::AlreadyExists {
                name: display_name(path),
            },
            _ => ShmError::Io { source: e },
        })?;

    // A file left at zero length looks "not initialised" to attachers
    if let Err(e) = file.set_len(size as u64) {
        let _ = std::fs::remove_file(path);
        return Err(e.into());
    }

    let mut mmap_options = MmapOptions::new();
    if config.populate {
        mmap_options.populate();
    }

    // SAFETY: the file was just created with O_EXCL and sized; other
    // processes only access it through the synchronization objects.
    match unsafe { mmap_options.map_mut(&file) } {
        Ok(mmap) => Ok(mmap),
        Err(e) => {
            let _ = std::fs::remove_file(path);
            Err(e.into())
        }
    }
}

/// Map an existing file at its current length.
pub fn open_mapping(path: &Path) -> ShmResult<MmapMut> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => ShmError::NotFound {
                name: display_name(path),
            },
            _ => ShmError::Io { source: e },
        })?;

    // Created but not yet sized by its creator
    if file.metadata()?.len() == 0 {
        return Err(ShmError::NotFound {
            name: display_name(path),
        });
    }

    // SAFETY: see create_mapping.
    let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
    Ok(mmap)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Check if process is alive using kill(pid, 0)
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // Use a null signal (None) to test for process existence without sending a signal
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::Error::ESRCH) => false, // No such process
        Err(nix::Error::EPERM) => true,  // Process exists but no permission to signal
        Err(_) => false,
    }
}

/// Send `signal` to `pid`. A process that is already gone is not an error.
pub fn signal_process(pid: u32, signal: Signal) -> ShmResult<()> {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(nix::Error::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}

/// Convert an [`Instant`] deadline into an absolute CLOCK_MONOTONIC timespec
/// suitable for `pthread_cond_timedwait` on a condvar using that clock.
pub fn monotonic_deadline(deadline: Instant) -> ShmResult<libc::timespec> {
    let now = clock_gettime(ClockId::CLOCK_MONOTONIC)?;
    let remaining = deadline.saturating_duration_since(Instant::now());
    let abs = now + TimeSpec::from(remaining);
    Ok(*abs.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn create_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("excl");
        let cfg = LinuxMemoryConfig::default();

        let map = create_mapping(&path, 4096, &cfg).unwrap();
        assert_eq!(map.len(), 4096);
        assert!(matches!(
            create_mapping(&path, 4096, &cfg),
            Err(ShmError::AlreadyExists { name }) if name == "excl"
        ));
    }

    #[test]
    fn open_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            open_mapping(&dir.path().join("nope")),
            Err(ShmError::NotFound { .. })
        ));
    }

    #[test]
    fn mappings_share_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared");
        let mut a = create_mapping(&path, 64, &LinuxMemoryConfig { populate: true }).unwrap();
        let b = open_mapping(&path).unwrap();
        a[7] = 0xAB;
        assert_eq!(b[7], 0xAB);
    }

    #[test]
    fn own_process_is_alive() {
        assert!(is_process_alive(get_current_pid()));
        assert!(!is_process_alive(0));
    }

    #[test]
    fn deadline_in_the_past_does_not_underflow() {
        let ts = monotonic_deadline(Instant::now() - Duration::from_secs(1)).unwrap();
        assert!(ts.tv_nsec >= 0 && ts.tv_nsec < 1_000_000_000);
    }
}
