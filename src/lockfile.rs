//! Single-instance lock next to the config file.
//!
//! The lock file (`<config>.lock`) records the pid of the running supervisor.
//! A lock whose owner is gone is stale and simply replaced.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct LockContents {
    pid: u32,
}

/// A held lock; the file is removed when this is dropped.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

/// Outcome of trying to take the lock.
#[derive(Debug)]
pub enum Acquire {
    Acquired(InstanceLock),
    /// Another live process holds the lock.
    Held { pid: u32 },
}

pub fn lock_path(config: &Path) -> PathBuf {
    let mut name = config.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

/// Takes the lock for `config` unless a live process holds it.
pub fn try_acquire(config: &Path) -> Result<Acquire> {
    let path = lock_path(config);
    if let Some(pid) = read_owner(&path) {
        if pid != std::process::id() && is_alive(pid) {
            return Ok(Acquire::Held { pid });
        }
        tracing::info!(pid, path = %path.display(), "replacing stale lock");
    }
    write_lock(&path).map(Acquire::Acquired)
}

/// Terminates the current owner and takes the lock over.
pub async fn take_over(config: &Path, pid: u32) -> Result<InstanceLock> {
    tracing::warn!(pid, "terminating previous instance");
    terminate(pid);
    for _ in 0..50 {
        if !is_alive(pid) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    write_lock(&lock_path(config))
}

fn read_owner(path: &Path) -> Option<u32> {
    let raw = std::fs::read_to_string(path).ok()?;
    let contents: LockContents = toml::from_str(&raw).ok()?;
    Some(contents.pid)
}

fn write_lock(path: &Path) -> Result<InstanceLock> {
    let contents = toml::to_string(&LockContents {
        pid: std::process::id(),
    })?;
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write lock file {}", path.display()))?;
    Ok(InstanceLock {
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
impl InstanceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if read_owner(&self.path) == Some(std::process::id()) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(unix)]
fn is_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks for existence; EPERM still means alive.
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
fn is_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle == 0 {
            return false;
        }
        let mut code = 0u32;
        let ok = GetExitCodeProcess(handle, &mut code);
        CloseHandle(handle);
        ok != 0 && code == STILL_ACTIVE as u32
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    if let Ok(pid) = i32::try_from(pid) {
        unsafe {
            let _ = libc::kill(pid, libc::SIGTERM);
        }
    }
}

#[cfg(windows)]
fn terminate(pid: u32) {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};
    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle != 0 {
            let _ = TerminateProcess(handle, 1);
            CloseHandle(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_config() -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!("procrack-lock-{}-{}.toml", std::process::id(), n))
    }

    #[test]
    fn lock_path_appends_suffix() {
        assert_eq!(
            lock_path(Path::new("dir/procrack.toml")),
            PathBuf::from("dir/procrack.toml.lock")
        );
    }

    #[test]
    fn acquires_and_releases() {
        let config = temp_config();
        let lock = match try_acquire(&config).unwrap() {
            Acquire::Acquired(lock) => lock,
            Acquire::Held { pid } => panic!("unexpectedly held by {pid}"),
        };
        assert_eq!(read_owner(lock.path()), Some(std::process::id()));
        let path = lock.path().to_path_buf();
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn stale_lock_is_replaced() {
        let config = temp_config();
        let path = lock_path(&config);
        // Pids are capped well below this on every supported platform.
        std::fs::write(&path, "pid = 2147483000\n").unwrap();
        match try_acquire(&config).unwrap() {
            Acquire::Acquired(lock) => assert_eq!(read_owner(lock.path()), Some(std::process::id())),
            Acquire::Held { pid } => panic!("stale lock held by {pid}"),
        }
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn live_owner_holds_lock() {
        let config = temp_config();
        let path = lock_path(&config);
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        std::fs::write(&path, format!("pid = {}\n", child.id())).unwrap();
        let result = try_acquire(&config).unwrap();
        let _ = child.kill();
        let _ = child.wait();
        let _ = std::fs::remove_file(&path);
        assert!(matches!(result, Acquire::Held { pid } if pid == child.id()));
    }

    #[test]
    fn garbage_lock_is_treated_as_stale() {
        let config = temp_config();
        let path = lock_path(&config);
        std::fs::write(&path, "not toml at all [").unwrap();
        let acquired = matches!(try_acquire(&config).unwrap(), Acquire::Acquired(_));
        assert!(acquired);
        assert!(!path.exists());
    }
}
