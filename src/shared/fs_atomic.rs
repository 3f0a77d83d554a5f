use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static STAGING_SEQUENCE: AtomicU64 = AtomicU64::new(0);

// Writers stage next to the destination so the final rename never crosses a
// filesystem boundary. A failed write leaves no staging file behind.
pub fn atomic_write_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent"))?;
    fs::create_dir_all(parent)?;

    let staging = staging_path(path)?;
    let write_result = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&staging)
        .and_then(|mut file| {
            file.write_all(content)?;
            file.sync_data()
        });
    if let Err(err) = write_result {
        let _ = fs::remove_file(&staging);
        return Err(err);
    }

    if let Err(err) = fs::rename(&staging, path) {
        let _ = fs::remove_file(&staging);
        return Err(err);
    }
    flush_directory(parent)
}

fn staging_path(path: &Path) -> std::io::Result<PathBuf> {
    let name = path
        .file_name()
        .and_then(|v| v.to_str())
        .ok_or_else(|| std::io::Error::other("path has no utf-8 file name"))?;
    let sequence = STAGING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    Ok(path.with_file_name(format!("{name}.{}-{sequence}.wip", std::process::id())))
}

// The rename is only durable once the directory entry itself is flushed.
#[cfg(unix)]
fn flush_directory(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn flush_directory(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquisition {
    Acquired,
    Held { pid: u32 },
}

pub fn acquire_pid_lock(path: &Path) -> std::io::Result<LockAcquisition> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    match try_create_lock(path) {
        Ok(()) => Ok(LockAcquisition::Acquired),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            match read_lock_pid(path)? {
                Some(pid) if is_process_alive(pid) => Ok(LockAcquisition::Held { pid }),
                _ => {
                    // Stale lock from a dead process; reclaim it.
                    fs::remove_file(path)?;
                    match try_create_lock(path) {
                        Ok(()) => Ok(LockAcquisition::Acquired),
                        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                            match read_lock_pid(path)? {
                                Some(pid) => Ok(LockAcquisition::Held { pid }),
                                None => Ok(LockAcquisition::Held { pid: 0 }),
                            }
                        }
                        Err(err) => Err(err),
                    }
                }
            }
        }
        Err(err) => Err(err),
    }
}

pub fn release_pid_lock(path: &Path) {
    let _ = fs::remove_file(path);
}

fn try_create_lock(path: &Path) -> std::io::Result<()> {
    fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .and_then(|mut file| file.write_all(std::process::id().to_string().as_bytes()))
}

fn read_lock_pid(path: &Path) -> std::io::Result<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(raw.trim().parse::<u32>().ok()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(target_os = "linux")]
pub fn is_process_alive(pid: u32) -> bool {
    pid != 0 && Path::new("/proc").join(pid.to_string()).is_dir()
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_creates_parent_and_replaces_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested/state.json");
        atomic_write_file(&path, b"first").expect("write");
        atomic_write_file(&path, b"second").expect("rewrite");
        assert_eq!(fs::read(&path).expect("read"), b"second");
    }

    #[test]
    fn successful_writes_leave_no_staging_files_behind() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        atomic_write_file(&path, b"payload").expect("write");
        let leftovers: Vec<String> = fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(".wip"))
            .collect();
        assert!(leftovers.is_empty(), "staging leftovers: {leftovers:?}");
    }

    #[test]
    fn concurrent_style_staging_names_never_collide() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        let first = staging_path(&path).expect("first");
        let second = staging_path(&path).expect("second");
        assert_ne!(first, second);
    }

    #[test]
    fn pid_lock_blocks_second_acquire_from_live_process() {
        let dir = tempdir().expect("tempdir");
        let lock = dir.path().join("run.lock");
        assert_eq!(
            acquire_pid_lock(&lock).expect("acquire"),
            LockAcquisition::Acquired
        );
        match acquire_pid_lock(&lock).expect("second acquire") {
            LockAcquisition::Held { pid } => assert_eq!(pid, std::process::id()),
            LockAcquisition::Acquired => panic!("lock should be held"),
        }
        release_pid_lock(&lock);
        assert_eq!(
            acquire_pid_lock(&lock).expect("reacquire"),
            LockAcquisition::Acquired
        );
    }

    #[test]
    fn pid_lock_reclaims_stale_entry() {
        let dir = tempdir().expect("tempdir");
        let lock = dir.path().join("run.lock");
        fs::write(&lock, "4294967294").expect("seed stale pid");
        assert_eq!(
            acquire_pid_lock(&lock).expect("acquire"),
            LockAcquisition::Acquired
        );
    }
}
