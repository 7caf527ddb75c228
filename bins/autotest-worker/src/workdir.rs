/// Working-Directory Manager - Per-Job File Trees
///
/// **Core Responsibility:**
/// Build the isolated directory a tester runs in and tear it down again.
///
/// **Permission Layout (group owner is always the worker identity):**
/// - job root: 1770
/// - student directories 0770, student files 0660
/// - harness directories 1770, harness files 0640
///
/// The sticky bit keeps one worker identity from deleting another's files
/// when both share a parent group.
///
/// **Harness Locking:**
/// Readers copy the harness tree under a shared `flock` on the harness
/// directory; `replace_harness` swaps it under an exclusive one. The lock is
/// released when the guard drops.

use crate::sandbox;
use anyhow::{anyhow, Context, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::unistd::{chown, Gid, Uid, User};
use std::fs::{self, File, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const ROOT_DIR_MODE: u32 = 0o1770;
const STUDENT_DIR_MODE: u32 = 0o770;
const STUDENT_FILE_MODE: u32 = 0o660;
const HARNESS_DIR_MODE: u32 = 0o1770;
const HARNESS_FILE_MODE: u32 = 0o640;

/// The OS account tester processes run as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
}

impl Identity {
    pub fn lookup(name: &str) -> Result<Self> {
        let user = User::from_name(name)
            .with_context(|| format!("Failed to look up user {}", name))?
            .ok_or_else(|| anyhow!("No such user: {}", name))?;
        Ok(Self {
            name: user.name,
            uid: user.uid,
            gid: user.gid,
        })
    }

    /// The identity this process runs as
    pub fn current() -> Result<Self> {
        let uid = Uid::effective();
        let name = User::from_uid(uid)?
            .map(|u| u.name)
            .unwrap_or_else(|| uid.to_string());
        Ok(Self {
            name,
            uid,
            gid: Gid::effective(),
        })
    }

    pub fn is_current(&self) -> bool {
        self.uid == Uid::effective()
    }
}

/// Scoped advisory lock on a harness directory
pub struct HarnessLock {
    _lock: Flock<File>,
}

impl HarnessLock {
    fn acquire(dir: &Path, arg: FlockArg) -> Result<Self> {
        let file = File::open(dir).with_context(|| format!("Failed to open {}", dir.display()))?;
        let lock = Flock::lock(file, arg)
            .map_err(|(_, errno)| anyhow!("flock on {} failed: {}", dir.display(), errno))?;
        Ok(Self { _lock: lock })
    }

    pub fn shared(dir: &Path) -> Result<Self> {
        Self::acquire(dir, FlockArg::LockShared)
    }

    pub fn exclusive(dir: &Path) -> Result<Self> {
        Self::acquire(dir, FlockArg::LockExclusive)
    }

    /// Exclusive lock without waiting; `None` while anyone else holds it
    pub fn try_exclusive(dir: &Path) -> Result<Option<Self>> {
        let file = File::open(dir).with_context(|| format!("Failed to open {}", dir.display()))?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(Self { _lock: lock })),
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(anyhow!("flock on {} failed: {}", dir.display(), errno)),
        }
    }
}

/// Pre-order listing of everything below `root`, not following symlinks
fn walk(root: &Path) -> io::Result<Vec<(PathBuf, bool)>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries: Vec<_> = fs::read_dir(&dir)?.collect::<io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries.into_iter().rev() {
            let is_dir = entry.file_type()?.is_dir();
            let path = entry.path();
            if is_dir {
                stack.push(path.clone());
            }
            out.push((path, is_dir));
        }
    }
    Ok(out)
}

fn apply_mode(path: &Path, mode: u32, gid: Gid) -> Result<()> {
    chown(path, None, Some(gid)).with_context(|| format!("Failed to chgrp {}", path.display()))?;
    fs::set_permissions(path, Permissions::from_mode(mode))
        .with_context(|| format!("Failed to chmod {}", path.display()))
}

fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Err(e) if e.raw_os_error() == Some(Errno::EXDEV as i32) => {
            fs::copy(src, dst)?;
            fs::remove_file(src)
        }
        other => other,
    }
}

/// Mirror the tree under `src` into `dst`. Files are moved or copied; the
/// returned list holds every created path with its directory flag.
fn transfer_tree(src: &Path, dst: &Path, move_files: bool) -> Result<Vec<(PathBuf, bool)>> {
    let mut created = Vec::new();
    for (path, is_dir) in walk(src).with_context(|| format!("Failed to list {}", src.display()))? {
        let rel = path.strip_prefix(src)?;
        let target = dst.join(rel);
        if is_dir {
            fs::create_dir_all(&target).with_context(|| format!("Failed to create {}", target.display()))?;
        } else if move_files {
            move_file(&path, &target).with_context(|| format!("Failed to move {}", path.display()))?;
        } else {
            fs::copy(&path, &target).with_context(|| format!("Failed to copy {}", path.display()))?;
        }
        created.push((target, is_dir));
    }
    Ok(created)
}

/// Populate `target_dir` with the student submission (moved) and the
/// harness files (copied), then fix up modes and group ownership.
///
/// Returns the student and harness file manifests as paths inside
/// `target_dir`.
pub fn setup_files(
    student_src: &Path,
    target_dir: &Path,
    identity: &Identity,
    harness_dir: &Path,
) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    fs::create_dir_all(target_dir).with_context(|| format!("Failed to create {}", target_dir.display()))?;
    apply_mode(target_dir, ROOT_DIR_MODE, identity.gid)?;

    let student = if student_src.is_dir() {
        transfer_tree(student_src, target_dir, true)?
    } else {
        Vec::new()
    };

    let harness = if harness_dir.is_dir() {
        let _lock = HarnessLock::shared(harness_dir)?;
        transfer_tree(harness_dir, target_dir, false)?
    } else {
        debug!(harness = %harness_dir.display(), "No harness files to copy");
        Vec::new()
    };

    for (path, is_dir) in &student {
        let mode = if *is_dir { STUDENT_DIR_MODE } else { STUDENT_FILE_MODE };
        apply_mode(path, mode, identity.gid)?;
    }
    for (path, is_dir) in &harness {
        let mode = if *is_dir { HARNESS_DIR_MODE } else { HARNESS_FILE_MODE };
        apply_mode(path, mode, identity.gid)?;
    }

    let files = |entries: Vec<(PathBuf, bool)>| -> Vec<PathBuf> {
        entries.into_iter().filter(|(_, d)| !d).map(|(p, _)| p).collect()
    };
    Ok((files(student), files(harness)))
}

/// Replace the contents of `harness_dir` with the tree under `new_src`.
///
/// Holds the exclusive lock for the whole swap, so no job ever copies a
/// half-written harness.
pub fn replace_harness(new_src: &Path, harness_dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(harness_dir).with_context(|| format!("Failed to create {}", harness_dir.display()))?;
    let _lock = HarnessLock::exclusive(harness_dir)?;

    for entry in fs::read_dir(harness_dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }

    let created = transfer_tree(new_src, harness_dir, false)?;
    Ok(created.into_iter().filter(|(_, d)| !d).map(|(p, _)| p).collect())
}

// Directories are opened up before they are listed, so unreadable ones are
// still reached.
fn normalise_permissions(dir: &Path) -> io::Result<()> {
    fs::set_permissions(dir, Permissions::from_mode(0o777))?;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            normalise_permissions(&path)?;
            continue;
        }
        let mode = entry.metadata()?.permissions().mode();
        let wanted = if mode & 0o111 != 0 { 0o777 } else { 0o666 };
        if let Err(e) = fs::set_permissions(&path, Permissions::from_mode(wanted)) {
            debug!(path = %path.display(), error = %e, "chmod failed");
        }
    }
    Ok(())
}

/// Remove a job working directory and everything in it.
///
/// Permissions are first normalised (sticky bits dropped, `ugo+rwX`) by the
/// worker identity itself, since only the owner may loosen them.
pub async fn clear_working_directory(dir: &Path, identity: &Identity) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    if identity.is_current() {
        let owned = dir.to_path_buf();
        tokio::task::spawn_blocking(move || normalise_permissions(&owned))
            .await?
            .with_context(|| format!("Failed to normalise permissions in {}", dir.display()))?;
    } else {
        let target = dir.to_string_lossy().to_string();
        for mode in ["-t", "ugo+rwX"] {
            let output = sandbox::run_as(identity, "chmod", &["-Rf", mode, &target]).await?;
            if !output.status.success() {
                warn!(
                    dir = %dir.display(),
                    user = %identity.name,
                    mode = mode,
                    "chmod as worker user reported failure"
                );
            }
        }
    }

    let owned = dir.to_path_buf();
    tokio::task::spawn_blocking(move || fs::remove_dir_all(&owned))
        .await?
        .with_context(|| format!("Failed to remove {}", dir.display()))?;
    debug!(dir = %dir.display(), "Working directory cleared");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o7777
    }

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_setup_files_moves_student_and_copies_harness() {
        let tmp = TempDir::new().unwrap();
        let student = tmp.path().join("student");
        let harness = tmp.path().join("harness");
        let target = tmp.path().join("job");
        write(&student.join("a.py"), "print(1)");
        write(&student.join("pkg/b.py"), "x = 2");
        write(&harness.join("test_a.py"), "def test(): pass");
        write(&harness.join("data/input.txt"), "42");

        let identity = Identity::current().unwrap();
        let (student_files, harness_files) = setup_files(&student, &target, &identity, &harness).unwrap();

        assert_eq!(student_files.len(), 2);
        assert_eq!(harness_files.len(), 2);
        assert!(!student.join("a.py").exists());
        assert!(harness.join("test_a.py").exists());
        assert_eq!(fs::read_to_string(target.join("pkg/b.py")).unwrap(), "x = 2");
        assert_eq!(fs::read_to_string(target.join("data/input.txt")).unwrap(), "42");

        assert_eq!(mode_of(&target), 0o1770);
        assert_eq!(mode_of(&target.join("pkg")), 0o770);
        assert_eq!(mode_of(&target.join("a.py")), 0o660);
        assert_eq!(mode_of(&target.join("data")), 0o1770);
        assert_eq!(mode_of(&target.join("test_a.py")), 0o640);
    }

    #[test]
    fn test_setup_files_without_harness() {
        let tmp = TempDir::new().unwrap();
        let student = tmp.path().join("student");
        write(&student.join("a.py"), "");
        let identity = Identity::current().unwrap();

        let (student_files, harness_files) =
            setup_files(&student, &tmp.path().join("job"), &identity, &tmp.path().join("missing")).unwrap();
        assert_eq!(student_files, vec![tmp.path().join("job/a.py")]);
        assert!(harness_files.is_empty());
    }

    #[test]
    fn test_replace_harness() {
        let tmp = TempDir::new().unwrap();
        let harness = tmp.path().join("harness");
        write(&harness.join("old.py"), "old");
        let fresh = tmp.path().join("fresh");
        write(&fresh.join("new.py"), "new");

        let files = replace_harness(&fresh, &harness).unwrap();
        assert_eq!(files, vec![harness.join("new.py")]);
        assert!(!harness.join("old.py").exists());
    }

    #[test]
    fn test_exclusive_lock_waits_for_readers() {
        let tmp = TempDir::new().unwrap();
        let reader_a = HarnessLock::shared(tmp.path()).unwrap();
        let _reader_b = HarnessLock::shared(tmp.path()).unwrap();
        assert!(HarnessLock::try_exclusive(tmp.path()).unwrap().is_none());
        drop(reader_a);
        drop(_reader_b);

        let writer = HarnessLock::try_exclusive(tmp.path()).unwrap();
        assert!(writer.is_some());
        assert!(HarnessLock::try_exclusive(tmp.path()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_missing_directory_is_noop() {
        let tmp = TempDir::new().unwrap();
        let identity = Identity::current().unwrap();
        let gone = tmp.path().join("never-created");
        clear_working_directory(&gone, &identity).await.unwrap();
        clear_working_directory(&gone, &identity).await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_removes_sticky_and_readonly_entries() {
        let tmp = TempDir::new().unwrap();
        let job = tmp.path().join("job");
        write(&job.join("normal.txt"), "n");
        write(&job.join("sticky/inner.txt"), "s");
        write(&job.join("locked/secret.txt"), "r");
        fs::set_permissions(job.join("sticky"), Permissions::from_mode(0o1770)).unwrap();
        fs::set_permissions(job.join("locked/secret.txt"), Permissions::from_mode(0o400)).unwrap();
        fs::set_permissions(job.join("locked"), Permissions::from_mode(0o500)).unwrap();
        fs::set_permissions(&job, Permissions::from_mode(0o1770)).unwrap();

        let identity = Identity::current().unwrap();
        clear_working_directory(&job, &identity).await.unwrap();
        assert!(!job.exists());
    }
}
