//! Filesystem helpers shared by both endpoints
//!
//! Renames fall back to copy-then-unlink across devices. Copies create the
//! target write-only and chmod it readable only once the last byte is on
//! disk, so a polling consumer never sees partial data.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use filetime::FileTime;

const COPY_BUF: usize = 8192;

/// rw for user/group/other; the readable permission set for finished files
pub const READABLE_PERMS: u32 = 0o666;
/// write-only owner permission used while a file is being produced
pub const WRITING_PERMS: u32 = 0o200;

/// Create a directory including any missing path components. If the path
/// exists but is a plain file, the file is replaced by a directory.
pub fn make_dirs(path: &Path) -> Result<()> {
    match fs::metadata(path) {
        Ok(md) if md.is_dir() => Ok(()),
        Ok(_) => {
            fs::remove_file(path)
                .with_context(|| format!("unlink non-directory {}", path.display()))?;
            fs::create_dir_all(path).with_context(|| format!("mkdir {}", path.display()))
        }
        Err(_) => fs::create_dir_all(path).with_context(|| format!("mkdir {}", path.display())),
    }
}

/// Rename a file, recovering from a missing target directory and from
/// cross-device moves. Gives up when the same error repeats.
pub fn rename_file(source: &Path, target: &Path) -> Result<()> {
    let mut last_errno: Option<i32> = None;
    loop {
        let err = match fs::rename(source, target) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        let errno = err.raw_os_error();
        if errno.is_some() && errno == last_errno {
            return Err(err).with_context(|| {
                format!("rename {} to {}", source.display(), target.display())
            });
        }
        last_errno = errno;
        match errno {
            Some(libc::EXDEV) => {
                copy_file(source, target)?;
                // the copy landed; a stale source is not fatal
                let _ = fs::remove_file(source);
                return Ok(());
            }
            Some(libc::ENOENT) => {
                if let Some(parent) = target.parent() {
                    make_dirs(parent)?;
                } else {
                    return Err(err.into());
                }
            }
            _ => {
                return Err(err).with_context(|| {
                    format!("rename {} to {}", source.display(), target.display())
                });
            }
        }
    }
}

/// Copy a file. The target is created write-only and switched to the
/// readable permission set after the last byte, creating missing parent
/// directories as needed. The source mtime is carried over.
pub fn copy_file(source: &Path, target: &Path) -> Result<u64> {
    let mut input =
        File::open(source).with_context(|| format!("open {} for copy", source.display()))?;

    let mut output = match open_writeonly(target) {
        Ok(f) => f,
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
            if let Some(parent) = target.parent() {
                make_dirs(parent)?;
            }
            open_writeonly(target)
                .with_context(|| format!("open/create {} for writing", target.display()))?
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("open/create {} for writing", target.display()))
        }
    };

    let mut buf = [0u8; COPY_BUF];
    let mut total = 0u64;
    let copied = loop {
        let n = match input.read(&mut buf) {
            Ok(0) => break Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(e),
        };
        if let Err(e) = output.write_all(&buf[..n]) {
            break Err(e);
        }
        total += n as u64;
    };
    drop(output);

    if let Err(e) = copied {
        let _ = fs::remove_file(target);
        return Err(e).with_context(|| format!("copy {} to {}", source.display(), target.display()));
    }

    if let Ok(md) = fs::metadata(source) {
        let _ = filetime::set_file_mtime(target, FileTime::from_last_modification_time(&md));
    }
    fs::set_permissions(target, fs::Permissions::from_mode(READABLE_PERMS))
        .with_context(|| format!("change permissions of {}", target.display()))?;

    Ok(total)
}

fn open_writeonly(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(WRITING_PERMS)
        .open(path)
}

/// Flip a finished output file to the readable permission set.
pub fn make_readable(path: &Path) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(READABLE_PERMS))
        .with_context(|| format!("change permissions of {}", path.display()))
}

/// Local hostname, or "unknown".
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "unknown".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Pid file that is removed when dropped. The `PID_FILE` environment
/// variable overrides the requested path.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn write(path: &Path) -> Result<PidFile> {
        let path = match std::env::var_os("PID_FILE") {
            Some(p) => PathBuf::from(p),
            None => path.to_path_buf(),
        };
        let mut f =
            File::create(&path).with_context(|| format!("open pidfile {}", path.display()))?;
        writeln!(f, "{}", std::process::id())
            .with_context(|| format!("write pidfile {}", path.display()))?;
        Ok(PidFile { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn make_dirs_nested_and_idempotent() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("a/b/c");
        make_dirs(&dir).unwrap();
        assert!(dir.is_dir());
        make_dirs(&dir).unwrap();
    }

    #[test]
    fn make_dirs_replaces_plain_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("blocker");
        fs::write(&path, b"x").unwrap();
        make_dirs(&path).unwrap();
        assert!(path.is_dir());
    }

    #[test]
    fn rename_creates_missing_target_dir() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src.dat");
        fs::write(&src, b"payload").unwrap();
        let dst = tmp.path().join("deep/nested/dst.dat");
        rename_file(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"payload");
    }

    #[test]
    fn copy_sets_readable_perms_and_preserves_content() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src.dat");
        fs::write(&src, vec![7u8; 20_000]).unwrap();
        let dst = tmp.path().join("out/dst.dat");
        let n = copy_file(&src, &dst).unwrap();
        assert_eq!(n, 20_000);
        assert_eq!(fs::read(&dst).unwrap(), vec![7u8; 20_000]);
        let mode = fs::metadata(&dst).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, READABLE_PERMS);
    }

    #[test]
    fn copy_preserves_mtime() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src.dat");
        fs::write(&src, b"x").unwrap();
        let old = FileTime::from_unix_time(1_500_000_000, 0);
        filetime::set_file_mtime(&src, old).unwrap();
        let dst = tmp.path().join("dst.dat");
        copy_file(&src, &dst).unwrap();
        let md = fs::metadata(&dst).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&md).unix_seconds(), 1_500_000_000);
    }

    #[test]
    fn pidfile_removed_on_drop() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("prog.pid");
        {
            let pid = PidFile::write(&path).unwrap();
            assert!(pid.path().exists());
            let content = fs::read_to_string(pid.path()).unwrap();
            assert_eq!(content.trim(), std::process::id().to_string());
        }
        assert!(!path.exists());
    }

    #[test]
    fn hostname_is_nonempty() {
        assert!(!hostname().is_empty());
    }
}
