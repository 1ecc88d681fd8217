//! Path sandbox: every caller-supplied path must resolve inside one of a
//! set of allowed base directories.
//!
//! Defaults are the storage directory, the user home, `/tmp`, and the
//! current working directory. [`Config::extra_allowed_dirs`] extends the
//! set. Inside a container, [`PathSandbox::with_mount_autodetect`] adds
//! real filesystem bind mounts discovered from `/proc/self/mountinfo`.

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{EngineError, ErrorCategory};

/// Filesystem types considered "real" bind-mounted storage, worth
/// auto-admitting into the sandbox inside a container.
const RECOGNIZED_FSTYPES: &[&str] = &[
    "ext4", "ext3", "ext2", "xfs", "btrfs", "zfs", "ntfs", "vfat", "fuse", "overlay", "nfs",
    "nfs4", "cifs", "9p", "drvfs", "virtiofs",
];

/// Mount points that are never admitted, even if their fstype matches.
const SYSTEM_PATH_PREFIXES: &[&str] = &[
    "/proc", "/sys", "/dev", "/etc", "/run", "/snap", "/var/lib/docker",
];

#[derive(Debug, Clone)]
pub struct PathSandbox {
    allowed_dirs: Vec<PathBuf>,
}

impl PathSandbox {
    /// Build the sandbox's default allowed-directory set: the storage
    /// directory, the user home, `/tmp`, the current working directory,
    /// plus any directories from [`Config::extra_allowed_dirs`].
    pub fn from_config(config: &Config) -> Result<Self, EngineError> {
        let mut dirs = vec![config.databases_path.clone(), PathBuf::from("/tmp")];

        if let Some(home) = dirs::home_dir() {
            dirs.push(home);
        }
        if let Ok(cwd) = std::env::current_dir() {
            dirs.push(cwd);
        }
        dirs.extend(config.extra_allowed_dirs.iter().cloned());

        Ok(PathSandbox { allowed_dirs: dirs })
    }

    /// Extend this sandbox with bind-mounted volumes auto-detected from
    /// the kernel mount table. Best-effort: an unreadable mount table
    /// silently leaves the sandbox unchanged, since this is an
    /// enhancement over the explicit defaults, not a requirement.
    pub fn with_mount_autodetect(mut self) -> Self {
        if let Ok(contents) = std::fs::read_to_string("/proc/self/mountinfo") {
            self.allowed_dirs.extend(parse_mountinfo(&contents));
        }
        self
    }

    /// Validate `path`: reject null bytes and Windows-style paths on a
    /// non-Windows host, then require it to resolve inside one of the
    /// allowed directories.
    pub fn validate(&self, path: &Path) -> Result<PathBuf, EngineError> {
        let raw = path.to_string_lossy();

        if raw.as_bytes().contains(&0) {
            return Err(EngineError::validation(
                "path contains a null byte".to_string(),
            ));
        }

        if !cfg!(windows) && looks_like_windows_path(&raw) {
            return Err(EngineError::validation(format!(
                "'{raw}' looks like a Windows path on a non-Windows host; use the container mount path instead"
            )));
        }

        let resolved = resolve_best_effort(path);

        if self
            .allowed_dirs
            .iter()
            .any(|base| resolved.starts_with(resolve_best_effort(base)))
        {
            Ok(resolved)
        } else {
            Err(EngineError::new(
                ErrorCategory::PermissionDenied,
                format!("'{raw}' falls outside every allowed base directory"),
            ))
        }
    }

    /// Require that `path` exists and is a directory, in addition to
    /// sandbox validation.
    pub fn validate_dir(&self, path: &Path) -> Result<PathBuf, EngineError> {
        let resolved = self.validate(path)?;
        if !resolved.exists() {
            return Err(EngineError::new(
                ErrorCategory::PathNotFound,
                format!("'{}' does not exist", resolved.display()),
            ));
        }
        if !resolved.is_dir() {
            return Err(EngineError::new(
                ErrorCategory::PathNotDirectory,
                format!("'{}' is not a directory", resolved.display()),
            ));
        }
        Ok(resolved)
    }

    #[cfg(test)]
    pub(crate) fn for_test(dirs: Vec<PathBuf>) -> Self {
        PathSandbox { allowed_dirs: dirs }
    }
}

fn looks_like_windows_path(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    let drive_letter = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    drive_letter || raw.starts_with(r"\\")
}

/// Resolve a path to an absolute, canonical form where possible, falling
/// back to a lexical absolute path when the path does not yet exist on
/// disk (canonicalize requires the path to exist).
fn resolve_best_effort(path: &Path) -> PathBuf {
    if let Ok(canon) = path.canonicalize() {
        return canon;
    }
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Parse `/proc/self/mountinfo` lines and return real mount points whose
/// fstype is recognized and whose path is not a system path.
///
/// Line format (see proc(5)): the mount point is field 5; the fstype
/// follows a literal `-` separator field.
fn parse_mountinfo(contents: &str) -> Vec<PathBuf> {
    contents
        .lines()
        .filter_map(|line| {
            let sep_pos = line.find(" - ")?;
            let (left, right) = line.split_at(sep_pos);
            let mount_point = left.split_whitespace().nth(4)?;
            let fstype = right.trim_start_matches(" - ").split_whitespace().next()?;

            if !RECOGNIZED_FSTYPES.contains(&fstype) {
                return None;
            }
            if SYSTEM_PATH_PREFIXES
                .iter()
                .any(|prefix| mount_point == *prefix || mount_point.starts_with(&format!("{prefix}/")))
            {
                return None;
            }
            if mount_point == "/" {
                return None;
            }
            Some(PathBuf::from(mount_point))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_null_bytes() {
        let sandbox = PathSandbox::for_test(vec![PathBuf::from("/tmp")]);
        let path = PathBuf::from("/tmp/foo\0bar");
        assert!(sandbox.validate(&path).is_err());
    }

    #[test]
    fn rejects_windows_paths_on_non_windows() {
        if cfg!(windows) {
            return;
        }
        let sandbox = PathSandbox::for_test(vec![PathBuf::from("/tmp")]);
        assert!(sandbox.validate(Path::new(r"C:\Users\me\file.txt")).is_err());
        assert!(sandbox.validate(Path::new(r"\\server\share\file.txt")).is_err());
    }

    #[test]
    fn accepts_paths_under_allowed_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = PathSandbox::for_test(vec![dir.path().to_path_buf()]);
        let file = dir.path().join("inside.txt");
        std::fs::write(&file, b"hi").unwrap();
        assert!(sandbox.validate(&file).is_ok());
    }

    #[test]
    fn rejects_paths_outside_allowed_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = PathSandbox::for_test(vec![dir.path().to_path_buf()]);
        assert!(sandbox.validate(Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn parse_mountinfo_filters_system_and_unrecognized() {
        let sample = "\
25 0 253:0 / / rw,relatime shared:1 - ext4 /dev/sda1 rw\n\
26 25 0:20 / /proc rw,nosuid - proc proc rw\n\
27 25 253:1 / /data rw,relatime shared:2 - ext4 /dev/sdb1 rw\n\
28 25 0:21 / /sys rw,nosuid - sysfs sysfs rw\n\
29 25 0:22 / /mnt/cifsshare rw - cifs //host/share rw\n";
        let mounts = parse_mountinfo(sample);
        assert!(mounts.contains(&PathBuf::from("/data")));
        assert!(mounts.contains(&PathBuf::from("/mnt/cifsshare")));
        assert!(!mounts.iter().any(|p| p == Path::new("/proc")));
        assert!(!mounts.iter().any(|p| p == Path::new("/sys")));
        assert!(!mounts.contains(&PathBuf::from("/")));
    }
}
