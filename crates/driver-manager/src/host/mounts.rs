//! Recursive unmount of the driver root filesystem.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::info;
use tracing::warn;

use crate::host::HostError;

/// Mount points listed in a `/proc/<pid>/mountinfo` file.
pub fn parse_mountinfo(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape(field)))
        .collect()
}

/// Undoes the kernel's octal escaping of whitespace and backslashes.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or_default();
            if let Ok(value) = u8::from_str_radix(digits, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Mount points at or below `root`, deepest first.
pub fn mounts_under(mount_points: Vec<PathBuf>, root: &Path) -> Vec<PathBuf> {
    let mut under: Vec<PathBuf> = mount_points
        .into_iter()
        .filter(|mount_point| mount_point.starts_with(root))
        .collect();
    under.sort_by_key(|mount_point| std::cmp::Reverse(mount_point.components().count()));
    under.dedup();
    under
}

fn unmount(path: &Path) -> io::Result<()> {
    let target = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let rc = unsafe { libc::umount2(target.as_ptr(), libc::MNT_DETACH) };
    if rc == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    // EINVAL: not a mount point anymore
    if err.raw_os_error() == Some(libc::EINVAL) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Unmounts `root` and every filesystem mounted below it.
///
/// A missing `root` is not an error. Failures on submounts are logged; only
/// a failure to unmount `root` itself is returned.
#[tracing::instrument(skip(mountinfo))]
pub async fn recursive_unmount(root: &Path, mountinfo: &Path) -> Result<(), Report<HostError>> {
    if !tokio::fs::try_exists(root).await.unwrap_or(false) {
        info!("Driver root directory does not exist, nothing to unmount");
        return Ok(());
    }

    let content = tokio::fs::read_to_string(mountinfo)
        .await
        .change_context(HostError::ReadFailed {
            path: mountinfo.display().to_string(),
        })?;

    for mount_point in mounts_under(parse_mountinfo(&content), root) {
        match unmount(&mount_point) {
            Ok(()) => info!(mount_point = %mount_point.display(), "Unmounted"),
            Err(e) if mount_point == root => {
                return Err(Report::new(e).change_context(HostError::UnmountFailed {
                    path: root.display().to_string(),
                }));
            }
            Err(e) => {
                warn!(mount_point = %mount_point.display(), "Failed to unmount: {e}");
            }
        }
    }

    info!("Successfully unmounted {} and all its submounts", root.display());
    Ok(())
}
