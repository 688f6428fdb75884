//! Version reported by `driver-manager --version` and logged at startup.

use std::sync::LazyLock;

use crate::build_info::BUILD_INFO;

const SHORT_SHA_LEN: usize = 12;

/// Driver manager image tag followed by the short commit, e.g. `v0.4.0-1a2b3c4d5e6f-dirty`.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    describe(
        env!("IMAGE_VERSION"),
        BUILD_INFO.commit_sha1,
        BUILD_INFO.git_dirty,
    )
});

fn describe(image_version: &str, commit_sha1: Option<&str>, git_dirty: bool) -> String {
    let commit = commit_sha1.map_or("unknown", |sha| &sha[..sha.len().min(SHORT_SHA_LEN)]);
    let dirty = if git_dirty { "-dirty" } else { "" };
    format!("{image_version}-{commit}{dirty}")
}
