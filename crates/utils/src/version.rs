use std::sync::LazyLock;

use crate::build_info::BUILD_INFO;

/// Defines the application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    let sha = BUILD_INFO.commit_sha1.unwrap_or("unknown");
    format!(
        "{}-{}{}",
        env!("IMAGE_VERSION"),
        sha.get(..12).unwrap_or(sha),
        if BUILD_INFO.git_dirty() { "-dirty" } else { "" }
    )
});
