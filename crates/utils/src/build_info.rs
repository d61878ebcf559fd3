/// Git metadata captured by `build.rs`; absent when building outside a checkout.
pub(crate) struct BuildInfo {
    pub(crate) commit_sha1: Option<&'static str>,
    dirty: Option<&'static str>,
}

impl BuildInfo {
    pub(crate) fn git_dirty(&self) -> bool {
        self.dirty == Some("true")
    }
}

pub(crate) const BUILD_INFO: BuildInfo = BuildInfo {
    commit_sha1: option_env!("VERGEN_GIT_SHA"),
    dirty: option_env!("VERGEN_GIT_DIRTY"),
};
