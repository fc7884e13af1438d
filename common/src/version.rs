// build version information reported by `prsync --version`

/// Version of the running binary
///
/// The semantic version always comes from Cargo.toml. Git information is captured by build.rs
/// and is absent when the crate was built outside of a git checkout (e.g. from crates.io).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildVersion {
    /// Semantic version from Cargo.toml (e.g., "0.4.0")
    pub semantic: String,

    /// Git describe output (e.g., "v0.3.1-7-g644da27"), optionally with a "-dirty" suffix
    pub git_describe: Option<String>,

    /// Full git commit hash
    pub git_hash: Option<String>,
}

impl BuildVersion {
    /// Get the version of this build
    pub fn current() -> Self {
        Self {
            semantic: env!("CARGO_PKG_VERSION").to_string(),
            git_describe: option_env!("PRSYNC_GIT_DESCRIBE").map(String::from),
            git_hash: option_env!("PRSYNC_GIT_HASH").map(String::from),
        }
    }

    /// Get a human-readable version string
    ///
    /// # Examples
    ///
    /// ```
    /// use common::version::BuildVersion;
    ///
    /// let v = BuildVersion {
    ///     semantic: "0.4.0".to_string(),
    ///     git_describe: Some("v0.3.1-7-g644da27".to_string()),
    ///     git_hash: None,
    /// };
    ///
    /// assert_eq!(v.display(), "0.4.0 (v0.3.1-7-g644da27)");
    /// ```
    pub fn display(&self) -> String {
        if let Some(ref git_describe) = self.git_describe {
            format!("{} ({})", self.semantic, git_describe)
        } else {
            self.semantic.clone()
        }
    }

    /// Multi-line version text including the commit hash when known
    pub fn long_display(&self) -> String {
        match self.git_hash {
            Some(ref hash) => format!("{}\ncommit: {}", self.display(), hash),
            None => self.display(),
        }
    }
}

impl std::fmt::Display for BuildVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

static LONG_VERSION: std::sync::LazyLock<String> =
    std::sync::LazyLock::new(|| BuildVersion::current().long_display());

/// Text for `--version` (clap needs a `'static` string)
pub fn long_version() -> &'static str {
    LONG_VERSION.as_str()
}
