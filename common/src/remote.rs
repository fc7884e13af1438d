//! Remote endpoint that all transfers target

/// SSH destination of a sync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl Remote {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
        }
    }

    /// `user@host`
    pub fn address(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Remote shell passed to the transfer tool with `-e`.
    pub fn ssh_command(&self) -> String {
        format!("ssh -p {}", self.port)
    }

    /// Transfer target for a remote directory: `user@host:<dir>/`.
    ///
    /// The trailing slash makes the transfer tool treat `dir` as a directory to copy into.
    pub fn target(&self, dir: &std::path::Path) -> std::ffi::OsString {
        target(&self.address(), dir)
    }
}

/// `address:<dir>/` for an already formatted `user@host` address.
pub fn target(address: &str, dir: &std::path::Path) -> std::ffi::OsString {
    let mut target = std::ffi::OsString::from(format!("{address}:"));
    target.push(dir.as_os_str());
    if !dir.as_os_str().as_encoded_bytes().ends_with(b"/") {
        target.push("/");
    }
    target
}

impl std::fmt::Display for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address(), self.port)
    }
}
