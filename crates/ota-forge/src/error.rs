use std::fmt;

/// Fixed reason tags attached to fatal failures. These are the short strings
/// reported to the metric sink, so they must stay stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    Config,
    Preflight,
    Key,
    Locator,
    Download,
    Checksum,
    Patch,
    Package,
    Upload,
    Io,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::Config => "config",
            Reason::Preflight => "preflight",
            Reason::Key => "key",
            Reason::Locator => "locator",
            Reason::Download => "download",
            Reason::Checksum => "checksum",
            Reason::Patch => "patch",
            Reason::Package => "package",
            Reason::Upload => "upload",
            Reason::Io => "io",
        }
    }
}

#[derive(Debug)]
pub struct Error {
    reason: Reason,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self {
            reason: Reason::Io,
            msg: msg.into(),
        }
    }

    pub fn tagged<M: Into<String>>(reason: Reason, msg: M) -> Self {
        Self {
            reason,
            msg: msg.into(),
        }
    }

    pub fn reason(&self) -> Reason {
        self.reason
    }

    /// Reclassify a helper failure at an orchestration boundary.
    pub fn with_reason(mut self, reason: Reason) -> Self {
        self.reason = reason;
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::tagged(Reason::Download, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
