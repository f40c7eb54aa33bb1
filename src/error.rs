use std::path::PathBuf;
use thiserror::Error;

/// Error types for passthrough preflight checks and hypervisor queries.
///
/// This enum covers every condition that stops the tool from producing a
/// verdict: missing or unparsable pseudo-files, environmental preconditions
/// that need operator action, diagnosis branches that are recognised but not
/// implemented, and failures talking to the hypervisor.
///
/// # Error Categories
///
/// ## Host Fact Collection
/// - [`Collection`](PreflightError::Collection): a pseudo-file could not be read
/// - [`Parse`](PreflightError::Parse): a pseudo-file was read but made no sense
///
/// ## Environment
/// - [`EnvironmentFatal`](PreflightError::EnvironmentFatal): an unrecoverable
///   precondition (sysfs mount, no capable socket). Carries remediation text.
/// - [`UnsupportedPath`](PreflightError::UnsupportedPath): a diagnosis branch
///   that cannot be diagnosed yet
///
/// ## Hypervisor
/// - [`Connection`](PreflightError::Connection): endpoint unreachable or refused
/// - [`NotFound`](PreflightError::NotFound): no domain with the requested name
/// - [`Xml`](PreflightError::Xml): the domain description is not valid XML
///
/// Advisory conditions such as an old kernel are not errors. They are
/// reported as `Warn` events and the run continues.
#[derive(Error, Debug)]
pub enum PreflightError {
    /// A required pseudo-file is missing or unreadable.
    ///
    /// # Common Causes
    /// - `/proc` not mounted (containers, chroots)
    /// - Running against a `--root` tree that lacks the file
    #[error("cannot read {}: {source}", path.display())]
    Collection {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A pseudo-file was read but its content could not be interpreted.
    #[error("cannot parse {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    /// An environmental precondition failed and the run was aborted.
    ///
    /// `hint` holds the concrete remediation (a mount command, a kernel
    /// parameter). `socket` is set when the failure is attributed to a CPU
    /// socket.
    #[error("{message} ({hint})")]
    EnvironmentFatal {
        message: String,
        hint: String,
        socket: Option<usize>,
    },

    /// A recognised diagnosis branch that is not diagnosable yet.
    ///
    /// Surfaced explicitly so the condition is never reported as healthy.
    #[error("not yet diagnosable: {0}")]
    UnsupportedPath(String),

    /// The hypervisor endpoint could not be reached or refused the session.
    ///
    /// # Troubleshooting
    /// - Check the daemon: `systemctl status libvirtd`
    /// - Check group membership: `groups $USER` (should include libvirt)
    /// - Check the URI passed with `--connect`
    #[error("hypervisor connection failed: {0}")]
    Connection(String),

    /// No domain with the requested name exists.
    #[error("domain not found: {0}")]
    NotFound(String),

    #[error("invalid domain XML: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("JSON Error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PreflightError {
    /// True for errors raised by a failed environmental precondition, as
    /// opposed to errors reading facts or talking to the hypervisor.
    pub fn is_environment_fatal(&self) -> bool {
        matches!(self, PreflightError::EnvironmentFatal { .. })
    }
}

pub type Result<T> = std::result::Result<T, PreflightError>;
