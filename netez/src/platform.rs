//! Device profile: how a device dialect reports failures.
//!
//! RouterOS prints most command errors on stdout with a zero exit status,
//! so the executor needs the dialect's failure markers to tell a rejected
//! command from a successful one.

/// Failure markers for one device dialect.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    /// Profile name (e.g. "routeros").
    pub name: String,

    /// Stdout substrings that mean the command was rejected.
    pub failed_when_contains: Vec<String>,

    /// Rejection texts that mean the addressed item does not exist.
    pub not_found_when_contains: Vec<String>,

    /// Rejection texts that mean the item already exists.
    pub exists_when_contains: Vec<String>,
}

impl DeviceProfile {
    /// Create an empty profile.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failed_when_contains: vec![],
            not_found_when_contains: vec![],
            exists_when_contains: vec![],
        }
    }

    /// Add a failure pattern.
    pub fn with_failure_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.failed_when_contains.push(pattern.into());
        self
    }

    /// Add a not-found pattern. Also counts as a failure pattern.
    pub fn with_not_found_pattern(mut self, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        self.failed_when_contains.push(pattern.clone());
        self.not_found_when_contains.push(pattern);
        self
    }

    /// Add an already-exists pattern. Also counts as a failure pattern.
    pub fn with_exists_pattern(mut self, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        self.failed_when_contains.push(pattern.clone());
        self.exists_when_contains.push(pattern);
        self
    }

    /// First failure pattern found in the output.
    pub fn detect_failure(&self, output: &str) -> Option<&str> {
        self.failed_when_contains
            .iter()
            .find(|p| output.contains(p.as_str()))
            .map(String::as_str)
    }

    /// Whether a rejection text means "no such item".
    pub fn is_not_found(&self, message: &str) -> bool {
        self.not_found_when_contains
            .iter()
            .any(|p| message.contains(p.as_str()))
    }

    /// Whether a rejection text means "already exists".
    pub fn is_exists(&self, message: &str) -> bool {
        self.exists_when_contains
            .iter()
            .any(|p| message.contains(p.as_str()))
    }
}

impl Default for DeviceProfile {
    fn default() -> Self {
        routeros()
    }
}

/// Create the RouterOS profile.
pub fn routeros() -> DeviceProfile {
    DeviceProfile::new("routeros")
        .with_failure_pattern("failure:")
        .with_failure_pattern("syntax error")
        .with_failure_pattern("expected end of command")
        .with_failure_pattern("bad command name")
        .with_failure_pattern("invalid value for argument")
        .with_failure_pattern("ambiguous value of")
        .with_failure_pattern("missing value(s) of argument")
        .with_failure_pattern("value of address expects")
        .with_not_found_pattern("no such item")
        .with_not_found_pattern("input does not match any value of")
        .with_exists_pattern("already have")
        .with_exists_pattern("already exists")
}
