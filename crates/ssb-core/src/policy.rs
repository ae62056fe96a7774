use std::collections::HashSet;

/// Authorization decision for a parsed command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow {
        /// Run via `/bin/sh -c` instead of a direct argv spawn. Explicit
        /// per-executable opt-in from configuration, never a default.
        shell: bool,
    },
    Deny(String),
}

/// Default-deny executable allow-list.
///
/// This is a pre-filter only: the operating system's own authorization (e.g.
/// a sudoers allow-list) remains the authoritative boundary and must reject
/// anything this table omits or misconfigures.
#[derive(Clone, Debug)]
pub struct CommandPolicy {
    allowed: HashSet<String>,
    shell: HashSet<String>,
}

impl CommandPolicy {
    pub fn new(allowed: HashSet<String>, shell: HashSet<String>) -> Self {
        Self { allowed, shell }
    }

    /// The executable name is the first argv token, matched exactly against
    /// the configured set; unknown executables are denied.
    pub fn authorize(&self, authenticated: bool, argv: &[String]) -> Decision {
        if !authenticated {
            return Decision::Deny("not authenticated".to_string());
        }

        let Some(executable) = argv.first() else {
            return Decision::Deny("empty command".to_string());
        };

        if !self.allowed.contains(executable) {
            return Decision::Deny(format!("command not allowed: {executable}"));
        }

        Decision::Allow {
            shell: self.shell.contains(executable),
        }
    }
}
