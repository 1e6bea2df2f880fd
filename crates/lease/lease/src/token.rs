use std::fmt;
use std::sync::OnceLock;

use uuid::Uuid;

/// Proof of one acquisition attempt, stored as the value of the lock key.
///
/// Tokens have the form `{instance}:{pid}:{uuid}` with a fresh v4 UUID per
/// attempt, so no two attempts ever share a token even within one process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HolderToken(String);

impl HolderToken {
    /// Generate a fresh token for an acquisition attempt by `instance`.
    pub fn generate(instance: &str) -> Self {
        Self(format!(
            "{instance}:{}:{}",
            std::process::id(),
            Uuid::new_v4()
        ))
    }

    /// Wrap a token obtained elsewhere, e.g. printed by a crashed holder.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HolderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for HolderToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Process-wide holder identity used when the caller does not supply one.
pub fn default_instance() -> &'static str {
    static INSTANCE: OnceLock<String> = OnceLock::new();
    INSTANCE.get_or_init(|| Uuid::now_v7().to_string())
}
