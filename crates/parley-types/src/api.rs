use serde::{Deserialize, Serialize};

// -- JWT Claims --

/// Claims carried by the bearer token presented at WebSocket upgrade.
/// Tokens are issued elsewhere on the platform; the gateway only consumes
/// `sub`. A token that verifies but has no subject is still rejected, so the
/// field is optional here rather than failing deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    pub exp: usize,
}

impl Claims {
    /// The subject identity, if present and non-empty.
    pub fn subject(&self) -> Option<&str> {
        self.sub.as_deref().filter(|s| !s.is_empty())
    }
}
