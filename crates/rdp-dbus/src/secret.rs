use std::fmt;

use zeroize::Zeroize;

/// A string that is wiped on drop.
///
/// Used everywhere a plaintext password passes through this crate:
/// `AuthToken`, the NLA SAM file staging buffer, and PAM conversation
/// buffers. `Debug`/`Display` never print the contents.
#[derive(Clone, Default)]
pub struct Secret(String);

impl Secret {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Explicitly scrub the contents before the value is dropped, e.g. when
    /// the secret has been consumed and must not linger even briefly.
    pub fn clear(&mut self) {
        self.0.zeroize();
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_prints_contents() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "Secret(***)");
    }

    #[test]
    fn clear_scrubs_contents() {
        let mut secret = Secret::new("hunter2");
        secret.clear();
        assert_eq!(secret.expose(), "");
    }
}
