use crate::secret::Secret;

/// Errors parsing a one-time handover auth token.
#[derive(Debug, thiserror::Error)]
pub enum AuthTokenError {
    #[error("missing [auth] section")]
    MissingAuthSection,
    #[error("missing username= line")]
    MissingUsername,
    #[error("missing password= line")]
    MissingPassword,
    #[error("username must not be empty")]
    EmptyUsername,
    #[error("password must not be empty")]
    EmptyPassword,
    #[error("unsupported token format: {0}")]
    UnsupportedFormat(u32),
}

/// The one-time credential blob passed to `StartHandover` (§6):
///
/// ```ini
/// [auth]
/// username=<string>
/// password=<string>
/// [meta]
/// format=1
/// ```
///
/// Parsed with a small hand-rolled line reader rather than a general INI
/// crate: the grammar is exactly two keys under two fixed section headers,
/// nothing else in this format will ever need a library.
pub struct AuthToken {
    pub username: String,
    password: Secret,
}

impl AuthToken {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Secret::new(password.into()),
        }
    }

    #[must_use]
    pub fn password(&self) -> &str {
        self.password.expose()
    }

    /// Zero the password before the token is discarded. `Drop` also does
    /// this; call explicitly at defined scrub points (§5) so the buffer
    /// doesn't linger until the next GC-equivalent (drop) point.
    pub fn secure_free(&mut self) {
        self.password.clear();
        self.username.clear();
    }

    /// Parse the `[auth]`/`[meta]` INI body described above.
    pub fn parse(body: &str) -> Result<Self, AuthTokenError> {
        let mut section = "";
        let mut username: Option<String> = None;
        let mut password: Option<String> = None;
        let mut format: u32 = 1;

        for raw_line in body.lines() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                section = match name {
                    "auth" => "auth",
                    "meta" => "meta",
                    _ => "",
                };
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match (section, key.trim()) {
                ("auth", "username") => username = Some(value.to_string()),
                ("auth", "password") => password = Some(value.to_string()),
                ("meta", "format") => {
                    format = value.trim().parse().unwrap_or(1);
                }
                _ => {}
            }
        }

        if username.is_none() && password.is_none() {
            return Err(AuthTokenError::MissingAuthSection);
        }
        if format != 1 {
            return Err(AuthTokenError::UnsupportedFormat(format));
        }

        let username = username.ok_or(AuthTokenError::MissingUsername)?;
        let password = password.ok_or(AuthTokenError::MissingPassword)?;
        if username.is_empty() {
            return Err(AuthTokenError::EmptyUsername);
        }
        if password.is_empty() {
            return Err(AuthTokenError::EmptyPassword);
        }

        Ok(Self { username, password: Secret::new(password) })
    }

    /// Serialize back to the wire grammar, e.g. to build the one-time token
    /// delivered alongside `RedirectClient`.
    #[must_use]
    pub fn to_ini(&self) -> String {
        format!(
            "[auth]\nusername={}\npassword={}\n[meta]\nformat=1\n",
            self.username,
            self.password.expose()
        )
    }
}

impl Drop for AuthToken {
    fn drop(&mut self) {
        self.secure_free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let token = AuthToken::new("alice", "pw");
        let ini = token.to_ini();
        let parsed = AuthToken::parse(&ini).unwrap();
        assert_eq!(parsed.username, "alice");
        assert_eq!(parsed.password(), "pw");
    }

    #[test]
    fn rejects_empty_username() {
        let err = AuthToken::parse("[auth]\nusername=\npassword=pw\n[meta]\nformat=1\n");
        assert!(matches!(err, Err(AuthTokenError::EmptyUsername)));
    }

    #[test]
    fn rejects_empty_password() {
        let err = AuthToken::parse("[auth]\nusername=alice\npassword=\n[meta]\nformat=1\n");
        assert!(matches!(err, Err(AuthTokenError::EmptyPassword)));
    }

    #[test]
    fn rejects_missing_section() {
        let err = AuthToken::parse("not an ini body");
        assert!(matches!(err, Err(AuthTokenError::MissingAuthSection)));
    }
}
