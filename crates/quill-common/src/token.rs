//! Credential normalization

/// Normalize a bot credential for use in REST and gateway handshakes
///
/// The service expects bot credentials prefixed with the `Bot ` scheme;
/// whatever the caller supplies is trimmed and prefixed unless already so.
#[must_use]
pub fn normalize_token(token: &str) -> String {
    let token = token.trim();
    if token.starts_with("Bot ") {
        token.to_string()
    } else {
        format!("Bot {token}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_token_gets_prefix() {
        assert_eq!(normalize_token("abc123"), "Bot abc123");
    }

    #[test]
    fn test_prefixed_token_unchanged() {
        assert_eq!(normalize_token("Bot abc123"), "Bot abc123");
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let once = normalize_token("  abc123 ");
        assert_eq!(normalize_token(&once), once);
        assert_eq!(once, "Bot abc123");
    }
}
