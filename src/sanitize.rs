use once_cell::sync::Lazy;
use regex::Regex;

static SENSITIVE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(password|passphrase|secret|token|key)\s*[:=]\s*[^\s,;]+")
        .expect("valid redaction regex")
});

/// Redacts `name=value` and `name: value` pairs whose name looks sensitive.
pub fn sanitize_for_display(message: &str) -> String {
    SENSITIVE_PATTERN
        .replace_all(message, "$1=[REDACTED]")
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_password() {
        let message = "Failed to authenticate: password=secret123";
        assert_eq!(
            sanitize_for_display(message),
            "Failed to authenticate: password=[REDACTED]"
        );
    }

    #[test]
    fn test_sanitize_key_with_colon() {
        let message = "private key: abcdef1234567890 rejected";
        assert_eq!(sanitize_for_display(message), "private key=[REDACTED] rejected");
    }

    #[test]
    fn test_sanitize_multiple_secrets() {
        let message = "passphrase=admin, token = t0k3n";
        assert_eq!(
            sanitize_for_display(message),
            "passphrase=[REDACTED], token=[REDACTED]"
        );
    }

    #[test]
    fn test_sanitize_preserves_prose() {
        let message = "public key does not match key type ed25519";
        assert_eq!(sanitize_for_display(message), message);
    }

    #[test]
    fn test_sanitize_case_insensitive() {
        let message = "PASSWORD=admin and Secret:mysecret";
        assert_eq!(
            sanitize_for_display(message),
            "PASSWORD=[REDACTED] and Secret=[REDACTED]"
        );
    }
}
