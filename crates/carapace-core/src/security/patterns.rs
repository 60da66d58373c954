//! Credential pattern list for the Response Sanitizer (spec.md §4.6).

use regex::Regex;

/// One sanitizer pattern: on a match, the whole matched leaf value is
/// replaced (not just the matched substring), mirroring the existing
/// audit-check builder's `(id, name, pattern)` shape.
pub struct SanitizerPattern {
    pub id: &'static str,
    pub regex: Regex,
}

fn pattern(id: &'static str, raw: &str) -> SanitizerPattern {
    SanitizerPattern {
        id,
        regex: Regex::new(raw).unwrap_or_else(|e| panic!("invalid sanitizer pattern {id}: {e}")),
    }
}

/// Build the fixed pattern list (spec.md §4.6). Constructed fresh per
/// sanitizer instance; cheap relative to one process lifetime.
pub fn credential_patterns() -> Vec<SanitizerPattern> {
    vec![
        pattern("bearer-token", r"(?i)bearer\s+[A-Za-z0-9._~+/=-]{8,}"),
        pattern("github-token", r"gh[po]_[A-Za-z0-9_]{20,}"),
        pattern("github-pat", r"github_pat_[A-Za-z0-9_]{20,}"),
        pattern("stripe-live-key", r"sk_live_[A-Za-z0-9]{16,}"),
        pattern("stripe-test-pubkey", r"pk_test_[A-Za-z0-9]{16,}"),
        pattern("openai-style-key", r"sk-[A-Za-z0-9_-]{16,}"),
        pattern("aws-access-key-id", r"AKIA[0-9A-Z]{16}"),
        pattern(
            "db-uri-with-credentials",
            r"(?i)(postgres|mysql|mongodb(\+srv)?|redis)://[^:/\s]+:[^@/\s]+@\S+",
        ),
        pattern("x-api-key-header", r"(?i)x-api-key:\s*\S+"),
        pattern("api-key-form", r"(?i)\b(api_key|apikey)\s*=\s*\S+"),
        pattern(
            "pem-block",
            r"(?s)-----BEGIN [A-Z ]*PRIVATE KEY-----.*?-----END [A-Z ]*PRIVATE KEY-----",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_patterns_compile() {
        assert!(!credential_patterns().is_empty());
    }

    #[test]
    fn bearer_token_matches() {
        let patterns = credential_patterns();
        let bearer = patterns.iter().find(|p| p.id == "bearer-token").unwrap();
        assert!(bearer.regex.is_match("Authorization: Bearer abcDEF1234567890"));
    }

    #[test]
    fn db_uri_matches() {
        let patterns = credential_patterns();
        let uri = patterns
            .iter()
            .find(|p| p.id == "db-uri-with-credentials")
            .unwrap();
        assert!(uri.regex.is_match("postgres://u:pw@h/db"));
        assert!(!uri.regex.is_match("postgres://h/db"));
    }
}
