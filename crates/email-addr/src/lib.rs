//! Email address parsing and canonicalization.
//!
//! Splits an address into local part and domain, normalizes the local part
//! with NFKC, and canonicalizes the domain via UTS-46/IDNA to its ASCII
//! (punycode) form. The result is an immutable [`EmailAddress`] whose
//! `normalized` form is stable: parsing it again yields the same value.
use serde::Serialize;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Upper bound on the whole address, in bytes.
pub const MAX_ADDRESS_LENGTH: usize = 320;
/// Upper bound on the NFKC-normalized local part, in UTF-8 bytes.
pub const MAX_LOCAL_LENGTH: usize = 64;
/// Upper bound on the IDNA ASCII domain, in bytes.
pub const MAX_DOMAIN_LENGTH: usize = 255;
const MAX_LABEL_LENGTH: usize = 63;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddrError {
    #[error("invalid email syntax: {0}")]
    SyntaxInvalid(String),
    #[error("local part exceeds {MAX_LOCAL_LENGTH} bytes after normalization")]
    LocalTooLong,
    #[error("domain exceeds {MAX_DOMAIN_LENGTH} bytes in ASCII form")]
    DomainTooLong,
    #[error("local part contains invalid characters")]
    LocalChars,
    #[error("domain contains invalid characters: {0}")]
    DomainChars(String),
    #[error("invalid international domain name: {0}")]
    IdnaFailure(String),
}

/// A parsed, canonicalized email address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EmailAddress {
    local_part: String,
    domain_ascii: String,
    domain_unicode: String,
    normalized: String,
}

impl EmailAddress {
    /// Parse and canonicalize an address.
    pub fn parse(raw: &str) -> Result<Self, AddrError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AddrError::SyntaxInvalid("address is empty".to_string()));
        }
        if raw.len() > MAX_ADDRESS_LENGTH {
            return Err(AddrError::SyntaxInvalid(format!(
                "address exceeds {MAX_ADDRESS_LENGTH} bytes"
            )));
        }
        if raw.chars().any(|c| c.is_control()) {
            return Err(AddrError::SyntaxInvalid(
                "address contains control characters".to_string(),
            ));
        }

        if raw.chars().filter(|&c| c == '@').count() > 1 {
            return Err(AddrError::SyntaxInvalid(
                "address contains multiple @ signs".to_string(),
            ));
        }
        let (local_raw, domain_raw) = raw
            .rsplit_once('@')
            .ok_or_else(|| AddrError::SyntaxInvalid("address has no @ sign".to_string()))?;
        if local_raw.is_empty() {
            return Err(AddrError::SyntaxInvalid("local part is empty".to_string()));
        }
        if domain_raw.is_empty() {
            return Err(AddrError::SyntaxInvalid("domain is empty".to_string()));
        }

        let local_part = normalize_local_part(local_raw)?;
        let (domain_ascii, domain_unicode) = canonicalize_domain(domain_raw)?;

        let normalized = format!("{local_part}@{domain_ascii}");
        Ok(Self {
            local_part,
            domain_ascii,
            domain_unicode,
            normalized,
        })
    }

    pub fn local_part(&self) -> &str {
        &self.local_part
    }

    /// The domain in IDNA ASCII form, lowercased.
    pub fn domain(&self) -> &str {
        &self.domain_ascii
    }

    /// The domain in display (unicode) form.
    pub fn domain_unicode(&self) -> &str {
        &self.domain_unicode
    }

    /// The canonical `localpart@domain-ascii` form used as a cache key.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// True if the local part is surrounded by double quotes.
    pub fn is_quoted(&self) -> bool {
        self.local_part.starts_with('"')
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(&self.normalized)
    }
}

fn is_atext(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#'
                | '$'
                | '%'
                | '&'
                | '\''
                | '*'
                | '+'
                | '-'
                | '/'
                | '='
                | '?'
                | '^'
                | '_'
                | '`'
                | '{'
                | '|'
                | '}'
                | '~'
        )
        || c >= '\u{80}'
}

fn is_qtext(c: char) -> bool {
    matches!(c, '\x20'..='\x21' | '\x23'..='\x5B' | '\x5D'..='\x7E') || c >= '\u{80}'
}

fn normalize_local_part(raw: &str) -> Result<String, AddrError> {
    let local: String = raw.nfkc().collect();
    if local.len() > MAX_LOCAL_LENGTH {
        return Err(AddrError::LocalTooLong);
    }

    if local.starts_with('"') {
        // Quoted-string form. Needs the closing quote and at least one
        // character of content.
        if !local.ends_with('"') || local.len() < 3 {
            return Err(AddrError::LocalChars);
        }
        let mut chars = local[1..local.len() - 1].chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some(escaped) if (' '..='\x7E').contains(&escaped) => {}
                    _ => return Err(AddrError::LocalChars),
                }
            } else if !is_qtext(c) {
                return Err(AddrError::LocalChars);
            }
        }
        return Ok(local);
    }

    // Dot-atom form: atext runs separated by single interior dots.
    if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return Err(AddrError::LocalChars);
    }
    if !local.chars().all(|c| c == '.' || is_atext(c)) {
        return Err(AddrError::LocalChars);
    }

    Ok(local)
}

fn canonicalize_domain(raw: &str) -> Result<(String, String), AddrError> {
    let ascii = idna::domain_to_ascii(raw)
        .map_err(|err| AddrError::IdnaFailure(format!("{err}")))?;

    if ascii.is_empty() {
        return Err(AddrError::DomainChars("domain is empty".to_string()));
    }
    if ascii.len() > MAX_DOMAIN_LENGTH {
        return Err(AddrError::DomainTooLong);
    }

    let labels: Vec<&str> = ascii.split('.').collect();
    if labels.len() < 2 {
        return Err(AddrError::DomainChars(
            "domain must have at least two labels".to_string(),
        ));
    }
    for label in &labels {
        if label.is_empty() {
            return Err(AddrError::DomainChars("empty label".to_string()));
        }
        if label.len() > MAX_LABEL_LENGTH {
            return Err(AddrError::DomainChars(format!(
                "label `{label}` exceeds {MAX_LABEL_LENGTH} bytes"
            )));
        }
        let bytes = label.as_bytes();
        if !bytes[0].is_ascii_alphanumeric() || !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
            return Err(AddrError::DomainChars(format!(
                "label `{label}` must start and end with a letter or digit"
            )));
        }
        if !bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'-')
        {
            return Err(AddrError::DomainChars(format!(
                "label `{label}` contains invalid characters"
            )));
        }
    }

    let (unicode, _) = idna::domain_to_unicode(&ascii);
    Ok((ascii, unicode))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn simple_address() {
        let addr = EmailAddress::parse("user@example.com").unwrap();
        assert_eq!(addr.local_part(), "user");
        assert_eq!(addr.domain(), "example.com");
        assert_eq!(addr.normalized(), "user@example.com");
        assert!(!addr.is_quoted());
    }

    #[test]
    fn trims_whitespace_and_lowercases_domain() {
        let addr = EmailAddress::parse("  User.Name@EXAMPLE.COM ").unwrap();
        assert_eq!(addr.normalized(), "User.Name@example.com");
    }

    #[test]
    fn idna_domain() {
        let addr = EmailAddress::parse("user@bücher.example").unwrap();
        assert_eq!(addr.domain(), "xn--bcher-kva.example");
        assert_eq!(addr.domain_unicode(), "bücher.example");
    }

    #[test]
    fn idna_is_idempotent() {
        let addr = EmailAddress::parse("user@bücher.example").unwrap();
        let again = EmailAddress::parse(addr.normalized()).unwrap();
        assert_eq!(addr, again);
    }

    #[test]
    fn quoted_local_part() {
        let addr = EmailAddress::parse(r#""john smith"@example.com"#).unwrap();
        assert!(addr.is_quoted());
        let addr = EmailAddress::parse(r#""tab\	here"@example.com"#);
        assert!(addr.is_err(), "control chars rejected even when escaped-ish");
        assert!(EmailAddress::parse(r#""@example.com"#).is_err());
        assert!(EmailAddress::parse(r#""a\"b"@example.com"#).is_ok());
    }

    #[test]
    fn rejects_bad_shapes() {
        for bad in [
            "",
            "plain",
            "@example.com",
            "user@",
            "a@b@example.com",
            ".user@example.com",
            "user.@example.com",
            "us..er@example.com",
            "user name@example.com",
            "user@-bad.example.com",
            "user@bad-.example.com",
            "user@exa_mple.com",
            "user@example",
        ] {
            assert!(EmailAddress::parse(bad).is_err(), "expected reject: {bad}");
        }
    }

    #[test]
    fn local_length_boundary() {
        // 64 bytes exactly is accepted; 65 is not.
        let local64 = "a".repeat(64);
        assert!(EmailAddress::parse(&format!("{local64}@example.com")).is_ok());
        let local65 = "a".repeat(65);
        assert_eq!(
            EmailAddress::parse(&format!("{local65}@example.com")),
            Err(AddrError::LocalTooLong)
        );
    }

    #[test]
    fn local_length_measured_after_nfkc() {
        // ﬀ (U+FB00) is 3 bytes but normalizes to "ff" (2 bytes); 22
        // ligatures squeeze under the limit that the raw form exceeds.
        let local = "ﬀ".repeat(22);
        assert_eq!(local.len(), 66);
        let addr = EmailAddress::parse(&format!("{local}@example.com")).unwrap();
        assert_eq!(addr.local_part(), "ff".repeat(22));
    }

    #[test]
    fn label_length_boundary() {
        let label63 = "a".repeat(63);
        assert!(EmailAddress::parse(&format!("user@{label63}.com")).is_ok());
        let label64 = "a".repeat(64);
        assert!(EmailAddress::parse(&format!("user@{label64}.com")).is_err());
    }

    #[test]
    fn total_length_boundary() {
        let too_long = format!("{}@{}.example.com", "a".repeat(64), "b".repeat(260));
        assert!(too_long.len() > MAX_ADDRESS_LENGTH);
        assert!(matches!(
            EmailAddress::parse(&too_long),
            Err(AddrError::SyntaxInvalid(_))
        ));
    }

    #[test]
    fn normalize_is_idempotent() {
        for input in ["User@Example.COM", "weird.ﬀ@bücher.example"] {
            let once = EmailAddress::parse(input).unwrap();
            let twice = EmailAddress::parse(once.normalized()).unwrap();
            assert_eq!(once.normalized(), twice.normalized());
        }
    }
}
