use serde::{Deserialize, Serialize};

/// Which checks to run for a request. Part of the verdict cache key:
/// the same address validated with different options is a different
/// decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationOptions {
    #[serde(default = "ValidationOptions::default_check_mx")]
    pub check_mx: bool,
    #[serde(default)]
    pub check_smtp: bool,
    #[serde(default)]
    pub smtp_from: Option<String>,
}

impl ValidationOptions {
    fn default_check_mx() -> bool {
        true
    }

    /// A compact stable encoding for cache keys.
    pub fn digest(&self) -> String {
        format!(
            "mx={}:smtp={}:from={}",
            u8::from(self.check_mx),
            u8::from(self.check_smtp),
            self.smtp_from.as_deref().unwrap_or("-")
        )
    }
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            check_mx: true,
            check_smtp: false,
            smtp_from: None,
        }
    }
}

/// The deepest stage that produced the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationType {
    Syntax,
    Mx,
    Smtp,
}

impl ValidationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Mx => "mx",
            Self::Smtp => "smtp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskStatus {
    Valid,
    Risky,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MxRecord {
    pub host: String,
    pub priority: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpCheck {
    pub mx_used: Option<String>,
    pub response: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationDetails {
    pub local_part: String,
    pub domain: String,
    pub normalized_email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mx_records: Option<Vec<MxRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp_check: Option<SmtpCheck>,
}

/// Risk signals and the additive 0-100 score derived from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskReport {
    pub score: u8,
    pub status: RiskStatus,
    pub disposable: bool,
    pub role_account: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typo_suggestion: Option<String>,
    pub catch_all: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_ptr: Option<bool>,
    pub spam_trap: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reputation: Option<u8>,
}

/// The full decision for one address. Cached by
/// `email_validation:<normalized>:<options digest>` and returned as a
/// fresh copy to each caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub email: String,
    pub is_valid: bool,
    pub validation_type: ValidationType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ValidationDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskReport>,
}

impl Verdict {
    pub fn cache_key(normalized: &str, options: &ValidationOptions) -> String {
        format!("email_validation:{normalized}:{}", options.digest())
    }

    pub fn invalid(
        email: &str,
        validation_type: ValidationType,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            email: email.to_string(),
            is_valid: false,
            validation_type,
            error_message: Some(error_message.into()),
            details: None,
            risk: None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn options_digest_distinguishes_requests() {
        let defaults = ValidationOptions::default();
        let with_smtp = ValidationOptions {
            check_smtp: true,
            ..ValidationOptions::default()
        };
        assert_ne!(defaults.digest(), with_smtp.digest());
        assert_eq!(
            Verdict::cache_key("user@example.com", &defaults),
            "email_validation:user@example.com:mx=1:smtp=0:from=-"
        );
    }

    #[test]
    fn verdict_round_trips_through_json() {
        let verdict = Verdict {
            email: "user@example.com".to_string(),
            is_valid: true,
            validation_type: ValidationType::Mx,
            error_message: None,
            details: Some(ValidationDetails {
                local_part: "user".to_string(),
                domain: "example.com".to_string(),
                normalized_email: "user@example.com".to_string(),
                mx_records: Some(vec![MxRecord {
                    host: "mx1.example.com".to_string(),
                    priority: 10,
                }]),
                smtp_check: None,
            }),
            risk: Some(RiskReport {
                score: 20,
                status: RiskStatus::Valid,
                disposable: false,
                role_account: false,
                typo_suggestion: None,
                catch_all: false,
                has_ptr: Some(true),
                spam_trap: false,
                reputation: None,
            }),
        };
        let json = serde_json::to_string(&verdict).unwrap();
        let parsed: Verdict = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, verdict);
    }

    #[test]
    fn validation_type_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ValidationType::Smtp).unwrap(),
            r#""smtp""#
        );
    }
}
