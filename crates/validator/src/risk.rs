//! I/O-free risk signals: disposable providers, role accounts, common
//! domain typos, spam traps and configured reputation scores.
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// Disposable providers known well enough to ship as a default.
/// `*.` entries match any subdomain.
const DEFAULT_DISPOSABLE: &str = "\
mailinator.com
*.mailinator.com
guerrillamail.com
guerrillamail.net
sharklasers.com
10minutemail.com
10minutemail.net
tempmail.com
temp-mail.org
tempmail.dev
throwawaymail.com
trashmail.com
*.trashmail.com
getnada.com
yopmail.com
*.yopmail.com
maildrop.cc
discard.email
fakeinbox.com
spamgourmet.com
mytemp.email
moakt.com
dispostable.com
mintemail.com
tempinbox.com
emailondeck.com";

const ROLE_LOCALS: &[&str] = &[
    "admin",
    "administrator",
    "webmaster",
    "hostmaster",
    "postmaster",
    "abuse",
    "support",
    "sales",
    "info",
    "contact",
    "help",
    "no-reply",
    "noreply",
    "marketing",
    "office",
    "hr",
    "jobs",
    "billing",
];

/// Frequently fat-fingered domains and what the sender probably meant.
const COMMON_TYPOS: &[(&str, &str)] = &[
    ("gmal.com", "gmail.com"),
    ("gmial.com", "gmail.com"),
    ("gmai.com", "gmail.com"),
    ("gamil.com", "gmail.com"),
    ("gmaill.com", "gmail.com"),
    ("yaho.com", "yahoo.com"),
    ("yahooo.com", "yahoo.com"),
    ("yaaho.com", "yahoo.com"),
    ("yhoo.com", "yahoo.com"),
    ("hotnail.com", "hotmail.com"),
    ("hotmal.com", "hotmail.com"),
    ("hotmai.com", "hotmail.com"),
    ("hotmial.com", "hotmail.com"),
    ("outlok.com", "outlook.com"),
    ("outloot.com", "outlook.com"),
    ("outlock.com", "outlook.com"),
    ("outlool.com", "outlook.com"),
];

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct RiskParams {
    /// Extra disposable domains, one per line, `*.` prefix for
    /// suffix patterns. Merged with the built-in list.
    #[serde(default)]
    pub disposable_file: Option<PathBuf>,
    /// Known spam-trap addresses, one per line.
    #[serde(default)]
    pub spam_trap_file: Option<PathBuf>,
    /// Additional role-account local parts beyond the built-in set.
    #[serde(default)]
    pub role_patterns: Vec<String>,
    /// Optional per-domain reputation scores (0-100, higher is better).
    #[serde(default)]
    pub reputation: HashMap<String, u8>,
}

pub struct RiskEngine {
    disposable_exact: HashSet<String>,
    disposable_suffixes: Vec<String>,
    role_patterns: RegexSet,
    typo_table: HashMap<&'static str, &'static str>,
    spam_traps: HashSet<String>,
    reputation: HashMap<String, u8>,
}

impl RiskEngine {
    pub fn new(params: &RiskParams) -> anyhow::Result<Self> {
        let mut disposable_exact = HashSet::new();
        let mut disposable_suffixes = vec![];
        let mut load_disposable = |text: &str| {
            for line in text.lines() {
                let line = line.trim().to_ascii_lowercase();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                match line.strip_prefix("*.") {
                    Some(suffix) => disposable_suffixes.push(format!(".{suffix}")),
                    None => {
                        disposable_exact.insert(line);
                    }
                }
            }
        };
        load_disposable(DEFAULT_DISPOSABLE);
        if let Some(path) = &params.disposable_file {
            let text = std::fs::read_to_string(path).map_err(|err| {
                anyhow::anyhow!("reading disposable domains from {}: {err}", path.display())
            })?;
            load_disposable(&text);
        }

        let mut spam_traps = HashSet::new();
        if let Some(path) = &params.spam_trap_file {
            let text = std::fs::read_to_string(path).map_err(|err| {
                anyhow::anyhow!("reading spam traps from {}: {err}", path.display())
            })?;
            for line in text.lines() {
                let line = line.trim().to_ascii_lowercase();
                if !line.is_empty() {
                    spam_traps.insert(line);
                }
            }
            tracing::info!("loaded {} known spam trap addresses", spam_traps.len());
        }

        let patterns: Vec<String> = ROLE_LOCALS
            .iter()
            .map(|local| format!("^{}$", regex::escape(local)))
            .chain(params.role_patterns.iter().map(|p| {
                if p.starts_with('^') {
                    p.clone()
                } else {
                    format!("^{p}$")
                }
            }))
            .collect();
        let role_patterns = RegexSet::new(&patterns)
            .map_err(|err| anyhow::anyhow!("compiling role account patterns: {err}"))?;

        Ok(Self {
            disposable_exact,
            disposable_suffixes,
            role_patterns,
            typo_table: COMMON_TYPOS.iter().copied().collect(),
            spam_traps,
            reputation: params
                .reputation
                .iter()
                .map(|(domain, score)| (domain.to_ascii_lowercase(), *score))
                .collect(),
        })
    }

    /// Exact disposable-provider match, or a `*.suffix` pattern match.
    pub fn is_disposable(&self, domain: &str) -> bool {
        let domain = domain.to_ascii_lowercase();
        if self.disposable_exact.contains(&domain) {
            return true;
        }
        self.disposable_suffixes
            .iter()
            .any(|suffix| domain.ends_with(suffix.as_str()))
    }

    pub fn is_role_account(&self, local_part: &str) -> bool {
        self.role_patterns
            .is_match(&local_part.to_ascii_lowercase())
    }

    pub fn typo_suggestion(&self, domain: &str) -> Option<String> {
        self.typo_table
            .get(domain.to_ascii_lowercase().as_str())
            .map(|fixed| fixed.to_string())
    }

    pub fn is_spam_trap(&self, normalized_email: &str) -> bool {
        self.spam_traps
            .contains(&normalized_email.to_ascii_lowercase())
    }

    pub fn reputation(&self, domain: &str) -> Option<u8> {
        self.reputation
            .get(domain.to_ascii_lowercase().as_str())
            .copied()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn engine() -> RiskEngine {
        RiskEngine::new(&RiskParams::default()).unwrap()
    }

    #[test]
    fn disposable_exact_and_suffix() {
        let engine = engine();
        assert!(engine.is_disposable("mailinator.com"));
        assert!(engine.is_disposable("anything.mailinator.com"));
        assert!(engine.is_disposable("YOPMAIL.com"));
        assert!(!engine.is_disposable("example.com"));
        // suffix patterns must not match the bare middle of a name
        assert!(!engine.is_disposable("notmailinator.org"));
    }

    #[test]
    fn role_accounts() {
        let engine = engine();
        for local in ["admin", "postmaster", "no-reply", "Billing"] {
            assert!(engine.is_role_account(local), "{local} is a role account");
        }
        assert!(!engine.is_role_account("alice"));
        assert!(!engine.is_role_account("administrate"));
    }

    #[test]
    fn custom_role_patterns() {
        let engine = RiskEngine::new(&RiskParams {
            role_patterns: vec!["security.*".to_string()],
            ..RiskParams::default()
        })
        .unwrap();
        assert!(engine.is_role_account("security-team"));
        assert!(!engine.is_role_account("insecurity"));
    }

    #[test]
    fn typo_suggestions() {
        let engine = engine();
        assert_eq!(
            engine.typo_suggestion("gmal.com"),
            Some("gmail.com".to_string())
        );
        assert_eq!(engine.typo_suggestion("gmail.com"), None);
    }

    #[test]
    fn reputation_lookup() {
        let mut reputation = HashMap::new();
        reputation.insert("Shady.Example".to_string(), 20u8);
        let engine = RiskEngine::new(&RiskParams {
            reputation,
            ..RiskParams::default()
        })
        .unwrap();
        assert_eq!(engine.reputation("shady.example"), Some(20));
        assert_eq!(engine.reputation("example.com"), None);
    }
}
