//! Secret redaction for messages that reach logs or artifacts.
//!
//! A [`Redactor`] is built from the resolved step configuration of a run.
//! Values stored under secret-named keys are replaced literally, and a
//! fixed set of patterns catches credential-shaped text that never went
//! through configuration (connection strings, bearer tokens, access keys).

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::manifest::StepConfig;

/// Replacement text for every redacted value.
pub const REDACTED: &str = "[REDACTED]";

/// Literal values shorter than this are not redacted on their own.
const MIN_SECRET_LEN: usize = 4;

static SECRET_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|secret|token|api[_-]?key|credential|private[_-]?key)")
        .expect("secret key pattern is valid")
});

static KEY_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(password|passwd|pwd|secret|token|api[_-]?key|access[_-]?key|private[_-]?key|client[_-]?secret)(\s*[=:]\s*)([^\s,;&"']+)"#,
    )
    .expect("key/value pattern is valid")
});

static BEARER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(bearer)\s+[A-Za-z0-9\-._~+/]+=*").expect("bearer pattern is valid")
});

static URL_PASSWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(://[^/\s:@]+):[^/\s@]+@").expect("url credential pattern is valid")
});

static ACCESS_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(AKIA|ASIA)[0-9A-Z]{16}\b").expect("access key pattern is valid"));

/// Whether a configuration key names a secret.
pub fn is_secret_key(key: &str) -> bool {
    SECRET_KEY.is_match(key)
}

/// Removes secret-shaped content from text.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    literals: Vec<String>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collects the values of secret-named keys from every config.
    pub fn from_configs<'a>(configs: impl IntoIterator<Item = &'a StepConfig>) -> Self {
        let mut redactor = Self::new();
        for config in configs {
            for (key, value) in config {
                redactor.collect(key, value, false);
            }
        }
        redactor
    }

    /// Adds one literal secret.
    pub fn add_literal(&mut self, secret: impl Into<String>) {
        let secret = secret.into();
        if secret.len() >= MIN_SECRET_LEN && !self.literals.contains(&secret) {
            self.literals.push(secret);
            // Longest first so a secret containing another is replaced whole.
            self.literals.sort_by(|a, b| b.len().cmp(&a.len()));
        }
    }

    fn collect(&mut self, key: &str, value: &Value, inherited: bool) {
        let secret = inherited || is_secret_key(key);
        match value {
            Value::String(s) if secret => self.add_literal(s.clone()),
            Value::Number(n) if secret => self.add_literal(n.to_string()),
            Value::Array(items) => {
                for item in items {
                    self.collect(key, item, secret);
                }
            }
            Value::Object(map) => {
                for (k, v) in map {
                    self.collect(k, v, secret);
                }
            }
            _ => {}
        }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for literal in &self.literals {
            if out.contains(literal.as_str()) {
                out = out.replace(literal.as_str(), REDACTED);
            }
        }
        let out = KEY_VALUE.replace_all(&out, format!("${{1}}${{2}}{}", REDACTED));
        let out = BEARER.replace_all(&out, format!("${{1}} {}", REDACTED));
        let out = URL_PASSWORD.replace_all(&out, format!("${{1}}:{}@", REDACTED));
        let out = ACCESS_KEY.replace_all(&out, REDACTED);
        out.into_owned()
    }

    /// Copy of `config` with secret-named values masked, for display.
    pub fn mask_config(config: &StepConfig) -> StepConfig {
        config
            .iter()
            .map(|(key, value)| {
                let masked = if is_secret_key(key) {
                    Value::String(REDACTED.to_string())
                } else {
                    match value {
                        Value::Object(map) => {
                            let inner: StepConfig =
                                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                            Value::Object(Self::mask_config(&inner).into_iter().collect())
                        }
                        other => other.clone(),
                    }
                };
                (key.clone(), masked)
            })
            .collect()
    }
}
