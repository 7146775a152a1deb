//! Delivery rules - map sender numbers to email destinations
//!
//! The rules document is read once at startup. Lookups use longest-prefix matching over
//! normalized numbers, with `*` as a catch-all that loses to any concrete prefix.

use crate::error::ConfigError;
use chrono::format::{Item, StrftimeItems};
use lettre::message::Mailbox;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::warn;

/// Pattern that matches every sender
pub const WILDCARD: &str = "*";

pub const DEFAULT_DATE_FORMAT: &str = "%d.%m.%Y, %H:%M:%S";

/// A configured association between a number pattern and an email destination
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRule {
    pub pattern: String,
    pub to: Mailbox,
    /// Display name of the sender, used in subject and body
    pub name: Option<String>,
}

/// Behavior switches carried in the rules document
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardOptions {
    pub delete_after_sending: bool,
    pub process_existing: bool,
    pub date_format: String,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            delete_after_sending: false,
            process_existing: true,
            date_format: DEFAULT_DATE_FORMAT.to_string(),
        }
    }
}

/// Where a sender's messages go
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Route<'a> {
    Rule(&'a DeliveryRule),
    Default(&'a Mailbox),
}

impl<'a> Route<'a> {
    pub fn recipient(&self) -> &'a Mailbox {
        match self {
            Route::Rule(rule) => &rule.to,
            Route::Default(mailbox) => mailbox,
        }
    }

    pub fn pattern(&self) -> Option<&'a str> {
        match self {
            Route::Rule(rule) => Some(rule.pattern.as_str()),
            Route::Default(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RulesDocument {
    #[serde(default)]
    default: Option<String>,
    #[serde(default)]
    rules: Vec<RawRule>,
    #[serde(default)]
    known_senders: HashMap<String, String>,
    #[serde(default)]
    delete_after_sending: bool,
    #[serde(default = "default_true")]
    process_existing: bool,
    #[serde(default)]
    date_format: Option<String>,
    /// Older documents named one recipient here instead of a default
    #[serde(default)]
    smtp: Option<LegacySmtp>,
}

#[derive(Debug, Deserialize)]
struct LegacySmtp {
    #[serde(default)]
    to: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    #[serde(rename = "match")]
    pattern: String,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Immutable mapping from number pattern to delivery rule
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet {
    rules: BTreeMap<String, DeliveryRule>,
    default: Option<Mailbox>,
    aliases: HashMap<String, String>,
    pub options: ForwardOptions,
}

impl RuleSet {
    /// Load and validate the rules document at `path`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse a rules document. Either every entry is valid or nothing is loaded.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let doc: RulesDocument = serde_yaml::from_str(content)?;

        let mut rules = BTreeMap::new();
        for raw in doc.rules {
            let pattern = normalize_pattern(&raw.pattern)?;

            let to = match raw.to.as_deref().map(str::trim) {
                Some(to) if !to.is_empty() => parse_mailbox(&format!("rule '{}'", pattern), to)?,
                _ => {
                    return Err(ConfigError::MissingField {
                        pattern,
                        field: "to",
                    })
                }
            };

            let name = raw
                .name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty());

            if rules.contains_key(&pattern) {
                return Err(ConfigError::DuplicatePattern(pattern));
            }
            rules.insert(pattern.clone(), DeliveryRule { pattern, to, name });
        }

        let mut default = match doc.default.as_deref().map(str::trim) {
            Some(to) if !to.is_empty() => Some(parse_mailbox("default", to)?),
            _ => None,
        };

        let legacy_to = doc.smtp.map(|smtp| smtp.to).unwrap_or_default();
        if !legacy_to.is_empty() {
            if legacy_to.len() > 1 {
                return Err(ConfigError::InvalidValue {
                    key: "smtp.to".to_string(),
                    message: format!(
                        "{} recipients listed; use rules to send to more than one address",
                        legacy_to.len()
                    ),
                });
            }
            if default.is_some() {
                warn!("Ignoring smtp.to, a default recipient is configured");
            } else if let Some((name, to)) = legacy_to.into_iter().next() {
                let mut mailbox = parse_mailbox("smtp.to", to.trim())?;
                mailbox.name = Some(name.trim().to_string()).filter(|n| !n.is_empty());
                warn!(default = %mailbox, "Using deprecated smtp.to as the default recipient");
                default = Some(mailbox);
            }
        }

        if rules.is_empty() && default.is_none() {
            warn!("No rules and no default recipient; every SMS will fail with no_route");
        }

        let aliases = doc
            .known_senders
            .into_iter()
            .map(|(number, name)| (normalize_number(&number), name))
            .collect();

        let date_format = doc
            .date_format
            .unwrap_or_else(|| DEFAULT_DATE_FORMAT.to_string());
        if StrftimeItems::new(&date_format).any(|item| matches!(item, Item::Error)) {
            return Err(ConfigError::InvalidValue {
                key: "date_format".to_string(),
                message: format!("'{}' is not a valid strftime format", date_format),
            });
        }

        Ok(Self {
            rules,
            default,
            aliases,
            options: ForwardOptions {
                delete_after_sending: doc.delete_after_sending,
                process_existing: doc.process_existing,
                date_format,
            },
        })
    }

    /// Resolve a sender to a route: most specific matching pattern first, then the default
    pub fn resolve(&self, sender: &str) -> Option<Route<'_>> {
        let number = normalize_number(sender);

        self.rules
            .values()
            .filter(|rule| rule.pattern == WILDCARD || number.starts_with(&rule.pattern))
            .max_by_key(|rule| specificity(&rule.pattern))
            .map(Route::Rule)
            .or_else(|| self.default.as_ref().map(Route::Default))
    }

    /// Human-readable sender: rule name, then known-sender alias, then the raw number
    pub fn display_name(&self, route: Option<&Route<'_>>, sender: &str) -> String {
        if let Some(Route::Rule(DeliveryRule {
            name: Some(name), ..
        })) = route
        {
            return name.clone();
        }
        self.aliases
            .get(&normalize_number(sender))
            .cloned()
            .unwrap_or_else(|| sender.trim().to_string())
    }

    pub fn get(&self, pattern: &str) -> Option<&DeliveryRule> {
        self.rules.get(pattern)
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    pub fn default_recipient(&self) -> Option<&Mailbox> {
        self.default.as_ref()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn specificity(pattern: &str) -> usize {
    if pattern == WILDCARD {
        0
    } else {
        pattern.len()
    }
}

fn normalize_pattern(raw: &str) -> Result<String, ConfigError> {
    if raw.trim() == WILDCARD {
        return Ok(WILDCARD.to_string());
    }
    let pattern = normalize_number(raw);
    if pattern.is_empty() || pattern == "+" {
        return Err(ConfigError::InvalidValue {
            key: "match".to_string(),
            message: format!("'{}' is not a number, prefix or '*'", raw),
        });
    }
    Ok(pattern)
}

fn parse_mailbox(key: &str, value: &str) -> Result<Mailbox, ConfigError> {
    value.parse::<Mailbox>().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{}' is not an email address: {}", value, e),
    })
}

/// Strip formatting from a phone number, keeping a leading `+`.
///
/// Alphanumeric sender IDs (e.g. "DHL") are only trimmed.
pub fn normalize_number(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().any(|c| c.is_alphabetic()) {
        return trimmed.to_string();
    }

    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if trimmed.starts_with('+') {
        format!("+{}", digits)
    } else {
        digits
    }
}
