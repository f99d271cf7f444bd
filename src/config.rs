//! Configuration types, built from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::channels::imap::ImapConfig;
use crate::channels::smtp::SmtpConfig;
use crate::error::ConfigError;
use crate::pipeline::types::SenderIdentity;

/// Settings for one bounce-processing run.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Folder names tried in order until one opens.
    pub folders: Vec<String>,
    /// Maximum candidate messages acted on per run.
    pub batch_limit: usize,
    /// Pause after each message that was acted on.
    pub courtesy_delay: Duration,
    /// An address with a bounce record newer than this is skipped.
    pub dedup_window: chrono::Duration,
    /// How far back the mailbox search looks.
    pub search_window: chrono::Duration,
    /// Markers identifying the operator's own domains.
    pub own_domains: Vec<String>,
    /// Ordered sender identities used for resends.
    pub senders: Vec<SenderIdentity>,
    /// Reply-To on every resend.
    pub reply_to: Option<String>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            folders: vec!["INBOX".into(), "Inbox".into(), "inbox".into()],
            batch_limit: 10,
            courtesy_delay: Duration::from_millis(1000),
            dedup_window: chrono::Duration::hours(24),
            search_window: chrono::Duration::hours(24),
            own_domains: vec!["enterprise-universe".into()],
            senders: default_senders(),
            reply_to: Some("info@enterprise-universe.com".into()),
        }
    }
}

/// Sender rotation used when `BOUNCE_SENDERS` is not set.
pub fn default_senders() -> Vec<SenderIdentity> {
    vec![
        SenderIdentity::new(
            "invoice@enterprise-universe.com",
            "Enterprise Universe Buchhaltung",
        ),
        SenderIdentity::new("info@enterprise-universe.com", "Enterprise Universe"),
        SenderIdentity::new(
            "projects@enterprise-universe.one",
            "Enterprise Universe Projects",
        ),
    ]
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct BounceConfig {
    pub imap: ImapConfig,
    pub smtp: SmtpConfig,
    pub processor: ProcessorConfig,
    /// Where the state document lives.
    pub state_path: PathBuf,
    /// Read-only deal ledger written by the invoicing job.
    pub deals_path: PathBuf,
    /// Six-field cron expression for scheduled runs.
    pub schedule: String,
    /// Serve the status endpoint on this port if set.
    pub status_port: Option<u16>,
    /// Run a single pass and exit.
    pub run_once: bool,
}

impl BounceConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from any key → value source.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let parsed = |key: &str| -> Result<Option<u64>, ConfigError> {
            var(key)
                .map(|v| {
                    v.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                        key: key.to_string(),
                        message: e.to_string(),
                    })
                })
                .transpose()
        };

        let imap_host = var("BOUNCE_IMAP_HOST")
            .ok_or_else(|| ConfigError::MissingEnvVar("BOUNCE_IMAP_HOST".into()))?;
        let imap_port = port(parsed("BOUNCE_IMAP_PORT")?, "BOUNCE_IMAP_PORT", 993)?;
        let imap_tls = var("BOUNCE_IMAP_TLS").is_none_or(|v| is_truthy(&v));
        let imap_user = var("BOUNCE_IMAP_USER").unwrap_or_default();
        let imap_password = var("BOUNCE_IMAP_PASSWORD").unwrap_or_default();

        let smtp_host =
            var("BOUNCE_SMTP_HOST").unwrap_or_else(|| imap_host.replace("imap", "smtp"));
        let smtp_port = port(parsed("BOUNCE_SMTP_PORT")?, "BOUNCE_SMTP_PORT", 587)?;
        let smtp_password = var("BOUNCE_SMTP_PASSWORD").unwrap_or_else(|| imap_password.clone());

        let timeout = Duration::from_secs(parsed("BOUNCE_NET_TIMEOUT_SECS")?.unwrap_or(30));

        let defaults = ProcessorConfig::default();
        let senders = match var("BOUNCE_SENDERS") {
            Some(raw) => parse_senders(&raw)?,
            None => defaults.senders.clone(),
        };
        if senders.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "BOUNCE_SENDERS".into(),
                message: "sender pool is empty".into(),
            });
        }

        let processor = ProcessorConfig {
            folders: var("BOUNCE_FOLDERS")
                .map(|v| split_list(&v, ','))
                .unwrap_or(defaults.folders),
            batch_limit: parsed("BOUNCE_BATCH_LIMIT")?
                .map_or(defaults.batch_limit, |n| n as usize),
            courtesy_delay: parsed("BOUNCE_COURTESY_DELAY_MS")?
                .map_or(defaults.courtesy_delay, Duration::from_millis),
            dedup_window: window(parsed("BOUNCE_DEDUP_WINDOW_HOURS")?, "BOUNCE_DEDUP_WINDOW_HOURS")?
                .unwrap_or(defaults.dedup_window),
            search_window: window(parsed("BOUNCE_SEARCH_WINDOW_HOURS")?, "BOUNCE_SEARCH_WINDOW_HOURS")?
                .unwrap_or(defaults.search_window),
            own_domains: var("BOUNCE_OWN_DOMAINS")
                .map(|v| split_list(&v, ','))
                .unwrap_or(defaults.own_domains),
            senders,
            reply_to: var("BOUNCE_REPLY_TO").or(defaults.reply_to),
        };

        Ok(Self {
            imap: ImapConfig {
                host: imap_host,
                port: imap_port,
                tls: imap_tls,
                user: imap_user,
                password: SecretString::from(imap_password),
                timeout,
            },
            smtp: SmtpConfig {
                host: smtp_host,
                port: smtp_port,
                password: SecretString::from(smtp_password),
                timeout,
            },
            processor,
            state_path: var("BOUNCE_STATE_PATH")
                .unwrap_or_else(|| "./data/bounce-handling/bounce-log.json".into())
                .into(),
            deals_path: var("BOUNCE_DEALS_PATH")
                .unwrap_or_else(|| "./data/invoicing/invoicing-log.json".into())
                .into(),
            schedule: var("BOUNCE_SCHEDULE").unwrap_or_else(|| "0 */15 * * * *".into()),
            status_port: port(parsed("BOUNCE_STATUS_PORT")?, "BOUNCE_STATUS_PORT", 0)
                .map(|p| (p != 0).then_some(p))?,
            run_once: var("BOUNCE_RUN_ONCE").is_some_and(|v| is_truthy(&v)),
        })
    }
}

fn port(value: Option<u64>, key: &str, default: u16) -> Result<u16, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) => u16::try_from(v).map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{v} is not a valid port"),
        }),
    }
}

fn window(hours: Option<u64>, key: &str) -> Result<Option<chrono::Duration>, ConfigError> {
    hours
        .map(|h| {
            i64::try_from(h)
                .ok()
                .and_then(chrono::Duration::try_hours)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("{h} hours is out of range"),
                })
        })
        .transpose()
}

fn is_truthy(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn split_list(raw: &str, sep: char) -> Vec<String> {
    raw.split(sep)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `Name <addr>; Other <addr2>; bare@addr` into an ordered pool.
pub fn parse_senders(raw: &str) -> Result<Vec<SenderIdentity>, ConfigError> {
    split_list(raw, ';')
        .into_iter()
        .map(|entry| {
            let invalid = |message: &str| ConfigError::InvalidValue {
                key: "BOUNCE_SENDERS".into(),
                message: format!("{message}: {entry}"),
            };
            let (name, address) = match (entry.find('<'), entry.strip_suffix('>')) {
                (Some(open), Some(head)) => (
                    entry[..open].trim().trim_matches('"').trim().to_string(),
                    head[open + 1..].trim().to_string(),
                ),
                (None, None) => (String::new(), entry.clone()),
                _ => return Err(invalid("unbalanced angle brackets")),
            };
            if !address.contains('@') || address.contains(char::is_whitespace) {
                return Err(invalid("not an email address"));
            }
            let name = if name.is_empty() { address.clone() } else { name };
            Ok(SenderIdentity::new(address, name))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn missing_host_is_an_error() {
        let err = BounceConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(k) if k == "BOUNCE_IMAP_HOST"));
    }

    #[test]
    fn defaults_apply() {
        let cfg = BounceConfig::from_lookup(lookup(&[("BOUNCE_IMAP_HOST", "imap.one.com")])).unwrap();
        assert_eq!(cfg.imap.port, 993);
        assert!(cfg.imap.tls);
        assert_eq!(cfg.smtp.host, "smtp.one.com");
        assert_eq!(cfg.smtp.port, 587);
        assert_eq!(cfg.processor.batch_limit, 10);
        assert_eq!(cfg.processor.courtesy_delay, Duration::from_secs(1));
        assert_eq!(cfg.processor.dedup_window, chrono::Duration::hours(24));
        assert_eq!(cfg.processor.senders.len(), 3);
        assert_eq!(cfg.processor.senders[0].address, "invoice@enterprise-universe.com");
        assert_eq!(cfg.processor.folders[0], "INBOX");
        assert_eq!(cfg.schedule, "0 */15 * * * *");
        assert_eq!(cfg.status_port, None);
        assert!(!cfg.run_once);
    }

    #[test]
    fn overrides_apply() {
        let cfg = BounceConfig::from_lookup(lookup(&[
            ("BOUNCE_IMAP_HOST", "mail.example.com"),
            ("BOUNCE_IMAP_PORT", "143"),
            ("BOUNCE_IMAP_TLS", "false"),
            ("BOUNCE_SMTP_HOST", "relay.example.com"),
            ("BOUNCE_BATCH_LIMIT", "3"),
            ("BOUNCE_COURTESY_DELAY_MS", "0"),
            ("BOUNCE_OWN_DOMAINS", "example.com, example.org"),
            ("BOUNCE_STATUS_PORT", "3099"),
            ("BOUNCE_RUN_ONCE", "yes"),
        ]))
        .unwrap();
        assert_eq!(cfg.imap.port, 143);
        assert!(!cfg.imap.tls);
        assert_eq!(cfg.smtp.host, "relay.example.com");
        assert_eq!(cfg.processor.batch_limit, 3);
        assert_eq!(cfg.processor.courtesy_delay, Duration::ZERO);
        assert_eq!(cfg.processor.own_domains, vec!["example.com", "example.org"]);
        assert_eq!(cfg.status_port, Some(3099));
        assert!(cfg.run_once);
    }

    #[test]
    fn malformed_number_is_invalid_value() {
        let err = BounceConfig::from_lookup(lookup(&[
            ("BOUNCE_IMAP_HOST", "imap.one.com"),
            ("BOUNCE_BATCH_LIMIT", "ten"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "BOUNCE_BATCH_LIMIT"));
    }

    #[test]
    fn window_hours_parse_and_reject_overflow() {
        let cfg = BounceConfig::from_lookup(lookup(&[
            ("BOUNCE_IMAP_HOST", "imap.one.com"),
            ("BOUNCE_DEDUP_WINDOW_HOURS", "48"),
            ("BOUNCE_SEARCH_WINDOW_HOURS", "6"),
        ]))
        .unwrap();
        assert_eq!(cfg.processor.dedup_window, chrono::Duration::hours(48));
        assert_eq!(cfg.processor.search_window, chrono::Duration::hours(6));

        let err = BounceConfig::from_lookup(lookup(&[
            ("BOUNCE_IMAP_HOST", "imap.one.com"),
            ("BOUNCE_DEDUP_WINDOW_HOURS", "99999999999999"),
        ]))
        .unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { key, .. } if key == "BOUNCE_DEDUP_WINDOW_HOURS")
        );
    }

    #[test]
    fn out_of_range_port_is_invalid_value() {
        let err = BounceConfig::from_lookup(lookup(&[
            ("BOUNCE_IMAP_HOST", "imap.one.com"),
            ("BOUNCE_IMAP_PORT", "70000"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn senders_parse_in_order() {
        let pool = parse_senders(
            "\"Billing\" <invoice@us.com>; Info Desk <info@us.com>;projects@us.one",
        )
        .unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(pool[0], SenderIdentity::new("invoice@us.com", "Billing"));
        assert_eq!(pool[1], SenderIdentity::new("info@us.com", "Info Desk"));
        assert_eq!(pool[2], SenderIdentity::new("projects@us.one", "projects@us.one"));
    }

    #[test]
    fn senders_reject_garbage() {
        assert!(parse_senders("Billing <invoice@us.com").is_err());
        assert!(parse_senders("not-an-address").is_err());
    }

    #[test]
    fn empty_sender_pool_is_rejected() {
        let err = BounceConfig::from_lookup(lookup(&[
            ("BOUNCE_IMAP_HOST", "imap.one.com"),
            ("BOUNCE_SENDERS", " ; ;"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "BOUNCE_SENDERS"));
    }
}
