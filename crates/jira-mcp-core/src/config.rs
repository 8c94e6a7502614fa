//! Startup configuration
//!
//! Everything is read exactly once, from the environment (and an optional
//! YAML instances file), into an immutable [`Config`]. Components receive
//! the pieces they need through their constructors and never look at the
//! environment again.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{Error, Result};

pub const DEFAULT_SECONDARY_PREFIXES: &str = "CNV";
pub const DEFAULT_MAX_ATTACHMENT_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_MAX_ANALYZE_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_ANALYZE_FILES: usize = 20;
pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 4;
pub const DEFAULT_JIRA_TIMEOUT_SECS: f64 = 60.0;
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11435";
pub const DEFAULT_OLLAMA_MODEL: &str = "deepseek-r1:14b-qwen-distill-q8_0";
pub const DEFAULT_OLLAMA_CONTEXT_LENGTH: u32 = 32768;
pub const DEFAULT_OLLAMA_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_OLLAMA_TIMEOUT_SECS: f64 = 120.0;
pub const DEFAULT_OLLAMA_CACHE_SIZE: usize = 50;
pub const DEFAULT_OLLAMA_CACHE_TTL_SECS: u64 = 3600;

/// Environment variable families probed for the primary instance, in order.
/// `NOKIA_JIRA_*` and bare `JIRA_*` are accepted for older setups.
const PRIMARY_FAMILIES: [&str; 3] = ["PRIMARY_JIRA", "NOKIA_JIRA", "JIRA"];
const SECONDARY_FAMILIES: [&str; 2] = ["SECONDARY_JIRA", "REDHAT_JIRA"];

/// Authentication for one Jira instance
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Basic { username: String, password: String },
    /// Personal access token, sent as a bearer token
    Token(String),
}

impl Credential {
    pub fn scheme(&self) -> &'static str {
        match self {
            Credential::Basic { .. } => "basic",
            Credential::Token(_) => "bearer",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credential::Token(_) => f.debug_tuple("Token").field(&"<redacted>").finish(),
        }
    }
}

/// One configured Jira instance before it becomes a backend connection
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSettings {
    /// `primary` or `secondary-N`
    pub label: String,
    pub host: String,
    pub credential: Credential,
    /// Upper-cased project prefixes owned by this instance (empty for primary)
    pub prefixes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentSettings {
    pub root: PathBuf,
    pub max_attachment_bytes: u64,
    pub max_analyze_bytes: u64,
    pub max_analyze_files: usize,
    pub download_concurrency: usize,
    pub transfer_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OllamaSettings {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    /// Context window in tokens
    pub context_length: u32,
    pub timeout: Duration,
    pub cache_size: usize,
    pub cache_ttl: Duration,
}

/// Immutable process configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub primary: InstanceSettings,
    pub secondaries: Vec<InstanceSettings>,
    pub attachments: AttachmentSettings,
    pub ollama: OllamaSettings,
    pub jira_timeout: Duration,
    pub pdftotext_bin: PathBuf,
}

/// Extra secondary instances, loaded from `JIRA_INSTANCES_CONFIG`
#[derive(Debug, Deserialize)]
struct InstancesFile {
    #[serde(default)]
    instances: Vec<InstanceEntry>,
}

#[derive(Debug, Deserialize)]
struct InstanceEntry {
    host: String,
    #[serde(default)]
    pat: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    prefixes: Vec<String>,
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let primary = Self::load_primary(&get)?;

        let mut secondaries = Vec::new();
        if let Some(secondary) = Self::load_secondary(&get)? {
            secondaries.push(secondary);
        }
        if let Some(path) = get("JIRA_INSTANCES_CONFIG") {
            let offset = secondaries.len();
            secondaries.extend(Self::load_instances_file(Path::new(&path), offset)?);
        }

        let root = get("MCP_ATTACHMENTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(default_attachments_root);
        let jira_timeout = parse_secs(&get, "JIRA_TIMEOUT", DEFAULT_JIRA_TIMEOUT_SECS)?;

        let attachments = AttachmentSettings {
            root,
            max_attachment_bytes: parse_or(
                &get,
                "MCP_MAX_ATTACHMENT_BYTES",
                DEFAULT_MAX_ATTACHMENT_BYTES,
            )?,
            max_analyze_bytes: parse_or(&get, "MCP_MAX_ANALYZE_BYTES", DEFAULT_MAX_ANALYZE_BYTES)?,
            max_analyze_files: parse_or(&get, "MCP_MAX_ANALYZE_FILES", DEFAULT_MAX_ANALYZE_FILES)?,
            download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY,
            transfer_timeout: jira_timeout,
        };
        if attachments.max_attachment_bytes == 0 {
            return Err(Error::Configuration(
                "MCP_MAX_ATTACHMENT_BYTES must be greater than zero".to_string(),
            ));
        }

        let ollama = OllamaSettings {
            base_url: get("OLLAMA_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OLLAMA_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: get("OLLAMA_MODEL").unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.to_string()),
            temperature: parse_or(&get, "OLLAMA_TEMPERATURE", DEFAULT_OLLAMA_TEMPERATURE)?,
            context_length: parse_or(&get, "OLLAMA_CONTEXT_LENGTH", DEFAULT_OLLAMA_CONTEXT_LENGTH)?,
            timeout: parse_secs(&get, "OLLAMA_TIMEOUT", DEFAULT_OLLAMA_TIMEOUT_SECS)?,
            cache_size: parse_or(&get, "OLLAMA_CACHE_SIZE", DEFAULT_OLLAMA_CACHE_SIZE)?,
            cache_ttl: Duration::from_secs(parse_or(
                &get,
                "OLLAMA_CACHE_TTL",
                DEFAULT_OLLAMA_CACHE_TTL_SECS,
            )?),
        };

        Ok(Self {
            primary,
            secondaries,
            attachments,
            ollama,
            jira_timeout,
            pdftotext_bin: get("PDFTOTEXT_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("pdftotext")),
        })
    }

    fn load_primary(get: &impl Fn(&str) -> Option<String>) -> Result<InstanceSettings> {
        let family = PRIMARY_FAMILIES
            .iter()
            .find(|family| get(&format!("{family}_HOST")).is_some())
            .ok_or_else(|| {
                Error::Configuration(
                    "no primary Jira instance configured (set PRIMARY_JIRA_HOST)".to_string(),
                )
            })?;

        let host = get(&format!("{family}_HOST")).unwrap_or_default();
        let credential = resolve_credential(
            family,
            get(&format!("{family}_PAT")),
            get(&format!("{family}_USERNAME")),
            get(&format!("{family}_PASSWORD")),
        )?;

        Ok(InstanceSettings {
            label: "primary".to_string(),
            host,
            credential,
            prefixes: Vec::new(),
        })
    }

    fn load_secondary(get: &impl Fn(&str) -> Option<String>) -> Result<Option<InstanceSettings>> {
        for family in SECONDARY_FAMILIES {
            let host = get(&format!("{family}_HOST"));
            let pat = get(&format!("{family}_PAT"));
            let username = get(&format!("{family}_USERNAME"));
            let password = get(&format!("{family}_PASSWORD"));

            let Some(host) = host else {
                if pat.is_some() || username.is_some() {
                    return Err(Error::Configuration(format!(
                        "{family} credentials are set but {family}_HOST is not"
                    )));
                }
                continue;
            };

            let credential = resolve_credential(family, pat, username, password)?;
            let raw_prefixes = get("SECONDARY_PROJECT_PREFIXES")
                .or_else(|| get("REDHAT_PROJECT_PREFIXES"))
                .unwrap_or_else(|| DEFAULT_SECONDARY_PREFIXES.to_string());

            return Ok(Some(InstanceSettings {
                label: "secondary-1".to_string(),
                host,
                credential,
                prefixes: parse_prefixes(raw_prefixes.split(','))?,
            }));
        }
        Ok(None)
    }

    fn load_instances_file(path: &Path, offset: usize) -> Result<Vec<InstanceSettings>> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!(
                "failed to read instances config {}: {}",
                path.display(),
                e
            ))
        })?;
        let file: InstancesFile = serde_yaml::from_str(&content).map_err(|e| {
            Error::Configuration(format!(
                "failed to parse instances config {}: {}",
                path.display(),
                e
            ))
        })?;

        file.instances
            .into_iter()
            .enumerate()
            .map(|(i, entry)| {
                let label = format!("secondary-{}", offset + i + 1);
                let host = entry.host.trim().to_string();
                if host.is_empty() {
                    return Err(Error::Configuration(format!("{label}: host is empty")));
                }
                let non_empty = |v: Option<String>| {
                    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
                };
                let credential = resolve_credential(
                    &label,
                    non_empty(entry.pat),
                    non_empty(entry.username),
                    non_empty(entry.password),
                )?;
                let prefixes = parse_prefixes(entry.prefixes.iter().map(String::as_str))?;
                if prefixes.is_empty() {
                    return Err(Error::Configuration(format!(
                        "{label}: at least one project prefix is required"
                    )));
                }
                Ok(InstanceSettings {
                    label,
                    host,
                    credential,
                    prefixes,
                })
            })
            .collect()
    }

    /// All instances in routing registration order, primary first
    pub fn instances(&self) -> impl Iterator<Item = &InstanceSettings> {
        std::iter::once(&self.primary).chain(self.secondaries.iter())
    }

    /// Log a summary of the loaded configuration (no secrets)
    pub fn log_summary(&self) {
        info!(root = %self.attachments.root.display(), "Attachments directory");
        for instance in self.instances() {
            info!(
                label = %instance.label,
                host = %instance.host,
                auth = instance.credential.scheme(),
                prefixes = ?instance.prefixes,
                "Jira instance configured"
            );
        }
        info!(
            url = %self.ollama.base_url,
            model = %self.ollama.model,
            context_length = self.ollama.context_length,
            timeout = ?self.ollama.timeout,
            cache_size = self.ollama.cache_size,
            cache_ttl = ?self.ollama.cache_ttl,
            "Ollama configured"
        );
    }
}

/// `~/.jira-mcp/attachments`, or `./attachments` without a home directory
pub fn default_attachments_root() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".jira-mcp").join("attachments"))
        .unwrap_or_else(|| PathBuf::from("attachments"))
}

fn resolve_credential(
    scope: &str,
    pat: Option<String>,
    username: Option<String>,
    password: Option<String>,
) -> Result<Credential> {
    match (pat, username, password) {
        (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(Error::Configuration(format!(
            "{scope}: a personal access token and a username/password pair are mutually exclusive"
        ))),
        (Some(token), None, None) => Ok(Credential::Token(token)),
        (None, Some(username), Some(password)) => Ok(Credential::Basic { username, password }),
        (None, Some(_), None) | (None, None, Some(_)) => Err(Error::Configuration(format!(
            "{scope}: username and password must be set together"
        ))),
        (None, None, None) => Err(Error::Configuration(format!(
            "{scope}: no credentials configured (set a PAT or a username/password pair)"
        ))),
    }
}

fn parse_prefixes<'a>(raw: impl Iterator<Item = &'a str>) -> Result<Vec<String>> {
    let mut prefixes: Vec<String> = Vec::new();
    for part in raw {
        let prefix = part.trim().to_ascii_uppercase();
        if prefix.is_empty() {
            continue;
        }
        let mut chars = prefix.chars();
        let valid_start = chars.next().is_some_and(|c| c.is_ascii_uppercase());
        if !valid_start || !chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(Error::Configuration(format!(
                "invalid project prefix: {:?}",
                part
            )));
        }
        if !prefixes.contains(&prefix) {
            prefixes.push(prefix);
        }
    }
    Ok(prefixes)
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T> {
    match get(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::Configuration(format!("{name} has an invalid value: {raw:?}"))),
        None => Ok(default),
    }
}

fn parse_secs(
    get: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: f64,
) -> Result<Duration> {
    let secs: f64 = parse_or(get, name, default)?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(Error::Configuration(format!(
            "{name} must be a positive number of seconds"
        )));
    }
    Duration::try_from_secs_f64(secs).map_err(|_| {
        Error::Configuration(format!("{name} is too large: {secs} seconds"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_primary_with_pat_and_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("PRIMARY_JIRA_HOST", "jira.example.com"),
            ("PRIMARY_JIRA_PAT", "secret"),
        ]))
        .unwrap();

        assert_eq!(config.primary.label, "primary");
        assert_eq!(config.primary.credential, Credential::Token("secret".into()));
        assert!(config.secondaries.is_empty());
        assert_eq!(
            config.attachments.max_attachment_bytes,
            DEFAULT_MAX_ATTACHMENT_BYTES
        );
        assert_eq!(config.ollama.base_url, DEFAULT_OLLAMA_BASE_URL);
        assert_eq!(config.ollama.context_length, DEFAULT_OLLAMA_CONTEXT_LENGTH);
        assert_eq!(config.ollama.timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_missing_primary_is_configuration_error() {
        let err = Config::from_lookup(lookup(&[("SECONDARY_JIRA_HOST", "x")])).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }

    #[test]
    fn test_contradictory_credentials_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("PRIMARY_JIRA_HOST", "jira.example.com"),
            ("PRIMARY_JIRA_PAT", "secret"),
            ("PRIMARY_JIRA_USERNAME", "me"),
            ("PRIMARY_JIRA_PASSWORD", "pw"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));

        let err = Config::from_lookup(lookup(&[
            ("PRIMARY_JIRA_HOST", "jira.example.com"),
            ("PRIMARY_JIRA_USERNAME", "me"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("together"));
    }

    #[test]
    fn test_secondary_prefixes_normalized() {
        let config = Config::from_lookup(lookup(&[
            ("PRIMARY_JIRA_HOST", "jira.example.com"),
            ("PRIMARY_JIRA_USERNAME", "me"),
            ("PRIMARY_JIRA_PASSWORD", "pw"),
            ("SECONDARY_JIRA_HOST", "issues.other.org"),
            ("SECONDARY_JIRA_PAT", "tok"),
            ("SECONDARY_PROJECT_PREFIXES", " abc, XYZ,,abc "),
        ]))
        .unwrap();

        assert_eq!(config.secondaries.len(), 1);
        let secondary = &config.secondaries[0];
        assert_eq!(secondary.label, "secondary-1");
        assert_eq!(secondary.prefixes, vec!["ABC".to_string(), "XYZ".to_string()]);
        assert!(matches!(config.primary.credential, Credential::Basic { .. }));
    }

    #[test]
    fn test_secondary_default_prefix_and_legacy_names() {
        let config = Config::from_lookup(lookup(&[
            ("JIRA_HOST", "legacy.example.com"),
            ("JIRA_PAT", "old"),
            ("REDHAT_JIRA_HOST", "issues.redhat.com"),
            ("REDHAT_JIRA_PAT", "tok"),
        ]))
        .unwrap();

        assert_eq!(config.primary.host, "legacy.example.com");
        assert_eq!(config.secondaries[0].prefixes, vec!["CNV".to_string()]);
    }

    #[test]
    fn test_secondary_pat_without_host_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("PRIMARY_JIRA_HOST", "jira.example.com"),
            ("PRIMARY_JIRA_PAT", "secret"),
            ("SECONDARY_JIRA_PAT", "tok"),
        ]))
        .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }

    #[test]
    fn test_instances_file_appends_secondaries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("instances.yaml");
        std::fs::write(
            &path,
            "instances:\n  - host: a.example.com\n    pat: t1\n    prefixes: [foo]\n  - host: b.example.com\n    username: u\n    password: p\n    prefixes: [BAR, baz]\n",
        )
        .unwrap();

        let path_str = path.to_string_lossy().to_string();
        let config = Config::from_lookup(lookup(&[
            ("PRIMARY_JIRA_HOST", "jira.example.com"),
            ("PRIMARY_JIRA_PAT", "secret"),
            ("SECONDARY_JIRA_HOST", "issues.other.org"),
            ("SECONDARY_JIRA_PAT", "tok"),
            ("JIRA_INSTANCES_CONFIG", path_str.as_str()),
        ]))
        .unwrap();

        let labels: Vec<_> = config.secondaries.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["secondary-1", "secondary-2", "secondary-3"]);
        assert_eq!(config.secondaries[2].prefixes, vec!["BAR", "BAZ"]);
    }

    #[test]
    fn test_invalid_numbers_and_prefixes_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("PRIMARY_JIRA_HOST", "jira.example.com"),
            ("PRIMARY_JIRA_PAT", "secret"),
            ("OLLAMA_CONTEXT_LENGTH", "lots"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("OLLAMA_CONTEXT_LENGTH"));

        let err = Config::from_lookup(lookup(&[
            ("PRIMARY_JIRA_HOST", "jira.example.com"),
            ("PRIMARY_JIRA_PAT", "secret"),
            ("SECONDARY_JIRA_HOST", "issues.other.org"),
            ("SECONDARY_JIRA_PAT", "tok"),
            ("SECONDARY_PROJECT_PREFIXES", "AB/C"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("invalid project prefix"));

        for var in ["JIRA_TIMEOUT", "OLLAMA_TIMEOUT"] {
            let err = Config::from_lookup(lookup(&[
                ("PRIMARY_JIRA_HOST", "jira.example.com"),
                ("PRIMARY_JIRA_PAT", "secret"),
                (var, "1e30"),
            ]))
            .unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::Configuration);
            assert!(err.to_string().contains(var));
        }
    }

    #[test]
    fn test_credential_debug_redacts() {
        let debug = format!(
            "{:?}",
            Credential::Basic {
                username: "me".into(),
                password: "hunter2".into()
            }
        );
        assert!(!debug.contains("hunter2"));
        assert!(!format!("{:?}", Credential::Token("tok123".into())).contains("tok123"));
    }
}
