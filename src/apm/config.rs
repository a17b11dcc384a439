//! Typed settings store and APM configuration.
//!
//! Settings are resolved once, before binding: deserialize them from JSON,
//! start from defaults, then layer `APM_*` environment variables on top.
//! Nothing reads configuration by string key at request time.

use std::fmt;
use std::str::FromStr;

use regex::{Regex, RegexSet};
use serde::Deserialize;

use crate::error::Error;

const ENV_PREFIX: &str = "APM_";

/// The application settings store. The `"APM"` key holds the
/// instrumentation options.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Settings {
    #[serde(rename = "APM", default)]
    pub apm: Option<ApmConfig>,
}

impl Settings {
    /// Parse settings from a JSON document such as
    /// `{"APM": {"service_name": "shop", "capture_body": "all"}}`.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| Error::config(format!("invalid settings: {e}")))
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, Error> {
        Self::default().with_env(std::env::vars())
    }

    /// Apply `APM_*` variables over the current settings. Unknown `APM_*`
    /// keys are ignored; malformed values are a configuration error.
    pub fn with_env<I, K, V>(mut self, vars: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let config = self.apm.get_or_insert_with(ApmConfig::default);
        for (key, value) in vars {
            let Some(key) = key.as_ref().strip_prefix(ENV_PREFIX) else { continue };
            let value = value.as_ref();
            match key {
                "SERVICE_NAME" => config.service_name = value.to_owned(),
                "SERVICE_VERSION" => config.service_version = Some(value.to_owned()),
                "ENVIRONMENT" => config.environment = Some(value.to_owned()),
                "SERVER_URL" => config.server_url = value.to_owned(),
                "INSTRUMENT" => config.instrument = parse_bool(key, value)?,
                "CAPTURE_BODY" => config.capture_body = value.parse()?,
                "CAPTURE_HEADERS" => config.capture_headers = parse_bool(key, value)?,
                "SANITIZE_FIELD_NAMES" => config.sanitize_field_names = parse_list(value),
                "TRANSACTION_IGNORE_URLS" => config.transaction_ignore_urls = parse_list(value),
                _ => {}
            }
        }
        Ok(self)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!("{ENV_PREFIX}{key}: expected a boolean, got `{value}`"))),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned).collect()
}

/// When request bodies are recorded.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBody {
    #[default]
    Off,
    /// Handled exceptions captured through a request carry the body.
    /// Unhandled-error reports never do.
    Errors,
    Transactions,
    All,
}

impl CaptureBody {
    pub fn for_transactions(self) -> bool {
        matches!(self, Self::Transactions | Self::All)
    }

    pub fn for_errors(self) -> bool {
        matches!(self, Self::Errors | Self::All)
    }
}

impl FromStr for CaptureBody {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "errors" => Ok(Self::Errors),
            "transactions" => Ok(Self::Transactions),
            "all" => Ok(Self::All),
            other => Err(Error::config(format!(
                "capture_body must be one of off, errors, transactions, all; got `{other}`"
            ))),
        }
    }
}

impl fmt::Display for CaptureBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::Errors => "errors",
            Self::Transactions => "transactions",
            Self::All => "all",
        })
    }
}

/// Instrumentation options, immutable once bound.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ApmConfig {
    pub service_name: String,
    pub service_version: Option<String>,
    pub environment: Option<String>,
    pub framework_name: Option<String>,
    pub framework_version: Option<String>,
    /// Where a transport would ship reports. Only informational here.
    pub server_url: String,
    /// Install the process-wide panic hook.
    pub instrument: bool,
    pub capture_body: CaptureBody,
    pub capture_headers: bool,
    /// Case-insensitive wildcards (`*token*`) for header and form-field
    /// names whose values are redacted.
    pub sanitize_field_names: Vec<String>,
    /// Wildcards matched against the request path; matches get no transaction.
    pub transaction_ignore_urls: Vec<String>,
}

impl Default for ApmConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown-rust-service".to_owned(),
            service_version: None,
            environment: None,
            framework_name: None,
            framework_version: None,
            server_url: "http://localhost:8200".to_owned(),
            instrument: true,
            capture_body: CaptureBody::Off,
            capture_headers: true,
            sanitize_field_names: [
                "password", "passwd", "pwd", "secret", "*key", "*token*", "*session*",
                "*credit*", "*card*", "*auth*", "*principal*", "cookie", "set-cookie",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
            transaction_ignore_urls: Vec::new(),
        }
    }
}

impl ApmConfig {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        let allowed = Regex::new(r"^[a-zA-Z0-9 _-]+$")
            .map_err(|e| Error::config(e.to_string()))?;
        if !allowed.is_match(&self.service_name) {
            return Err(Error::config(format!(
                "service_name `{}` may only contain letters, digits, spaces, `_` and `-`",
                self.service_name
            )));
        }
        Ok(())
    }
}

/// Compiled set of `*` wildcards, matched case-insensitively against the
/// whole input.
#[derive(Debug)]
pub(crate) struct WildcardSet(RegexSet);

impl WildcardSet {
    pub(crate) fn compile(patterns: &[String]) -> Result<Self, Error> {
        let regexes = patterns.iter().map(|p| {
            let body: Vec<String> = p.split('*').map(regex::escape).collect();
            format!("(?i)^{}$", body.join(".*"))
        });
        RegexSet::new(regexes)
            .map(Self)
            .map_err(|e| Error::config(format!("invalid wildcard pattern: {e}")))
    }

    pub(crate) fn matches(&self, input: &str) -> bool {
        self.0.is_match(input)
    }
}
