//! Host configuration, loaded from `SANDTRACE_*` environment variables.

use crate::error::{Result, SandtraceError};
use crate::exporter::{ExporterConfig, RetryPolicy};
use crate::guest::JsonFieldTagger;
use crate::sandbox::SandboxConfig;
use crate::span::{SpanFilter, DEFAULT_MAX_SPANS};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub module_dir: PathBuf,
    pub timeout: Duration,
    pub max_memory_bytes: usize,
    pub max_output_bytes: usize,
    pub max_spans: usize,
    pub auto_instrument: bool,
    /// JSON fields of stdin to copy onto the `stdin.read` span; empty disables tagging.
    pub tag_fields: Vec<String>,
    pub min_span_micros: u64,
    pub export_batch_max: usize,
    pub export_interval: Duration,
    pub export_queue_max: usize,
    pub export_retries: usize,
    pub otlp_endpoint: Option<String>,
    pub service_name: String,
    pub run_log: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            module_dir: std::env::temp_dir().join("sandtrace-modules"),
            timeout: Duration::from_millis(5000),
            max_memory_bytes: 64 * 1024 * 1024,
            max_output_bytes: 1024 * 1024,
            max_spans: DEFAULT_MAX_SPANS,
            auto_instrument: true,
            tag_fields: Vec::new(),
            min_span_micros: 5000,
            export_batch_max: 100,
            export_interval: Duration::from_millis(1000),
            export_queue_max: 2048,
            export_retries: 3,
            otlp_endpoint: None,
            service_name: "sandtrace-host".to_string(),
            run_log: None,
        }
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| SandtraceError::Config(format!("{}={:?} is invalid: {}", key, raw, e)))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SandtraceError::Config(format!("{}={:?} is not a boolean", key, raw))),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("SANDTRACE_BIND_ADDR") {
            config.bind_addr = v;
        }
        if let Some(v) = get("SANDTRACE_MODULE_DIR") {
            config.module_dir = PathBuf::from(v);
        }
        if let Some(v) = get("SANDTRACE_TIMEOUT_MS") {
            config.timeout = Duration::from_millis(parse("SANDTRACE_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("SANDTRACE_MAX_MEMORY_BYTES") {
            config.max_memory_bytes = parse("SANDTRACE_MAX_MEMORY_BYTES", &v)?;
        }
        if let Some(v) = get("SANDTRACE_MAX_OUTPUT_BYTES") {
            config.max_output_bytes = parse("SANDTRACE_MAX_OUTPUT_BYTES", &v)?;
        }
        if let Some(v) = get("SANDTRACE_MAX_SPANS") {
            config.max_spans = parse("SANDTRACE_MAX_SPANS", &v)?;
        }
        if let Some(v) = get("SANDTRACE_AUTO_INSTRUMENT") {
            config.auto_instrument = parse_bool("SANDTRACE_AUTO_INSTRUMENT", &v)?;
        }
        if let Some(v) = get("SANDTRACE_TAG_FIELDS") {
            config.tag_fields = v
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = get("SANDTRACE_MIN_SPAN_MICROS") {
            config.min_span_micros = parse("SANDTRACE_MIN_SPAN_MICROS", &v)?;
        }
        if let Some(v) = get("SANDTRACE_EXPORT_BATCH_MAX") {
            config.export_batch_max = parse("SANDTRACE_EXPORT_BATCH_MAX", &v)?;
        }
        if let Some(v) = get("SANDTRACE_EXPORT_INTERVAL_MS") {
            config.export_interval = Duration::from_millis(parse("SANDTRACE_EXPORT_INTERVAL_MS", &v)?);
        }
        if let Some(v) = get("SANDTRACE_EXPORT_QUEUE_MAX") {
            config.export_queue_max = parse("SANDTRACE_EXPORT_QUEUE_MAX", &v)?;
        }
        if let Some(v) = get("SANDTRACE_EXPORT_RETRIES") {
            config.export_retries = parse("SANDTRACE_EXPORT_RETRIES", &v)?;
        }
        config.otlp_endpoint = get("SANDTRACE_OTLP_ENDPOINT");
        if let Some(v) = get("SANDTRACE_SERVICE_NAME") {
            config.service_name = v;
        }
        config.run_log = get("SANDTRACE_RUN_LOG").map(PathBuf::from);

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, bool); 7] = [
            ("timeout", self.timeout.is_zero()),
            ("max_memory_bytes", self.max_memory_bytes == 0),
            ("max_output_bytes", self.max_output_bytes == 0),
            ("max_spans", self.max_spans == 0),
            ("export_batch_max", self.export_batch_max == 0),
            ("export_interval", self.export_interval.is_zero()),
            ("export_queue_max", self.export_queue_max == 0),
        ];
        if let Some((name, _)) = checks.iter().find(|(_, zero)| *zero) {
            return Err(SandtraceError::Config(format!("{} must be greater than zero", name)));
        }
        if self.bind_addr.trim().is_empty() {
            return Err(SandtraceError::Config("bind_addr is empty".to_string()));
        }
        Ok(())
    }

    pub fn span_filter(&self) -> SpanFilter {
        SpanFilter::new(self.min_span_micros)
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            timeout: self.timeout,
            max_memory_bytes: self.max_memory_bytes,
            max_output_bytes: self.max_output_bytes,
            auto_instrument: self.auto_instrument,
            tagger: if self.tag_fields.is_empty() {
                None
            } else {
                Some(Arc::new(JsonFieldTagger::new(self.tag_fields.clone())))
            },
        }
    }

    pub fn exporter_config(&self) -> ExporterConfig {
        ExporterConfig {
            max_batch_size: self.export_batch_max,
            max_queue_size: self.export_queue_max,
            flush_interval: self.export_interval,
            retry: RetryPolicy {
                max_retries: self.export_retries,
                ..RetryPolicy::default()
            },
            ..ExporterConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:3000");
        assert_eq!(config.min_span_micros, 5000);
        assert_eq!(config.export_batch_max, 100);
        assert!(config.otlp_endpoint.is_none());
        assert!(config.validate().is_ok());
        assert!(config.sandbox_config().tagger.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("SANDTRACE_TIMEOUT_MS", "250"),
            ("SANDTRACE_AUTO_INSTRUMENT", "off"),
            ("SANDTRACE_TAG_FIELDS", "brand, price,"),
            ("SANDTRACE_OTLP_ENDPOINT", "http://localhost:4318"),
        ]))
        .unwrap();
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert!(!config.auto_instrument);
        assert_eq!(config.tag_fields, vec!["brand", "price"]);
        assert_eq!(config.otlp_endpoint.as_deref(), Some("http://localhost:4318"));
        assert!(config.sandbox_config().tagger.is_some());
    }

    #[test]
    fn test_invalid_number() {
        let err = Config::from_lookup(lookup(&[("SANDTRACE_MAX_SPANS", "lots")])).unwrap_err();
        assert!(matches!(err, SandtraceError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = Config::from_lookup(lookup(&[("SANDTRACE_EXPORT_QUEUE_MAX", "0")])).unwrap();
        assert!(matches!(config.validate(), Err(SandtraceError::Config(_))));
    }
}
