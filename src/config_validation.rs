//! Sanity checks for a [`TransportConfig`] before any connection is opened.

use crate::config::{LogOutputType, TransportConfig};
use crate::file_source::MAX_CHUNK_SIZE;
use crate::tunnel::connector::proxy_authority;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
            suggestions: vec![],
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn add_suggestion(&mut self, suggestion: String) {
        self.suggestions.push(suggestion);
    }
}

pub struct TransportConfigValidator<'a> {
    config: &'a TransportConfig,
}

impl<'a> TransportConfigValidator<'a> {
    pub fn new(config: &'a TransportConfig) -> Self {
        Self { config }
    }

    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::success();

        self.validate_proxy(&mut result);
        self.validate_timeouts(&mut result);
        self.validate_streaming(&mut result);
        self.validate_logging(&mut result);

        result
    }

    fn validate_proxy(&self, result: &mut ValidationResult) {
        let Some(proxy) = &self.config.proxy else {
            result.add_warning("No proxy configured: tunnels cannot be opened".to_string());
            return;
        };

        if let Err(e) = proxy_authority(&proxy.proxy_url) {
            result.add_error(format!("Invalid proxy_url '{}': {}", proxy.proxy_url, e));
        }

        match (&proxy.username, &proxy.password) {
            (Some(username), _) if username.is_empty() => {
                result.add_error("Proxy username cannot be empty".to_string());
            }
            (Some(_), None) => {
                result.add_warning("Proxy username set without a password".to_string());
            }
            (None, Some(_)) => {
                result.add_warning("Proxy password set without a username, it will be ignored".to_string());
            }
            _ => {}
        }

        if let Some(max) = proxy.max_header_size {
            if max < 1024 {
                result.add_error(format!(
                    "max_header_size {} is too small for a proxy response head",
                    max
                ));
            }
        }

        if let Some(ca_file) = &proxy.ca_file {
            if !ca_file.is_file() {
                result.add_error(format!("CA file {} is not accessible", ca_file.display()));
            }
        }
    }

    fn validate_timeouts(&self, result: &mut ValidationResult) {
        let timeouts = &self.config.timeouts;
        let entries = [
            ("read", timeouts.read_timeout_millis),
            ("write", timeouts.write_timeout_millis),
            ("response", timeouts.response_timeout_millis),
        ];

        for (name, millis) in entries {
            match millis {
                Some(millis) if millis < 0 => result.add_warning(format!(
                    "Negative {} timeout ({}ms) disables the {} watchdog",
                    name, millis, name
                )),
                Some(0) => result.add_warning(format!("{} timeout disabled", name)),
                Some(millis) if millis < 100 => result.add_warning(format!(
                    "Very short {} timeout ({}ms) may fire on healthy connections",
                    name, millis
                )),
                _ => {}
            }
        }

        if timeouts.response_timeout_millis.is_none() {
            result.add_suggestion(
                "Set response_timeout_millis to bound how long a CONNECT may wait for the proxy".to_string(),
            );
        }
    }

    fn validate_streaming(&self, result: &mut ValidationResult) {
        let streaming = &self.config.streaming;

        if streaming.chunk_size == 0 {
            result.add_error("chunk_size must be positive".to_string());
        } else if streaming.chunk_size > MAX_CHUNK_SIZE {
            result.add_warning(format!(
                "chunk_size {} exceeds the largest single read and will be clamped to {}",
                streaming.chunk_size, MAX_CHUNK_SIZE
            ));
        } else if streaming.chunk_size < 512 {
            result.add_suggestion(format!(
                "chunk_size {} is small; larger chunks mean fewer reads",
                streaming.chunk_size
            ));
        }

        if streaming.max_bytes_per_write == Some(0) {
            result.add_warning("max_bytes_per_write of 0 means no cap".to_string());
        }
    }

    fn validate_logging(&self, result: &mut ValidationResult) {
        let Some(logging) = &self.config.logging else {
            return;
        };
        for target in logging.targets.iter().flatten() {
            if matches!(target.output_type, LogOutputType::File) && target.path.is_none() {
                result.add_error("File log target requires a path".to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogTarget, LoggingConfig, ProxyConfig};

    fn proxy_config(url: &str) -> ProxyConfig {
        ProxyConfig {
            proxy_url: url.to_string(),
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            max_header_size: Some(16 * 1024),
            ca_file: None,
        }
    }

    #[test]
    fn test_validation_success() {
        let mut config = TransportConfig::default();
        config.proxy = Some(proxy_config("http://proxy.local:3128"));
        config.timeouts.response_timeout_millis = Some(10_000);

        let result = TransportConfigValidator::new(&config).validate();
        assert!(result.is_valid);
        assert!(result.errors.is_empty());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_validation_invalid_proxy_url() {
        let mut config = TransportConfig::default();
        config.proxy = Some(proxy_config("socks5://proxy.local:1080"));

        let result = TransportConfigValidator::new(&config).validate();
        assert!(!result.is_valid);
    }

    #[test]
    fn test_validation_streaming_and_logging_errors() {
        let mut config = TransportConfig::default();
        config.proxy = Some(proxy_config("proxy.local:3128"));
        config.streaming.chunk_size = 0;
        config.logging = Some(LoggingConfig {
            level: None,
            format: None,
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::File,
                path: None,
                level: None,
            }]),
        });

        let result = TransportConfigValidator::new(&config).validate();
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn test_disabled_timeouts_warn() {
        let mut config = TransportConfig::default();
        config.proxy = Some(proxy_config("proxy.local:3128"));
        config.timeouts.read_timeout_millis = Some(-1);
        config.timeouts.write_timeout_millis = Some(0);

        let result = TransportConfigValidator::new(&config).validate();
        assert!(result.is_valid);
        assert_eq!(result.warnings.len(), 2);
    }
}
