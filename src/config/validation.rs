use std::{collections::HashSet, net::SocketAddr};

use regex::Regex;

use crate::{
    config::models::{
        BalancerConfig, ClusterManagerConfig, HttpClientConfig, RuleConfig, ServerConfig,
        StrategyConfig,
    },
    core::{balancer::command::CommandCipher, destination::Destination},
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Unknown balancer '{balancer}' referenced by rule '{rule}'")]
    UnknownBalancer { rule: String, balancer: String },

    #[error("Duplicate name '{name}' in {section}")]
    DuplicateName { section: String, name: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration, reporting every problem at once
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let errors = Self::collect_errors(config);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Every problem found in `config`, in declaration order
    pub fn collect_errors(config: &ServerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        errors.extend(Self::validate_http_client(&config.http_client));

        if config.rules.is_empty() && config.cluster_manager.is_none() {
            errors.push(ValidationError::MissingField {
                field: "rules".to_string(),
            });
        }

        let mut rule_names = HashSet::new();
        for rule in &config.rules {
            if !rule_names.insert(rule.name.as_str()) {
                errors.push(ValidationError::DuplicateName {
                    section: "rules".to_string(),
                    name: rule.name.clone(),
                });
            }
            errors.extend(Self::validate_rule(rule, config));
        }

        let mut balancer_names = HashSet::new();
        for balancer in &config.balancers {
            if !balancer_names.insert(balancer.name.as_str()) {
                errors.push(ValidationError::DuplicateName {
                    section: "balancers".to_string(),
                    name: balancer.name.clone(),
                });
            }
            errors.extend(Self::validate_balancer(balancer));
        }

        if let Some(cluster_manager) = &config.cluster_manager {
            errors.extend(Self::validate_cluster_manager(cluster_manager));
        }

        errors
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_http_client(config: &HttpClientConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if config.max_retries == 0 {
            errors.push(ValidationError::InvalidField {
                field: "http_client.max_retries".to_string(),
                message: "At least one attempt is required".to_string(),
            });
        }
        if config.max_connections == Some(0) {
            errors.push(ValidationError::InvalidField {
                field: "http_client.max_connections".to_string(),
                message: "Must be greater than zero when set".to_string(),
            });
        }
        if let Some(proxy) = &config.proxy {
            if proxy.host.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: "http_client.proxy.host".to_string(),
                });
            }
            if proxy.password.is_some() && proxy.username.is_none() {
                errors.push(ValidationError::MissingField {
                    field: "http_client.proxy.username".to_string(),
                });
            }
        }
        errors
    }

    /// Validate a single rule
    fn validate_rule(rule: &RuleConfig, config: &ServerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let field = |name: &str| format!("rule '{}' {name}", rule.name);

        if rule.name.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "rules[].name".to_string(),
            });
        }

        match (&rule.target, &rule.balancer) {
            (None, None) if rule.forward_proxy => {}
            (Some(_), _) | (_, Some(_)) if rule.forward_proxy => {
                errors.push(ValidationError::InvalidField {
                    field: field("forward_proxy"),
                    message: "forward proxy rules take their destination from the request"
                        .to_string(),
                })
            }
            (None, None) => errors.push(ValidationError::InvalidField {
                field: field("target"),
                message: "A rule needs either a target or a balancer".to_string(),
            }),
            (Some(_), Some(_)) => errors.push(ValidationError::InvalidField {
                field: field("target"),
                message: "target and balancer are mutually exclusive".to_string(),
            }),
            (Some(target), None) => {
                if let Err(e) = target.parse::<Destination>() {
                    errors.push(ValidationError::InvalidField {
                        field: field("target"),
                        message: e.to_string(),
                    });
                }
            }
            (None, Some(balancer)) => {
                if config.balancer(balancer).is_none() {
                    errors.push(ValidationError::UnknownBalancer {
                        rule: rule.name.clone(),
                        balancer: balancer.clone(),
                    });
                }
            }
        }

        if let Some(path) = &rule.path {
            if let Err(e) = Regex::new(path) {
                errors.push(ValidationError::InvalidField {
                    field: field("path"),
                    message: e.to_string(),
                });
            }
            if rule.path_prefix.is_some() {
                errors.push(ValidationError::InvalidField {
                    field: field("path"),
                    message: "path and path_prefix are mutually exclusive".to_string(),
                });
            }
        }

        if let Some(prefix) = &rule.path_prefix {
            if !prefix.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: field("path_prefix"),
                    message: "Path prefixes must start with '/'".to_string(),
                });
            }
        }

        if let Some(method) = &rule.method {
            if http::Method::from_bytes(method.as_bytes()).is_err() {
                errors.push(ValidationError::InvalidField {
                    field: field("method"),
                    message: format!("'{method}' is not an HTTP method"),
                });
            }
        }

        if let Some(host) = &rule.host {
            if let Err(e) = Self::validate_host(host) {
                errors.push(ValidationError::InvalidField {
                    field: field("host"),
                    message: e,
                });
            }
        }

        if let Some(ca_file) = rule.tls.as_ref().and_then(|tls| tls.ca_file.as_ref()) {
            if !std::path::Path::new(ca_file).exists() {
                errors.push(ValidationError::InvalidField {
                    field: field("tls.ca_file"),
                    message: format!("File '{ca_file}' does not exist"),
                });
            }
        }

        errors
    }

    fn validate_balancer(balancer: &BalancerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let field = |name: &str| format!("balancer '{}' {name}", balancer.name);

        if let StrategyConfig::ByThread {
            max_threads_per_endpoint: 0,
            ..
        } = balancer.strategy
        {
            errors.push(ValidationError::InvalidField {
                field: field("strategy.max_threads_per_endpoint"),
                message: "Must be greater than zero".to_string(),
            });
        }

        if let StrategyConfig::FaultMonitoring {
            min_flawless_ratio, ..
        } = balancer.strategy
        {
            if !(0.0..=1.0).contains(&min_flawless_ratio) {
                errors.push(ValidationError::InvalidField {
                    field: field("strategy.min_flawless_ratio"),
                    message: format!("Must be between 0 and 1, got {min_flawless_ratio}"),
                });
            }
        }

        let mut cluster_names = HashSet::new();
        for cluster in &balancer.clusters {
            if !cluster_names.insert(cluster.name.as_str()) {
                errors.push(ValidationError::DuplicateName {
                    section: field("clusters"),
                    name: cluster.name.clone(),
                });
            }
            for node in &cluster.nodes {
                let node_field = format!("cluster '{}' node {}:{}", cluster.name, node.host, node.port);
                if node.host.trim().is_empty() {
                    errors.push(ValidationError::MissingField {
                        field: field(&format!("cluster '{}' node host", cluster.name)),
                    });
                }
                if !(node.weight.is_finite() && node.weight > 0.0) {
                    errors.push(ValidationError::InvalidField {
                        field: field(&node_field),
                        message: format!("Weight must be positive, got {}", node.weight),
                    });
                }
            }
        }

        if let Some(detection) = &balancer.failure_detection {
            if detection.max_consecutive_5xx == 0 {
                errors.push(ValidationError::InvalidField {
                    field: field("failure_detection.max_consecutive_5xx"),
                    message: "Must be greater than zero".to_string(),
                });
            }
        }

        errors
    }

    fn validate_cluster_manager(config: &ClusterManagerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !config.path_prefix.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: "cluster_manager.path_prefix".to_string(),
                message: "Path prefixes must start with '/'".to_string(),
            });
        }
        match &config.key_hex {
            Some(key) => {
                if let Err(e) = CommandCipher::from_hex(key) {
                    errors.push(ValidationError::InvalidField {
                        field: "cluster_manager.key_hex".to_string(),
                        message: e.to_string(),
                    });
                }
            }
            None if config.validate_signature => errors.push(ValidationError::MissingField {
                field: "cluster_manager.key_hex".to_string(),
            }),
            None => {}
        }
        if config.hmac_secret.as_deref().is_some_and(str::is_empty) {
            errors.push(ValidationError::InvalidField {
                field: "cluster_manager.hmac_secret".to_string(),
                message: "Must not be empty when set".to_string(),
            });
        }
        errors
    }

    fn validate_host(host: &str) -> Result<(), String> {
        if host == "*" {
            return Ok(());
        }
        let name = host.strip_prefix("*.").unwrap_or(host);
        if name.is_empty() || name.contains('*') {
            return Err(format!("'{host}' must be an exact host, '*.suffix' or '*'"));
        }
        if name.contains('/') || name.contains(char::is_whitespace) {
            return Err(format!("'{host}' contains invalid characters"));
        }
        Ok(())
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }
        let mut message = format!("{} configuration errors:", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("\n  {}. {error}", i + 1));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConfig, NodeConfig};

    fn minimal_valid_config() -> ServerConfig {
        ServerConfig::builder()
            .listen_addr("127.0.0.1:8080")
            .rule(RuleConfig::new("api").with_target("http://localhost:9000"))
            .build()
            .unwrap()
    }

    #[test]
    fn minimal_config_is_valid() {
        assert!(ServerConfigValidator::validate(&minimal_valid_config()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = minimal_valid_config();
        config.listen_addr = "localhost".to_string();
        config.http_client.max_retries = 0;
        config.rules.push(RuleConfig::new("lonely"));

        let errors = ServerConfigValidator::collect_errors(&config);
        assert_eq!(errors.len(), 3);
        let message = ServerConfigValidator::validate(&config).unwrap_err().to_string();
        assert!(message.contains("3 configuration errors"));
    }

    #[test]
    fn rejects_unknown_balancer_and_bad_regex() {
        let mut rule = RuleConfig::new("lb").with_balancer("missing");
        rule.path = Some("([".to_string());
        let config = ServerConfig::builder().rule(rule).build().unwrap();

        let errors = ServerConfigValidator::collect_errors(&config);
        assert!(errors.contains(&ValidationError::UnknownBalancer {
            rule: "lb".into(),
            balancer: "missing".into()
        }));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidField { field, .. } if field.ends_with("path"))));
    }

    #[test]
    fn rejects_bad_weights_and_zero_capacity() {
        let balancer = BalancerConfig::new("Default")
            .with_strategy(StrategyConfig::ByThread {
                max_threads_per_endpoint: 0,
                retry_time_on_busy: std::time::Duration::from_millis(10),
                max_busy_retries: None,
            })
            .with_cluster(ClusterConfig::new(
                "Default",
                vec![NodeConfig::new("a", 1).with_weight(0.0)],
            ));
        let config = ServerConfig::builder()
            .rule(RuleConfig::new("lb").with_balancer("Default"))
            .balancer(balancer)
            .build()
            .unwrap();

        assert_eq!(ServerConfigValidator::collect_errors(&config).len(), 2);
    }

    #[test]
    fn rejects_flawless_ratio_outside_unit_range() {
        let balancer = BalancerConfig::new("Default")
            .with_strategy(StrategyConfig::FaultMonitoring {
                min_flawless_ratio: 1.5,
                clear_faults_after: std::time::Duration::from_secs(60),
            })
            .with_cluster(ClusterConfig::new("Default", vec![NodeConfig::new("a", 1)]));
        let config = ServerConfig::builder()
            .rule(RuleConfig::new("lb").with_balancer("Default"))
            .balancer(balancer)
            .build()
            .unwrap();

        let errors = ServerConfigValidator::collect_errors(&config);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("min_flawless_ratio"));
    }

    #[test]
    fn cluster_manager_requires_usable_key() {
        let mut config = minimal_valid_config();
        config.cluster_manager = Some(ClusterManagerConfig {
            validate_signature: true,
            ..Default::default()
        });
        assert_eq!(ServerConfigValidator::collect_errors(&config).len(), 1);

        config.cluster_manager = Some(ClusterManagerConfig {
            key_hex: Some("abcd".into()),
            ..Default::default()
        });
        assert_eq!(ServerConfigValidator::collect_errors(&config).len(), 1);
    }

    #[test]
    fn host_patterns() {
        assert!(ServerConfigValidator::validate_host("*").is_ok());
        assert!(ServerConfigValidator::validate_host("*.example.com").is_ok());
        assert!(ServerConfigValidator::validate_host("api.example.com").is_ok());
        assert!(ServerConfigValidator::validate_host("a*b").is_err());
    }

    #[test]
    fn forward_proxy_rules_have_no_target() {
        let mut rule = RuleConfig::new("proxy");
        rule.forward_proxy = true;
        let mut config = minimal_valid_config();
        config.rules = vec![rule.clone()];
        assert!(ServerConfigValidator::collect_errors(&config).is_empty());

        config.rules = vec![rule.with_target("http://localhost:9000")];
        assert_eq!(ServerConfigValidator::collect_errors(&config).len(), 1);
    }
}
