//! Routing rules and their lookup.
//!
//! A [`Rule`] binds a request key (host, method, path) to an interceptor
//! chain and optional target. [`RuleRegistry`] picks the most specific rule
//! for an inbound request and resolves rules by name for `internal:` routing.
use std::{fmt, sync::Arc};

use http::Method;
use regex::Regex;

use crate::core::{chain::InterceptorChain, exchange::split_host_port};

/// Client TLS settings a rule uses towards its backends. The `id` becomes
/// part of the connection pool key.
#[derive(Clone)]
pub struct TlsContext {
    pub id: String,
    pub config: Arc<rustls::ClientConfig>,
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext").field("id", &self.id).finish()
    }
}

/// How a rule matches the request path.
#[derive(Debug, Clone, Default)]
pub enum PathMatcher {
    #[default]
    Any,
    Prefix(String),
    Regex(Regex),
}

impl PathMatcher {
    fn matches(&self, path: &str) -> bool {
        match self {
            PathMatcher::Any => true,
            PathMatcher::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathMatcher::Regex(re) => re.is_match(path),
        }
    }

    // Longer prefixes win; a regex ranks above any prefix.
    fn specificity(&self) -> usize {
        match self {
            PathMatcher::Any => 0,
            PathMatcher::Prefix(prefix) => prefix.len(),
            PathMatcher::Regex(_) => usize::MAX / 2,
        }
    }
}

/// The match key of a rule. `None` fields match anything.
#[derive(Debug, Clone, Default)]
pub struct RuleKey {
    /// Exact host or `*.suffix` wildcard
    pub host: Option<String>,
    pub method: Option<Method>,
    pub path: PathMatcher,
    pub port: Option<u16>,
}

impl RuleKey {
    pub fn matches(&self, host: Option<&str>, method: &Method, path: &str) -> bool {
        if let Some(expected) = &self.method {
            if expected != method {
                return false;
            }
        }
        let (hostname, port) = match host {
            Some(h) => {
                let (name, port) = split_host_port(h);
                (Some(name), port)
            }
            None => (None, None),
        };
        if let Some(expected) = self.port {
            if port != Some(expected) {
                return false;
            }
        }
        if let Some(pattern) = &self.host {
            match hostname {
                Some(name) if host_matches(pattern, name) => {}
                _ => return false,
            }
        }
        self.path.matches(path)
    }

    fn specificity(&self) -> (bool, usize, bool) {
        (
            self.host.is_some(),
            self.path.specificity(),
            self.method.is_some(),
        )
    }
}

fn host_matches(pattern: &str, host: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_prefix("*.") {
        Some(suffix) => host
            .strip_suffix(suffix)
            .is_some_and(|rest| rest.ends_with('.') && rest.len() > 1),
        None => pattern.eq_ignore_ascii_case(host),
    }
}

/// A routing rule.
#[derive(Clone)]
pub struct Rule {
    name: String,
    key: RuleKey,
    target: Option<String>,
    chain: InterceptorChain,
    adjust_host_header: bool,
    fail_over_on_5xx: bool,
    tls: Option<TlsContext>,
}

impl Rule {
    pub fn new(name: impl Into<String>, key: RuleKey, chain: InterceptorChain) -> Self {
        Self {
            name: name.into(),
            key,
            target: None,
            chain,
            adjust_host_header: true,
            fail_over_on_5xx: false,
            tls: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_adjust_host_header(mut self, adjust: bool) -> Self {
        self.adjust_host_header = adjust;
        self
    }

    pub fn with_fail_over_on_5xx(mut self, fail_over: bool) -> Self {
        self.fail_over_on_5xx = fail_over;
        self
    }

    pub fn with_tls(mut self, tls: TlsContext) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &RuleKey {
        &self.key
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn chain(&self) -> &InterceptorChain {
        &self.chain
    }

    pub fn adjust_host_header(&self) -> bool {
        self.adjust_host_header
    }

    pub fn fail_over_on_5xx(&self) -> bool {
        self.fail_over_on_5xx
    }

    pub fn tls(&self) -> Option<&TlsContext> {
        self.tls.as_ref()
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("target", &self.target)
            .field("interceptors", &self.chain.names())
            .finish()
    }
}

/// The set of configured rules.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: Vec<Arc<Rule>>,
}

impl RuleRegistry {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules: rules.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.rules.iter()
    }

    /// Most specific rule matching the request. Host-specific rules beat
    /// wildcards, then the longest path prefix wins; ties go to the rule
    /// declared first.
    pub fn find(&self, host: Option<&str>, method: &Method, path: &str) -> Option<Arc<Rule>> {
        let mut best: Option<&Arc<Rule>> = None;
        for rule in self
            .rules
            .iter()
            .filter(|r| r.key.matches(host, method, path))
        {
            match best {
                Some(current) if current.key.specificity() >= rule.key.specificity() => {}
                _ => best = Some(rule),
            }
        }
        best.cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Rule>> {
        self.rules.iter().find(|r| r.name == name).cloned()
    }
}
