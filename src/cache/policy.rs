//! Request classification.
//!
//! Policy is an ordered list of rules; the first rule whose predicate matches
//! decides whether a request passes straight through to the origin or is
//! served through the cache. Rules overlap (an upload path may also end in
//! `.jpg`), so evaluation order is part of the contract.

use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, Method, header};

use super::directives::Lifetime;

const DEFAULT_BYPASS_PREFIXES: &[&str] = &["/upload", "/api/"];
const DEFAULT_STATIC_EXTENSIONS: &[&str] =
    &["jpg", "jpeg", "png", "webp", "gif", "ico", "svg", "css", "js"];
const DEFAULT_PRESIGNED_MARKERS: &[&str] = &["X-Amz-Signature="];
const DEFAULT_STATIC_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_STATIC_GRACE: Duration = Duration::from_secs(60 * 60);
const DEFAULT_STATUS_HEADER: &str = "x-cache";
const DEFAULT_DIAGNOSTIC_HEADERS: &[&str] = &["via", "x-varnish"];

/// Policy configuration from the `[policy]` section.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Path prefixes that always bypass the cache, in evaluation order.
    pub bypass_prefixes: Vec<String>,
    /// Lower-case file extensions treated as static assets.
    pub static_extensions: Vec<String>,
    /// Substrings that mark a presigned object-storage URL.
    pub presigned_markers: Vec<String>,
    /// Forced lifetime for static assets and presigned objects.
    pub static_ttl: Duration,
    pub static_grace: Duration,
    /// Pass requests carrying an `Authorization` header.
    pub pass_authorized: bool,
    /// Header that reports `MISS` / `HIT (n)` to clients.
    pub status_header: HeaderName,
    /// Internal headers never delivered to clients.
    pub diagnostic_headers: Vec<HeaderName>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            bypass_prefixes: to_strings(DEFAULT_BYPASS_PREFIXES),
            static_extensions: to_strings(DEFAULT_STATIC_EXTENSIONS),
            presigned_markers: to_strings(DEFAULT_PRESIGNED_MARKERS),
            static_ttl: DEFAULT_STATIC_TTL,
            static_grace: DEFAULT_STATIC_GRACE,
            pass_authorized: true,
            status_header: HeaderName::from_static(DEFAULT_STATUS_HEADER),
            diagnostic_headers: DEFAULT_DIAGNOSTIC_HEADERS
                .iter()
                .map(|name| HeaderName::from_static(*name))
                .collect(),
        }
    }
}

impl From<&crate::config::PolicySettings> for PolicyConfig {
    fn from(settings: &crate::config::PolicySettings) -> Self {
        Self {
            bypass_prefixes: settings.bypass_prefixes.clone(),
            static_extensions: settings.static_extensions.clone(),
            presigned_markers: settings.presigned_markers.clone(),
            static_ttl: settings.static_ttl,
            static_grace: settings.static_grace,
            pass_authorized: settings.pass_authorized,
            status_header: settings.status_header.clone(),
            diagnostic_headers: settings.diagnostic_headers.clone(),
        }
    }
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

/// Predicate half of a policy rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleMatch {
    /// Path starts with the prefix.
    PathPrefix(String),
    /// Method is not one of the listed methods.
    MethodNotIn(Vec<Method>),
    /// Request carries the header.
    HeaderPresent(HeaderName),
    /// Last path segment ends in one of the (lower-case) extensions.
    Extension(Vec<String>),
    /// Path-and-query contains the substring.
    UrlContains(String),
    /// Always matches; terminates the list.
    Any,
}

impl RuleMatch {
    fn matches(&self, method: &Method, url: &str, headers: &HeaderMap) -> bool {
        match self {
            Self::PathPrefix(prefix) => path_of(url).starts_with(prefix.as_str()),
            Self::MethodNotIn(methods) => !methods.contains(method),
            Self::HeaderPresent(name) => headers.contains_key(name),
            Self::Extension(extensions) => extension_of(path_of(url))
                .is_some_and(|ext| extensions.iter().any(|candidate| ext == *candidate)),
            Self::UrlContains(marker) => url.contains(marker.as_str()),
            Self::Any => true,
        }
    }
}

/// Cache-side adjustments attached to a cacheable rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheOverrides {
    /// Lifetime that replaces origin directives on successful responses.
    pub lifetime: Option<Lifetime>,
    /// Remove `Cookie` before hashing and forwarding.
    pub strip_cookie: bool,
}

/// Action half of a policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Pass,
    Cache(CacheOverrides),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub name: &'static str,
    pub matcher: RuleMatch,
    pub action: RuleAction,
}

impl PolicyRule {
    pub fn new(name: &'static str, matcher: RuleMatch, action: RuleAction) -> Self {
        Self {
            name,
            matcher,
            action,
        }
    }
}

/// Result of classifying one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    PassThrough { rule: &'static str },
    Cacheable {
        rule: &'static str,
        overrides: CacheOverrides,
    },
}

impl Classification {
    pub fn rule(&self) -> &'static str {
        match self {
            Self::PassThrough { rule } | Self::Cacheable { rule, .. } => rule,
        }
    }

    pub fn is_cacheable(&self) -> bool {
        matches!(self, Self::Cacheable { .. })
    }

    /// Apply the request-side mutations of this classification.
    pub fn apply_to(&self, headers: &mut HeaderMap) {
        if let Self::Cacheable { overrides, .. } = self
            && overrides.strip_cookie
        {
            headers.remove(header::COOKIE);
        }
    }
}

/// Ordered policy rules.
#[derive(Debug, Clone)]
pub struct Policy {
    rules: Vec<PolicyRule>,
}

impl Policy {
    /// Build the standard rule list from configuration.
    ///
    /// Order: bypass prefixes, non-cacheable methods, credentials, static
    /// assets, presigned URLs, default.
    pub fn new(config: &PolicyConfig) -> Self {
        let forced = CacheOverrides {
            lifetime: Some(Lifetime::new(config.static_ttl, config.static_grace)),
            strip_cookie: true,
        };

        let mut rules: Vec<PolicyRule> = config
            .bypass_prefixes
            .iter()
            .map(|prefix| {
                PolicyRule::new(
                    "bypass-prefix",
                    RuleMatch::PathPrefix(prefix.clone()),
                    RuleAction::Pass,
                )
            })
            .collect();

        rules.push(PolicyRule::new(
            "uncacheable-method",
            RuleMatch::MethodNotIn(vec![Method::GET, Method::HEAD]),
            RuleAction::Pass,
        ));

        if config.pass_authorized {
            rules.push(PolicyRule::new(
                "authorization",
                RuleMatch::HeaderPresent(header::AUTHORIZATION),
                RuleAction::Pass,
            ));
        }

        let extensions: Vec<String> = config
            .static_extensions
            .iter()
            .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        if !extensions.is_empty() {
            rules.push(PolicyRule::new(
                "static-asset",
                RuleMatch::Extension(extensions),
                RuleAction::Cache(forced),
            ));
        }

        rules.extend(config.presigned_markers.iter().map(|marker| {
            PolicyRule::new(
                "presigned-url",
                RuleMatch::UrlContains(marker.clone()),
                RuleAction::Cache(forced),
            )
        }));

        rules.push(PolicyRule::new(
            "default",
            RuleMatch::Any,
            RuleAction::Cache(CacheOverrides::default()),
        ));

        Self { rules }
    }

    /// Build a policy from an explicit rule list. A request that matches no
    /// rule passes through.
    pub fn from_rules(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// Evaluate the rules in order and return the first match.
    pub fn classify(&self, method: &Method, url: &str, headers: &HeaderMap) -> Classification {
        for rule in &self.rules {
            if rule.matcher.matches(method, url, headers) {
                return match rule.action {
                    RuleAction::Pass => Classification::PassThrough { rule: rule.name },
                    RuleAction::Cache(overrides) => Classification::Cacheable {
                        rule: rule.name,
                        overrides,
                    },
                };
            }
        }
        Classification::PassThrough { rule: "unmatched" }
    }
}

fn path_of(url: &str) -> &str {
    url.split_once('?').map_or(url, |(path, _)| path)
}

fn extension_of(path: &str) -> Option<String> {
    let segment = path.rsplit('/').next()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    (!stem.is_empty() && !ext.is_empty()).then(|| ext.to_ascii_lowercase())
}
