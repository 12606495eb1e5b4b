use axum::http::{HeaderMap, StatusCode};
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use super::attack_patterns::AttackCategory;
use crate::config::{RuleConfig, ValidationConfig, ValidationMode};

/// Headers whose values are never scanned. They routinely contain `;`, `/`
/// and similar characters that trip the generic patterns.
const SKIPPED_HEADERS: &[&str] = &[
    "accept",
    "accept-encoding",
    "accept-language",
    "authorization",
    "cache-control",
    "connection",
    "content-length",
    "content-type",
    "cookie",
    "forwarded",
    "host",
    "origin",
    "referer",
    "traceparent",
    "tracestate",
    "user-agent",
];

/// Header families skipped by prefix: client hints, fetch metadata and
/// proxy forwarding headers.
const SKIPPED_HEADER_PREFIXES: &[&str] = &["sec-ch-", "sec-fetch-", "x-forwarded-"];

fn is_skipped_header(name: &str) -> bool {
    SKIPPED_HEADERS.contains(&name)
        || SKIPPED_HEADER_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
}

const FIELD_MESSAGE_SUFFIX: &str = "contains a potentially malicious pattern.";

/// What a rule is matched against.
#[derive(Debug, Clone, Copy)]
pub struct RequestTarget<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub content_type: &'a str,
}

/// One attack category with its compiled patterns and applicability filter.
#[derive(Debug, Clone)]
pub struct ValidationRule {
    pub category: AttackCategory,
    patterns: Vec<Regex>,
    paths: Option<HashSet<String>>,
    path_prefixes: Option<Vec<String>>,
    exclude_paths: HashSet<String>,
    methods: Option<HashSet<String>>,
    content_types: Option<Vec<String>>,
    field_names: Option<HashSet<String>>,
}

impl ValidationRule {
    /// Built-in rule for `category`.
    pub fn builtin(category: AttackCategory) -> Result<Self, anyhow::Error> {
        Ok(Self {
            category,
            patterns: compile(category.default_patterns().iter().copied())?,
            paths: None,
            path_prefixes: None,
            exclude_paths: HashSet::new(),
            methods: None,
            content_types: category
                .default_content_types()
                .map(|cts| cts.iter().map(|ct| ct.to_string()).collect()),
            field_names: None,
        })
    }

    pub fn from_config(config: &RuleConfig) -> Result<Self, anyhow::Error> {
        let patterns = match &config.patterns {
            Some(patterns) => compile(patterns.iter().map(String::as_str))?,
            None => compile(config.category.default_patterns().iter().copied())?,
        };

        Ok(Self {
            category: config.category,
            patterns,
            paths: config.paths.as_ref().map(|p| p.iter().cloned().collect()),
            path_prefixes: config.path_prefixes.clone(),
            exclude_paths: config.exclude_paths.iter().cloned().collect(),
            methods: config
                .methods
                .as_ref()
                .map(|m| m.iter().map(|s| s.to_uppercase()).collect()),
            content_types: config
                .content_types
                .as_ref()
                .map(|c| c.iter().map(|s| s.to_lowercase()).collect()),
            field_names: config.field_names.as_ref().map(|f| f.iter().cloned().collect()),
        })
    }

    pub fn applies_to(&self, target: &RequestTarget<'_>) -> bool {
        if self.exclude_paths.contains(target.path) {
            return false;
        }

        let path_filtered = self.paths.is_some() || self.path_prefixes.is_some();
        if path_filtered {
            let exact = self
                .paths
                .as_ref()
                .is_some_and(|p| p.contains(target.path));
            let prefixed = self
                .path_prefixes
                .as_ref()
                .is_some_and(|p| p.iter().any(|prefix| target.path.starts_with(prefix.as_str())));
            if !exact && !prefixed {
                return false;
            }
        }

        if let Some(methods) = &self.methods {
            if !methods.contains(&target.method.to_uppercase()) {
                return false;
            }
        }

        if let Some(content_types) = &self.content_types {
            let content_type = target.content_type.to_lowercase();
            if !content_types.iter().any(|ct| content_type.contains(ct.as_str())) {
                return false;
            }
        }

        true
    }

    /// True when `name` is in scope for this rule and `value` matches one of
    /// its patterns.
    pub fn flags(&self, name: &str, value: &str) -> bool {
        if let Some(field_names) = &self.field_names {
            if !field_names.contains(name) {
                return false;
            }
        }

        self.patterns.iter().any(|p| p.is_match(value))
    }
}

fn compile<'a>(patterns: impl Iterator<Item = &'a str>) -> Result<Vec<Regex>, anyhow::Error> {
    patterns
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(|e| anyhow::anyhow!("Invalid validation pattern {:?}: {}", p, e))
        })
        .collect()
}

/// Where in the request a violation was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputLocation {
    Url,
    Query,
    Headers,
    Body,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationViolation {
    UrlTooLong { length: usize },
    BodyTooLarge,
    /// A JSON body that does not parse.
    MalformedBody,
    MaliciousPattern {
        location: InputLocation,
        category: AttackCategory,
        /// Offending field names; matched values are never retained.
        fields: Vec<String>,
    },
}

impl ValidationViolation {
    pub fn status(&self) -> StatusCode {
        match self {
            ValidationViolation::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    pub fn detail(&self) -> &'static str {
        match self {
            ValidationViolation::UrlTooLong { .. } => "Invalid request URL.",
            ValidationViolation::BodyTooLarge => "Request body too large.",
            ValidationViolation::MalformedBody => "Invalid request body.",
            ValidationViolation::MaliciousPattern { location, .. } => match location {
                InputLocation::Url => "Invalid request URL.",
                InputLocation::Query => "Invalid query parameters.",
                InputLocation::Headers => "Invalid request headers.",
                InputLocation::Body => "Invalid request body.",
            },
        }
    }

    pub fn category(&self) -> Option<AttackCategory> {
        match self {
            ValidationViolation::MaliciousPattern { category, .. } => Some(*category),
            _ => None,
        }
    }

    /// Per-field messages for the response body.
    pub fn field_errors(&self) -> BTreeMap<String, String> {
        match self {
            ValidationViolation::MaliciousPattern { fields, .. } => fields
                .iter()
                .map(|f| (f.clone(), format!("Field '{}' {}", f, FIELD_MESSAGE_SUFFIX)))
                .collect(),
            ValidationViolation::MalformedBody => BTreeMap::from([(
                "body".to_string(),
                "Request body could not be parsed.".to_string(),
            )]),
            _ => BTreeMap::new(),
        }
    }

    /// Metric/log label.
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationViolation::UrlTooLong { .. } => "url_too_long",
            ValidationViolation::BodyTooLarge => "body_too_large",
            ValidationViolation::MalformedBody => "malformed_body",
            ValidationViolation::MaliciousPattern { category, .. } => category.as_str(),
        }
    }
}

/// Scans request inputs against an ordered rule set.
#[derive(Debug, Clone)]
pub struct InputValidator {
    rules: Vec<ValidationRule>,
    mode: ValidationMode,
    max_body_size: usize,
    max_url_length: usize,
}

impl InputValidator {
    pub fn new(config: &ValidationConfig) -> Result<Self, anyhow::Error> {
        let rules = match &config.rules {
            Some(rules) => rules
                .iter()
                .map(ValidationRule::from_config)
                .collect::<Result<Vec<_>, _>>()?,
            None => AttackCategory::all()
                .into_iter()
                .map(ValidationRule::builtin)
                .collect::<Result<Vec<_>, _>>()?,
        };

        tracing::info!(rules = rules.len(), mode = ?config.mode, "Input validator initialized");

        Ok(Self {
            rules,
            mode: config.mode,
            max_body_size: config.max_body_size,
            max_url_length: config.max_url_length,
        })
    }

    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    pub fn check_url(&self, url: &str) -> Result<(), ValidationViolation> {
        if url.len() > self.max_url_length {
            return Err(ValidationViolation::UrlTooLong { length: url.len() });
        }
        Ok(())
    }

    pub fn check_query(
        &self,
        target: &RequestTarget<'_>,
        query: Option<&str>,
    ) -> Result<(), ValidationViolation> {
        let Some(query) = query.filter(|q| !q.is_empty()) else {
            return Ok(());
        };

        let fields = serde_urlencoded::from_str::<Vec<(String, String)>>(query)
            .unwrap_or_else(|_| vec![("query".to_string(), query.to_string())]);

        self.scan(target, InputLocation::Query, &fields)
    }

    pub fn check_headers(
        &self,
        target: &RequestTarget<'_>,
        headers: &HeaderMap,
    ) -> Result<(), ValidationViolation> {
        let fields: Vec<(String, String)> = headers
            .iter()
            .filter(|(name, _)| !is_skipped_header(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        self.scan(target, InputLocation::Headers, &fields)
    }

    /// Reject on a declared `Content-Length` before any body is read.
    pub fn check_declared_length(&self, content_length: Option<u64>) -> Result<(), ValidationViolation> {
        match content_length {
            Some(len) if len > self.max_body_size as u64 => Err(ValidationViolation::BodyTooLarge),
            _ => Ok(()),
        }
    }

    /// Scan a fully read body. JSON and form bodies are checked field by
    /// field; other content types pass through.
    pub fn check_body(
        &self,
        target: &RequestTarget<'_>,
        body: &[u8],
    ) -> Result<(), ValidationViolation> {
        if body.len() > self.max_body_size {
            return Err(ValidationViolation::BodyTooLarge);
        }

        if body.is_empty() {
            return Ok(());
        }

        let content_type = target.content_type.to_lowercase();
        let fields = if content_type.starts_with("application/json") {
            let value: Value =
                serde_json::from_slice(body).map_err(|_| ValidationViolation::MalformedBody)?;
            let mut fields = Vec::new();
            flatten_json(&value, "", &mut fields);
            fields
        } else if content_type.starts_with("application/x-www-form-urlencoded") {
            serde_urlencoded::from_bytes::<Vec<(String, String)>>(body)
                .map_err(|_| ValidationViolation::MalformedBody)?
        } else {
            return Ok(());
        };

        self.scan(target, InputLocation::Body, &fields)
    }

    /// Report the first applicable rule that flags any field, with every
    /// field it flags.
    fn scan(
        &self,
        target: &RequestTarget<'_>,
        location: InputLocation,
        fields: &[(String, String)],
    ) -> Result<(), ValidationViolation> {
        for rule in self.rules.iter().filter(|r| r.applies_to(target)) {
            let mut flagged: Vec<String> = Vec::new();
            for (name, value) in fields {
                if rule.flags(name, value) && !flagged.contains(name) {
                    flagged.push(name.clone());
                }
            }

            if !flagged.is_empty() {
                return Err(ValidationViolation::MaliciousPattern {
                    location,
                    category: rule.category,
                    fields: flagged,
                });
            }
        }

        Ok(())
    }
}

/// Flatten scalar leaves into `(a.b, value)` / `(a[0], value)` pairs.
fn flatten_json(value: &Value, prefix: &str, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_json(child, &name, out);
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                flatten_json(item, &format!("{}[{}]", prefix, i), out);
            }
        }
        Value::String(s) => out.push((prefix.to_string(), s.clone())),
        Value::Number(n) => out.push((prefix.to_string(), n.to_string())),
        Value::Bool(b) => out.push((prefix.to_string(), b.to_string())),
        Value::Null => {}
    }
}
