use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackCategory {
    SqlInjection,
    NosqlInjection,
    Xss,
    PathTraversal,
    CommandInjection,
}

impl AttackCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttackCategory::SqlInjection => "sql_injection",
            AttackCategory::NosqlInjection => "nosql_injection",
            AttackCategory::Xss => "xss",
            AttackCategory::PathTraversal => "path_traversal",
            AttackCategory::CommandInjection => "command_injection",
        }
    }

    /// Built-in patterns. All are compiled case-insensitively.
    pub fn default_patterns(&self) -> &'static [&'static str] {
        match self {
            AttackCategory::SqlInjection => SQL_INJECTION,
            AttackCategory::NosqlInjection => NOSQL_INJECTION,
            AttackCategory::Xss => XSS,
            AttackCategory::PathTraversal => PATH_TRAVERSAL,
            AttackCategory::CommandInjection => COMMAND_INJECTION,
        }
    }

    /// Content types the built-in rule for this category is limited to.
    /// `None` means every request.
    pub fn default_content_types(&self) -> Option<&'static [&'static str]> {
        match self {
            AttackCategory::SqlInjection => Some(&[JSON, FORM]),
            AttackCategory::NosqlInjection => Some(&[JSON]),
            AttackCategory::Xss | AttackCategory::CommandInjection => {
                Some(&[JSON, FORM, TEXT])
            }
            AttackCategory::PathTraversal => None,
        }
    }

    pub fn all() -> [AttackCategory; 5] {
        [
            AttackCategory::SqlInjection,
            AttackCategory::NosqlInjection,
            AttackCategory::Xss,
            AttackCategory::PathTraversal,
            AttackCategory::CommandInjection,
        ]
    }
}

impl fmt::Display for AttackCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const JSON: &str = "application/json";
const FORM: &str = "application/x-www-form-urlencoded";
const TEXT: &str = "text/plain";

const SQL_INJECTION: &[&str] = &[
    r"(\b(?:SELECT|INSERT|UPDATE|DELETE|DROP|ALTER|CREATE|TRUNCATE)\b.*?\b(?:FROM|TABLE|DATABASE)\b)",
    r"(?:--|#|\*/|/\*)(?:.*)?(?:(?:DROP|ALTER|CREATE|TRUNCATE))",
    r"(?:UNION(?:\s+ALL)?(?:\s+SELECT))",
    r"'(?:\s+OR\s+|\s+AND\s+)(?:.*?)(?:--|#|/\*|'|=|>)",
    r"(\bOR\b\s+\d+=\d+)",
    r"(\bAND\b\s+\d+=\d+)",
];

const NOSQL_INJECTION: &[&str] = &[
    r"\{\s*\$(?:ne|eq|gt|lt|gte|lte|in|nin|or|and|regex|where|exists)\s*:",
    r"\$(?:ne|eq|gt|lt|gte|lte|in|nin|or|and|regex|where|exists)",
    r"db\.(?:.*?)\.(?:find|update|insert|delete)\(",
];

const XSS: &[&str] = &[
    r"<script.*?>.*?</script>",
    r"javascript:",
    r"on(?:click|load|mouse|error|key|focus|blur|change|submit)=",
    r"<img.*?src.*?=.*?>",
    r"<iframe.*?>.*?</iframe>",
    r"data:(?:text|image)/(?:html|javascript)",
    r"<noscript>(.*?)</noscript>",
];

const PATH_TRAVERSAL: &[&str] = &[
    r"\.{2,}[/\\]",
    r"(?:%2e|%252e){2,}[/\\%]",
    r"/etc/(?:passwd|shadow|group|hosts)",
    r"(?:proc|sys)/\w+/(?:cmdline|environ)",
    r"/(?:var|usr|bin|opt)/",
];

const COMMAND_INJECTION: &[&str] = &[
    r"(?:\||&|;|`|\$\(|\$\{)",
    r"(?:/bin/)(?:bash|sh|ksh|csh|tcsh|zsh|dash)",
    r"(?:ping|wget|curl|nc|telnet|ncat|nmap|dig)\s+",
    r"(?:cat|head|tail|more|less|nl)\s+/",
    r"(?:ls|cp|mv|rm|rmdir|chmod|chown)\s+",
];
