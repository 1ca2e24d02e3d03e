//! Configuration validation engine.
//!
//! Detects unknown or misspelled fields in TOML files and reports semantic
//! problems (bad country codes, zero timeouts, exposed binds).

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use crate::schema::CampuslineConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "type-error", "value",
    /// "security", "file-ref"
    pub category: &'static str,
    /// Dotted path, e.g. "broker.default_country_code"
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    fn new(
        severity: Severity,
        category: &'static str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result of validating a configuration file.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

// ── Schema tree for unknown-field detection ─────────────────────────────────

enum KnownKeys {
    Struct(HashMap<&'static str, KnownKeys>),
    Leaf,
}

fn build_schema_map() -> KnownKeys {
    use KnownKeys::{Leaf, Struct};

    let fields = |names: &[&'static str]| Struct(names.iter().map(|n| (*n, Leaf)).collect());

    Struct(HashMap::from([
        ("server", fields(&["bind", "port"])),
        (
            "broker",
            fields(&[
                "default_country_code",
                "address_suffix",
                "init_timeout_secs",
                "logout_timeout_secs",
                "auth_base_dir",
            ]),
        ),
        ("pairing", fields(&["module_px", "margin_modules"])),
        (
            "sidecar",
            fields(&[
                "dir",
                "node_binary",
                "startup_grace_ms",
                "connect_retries",
                "send_timeout_secs",
            ]),
        ),
    ]))
}

// ── Levenshtein distance ────────────────────────────────────────────────────

fn levenshtein(a: &str, b: &str) -> usize {
    let b_len = b.chars().count();
    if a.is_empty() {
        return b_len;
    }
    if b.is_empty() {
        return a.chars().count();
    }

    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0; b_len + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.chars().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_len]
}

/// Closest candidate within `max_distance` edits, if any.
fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    let mut best: Option<(&'a str, usize)> = None;
    for &candidate in candidates {
        let d = levenshtein(needle, candidate);
        if d > 0 && d <= max_distance && best.as_ref().is_none_or(|(_, bd)| d < *bd) {
            best = Some((candidate, d));
        }
    }
    best.map(|(s, _)| s)
}

// ── Core validation ─────────────────────────────────────────────────────────

/// Validate a config file at the given path, or discover the default config
/// file location if `path` is `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => crate::loader::find_config_file(),
    };

    let Some(actual_path) = config_path else {
        let mut diagnostics = vec![Diagnostic::new(
            Severity::Info,
            "file-ref",
            "",
            "no config file found; using defaults",
        )];
        check_semantics(&CampuslineConfig::default(), &mut diagnostics);
        return ValidationResult {
            diagnostics,
            config_path: None,
        };
    };

    let is_toml = actual_path
        .extension()
        .and_then(|e| e.to_str())
        .is_none_or(|e| e == "toml");

    let mut result = if is_toml {
        match std::fs::read_to_string(&actual_path) {
            Ok(content) => validate_toml_str(&crate::env_subst::substitute_env(&content)),
            Err(e) => ValidationResult {
                diagnostics: vec![Diagnostic::new(
                    Severity::Error,
                    "syntax",
                    "",
                    format!("failed to read config file: {e}"),
                )],
                config_path: None,
            },
        }
    } else {
        // YAML and JSON only get type and semantic checks.
        let mut diagnostics = Vec::new();
        match crate::loader::load_config(&actual_path) {
            Ok(config) => check_semantics(&config, &mut diagnostics),
            Err(e) => diagnostics.push(Diagnostic::new(
                Severity::Error,
                "type-error",
                "",
                e.to_string(),
            )),
        }
        ValidationResult {
            diagnostics,
            config_path: None,
        }
    };
    result.config_path = Some(actual_path);
    result
}

/// Validate a TOML string without file-system side effects.
#[must_use]
pub fn validate_toml_str(toml_str: &str) -> ValidationResult {
    let mut diagnostics = Vec::new();

    let toml_value: toml::Value = match toml::from_str(toml_str) {
        Ok(v) => v,
        Err(e) => {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "syntax",
                "",
                format!("TOML syntax error: {e}"),
            ));
            return ValidationResult {
                diagnostics,
                config_path: None,
            };
        },
    };

    check_unknown_fields(&toml_value, &build_schema_map(), "", &mut diagnostics);

    match toml::from_str::<CampuslineConfig>(toml_str) {
        Ok(config) => check_semantics(&config, &mut diagnostics),
        Err(e) => diagnostics.push(Diagnostic::new(
            Severity::Error,
            "type-error",
            "",
            format!("type error: {e}"),
        )),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

fn check_unknown_fields(
    value: &toml::Value,
    schema: &KnownKeys,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let (toml::Value::Table(table), KnownKeys::Struct(fields)) = (value, schema) else {
        return;
    };
    let known_keys: Vec<&str> = fields.keys().copied().collect();
    for (key, child_value) in table {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        if let Some(child_schema) = fields.get(key.as_str()) {
            check_unknown_fields(child_value, child_schema, &path, diagnostics);
            continue;
        }
        let message = match suggest(key, &known_keys, 3) {
            Some(s) => format!("unknown field (did you mean \"{s}\"?)"),
            None => "unknown field".to_string(),
        };
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "unknown-field",
            path,
            message,
        ));
    }
}

/// Run semantic checks on a successfully parsed config.
pub fn check_semantics(config: &CampuslineConfig, diagnostics: &mut Vec<Diagnostic>) {
    let broker = &config.broker;
    if broker.default_country_code.is_empty()
        || !broker
            .default_country_code
            .chars()
            .all(|c| c.is_ascii_digit())
    {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "value",
            "broker.default_country_code",
            "country code must be one or more digits, without '+'",
        ));
    }
    if broker.address_suffix.is_empty() {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "value",
            "broker.address_suffix",
            "address suffix must not be empty",
        ));
    } else if !broker.address_suffix.starts_with('@') {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "value",
            "broker.address_suffix",
            "address suffix usually starts with '@'",
        ));
    }
    if broker.init_timeout_secs == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "value",
            "broker.init_timeout_secs",
            "initialization timeout must be greater than zero",
        ));
    }
    if broker.logout_timeout_secs == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "value",
            "broker.logout_timeout_secs",
            "zero logout timeout skips graceful logout on every teardown",
        ));
    }

    if config.pairing.module_px == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "value",
            "pairing.module_px",
            "module size must be at least one pixel",
        ));
    }
    if config.pairing.margin_modules < 4 {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "value",
            "pairing.margin_modules",
            "quiet zone below 4 modules may not scan on some phones",
        ));
    }

    if config.sidecar.connect_retries == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "value",
            "sidecar.connect_retries",
            "at least one connection attempt is required",
        ));
    }
    if config.sidecar.send_timeout_secs == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "value",
            "sidecar.send_timeout_secs",
            "send timeout must be greater than zero",
        ));
    }
    if let Some(dir) = config
        .sidecar
        .dir
        .as_ref()
        .filter(|dir| !dir.join("package.json").exists())
    {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "file-ref",
            "sidecar.dir",
            format!("{} does not contain a package.json", dir.display()),
        ));
    }

    let bind = config.server.bind.as_str();
    if !matches!(bind, "127.0.0.1" | "localhost" | "::1") {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "security",
            "server.bind",
            format!(
                "binding to {bind} exposes the unauthenticated session API beyond this host"
            ),
        ));
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
