//! `campusline doctor`: config validation, directory health and a sidecar
//! runtime audit.
//!
//! Prints a structured report with `[ok]`, `[warn]`, `[fail]` or `[info]`
//! per item and exits non-zero when anything failed.

use std::path::Path;

use {
    anyhow::Result,
    campusline_config::{
        CampuslineConfig,
        validate::{self, Severity},
    },
    campusline_whatsapp::{find_sidecar_dir, has_node_modules, is_sidecar_built, resolve_node},
};

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    Warn,
    Fail,
    Info,
}

impl Status {
    fn label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warn => "warn",
            Self::Fail => "fail",
            Self::Info => "info",
        }
    }

    fn color(self) -> &'static str {
        match self {
            Self::Ok => GREEN,
            Self::Warn => YELLOW,
            Self::Fail => RED,
            Self::Info => CYAN,
        }
    }
}

impl From<Severity> for Status {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Error => Self::Fail,
            Severity::Warning => Self::Warn,
            Severity::Info => Self::Info,
        }
    }
}

struct CheckItem {
    status: Status,
    message: String,
}

struct Section {
    title: String,
    items: Vec<CheckItem>,
}

impl Section {
    fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            items: Vec::new(),
        }
    }

    fn push(&mut self, status: Status, message: impl Into<String>) {
        self.items.push(CheckItem {
            status,
            message: message.into(),
        });
    }

    fn count(&self, status: Status) -> usize {
        self.items.iter().filter(|i| i.status == status).count()
    }
}

fn print_report(sections: &[Section]) -> (usize, usize) {
    let mut errors = 0usize;
    let mut warnings = 0usize;

    for section in sections {
        eprintln!("{BOLD}{}{RESET}", section.title);
        for item in &section.items {
            let color = item.status.color();
            let label = item.status.label();
            eprintln!("  [{color}{label}{RESET}]  {}", item.message);
        }
        errors += section.count(Status::Fail);
        warnings += section.count(Status::Warn);
        eprintln!();
    }

    (errors, warnings)
}

pub fn handle_doctor() -> Result<()> {
    eprintln!("{BOLD}campusline doctor{RESET}");
    eprintln!("{BOLD}================={RESET}\n");

    let config = campusline_config::discover_and_load();
    let sections = vec![
        check_config(),
        check_directories(&config),
        check_sidecar(&config),
    ];

    let (errors, warnings) = print_report(&sections);
    eprintln!("{BOLD}Summary:{RESET} {errors} error(s), {warnings} warning(s)");

    if errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn check_config() -> Section {
    let result = validate::validate(None);
    let label = result
        .config_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "defaults".into());
    let mut section = Section::new(format!("Config ({label})"));

    if result
        .diagnostics
        .iter()
        .any(|d| d.category == "syntax" && d.severity == Severity::Error)
    {
        for d in result.diagnostics.iter().filter(|d| d.category == "syntax") {
            section.push(Status::Fail, format!("syntax: {}", d.message));
        }
        return section;
    }
    section.push(Status::Ok, "Syntax valid");

    if result.diagnostics.is_empty() {
        section.push(Status::Ok, "No issues found");
    }
    for d in &result.diagnostics {
        let msg = if d.path.is_empty() {
            d.message.clone()
        } else {
            format!("{}: {}", d.path, d.message)
        };
        section.push(d.severity.into(), msg);
    }
    section
}

fn check_directories(config: &CampuslineConfig) -> Section {
    let mut section = Section::new("Directories");

    match campusline_config::config_dir() {
        Some(dir) if dir.is_dir() => {
            section.push(Status::Ok, format!("Config directory: {}", dir.display()));
        },
        Some(dir) => {
            section.push(
                Status::Info,
                format!("Config directory not created yet: {}", dir.display()),
            );
        },
        None => section.push(Status::Warn, "Unable to resolve config directory"),
    }

    let auth_dir = config.broker.resolved_auth_base_dir();
    if auth_dir.is_dir() {
        section.push(
            Status::Ok,
            format!("Credential store: {}", auth_dir.display()),
        );
        check_writable(&mut section, &auth_dir, "Credential store");
        check_private(&mut section, &auth_dir);
    } else {
        section.push(
            Status::Info,
            format!(
                "Credential store will be created on first initialize: {}",
                auth_dir.display()
            ),
        );
    }

    section
}

fn check_writable(section: &mut Section, dir: &Path, label: &str) {
    let probe = dir.join(".campusline-doctor-probe");
    match std::fs::write(&probe, b"probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
        },
        Err(e) => section.push(Status::Fail, format!("{label} not writable: {e}")),
    }
}

#[cfg(unix)]
fn check_private(section: &mut Section, dir: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(meta) = std::fs::metadata(dir) {
        let mode = meta.permissions().mode();
        if mode & 0o007 != 0 {
            section.push(
                Status::Warn,
                format!(
                    "Credential store is world-accessible (mode {:#05o}, expected 0700)",
                    mode & 0o777
                ),
            );
        }
    }
}

#[cfg(not(unix))]
fn check_private(_section: &mut Section, _dir: &Path) {}

fn check_sidecar(config: &CampuslineConfig) -> Section {
    let mut section = Section::new("WhatsApp sidecar");

    match resolve_node(&config.sidecar.node_binary) {
        Ok(path) => section.push(Status::Ok, format!("Node runtime: {}", path.display())),
        Err(e) => section.push(Status::Fail, e.to_string()),
    }

    match find_sidecar_dir(config.sidecar.dir.as_deref()) {
        Ok(dir) => {
            section.push(Status::Ok, format!("Sidecar directory: {}", dir.display()));
            if has_node_modules(&dir) {
                section.push(Status::Ok, "Dependencies installed");
            } else {
                section.push(
                    Status::Info,
                    "Dependencies not installed (npm install runs on first start)",
                );
            }
            if is_sidecar_built(&dir) {
                section.push(Status::Ok, "Sidecar built");
            } else {
                section.push(Status::Info, "Sidecar not built (builds on first start)");
            }
        },
        Err(e) => section.push(Status::Fail, e.to_string()),
    }

    section
}
