//! Per-tenant sidecar process management.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::LazyLock,
    time::Duration,
};

use {
    anyhow::{Context, Result, bail},
    tokio::{
        io::{AsyncBufReadExt, BufReader},
        process::{Child, Command},
        sync::Mutex,
    },
    tracing::{debug, error, info, warn},
};

/// Env var naming the sidecar directory when none is configured.
pub const SIDECAR_DIR_ENV: &str = "CAMPUSLINE_SIDECAR_DIR";

/// Grace period between SIGTERM and kill.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Serializes `npm install`/`npm run build` across tenants starting at once.
static BUILD_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Handle to one tenant's running sidecar.
pub struct SidecarProcess {
    tenant_id: String,
    child: Child,
    port: u16,
}

impl SidecarProcess {
    /// Port the sidecar's WebSocket server listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Stop the process: SIGTERM, then kill if it has not exited in time.
    pub async fn stop(&mut self) {
        let tenant_id = self.tenant_id.as_str();
        info!(tenant_id, "stopping WhatsApp sidecar process");

        #[cfg(unix)]
        {
            use nix::{
                sys::signal::{Signal, kill},
                unistd::Pid,
            };

            if let Some(pid) = self.child.id()
                && let Ok(pid) = i32::try_from(pid)
            {
                let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }

        match tokio::time::timeout(STOP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(tenant_id, ?status, "WhatsApp sidecar process exited");
            },
            Ok(Err(e)) => {
                warn!(tenant_id, error = %e, "error waiting for sidecar process");
            },
            Err(_) => {
                warn!(tenant_id, "sidecar process did not exit gracefully, killing");
                let _ = self.child.kill().await;
            },
        }
    }
}

impl Drop for SidecarProcess {
    fn drop(&mut self) {
        // kill_on_drop reaps the child; this only records it.
        if let Some(pid) = self.child.id() {
            debug!(tenant_id = %self.tenant_id, pid, "dropping sidecar process handle");
        }
    }
}

/// Everything needed to launch one tenant's sidecar.
#[derive(Debug, Clone)]
pub struct SidecarLaunch {
    pub tenant_id: String,
    /// Directory containing the sidecar's `package.json`.
    pub sidecar_dir: PathBuf,
    pub node_binary: String,
    pub port: u16,
    /// Tenant credential store, created if missing.
    pub auth_dir: PathBuf,
    /// How long the process must stay alive to count as started.
    pub startup_grace: Duration,
}

/// Find the sidecar directory.
///
/// Searches in order:
/// 1. Explicit path if provided
/// 2. `CAMPUSLINE_SIDECAR_DIR` environment variable
/// 3. Relative to the executable: `../sidecar/whatsapp-web`
/// 4. Common development paths
pub fn find_sidecar_dir(explicit_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit_path {
        if path.join("package.json").exists() {
            return Ok(path.to_path_buf());
        }
        bail!(
            "sidecar directory does not exist or missing package.json: {}",
            path.display()
        );
    }

    if let Ok(dir) = std::env::var(SIDECAR_DIR_ENV) {
        let path = PathBuf::from(&dir);
        if path.join("package.json").exists() {
            return Ok(path);
        }
        warn!(path = %dir, "{SIDECAR_DIR_ENV} set but package.json not found");
    }

    if let Ok(exe_path) = std::env::current_exe()
        && let Some(exe_dir) = exe_path.parent()
    {
        for rel in ["../sidecar/whatsapp-web", "../../sidecar/whatsapp-web"] {
            let candidate = exe_dir.join(rel);
            if candidate.join("package.json").exists() {
                return Ok(candidate);
            }
        }
    }

    for rel_path in [
        "sidecar/whatsapp-web",
        "../sidecar/whatsapp-web",
        "../../sidecar/whatsapp-web",
    ] {
        let path = PathBuf::from(rel_path);
        if path.join("package.json").exists() {
            return Ok(path.canonicalize().unwrap_or(path));
        }
    }

    bail!(
        "WhatsApp sidecar not found. Set {SIDECAR_DIR_ENV}, configure sidecar.dir, or ensure \
         sidecar/whatsapp-web exists with package.json"
    )
}

/// Locate the Node.js runtime on `PATH` (or accept an explicit path).
pub fn resolve_node(node_binary: &str) -> Result<PathBuf> {
    which::which(node_binary).map_err(|_| {
        anyhow::anyhow!(
            "required runtime `{node_binary}` not found; install Node.js 20+ or set sidecar.node_binary"
        )
    })
}

/// Check if the sidecar has been built (dist/index.js exists).
pub fn is_sidecar_built(sidecar_dir: &Path) -> bool {
    sidecar_dir.join("dist/index.js").exists()
}

pub fn has_node_modules(sidecar_dir: &Path) -> bool {
    sidecar_dir.join("node_modules").exists()
}

/// Ask the OS for a free localhost port.
pub fn allocate_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
        .context("failed to allocate a sidecar port")?;
    Ok(listener.local_addr()?.port())
}

/// Build (if needed) and spawn the sidecar for one tenant.
pub async fn start_sidecar(launch: SidecarLaunch) -> Result<SidecarProcess> {
    let node = resolve_node(&launch.node_binary)?;
    let sidecar_dir = &launch.sidecar_dir;
    let tenant_id = launch.tenant_id.as_str();

    if !sidecar_dir.join("package.json").exists() {
        bail!(
            "WhatsApp sidecar not found at {}. \
             Run `cd {} && npm install && npm run build` first.",
            sidecar_dir.display(),
            sidecar_dir.display()
        );
    }

    ensure_built(sidecar_dir).await?;

    std::fs::create_dir_all(&launch.auth_dir).with_context(|| {
        format!(
            "failed to create credential directory {}",
            launch.auth_dir.display()
        )
    })?;

    info!(
        tenant_id,
        path = %sidecar_dir.display(),
        port = launch.port,
        "starting WhatsApp sidecar process"
    );

    let mut cmd = Command::new(&node);
    cmd.arg("dist/index.js")
        .current_dir(sidecar_dir)
        .env("CAMPUSLINE_SIDECAR_PORT", launch.port.to_string())
        .env("CAMPUSLINE_AUTH_DIR", &launch.auth_dir)
        .env("CAMPUSLINE_TENANT_ID", tenant_id)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn sidecar process")?;

    if let Some(stdout) = child.stdout.take() {
        let tenant_id = launch.tenant_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                forward_log_line(&tenant_id, &line);
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        let tenant_id = launch.tenant_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(target: "whatsapp_sidecar", tenant_id, "{}", line);
            }
        });
    }

    tokio::time::sleep(launch.startup_grace).await;

    match child.try_wait() {
        Ok(Some(status)) => {
            bail!("sidecar process exited immediately with status: {status}");
        },
        Ok(None) => {},
        Err(e) => {
            bail!("failed to check sidecar process status: {e}");
        },
    }

    info!(tenant_id, port = launch.port, "WhatsApp sidecar process started");

    Ok(SidecarProcess {
        tenant_id: launch.tenant_id,
        child,
        port: launch.port,
    })
}

/// Re-emit one line of sidecar stdout. Pino JSON lines keep their level.
fn forward_log_line(tenant_id: &str, line: &str) {
    if line.starts_with('{')
        && let Ok(log) = serde_json::from_str::<serde_json::Value>(line)
    {
        let level = log
            .get("level")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(30);
        let msg = log.get("msg").and_then(|v| v.as_str()).unwrap_or(line);
        match level {
            10 | 20 => debug!(target: "whatsapp_sidecar", tenant_id, "{}", msg),
            30 => info!(target: "whatsapp_sidecar", tenant_id, "{}", msg),
            40 => warn!(target: "whatsapp_sidecar", tenant_id, "{}", msg),
            _ => error!(target: "whatsapp_sidecar", tenant_id, "{}", msg),
        }
        return;
    }
    info!(target: "whatsapp_sidecar", tenant_id, "{}", line);
}

async fn ensure_built(sidecar_dir: &Path) -> Result<()> {
    if is_sidecar_built(sidecar_dir) {
        return Ok(());
    }
    let _guard = BUILD_LOCK.lock().await;
    // Another tenant may have finished the build while we waited.
    if is_sidecar_built(sidecar_dir) {
        return Ok(());
    }

    info!(path = %sidecar_dir.display(), "building WhatsApp sidecar");
    if !has_node_modules(sidecar_dir) {
        run_npm(sidecar_dir, &["install"]).await?;
    }
    run_npm(sidecar_dir, &["run", "build"]).await
}

async fn run_npm(sidecar_dir: &Path, args: &[&str]) -> Result<()> {
    let label = format!("npm {}", args.join(" "));
    info!(path = %sidecar_dir.display(), "running {label} for sidecar");

    let output = Command::new("npm")
        .args(args)
        .current_dir(sidecar_dir)
        .output()
        .await
        .with_context(|| format!("failed to run {label}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{label} failed: {stderr}");
    }

    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_dir_requires_package_json() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_sidecar_dir(Some(dir.path())).unwrap_err();
        assert!(err.to_string().contains("package.json"), "{err}");

        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        assert_eq!(find_sidecar_dir(Some(dir.path())).unwrap(), dir.path());
    }

    #[test]
    fn build_markers() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_sidecar_built(dir.path()));
        assert!(!has_node_modules(dir.path()));

        std::fs::create_dir_all(dir.path().join("dist")).unwrap();
        std::fs::write(dir.path().join("dist/index.js"), "").unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules")).unwrap();
        assert!(is_sidecar_built(dir.path()));
        assert!(has_node_modules(dir.path()));
    }

    #[test]
    fn missing_runtime_is_actionable() {
        let err = resolve_node("campusline-no-such-node-binary").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("required runtime"), "{msg}");
        assert!(msg.contains("campusline-no-such-node-binary"), "{msg}");
    }

    #[test]
    fn allocated_ports_are_nonzero() {
        assert_ne!(allocate_port().unwrap(), 0);
    }

    #[tokio::test]
    async fn start_fails_fast_without_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let result = start_sidecar(SidecarLaunch {
            tenant_id: "school-1".into(),
            sidecar_dir: dir.path().to_path_buf(),
            node_binary: "campusline-no-such-node-binary".into(),
            port: 0,
            auth_dir: dir.path().join("auth"),
            startup_grace: Duration::from_millis(10),
        })
        .await;
        let err = result.err().unwrap();
        assert!(err.to_string().contains("required runtime"), "{err}");
    }
}
