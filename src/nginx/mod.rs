//! Supervision of the external nginx binary.
//!
//! The proxy pod runs nginx as a sibling process: this module spawns it,
//! restarts it when it dies, and drives configuration updates through the
//! test-then-reload sequence so a broken rendering never reaches the data
//! path.

pub mod config;
pub mod template;

use notify::RecommendedWatcher;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::nginx::config::TemplateConfig;
use crate::nginx::template::{watch_template, NginxTemplate};
use crate::server::ShutdownSignal;

pub const NGINX_BINARY: &str = "/usr/sbin/nginx";
pub const CONFIG_PATH: &str = "/etc/nginx/nginx.conf";
pub const TEMPLATE_PATH: &str = "/etc/nginx/template/nginx.tmpl";

/// Address nginx listens on; used to detect that a dead master has actually
/// released its sockets before respawning.
const LISTEN_ADDR: &str = "127.0.0.1:80";

#[derive(Debug, Error)]
pub enum NginxError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("template error: {0}")]
    Template(#[from] tera::Error),

    #[error("template watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("invalid nginx configuration (empty)")]
    EmptyConfig,

    #[error("nginx configuration test failed:\n{output}")]
    ConfigTest { output: String },

    #[error("nginx reload failed:\n{output}")]
    Reload { output: String },

    #[error("nginx quit failed:\n{output}")]
    Quit { output: String },
}

/// Handle on the supervised nginx process.
pub struct NginxController {
    binary: PathBuf,
    config_path: PathBuf,
    template: Arc<RwLock<NginxTemplate>>,
    stopping: Arc<AtomicBool>,
}

impl NginxController {
    /// Load the template from its default location and start watching it.
    ///
    /// The returned watcher must stay alive for hot reload to keep working.
    pub fn new() -> Result<(Arc<Self>, RecommendedWatcher), NginxError> {
        let template = Arc::new(RwLock::new(NginxTemplate::from_file(Path::new(
            TEMPLATE_PATH,
        ))?));
        let watcher = watch_template(Path::new(TEMPLATE_PATH), template.clone())?;
        let controller = Arc::new(NginxController {
            binary: PathBuf::from(NGINX_BINARY),
            config_path: PathBuf::from(CONFIG_PATH),
            template,
            stopping: Arc::new(AtomicBool::new(false)),
        });
        Ok((controller, watcher))
    }

    /// Spawn nginx and keep it running until shutdown is triggered or
    /// [`stop`](Self::stop) is called.
    ///
    /// nginx goes into its own process group so signals aimed at the agent
    /// do not reach it; the agent must get the chance to restore service
    /// selectors before the proxy goes away. On shutdown the supervisor
    /// stops monitoring and leaves the quit sequence to `stop()`.
    pub fn spawn_supervisor(self: &Arc<Self>, shutdown: ShutdownSignal) -> JoinHandle<()> {
        let ctl = Arc::clone(self);
        let mut shutdown = shutdown;
        tokio::spawn(async move {
            info!("starting nginx process");
            loop {
                if ctl.stopping.load(Ordering::SeqCst) || shutdown.is_triggered() {
                    break;
                }

                let mut cmd = Command::new(&ctl.binary);
                cmd.arg("-c")
                    .arg(&ctl.config_path)
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
                cmd.process_group(0);

                let mut child = match cmd.spawn() {
                    Ok(child) => child,
                    Err(err) => {
                        error!(error = %err, "nginx spawn error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                tokio::select! {
                    status = child.wait() => match status {
                        Ok(status) => {
                            warn!(status = %status, "nginx master process died");
                        }
                        Err(err) => {
                            error!(error = %err, "error waiting on nginx process");
                        }
                    },
                    _ = shutdown.recv() => {
                        // nginx stays up serving traffic; stop() quits it
                        break;
                    }
                }

                if ctl.stopping.load(Ordering::SeqCst) || shutdown.is_triggered() {
                    break;
                }

                // the respawn gate is abandoned if shutdown begins meanwhile
                tokio::select! {
                    _ = wait_for_port_closed(LISTEN_ADDR) => {}
                    _ = shutdown.recv() => break,
                }
                info!("respawning nginx");
            }
        })
    }

    /// Ask nginx to quit gracefully and wait until no nginx process remains.
    pub async fn stop(&self) -> Result<(), NginxError> {
        self.stopping.store(true, Ordering::SeqCst);

        let out = Command::new(&self.binary)
            .arg("-c")
            .arg(&self.config_path)
            .args(["-s", "quit"])
            .output()
            .await?;
        if !out.status.success() {
            return Err(NginxError::Quit {
                output: combined_output(&out),
            });
        }

        while nginx_process_present() {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        info!("nginx process has stopped");
        Ok(())
    }

    /// Render, validate and load a new configuration.
    ///
    /// The rendered config is tested with `nginx -t` against a scratch file;
    /// only a passing config replaces the live one (atomically, via rename)
    /// before the reload signal is sent. On any failure the previous config
    /// stays in service.
    pub async fn on_update(&self, mut cfg: TemplateConfig) -> Result<(), NginxError> {
        cfg.backlog_size = sysctl_somaxconn();
        let worker_processes = cfg.cfg.worker_processes.parse::<i64>().unwrap_or(1);
        cfg.max_open_files = (rlimit_nofile() / worker_processes - 1024).max(1024);
        cfg.is_ipv6_enabled = true;
        cfg.cfg.enable_vts_status = true;

        let content = self.template.read().await.write(&cfg)?;
        self.test_config(&content).await?;

        let dir = self
            .config_path
            .parent()
            .unwrap_or_else(|| Path::new("/tmp"));
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        tokio::fs::write(tmp.path(), &content).await?;
        tmp.persist(&self.config_path)
            .map_err(|err| NginxError::Io(err.error))?;

        let out = Command::new(&self.binary)
            .args(["-s", "reload", "-c"])
            .arg(&self.config_path)
            .output()
            .await?;
        if !out.status.success() {
            return Err(NginxError::Reload {
                output: combined_output(&out),
            });
        }

        Ok(())
    }

    /// Run `nginx -t` against the candidate configuration.
    async fn test_config(&self, content: &str) -> Result<(), NginxError> {
        if content.is_empty() {
            return Err(NginxError::EmptyConfig);
        }

        let tmp = tempfile::NamedTempFile::new()?;
        let mut file = tokio::fs::File::create(tmp.path()).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;

        let out = Command::new(&self.binary)
            .args(["-t", "-c"])
            .arg(tmp.path())
            .output()
            .await?;
        if !out.status.success() {
            return Err(NginxError::ConfigTest {
                output: combined_output(&out),
            });
        }
        Ok(())
    }
}

fn combined_output(out: &std::process::Output) -> String {
    format!(
        "{}{}",
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    )
}

/// Poll until nothing accepts connections on `addr` anymore.
async fn wait_for_port_closed(addr: &str) {
    loop {
        match tokio::time::timeout(Duration::from_secs(1), TcpStream::connect(addr)).await {
            Ok(Ok(conn)) => {
                drop(conn);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            _ => return,
        }
    }
}

/// True if a process named `nginx` exists (via /proc comm scan).
fn nginx_process_present() -> bool {
    let entries = match std::fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(_) => return false,
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str() else { continue };
        if !pid.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) {
            if comm.trim() == "nginx" {
                return true;
            }
        }
    }
    false
}

/// `net.core.somaxconn`, the accept backlog bound for every listen block.
/// Values below 512 (or an unreadable sysctl) fall back to 511.
fn sysctl_somaxconn() -> i64 {
    std::fs::read_to_string("/proc/sys/net/core/somaxconn")
        .ok()
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .filter(|v| *v >= 512)
        .unwrap_or(511)
}

/// Hard `RLIMIT_NOFILE` bound, or 0 when it cannot be read.
fn rlimit_nofile() -> i64 {
    match nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE) {
        Ok((_, hard)) => hard as i64,
        Err(err) => {
            error!(error = %err, "unable to read RLIMIT_NOFILE");
            0
        }
    }
}
