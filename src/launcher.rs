//! Runs a verified tool binary as an interactive child process.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use secrecy::ExposeSecret;
use tempfile::TempPath;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::proxy::ProxyInfo;
use crate::{Error, Result};

/// Proxy variables set on the child, in both spellings.
const PROXY_ENV_VARS: [&str; 4] = ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"];

/// Spawn attempts when the fresh copy is still reported busy.
const TEXT_BUSY_RETRIES: u32 = 5;

#[derive(Debug, Clone)]
pub struct Launcher {
    /// Variables pointed at the proxy's CA bundle.
    ca_env_vars: Vec<String>,
}

impl Launcher {
    pub fn new(ca_env_vars: Vec<String>) -> Self {
        Self { ca_env_vars }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(config.child_ca_env_vars.clone())
    }

    /// Run `binary` with `args` and wait for it.
    ///
    /// The binary is copied to a private temporary file first, so the cache
    /// can change underneath a running tool. Standard streams are inherited.
    /// With `proxy`, the child's environment gains the proxy URL and CA bundle.
    ///
    /// Returns `Ok(0)` on success and [`Error::ChildNonZeroExit`] with the
    /// child's code otherwise. Failing to start is [`Error::ChildExec`].
    pub async fn run(&self, binary: &Path, args: &[String], proxy: Option<&ProxyInfo>) -> Result<i32> {
        let copy = private_copy(binary).await?;
        let program = binary.display().to_string();

        let mut cmd = Command::new(&*copy);
        cmd.args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(proxy) = proxy {
            cmd.envs(self.child_env(proxy));
        }
        die_with_parent(&mut cmd);

        let mut child = spawn(&mut cmd, &program).await?;
        info!(program = %program, pid = child.id(), proxied = proxy.is_some(), "started tool");

        let status = wait_or_interrupt(&mut child, &program).await?;
        drop(copy);
        exit_result(status)
    }

    /// Environment additions for a proxied child.
    pub fn child_env(&self, proxy: &ProxyInfo) -> Vec<(String, String)> {
        let url = proxy.proxy_url();
        let ca = proxy.certificate_location.display().to_string();
        PROXY_ENV_VARS
            .iter()
            .map(|key| (key.to_string(), url.expose_secret().to_string()))
            .chain(self.ca_env_vars.iter().map(|key| (key.clone(), ca.clone())))
            .collect()
    }
}

/// Copy `binary` next to itself under a unique name and make it executable.
/// The copy is deleted when the returned path drops.
async fn private_copy(binary: &Path) -> Result<TempPath> {
    let binary = binary.to_path_buf();
    tokio::task::spawn_blocking(move || copy_blocking(&binary))
        .await
        .map_err(|e| Error::io("copy task", std::io::Error::other(e)))?
}

fn copy_blocking(binary: &Path) -> Result<TempPath> {
    let dir: PathBuf = binary
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir);
    let stem = binary
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("tool");

    let mut source = std::fs::File::open(binary)
        .map_err(|e| Error::io(format!("open {}", binary.display()), e))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!("{}.run-", stem))
        .tempfile_in(&dir)
        .map_err(|e| Error::io(format!("create temporary copy in {}", dir.display()), e))?;
    std::io::copy(&mut source, tmp.as_file_mut())
        .map_err(|e| Error::io(format!("copy {}", binary.display()), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::io("sync temporary copy", e))?;

    // Close our write handle before exec.
    let path = tmp.into_temp_path();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))
            .map_err(|e| Error::io(format!("chmod {}", path.display()), e))?;
    }
    debug!(copy = %path.display(), "prepared private copy");
    Ok(path)
}

/// Spawn, retrying briefly on ETXTBSY: another thread may have forked while
/// the copy's write handle was still open.
async fn spawn(cmd: &mut Command, program: &str) -> Result<Child> {
    let mut attempt = 0;
    loop {
        match cmd.spawn() {
            Ok(child) => return Ok(child),
            Err(e) if is_text_busy(&e) && attempt < TEXT_BUSY_RETRIES => {
                attempt += 1;
                debug!(attempt, "executable busy, retrying spawn");
                tokio::time::sleep(Duration::from_millis(20 * u64::from(attempt))).await;
            }
            Err(source) => {
                return Err(Error::ChildExec {
                    program: program.to_string(),
                    source,
                })
            }
        }
    }
}

fn is_text_busy(e: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        e.raw_os_error() == Some(libc::ETXTBSY)
    }
    #[cfg(not(unix))]
    {
        let _ = e;
        false
    }
}

/// Wait for the child. Ctrl-C kills it and still reports its status.
async fn wait_or_interrupt(child: &mut Child, program: &str) -> Result<ExitStatus> {
    tokio::select! {
        status = child.wait() => {
            status.map_err(|e| Error::io(format!("wait for {}", program), e))
        }
        _ = tokio::signal::ctrl_c() => {
            warn!(program = %program, "interrupted, stopping tool");
            if let Err(e) = child.kill().await {
                debug!(error = %e, "kill after interrupt failed");
            }
            child
                .wait()
                .await
                .map_err(|e| Error::io(format!("wait for {}", program), e))
        }
    }
}

fn exit_result(status: ExitStatus) -> Result<i32> {
    match status.code() {
        Some(0) => Ok(0),
        Some(code) => Err(Error::ChildNonZeroExit { code }),
        None => Err(Error::ChildTerminated),
    }
}

/// Ask the kernel to SIGKILL the child if we die first.
#[cfg(target_os = "linux")]
fn die_with_parent(cmd: &mut Command) {
    // SAFETY: prctl is async-signal-safe and touches no shared state.
    unsafe {
        cmd.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn die_with_parent(_cmd: &mut Command) {}
