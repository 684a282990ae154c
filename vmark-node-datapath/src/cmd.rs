//! Privileged command execution.
//!
//! bpftool and ip need CAP_NET_ADMIN/CAP_BPF. The node either runs as root or
//! relies on non-interactive sudo; `-n` keeps a misconfigured sudoers from
//! hanging the agent on a password prompt.

use tokio::process::Command;
use tracing::debug;

use crate::{DatapathError, Result};

/// Combined outcome of a privileged command.
pub struct CmdOutput {
    pub success: bool,
    /// stdout and stderr concatenated, stderr last.
    pub output: String,
}

fn running_as_root() -> bool {
    // geteuid() never fails
    unsafe { libc::geteuid() == 0 }
}

/// Run a command with elevated privileges and capture its output.
///
/// Returns `Err` only when the process cannot be spawned; a non-zero exit is
/// reported through [`CmdOutput::success`] so callers can decide whether it is
/// fatal (missing pins during detach are not, for example).
pub async fn run_privileged(args: &[&str]) -> Result<CmdOutput> {
    let mut cmd = if running_as_root() {
        let mut c = Command::new(args[0]);
        c.args(&args[1..]);
        c
    } else {
        let mut c = Command::new("sudo");
        c.arg("-n").args(args);
        c
    };

    let rendered = args.join(" ");
    debug!(command = %rendered, "running privileged command");

    let out = cmd
        .output()
        .await
        .map_err(|source| DatapathError::Spawn { command: rendered.clone(), source })?;

    let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&out.stderr);
    if !stderr.trim().is_empty() {
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output.push_str(stderr.trim_end());
    }

    if !out.status.success() {
        debug!(command = %rendered, status = ?out.status.code(), output = %output.trim_end(), "privileged command failed");
    }

    Ok(CmdOutput { success: out.status.success(), output })
}

/// Like [`run_privileged`] but a non-zero exit becomes an error.
pub async fn run_checked(args: &[&str]) -> Result<String> {
    let out = run_privileged(args).await?;
    if out.success {
        Ok(out.output)
    } else {
        Err(DatapathError::Tool {
            command: args.join(" "),
            output: out.output.trim_end().to_string(),
        })
    }
}
