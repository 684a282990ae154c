//! XDP program lifecycle: load, pin, attach, detach.
//!
//! The kernel BPF facility is driven through bpftool as a subprocess. The
//! precompiled XDP object ships with the installation; this module never
//! compiles BPF code.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cmd::{run_checked, run_privileged};
use crate::{DatapathError, Result};

/// Canonical BPF filesystem mount point; bpftool expects pins under here.
pub const BPF_FS_ROOT: &str = "/sys/fs/bpf";
/// Directory holding this node's program and map pins.
pub const PIN_DIR: &str = "/sys/fs/bpf/vmark";

/// Name of the forwarding hash map inside the XDP object.
const FW_TABLE_MAP: &str = "fw_table";

pub fn prog_pin_path(parent: &str) -> PathBuf {
    PathBuf::from(format!("{PIN_DIR}/xdp_prog_{parent}"))
}

pub fn map_pin_path(parent: &str) -> PathBuf {
    PathBuf::from(format!("{PIN_DIR}/fw_table_{parent}"))
}

/// Make sure the BPF filesystem is mounted, mounting it if necessary.
/// Fatal when the mount fails: nothing can be pinned without it.
pub async fn ensure_bpffs() -> Result<()> {
    let mounts = tokio::fs::read_to_string("/proc/mounts").await?;
    let mounted = mounts
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(BPF_FS_ROOT));
    if mounted {
        debug!("bpffs already mounted at {BPF_FS_ROOT}");
        return Ok(());
    }

    info!("BPF filesystem not mounted, mounting at {BPF_FS_ROOT}");
    let out = run_privileged(&["mount", "-t", "bpf", "bpf", BPF_FS_ROOT]).await?;
    if !out.success {
        return Err(DatapathError::BpfFs(out.output.trim_end().to_string()));
    }
    Ok(())
}

async fn ensure_pin_dir() -> Result<()> {
    let exists = run_privileged(&["ls", PIN_DIR]).await?;
    if exists.success {
        return Ok(());
    }
    run_checked(&["mkdir", "-p", PIN_DIR]).await?;
    Ok(())
}

/// Whether a pin path exists. Pins under bpffs are often root-only, so the
/// check runs privileged rather than stat()ing directly.
async fn pin_exists(path: &Path) -> Result<bool> {
    let out = run_privileged(&["ls", &path.to_string_lossy()]).await?;
    Ok(out.success)
}

/// True when both pins exist and the kernel reports an XDP program on the
/// parent device.
pub async fn is_attached(parent: &str) -> Result<bool> {
    let prog_pin = prog_pin_path(parent);
    let map_pin = map_pin_path(parent);
    if !pin_exists(&prog_pin).await? || !pin_exists(&map_pin).await? {
        return Ok(false);
    }
    let out = run_privileged(&["bpftool", "net", "show", "dev", parent]).await?;
    Ok(out.success && out.output.contains("xdp/"))
}

/// Preferred attach mode for an interface: offload, then driver, then generic.
async fn probe_xdp_mode(parent: &str) -> &'static str {
    for (feature, mode) in [("xdpoffload", "xdpoffload"), ("xdpdrv", "xdpdrv")] {
        match run_privileged(&["bpftool", "feature", "probe", "dev", parent, feature]).await {
            Ok(out) if out.success && out.output.to_lowercase().contains("is supported") => {
                info!(parent, mode, "XDP mode supported");
                return mode;
            }
            Ok(_) => {}
            Err(err) => debug!(parent, feature, %err, "feature probe failed"),
        }
    }
    info!(parent, "falling back to generic XDP mode");
    "xdpgeneric"
}

/// Locate the `fw_table` hash map among a pinned program's maps.
async fn find_fw_table_id(prog_pin: &Path) -> Result<u64> {
    let prog_pin = prog_pin.to_string_lossy();
    let raw = run_checked(&["bpftool", "prog", "show", "pinned", &prog_pin, "--json"]).await?;
    let details: Value = serde_json::from_str(&raw)
        .map_err(|e| DatapathError::Parse(format!("prog show: {e}")))?;
    let map_ids = details
        .get("map_ids")
        .and_then(Value::as_array)
        .ok_or_else(|| DatapathError::Parse("prog show: no map_ids field".into()))?;

    for id in map_ids.iter().filter_map(Value::as_u64) {
        let raw = match run_privileged(&["bpftool", "map", "show", "id", &id.to_string(), "--json"]).await {
            Ok(out) if out.success => out.output,
            _ => continue,
        };
        let Ok(map) = serde_json::from_str::<Value>(&raw) else {
            continue;
        };
        if map.get("name").and_then(Value::as_str) == Some(FW_TABLE_MAP)
            && map.get("type").and_then(Value::as_str) == Some("hash")
        {
            return Ok(id);
        }
    }
    Err(DatapathError::Parse(format!(
        "no '{FW_TABLE_MAP}' hash map among program maps"
    )))
}

/// Load the XDP object, pin program and `fw_table` map for `parent`, and
/// attach with overwrite semantics in the best supported mode.
///
/// Any pre-existing attachment and pins for the parent are force-detached
/// first, so attach is safe to call on a half-torn-down interface.
pub async fn attach(parent: &str, object: &Path) -> Result<()> {
    if !object.exists() {
        return Err(DatapathError::ObjectMissing(object.to_path_buf()));
    }
    ensure_bpffs().await?;
    if let Err(err) = detach_force(parent).await {
        warn!(parent, %err, "pre-attach cleanup reported issues, continuing");
    }
    ensure_pin_dir().await?;

    let prog_pin = prog_pin_path(parent);
    let map_pin = map_pin_path(parent);
    let prog_pin_s = prog_pin.to_string_lossy().into_owned();
    let map_pin_s = map_pin.to_string_lossy().into_owned();
    let object_s = object.to_string_lossy().into_owned();

    run_checked(&["bpftool", "prog", "load", &object_s, &prog_pin_s, "type", "xdp"])
        .await
        .inspect_err(|_| debug!(parent, "program load failed"))?;

    let map_id = match find_fw_table_id(&prog_pin).await {
        Ok(id) => id,
        Err(err) => {
            let _ = run_privileged(&["rm", "-f", &prog_pin_s]).await;
            return Err(err);
        }
    };

    if let Err(err) =
        run_checked(&["bpftool", "map", "pin", "id", &map_id.to_string(), &map_pin_s]).await
    {
        let _ = run_privileged(&["rm", "-f", &prog_pin_s]).await;
        return Err(err);
    }

    let mode = probe_xdp_mode(parent).await;
    let attach_res = run_checked(&[
        "bpftool", "net", "attach", "xdp", "pinned", &prog_pin_s, "dev", parent, "overwrite", mode,
    ])
    .await;
    if let Err(err) = attach_res {
        let _ = run_privileged(&["rm", "-f", &map_pin_s]).await;
        let _ = run_privileged(&["rm", "-f", &prog_pin_s]).await;
        return Err(err);
    }

    info!(parent, mode, "XDP program loaded, pinned and attached");
    Ok(())
}

/// Detach the XDP program from `parent` and remove both pins.
///
/// Idempotent: a missing attachment or missing pins are not errors. Only a
/// failing `rm -f` (a real permission or filesystem problem) is surfaced.
pub async fn detach_force(parent: &str) -> Result<()> {
    let detach = run_privileged(&["bpftool", "net", "detach", "xdp", "dev", parent]).await?;
    if !detach.success {
        debug!(parent, output = %detach.output.trim_end(), "bpftool net detach reported failure, continuing");
    }
    let ip_off = run_privileged(&["ip", "link", "set", "dev", parent, "xdp", "off"]).await?;
    if !ip_off.success {
        debug!(parent, output = %ip_off.output.trim_end(), "ip link xdp off reported failure, continuing");
    }

    for pin in [prog_pin_path(parent), map_pin_path(parent)] {
        let pin_s = pin.to_string_lossy().into_owned();
        let rm = run_privileged(&["rm", "-f", &pin_s]).await?;
        if !rm.success {
            return Err(DatapathError::Tool {
                command: format!("rm -f {pin_s}"),
                output: rm.output.trim_end().to_string(),
            });
        }
    }
    info!(parent, "XDP detached and pins removed");
    Ok(())
}

/// Attach only when the parent does not already carry an active program.
pub async fn ensure_attached(parent: &str, object: &Path) -> Result<()> {
    if is_attached(parent).await? {
        debug!(parent, "XDP program already pinned and attached");
        return Ok(());
    }
    attach(parent, object).await
}
