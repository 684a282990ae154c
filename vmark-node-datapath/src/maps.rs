//! Operations on the pinned `fw_table` map.
//!
//! bpftool is the only writer besides the kernel program itself. Dumps prefer
//! `-j` JSON output; older bpftool builds print plain text for some commands,
//! so a line-oriented fallback parser is kept.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::cmd::{run_checked, run_privileged};
use crate::codec::{FwKey, KEY_LEN};
use crate::iface::base_name;
use crate::loader::map_pin_path;
use crate::{DatapathError, Result};

/// Path of the pinned map for `parent`, when bpftool confirms it exists.
pub async fn pinned_map(parent: &str) -> Result<Option<PathBuf>> {
    let pin = map_pin_path(parent);
    let pin_s = pin.to_string_lossy().into_owned();
    let out = run_privileged(&["bpftool", "map", "show", "pinned", &pin_s]).await?;
    if out.success {
        Ok(Some(pin))
    } else {
        debug!(parent, "no pinned map at {pin_s}");
        Ok(None)
    }
}

/// All keys currently present in a pinned map.
pub async fn dump_keys(map_pin: &Path) -> Result<HashSet<[u8; KEY_LEN]>> {
    let pin_s = map_pin.to_string_lossy().into_owned();

    let json_run = run_privileged(&["bpftool", "-j", "map", "dump", "pinned", &pin_s]).await?;
    if json_run.success {
        if let Some(keys) = parse_dump_json(&json_run.output) {
            return Ok(keys);
        }
        debug!("bpftool JSON dump did not parse, falling back to plain text");
    }

    let plain = run_checked(&["bpftool", "map", "dump", "pinned", &pin_s]).await?;
    Ok(parse_dump_plain(&plain))
}

/// Parse `bpftool -j map dump` output. Handles both the raw form
/// (`"key": ["0x01", ...]`) and the BTF-formatted form
/// (`"key": {"ingress_ifindex": ..., "vlan_id": ..., ...}`).
fn parse_dump_json(raw: &str) -> Option<HashSet<[u8; KEY_LEN]>> {
    let entries: Value = serde_json::from_str(raw).ok()?;
    let entries = entries.as_array()?;
    let mut keys = HashSet::new();
    for entry in entries {
        let key = entry.get("key")?;
        match key {
            Value::Array(bytes) => {
                let parsed: Option<Vec<u8>> = bytes
                    .iter()
                    .map(|b| {
                        b.as_str()
                            .and_then(|s| u8::from_str_radix(s.trim_start_matches("0x"), 16).ok())
                            .or_else(|| b.as_u64().map(|v| v as u8))
                    })
                    .collect();
                let parsed = parsed?;
                if parsed.len() == KEY_LEN {
                    let mut buf = [0u8; KEY_LEN];
                    buf.copy_from_slice(&parsed);
                    keys.insert(buf);
                } else {
                    warn!(len = parsed.len(), "skipping map key of unexpected length");
                }
            }
            Value::Object(fields) => {
                let ifindex = fields.get("ingress_ifindex")?.as_u64()? as u32;
                let vlan_id = fields.get("vlan_id")?.as_u64()? as u16;
                let svlan_id = fields.get("svlan_id")?.as_u64()? as u16;
                let mut key = FwKey::new(ifindex, Some(vlan_id), Some(svlan_id));
                if let Some(bmac) = fields.get("bmac").and_then(Value::as_array) {
                    for (i, b) in bmac.iter().take(6).enumerate() {
                        key.bmac[i] = b.as_u64()? as u8;
                    }
                }
                keys.insert(key.pack());
            }
            _ => return None,
        }
    }
    Some(keys)
}

/// Parse plain-text dump lines of the form
/// `key: 01 00 00 00 64 00 00 00 00 00 00 00 00 00 00 00  value: ...`.
fn parse_dump_plain(raw: &str) -> HashSet<[u8; KEY_LEN]> {
    let mut keys = HashSet::new();
    for line in raw.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("key:") else {
            continue;
        };
        let hex_part = rest.split("value:").next().unwrap_or(rest).trim();
        let bytes: Vec<u8> = hex_part
            .split_whitespace()
            .filter_map(|b| u8::from_str_radix(b.trim_start_matches("0x"), 16).ok())
            .collect();
        if bytes.len() == KEY_LEN {
            let mut buf = [0u8; KEY_LEN];
            buf.copy_from_slice(&bytes);
            keys.insert(buf);
        } else if !bytes.is_empty() {
            warn!(len = bytes.len(), "skipping plain-text map key of unexpected length");
        }
    }
    keys
}

fn hex_args(bytes: &[u8]) -> Vec<String> {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Insert or overwrite one `(key, value)` entry.
pub async fn update_entry(map_pin: &Path, key: &[u8; KEY_LEN], value: &[u8]) -> Result<()> {
    let pin_s = map_pin.to_string_lossy().into_owned();
    let key_hex = hex_args(key);
    let value_hex = hex_args(value);

    let mut args: Vec<&str> = vec!["bpftool", "map", "update", "pinned", &pin_s, "key", "hex"];
    args.extend(key_hex.iter().map(String::as_str));
    args.push("value");
    args.push("hex");
    args.extend(value_hex.iter().map(String::as_str));

    run_checked(&args).await?;
    Ok(())
}

/// Delete one entry by key. An already-absent key is not an error.
pub async fn delete_entry(map_pin: &Path, key: &[u8; KEY_LEN]) -> Result<()> {
    let pin_s = map_pin.to_string_lossy().into_owned();
    let key_hex = hex_args(key);

    let mut args: Vec<&str> = vec!["bpftool", "map", "delete", "pinned", &pin_s, "key", "hex"];
    args.extend(key_hex.iter().map(String::as_str));

    let out = run_privileged(&args).await?;
    if !out.success && !out.output.contains("key not found") {
        return Err(DatapathError::Tool {
            command: format!("bpftool map delete pinned {pin_s}"),
            output: out.output.trim_end().to_string(),
        });
    }
    Ok(())
}

/// Remove every entry by enumerating and deleting keys one by one. No single
/// "flush" command is assumed to exist. A missing map counts as cleared.
pub async fn clear(map_pin: &Path) -> Result<()> {
    let keys = match dump_keys(map_pin).await {
        Ok(keys) => keys,
        Err(DatapathError::Tool { output, .. })
            if output.contains("No such file or directory") || output.contains("map not found") =>
        {
            debug!("map not present, nothing to clear");
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    for key in &keys {
        delete_entry(map_pin, key).await?;
    }
    debug!(entries = keys.len(), "map cleared");
    Ok(())
}

/// Toggle promiscuous mode on an interface. Failures are logged, not fatal:
/// forwarding still works for directly-addressed frames.
pub async fn set_promisc(iface: &str, enable: bool) {
    let mode = if enable { "on" } else { "off" };
    let base = base_name(iface);
    match run_privileged(&["ip", "link", "set", base, "promisc", mode]).await {
        Ok(out) if out.success => debug!(iface = base, mode, "promiscuous mode set"),
        Ok(out) => warn!(iface = base, mode, output = %out.output.trim_end(), "failed to set promiscuous mode"),
        Err(err) => warn!(iface = base, mode, %err, "failed to set promiscuous mode"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dump_json_raw_bytes() {
        let raw = r#"[{"key": ["0x2a","0x00","0x00","0x00","0x64","0x00","0x00","0x00","0x00","0x00","0x00","0x00","0x00","0x00","0x00","0x00"], "value": ["0x00"]}]"#;
        let keys = parse_dump_json(raw).unwrap();
        assert_eq!(keys.len(), 1);
        let key = FwKey::parse(keys.iter().next().unwrap()).unwrap();
        assert_eq!(key.ifindex, 42);
        assert_eq!(key.vlan_id, 100);
        assert_eq!(key.svlan_id, 0);
    }

    #[test]
    fn test_parse_dump_json_btf_fields() {
        let raw = r#"[{"key": {"ingress_ifindex": 7, "vlan_id": 100, "svlan_id": 10, "bmac": [0,0,0,0,0,0]}, "value": {}}]"#;
        let keys = parse_dump_json(raw).unwrap();
        assert!(keys.contains(&FwKey::new(7, Some(100), Some(10)).pack()));
    }

    #[test]
    fn test_parse_dump_json_rejects_garbage() {
        assert!(parse_dump_json("Found 2 elements").is_none());
    }

    #[test]
    fn test_parse_dump_plain() {
        let raw = "key: 2a 00 00 00 64 00 00 00 00 00 00 00 00 00 00 00  value: 01 00\nFound 1 element";
        let keys = parse_dump_plain(raw);
        assert!(keys.contains(&FwKey::new(42, Some(100), None).pack()));
    }

    #[test]
    fn test_parse_dump_plain_skips_short_keys() {
        let keys = parse_dump_plain("key: 01 02 03  value: 00");
        assert!(keys.is_empty());
    }
}
