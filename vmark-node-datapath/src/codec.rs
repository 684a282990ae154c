//! Wire codec for the `fw_table` BPF hash map.
//!
//! Key and value layouts mirror the C structs in the precompiled XDP object.
//! Both must match byte for byte — the kernel program reads these buffers as
//! `#[repr(C)]` structs compiled for a little-endian target, so all integers
//! are packed little-endian regardless of host order.

use crate::{DatapathError, Result};

/// Packed size of a map key.
pub const KEY_LEN: usize = 16;
/// Packed size of a map value.
pub const VALUE_LEN: usize = 50;
/// Maximum action steps per rule. Must match the XDP object's unroll bound.
pub const MAX_ACTIONS: usize = 5;

const ACTION_STEP_LEN: usize = 8;
const VALUE_PAD_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActionKind {
    None = 0,
    Forward = 1,
    Push = 2,
    Pop = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TagKind {
    None = 0,
    Cvlan = 1,
    Svlan = 2,
}

impl ActionKind {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(ActionKind::None),
            1 => Ok(ActionKind::Forward),
            2 => Ok(ActionKind::Push),
            3 => Ok(ActionKind::Pop),
            other => Err(DatapathError::Codec(format!("unknown action type {other}"))),
        }
    }
}

impl TagKind {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(TagKind::None),
            1 => Ok(TagKind::Cvlan),
            2 => Ok(TagKind::Svlan),
            other => Err(DatapathError::Codec(format!("unknown tag type {other}"))),
        }
    }
}

/// Lookup key for the forwarding map.
///
/// Layout: `ifindex: u32 | vlan_id: u16 | svlan_id: u16 | bmac: [u8; 6] |
/// pad: [u8; 2]`. Absent VLANs are encoded as 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FwKey {
    pub ifindex: u32,
    pub vlan_id: u16,
    pub svlan_id: u16,
    pub bmac: [u8; 6],
}

impl FwKey {
    pub fn new(ifindex: u32, vlan_id: Option<u16>, svlan_id: Option<u16>) -> Self {
        Self {
            ifindex,
            vlan_id: vlan_id.unwrap_or(0),
            svlan_id: svlan_id.unwrap_or(0),
            bmac: [0u8; 6],
        }
    }

    pub fn pack(&self) -> [u8; KEY_LEN] {
        let mut buf = [0u8; KEY_LEN];
        buf[0..4].copy_from_slice(&self.ifindex.to_le_bytes());
        buf[4..6].copy_from_slice(&self.vlan_id.to_le_bytes());
        buf[6..8].copy_from_slice(&self.svlan_id.to_le_bytes());
        buf[8..14].copy_from_slice(&self.bmac);
        // buf[14..16] stays zero (alignment padding)
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != KEY_LEN {
            return Err(DatapathError::Codec(format!(
                "key is {} bytes, expected {KEY_LEN}",
                data.len()
            )));
        }
        let mut bmac = [0u8; 6];
        bmac.copy_from_slice(&data[8..14]);
        Ok(Self {
            ifindex: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            vlan_id: u16::from_le_bytes([data[4], data[5]]),
            svlan_id: u16::from_le_bytes([data[6], data[7]]),
            bmac,
        })
    }
}

/// One step of a rule's action program.
///
/// Layout: `type: u8 | tag_type: u8 | vlan_id: u16 | target_ifindex: u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionStep {
    pub kind: ActionKind,
    pub tag: TagKind,
    pub vlan_id: u16,
    pub target_ifindex: u32,
}

impl ActionStep {
    pub fn pop(tag: TagKind) -> Self {
        Self { kind: ActionKind::Pop, tag, vlan_id: 0, target_ifindex: 0 }
    }

    pub fn push(tag: TagKind, vlan_id: u16) -> Self {
        Self { kind: ActionKind::Push, tag, vlan_id, target_ifindex: 0 }
    }

    pub fn forward(target_ifindex: u32) -> Self {
        Self { kind: ActionKind::Forward, tag: TagKind::None, vlan_id: 0, target_ifindex }
    }

    fn pack_into(&self, buf: &mut [u8]) {
        buf[0] = self.kind as u8;
        buf[1] = self.tag as u8;
        buf[2..4].copy_from_slice(&self.vlan_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.target_ifindex.to_le_bytes());
    }

    fn parse(data: &[u8]) -> Result<Self> {
        Ok(Self {
            kind: ActionKind::from_u8(data[0])?,
            tag: TagKind::from_u8(data[1])?,
            vlan_id: u16::from_le_bytes([data[2], data[3]]),
            target_ifindex: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
        })
    }
}

/// Pack an action program into the 50-byte map value.
///
/// Layout: `num_actions: u8 | actions: [action_step; 5] | pad: [u8; 9]`.
/// Unused action slots are zeroed. A length other than [`VALUE_LEN`] would
/// mismatch the kernel struct, so that case is unrepresentable here and more
/// than [`MAX_ACTIONS`] steps is an error.
pub fn pack_value(actions: &[ActionStep]) -> Result<[u8; VALUE_LEN]> {
    if actions.len() > MAX_ACTIONS {
        return Err(DatapathError::Codec(format!(
            "{} actions exceed the per-rule maximum of {MAX_ACTIONS}",
            actions.len()
        )));
    }
    let mut buf = [0u8; VALUE_LEN];
    buf[0] = actions.len() as u8;
    for (i, action) in actions.iter().enumerate() {
        let off = 1 + i * ACTION_STEP_LEN;
        action.pack_into(&mut buf[off..off + ACTION_STEP_LEN]);
    }
    debug_assert_eq!(1 + MAX_ACTIONS * ACTION_STEP_LEN + VALUE_PAD_LEN, VALUE_LEN);
    Ok(buf)
}

/// Decode a packed map value back into its action program.
pub fn parse_value(data: &[u8]) -> Result<Vec<ActionStep>> {
    if data.len() != VALUE_LEN {
        return Err(DatapathError::Codec(format!(
            "value is {} bytes, expected {VALUE_LEN}",
            data.len()
        )));
    }
    let num = data[0] as usize;
    if num > MAX_ACTIONS {
        return Err(DatapathError::Codec(format!(
            "value claims {num} actions, maximum is {MAX_ACTIONS}"
        )));
    }
    let mut actions = Vec::with_capacity(num);
    for i in 0..num {
        let off = 1 + i * ACTION_STEP_LEN;
        actions.push(ActionStep::parse(&data[off..off + ACTION_STEP_LEN])?);
    }
    Ok(actions)
}
