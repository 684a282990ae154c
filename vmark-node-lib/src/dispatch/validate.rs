//! Boundary validation of operator/controller-supplied argument values.
//! Every parser returns a one-line message suitable for echoing back.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::error::{NodeError, Result};
use crate::twamp::{dscp, IpVersion};

pub fn parse_port(value: &str) -> Result<u16> {
    let port: u32 = value
        .parse()
        .map_err(|_| NodeError::Validation(format!("Invalid port number '{value}'")))?;
    if !(1024..=65535).contains(&port) {
        return Err(NodeError::Validation(format!(
            "Invalid port {port}: must be between 1024 and 65535"
        )));
    }
    Ok(port as u16)
}

pub fn parse_vlan(label: &str, value: &str) -> Result<u16> {
    let vlan: u32 = value
        .parse()
        .map_err(|_| NodeError::Validation(format!("Invalid {label} '{value}': must be an integer")))?;
    if !(1..=4094).contains(&vlan) {
        return Err(NodeError::Validation(format!(
            "Invalid {label} {vlan}: must be 1-4094"
        )));
    }
    Ok(vlan as u16)
}

/// VLAN value or the literal `null`.
pub fn parse_vlan_or_null(label: &str, value: &str) -> Result<Option<u16>> {
    if value.eq_ignore_ascii_case("null") {
        return Ok(None);
    }
    parse_vlan(label, value).map(Some)
}

pub fn parse_pop_tags(value: &str) -> Result<u8> {
    match value {
        "0" => Ok(0),
        "1" => Ok(1),
        "2" => Ok(2),
        other => Err(NodeError::Validation(format!(
            "Invalid pop_tags '{other}': must be 0, 1, or 2"
        ))),
    }
}

pub fn parse_count(value: &str) -> Result<u32> {
    let count: u32 = value
        .parse()
        .map_err(|_| NodeError::Validation(format!("Invalid count '{value}'")))?;
    if !(1..=9999).contains(&count) {
        return Err(NodeError::Validation(format!(
            "Invalid count {count}: must be 1-9999"
        )));
    }
    Ok(count)
}

/// Interval is entered in milliseconds and handed to the sender as seconds.
pub fn parse_interval_ms(value: &str) -> Result<Duration> {
    let ms: u64 = value
        .parse()
        .map_err(|_| NodeError::Validation(format!("Invalid interval '{value}'")))?;
    if !(1..=60_000).contains(&ms) {
        return Err(NodeError::Validation(format!(
            "Invalid interval {ms}: must be 1-60000 milliseconds"
        )));
    }
    Ok(Duration::from_millis(ms))
}

pub fn parse_padding(value: &str) -> Result<usize> {
    let padding: usize = value
        .parse()
        .map_err(|_| NodeError::Validation(format!("Invalid padding '{value}'")))?;
    if padding > 9000 {
        return Err(NodeError::Validation(format!(
            "Invalid padding {padding}: must be 0-9000 bytes"
        )));
    }
    Ok(padding)
}

pub fn parse_ttl(value: &str) -> Result<u32> {
    let ttl: u32 = value
        .parse()
        .map_err(|_| NodeError::Validation(format!("Invalid ttl '{value}'")))?;
    if !(1..=255).contains(&ttl) {
        return Err(NodeError::Validation(format!("Invalid ttl {ttl}: must be 1-255")));
    }
    Ok(ttl)
}

pub fn parse_tos(value: &str) -> Result<u32> {
    let tos: u32 = value
        .parse()
        .map_err(|_| NodeError::Validation(format!("Invalid tos '{value}'")))?;
    if tos > 255 {
        return Err(NodeError::Validation(format!("Invalid tos {tos}: must be 0-255")));
    }
    Ok(tos)
}

/// DSCP by name (`ef`, `af11`, ...) or numeric 0-63; the returned value is
/// already shifted into the ToS byte.
pub fn parse_dscp(value: &str) -> Result<u32> {
    if let Some(dscp) = dscp::lookup(value) {
        return Ok(u32::from(dscp) << 2);
    }
    let dscp: u32 = value.parse().map_err(|_| {
        NodeError::Validation(format!(
            "Invalid DSCP '{value}': use a name from 'twamp dscptable' or 0-63"
        ))
    })?;
    if dscp > 63 {
        return Err(NodeError::Validation(format!("Invalid DSCP {dscp}: must be 0-63")));
    }
    Ok(dscp << 2)
}

pub fn parse_timer_secs(value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| NodeError::Validation(format!("Invalid timer '{value}': seconds expected")))
}

/// Destination or listen address of the requested family.
pub fn parse_ip(version: IpVersion, value: &str) -> Result<IpAddr> {
    let ip: IpAddr = value
        .parse()
        .map_err(|_| NodeError::Validation(format!("Invalid IP address '{value}'")))?;
    match (version, ip) {
        (IpVersion::V4, IpAddr::V4(_)) | (IpVersion::V6, IpAddr::V6(_)) => Ok(ip),
        _ => Err(NodeError::Validation(format!(
            "Address '{value}' does not match {version}"
        ))),
    }
}

pub fn parse_mtu(value: &str) -> Result<u32> {
    let mtu: u32 = value
        .parse()
        .map_err(|_| NodeError::Validation(format!("Invalid MTU '{value}': must be an integer")))?;
    if !(1000..=10000).contains(&mtu) {
        return Err(NodeError::Validation(format!(
            "Invalid MTU {mtu}: must be between 1000 and 10000"
        )));
    }
    Ok(mtu)
}

pub fn parse_ipv4(value: &str) -> Result<Ipv4Addr> {
    value
        .parse()
        .map_err(|_| NodeError::Validation(format!("Invalid IPv4 address '{value}'")))
}

/// Netmask as `/N` (0-32) or a contiguous dotted mask; returns the prefix
/// length either way.
pub fn parse_netmask(value: &str) -> Result<u8> {
    if let Some(prefix) = value.strip_prefix('/') {
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| NodeError::Validation(format!("Invalid CIDR prefix '{value}'")))?;
        if prefix > 32 {
            return Err(NodeError::Validation(format!(
                "Invalid CIDR prefix '{value}': must be between /0 and /32"
            )));
        }
        return Ok(prefix);
    }

    let mask: Ipv4Addr = value.parse().map_err(|_| {
        NodeError::Validation(format!("Invalid netmask format '{value}': must be four octets"))
    })?;
    let bits = u32::from(mask);
    // A contiguous mask has no set bit after a clear bit.
    if bits.leading_ones() != bits.count_ones() {
        return Err(NodeError::Validation(format!(
            "Invalid netmask '{value}': not a valid subnet mask pattern"
        )));
    }
    Ok(bits.count_ones() as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_range() {
        assert!(parse_port("1024").is_ok());
        assert!(parse_port("65535").is_ok());
        assert!(parse_port("1023").is_err());
        assert!(parse_port("65536").is_err());
        assert!(parse_port("abc").is_err());
    }

    #[test]
    fn test_vlan_range() {
        assert_eq!(parse_vlan("cvlan", "1").unwrap(), 1);
        assert_eq!(parse_vlan("cvlan", "4094").unwrap(), 4094);
        assert!(parse_vlan("cvlan", "0").is_err());
        assert!(parse_vlan("cvlan", "4095").is_err());
    }

    #[test]
    fn test_vlan_null_literal() {
        assert_eq!(parse_vlan_or_null("svlan", "null").unwrap(), None);
        assert_eq!(parse_vlan_or_null("svlan", "NULL").unwrap(), None);
        assert_eq!(parse_vlan_or_null("svlan", "100").unwrap(), Some(100));
    }

    #[test]
    fn test_interval_converts_to_duration() {
        assert_eq!(parse_interval_ms("100").unwrap(), Duration::from_millis(100));
        assert!(parse_interval_ms("0").is_err());
    }

    #[test]
    fn test_dscp_names_and_values() {
        assert_eq!(parse_dscp("ef").unwrap(), 46 << 2);
        assert_eq!(parse_dscp("10").unwrap(), 40);
        assert!(parse_dscp("64").is_err());
        assert!(parse_dscp("wat").is_err());
    }

    #[test]
    fn test_ip_family_must_match() {
        assert!(parse_ip(IpVersion::V4, "192.168.1.1").is_ok());
        assert!(parse_ip(IpVersion::V6, "::1").is_ok());
        assert!(parse_ip(IpVersion::V4, "::1").is_err());
        assert!(parse_ip(IpVersion::V6, "10.0.0.1").is_err());
    }

    #[test]
    fn test_mtu_range() {
        assert!(parse_mtu("1500").is_ok());
        assert!(parse_mtu("999").is_err());
        assert!(parse_mtu("10001").is_err());
    }

    #[test]
    fn test_netmask_cidr() {
        assert_eq!(parse_netmask("/24").unwrap(), 24);
        assert_eq!(parse_netmask("/0").unwrap(), 0);
        assert_eq!(parse_netmask("/32").unwrap(), 32);
        assert!(parse_netmask("/33").is_err());
    }

    #[test]
    fn test_netmask_dotted() {
        assert_eq!(parse_netmask("255.255.255.0").unwrap(), 24);
        assert_eq!(parse_netmask("255.255.0.0").unwrap(), 16);
        assert_eq!(parse_netmask("0.0.0.0").unwrap(), 0);
        // 1-bits after 0-bits are not a mask
        assert!(parse_netmask("255.0.255.0").is_err());
        assert!(parse_netmask("255.255.255").is_err());
    }
}
