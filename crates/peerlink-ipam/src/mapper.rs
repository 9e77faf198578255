//! Host-bit-preserving address rewriting
//!
//! `remap` keeps the network bits of the target network and the host bits of
//! the source address, so the same host suffix always lands on the same
//! address inside a remapped subnet.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use peerlink_common::{Error, Result, NO_REMAP};

/// Parse an IPv4 address
pub fn parse_address(input: &str) -> Result<Ipv4Addr> {
    input
        .trim()
        .parse()
        .map_err(|e: std::net::AddrParseError| Error::invalid_address(input, e.to_string()))
}

/// Parse an IPv4 CIDR, truncating host bits (`10.0.4.7/24` -> `10.0.4.0/24`)
pub fn parse_cidr(input: &str) -> Result<Ipv4Net> {
    input
        .trim()
        .parse::<Ipv4Net>()
        .map(|n| n.trunc())
        .map_err(|e| Error::invalid_cidr(input, e.to_string()))
}

/// True if the value is the "no remap" sentinel (or empty)
pub fn is_no_remap(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value == NO_REMAP
}

/// Parse a NAT field, mapping the sentinel to `None`
pub fn parse_nat(value: &str) -> Result<Option<Ipv4Net>> {
    if is_no_remap(value) {
        Ok(None)
    } else {
        parse_cidr(value).map(Some)
    }
}

/// Render an optional NAT CIDR, using the sentinel for `None`
pub fn format_nat(nat: Option<Ipv4Net>) -> String {
    nat.map_or_else(|| NO_REMAP.to_string(), |n| n.to_string())
}

/// Rewrite the network bits of `address` with those of `network`
pub fn remap_address(network: Ipv4Net, address: Ipv4Addr) -> Ipv4Addr {
    let mask = u32::from(network.netmask());
    let net = u32::from(network.network());
    Ipv4Addr::from((net & mask) | (u32::from(address) & !mask))
}

/// Remap `source_address` into `target_network`
///
/// The "None" sentinel as target returns the address unchanged.
pub fn remap(target_network: &str, source_address: &str) -> Result<Ipv4Addr> {
    let address = parse_address(source_address)?;
    if is_no_remap(target_network) {
        return Ok(address);
    }
    let network = parse_cidr(target_network)?;
    Ok(remap_address(network, address))
}

/// First address (the network address) of a CIDR
pub fn first_address(network: &str) -> Result<Ipv4Addr> {
    Ok(parse_cidr(network)?.network())
}

/// Prefix length of a CIDR
pub fn mask_length(network: &str) -> Result<u8> {
    Ok(parse_cidr(network)?.prefix_len())
}

/// Re-express a CIDR with a different prefix length
pub fn set_mask_length(network: &str, length: u8) -> Result<Ipv4Net> {
    let net = parse_cidr(network)?;
    Ipv4Net::new(net.network(), length)
        .map(|n| n.trunc())
        .map_err(|e| Error::invalid_cidr(format!("{}/{}", net.network(), length), e.to_string()))
}
