//! Link and network header decoding for raw captured frames.
//!
//! Decodes just enough of the Ethernet and IPv4 headers to classify a frame
//! by its endpoint addresses. Length checks happen once per frame, then the
//! fixed-offset reads are infallible.

use std::net::Ipv4Addr;

use thiserror::Error;

/// Ethernet header size in bytes.
const ETH_HEADER_SIZE: usize = 14;

/// Minimum IPv4 header size in bytes.
const IPV4_MIN_HEADER_SIZE: usize = 20;

/// EtherType for IPv4.
const ETHERTYPE_IPV4: u16 = 0x0800;

/// Errors that can occur while decoding a frame.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("frame too short: {size} bytes")]
    Truncated { size: usize },

    #[error("unsupported ethertype: {raw:#06x}")]
    UnsupportedEtherType { raw: u16 },

    #[error("not an IPv4 packet: version {version}")]
    NotIpv4 { version: u8 },
}

/// Endpoint summary of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketSummary {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    /// Full observed frame length in bytes, the unit the pipeline accumulates.
    pub length: u64,
}

/// Decodes the Ethernet + IPv4 headers of a raw frame.
pub fn decode_frame(frame: &[u8]) -> Result<PacketSummary, DecodeError> {
    if frame.len() < ETH_HEADER_SIZE + IPV4_MIN_HEADER_SIZE {
        return Err(DecodeError::Truncated { size: frame.len() });
    }

    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    if ethertype != ETHERTYPE_IPV4 {
        return Err(DecodeError::UnsupportedEtherType { raw: ethertype });
    }

    let ip = &frame[ETH_HEADER_SIZE..];
    let version = ip[0] >> 4;
    if version != 4 {
        return Err(DecodeError::NotIpv4 { version });
    }

    let src = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
    let dst = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);

    Ok(PacketSummary {
        src,
        dst,
        length: frame.len() as u64,
    })
}

#[cfg(test)]
pub(crate) fn build_ipv4_frame(src: Ipv4Addr, dst: Ipv4Addr, payload_len: usize) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETH_HEADER_SIZE + IPV4_MIN_HEADER_SIZE + payload_len);
    frame.extend_from_slice(&[0u8; 12]); // dst + src MAC
    frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    let mut ip = [0u8; IPV4_MIN_HEADER_SIZE];
    ip[0] = 0x45; // version 4, IHL 5
    ip[12..16].copy_from_slice(&src.octets());
    ip[16..20].copy_from_slice(&dst.octets());
    frame.extend_from_slice(&ip);
    frame.extend(std::iter::repeat(0u8).take(payload_len));
    frame
}
