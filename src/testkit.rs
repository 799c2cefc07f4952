//! Hand-assembled sFlow v5 datagrams for tests.
//!
//! The mutators operate on absolute byte offsets, so fixtures are built
//! word-by-word rather than replayed from captures; every builder keeps the
//! 4-byte XDR alignment.

use std::net::IpAddr;

use crate::decoder::{
    ADDRESS_TYPE_IPV4, ADDRESS_TYPE_IPV6, FLOW_TYPE_EXT_GATEWAY, FLOW_TYPE_RAW_PACKET_HEADER,
    SAMPLE_FORMAT_EXPANDED_FLOW, SAMPLE_FORMAT_FLOW,
};

pub(crate) struct Gateway {
    pub next_hop: IpAddr,
    pub router_as: u32,
    pub src_as: u32,
    pub src_peer_as: u32,
    /// Rendered as a single AS_SEQUENCE segment when non-empty.
    pub dst_as_path: Vec<u32>,
    pub communities: Vec<u32>,
    pub local_pref: u32,
}

impl Default for Gateway {
    fn default() -> Self {
        Gateway {
            next_hop: "192.0.2.1".parse().unwrap(),
            router_as: 0,
            src_as: 64500,
            src_peer_as: 0,
            dst_as_path: Vec::new(),
            communities: Vec::new(),
            local_pref: 100,
        }
    }
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn push_addr(out: &mut Vec<u8>, addr: IpAddr) {
    match addr {
        IpAddr::V4(v4) => {
            push_u32(out, ADDRESS_TYPE_IPV4);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            push_u32(out, ADDRESS_TYPE_IPV6);
            out.extend_from_slice(&v6.octets());
        }
    }
}

/// Extended Gateway record payload.
pub(crate) fn gateway_payload(gateway: Gateway) -> Vec<u8> {
    let mut out = Vec::new();
    push_addr(&mut out, gateway.next_hop);
    push_u32(&mut out, gateway.router_as);
    push_u32(&mut out, gateway.src_as);
    push_u32(&mut out, gateway.src_peer_as);

    if gateway.dst_as_path.is_empty() {
        push_u32(&mut out, 0);
    } else {
        push_u32(&mut out, 1); // one segment
        push_u32(&mut out, 2); // AS_SEQUENCE
        push_u32(&mut out, gateway.dst_as_path.len() as u32);
        for asn in &gateway.dst_as_path {
            push_u32(&mut out, *asn);
        }
    }

    push_u32(&mut out, gateway.communities.len() as u32);
    for community in &gateway.communities {
        push_u32(&mut out, *community);
    }
    push_u32(&mut out, gateway.local_pref);
    out
}

fn record(format: u32, payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    push_u32(&mut out, format);
    push_u32(&mut out, payload.len() as u32);
    out.extend_from_slice(&payload);
    out
}

/// Complete Extended Gateway flow record (header + payload).
pub(crate) fn gateway_record(gateway: Gateway) -> Vec<u8> {
    record(FLOW_TYPE_EXT_GATEWAY, gateway_payload(gateway))
}

/// Raw Packet Header record payload carrying an Ethernet frame with the
/// given L3 endpoints. IPv4 and IPv6 frames are supported; mixing families
/// is not.
pub(crate) fn raw_packet_payload(src: IpAddr, dst: IpAddr) -> Vec<u8> {
    let frame = ethernet_frame(src, dst, false);
    raw_payload_for_frame(frame)
}

/// Same as [`raw_packet_payload`] with one 802.1Q tag in front of the inner
/// EtherType.
pub(crate) fn raw_packet_payload_vlan(src: IpAddr, dst: IpAddr) -> Vec<u8> {
    let frame = ethernet_frame(src, dst, true);
    raw_payload_for_frame(frame)
}

fn raw_payload_for_frame(frame: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::new();
    push_u32(&mut out, 1); // protocol: ETHERNET-ISO8023
    push_u32(&mut out, frame.len() as u32 + 4);
    push_u32(&mut out, 4); // stripped FCS
    push_u32(&mut out, frame.len() as u32);
    out.extend_from_slice(&frame);
    while out.len() % 4 != 0 {
        out.push(0);
    }
    out
}

fn ethernet_frame(src: IpAddr, dst: IpAddr, vlan: bool) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]); // dst mac
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]); // src mac
    if vlan {
        frame.extend_from_slice(&0x8100u16.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x64]); // PCP 0, VID 100
    }

    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            frame.extend_from_slice(&0x0800u16.to_be_bytes());
            // Minimal IPv4 header, no options.
            frame.push(0x45);
            frame.push(0);
            frame.extend_from_slice(&20u16.to_be_bytes()); // total length
            frame.extend_from_slice(&[0, 0, 0, 0]); // id + flags
            frame.push(64); // ttl
            frame.push(17); // udp
            frame.extend_from_slice(&[0, 0]); // checksum
            frame.extend_from_slice(&src.octets());
            frame.extend_from_slice(&dst.octets());
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            frame.extend_from_slice(&0x86DDu16.to_be_bytes());
            frame.extend_from_slice(&[0x60, 0, 0, 0]); // version + flow
            frame.extend_from_slice(&0u16.to_be_bytes()); // payload length
            frame.push(17); // next header
            frame.push(64); // hop limit
            frame.extend_from_slice(&src.octets());
            frame.extend_from_slice(&dst.octets());
        }
        _ => panic!("mixed address families in test frame"),
    }
    frame
}

/// Complete Raw Packet Header flow record (header + payload).
pub(crate) fn raw_packet_record(src: IpAddr, dst: IpAddr) -> Vec<u8> {
    record(FLOW_TYPE_RAW_PACKET_HEADER, raw_packet_payload(src, dst))
}

fn flow_sample_payload(records: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    push_u32(&mut out, 1); // sequence
    push_u32(&mut out, 7); // source id: type 0, index 7
    push_u32(&mut out, 1024); // sampling rate
    push_u32(&mut out, 4096); // sample pool
    push_u32(&mut out, 0); // drops
    push_u32(&mut out, 11); // input ifindex
    push_u32(&mut out, 12); // output ifindex
    push_u32(&mut out, records.len() as u32);
    for rec in records {
        out.extend_from_slice(rec);
    }
    out
}

/// Expanded flow sample payload: two words per source id and interface.
pub(crate) fn expanded_flow_sample_payload(records: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    push_u32(&mut out, 1); // sequence
    push_u32(&mut out, 0); // source id type
    push_u32(&mut out, 7); // source id index
    push_u32(&mut out, 1024);
    push_u32(&mut out, 4096);
    push_u32(&mut out, 0);
    push_u32(&mut out, 11); // input ifindex
    push_u32(&mut out, 0); // input format
    push_u32(&mut out, 12); // output ifindex
    push_u32(&mut out, 0); // output format
    push_u32(&mut out, records.len() as u32);
    for rec in records {
        out.extend_from_slice(rec);
    }
    out
}

fn sample(tag: u32, payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    push_u32(&mut out, tag);
    push_u32(&mut out, payload.len() as u32);
    out.extend_from_slice(&payload);
    out
}

/// Complete flow sample (format 1).
pub(crate) fn flow_sample(records: &[Vec<u8>]) -> Vec<u8> {
    sample(SAMPLE_FORMAT_FLOW, flow_sample_payload(records))
}

/// Complete expanded flow sample (format 3).
pub(crate) fn expanded_flow_sample(records: &[Vec<u8>]) -> Vec<u8> {
    sample(
        SAMPLE_FORMAT_EXPANDED_FLOW,
        expanded_flow_sample_payload(records),
    )
}

/// A sample with an arbitrary enterprise/format tag and opaque payload.
pub(crate) fn opaque_sample(enterprise: u32, format: u32, payload: &[u8]) -> Vec<u8> {
    sample((enterprise << 12) | format, payload.to_vec())
}

/// Datagram header (IPv4 agent 192.0.2.10) followed by the given samples.
pub(crate) fn datagram(samples: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    push_u32(&mut out, 5); // version
    push_u32(&mut out, ADDRESS_TYPE_IPV4);
    out.extend_from_slice(&[192, 0, 2, 10]);
    push_u32(&mut out, 1); // sub agent
    push_u32(&mut out, 100); // sequence
    push_u32(&mut out, 1000); // uptime
    push_u32(&mut out, samples.len() as u32);
    for s in samples {
        out.extend_from_slice(s);
    }
    out
}
