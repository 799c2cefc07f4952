//! sFlow v5 datagram decoding.
//!
//! The decoder walks a datagram into samples and flow records while keeping
//! the absolute byte offset of every element, which is what the enrichment
//! mutators use to edit fields without re-parsing. Parsing is permissive:
//! a truncated sample or record list yields the prefix decoded so far, and
//! unknown formats are carried as opaque payloads so the relay can forward
//! them untouched.
//!
//! Layout reference: https://sflow.org/SFLOW-DATAGRAM5.txt

use std::net::IpAddr;

use crate::xdr;

pub(crate) const ADDRESS_TYPE_IPV4: u32 = 1;
pub(crate) const ADDRESS_TYPE_IPV6: u32 = 2;

// Sample formats under enterprise 0. Counter samples are never touched by
// the enricher but the constant stays for the protocol table.
pub(crate) const SAMPLE_FORMAT_FLOW: u32 = 1;
#[allow(dead_code)]
pub(crate) const SAMPLE_FORMAT_COUNTER: u32 = 2;
pub(crate) const SAMPLE_FORMAT_EXPANDED_FLOW: u32 = 3;

// Flow record formats under enterprise 0.
pub(crate) const FLOW_TYPE_RAW_PACKET_HEADER: u32 = 1;
pub(crate) const FLOW_TYPE_EXT_GATEWAY: u32 = 1003;

const DATAGRAM_MIN_LEN: usize = 28;
const FLOW_SAMPLE_MIN_LEN: usize = 32;
const EXT_GATEWAY_MIN_LEN: usize = 20;

#[derive(Debug, thiserror::Error)]
pub(crate) enum DecodeError {
    #[error("datagram too short: {0} bytes")]
    DatagramTooShort(usize),
    #[error("unsupported sflow version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown address type {0}")]
    UnknownAddressType(u32),
    #[error("flow sample too short: {0} bytes")]
    FlowSampleTooShort(usize),
    #[error("extended gateway too short: {0} bytes")]
    ExtendedGatewayTooShort(usize),
}

/// One sample as found in the datagram. The tag word splits into an
/// enterprise code (high 20 bits) and a format code (low 12 bits); non-zero
/// enterprises are vendor extensions and stay opaque.
#[derive(Debug)]
pub(crate) struct Sample<'a> {
    pub enterprise: u32,
    pub format: u32,
    pub length: u32,
    /// Absolute offset of the sample header within the datagram.
    pub offset: usize,
    pub data: &'a [u8],
}

#[derive(Debug)]
pub(crate) struct Datagram<'a> {
    pub version: u32,
    pub agent_addr: IpAddr,
    pub sub_agent_id: u32,
    pub sequence_number: u32,
    pub uptime: u32,
    pub sample_count: u32,
    pub samples: Vec<Sample<'a>>,
    pub raw: &'a [u8],
}

impl<'a> Datagram<'a> {
    pub(crate) fn parse(data: &'a [u8]) -> Result<Datagram<'a>, DecodeError> {
        if data.len() < DATAGRAM_MIN_LEN {
            return Err(DecodeError::DatagramTooShort(data.len()));
        }

        let version = xdr::read_u32(data, 0).unwrap();
        if version != 5 {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let addr_type = xdr::read_u32(data, 4).unwrap();
        let (agent_addr, mut offset) = match addr_type {
            ADDRESS_TYPE_IPV4 => {
                let octets: [u8; 4] = data[8..12].try_into().unwrap();
                (IpAddr::from(octets), 12)
            }
            ADDRESS_TYPE_IPV6 => {
                let bytes = xdr::slice(data, 8, 16)
                    .ok_or(DecodeError::DatagramTooShort(data.len()))?;
                let octets: [u8; 16] = bytes.try_into().unwrap();
                (IpAddr::from(octets), 24)
            }
            other => return Err(DecodeError::UnknownAddressType(other)),
        };

        let header_short = || DecodeError::DatagramTooShort(data.len());
        let sub_agent_id = xdr::read_u32(data, offset).ok_or_else(header_short)?;
        let sequence_number = xdr::read_u32(data, offset + 4).ok_or_else(header_short)?;
        let uptime = xdr::read_u32(data, offset + 8).ok_or_else(header_short)?;
        let sample_count = xdr::read_u32(data, offset + 12).ok_or_else(header_short)?;
        offset += 16;

        // Best-effort sample walk: stop at the first element whose header or
        // payload would leave the buffer, keeping what was decoded so far.
        let mut samples = Vec::new();
        for _ in 0..sample_count {
            let Some(tag) = xdr::read_u32(data, offset) else {
                break;
            };
            let Some(length) = xdr::read_u32(data, offset + 4) else {
                break;
            };
            let Some(payload) = xdr::slice(data, offset + 8, length as usize) else {
                break;
            };

            samples.push(Sample {
                enterprise: tag >> 12,
                format: tag & 0xFFF,
                length,
                offset,
                data: payload,
            });
            offset += 8 + length as usize;
        }

        Ok(Datagram {
            version,
            agent_addr,
            sub_agent_id,
            sequence_number,
            uptime,
            sample_count,
            samples,
            raw: data,
        })
    }

    /// Re-serialises the datagram. For a fully parsed input this reproduces
    /// the original bytes exactly.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.raw.len());
        out.extend_from_slice(&self.version.to_be_bytes());
        match self.agent_addr {
            IpAddr::V4(addr) => {
                out.extend_from_slice(&ADDRESS_TYPE_IPV4.to_be_bytes());
                out.extend_from_slice(&addr.octets());
            }
            IpAddr::V6(addr) => {
                out.extend_from_slice(&ADDRESS_TYPE_IPV6.to_be_bytes());
                out.extend_from_slice(&addr.octets());
            }
        }
        out.extend_from_slice(&self.sub_agent_id.to_be_bytes());
        out.extend_from_slice(&self.sequence_number.to_be_bytes());
        out.extend_from_slice(&self.uptime.to_be_bytes());
        out.extend_from_slice(&self.sample_count.to_be_bytes());
        for sample in &self.samples {
            out.extend_from_slice(&((sample.enterprise << 12) | sample.format).to_be_bytes());
            out.extend_from_slice(&sample.length.to_be_bytes());
            out.extend_from_slice(sample.data);
        }
        out
    }
}

/// One flow record inside a flow sample.
#[derive(Debug)]
pub(crate) struct FlowRecord<'a> {
    pub enterprise: u32,
    pub format: u32,
    pub length: u32,
    /// Offset of the record header within the flow-sample payload.
    pub offset: usize,
    pub data: &'a [u8],
}

#[derive(Debug)]
pub(crate) struct FlowSample<'a> {
    pub sequence_number: u32,
    pub source_id_type: u32,
    pub source_id_index: u32,
    pub sampling_rate: u32,
    pub sample_pool: u32,
    pub drops: u32,
    pub input: u32,
    pub output: u32,
    pub record_count: u32,
    pub records: Vec<FlowRecord<'a>>,
}

impl<'a> FlowSample<'a> {
    /// Parses a flow-sample payload. `expanded` selects the expanded header
    /// shape: two full words for the source id and for each interface, with
    /// the format word of each interface discarded.
    pub(crate) fn parse(data: &'a [u8], expanded: bool) -> Result<FlowSample<'a>, DecodeError> {
        if data.len() < FLOW_SAMPLE_MIN_LEN {
            return Err(DecodeError::FlowSampleTooShort(data.len()));
        }

        let short = || DecodeError::FlowSampleTooShort(data.len());
        let mut offset = 0;

        let sequence_number = xdr::read_u32(data, offset).ok_or_else(short)?;
        offset += 4;

        let (source_id_type, source_id_index) = if expanded {
            let id_type = xdr::read_u32(data, offset).ok_or_else(short)?;
            let id_index = xdr::read_u32(data, offset + 4).ok_or_else(short)?;
            offset += 8;
            (id_type, id_index)
        } else {
            let source_id = xdr::read_u32(data, offset).ok_or_else(short)?;
            offset += 4;
            (source_id >> 24, source_id & 0x00FF_FFFF)
        };

        let sampling_rate = xdr::read_u32(data, offset).ok_or_else(short)?;
        let sample_pool = xdr::read_u32(data, offset + 4).ok_or_else(short)?;
        let drops = xdr::read_u32(data, offset + 8).ok_or_else(short)?;
        offset += 12;

        let (input, output) = if expanded {
            let input = xdr::read_u32(data, offset).ok_or_else(short)?;
            let output = xdr::read_u32(data, offset + 8).ok_or_else(short)?;
            offset += 16;
            (input, output)
        } else {
            let input = xdr::read_u32(data, offset).ok_or_else(short)?;
            let output = xdr::read_u32(data, offset + 4).ok_or_else(short)?;
            offset += 8;
            (input, output)
        };

        let record_count = xdr::read_u32(data, offset).ok_or_else(short)?;
        offset += 4;

        let mut records = Vec::new();
        for _ in 0..record_count {
            let Some(tag) = xdr::read_u32(data, offset) else {
                break;
            };
            let Some(length) = xdr::read_u32(data, offset + 4) else {
                break;
            };
            let Some(payload) = xdr::slice(data, offset + 8, length as usize) else {
                break;
            };

            records.push(FlowRecord {
                enterprise: tag >> 12,
                format: tag & 0xFFF,
                length,
                offset,
                data: payload,
            });
            offset += 8 + length as usize;
        }

        Ok(FlowSample {
            sequence_number,
            source_id_type,
            source_id_index,
            sampling_rate,
            sample_pool,
            drops,
            input,
            output,
            record_count,
            records,
        })
    }
}

/// Parsed Extended Gateway (format 1003) payload. The destination AS path is
/// flattened across segments; `dst_as_path_len` keeps the on-wire segment
/// count, which is what the enricher gates the splice on.
#[derive(Debug)]
pub(crate) struct ExtendedGateway {
    pub next_hop: IpAddr,
    pub router_as: u32,
    pub src_as: u32,
    pub src_peer_as: u32,
    pub dst_as_path_len: u32,
    pub dst_as_path: Vec<u32>,
    pub communities_len: u32,
    pub communities: Vec<u32>,
    pub local_pref: u32,
}

impl ExtendedGateway {
    pub(crate) fn parse(data: &[u8]) -> Result<ExtendedGateway, DecodeError> {
        if data.len() < EXT_GATEWAY_MIN_LEN {
            return Err(DecodeError::ExtendedGatewayTooShort(data.len()));
        }

        let short = || DecodeError::ExtendedGatewayTooShort(data.len());
        let next_hop_type = xdr::read_u32(data, 0).ok_or_else(short)?;
        let (next_hop, mut offset) = match next_hop_type {
            ADDRESS_TYPE_IPV4 => {
                let bytes = xdr::slice(data, 4, 4).ok_or_else(short)?;
                let octets: [u8; 4] = bytes.try_into().unwrap();
                (IpAddr::from(octets), 8)
            }
            ADDRESS_TYPE_IPV6 => {
                let bytes = xdr::slice(data, 4, 16).ok_or_else(short)?;
                let octets: [u8; 16] = bytes.try_into().unwrap();
                (IpAddr::from(octets), 20)
            }
            other => return Err(DecodeError::UnknownAddressType(other)),
        };

        let router_as = xdr::read_u32(data, offset).ok_or_else(short)?;
        let src_as = xdr::read_u32(data, offset + 4).ok_or_else(short)?;
        let src_peer_as = xdr::read_u32(data, offset + 8).ok_or_else(short)?;
        offset += 12;

        // Path, communities and local pref each gate on bytes remaining:
        // routers commonly truncate the record after the AS fields.
        let mut dst_as_path_len = 0;
        let mut dst_as_path = Vec::new();
        if let Some(count) = xdr::read_u32(data, offset) {
            dst_as_path_len = count;
            offset += 4;

            for _ in 0..count {
                if offset + 8 > data.len() {
                    break;
                }
                // Segment: type word, length word, then that many ASNs.
                let seg_len = xdr::read_u32(data, offset + 4).unwrap();
                offset += 8;
                for _ in 0..seg_len {
                    let Some(asn) = xdr::read_u32(data, offset) else {
                        break;
                    };
                    dst_as_path.push(asn);
                    offset += 4;
                }
            }
        }

        let mut communities_len = 0;
        let mut communities = Vec::new();
        if let Some(count) = xdr::read_u32(data, offset) {
            communities_len = count;
            offset += 4;
            for _ in 0..count {
                let Some(value) = xdr::read_u32(data, offset) else {
                    break;
                };
                communities.push(value);
                offset += 4;
            }
        }

        let local_pref = xdr::read_u32(data, offset).unwrap_or(0);

        Ok(ExtendedGateway {
            next_hop,
            router_as,
            src_as,
            src_peer_as,
            dst_as_path_len,
            dst_as_path,
            communities_len,
            communities,
            local_pref,
        })
    }
}

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;

/// Extracts the sampled frame's L3 source and destination addresses from a
/// Raw Packet Header record payload.
///
/// The payload is protocol (4) + frame length (4) + stripped (4) + header
/// length (4) followed by the captured bytes, which are interpreted as an
/// Ethernet frame with at most one 802.1Q tag. Each side independently
/// degrades to `None` when the capture is too short.
pub(crate) fn raw_packet_src_dst(data: &[u8]) -> (Option<IpAddr>, Option<IpAddr>) {
    let Some(header_len) = xdr::read_u32(data, 12) else {
        return (None, None);
    };
    if data.len() <= 16 {
        return (None, None);
    }
    let captured_len = (header_len as usize).min(data.len() - 16);
    let frame = &data[16..16 + captured_len];

    let Some(mut ether_type) = xdr::read_u16(frame, 12) else {
        return (None, None);
    };
    let mut ip_offset = 14;
    if ether_type == ETHERTYPE_VLAN {
        match xdr::read_u16(frame, 16) {
            Some(inner) => {
                ether_type = inner;
                ip_offset = 18;
            }
            None => return (None, None),
        }
    }

    match ether_type {
        ETHERTYPE_IPV4 => (
            ipv4_at(frame, ip_offset + 12),
            ipv4_at(frame, ip_offset + 16),
        ),
        ETHERTYPE_IPV6 => (
            ipv6_at(frame, ip_offset + 8),
            ipv6_at(frame, ip_offset + 24),
        ),
        _ => (None, None),
    }
}

fn ipv4_at(frame: &[u8], offset: usize) -> Option<IpAddr> {
    let octets: [u8; 4] = xdr::slice(frame, offset, 4)?.try_into().unwrap();
    Some(IpAddr::from(octets))
}

fn ipv6_at(frame: &[u8], offset: usize) -> Option<IpAddr> {
    let octets: [u8; 16] = xdr::slice(frame, offset, 16)?.try_into().unwrap();
    Some(IpAddr::from(octets))
}
