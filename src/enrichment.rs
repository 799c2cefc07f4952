//! In-place AS attribution rewriting for Extended Gateway records.
//!
//! Three fields (router AS, source AS, source peer AS) are fixed-width and
//! rewritten in place. The destination AS path is variable-length: when it
//! is empty the enricher splices a synthesized single-segment path into the
//! packet and propagates the +12 byte growth through the record and sample
//! length prefixes. Offsets recorded by the parser are only valid until the
//! first splice at a lower offset, which is why samples are processed back
//! to front.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::decoder::{
    ADDRESS_TYPE_IPV4, ADDRESS_TYPE_IPV6, Datagram, ExtendedGateway, FLOW_TYPE_EXT_GATEWAY,
    FLOW_TYPE_RAW_PACKET_HEADER, FlowSample, SAMPLE_FORMAT_EXPANDED_FLOW, SAMPLE_FORMAT_FLOW,
    raw_packet_src_dst,
};
use crate::xdr;

const AS_PATH_SEGMENT_SEQUENCE: u32 = 2;

/// A single enrichment rule. Rules are an ordered sequence; matching
/// semantics differ between the source and destination sides (see
/// [`enrich`]).
#[derive(Debug, Clone)]
pub(crate) struct EnrichmentRule {
    pub name: String,
    pub network: IpNet,
    pub match_as: u32,
    pub set_as: u32,
    pub overwrite: bool,
}

struct GatewayFields {
    abs_record_offset: usize,
    record_data_start: usize,
    addr_len: usize,
}

/// Re-validates the sample and record length prefixes and locates the
/// Extended Gateway payload. `record_offset` is relative to the enclosing
/// flow-sample payload, `sample_offset` absolute within the packet.
fn locate_gateway(
    packet: &[u8],
    sample_offset: usize,
    record_offset: usize,
) -> Option<GatewayFields> {
    let sample_len = xdr::read_u32(packet, sample_offset + 4)? as usize;
    let sample_data_start = sample_offset + 8;
    if sample_data_start + sample_len > packet.len() {
        return None;
    }

    let abs_record_offset = sample_data_start + record_offset;
    let record_len = xdr::read_u32(packet, abs_record_offset + 4)? as usize;
    let record_data_start = abs_record_offset + 8;
    if record_data_start + record_len > packet.len() {
        return None;
    }

    let addr_len = match xdr::read_u32(packet, record_data_start)? {
        ADDRESS_TYPE_IPV4 => 4,
        ADDRESS_TYPE_IPV6 => 16,
        _ => return None,
    };

    Some(GatewayFields {
        abs_record_offset,
        record_data_start,
        addr_len,
    })
}

/// Overwrites the router AS field. Length-preserving.
pub(crate) fn set_router_as(
    packet: &mut [u8],
    sample_offset: usize,
    record_offset: usize,
    value: u32,
) -> bool {
    match locate_gateway(packet, sample_offset, record_offset) {
        Some(fields) => xdr::write_u32(
            packet,
            fields.record_data_start + 4 + fields.addr_len,
            value,
        ),
        None => false,
    }
}

/// Overwrites the source AS field. Length-preserving.
pub(crate) fn set_src_as(
    packet: &mut [u8],
    sample_offset: usize,
    record_offset: usize,
    value: u32,
) -> bool {
    match locate_gateway(packet, sample_offset, record_offset) {
        Some(fields) => xdr::write_u32(
            packet,
            fields.record_data_start + 4 + fields.addr_len + 4,
            value,
        ),
        None => false,
    }
}

/// Overwrites the source peer AS field. Length-preserving.
pub(crate) fn set_src_peer_as(
    packet: &mut [u8],
    sample_offset: usize,
    record_offset: usize,
    value: u32,
) -> bool {
    match locate_gateway(packet, sample_offset, record_offset) {
        Some(fields) => xdr::write_u32(
            packet,
            fields.record_data_start + 4 + fields.addr_len + 8,
            value,
        ),
        None => false,
    }
}

/// Splices a single-ASN AS_SEQUENCE path over an empty destination AS path,
/// growing the packet by exactly 12 bytes and rewriting the record and
/// sample length prefixes. On any bounds failure the original buffer comes
/// back untouched with `false`.
pub(crate) fn set_dst_as(
    packet: Vec<u8>,
    sample_offset: usize,
    record_offset: usize,
    value: u32,
) -> (Vec<u8>, bool) {
    let Some(fields) = locate_gateway(&packet, sample_offset, record_offset) else {
        return (packet, false);
    };

    let path_offset = fields.record_data_start + 4 + fields.addr_len + 12;
    let Some(path_len) = xdr::read_u32(&packet, path_offset) else {
        return (packet, false);
    };
    if path_len != 0 {
        return (packet, false);
    }

    let Some(old_record_len) = xdr::read_u32(&packet, fields.abs_record_offset + 4) else {
        return (packet, false);
    };
    let Some(old_sample_len) = xdr::read_u32(&packet, sample_offset + 4) else {
        return (packet, false);
    };

    // Path count 1, one AS_SEQUENCE segment holding exactly the new AS.
    let mut inserted = [0u8; 16];
    inserted[..4].copy_from_slice(&1u32.to_be_bytes());
    inserted[4..8].copy_from_slice(&AS_PATH_SEGMENT_SEQUENCE.to_be_bytes());
    inserted[8..12].copy_from_slice(&1u32.to_be_bytes());
    inserted[12..].copy_from_slice(&value.to_be_bytes());

    let Some(mut out) = xdr::splice(&packet, path_offset, 4, &inserted) else {
        return (packet, false);
    };

    // Both prefixes sit before the splice point, so their offsets hold.
    xdr::write_u32(&mut out, fields.abs_record_offset + 4, old_record_len + 12);
    xdr::write_u32(&mut out, sample_offset + 4, old_sample_len + 12);

    (out, true)
}

fn rule_contains(rule: &EnrichmentRule, ip: Option<IpAddr>) -> bool {
    ip.is_some_and(|ip| rule.network.contains(&ip))
}

/// Applies the rule set to every Extended Gateway record in the datagram
/// and returns the outbound buffer plus whether anything was rewritten. A
/// packet that fails to parse at any level is forwarded verbatim.
///
/// Samples are processed in descending offset order: a destination-path
/// splice shifts every byte after it, so editing back to front keeps the
/// parser's offsets for the samples still to be visited valid.
pub(crate) fn enrich(mut packet: Vec<u8>, rules: &[EnrichmentRule]) -> (Vec<u8>, bool) {
    struct SampleRef {
        enterprise: u32,
        format: u32,
        offset: usize,
        length: usize,
    }

    let samples: Vec<SampleRef> = match Datagram::parse(&packet) {
        Ok(datagram) => datagram
            .samples
            .iter()
            .map(|s| SampleRef {
                enterprise: s.enterprise,
                format: s.format,
                offset: s.offset,
                length: s.length as usize,
            })
            .collect(),
        Err(err) => {
            tracing::debug!("forwarding datagram unmodified: {}", err);
            return (packet, false);
        }
    };

    let mut enriched = false;
    for sample in samples.iter().rev() {
        if sample.enterprise != 0 {
            continue;
        }
        let expanded = match sample.format {
            SAMPLE_FORMAT_FLOW => false,
            SAMPLE_FORMAT_EXPANDED_FLOW => true,
            _ => continue,
        };

        // Decisions for the whole sample are made from this one parse; the
        // mutators below only re-check bounds.
        let (src_ip, dst_ip, gateways) = {
            let Some(data) = xdr::slice(&packet, sample.offset + 8, sample.length) else {
                continue;
            };
            let flow = match FlowSample::parse(data, expanded) {
                Ok(flow) => flow,
                Err(err) => {
                    tracing::debug!("skipping unparseable flow sample: {}", err);
                    continue;
                }
            };

            let (src_ip, dst_ip) = flow
                .records
                .iter()
                .find(|r| r.enterprise == 0 && r.format == FLOW_TYPE_RAW_PACKET_HEADER)
                .map(|r| raw_packet_src_dst(r.data))
                .unwrap_or((None, None));

            let gateways: Vec<(usize, ExtendedGateway)> = flow
                .records
                .iter()
                .filter(|r| r.enterprise == 0 && r.format == FLOW_TYPE_EXT_GATEWAY)
                .filter_map(|r| match ExtendedGateway::parse(r.data) {
                    Ok(gateway) => Some((r.offset, gateway)),
                    Err(err) => {
                        tracing::debug!("skipping unparseable extended gateway: {}", err);
                        None
                    }
                })
                .collect();

            (src_ip, dst_ip, gateways)
        };

        for (record_offset, gateway) in &gateways {
            let record_offset = *record_offset;

            // Source side: the first rule that fires wins. `overwrite`
            // widens the match to any source inside the prefix; otherwise
            // the observed source AS must equal `match_as`.
            for rule in rules {
                let fires = if rule.overwrite {
                    rule_contains(rule, src_ip)
                } else {
                    gateway.src_as == rule.match_as && rule_contains(rule, src_ip)
                };
                if !fires {
                    continue;
                }

                tracing::debug!(
                    "rule {} rewriting src_as {} -> {}",
                    rule.name,
                    gateway.src_as,
                    rule.set_as
                );
                set_src_as(&mut packet, sample.offset, record_offset, rule.set_as);
                enriched = true;

                // Locally originated traffic reports the router itself as
                // the source peer; fill both only when the router left
                // them at 0.
                if gateway.src_peer_as == 0 {
                    set_src_peer_as(&mut packet, sample.offset, record_offset, rule.set_as);
                }
                if gateway.router_as == 0 {
                    set_router_as(&mut packet, sample.offset, record_offset, rule.set_as);
                }
                break;
            }

            // Destination side: only when the path is empty, first prefix
            // match wins. This is the length-changing edit, so it runs
            // after the in-place source edits above.
            if gateway.dst_as_path_len == 0 {
                for rule in rules {
                    if !rule_contains(rule, dst_ip) {
                        continue;
                    }

                    tracing::debug!(
                        "rule {} synthesizing dst_as_path [{}]",
                        rule.name,
                        rule.set_as
                    );
                    let (next, ok) =
                        set_dst_as(packet, sample.offset, record_offset, rule.set_as);
                    packet = next;
                    if ok {
                        enriched = true;
                    }

                    if gateway.router_as == 0 {
                        set_router_as(&mut packet, sample.offset, record_offset, rule.set_as);
                        enriched = true;
                    }
                    break;
                }
            }
        }
    }

    (packet, enriched)
}
