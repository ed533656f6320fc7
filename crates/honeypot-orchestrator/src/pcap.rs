//! Reconstruct harvested downloads from a sandbox's packet capture
//!
//! The capture sidecar sees every packet on the target container's network
//! namespace. On yield, the orchestrator walks the pcap, groups packets
//! into TCP flows, and tries to recover HTTP request/response pairs so that
//! whatever an attacker downloaded onto the sandbox shows up as a
//! `DownloadEvent` even though the frontend never sees that traffic (it
//! only sees the proxied SSH channel).
//!
//! This is deliberately not a full TCP/IP stack: packets are attributed to
//! a flow and concatenated in capture order with no sequence-number
//! reassembly, matching the honeypot's "plausible, not perfect" fidelity
//! goal (see the purpose/scope non-goals). Only single request/response
//! HTTP exchanges over IPv4/IPv6 + Ethernet captures are recovered.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use honeypot_protocol::{DownloadEvent, SourceAddress};

use crate::sandbox::SandboxError;

const GLOBAL_HEADER_LEN: usize = 24;
const RECORD_HEADER_LEN: usize = 16;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const IP_PROTO_TCP: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    a: (IpAddr, u16),
    b: (IpAddr, u16),
}

impl FlowKey {
    /// Canonicalize so both directions of one TCP connection hash the same.
    fn new(src: (IpAddr, u16), dst: (IpAddr, u16)) -> Self {
        if src <= dst {
            Self { a: src, b: dst }
        } else {
            Self { a: dst, b: src }
        }
    }
}

#[derive(Default)]
struct FlowBytes {
    /// Bytes seen travelling from `a` to `b`.
    a_to_b: Vec<u8>,
    /// Bytes seen travelling from `b` to `a`.
    b_to_a: Vec<u8>,
    last_timestamp_millis: u64,
}

/// Parse `pcap_bytes` and return every HTTP download recoverable from it.
pub fn reconstruct_downloads(pcap_bytes: &[u8]) -> Result<Vec<DownloadEvent>, SandboxError> {
    if pcap_bytes.len() < GLOBAL_HEADER_LEN {
        return Ok(Vec::new());
    }

    let swapped = match u32::from_be_bytes(pcap_bytes[0..4].try_into().unwrap()) {
        0xa1b2_c3d4 => false,
        0xa1b2_3c4d => false, // nanosecond variant, same byte order
        0xd4c3_b2a1 => true,
        0x4d3c_b2a1 => true, // nanosecond variant, swapped
        _ => return Err(SandboxError::PcapParse("unrecognized pcap magic".into())),
    };

    let mut flows: HashMap<FlowKey, FlowBytes> = HashMap::new();
    let mut offset = GLOBAL_HEADER_LEN;

    while offset + RECORD_HEADER_LEN <= pcap_bytes.len() {
        let header = &pcap_bytes[offset..offset + RECORD_HEADER_LEN];
        let ts_sec = read_u32(header, 0, swapped);
        let incl_len = read_u32(header, 8, swapped) as usize;
        offset += RECORD_HEADER_LEN;

        if offset + incl_len > pcap_bytes.len() {
            break; // truncated capture, stop rather than index out of bounds
        }
        let packet = &pcap_bytes[offset..offset + incl_len];
        offset += incl_len;

        if let Some((src, dst, payload)) = parse_ethernet_tcp(packet) {
            let key = FlowKey::new(src, dst);
            let flow = flows.entry(key).or_default();
            flow.last_timestamp_millis = ts_sec as u64 * 1000;
            if src <= dst {
                flow.a_to_b.extend_from_slice(payload);
            } else {
                flow.b_to_a.extend_from_slice(payload);
            }
        }
    }

    let mut events = Vec::new();
    for (key, flow) in flows {
        if let Some(event) = http_exchange_from_flow(&key, &flow) {
            events.push(event);
        }
    }
    Ok(events)
}

fn read_u32(buf: &[u8], at: usize, swapped: bool) -> u32 {
    let bytes: [u8; 4] = buf[at..at + 4].try_into().unwrap();
    if swapped {
        u32::from_be_bytes(bytes)
    } else {
        u32::from_le_bytes(bytes)
    }
}

/// Strip Ethernet (with at most one VLAN tag) and IPv4/IPv6 + TCP headers,
/// returning `(src, dst, tcp_payload)`.
fn parse_ethernet_tcp(packet: &[u8]) -> Option<((IpAddr, u16), (IpAddr, u16), &[u8])> {
    if packet.len() < 14 {
        return None;
    }
    let mut cursor = 12;
    let mut ethertype = u16::from_be_bytes([packet[cursor], packet[cursor + 1]]);
    cursor += 2;
    if ethertype == ETHERTYPE_VLAN {
        if packet.len() < cursor + 4 {
            return None;
        }
        ethertype = u16::from_be_bytes([packet[cursor + 2], packet[cursor + 3]]);
        cursor += 4;
    }

    match ethertype {
        ETHERTYPE_IPV4 => parse_ipv4_tcp(&packet[cursor..]),
        ETHERTYPE_IPV6 => parse_ipv6_tcp(&packet[cursor..]),
        _ => None,
    }
}

fn parse_ipv4_tcp(ip: &[u8]) -> Option<((IpAddr, u16), (IpAddr, u16), &[u8])> {
    if ip.len() < 20 {
        return None;
    }
    let ihl = (ip[0] & 0x0f) as usize * 4;
    if ip[9] != IP_PROTO_TCP || ip.len() < ihl {
        return None;
    }
    let src = IpAddr::V4(Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]));
    let dst = IpAddr::V4(Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]));
    parse_tcp(src, dst, &ip[ihl..])
}

fn parse_ipv6_tcp(ip: &[u8]) -> Option<((IpAddr, u16), (IpAddr, u16), &[u8])> {
    if ip.len() < 40 {
        return None;
    }
    if ip[6] != IP_PROTO_TCP {
        return None; // extension headers not handled
    }
    let src = IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(&ip[8..24]).unwrap()));
    let dst = IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(&ip[24..40]).unwrap()));
    parse_tcp(src, dst, &ip[40..])
}

fn parse_tcp<'a>(
    src_ip: IpAddr,
    dst_ip: IpAddr,
    tcp: &'a [u8],
) -> Option<((IpAddr, u16), (IpAddr, u16), &'a [u8])> {
    if tcp.len() < 20 {
        return None;
    }
    let src_port = u16::from_be_bytes([tcp[0], tcp[1]]);
    let dst_port = u16::from_be_bytes([tcp[2], tcp[3]]);
    let data_offset = ((tcp[12] >> 4) & 0x0f) as usize * 4;
    if tcp.len() < data_offset {
        return None;
    }
    Some(((src_ip, src_port), (dst_ip, dst_port), &tcp[data_offset..]))
}

/// Try to recover one HTTP request/response pair from a flow's two
/// directional byte streams, preferring whichever direction parses as a
/// well-formed request line as the "request" side.
fn http_exchange_from_flow(key: &FlowKey, flow: &FlowBytes) -> Option<DownloadEvent> {
    let (request_bytes, response_bytes, responder) = if looks_like_http_request(&flow.a_to_b) {
        (&flow.a_to_b, &flow.b_to_a, key.b)
    } else if looks_like_http_request(&flow.b_to_a) {
        (&flow.b_to_a, &flow.a_to_b, key.a)
    } else {
        return None;
    };

    let mut req_headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut req_headers);
    let req_status = req.parse(request_bytes).ok()?;
    if !req_status.is_complete() {
        return None;
    }
    let path = req.path.unwrap_or("/").to_string();
    let host = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .map(|h| String::from_utf8_lossy(h.value).into_owned());

    let mut resp_headers = [httparse::EMPTY_HEADER; 32];
    let mut resp = httparse::Response::new(&mut resp_headers);
    let resp_status = resp.parse(response_bytes).ok()?;
    let httparse::Status::Complete(header_len) = resp_status else {
        return None;
    };

    let mime_type = resp
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-type"))
        .map(|h| String::from_utf8_lossy(h.value).into_owned())
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let content_length = resp
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .and_then(|v| v.trim().parse::<usize>().ok());

    let is_chunked = resp
        .headers
        .iter()
        .any(|h| h.name.eq_ignore_ascii_case("transfer-encoding") && h.value.eq_ignore_ascii_case(b"chunked"));

    let body = &response_bytes[header_len..];
    let data = if is_chunked {
        dechunk(body)
    } else if let Some(len) = content_length {
        body.get(..len.min(body.len())).unwrap_or(body).to_vec()
    } else {
        body.to_vec()
    };

    if data.is_empty() {
        return None;
    }

    let url = host.map(|h| format!("http://{}{}", h, path));
    let source_address = match responder.0 {
        IpAddr::V4(v4) => SourceAddress::V4(v4),
        IpAddr::V6(v6) => SourceAddress::V6(v6),
    };

    Some(DownloadEvent {
        timestamp_millis: flow.last_timestamp_millis,
        source_address,
        url,
        mime_type,
        data,
    })
}

fn looks_like_http_request(bytes: &[u8]) -> bool {
    let mut headers = [httparse::EMPTY_HEADER; 1];
    let mut req = httparse::Request::new(&mut headers);
    matches!(req.parse(bytes), Ok(httparse::Status::Partial) | Ok(httparse::Status::Complete(_)))
        && req.method.is_some()
}

/// Best-effort chunked-transfer-encoding decoder; malformed chunk framing
/// just stops early and returns whatever was decoded so far.
fn dechunk(mut body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let Some(line_end) = body.windows(2).position(|w| w == b"\r\n") else {
            break;
        };
        let size_line = std::str::from_utf8(&body[..line_end]).unwrap_or("").trim();
        let Ok(size) = usize::from_str_radix(size_line.split(';').next().unwrap_or(""), 16) else {
            break;
        };
        if size == 0 {
            break;
        }
        let chunk_start = line_end + 2;
        if chunk_start + size > body.len() {
            out.extend_from_slice(&body[chunk_start..]);
            break;
        }
        out.extend_from_slice(&body[chunk_start..chunk_start + size]);
        body = &body[chunk_start + size..];
        if body.len() < 2 {
            break;
        }
        body = &body[2..]; // trailing CRLF after each chunk
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dechunk_single_chunk() {
        let input = b"5\r\nhello\r\n0\r\n\r\n";
        assert_eq!(dechunk(input), b"hello");
    }

    #[test]
    fn test_flow_key_is_direction_independent() {
        let a = ("10.0.0.1".parse().unwrap(), 1234u16);
        let b = ("93.184.216.34".parse().unwrap(), 80u16);
        assert_eq!(FlowKey::new(a, b), FlowKey::new(b, a));
    }

    #[test]
    fn test_looks_like_http_request_detects_get() {
        assert!(looks_like_http_request(b"GET /file.bin HTTP/1.1\r\nHost: example.com\r\n\r\n"));
        assert!(!looks_like_http_request(b"not an http request at all"));
    }

    #[test]
    fn test_reconstruct_downloads_empty_capture_returns_empty() {
        let mut header = vec![0u8; GLOBAL_HEADER_LEN];
        header[0..4].copy_from_slice(&0xa1b2c3d4u32.to_le_bytes());
        assert!(reconstruct_downloads(&header).unwrap().is_empty());
    }

    #[test]
    fn test_reconstruct_downloads_rejects_bad_magic() {
        let header = vec![0u8; GLOBAL_HEADER_LEN];
        assert!(reconstruct_downloads(&header).is_err());
    }
}
