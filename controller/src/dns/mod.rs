//! DNS-SD wire format: encode/decode of mDNS query and response messages
//! (spec §6 "mDNS wire format"). Built on `hickory-proto`'s `Message`/`Name`
//! types rather than hand-rolling the binary format — this crate does not
//! need a full resolver, just the wire codec hickory-proto already exposes.

use std::net::{Ipv4Addr, Ipv6Addr};

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::{A, AAAA, PTR, SRV, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::BinEncodable;

/// Maximum bytes allowed in a single mDNS packet before it must be split
/// into truncated follow-on packets (spec §6).
pub const MAX_PACKET_BYTES: usize = 1500;

/// Record type as used for outgoing queries / known-answer matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QType {
    Ptr,
    Srv,
    Txt,
    A,
    Aaaa,
}

impl QType {
    fn to_hickory(self) -> RecordType {
        match self {
            QType::Ptr => RecordType::PTR,
            QType::Srv => RecordType::SRV,
            QType::Txt => RecordType::TXT,
            QType::A => RecordType::A,
            QType::Aaaa => RecordType::AAAA,
        }
    }

    fn from_hickory(t: RecordType) -> Option<Self> {
        match t {
            RecordType::PTR => Some(QType::Ptr),
            RecordType::SRV => Some(QType::Srv),
            RecordType::TXT => Some(QType::Txt),
            RecordType::A => Some(QType::A),
            RecordType::AAAA => Some(QType::Aaaa),
            _ => None,
        }
    }
}

/// A parsed record value, independent of the wire encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordValue {
    Ptr(String),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    Txt(Vec<(String, String)>),
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
}

impl RecordValue {
    pub fn qtype(&self) -> QType {
        match self {
            RecordValue::Ptr(_) => QType::Ptr,
            RecordValue::Srv { .. } => QType::Srv,
            RecordValue::Txt(_) => QType::Txt,
            RecordValue::A(_) => QType::A,
            RecordValue::Aaaa(_) => QType::Aaaa,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub name: String,
    pub ttl_secs: u32,
    pub value: RecordValue,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub is_response: bool,
    pub truncated: bool,
    pub queries: Vec<(String, QType)>,
    /// Answer + additional sections combined — mDNS responders routinely put
    /// address records in additional data, and the spec's consumers treat
    /// them identically (spec §4.D step 4 reads "addresses from this
    /// message plus cached answers").
    pub records: Vec<ParsedRecord>,
}

fn strip_trailing_dot(s: &str) -> String {
    s.trim_end_matches('.').to_string()
}

fn record_value_from_rdata(rdata: &RData) -> Option<RecordValue> {
    match rdata {
        RData::PTR(PTR(name)) => Some(RecordValue::Ptr(strip_trailing_dot(&name.to_ascii()))),
        RData::SRV(srv) => Some(RecordValue::Srv {
            priority: srv.priority,
            weight: srv.weight,
            port: srv.port,
            target: strip_trailing_dot(&srv.target.to_ascii()),
        }),
        RData::TXT(txt) => {
            let pairs = txt
                .txt_data
                .iter()
                .filter_map(|entry| {
                    let s = String::from_utf8_lossy(entry);
                    match s.split_once('=') {
                        Some((k, v)) => Some((k.to_string(), v.to_string())),
                        None if !s.is_empty() => Some((s.to_string(), String::new())),
                        None => None,
                    }
                })
                .collect();
            Some(RecordValue::Txt(pairs))
        }
        RData::A(A(ip)) => Some(RecordValue::A(*ip)),
        RData::AAAA(AAAA(ip)) => Some(RecordValue::Aaaa(*ip)),
        _ => None,
    }
}

/// Parse a raw mDNS UDP payload. Malformed packets return `None`; the
/// engine logs these at `debug` and drops them (spec §7: "the mDNS engine
/// never surfaces parse failures").
pub fn parse_message(bytes: &[u8]) -> Option<ParsedMessage> {
    let msg = Message::from_vec(bytes).ok()?;
    let is_response = msg.metadata.message_type == MessageType::Response;

    let queries = msg
        .queries
        .iter()
        .filter_map(|q| {
            QType::from_hickory(q.query_type).map(|t| (strip_trailing_dot(&q.name.to_ascii()), t))
        })
        .collect();

    let records = msg
        .answers
        .iter()
        .chain(msg.additionals.iter())
        .filter_map(|r: &Record| {
            record_value_from_rdata(&r.data).map(|value| ParsedRecord {
                name: strip_trailing_dot(&r.name.to_ascii()),
                ttl_secs: r.ttl,
                value,
            })
        })
        .collect();

    Some(ParsedMessage {
        is_response,
        truncated: msg.metadata.truncation,
        queries,
        records,
    })
}

/// A cached record offered as a known-answer suppression hint.
#[derive(Debug, Clone)]
pub struct KnownAnswer {
    pub name: String,
    pub ttl_remaining_secs: u32,
    pub value: RecordValue,
}

fn record_value_to_hickory(name: &Name, ttl: u32, value: &RecordValue) -> Option<Record> {
    let rdata = match value {
        RecordValue::Ptr(target) => RData::PTR(PTR(Name::from_ascii(target).ok()?)),
        RecordValue::Srv {
            priority,
            weight,
            port,
            target,
        } => RData::SRV(SRV::new(*priority, *weight, *port, Name::from_ascii(target).ok()?)),
        RecordValue::Txt(pairs) => RData::TXT(TXT::new(
            pairs
                .iter()
                .map(|(k, v)| {
                    if v.is_empty() {
                        k.clone()
                    } else {
                        format!("{k}={v}")
                    }
                })
                .collect(),
        )),
        RecordValue::A(ip) => RData::A(A(*ip)),
        RecordValue::Aaaa(ip) => RData::AAAA(AAAA(*ip)),
    };
    Some(Record::from_rdata(name.clone(), ttl, rdata))
}

/// Build one or more outbound query packets for the given names/types,
/// packing known-answer suppression records up to [`MAX_PACKET_BYTES`] per
/// packet and marking every packet but the last as truncated (spec §6:
/// "packets over 1500 bytes must split with the Truncated flag set").
pub fn build_queries(queries: &[(String, QType)], known_answers: &[KnownAnswer]) -> Vec<Vec<u8>> {
    let mut msg = Message::query();
    msg.metadata.op_code = OpCode::Query;
    for (name, qtype) in queries {
        let Ok(n) = Name::from_ascii(name) else {
            continue;
        };
        msg.add_query(Query::query(n, qtype.to_hickory()));
    }

    let mut packets = Vec::new();
    let mut pending: Vec<Record> = Vec::new();

    let base_len = msg.to_vec().map(|v| v.len()).unwrap_or(0);
    let mut current_len = base_len;

    for ka in known_answers {
        let Ok(name) = Name::from_ascii(&ka.name) else {
            continue;
        };
        let Some(rec) = record_value_to_hickory(&name, ka.ttl_remaining_secs, &ka.value) else {
            continue;
        };
        let rec_len = rec.to_bytes().map(|b| b.len()).unwrap_or(32);

        if current_len + rec_len > MAX_PACKET_BYTES && !pending.is_empty() {
            let mut packet_msg = msg.clone();
            packet_msg.metadata.truncation = true;
            packet_msg.insert_answers(std::mem::take(&mut pending));
            if let Ok(bytes) = packet_msg.to_vec() {
                packets.push(bytes);
            }
            current_len = base_len;
        }

        pending.push(rec);
        current_len += rec_len;
    }

    let mut last_msg = msg;
    last_msg.insert_answers(pending);
    if let Ok(bytes) = last_msg.to_vec() {
        packets.push(bytes);
    }

    packets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_srv_and_txt() {
        let mut msg = Message::response(1, OpCode::Query);
        let name = Name::from_ascii("foo._matter._tcp.local").unwrap();
        msg.add_answer(Record::from_rdata(
            name.clone(),
            120,
            RData::SRV(SRV::new(0, 0, 5540, Name::from_ascii("foo.local").unwrap())),
        ));
        msg.add_answer(Record::from_rdata(
            name,
            120,
            RData::TXT(TXT::new(vec!["SII=500".to_string(), "ICD=1".to_string()])),
        ));

        let bytes = msg.to_vec().unwrap();
        let parsed = parse_message(&bytes).unwrap();
        assert!(parsed.is_response);
        assert_eq!(parsed.records.len(), 2);
        assert!(matches!(parsed.records[0].value, RecordValue::Srv { port: 5540, .. }));
        match &parsed.records[1].value {
            RecordValue::Txt(pairs) => {
                assert_eq!(pairs[0], ("SII".to_string(), "500".to_string()));
            }
            other => panic!("expected TXT, got {other:?}"),
        }
    }

    #[test]
    fn build_queries_produces_decodable_packet() {
        let packets = build_queries(
            &[("_matter._tcp.local".to_string(), QType::Ptr)],
            &[],
        );
        assert_eq!(packets.len(), 1);
        let parsed = parse_message(&packets[0]).unwrap();
        assert!(!parsed.is_response);
        assert_eq!(parsed.queries, vec![("_matter._tcp.local".to_string(), QType::Ptr)]);
    }

    #[test]
    fn oversize_known_answers_split_into_truncated_packets() {
        let known: Vec<KnownAnswer> = (0..200)
            .map(|i| KnownAnswer {
                name: format!("device-{i}.local"),
                ttl_remaining_secs: 120,
                value: RecordValue::A(Ipv4Addr::new(10, 0, 0, i as u8)),
            })
            .collect();
        let packets = build_queries(&[("_matterc._udp.local".to_string(), QType::Ptr)], &known);
        assert!(packets.len() > 1, "expected known answers to split across packets");
        for p in &packets[..packets.len() - 1] {
            assert!(p.len() <= MAX_PACKET_BYTES + 64);
            let parsed = parse_message(p).unwrap();
            assert!(parsed.truncated);
        }
        let last = parse_message(packets.last().unwrap()).unwrap();
        assert!(!last.truncated);
    }
}
