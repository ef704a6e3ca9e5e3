//! DNS message construction and parsing for the resolver.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const HEADER_LEN: usize = 12;
const MAX_POINTER_HOPS: usize = 16;

pub const QTYPE_A: u16 = 1;
pub const QTYPE_CNAME: u16 = 5;
pub const QTYPE_AAAA: u16 = 28;
pub const QCLASS_IN: u16 = 1;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_NXDOMAIN: u8 = 3;

/// An outgoing recursive query for one name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub id: u16,
    pub domain: String,
    pub qtype: u16,
}

impl DnsQuery {
    pub fn new(id: u16, domain: impl Into<String>, qtype: u16) -> Self {
        Self {
            id,
            domain: domain.into(),
            qtype,
        }
    }

    /// Encode with the recursion-desired flag set.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(HEADER_LEN + self.domain.len() + 6);
        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&[0x01, 0x00]); // RD
        data.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        encode_domain(&mut data, &self.domain);
        data.extend_from_slice(&self.qtype.to_be_bytes());
        data.extend_from_slice(&QCLASS_IN.to_be_bytes());
        data
    }

    /// Parse a single-question query, as sent by [`DnsQuery::to_bytes`].
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN + 1 {
            return None;
        }
        let id = u16::from_be_bytes([data[0], data[1]]);
        let (domain, pos) = read_name(data, HEADER_LEN)?;
        if domain.is_empty() || pos + 4 > data.len() {
            return None;
        }
        let qtype = u16::from_be_bytes([data[pos], data[pos + 1]]);
        Some(Self { id, domain, qtype })
    }
}

/// A DNS response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsResponse {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
}

/// A DNS question section entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// A DNS resource record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl DnsRecord {
    /// The address carried by an A or AAAA record.
    pub fn address(&self) -> Option<IpAddr> {
        match (self.rtype, self.rdata.len()) {
            (QTYPE_A, 4) => {
                let octets: [u8; 4] = self.rdata.as_slice().try_into().ok()?;
                Some(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            (QTYPE_AAAA, 16) => {
                let octets: [u8; 16] = self.rdata.as_slice().try_into().ok()?;
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        }
    }
}

impl DnsResponse {
    /// A successful answer to `query` carrying `addrs`.
    pub fn answer(query: &DnsQuery, addrs: &[IpAddr]) -> Self {
        let answers = addrs
            .iter()
            .map(|addr| {
                let (rtype, rdata) = match addr {
                    IpAddr::V4(v4) => (QTYPE_A, v4.octets().to_vec()),
                    IpAddr::V6(v6) => (QTYPE_AAAA, v6.octets().to_vec()),
                };
                DnsRecord {
                    name: query.domain.clone(),
                    rtype,
                    class: QCLASS_IN,
                    ttl: 300,
                    rdata,
                }
            })
            .collect();
        Self {
            id: query.id,
            flags: 0x8180, // Standard response, recursion available, no error
            questions: vec![DnsQuestion {
                domain: query.domain.clone(),
                qtype: query.qtype,
                qclass: QCLASS_IN,
            }],
            answers,
        }
    }

    /// An error answer to `query` with the given response code.
    pub fn error(query: &DnsQuery, rcode: u8) -> Self {
        let mut response = Self::answer(query, &[]);
        response.flags = 0x8180 | u16::from(rcode & 0x0F);
        response
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000F) as u8
    }

    pub fn is_response(&self) -> bool {
        self.flags & 0x8000 != 0
    }

    /// Addresses of the A/AAAA answers, in record order.
    pub fn addresses(&self) -> Vec<IpAddr> {
        self.answers.iter().filter_map(DnsRecord::address).collect()
    }

    /// Encode the response to wire format bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(512);

        // Header
        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&self.flags.to_be_bytes());
        data.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        data.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

        for q in &self.questions {
            encode_domain(&mut data, &q.domain);
            data.extend_from_slice(&q.qtype.to_be_bytes());
            data.extend_from_slice(&q.qclass.to_be_bytes());
        }

        for a in &self.answers {
            if !self.questions.is_empty() && a.name == self.questions[0].domain {
                data.extend_from_slice(&[0xC0, 0x0C]); // Pointer to offset 12
            } else {
                encode_domain(&mut data, &a.name);
            }
            data.extend_from_slice(&a.rtype.to_be_bytes());
            data.extend_from_slice(&a.class.to_be_bytes());
            data.extend_from_slice(&a.ttl.to_be_bytes());
            data.extend_from_slice(&(a.rdata.len() as u16).to_be_bytes());
            data.extend_from_slice(&a.rdata);
        }

        data
    }

    /// Parse the header, questions and answer section of a response.
    ///
    /// Authority and additional sections are ignored.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }
        let id = u16::from_be_bytes([data[0], data[1]]);
        let flags = u16::from_be_bytes([data[2], data[3]]);
        let qdcount = u16::from_be_bytes([data[4], data[5]]) as usize;
        let ancount = u16::from_be_bytes([data[6], data[7]]) as usize;

        let mut pos = HEADER_LEN;
        let mut questions = Vec::with_capacity(qdcount);
        for _ in 0..qdcount {
            let (domain, next) = read_name(data, pos)?;
            if next + 4 > data.len() {
                return None;
            }
            questions.push(DnsQuestion {
                domain,
                qtype: u16::from_be_bytes([data[next], data[next + 1]]),
                qclass: u16::from_be_bytes([data[next + 2], data[next + 3]]),
            });
            pos = next + 4;
        }

        let mut answers = Vec::with_capacity(ancount);
        for _ in 0..ancount {
            let (name, next) = read_name(data, pos)?;
            if next + 10 > data.len() {
                return None;
            }
            let rtype = u16::from_be_bytes([data[next], data[next + 1]]);
            let class = u16::from_be_bytes([data[next + 2], data[next + 3]]);
            let ttl = u32::from_be_bytes([
                data[next + 4],
                data[next + 5],
                data[next + 6],
                data[next + 7],
            ]);
            let rdlength = u16::from_be_bytes([data[next + 8], data[next + 9]]) as usize;
            let start = next + 10;
            if start + rdlength > data.len() {
                return None;
            }
            answers.push(DnsRecord {
                name,
                rtype,
                class,
                ttl,
                rdata: data[start..start + rdlength].to_vec(),
            });
            pos = start + rdlength;
        }

        Some(Self {
            id,
            flags,
            questions,
            answers,
        })
    }
}

fn encode_domain(buf: &mut Vec<u8>, domain: &str) {
    for label in domain.split('.').filter(|l| !l.is_empty()) {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
}

/// Read a possibly compressed name at `pos`.
///
/// Returns the lowercased name and the offset just past it in the original
/// (uncompressed) position.
fn read_name(data: &[u8], mut pos: usize) -> Option<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut end = None;
    let mut hops = 0;

    loop {
        let len = *data.get(pos)? as usize;
        match len {
            0 => {
                pos += 1;
                break;
            }
            l if l & 0xC0 == 0xC0 => {
                let low = *data.get(pos + 1)? as usize;
                if end.is_none() {
                    end = Some(pos + 2);
                }
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return None;
                }
                pos = ((l & 0x3F) << 8) | low;
            }
            l if l > 63 => return None,
            l => {
                let label = data.get(pos + 1..pos + 1 + l)?;
                labels.push(std::str::from_utf8(label).ok()?.to_ascii_lowercase());
                pos += 1 + l;
            }
        }
    }

    Some((labels.join("."), end.unwrap_or(pos)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_encodes_header_and_question() {
        let query = DnsQuery::new(0xBEEF, "example.com", QTYPE_A);
        let bytes = query.to_bytes();

        assert_eq!(&bytes[..4], &[0xBE, 0xEF, 0x01, 0x00]);
        assert_eq!(&bytes[4..6], &[0x00, 0x01]);
        assert_eq!(
            &bytes[HEADER_LEN..],
            b"\x07example\x03com\x00\x00\x01\x00\x01"
        );
        assert_eq!(DnsQuery::parse(&bytes), Some(query));
    }

    #[test]
    fn trailing_dot_is_not_an_empty_label() {
        let bytes = DnsQuery::new(1, "example.com.", QTYPE_A).to_bytes();

        assert_eq!(DnsQuery::parse(&bytes).unwrap().domain, "example.com");
    }

    #[test]
    fn response_answers_parse_in_record_order() {
        let query = DnsQuery::new(7, "example.com", QTYPE_A);
        let addrs: Vec<IpAddr> = vec!["93.184.216.34".parse().unwrap(), "10.0.0.1".parse().unwrap()];

        let parsed = DnsResponse::parse(&DnsResponse::answer(&query, &addrs).to_bytes()).unwrap();

        assert_eq!(parsed.id, 7);
        assert!(parsed.is_response());
        assert_eq!(parsed.rcode(), RCODE_NOERROR);
        assert_eq!(parsed.questions[0].domain, "example.com");
        assert_eq!(parsed.answers[0].name, "example.com");
        assert_eq!(parsed.addresses(), addrs);
    }

    #[test]
    fn aaaa_answers_yield_v6_addresses() {
        let query = DnsQuery::new(9, "v6.example", QTYPE_AAAA);
        let addr: IpAddr = "2001:db8::1".parse().unwrap();

        let parsed = DnsResponse::parse(&DnsResponse::answer(&query, &[addr]).to_bytes()).unwrap();

        assert_eq!(parsed.addresses(), vec![addr]);
    }

    #[test]
    fn cname_records_are_skipped_for_addresses() {
        let query = DnsQuery::new(3, "www.example.com", QTYPE_A);
        let mut response = DnsResponse::answer(&query, &["1.2.3.4".parse().unwrap()]);
        response.answers.insert(
            0,
            DnsRecord {
                name: "www.example.com".into(),
                rtype: QTYPE_CNAME,
                class: QCLASS_IN,
                ttl: 60,
                rdata: b"\x03cdn\xC0\x10".to_vec(),
            },
        );

        let parsed = DnsResponse::parse(&response.to_bytes()).unwrap();

        assert_eq!(parsed.answers.len(), 2);
        assert_eq!(parsed.addresses(), vec!["1.2.3.4".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn error_response_carries_rcode() {
        let query = DnsQuery::new(4, "nope.invalid", QTYPE_A);

        let parsed = DnsResponse::parse(&DnsResponse::error(&query, RCODE_NXDOMAIN).to_bytes()).unwrap();

        assert_eq!(parsed.rcode(), RCODE_NXDOMAIN);
        assert!(parsed.answers.is_empty());
    }

    #[test]
    fn truncated_and_looping_messages_are_rejected() {
        let query = DnsQuery::new(5, "example.com", QTYPE_A);
        let bytes = DnsResponse::answer(&query, &["1.1.1.1".parse().unwrap()]).to_bytes();
        assert!(DnsResponse::parse(&bytes[..bytes.len() - 2]).is_none());
        assert!(DnsResponse::parse(&bytes[..6]).is_none());

        // Answer name points at itself.
        let mut looping = DnsResponse::answer(&query, &[]).to_bytes();
        looping[7] = 1;
        let offset = looping.len() as u16;
        looping.extend_from_slice(&(0xC000 | offset).to_be_bytes());
        looping.extend_from_slice(&[0; 10]);
        assert!(DnsResponse::parse(&looping).is_none());
    }
}
