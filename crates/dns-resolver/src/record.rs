use hickory_resolver::proto::rr::RecordType;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RecordKind {
    Mx,
    A,
    Aaaa,
    Ptr,
    Ns,
}

impl RecordKind {
    pub fn record_type(self) -> RecordType {
        match self {
            Self::Mx => RecordType::MX,
            Self::A => RecordType::A,
            Self::Aaaa => RecordType::AAAA,
            Self::Ptr => RecordType::PTR,
            Self::Ns => RecordType::NS,
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(match self {
            Self::Mx => "MX",
            Self::A => "A",
            Self::Aaaa => "AAAA",
            Self::Ptr => "PTR",
            Self::Ns => "NS",
        })
    }
}

/// One cached DNS record. `priority` is populated only for MX.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DnsRecord {
    pub value: String,
    pub kind: RecordKind,
    pub priority: Option<u16>,
    #[serde(skip)]
    pub expires_at: Instant,
}
