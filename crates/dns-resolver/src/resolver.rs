use async_trait::async_trait;
use hickory_proto::ProtoErrorKind;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::op::response_code::ResponseCode;
use hickory_resolver::proto::rr::{LowerName, RData, RecordSet, RecordType, RrKey};
use hickory_resolver::proto::serialize::txt::Parser;
use hickory_resolver::{Name, ResolveError, TokioResolver};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum DnsError {
    #[error("invalid DNS name: {0}")]
    InvalidName(String),
    #[error("DNS query for {name} timed out after {duration:?}")]
    Timeout { name: String, duration: Duration },
    #[error("DNS: {0}")]
    Resolution(String),
}

impl DnsError {
    pub(crate) fn from_resolve(name: &impl fmt::Display, err: ResolveError) -> Self {
        DnsError::Resolution(format!("failed to query DNS for {name}: {err}"))
    }
}

/// A raw answer from a single nameserver query.
#[derive(Debug)]
pub struct Answer {
    pub records: Vec<RData>,
    pub nxdomain: bool,
    pub expires: Instant,
    pub response_code: ResponseCode,
}

impl Answer {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn as_addr(&self) -> Vec<IpAddr> {
        let mut result = vec![];
        for r in &self.records {
            if let Some(a) = r.as_a() {
                result.push(a.0.into());
            } else if let Some(aaaa) = r.as_aaaa() {
                result.push(aaaa.0.into());
            }
        }
        result
    }
}

/// Lowercases and fully-qualifies a domain name string.
pub fn fully_qualify(domain_name: &str) -> Result<Name, DnsError> {
    let mut name = Name::from_str_relaxed(domain_name)
        .map_err(|err| DnsError::InvalidName(format!("invalid name {domain_name}: {err}")))?
        .to_lowercase();
    name.set_fqdn(true);
    Ok(name)
}

/// The reverse-lookup name for an address, eg: `1.2.0.192.in-addr.arpa`.
pub fn ptr_host(ip: IpAddr) -> String {
    let mut out = String::new();
    match ip {
        IpAddr::V4(v4) => {
            let mut bytes = v4.octets();
            bytes.reverse();
            for byte in bytes {
                out.push_str(&format!("{byte}."));
            }
            out.push_str("in-addr.arpa");
        }
        IpAddr::V6(v6) => {
            let mut bytes = v6.octets();
            bytes.reverse();
            for byte in bytes {
                let (upper, lower) = (byte >> 4, byte & 0xf);
                out.push_str(&format!("{lower:x}.{upper:x}."));
            }
            out.push_str("ip6.arpa");
        }
    }
    out
}

#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    /// A short label identifying this resolver (its nameserver address,
    /// or "system" for the host configuration).
    fn label(&self) -> &str;

    async fn query(&self, name: Name, rrtype: RecordType) -> Result<Answer, DnsError>;
}

pub struct HickoryResolver {
    inner: TokioResolver,
    label: String,
}

impl HickoryResolver {
    /// Resolver using the system configuration (`/etc/resolv.conf`).
    pub fn system() -> Result<Self, ResolveError> {
        Ok(Self {
            inner: TokioResolver::builder_tokio()?.build(),
            label: "system".to_string(),
        })
    }

    /// Resolver pinned to a single upstream nameserver.
    pub fn for_nameserver(addr: SocketAddr, timeout: Duration) -> Self {
        let group = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
        let config = ResolverConfig::from_parts(None, vec![], group);
        let mut builder =
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default());
        builder.options_mut().timeout = timeout;
        builder.options_mut().attempts = 1;
        Self {
            inner: builder.build(),
            label: addr.to_string(),
        }
    }
}

#[async_trait]
impl Resolver for HickoryResolver {
    fn label(&self) -> &str {
        &self.label
    }

    async fn query(&self, name: Name, rrtype: RecordType) -> Result<Answer, DnsError> {
        match self.inner.lookup(name.clone(), rrtype).await {
            Ok(result) => {
                let expires = result.valid_until();
                let records = result.iter().cloned().collect();
                Ok(Answer {
                    records,
                    nxdomain: false,
                    expires,
                    response_code: ResponseCode::NoError,
                })
            }
            Err(err) => match err.proto().map(|err| err.kind()) {
                Some(ProtoErrorKind::NoRecordsFound {
                    negative_ttl,
                    response_code,
                    ..
                }) => Ok(Answer {
                    records: vec![],
                    nxdomain: *response_code == ResponseCode::NXDomain,
                    response_code: *response_code,
                    expires: Instant::now()
                        + Duration::from_secs(negative_ttl.unwrap_or(60) as u64),
                }),
                _ => Err(DnsError::from_resolve(&name, err)),
            },
        }
    }
}

/// An in-memory resolver loaded from zone file text, for tests.
#[derive(Debug, Default)]
pub struct TestResolver {
    records: BTreeMap<Name, BTreeMap<RrKey, RecordSet>>,
}

impl TestResolver {
    pub fn with_zone(mut self, zone: &str) -> Self {
        let (mut name, records) = Parser::new(zone, None, None).parse().unwrap();
        // The parser can create results with varying FQDN-ness; mark
        // everything fully qualified so lookups behave consistently.
        name.set_fqdn(true);
        let fqdn_records = records
            .into_iter()
            .map(|(key, value)| {
                if key.name().is_fqdn() {
                    (key, value)
                } else {
                    let mut name: Name = key.name().into();
                    name.set_fqdn(true);
                    (RrKey::new(LowerName::new(&name), key.record_type), value)
                }
            })
            .collect();
        self.records.insert(name, fqdn_records);
        self
    }

    fn get(&self, full: &Name, record_type: RecordType) -> Answer {
        let mut full_fqdn = full.clone();
        full_fqdn.set_fqdn(true);
        let mut authority = full_fqdn.clone();

        let records = loop {
            if let Some(records) = self.records.get(&authority) {
                break records;
            }

            if authority.num_labels() > 1 {
                authority = authority.base_name();
                continue;
            }

            return Answer {
                records: vec![],
                nxdomain: true,
                expires: Instant::now() + Duration::from_secs(60),
                response_code: ResponseCode::NXDomain,
            };
        };

        let records = records.get(&RrKey {
            name: LowerName::from(&full_fqdn),
            record_type,
        });

        let Some(records) = records else {
            return Answer {
                records: vec![],
                nxdomain: false,
                expires: Instant::now() + Duration::from_secs(60),
                response_code: ResponseCode::NoError,
            };
        };

        Answer {
            records: records
                .records_without_rrsigs()
                .map(|r| r.data().clone())
                .collect(),
            nxdomain: false,
            expires: Instant::now() + Duration::from_secs(60),
            response_code: ResponseCode::NoError,
        }
    }
}

#[async_trait]
impl Resolver for TestResolver {
    fn label(&self) -> &str {
        "test"
    }

    async fn query(&self, name: Name, rrtype: RecordType) -> Result<Answer, DnsError> {
        Ok(self.get(&name, rrtype))
    }
}

/// A test resolver that always fails with a transport error.
pub struct FailingResolver;

#[async_trait]
impl Resolver for FailingResolver {
    fn label(&self) -> &str {
        "failing"
    }

    async fn query(&self, name: Name, _rrtype: RecordType) -> Result<Answer, DnsError> {
        Err(DnsError::Resolution(format!(
            "failed to query DNS for {name}: injected failure"
        )))
    }
}
