use std::net::SocketAddr;
use std::time::Duration;

use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::op::ResponseCode;
use hickory_resolver::proto::rr::RecordType;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::proto::ProtoErrorKind;
use hickory_resolver::{ResolveError, ResolveErrorKind, TokioResolver};
use netdialog::dns::{DnsFailure, DnsQuery, DnsReport, QueryType};

fn record_type(query: QueryType) -> RecordType {
    match query {
        QueryType::A => RecordType::A,
        QueryType::Aaaa => RecordType::AAAA,
        QueryType::Cname => RecordType::CNAME,
        QueryType::Mx => RecordType::MX,
        QueryType::Ns => RecordType::NS,
        QueryType::Ptr => RecordType::PTR,
        QueryType::Soa => RecordType::SOA,
        QueryType::Srv => RecordType::SRV,
        QueryType::Txt => RecordType::TXT,
    }
}

fn classify(err: &ResolveError) -> DnsFailure {
    match err.kind() {
        ResolveErrorKind::Proto(proto) => match proto.kind() {
            ProtoErrorKind::Timeout => DnsFailure::Timeout,
            ProtoErrorKind::NoRecordsFound { response_code, .. } if *response_code == ResponseCode::Refused => {
                DnsFailure::Refused
            }
            ProtoErrorKind::NoRecordsFound { .. } => DnsFailure::NotFound,
            ProtoErrorKind::Busy => DnsFailure::Exhausted,
            _ => DnsFailure::Malformed,
        },
        _ => DnsFailure::Malformed,
    }
}

/// Ask `server` every query in turn, without recursion through any other
/// name server.
pub async fn run_queries(server: SocketAddr, queries: Vec<DnsQuery>, timeout: Duration) -> DnsReport {
    let mut config = ResolverConfig::new();
    config.add_name_server(NameServerConfig::new(server, Protocol::Udp));

    let mut options = ResolverOpts::default();
    options.timeout = timeout;
    options.attempts = 1;
    options.cache_size = 0;
    options.ndots = 0;

    let resolver = TokioResolver::builder_with_config(config, TokioConnectionProvider::default())
        .with_options(options)
        .build();

    let mut report = DnsReport::default();
    for query in queries {
        let answer = match resolver.lookup(query.name.as_str(), record_type(query.record)).await {
            Ok(lookup) => Ok(lookup.iter().map(ToString::to_string).collect()),
            Err(err) => Err(classify(&err)),
        };
        report.record(query, answer);
    }
    report
}
