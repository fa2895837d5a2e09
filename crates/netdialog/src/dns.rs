//! DNS test description and result bookkeeping.
//!
//! The actual queries go through an asynchronous resolver owned by the
//! service; this module only knows what to ask and how to summarise what
//! came back.

use std::fmt;
use std::str::FromStr;

use crate::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    A,
    Aaaa,
    Cname,
    Mx,
    Ns,
    Ptr,
    Soa,
    Srv,
    Txt,
}

impl FromStr for QueryType {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text.to_ascii_uppercase().as_str() {
            "A" => Ok(QueryType::A),
            "AAAA" => Ok(QueryType::Aaaa),
            "CNAME" => Ok(QueryType::Cname),
            "MX" => Ok(QueryType::Mx),
            "NS" => Ok(QueryType::Ns),
            "PTR" => Ok(QueryType::Ptr),
            "SOA" => Ok(QueryType::Soa),
            "SRV" => Ok(QueryType::Srv),
            "TXT" => Ok(QueryType::Txt),
            other => Err(format!("unknown DNS record type '{other}'")),
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryType::A => "A",
            QueryType::Aaaa => "AAAA",
            QueryType::Cname => "CNAME",
            QueryType::Mx => "MX",
            QueryType::Ns => "NS",
            QueryType::Ptr => "PTR",
            QueryType::Soa => "SOA",
            QueryType::Srv => "SRV",
            QueryType::Txt => "TXT",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub record: QueryType,
    pub name: String,
}

/// Parse `TYPE:name,TYPE:name`. Entries without a type ask for `A`; an
/// empty list asks for the A record of `default_name`.
pub fn parse_query_set(spec: &str, default_name: &str) -> Result<Vec<DnsQuery>, String> {
    let mut queries = Vec::new();
    for entry in spec.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let query = match entry.split_once(':') {
            Some((record, name)) => DnsQuery { record: record.parse()?, name: name.to_string() },
            None => DnsQuery { record: QueryType::A, name: entry.to_string() },
        };
        queries.push(query);
    }
    if queries.is_empty() {
        queries.push(DnsQuery { record: QueryType::A, name: default_name.to_string() });
    }
    Ok(queries)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsFailure {
    Timeout,
    Refused,
    NotFound,
    Malformed,
    Exhausted,
}

impl DnsFailure {
    pub fn outcome(self) -> Outcome {
        match self {
            DnsFailure::Timeout => Outcome::ConnTimeout,
            DnsFailure::Refused | DnsFailure::Exhausted => Outcome::ConnFailed,
            DnsFailure::NotFound | DnsFailure::Malformed => Outcome::BadData,
        }
    }
}

impl fmt::Display for DnsFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DnsFailure::Timeout => "query timed out",
            DnsFailure::Refused => "query refused",
            DnsFailure::NotFound => "no such record",
            DnsFailure::Malformed => "malformed response",
            DnsFailure::Exhausted => "resolver out of resources",
        })
    }
}

/// Answers accumulated per query, in the order the queries were issued.
#[derive(Debug, Clone, Default)]
pub struct DnsReport {
    answers: Vec<(DnsQuery, Result<Vec<String>, DnsFailure>)>,
}

impl DnsReport {
    pub fn record(&mut self, query: DnsQuery, answer: Result<Vec<String>, DnsFailure>) {
        self.answers.push((query, answer));
    }

    pub fn len(&self) -> usize {
        self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }

    /// The first failure decides the outcome.
    pub fn outcome(&self) -> Outcome {
        self.answers
            .iter()
            .find_map(|(_, answer)| answer.as_ref().err())
            .map_or(Outcome::Ok, |failure| failure.outcome())
    }

    pub fn summary(&self) -> String {
        let mut text = String::new();
        for (query, answer) in &self.answers {
            text.push_str(&format!("{} {}\n", query.record, query.name));
            match answer {
                Ok(records) => records.iter().for_each(|record| text.push_str(&format!("\t{record}\n"))),
                Err(failure) => text.push_str(&format!("\t{failure}\n")),
            }
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typed_and_bare_entries() {
        let queries = parse_query_set("mx:example.com, www.example.com", "ns1").unwrap();
        assert_eq!(
            queries,
            vec![
                DnsQuery { record: QueryType::Mx, name: "example.com".into() },
                DnsQuery { record: QueryType::A, name: "www.example.com".into() },
            ]
        );
        assert_eq!(parse_query_set("", "ns1").unwrap()[0].name, "ns1");
        assert!(parse_query_set("BOGUS:x", "ns1").is_err());
    }

    #[test]
    fn first_failure_decides() {
        let mut report = DnsReport::default();
        let query = DnsQuery { record: QueryType::A, name: "a".into() };
        report.record(query.clone(), Ok(vec!["192.0.2.1".into()]));
        assert_eq!(report.outcome(), Outcome::Ok);

        report.record(query.clone(), Err(DnsFailure::Timeout));
        report.record(query, Err(DnsFailure::NotFound));
        assert_eq!(report.outcome(), Outcome::ConnTimeout);
        assert!(report.summary().contains("\tquery timed out\n"));
    }
}
