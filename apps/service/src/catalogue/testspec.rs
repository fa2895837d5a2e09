//! Parsing host tags into typed test specifications.

use std::{fmt, net::IpAddr, time::Duration};

use netdialog::{
    Dialog, Script, ScriptError,
    dialog::Protocol,
    dns::{DnsQuery, parse_query_set},
    http::{HttpRequest, UrlError},
};
use regex::Regex;
use thiserror::Error;
use url::Url;

use super::{ServiceFlag, ServiceKind, ServiceTable, validation};
use crate::escalation::EscalationSpec;
use crate::store::ScheduleEntry;

#[derive(Debug, Error)]
pub enum TagError {
    #[error("unknown service '{0}'")]
    UnknownService(String),
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Url(#[from] UrlError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error("bad content pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Schedule key: one row per `(host, testspec, destination)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestId {
    pub host: String,
    pub testspec: String,
    pub destination: String,
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.host, self.testspec, self.destination)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestFlags {
    pub dialup: bool,
    pub reverse: bool,
    pub always_report: bool,
    pub silent: bool,
    pub send_as_data: bool,
}

#[derive(Debug, Clone)]
pub struct ContentMatch {
    pub pattern: Regex,
    pub reverse: bool,
}

impl ContentMatch {
    pub fn accepts(&self, body: &[u8]) -> bool {
        self.pattern.is_match(&String::from_utf8_lossy(body)) != self.reverse
    }
}

/// Tests that run in helper processes rather than on the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    Ping,
    Ldap,
    External,
}

impl ModuleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ModuleKind::Ping => "ping",
            ModuleKind::Ldap => "ldap",
            ModuleKind::External => "external",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "ping" => Some(ModuleKind::Ping),
            "ldap" => Some(ModuleKind::Ldap),
            "external" => Some(ModuleKind::External),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TestKind {
    Dialog { script: Script, protocol: Protocol },
    Http { request: HttpRequest, content: Option<ContentMatch> },
    Ntp,
    Dns { queries: Vec<DnsQuery> },
    Ping,
    Ldap { url: Url },
    External { command: Vec<String>, programs: Vec<String> },
}

impl TestKind {
    pub fn module(&self) -> Option<ModuleKind> {
        match self {
            TestKind::Ping => Some(ModuleKind::Ping),
            TestKind::Ldap { .. } => Some(ModuleKind::Ldap),
            TestKind::External { .. } => Some(ModuleKind::External),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            TestKind::Dialog { .. } => "dialog",
            TestKind::Http { .. } => "http",
            TestKind::Ntp => "ntp",
            TestKind::Dns { .. } => "dns",
            TestKind::Ping => "ping",
            TestKind::Ldap { .. } => "ldap",
            TestKind::External { .. } => "external",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestSpec {
    pub id: TestId,
    /// Status column the result is reported under.
    pub column: String,
    pub kind: TestKind,
    pub port: u16,
    pub tls: bool,
    pub flags: TestFlags,
    /// Catalogue IP, usable when `id.destination` is the host's own name.
    pub configured_ip: Option<IpAddr>,
    pub source_ip: Option<IpAddr>,
    pub timeout: Duration,
    pub interval: Duration,
    pub location: Option<String>,
    pub escalation: EscalationSpec,
}

impl TestSpec {
    pub fn host(&self) -> &str {
        &self.id.host
    }

    /// A fresh conversation for socket tests that speak one.
    pub fn dialog(&self) -> Option<Dialog> {
        match &self.kind {
            TestKind::Dialog { script, protocol } => Some(Dialog::new(script.clone(), *protocol)),
            TestKind::Http { request, .. } => {
                Some(Dialog::new(Script::request_response(request.to_bytes()), Protocol::Http))
            }
            _ => None,
        }
    }

    pub fn schedule_entry(&self) -> ScheduleEntry {
        ScheduleEntry {
            id: self.id.clone(),
            location: self.location.clone(),
            test_type: self.kind.type_name().to_string(),
            source_ip: self.source_ip.map(|ip| ip.to_string()),
            timeout_secs: self.timeout.as_secs() as i64,
            interval_secs: self.interval.as_secs() as i64,
            due: 0,
        }
    }
}

/// Host-level facts a tag is parsed against.
#[derive(Debug, Clone)]
pub struct TestContext<'a> {
    pub host: &'a str,
    pub ip: Option<IpAddr>,
    pub testip: bool,
    pub dialup: bool,
    pub location: Option<&'a str>,
    pub timeout: Duration,
    pub interval: Duration,
    pub source_ip: Option<IpAddr>,
    pub content_column: &'a str,
}

impl TestContext<'_> {
    fn destination(&self, name: &str) -> (String, Option<IpAddr>) {
        if name.eq_ignore_ascii_case(self.host) {
            match (self.testip, self.ip) {
                (true, Some(ip)) => (ip.to_string(), Some(ip)),
                _ => (name.to_string(), self.ip),
            }
        } else {
            (name.to_string(), None)
        }
    }

    fn spec(&self, testspec: &str, column: &str, kind: TestKind, destination: &str, port: u16) -> TestSpec {
        let (destination, configured_ip) = self.destination(destination);
        TestSpec {
            id: TestId { host: self.host.to_string(), testspec: testspec.to_string(), destination },
            column: column.to_string(),
            kind,
            port,
            tls: false,
            flags: TestFlags { dialup: self.dialup, ..Default::default() },
            configured_ip,
            source_ip: self.source_ip,
            timeout: self.timeout,
            interval: self.interval,
            location: self.location.map(str::to_string),
            escalation: EscalationSpec::default(),
        }
    }

    /// The implicit connectivity test against `target`.
    pub fn ping(&self, column: &str, target: Option<IpAddr>) -> TestSpec {
        let (testspec, destination) = match target {
            Some(ip) => (format!("ping={ip}"), ip.to_string()),
            None => ("ping".to_string(), self.ip.map_or_else(|| self.host.to_string(), |ip| ip.to_string())),
        };
        let mut spec = self.spec(&testspec, column, TestKind::Ping, self.host, 0);
        spec.id.destination = destination;
        spec
    }
}

/// Parse one test tag. Unknown service names are reported as
/// [`TagError::UnknownService`] so callers can skip non-network tags.
pub fn parse_tag(tag: &str, context: &TestContext<'_>, services: &ServiceTable) -> Result<TestSpec, TagError> {
    let testspec = tag.trim();
    let mut flags = TestFlags { dialup: context.dialup, ..Default::default() };
    let mut body = testspec;
    loop {
        match body.as_bytes().first() {
            Some(b'?') => flags.dialup = true,
            Some(b'!') => flags.reverse = true,
            Some(b'~') => flags.always_report = true,
            _ => break,
        }
        body = &body[1..];
    }

    let mut spec = if body.starts_with("http://") || body.starts_with("https://") {
        http_spec(testspec, context, HttpRequest::get(body)?, None, "http")?
    } else if let Some(rest) = body.strip_prefix("cont=") {
        content_spec(testspec, context, rest, false)?
    } else if let Some(rest) = body.strip_prefix("nocont=") {
        content_spec(testspec, context, rest, true)?
    } else if let Some(rest) = body.strip_prefix("post=") {
        let mut parts = rest.splitn(3, ';');
        let url = parts.next().unwrap_or_default();
        let payload = parts.next().unwrap_or_default();
        let request = HttpRequest::post(url, payload.as_bytes(), parts.next())?;
        http_spec(testspec, context, request, None, "http")?
    } else if body == "apache" || body.starts_with("apache=") {
        let url = body
            .strip_prefix("apache=")
            .map_or_else(|| format!("http://{}/server-status?auto", context.host), str::to_string);
        let mut spec = http_spec(testspec, context, HttpRequest::get(&url)?, None, "apache")?;
        spec.flags.send_as_data = true;
        spec
    } else if body.starts_with("ldap://") || body.starts_with("ldaps://") {
        ldap_spec(testspec, context, body)?
    } else if body == "dns" || body.starts_with("dns=") {
        let queries = parse_query_set(body.strip_prefix("dns=").unwrap_or_default(), context.host)
            .map_err(TagError::Invalid)?;
        let port = services.get("dns").map_or(53, |service| service.port);
        context.spec(testspec, "dns", TestKind::Dns { queries }, context.host, port)
    } else if body == "rpc" || body.starts_with("rpc=") {
        let programs = body
            .strip_prefix("rpc=")
            .map(|list| list.split(',').map(str::trim).filter(|name| !name.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();
        let command = services.get("rpc").map(|service| service.command.clone()).unwrap_or_default();
        if command.is_empty() {
            return Err(TagError::Invalid("rpc service has no helper command".into()));
        }
        context.spec(testspec, "rpc", TestKind::External { command, programs }, context.host, 111)
    } else {
        named_spec(testspec, context, body, services)?
    };

    spec.flags = TestFlags { send_as_data: spec.flags.send_as_data, silent: spec.flags.silent, ..flags };
    Ok(spec)
}

fn http_spec(
    testspec: &str,
    context: &TestContext<'_>,
    request: HttpRequest,
    content: Option<ContentMatch>,
    column: &str,
) -> Result<TestSpec, TagError> {
    validation::validate_url(request.url().as_str(), &["http", "https"]).into_result().map_err(TagError::Invalid)?;
    let host = request.host().to_string();
    let port = request.port();
    let tls = request.is_secure();
    let mut spec = context.spec(testspec, column, TestKind::Http { request, content }, &host, port);
    spec.tls = tls;
    Ok(spec)
}

fn content_spec(testspec: &str, context: &TestContext<'_>, rest: &str, reverse: bool) -> Result<TestSpec, TagError> {
    let Some((url, pattern)) = rest.split_once(';') else {
        return Err(TagError::Invalid(format!("content check '{rest}' needs URL;pattern")));
    };
    let content = ContentMatch { pattern: Regex::new(pattern)?, reverse };
    http_spec(testspec, context, HttpRequest::get(url)?, Some(content), context.content_column)
}

fn ldap_spec(testspec: &str, context: &TestContext<'_>, body: &str) -> Result<TestSpec, TagError> {
    validation::validate_url(body, &["ldap", "ldaps"]).into_result().map_err(TagError::Invalid)?;
    let url = Url::parse(body).map_err(|source| UrlError::Parse { url: body.to_string(), source })?;
    let host = url.host_str().unwrap_or(context.host).to_string();
    let secure = url.scheme() == "ldaps";
    let port = url.port().unwrap_or(if secure { 636 } else { 389 });
    let column = url.scheme().to_string();
    let mut spec = context.spec(testspec, &column, TestKind::Ldap { url }, &host, port);
    spec.tls = secure;
    Ok(spec)
}

/// `name[:port][:s]` against the services table.
fn named_spec(
    testspec: &str,
    context: &TestContext<'_>,
    body: &str,
    services: &ServiceTable,
) -> Result<TestSpec, TagError> {
    let mut parts = body.split(':');
    let name = parts.next().unwrap_or_default();
    let Some(service) = services.get(name) else {
        return Err(TagError::UnknownService(name.to_string()));
    };

    let mut port = service.port;
    let mut silent = false;
    for part in parts {
        match part {
            "s" | "q" => silent = true,
            number => port = validation::validate_port(number).map_err(TagError::Invalid)?,
        }
    }
    if port == 0 {
        return Err(TagError::Invalid(format!("service '{name}' has no port")));
    }

    let kind = match service.kind {
        ServiceKind::Dialog => {
            let script = if silent { Script::silent() } else { service.script()? };
            let protocol = if service.has_flag(ServiceFlag::Telnet) { Protocol::Telnet } else { Protocol::Plain };
            TestKind::Dialog { script, protocol }
        }
        ServiceKind::Ntp => TestKind::Ntp,
        ServiceKind::Dns => TestKind::Dns { queries: parse_query_set("", context.host).map_err(TagError::Invalid)? },
        ServiceKind::Ldap => {
            let scheme = if service.has_flag(ServiceFlag::Ssl) { "ldaps" } else { "ldap" };
            let text = format!("{scheme}://{}:{port}/", context.host);
            let url = Url::parse(&text).map_err(|source| UrlError::Parse { url: text, source })?;
            TestKind::Ldap { url }
        }
        ServiceKind::External => TestKind::External { command: service.command.clone(), programs: Vec::new() },
    };

    let mut spec = context.spec(testspec, &service.name, kind, context.host, port);
    spec.tls = service.has_flag(ServiceFlag::Ssl) && matches!(spec.kind, TestKind::Dialog { .. } | TestKind::Ldap { .. });
    spec.flags.silent = silent;
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> TestContext<'static> {
        TestContext {
            host: "mail.example.net",
            ip: Some("192.0.2.25".parse().unwrap()),
            testip: false,
            dialup: false,
            location: None,
            timeout: Duration::from_secs(10),
            interval: Duration::from_secs(300),
            source_ip: None,
            content_column: "content",
        }
    }

    #[test]
    fn named_service_with_port_and_prefixes() {
        let services = ServiceTable::new(&[]);
        let spec = parse_tag("!~ssh:2222", &context(), &services).unwrap();
        assert_eq!(spec.column, "ssh");
        assert_eq!(spec.port, 2222);
        assert!(spec.flags.reverse && spec.flags.always_report && !spec.flags.dialup);
        assert_eq!(spec.id.testspec, "!~ssh:2222");
        assert_eq!(spec.id.destination, "mail.example.net");
        assert_eq!(spec.configured_ip, context().ip);
    }

    #[test]
    fn silent_suffix_skips_dialog() {
        let services = ServiceTable::new(&[]);
        let spec = parse_tag("smtp:s", &context(), &services).unwrap();
        assert!(spec.flags.silent);
        match spec.kind {
            TestKind::Dialog { script, .. } => assert_eq!(script, Script::silent()),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn ssl_services_use_tls() {
        let services = ServiceTable::new(&[]);
        assert!(parse_tag("imaps", &context(), &services).unwrap().tls);
        assert!(!parse_tag("imap", &context(), &services).unwrap().tls);
    }

    #[test]
    fn http_urls() {
        let services = ServiceTable::new(&[]);
        let spec = parse_tag("https://www.example.net:8443/health", &context(), &services).unwrap();
        assert_eq!(spec.column, "http");
        assert_eq!(spec.port, 8443);
        assert!(spec.tls);
        assert_eq!(spec.id.destination, "www.example.net");
        assert_eq!(spec.configured_ip, None);
        assert!(spec.dialog().is_some());
    }

    #[test]
    fn content_checks_use_content_column() {
        let services = ServiceTable::new(&[]);
        let spec = parse_tag("nocont=http://mail.example.net/;[Ee]rror", &context(), &services).unwrap();
        assert_eq!(spec.column, "content");
        let TestKind::Http { content: Some(content), .. } = &spec.kind else {
            panic!("expected a content check");
        };
        assert!(content.accepts(b"all good"));
        assert!(!content.accepts(b"Internal Error"));
    }

    #[test]
    fn apache_is_sent_as_data() {
        let services = ServiceTable::new(&[]);
        let spec = parse_tag("apache", &context(), &services).unwrap();
        assert!(spec.flags.send_as_data);
        let TestKind::Http { request, .. } = &spec.kind else { panic!("expected http") };
        assert_eq!(request.url().as_str(), "http://mail.example.net/server-status?auto");
    }

    #[test]
    fn helper_tests_name_their_module() {
        let services = ServiceTable::new(&[]);
        let ldap = parse_tag("ldaps://dir.example.net/dc=example,dc=net", &context(), &services).unwrap();
        assert_eq!(ldap.kind.module(), Some(ModuleKind::Ldap));
        assert_eq!(ldap.port, 636);
        let rpc = parse_tag("rpc=mountd,nfs", &context(), &services).unwrap();
        let TestKind::External { programs, .. } = &rpc.kind else { panic!("expected external") };
        assert_eq!(programs, &vec!["mountd".to_string(), "nfs".to_string()]);
    }

    #[test]
    fn testip_uses_configured_address() {
        let services = ServiceTable::new(&[]);
        let mut context = context();
        context.testip = true;
        let spec = parse_tag("ssh", &context, &services).unwrap();
        assert_eq!(spec.id.destination, "192.0.2.25");
    }

    #[test]
    fn unknown_and_invalid_tags() {
        let services = ServiceTable::new(&[]);
        assert!(matches!(parse_tag("trends", &context(), &services), Err(TagError::UnknownService(_))));
        assert!(matches!(parse_tag("ssh:notaport", &context(), &services), Err(TagError::Invalid(_))));
        assert!(matches!(parse_tag("cont=http://x/;(", &context(), &services), Err(TagError::Pattern(_))));
        assert!(parse_tag("dns=BOGUS:x", &context(), &services).is_err());
    }
}
