//! The host catalogue: configured hosts and their tags, expanded into the
//! test specifications the engine schedules.

pub mod services;
pub mod testspec;
pub mod validation;

use std::{
    collections::{BTreeMap, HashMap},
    net::IpAddr,
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use services::{ServiceDefinition, ServiceFlag, ServiceKind, ServiceTable};
pub use testspec::{ContentMatch, ModuleKind, TagError, TestContext, TestFlags, TestId, TestKind, TestSpec, parse_tag};

use crate::config::Config;
use crate::escalation::{Thresholds, Upstream, parse_depends};

/// One `[[hosts]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Host-wide tags, split off before the rest are parsed as tests.
#[derive(Debug, Default)]
struct HostOptions {
    dialup: bool,
    noping: bool,
    testip: bool,
    extra_pings: Vec<IpAddr>,
    routes: Vec<String>,
    depends: HashMap<String, Vec<Upstream>>,
    thresholds: HashMap<String, Thresholds>,
    timeout: Option<u64>,
    interval: Option<u64>,
    source_ip: Option<IpAddr>,
}

impl HostOptions {
    fn split<'a>(host: &str, tags: &'a [String]) -> (Self, Vec<&'a str>) {
        let mut options = Self::default();
        let mut tests = Vec::new();

        for tag in tags.iter().map(|tag| tag.trim()).filter(|tag| !tag.is_empty()) {
            match tag {
                "dialup" => options.dialup = true,
                "noping" | "noconn" => options.noping = true,
                "testip" => options.testip = true,
                _ => {
                    if let Err(err) = options.absorb(host, tag, &mut tests) {
                        warn!(host, tag, "ignoring host tag: {err}");
                    }
                }
            }
        }

        (options, tests)
    }

    fn absorb<'a>(&mut self, host: &str, tag: &'a str, tests: &mut Vec<&'a str>) -> Result<(), String> {
        if let Some(list) = tag.strip_prefix("conn=") {
            for address in list.split(',').map(str::trim).filter(|address| !address.is_empty()) {
                self.extra_pings.push(address.parse().map_err(|_| format!("bad address '{address}'"))?);
            }
        } else if let Some(list) = tag.strip_prefix("route:").or_else(|| tag.strip_prefix("route=")) {
            self.routes.extend(list.split(',').map(str::trim).filter(|router| !router.is_empty()).map(str::to_string));
        } else if let Some(groups) = tag.strip_prefix("depends=") {
            for (column, upstream) in parse_depends(groups, host)? {
                self.depends.entry(column).or_default().extend(upstream);
            }
        } else if let Some(options) = tag.strip_prefix("nopt=") {
            self.absorb_nopt(options)?;
        } else if let Some((column, triple)) = tag.strip_prefix("bad").and_then(|rest| rest.split_once(':')) {
            self.thresholds.insert(column.to_string(), triple.parse()?);
        } else {
            tests.push(tag);
        }
        Ok(())
    }

    fn absorb_nopt(&mut self, options: &str) -> Result<(), String> {
        for option in options.split(',') {
            let (key, value) = option.split_once(':').ok_or_else(|| format!("bad option '{option}'"))?;
            match key.trim() {
                "timeout" => self.timeout = Some(value.parse().map_err(|_| format!("bad timeout '{value}'"))?),
                "interval" => self.interval = Some(value.parse().map_err(|_| format!("bad interval '{value}'"))?),
                "sourceip" => self.source_ip = Some(value.parse().map_err(|_| format!("bad source IP '{value}'"))?),
                other => return Err(format!("unknown option '{other}'")),
            }
        }
        Ok(())
    }
}

/// Every test this instance is responsible for, keyed by schedule id.
#[derive(Debug, Default)]
pub struct Catalogue {
    specs: BTreeMap<TestId, Arc<TestSpec>>,
}

impl Catalogue {
    pub fn build(config: &Config, services: &ServiceTable) -> Self {
        let mut specs = BTreeMap::new();

        for host in config.hosts.iter().filter(|host| in_partition(config, host)) {
            if let Err(err) = validation::validate_host_name(&host.name).into_result() {
                warn!(host = host.name, "skipping host: {err}");
                continue;
            }

            for spec in host_specs(config, services, host) {
                if let Some(previous) = specs.insert(spec.id.clone(), Arc::new(spec)) {
                    warn!(test = %previous.id, "duplicate test, keeping the last definition");
                }
            }
        }

        Self { specs }
    }

    pub fn get(&self, id: &TestId) -> Option<Arc<TestSpec>> {
        self.specs.get(id).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TestSpec>> {
        self.specs.values()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

fn in_partition(config: &Config, host: &HostEntry) -> bool {
    match (&config.engine.location, &host.location) {
        (Some(ours), Some(theirs)) => ours == theirs,
        (Some(_), None) => config.engine.test_untagged,
        (None, _) => true,
    }
}

fn host_specs(config: &Config, services: &ServiceTable, host: &HostEntry) -> Vec<TestSpec> {
    let (options, tags) = HostOptions::split(&host.name, &host.tags);

    let interval = options.interval.unwrap_or(config.engine.default_interval_seconds);
    let timeout = options.timeout.unwrap_or(config.engine.timeout_seconds);
    let (interval, timeout) = match validation::validate_interval(interval)
        .into_result()
        .and_then(|()| validation::validate_timeout(timeout, interval).into_result())
    {
        Ok(()) => (interval, timeout),
        Err(err) => {
            warn!(host = host.name, "{err}; using engine defaults");
            (config.engine.default_interval_seconds, config.engine.timeout_seconds)
        }
    };

    let context = TestContext {
        host: &host.name,
        ip: host.ip,
        testip: options.testip,
        dialup: options.dialup,
        location: host.location.as_deref(),
        timeout: Duration::from_secs(timeout),
        interval: Duration::from_secs(interval),
        source_ip: options.source_ip,
        content_column: &config.engine.content_column,
    };

    let mut specs = Vec::new();
    for tag in tags {
        match parse_tag(tag, &context, services) {
            Ok(spec) => specs.push(spec),
            Err(TagError::UnknownService(name)) => debug!(host = host.name, tag, "not a network test: {name}"),
            Err(err) => warn!(host = host.name, tag, "ignoring test: {err}"),
        }
    }

    let ping_column = &config.engine.ping_column;
    let pinged = config.engine.ping_enabled && !options.noping;
    if pinged {
        specs.push(context.ping(ping_column, None));
        specs.extend(options.extra_pings.iter().map(|ip| context.ping(ping_column, Some(*ip))));
    }

    let default_badconn = config.escalation.badconn.as_deref().and_then(|triple| match triple.parse() {
        Ok(thresholds) => Some(thresholds),
        Err(err) => {
            warn!("ignoring default badconn: {err}");
            None
        }
    });

    for spec in &mut specs {
        let is_ping = spec.kind.module() == Some(ModuleKind::Ping);
        let escalation = &mut spec.escalation;

        escalation.thresholds = options.thresholds.get(&spec.column).copied();
        if is_ping {
            escalation.thresholds = escalation.thresholds.or(options.thresholds.get("conn").copied()).or(default_badconn);
            escalation.upstream.extend(options.routes.iter().map(|router| Upstream::new(router.clone(), ping_column.clone())));
        } else if pinged {
            escalation.host_ping = Some(ping_column.clone());
        }
        if let Some(upstream) = options.depends.get(&spec.column) {
            escalation.upstream.extend(upstream.iter().cloned());
        }
    }

    specs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(hosts: Vec<HostEntry>) -> Config {
        Config { hosts, ..Config::default() }
    }

    fn host(name: &str, tags: &[&str]) -> HostEntry {
        HostEntry {
            name: name.into(),
            ip: Some("192.0.2.10".parse().unwrap()),
            location: None,
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
        }
    }

    #[test]
    fn expands_tags_and_implicit_ping() {
        let config = config(vec![host("web", &["ssh", "http://web/", "trends", "conn=192.0.2.11"])]);
        let catalogue = Catalogue::build(&config, &ServiceTable::new(&config.services));

        let columns: Vec<&str> = catalogue.iter().map(|spec| spec.column.as_str()).collect();
        assert_eq!(catalogue.len(), 4);
        assert!(columns.contains(&"ssh"));
        assert!(columns.contains(&"http"));
        assert_eq!(columns.iter().filter(|column| **column == "conn").count(), 2);

        let ssh = catalogue.iter().find(|spec| spec.column == "ssh").unwrap();
        assert_eq!(ssh.escalation.host_ping.as_deref(), Some("conn"));
    }

    #[test]
    fn host_options_shape_escalation() {
        let config = config(vec![host(
            "db",
            &["noping", "dialup", "mysql", "badmysql:1:2:3", "depends=(mysql:fw/conn)", "nopt=timeout:5,interval:60"],
        )]);
        let catalogue = Catalogue::build(&config, &ServiceTable::new(&[]));
        assert_eq!(catalogue.len(), 1);

        let mysql = catalogue.iter().next().unwrap();
        assert!(mysql.flags.dialup);
        assert_eq!(mysql.escalation.host_ping, None);
        assert_eq!(mysql.escalation.thresholds, Some(Thresholds { clear: 1, warn: 2, alarm: 3 }));
        assert_eq!(mysql.escalation.upstream, vec![Upstream::new("fw", "conn")]);
        assert_eq!(mysql.timeout, Duration::from_secs(5));
        assert_eq!(mysql.interval, Duration::from_secs(60));
    }

    #[test]
    fn routers_become_ping_upstreams() {
        let config = config(vec![host("branch", &["route:core1,core2", "badconn:1:2:4"])]);
        let catalogue = Catalogue::build(&config, &ServiceTable::new(&[]));
        let ping = catalogue.iter().next().unwrap();
        assert_eq!(ping.escalation.upstream.len(), 2);
        assert_eq!(ping.escalation.thresholds.map(|t| t.alarm), Some(4));
    }

    #[test]
    fn location_partitions_hosts() {
        let mut here = host("here", &["ssh"]);
        here.location = Some("dc1".into());
        let mut there = host("there", &["ssh"]);
        there.location = Some("dc2".into());
        let untagged = host("untagged", &["ssh"]);

        let mut config = config(vec![here, there, untagged]);
        config.engine.location = Some("dc1".into());
        config.engine.ping_enabled = false;

        let hosts: Vec<String> =
            Catalogue::build(&config, &ServiceTable::new(&[])).iter().map(|spec| spec.host().to_string()).collect();
        assert_eq!(hosts, vec!["here".to_string()]);

        config.engine.test_untagged = true;
        assert_eq!(Catalogue::build(&config, &ServiceTable::new(&[])).len(), 2);
    }
}
