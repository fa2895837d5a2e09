//! Builders shared by unit tests across the service.

use std::{sync::Arc, time::Duration};

use crate::catalogue::{ServiceTable, TestContext, TestSpec, parse_tag};

pub fn context(host: &'static str) -> TestContext<'static> {
    TestContext {
        host,
        ip: Some("192.0.2.80".parse().expect("literal address")),
        testip: false,
        dialup: false,
        location: None,
        timeout: Duration::from_secs(5),
        interval: Duration::from_secs(60),
        source_ip: None,
        content_column: "content",
    }
}

/// Parse `tag` for a host named `probe.example.net`.
pub fn spec(tag: &str) -> Arc<TestSpec> {
    spec_for("probe.example.net", tag)
}

pub fn spec_for(host: &'static str, tag: &str) -> Arc<TestSpec> {
    Arc::new(parse_tag(tag, &context(host), &ServiceTable::new(&[])).expect("test tag parses"))
}
