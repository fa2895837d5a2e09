use std::collections::HashMap;

/// A column on some host whose failure explains ours.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Upstream {
    pub host: String,
    pub column: String,
}

impl Upstream {
    pub fn new(host: impl Into<String>, column: impl Into<String>) -> Self {
        Self { host: host.into(), column: column.into() }
    }
}

/// Parse `(test:host/test,host/test)(test2:...)`. A bare upstream name
/// refers to a column on `own_host`.
pub fn parse_depends(text: &str, own_host: &str) -> Result<HashMap<String, Vec<Upstream>>, String> {
    let mut map: HashMap<String, Vec<Upstream>> = HashMap::new();
    let mut rest = text.trim();

    while !rest.is_empty() {
        let Some(inner) = rest.strip_prefix('(') else {
            return Err(format!("expected '(' in '{text}'"));
        };
        let Some((group, tail)) = inner.split_once(')') else {
            return Err(format!("unbalanced parenthesis in '{text}'"));
        };
        let Some((column, upstreams)) = group.split_once(':') else {
            return Err(format!("missing ':' in '({group})'"));
        };

        let entry = map.entry(column.trim().to_string()).or_default();
        for upstream in upstreams.split(',').map(str::trim).filter(|part| !part.is_empty()) {
            entry.push(match upstream.split_once('/') {
                Some((host, column)) => Upstream::new(host, column),
                None => Upstream::new(own_host, upstream),
            });
        }
        rest = tail.trim_start();
    }

    Ok(map)
}
