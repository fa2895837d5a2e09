use base64::{Engine as _, engine::general_purpose::STANDARD};
use thiserror::Error;
use url::Url;

use crate::AGENT_VERSION;

#[derive(Debug, Error)]
pub enum UrlError {
    #[error("invalid URL '{url}': {source}")]
    Parse { url: String, source: url::ParseError },
    #[error("unsupported URL scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("URL '{0}' has no host")]
    MissingHost(String),
}

/// A single HTTP request against a probed URL.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    url: Url,
    post: Option<(Vec<u8>, String)>,
}

impl HttpRequest {
    pub fn get(url: &str) -> Result<Self, UrlError> {
        Ok(Self { url: parse_url(url)?, post: None })
    }

    pub fn post(url: &str, body: impl Into<Vec<u8>>, content_type: Option<&str>) -> Result<Self, UrlError> {
        let content_type = content_type.unwrap_or("application/x-www-form-urlencoded").to_string();
        Ok(Self { url: parse_url(url)?, post: Some((body.into(), content_type)) })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_secure(&self) -> bool {
        self.url.scheme() == "https"
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(80)
    }

    /// Render the request bytes sent on the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut target = self.url.path().to_string();
        if let Some(query) = self.url.query() {
            target.push('?');
            target.push_str(query);
        }

        let method = if self.post.is_some() { "POST" } else { "GET" };
        let mut head = format!("{method} {target} HTTP/1.1\r\n");

        head.push_str("Host: ");
        head.push_str(self.host());
        let port = self.port();
        if port != 80 && port != 443 {
            head.push_str(&format!(":{port}"));
        }
        head.push_str("\r\n");

        if let Some((body, content_type)) = &self.post {
            head.push_str(&format!("Content-Type: {content_type}\r\n"));
            head.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }

        head.push_str(&format!("User-Agent: netprobe/{AGENT_VERSION}\r\n"));

        if !self.url.username().is_empty() {
            let credentials = format!("{}:{}", self.url.username(), self.url.password().unwrap_or_default());
            head.push_str(&format!("Authorization: Basic {}\r\n", STANDARD.encode(credentials)));
        }

        head.push_str("Accept: */*\r\n");
        head.push_str("Cache-control: no-cache\r\n");
        head.push_str("Connection: close\r\n");
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        if let Some((body, _)) = &self.post {
            bytes.extend_from_slice(body);
        }
        bytes
    }
}

fn parse_url(url: &str) -> Result<Url, UrlError> {
    let parsed = Url::parse(url).map_err(|source| UrlError::Parse { url: url.to_string(), source })?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(UrlError::UnsupportedScheme(other.to_string())),
    }
    if parsed.host_str().is_none() {
        return Err(UrlError::MissingHost(url.to_string()));
    }
    Ok(parsed)
}

/// Replace credentials in `Authorization` headers before a request is
/// shown in a report.
pub fn mask_authorization(request: &str) -> String {
    request
        .split_inclusive('\n')
        .map(|line| {
            let Some((name, value)) = line.split_once(':') else {
                return line.to_string();
            };
            if !name.trim().eq_ignore_ascii_case("authorization") {
                return line.to_string();
            }
            let value = value.trim_end_matches(['\r', '\n']);
            let ending = &line[name.len() + 1 + value.len()..];
            let masked = match value.trim_start().split_once(' ') {
                Some((scheme, secret)) => format!(" {scheme} {}", "*".repeat(secret.len())),
                None => format!(" {}", "*".repeat(value.trim_start().len())),
            };
            format!("{name}:{masked}{ending}")
        })
        .collect()
}
