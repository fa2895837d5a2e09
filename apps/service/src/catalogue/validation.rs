use std::net::IpAddr;

use url::Url;

/// Validation results with specific error messages
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub error: Option<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self { is_valid: true, error: None }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self { is_valid: false, error: Some(msg.into()) }
    }

    pub fn into_result(self) -> Result<(), String> {
        if self.is_valid {
            Ok(())
        } else {
            Err(self.error.unwrap_or_else(|| "Validation failed".to_string()))
        }
    }
}

/// Validate a URL whose scheme must be one of `schemes`
pub fn validate_url(target: &str, schemes: &[&str]) -> ValidationResult {
    if target.trim().is_empty() {
        return ValidationResult::err("URL cannot be empty");
    }

    match Url::parse(target) {
        Ok(url) => {
            if !schemes.contains(&url.scheme()) {
                return ValidationResult::err(format!(
                    "Invalid scheme '{}'. Must be one of {}",
                    url.scheme(),
                    schemes.join(", ")
                ));
            }

            if url.host_str().is_none_or(str::is_empty) {
                return ValidationResult::err("URL must have a valid host");
            }

            ValidationResult::ok()
        }
        Err(e) => ValidationResult::err(format!("Invalid URL '{target}': {e}")),
    }
}

/// Validate a host name as it appears in the catalogue (IP or DNS name)
pub fn validate_host_name(name: &str) -> ValidationResult {
    if name.trim().is_empty() {
        return ValidationResult::err("Host name cannot be empty");
    }

    if name.parse::<IpAddr>().is_ok() {
        return ValidationResult::ok();
    }

    if name.starts_with('-') || name.ends_with('-') || name.starts_with('.') {
        return ValidationResult::err(format!("Invalid host name '{name}'"));
    }

    if name.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_') {
        ValidationResult::ok()
    } else {
        ValidationResult::err(format!("Invalid host name '{name}'"))
    }
}

/// Validate a test interval in seconds
pub fn validate_interval(interval: u64) -> ValidationResult {
    if interval == 0 {
        return ValidationResult::err("Interval must be at least 1 second");
    }

    if interval > 86400 {
        return ValidationResult::err("Interval too long (max 24 hours)");
    }

    ValidationResult::ok()
}

/// Validate a test timeout against its interval
pub fn validate_timeout(timeout: u64, interval: u64) -> ValidationResult {
    if timeout == 0 {
        return ValidationResult::err("Timeout must be at least 1 second");
    }

    if timeout >= interval {
        return ValidationResult::err("Timeout must be less than interval");
    }

    ValidationResult::ok()
}

/// Validate a TCP/UDP port given in a service tag
pub fn validate_port(text: &str) -> Result<u16, String> {
    match text.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        Ok(_) => Err("Port must be between 1 and 65535".to_string()),
        Err(_) => Err(format!("Invalid port number '{text}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_validation() {
        let web = ["http", "https"];
        assert!(validate_url("http://example.com", &web).is_valid);
        assert!(validate_url("https://example.com:8443/path?q=1", &web).is_valid);
        assert!(validate_url("ldaps://dir.example.com/dc=example", &["ldap", "ldaps"]).is_valid);

        assert!(!validate_url("", &web).is_valid);
        assert!(!validate_url("example.com", &web).is_valid);
        assert!(!validate_url("ftp://example.com", &web).is_valid);
    }

    #[test]
    fn test_host_name_validation() {
        assert!(validate_host_name("192.168.1.1").is_valid);
        assert!(validate_host_name("2001:db8::1").is_valid);
        assert!(validate_host_name("mail.example.com").is_valid);

        assert!(!validate_host_name("").is_valid);
        assert!(!validate_host_name("bad host").is_valid);
        assert!(!validate_host_name("-edge").is_valid);
    }

    #[test]
    fn test_timeout_validation() {
        assert!(validate_timeout(5, 10).is_valid);
        assert!(!validate_timeout(10, 10).is_valid);
        assert!(!validate_timeout(0, 10).is_valid);
        assert!(validate_interval(300).is_valid);
        assert!(!validate_interval(0).is_valid);
    }

    #[test]
    fn test_port_validation() {
        assert_eq!(validate_port("2222"), Ok(2222));
        assert!(validate_port("0").is_err());
        assert!(validate_port("ssh").is_err());
    }
}
