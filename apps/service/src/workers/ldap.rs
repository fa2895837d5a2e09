//! LDAP checks through an `ldapsearch`-style helper.

use std::time::Duration;

use netdialog::Outcome;
use url::Url;

use super::subprocess::ExitState;

/// Fill `%URL`, `%BASE` and `%TIMEOUT` in the configured command template.
pub fn command(template: &[String], url: &Url, timeout: Duration) -> Vec<String> {
    let server = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}://{host}:{port}", url.scheme()),
        (Some(host), None) => format!("{}://{host}", url.scheme()),
        _ => url.as_str().to_string(),
    };
    let base = url.path().trim_start_matches('/').replace("%20", " ");
    let seconds = timeout.as_secs().max(1).to_string();

    template
        .iter()
        .map(|word| word.replace("%URL", &server).replace("%BASE", &base).replace("%TIMEOUT", &seconds))
        .collect()
}

pub fn classify(exit: ExitState) -> Outcome {
    match exit {
        ExitState::Exited(0) => Outcome::Ok,
        ExitState::Exited(255 | 49) => Outcome::ConnFailed,
        ExitState::Exited(3 | 85) => Outcome::ConnTimeout,
        ExitState::Exited(_) => Outcome::BadData,
        ExitState::Signalled(_) => Outcome::HelperExecFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_substitution() {
        let template: Vec<String> =
            ["ldapsearch", "-H", "%URL", "-b", "%BASE", "-l", "%TIMEOUT"].iter().map(|word| word.to_string()).collect();
        let url = Url::parse("ldaps://dir.example.net:1636/dc=example,dc=net").unwrap();
        let argv = command(&template, &url, Duration::from_secs(30));
        assert_eq!(
            argv,
            vec!["ldapsearch", "-H", "ldaps://dir.example.net:1636", "-b", "dc=example,dc=net", "-l", "30"]
        );
    }

    #[test]
    fn exit_codes() {
        assert_eq!(classify(ExitState::Exited(0)), Outcome::Ok);
        assert_eq!(classify(ExitState::Exited(255)), Outcome::ConnFailed);
        assert_eq!(classify(ExitState::Exited(49)), Outcome::ConnFailed);
        assert_eq!(classify(ExitState::Exited(85)), Outcome::ConnTimeout);
        assert_eq!(classify(ExitState::Exited(32)), Outcome::BadData);
    }
}
