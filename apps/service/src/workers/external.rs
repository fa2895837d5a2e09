//! Operator-supplied probe commands, `rpcinfo` among them.

use netdialog::Outcome;

use super::subprocess::{ExitState, HelperOutput};

/// Fill `%TEST` and `%IP` in a command template.
pub fn command(template: &[String], test: &str, address: &str) -> Vec<String> {
    template.iter().map(|word| word.replace("%TEST", test).replace("%IP", address)).collect()
}

/// Judge a finished command. Every name in `programs` must appear in its
/// output.
pub fn verdict(exit: ExitState, output: &HelperOutput, programs: &[String]) -> (Outcome, Option<String>) {
    match exit {
        ExitState::Exited(0) => {}
        ExitState::Exited(code) => return (Outcome::BadData, Some(format!("command failed with exit status {code}"))),
        signalled => return (Outcome::HelperExecFailed, Some(signalled.to_string())),
    }

    let missing: Vec<&str> = programs
        .iter()
        .map(String::as_str)
        .filter(|program| !output.stdout.split_whitespace().any(|word| word == *program))
        .collect();
    if missing.is_empty() {
        (Outcome::Ok, None)
    } else {
        (Outcome::BadData, Some(format!("not registered: {}", missing.join(", "))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RPCINFO: &str = "   program vers proto   port  service\n    100000    4   tcp    111  portmapper\n    100003    3   tcp   2049  nfs\n";

    #[test]
    fn substitutes_placeholders() {
        let template = vec!["rpcinfo".to_string(), "-p".to_string(), "%IP".to_string()];
        assert_eq!(command(&template, "rpc", "192.0.2.7"), vec!["rpcinfo", "-p", "192.0.2.7"]);
    }

    #[test]
    fn required_programs() {
        let output = HelperOutput { stdout: RPCINFO.into(), stderr: String::new() };
        let wanted = vec!["portmapper".to_string(), "nfs".to_string()];
        assert_eq!(verdict(ExitState::Exited(0), &output, &wanted), (Outcome::Ok, None));

        let wanted = vec!["nfs".to_string(), "mountd".to_string()];
        let (outcome, detail) = verdict(ExitState::Exited(0), &output, &wanted);
        assert_eq!(outcome, Outcome::BadData);
        assert_eq!(detail.as_deref(), Some("not registered: mountd"));
    }

    #[test]
    fn failing_command() {
        let output = HelperOutput::default();
        assert_eq!(verdict(ExitState::Exited(1), &output, &[]).0, Outcome::BadData);
        assert_eq!(verdict(ExitState::Signalled(9), &output, &[]).0, Outcome::HelperExecFailed);
    }
}
