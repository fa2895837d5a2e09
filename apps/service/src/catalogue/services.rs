//! The services table: what each named service tag connects to and says.

use std::collections::HashMap;

use netdialog::{Script, ScriptError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Dialog,
    Ntp,
    Dns,
    Ldap,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceFlag {
    Ssl,
    Telnet,
    Udp,
}

/// One `[[services]]` entry, or a built-in default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_kind")]
    pub kind: ServiceKind,
    /// Dialog lines, e.g. `EXPECT:220`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub script: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<ServiceFlag>,
    /// Argument template for external helpers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

fn default_kind() -> ServiceKind {
    ServiceKind::Dialog
}

impl ServiceDefinition {
    pub fn has_flag(&self, flag: ServiceFlag) -> bool {
        self.flags.contains(&flag)
    }

    /// Parsed script; an empty one connects and hangs up.
    pub fn script(&self) -> Result<Script, ScriptError> {
        if self.script.is_empty() {
            Ok(Script::silent())
        } else {
            Script::parse(&self.script)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceTable {
    services: HashMap<String, ServiceDefinition>,
}

impl ServiceTable {
    /// Built-in services overlaid with configured ones.
    pub fn new(overrides: &[ServiceDefinition]) -> Self {
        let mut services: HashMap<String, ServiceDefinition> =
            builtin().into_iter().map(|service| (service.name.clone(), service)).collect();
        for service in overrides {
            services.insert(service.name.to_ascii_lowercase(), service.clone());
        }
        Self { services }
    }

    pub fn get(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.get(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }
}

fn service(name: &str, port: u16, kind: ServiceKind, script: &[&str], flags: &[ServiceFlag]) -> ServiceDefinition {
    ServiceDefinition {
        name: name.to_string(),
        port,
        kind,
        script: script.iter().map(|line| line.to_string()).collect(),
        flags: flags.to_vec(),
        command: Vec::new(),
    }
}

fn builtin() -> Vec<ServiceDefinition> {
    use ServiceFlag::*;
    use ServiceKind::*;

    let mut table = vec![
        service("ftp", 21, Dialog, &["EXPECT:220", "SEND:quit\\r\\n", "CLOSE"], &[]),
        service("ssh", 22, Dialog, &["EXPECT:SSH", "CLOSE"], &[]),
        service("telnet", 23, Dialog, &["READ", "CLOSE"], &[Telnet]),
        service("smtp", 25, Dialog, &["EXPECT:220", "SEND:QUIT\\r\\n", "CLOSE"], &[]),
        service("smtps", 465, Dialog, &["EXPECT:220", "SEND:QUIT\\r\\n", "CLOSE"], &[Ssl]),
        service("pop3", 110, Dialog, &["EXPECT:+OK", "SEND:QUIT\\r\\n", "CLOSE"], &[]),
        service("pop3s", 995, Dialog, &["EXPECT:+OK", "SEND:QUIT\\r\\n", "CLOSE"], &[Ssl]),
        service("imap", 143, Dialog, &["EXPECT:* OK", "SEND:ABC123 LOGOUT\\r\\n", "CLOSE"], &[]),
        service("imaps", 993, Dialog, &["EXPECT:* OK", "SEND:ABC123 LOGOUT\\r\\n", "CLOSE"], &[Ssl]),
        service("nntp", 119, Dialog, &["EXPECT:200", "SEND:quit\\r\\n", "CLOSE"], &[]),
        service("nntps", 563, Dialog, &["EXPECT:200", "SEND:quit\\r\\n", "CLOSE"], &[Ssl]),
        service("rsync", 873, Dialog, &["EXPECT:@RSYNCD", "CLOSE"], &[]),
        service("clamd", 3310, Dialog, &["SEND:PING\\r\\n", "EXPECT:PONG", "CLOSE"], &[]),
        service("vnc", 5900, Dialog, &["EXPECT:RFB", "CLOSE"], &[]),
        service("mysql", 3306, Dialog, &["READ", "CLOSE"], &[]),
        service("rdp", 3389, Dialog, &[], &[]),
        service("ldap", 389, Ldap, &[], &[]),
        service("ldaps", 636, Ldap, &[], &[Ssl]),
        service("ntp", 123, Ntp, &[], &[Udp]),
        service("dns", 53, Dns, &[], &[Udp]),
    ];

    let mut rpc = service("rpc", 111, External, &[], &[]);
    rpc.command = ["rpcinfo", "-p", "%IP"].iter().map(|word| word.to_string()).collect();
    table.push(rpc);

    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use netdialog::Instruction;

    #[test]
    fn builtin_scripts_parse() {
        let table = ServiceTable::new(&[]);
        for name in ["ftp", "ssh", "telnet", "smtp", "imaps", "clamd", "rdp"] {
            let service = table.get(name).unwrap();
            service.script().unwrap_or_else(|err| panic!("{name}: {err}"));
        }
        let smtp = table.get("SMTP").unwrap().script().unwrap();
        assert_eq!(smtp.steps()[1], Instruction::Send(b"QUIT\r\n".to_vec()));
    }

    #[test]
    fn configured_service_overrides_builtin() {
        let custom = ServiceDefinition {
            name: "ssh".into(),
            port: 2222,
            kind: ServiceKind::Dialog,
            script: vec!["EXPECT:SSH-2.0".into(), "CLOSE".into()],
            flags: Vec::new(),
            command: Vec::new(),
        };
        let table = ServiceTable::new(std::slice::from_ref(&custom));
        assert_eq!(table.get("ssh").unwrap().port, 2222);
        assert!(table.get("ntp").unwrap().has_flag(ServiceFlag::Udp));
        assert_eq!(table.get("rpc").unwrap().command[0], "rpcinfo");
    }

    #[test]
    fn empty_script_is_silent() {
        let table = ServiceTable::new(&[]);
        assert_eq!(table.get("rdp").unwrap().script().unwrap(), Script::silent());
    }
}
