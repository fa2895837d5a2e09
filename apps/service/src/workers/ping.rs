//! Batched ICMP reachability through `fping`.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::IpAddr;

use netdialog::Outcome;

use crate::store::AddressFamily;

/// Per-address round-trip samples in milliseconds; `None` is a lost reply.
pub type Samples = HashMap<IpAddr, Vec<Option<f64>>>;

/// Split `targets` into per-family batches of at most `limit` addresses.
pub fn batches<T: Copy>(targets: &[(T, IpAddr)], limit: usize) -> Vec<(AddressFamily, Vec<(T, IpAddr)>)> {
    let limit = limit.max(1);
    let mut out = Vec::new();
    for family in [AddressFamily::V4, AddressFamily::V6] {
        let members: Vec<(T, IpAddr)> =
            targets.iter().copied().filter(|(_, address)| AddressFamily::of(*address) == family).collect();
        out.extend(members.chunks(limit).map(|chunk| (family, chunk.to_vec())));
    }
    out
}

/// One address per line, each distinct address once.
pub fn stdin_for<T>(batch: &[(T, IpAddr)]) -> Vec<u8> {
    let mut seen = Vec::new();
    let mut text = String::new();
    for (_, address) in batch {
        if !seen.contains(address) {
            seen.push(*address);
            let _ = writeln!(text, "{address}");
        }
    }
    text.into_bytes()
}

/// Parse `fping -C` summary lines: `192.0.2.1 : 0.41 0.39 -`.
pub fn parse(report: &str) -> Samples {
    let mut samples = Samples::new();
    for line in report.lines() {
        let Some((address, values)) = line.split_once(" : ") else {
            continue;
        };
        let Ok(address) = address.trim().parse::<IpAddr>() else {
            continue;
        };
        let values = values.split_whitespace().map(|value| value.parse::<f64>().ok()).collect();
        samples.insert(address, values);
    }
    samples
}

/// Outcome and status text for one address, `None` when fping never
/// mentioned it.
pub fn verdict(samples: &Samples, address: IpAddr) -> Option<(Outcome, String)> {
    let values = samples.get(&address)?;
    let answered: Vec<f64> = values.iter().flatten().copied().collect();
    if answered.is_empty() {
        return Some((Outcome::ConnFailed, format!("{address} is unreachable")));
    }
    let average = answered.iter().sum::<f64>() / answered.len() as f64;
    Some((
        Outcome::Ok,
        format!("{address} is alive ({}/{} replies, avg {average:.2} ms)", answered.len(), values.len()),
    ))
}
