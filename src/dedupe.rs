use std::collections::HashSet;

use ipnet::Ipv4Net;
use tracing::debug;

use crate::types::Candidate;

/// Two-stage duplicate collapse over previously known (`existing`) and newly
/// discovered (`fresh`) candidates.
///
/// Stage A drops exact `ip:port` repeats. Stage B keeps a single candidate
/// per `(/24 network, port)` pair. Existing candidates are added first, so a
/// subnet collision between an existing and a fresh candidate always resolves
/// in favor of the existing one.
///
/// Output order follows input order (existing before fresh) and the whole
/// operation is idempotent: feeding the result back in with no fresh
/// candidates returns it unchanged.
pub fn dedupe(existing: &[Candidate], fresh: &[Candidate]) -> Vec<Candidate> {
    // Stage A: exact host dedup, existing first.
    let mut seen: HashSet<Candidate> = HashSet::new();
    let mut hosts: Vec<Candidate> = Vec::with_capacity(existing.len() + fresh.len());
    for &c in existing.iter().chain(fresh.iter()) {
        if seen.insert(c) {
            hosts.push(c);
        }
    }

    // Stage B: one survivor per (/24, port). First encountered wins, which is
    // the existing member whenever the group has one.
    let mut subnet_seen: HashSet<(Ipv4Net, u16)> = HashSet::new();
    let mut out: Vec<Candidate> = Vec::with_capacity(hosts.len());
    for c in hosts {
        if subnet_seen.insert(c.subnet_key()) {
            out.push(c);
        } else {
            debug!(candidate = %c, "dropped by /24+port collapse");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(s: &str) -> Candidate {
        s.parse().unwrap()
    }

    #[test]
    fn exact_duplicates_from_fresh_are_dropped() {
        // Existing {1.2.3.4:80}, fresh {1.2.3.4:80, 1.2.3.6:81}: the repeat
        // is not added, the new host survives.
        let existing = vec![c("1.2.3.4:80")];
        let fresh = vec![c("1.2.3.4:80"), c("1.2.3.6:81")];
        let out = dedupe(&existing, &fresh);
        assert_eq!(out, vec![c("1.2.3.4:80"), c("1.2.3.6:81")]);
    }

    #[test]
    fn subnet_collision_keeps_the_existing_member() {
        let existing = vec![c("1.2.3.4:80")];
        let fresh = vec![c("1.2.3.250:80")];
        let out = dedupe(&existing, &fresh);
        assert_eq!(out, vec![c("1.2.3.4:80")]);
    }

    #[test]
    fn subnet_collision_between_fresh_keeps_first_encountered() {
        let fresh = vec![c("10.0.0.1:80"), c("10.0.0.2:80"), c("10.0.0.3:80")];
        let out = dedupe(&[], &fresh);
        assert_eq!(out, vec![c("10.0.0.1:80")]);
    }

    #[test]
    fn same_subnet_different_port_both_survive() {
        let fresh = vec![c("10.0.0.1:80"), c("10.0.0.2:8080")];
        let out = dedupe(&[], &fresh);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn dedupe_is_idempotent() {
        let existing = vec![c("1.2.3.4:80"), c("5.6.7.8:80")];
        let fresh = vec![
            c("1.2.3.9:80"),
            c("5.6.7.8:80"),
            c("9.9.9.9:1234"),
            c("9.9.9.10:1234"),
        ];
        let once = dedupe(&existing, &fresh);
        let twice = dedupe(&once, &[]);
        assert_eq!(once, twice);
    }

    #[test]
    fn at_most_one_per_subnet_port_pair() {
        let fresh: Vec<Candidate> = (1..=20).map(|i| c(&format!("10.1.1.{i}:4022"))).collect();
        let out = dedupe(&[], &fresh);
        assert_eq!(out.len(), 1);
        let mut keys = HashSet::new();
        for cand in &out {
            assert!(keys.insert(cand.subnet_key()));
        }
    }
}
