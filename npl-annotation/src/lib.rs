//! Pure functions for reading, mutating, and serializing a pod's NPL
//! annotation. Nothing here touches kernel or cluster state.
#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use npl_core::HostPort;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The annotation key this agent reads and writes on pods it manages.
pub const ANNOTATION_KEY: &str = "nodeportlocal.antrea.io/podports";

/// One `{podport, nodeip, nodeport}` record. All three fields are declared
/// as strings, matching the wire format consumed by downstream load
/// balancers, not `u16`/`IpAddr`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PodAnnotationRecord {
    pub podport: String,
    pub nodeip: String,
    pub nodeport: String,
}

/// Parse the raw annotation value into records. A malformed value (or the
/// absent/empty case) is treated as an empty list and logged, so a corrupted
/// annotation self-heals on the next write instead of wedging the pod.
pub fn parse(value: Option<&str>) -> Vec<PodAnnotationRecord> {
    match value {
        None => Vec::new(),
        Some(raw) if raw.is_empty() => Vec::new(),
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|error| {
            tracing::warn!(%error, raw, "malformed NPL annotation, treating as empty");
            Vec::new()
        }),
    }
}

/// Serialize records back to the annotation's wire format. Empty input
/// serializes as `[]`, semantically equal to an absent annotation.
pub fn serialize(records: &[PodAnnotationRecord]) -> String {
    serde_json::to_string(records).expect("PodAnnotationRecord is always serializable")
}

/// Membership by `nodeport`.
pub fn contains(records: &[PodAnnotationRecord], host_port: HostPort) -> bool {
    let wanted = host_port.to_string();
    records.iter().any(|r| r.nodeport == wanted)
}

/// The `nodeport` of the record matching `pod_port`, if any.
pub fn get(records: &[PodAnnotationRecord], pod_port: u16) -> Option<HostPort> {
    let wanted = pod_port.to_string();
    records
        .iter()
        .find(|r| r.podport == wanted)
        .and_then(|r| r.nodeport.parse().ok())
        .map(HostPort)
}

/// Ensure a record exists for `pod_port`. If one already exists with a
/// different `nodeport` it is replaced in place, so a host port reassigned
/// after a restart doesn't leave a stale, no-longer-routable entry behind.
pub fn upsert(records: &mut Vec<PodAnnotationRecord>, pod_port: u16, host_ip: &str, host_port: HostPort) {
    let podport = pod_port.to_string();
    match records.iter_mut().find(|r| r.podport == podport) {
        Some(existing) => {
            existing.nodeip = host_ip.to_string();
            existing.nodeport = host_port.to_string();
        }
        None => records.push(PodAnnotationRecord {
            podport,
            nodeip: host_ip.to_string(),
            nodeport: host_port.to_string(),
        }),
    }
}

/// Drop the (at most one) record matching `pod_port`.
pub fn remove(records: &mut Vec<PodAnnotationRecord>, pod_port: u16) {
    let podport = pod_port.to_string();
    if let Some(pos) = records.iter().position(|r| r.podport == podport) {
        records.remove(pos);
    }
}

/// Read and parse the NPL annotation straight off a pod's annotation map.
pub fn read_from(annotations: Option<&BTreeMap<String, String>>) -> Vec<PodAnnotationRecord> {
    parse(annotations.and_then(|m| m.get(ANNOTATION_KEY)).map(String::as_str))
}

/// Serialize `records` and write them into a pod's annotation map.
pub fn write_into(annotations: &mut BTreeMap<String, String>, records: &[PodAnnotationRecord]) {
    annotations.insert(ANNOTATION_KEY.to_string(), serialize(records));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_and_empty_annotation_are_equal() {
        assert_eq!(parse(None), parse(Some("[]")));
        assert_eq!(parse(Some("")), parse(Some("[]")));
    }

    #[test]
    fn malformed_annotation_treated_as_empty() {
        assert!(parse(Some("not json")).is_empty());
    }

    #[test]
    fn round_trip_preserves_well_formed_annotation() {
        let records = vec![PodAnnotationRecord {
            podport: "8080".to_string(),
            nodeip: "10.0.0.1".to_string(),
            nodeport: "40000".to_string(),
        }];
        let raw = serialize(&records);
        assert_eq!(parse(Some(&raw)), records);
    }

    #[test]
    fn upsert_appends_new_record() {
        let mut records = Vec::new();
        upsert(&mut records, 8080, "10.0.0.1", HostPort(40000));
        assert_eq!(get(&records, 8080), Some(HostPort(40000)));
    }

    #[test]
    fn upsert_replaces_existing_record_in_place() {
        let mut records = vec![PodAnnotationRecord {
            podport: "8080".to_string(),
            nodeip: "10.0.0.1".to_string(),
            nodeport: "40000".to_string(),
        }];
        upsert(&mut records, 8080, "10.0.0.1", HostPort(40005));
        assert_eq!(records.len(), 1);
        assert_eq!(get(&records, 8080), Some(HostPort(40005)));
    }

    #[test]
    fn remove_drops_matching_record_only() {
        let mut records = Vec::new();
        upsert(&mut records, 8080, "10.0.0.1", HostPort(40000));
        upsert(&mut records, 8081, "10.0.0.1", HostPort(40001));
        remove(&mut records, 8080);
        assert_eq!(records.len(), 1);
        assert_eq!(get(&records, 8081), Some(HostPort(40001)));
    }

    #[test]
    fn contains_matches_by_nodeport() {
        let mut records = Vec::new();
        upsert(&mut records, 8080, "10.0.0.1", HostPort(40000));
        assert!(contains(&records, HostPort(40000)));
        assert!(!contains(&records, HostPort(40001)));
    }
}
