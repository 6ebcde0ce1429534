//! Thin re-export layer over `k8s-openapi`/`kube` types: the one place every
//! other crate names the cluster API vocabulary it needs.
#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod watch;

pub use self::watch::Watch;
pub use k8s_openapi::api::core::v1::{Container, ContainerPort, Pod, PodSpec, PodStatus};
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams},
    runtime::watcher::{self, Event},
    Client, Error, ResourceExt,
};

/// All container ports declared across a pod's containers, in declaration
/// order. A container without `ports` contributes nothing.
pub fn declared_ports(pod: &Pod) -> Vec<u16> {
    pod.spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|c| c.ports.iter().flatten())
        .map(|p| p.container_port as u16)
        .collect()
}

/// `pod.status.podIP`, if assigned.
pub fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.pod_ip.as_deref()
}

/// `pod.status.hostIP`, if assigned.
pub fn host_ip(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.host_ip.as_deref()
}

/// `pod.spec.nodeName`, if scheduled.
pub fn node_name(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref()?.node_name.as_deref()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodStatus};

    fn pod_with_ports(ports: Vec<i32>) -> Pod {
        Pod {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "c".into(),
                    ports: Some(
                        ports
                            .into_iter()
                            .map(|p| ContainerPort {
                                container_port: p,
                                ..Default::default()
                            })
                            .collect(),
                    ),
                    ..Default::default()
                }],
                node_name: Some("node-a".into()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: Some("10.0.0.5".into()),
                host_ip: Some("192.168.1.1".into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn declared_ports_spans_all_containers() {
        let pod = pod_with_ports(vec![8080, 8081]);
        assert_eq!(declared_ports(&pod), vec![8080, 8081]);
    }

    #[test]
    fn no_ports_declared_yields_empty() {
        let pod = pod_with_ports(vec![]);
        assert!(declared_ports(&pod).is_empty());
    }

    #[test]
    fn pod_and_host_ip_read_from_status() {
        let pod = pod_with_ports(vec![8080]);
        assert_eq!(pod_ip(&pod), Some("10.0.0.5"));
        assert_eq!(host_ip(&pod), Some("192.168.1.1"));
        assert_eq!(node_name(&pod), Some("node-a"));
    }
}
