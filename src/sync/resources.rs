//! Kind strategies: what each mirrored resource clears on the way down and
//! mirrors on the way up.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Binding, ConfigMap, Node, ObjectReference, PersistentVolumeClaim, Pod, Secret, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Api;
use kube::api::PostParams;
use tracing::{debug, info};

use crate::api::meta;
use crate::errors::{Error, Result};
use crate::tenant::TenantCluster;

use super::{SyncedResource, json_eq, maps_subset};

/// Label carried by nodes synthesized in tenant clusters to mirror super
/// nodes.
pub const VIRTUAL_NODE_LABEL: &str = "canopy.dev/virtual-node";

fn metadata_mirrored(desired: &ObjectMeta, actual: &ObjectMeta) -> bool {
    maps_subset(&desired.labels, &actual.labels)
        && maps_subset(&desired.annotations, &actual.annotations)
}

#[async_trait]
impl SyncedResource for Pod {
    const KIND: &'static str = "Pod";

    fn mutate_for_super(&mut self) {
        let spec = match self.spec.as_mut() {
            Some(s) => s,
            None => return,
        };
        spec.node_name = None;
        spec.host_network = None;
        spec.host_pid = None;
        spec.host_ipc = None;

        // Host mounts never cross the boundary.
        let banned: Vec<String> = spec
            .volumes
            .as_ref()
            .map(|vols| {
                vols.iter()
                    .filter(|v| v.host_path.is_some())
                    .map(|v| v.name.clone())
                    .collect()
            })
            .unwrap_or_default();
        if banned.is_empty() {
            return;
        }
        if let Some(vols) = spec.volumes.as_mut() {
            vols.retain(|v| v.host_path.is_none());
        }
        for container in spec
            .containers
            .iter_mut()
            .chain(spec.init_containers.iter_mut().flatten())
        {
            if let Some(mounts) = container.volume_mounts.as_mut() {
                mounts.retain(|m| !banned.contains(&m.name));
            }
        }
    }

    fn desired_equal(desired: &Self, super_obj: &Self) -> bool {
        // The super scheduler fills in the node; that is not drift.
        let mut actual_spec = super_obj.spec.clone();
        if let Some(s) = actual_spec.as_mut() {
            s.node_name = None;
        }
        json_eq(&desired.spec, &actual_spec)
            && metadata_mirrored(&desired.metadata, &super_obj.metadata)
    }

    fn status_differs(tenant: &Self, super_obj: &Self) -> bool {
        !json_eq(&tenant.status, &super_obj.status)
    }

    fn back_populate(tenant: &mut Self, super_obj: &Self) -> bool {
        if json_eq(&tenant.status, &super_obj.status) {
            return false;
        }
        tenant.status = super_obj.status.clone();
        true
    }

    fn downward_allowed(&self, super_cluster_id: &str) -> bool {
        match self
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(meta::SCHEDULED_CLUSTER))
        {
            Some(scheduled) => scheduled == super_cluster_id,
            None => true,
        }
    }

    /// When the super scheduler assigns a node, mirror it as a virtual node
    /// in the tenant and bind the tenant pod to it.
    async fn upward_effects(
        cluster: &TenantCluster,
        super_obj: &Self,
        tenant_ns: &str,
    ) -> Result<()> {
        let node_name = match super_obj.spec.as_ref().and_then(|s| s.node_name.as_deref()) {
            Some(n) => n.to_string(),
            None => return Ok(()),
        };
        let pod_name = super_obj.metadata.name.clone().unwrap_or_default();

        let nodes: Api<Node> = Api::all(cluster.client());
        if nodes
            .get_opt(&node_name)
            .await
            .map_err(Error::classify)?
            .is_none()
        {
            let node = Node {
                metadata: ObjectMeta {
                    name: Some(node_name.clone()),
                    labels: Some(
                        [(VIRTUAL_NODE_LABEL.to_string(), "true".to_string())]
                            .into_iter()
                            .collect(),
                    ),
                    ..Default::default()
                },
                ..Default::default()
            };
            match nodes.create(&PostParams::default(), &node).await {
                Ok(_) => info!(node = %node_name, cluster = %cluster.key(), "virtual node created"),
                Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                Err(err) => return Err(Error::classify(err)),
            }
        }

        let bound = cluster
            .cached::<Pod>(Pod::KIND, tenant_ns, &pod_name)?
            .map(|p| p.spec.as_ref().and_then(|s| s.node_name.clone()).is_some())
            .unwrap_or(true);
        if bound {
            return Ok(());
        }

        let binding = Binding {
            metadata: ObjectMeta {
                name: Some(pod_name.clone()),
                namespace: Some(tenant_ns.to_string()),
                ..Default::default()
            },
            target: ObjectReference {
                kind: Some("Node".into()),
                name: Some(node_name.clone()),
                ..Default::default()
            },
        };
        let bindings: Api<Binding> = Api::namespaced(cluster.client(), tenant_ns);
        match bindings.create(&PostParams::default(), &binding).await {
            Ok(_) => {
                info!(pod = %pod_name, node = %node_name, cluster = %cluster.key(), "tenant pod bound to virtual node");
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(pod = %pod_name, "pod already bound");
            }
            Err(err) => return Err(Error::classify(err)),
        }
        Ok(())
    }
}

#[async_trait]
impl SyncedResource for Service {
    const KIND: &'static str = "Service";

    fn mutate_for_super(&mut self) {
        let spec = match self.spec.as_mut() {
            Some(s) => s,
            None => return,
        };
        // The super cluster allocates its own addresses and node ports.
        spec.cluster_ip = None;
        spec.cluster_ips = None;
        if let Some(ports) = spec.ports.as_mut() {
            for port in ports {
                port.node_port = None;
            }
        }
    }

    fn desired_equal(desired: &Self, super_obj: &Self) -> bool {
        let mut actual = super_obj.clone();
        actual.mutate_for_super();
        json_eq(&desired.spec, &actual.spec)
            && metadata_mirrored(&desired.metadata, &super_obj.metadata)
    }

    fn status_differs(tenant: &Self, super_obj: &Self) -> bool {
        let tenant_ip = tenant.spec.as_ref().and_then(|s| s.cluster_ip.as_deref());
        let super_ip = super_obj.spec.as_ref().and_then(|s| s.cluster_ip.as_deref());
        !json_eq(&tenant.status, &super_obj.status) || tenant_ip != super_ip
    }

    fn back_populate(tenant: &mut Self, super_obj: &Self) -> bool {
        let mut changed = false;
        if !json_eq(&tenant.status, &super_obj.status) {
            tenant.status = super_obj.status.clone();
            changed = true;
        }
        let super_spec = match super_obj.spec.as_ref() {
            Some(s) => s,
            None => return changed,
        };
        let spec = tenant.spec.get_or_insert_with(Default::default);
        if spec.cluster_ip != super_spec.cluster_ip {
            spec.cluster_ip = super_spec.cluster_ip.clone();
            changed = true;
        }
        if !json_eq(&spec.ports, &super_spec.ports) {
            spec.ports = super_spec.ports.clone();
            changed = true;
        }
        changed
    }

    fn back_populates_spec() -> bool {
        true
    }
}

#[async_trait]
impl SyncedResource for ConfigMap {
    const KIND: &'static str = "ConfigMap";

    fn mutate_for_super(&mut self) {}

    fn desired_equal(desired: &Self, super_obj: &Self) -> bool {
        json_eq(&desired.data, &super_obj.data)
            && json_eq(&desired.binary_data, &super_obj.binary_data)
            && metadata_mirrored(&desired.metadata, &super_obj.metadata)
    }

    fn status_differs(_tenant: &Self, _super_obj: &Self) -> bool {
        false
    }

    fn back_populate(_tenant: &mut Self, _super_obj: &Self) -> bool {
        false
    }
}

#[async_trait]
impl SyncedResource for Secret {
    const KIND: &'static str = "Secret";

    fn mutate_for_super(&mut self) {}

    fn desired_equal(desired: &Self, super_obj: &Self) -> bool {
        json_eq(&desired.data, &super_obj.data)
            && json_eq(&desired.type_, &super_obj.type_)
            && metadata_mirrored(&desired.metadata, &super_obj.metadata)
    }

    fn status_differs(_tenant: &Self, _super_obj: &Self) -> bool {
        false
    }

    fn back_populate(_tenant: &mut Self, _super_obj: &Self) -> bool {
        false
    }
}

#[async_trait]
impl SyncedResource for PersistentVolumeClaim {
    const KIND: &'static str = "PersistentVolumeClaim";

    fn mutate_for_super(&mut self) {
        if let Some(spec) = self.spec.as_mut() {
            // Volume binding is per-cluster state.
            spec.volume_name = None;
        }
    }

    fn desired_equal(desired: &Self, super_obj: &Self) -> bool {
        let mut actual = super_obj.clone();
        actual.mutate_for_super();
        json_eq(&desired.spec, &actual.spec)
            && metadata_mirrored(&desired.metadata, &super_obj.metadata)
    }

    fn status_differs(tenant: &Self, super_obj: &Self) -> bool {
        !json_eq(&tenant.status, &super_obj.status)
    }

    fn back_populate(tenant: &mut Self, super_obj: &Self) -> bool {
        if json_eq(&tenant.status, &super_obj.status) {
            return false;
        }
        tenant.status = super_obj.status.clone();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        Container, HostPathVolumeSource, PodSpec, PodStatus, ServicePort, ServiceSpec, Volume,
        VolumeMount,
    };

    fn host_mount_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web".into()),
                namespace: Some("prod".into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                host_network: Some(true),
                node_name: Some("tenant-node".into()),
                containers: vec![Container {
                    name: "app".into(),
                    volume_mounts: Some(vec![
                        VolumeMount {
                            name: "host-logs".into(),
                            mount_path: "/var/log".into(),
                            ..Default::default()
                        },
                        VolumeMount {
                            name: "cache".into(),
                            mount_path: "/cache".into(),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }],
                volumes: Some(vec![
                    Volume {
                        name: "host-logs".into(),
                        host_path: Some(HostPathVolumeSource {
                            path: "/var/log".into(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Volume {
                        name: "cache".into(),
                        empty_dir: Some(Default::default()),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn pod_mutation_strips_host_access() {
        let mut pod = host_mount_pod();
        pod.mutate_for_super();
        let spec = pod.spec.expect("spec");
        assert_eq!(spec.host_network, None);
        assert_eq!(spec.node_name, None);
        let volumes = spec.volumes.expect("volumes");
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, "cache");
        let mounts = spec.containers[0].volume_mounts.as_ref().expect("mounts");
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].name, "cache");
    }

    #[test]
    fn pod_equality_ignores_super_node_assignment() {
        let mut desired = host_mount_pod();
        desired.mutate_for_super();
        let mut on_super = desired.clone();
        on_super
            .spec
            .as_mut()
            .expect("spec")
            .node_name = Some("super-node-7".into());
        assert!(Pod::desired_equal(&desired, &on_super));
    }

    #[test]
    fn pod_back_populates_status() {
        let mut tenant = host_mount_pod();
        let mut on_super = tenant.clone();
        on_super.status = Some(PodStatus {
            phase: Some("Running".into()),
            host_ip: Some("10.0.0.5".into()),
            ..Default::default()
        });
        assert!(Pod::status_differs(&tenant, &on_super));
        assert!(Pod::back_populate(&mut tenant, &on_super));
        let status = tenant.status.expect("status");
        assert_eq!(status.phase.as_deref(), Some("Running"));
        assert_eq!(status.host_ip.as_deref(), Some("10.0.0.5"));
        assert!(!Pod::back_populate(&mut tenant.clone(), &on_super));
    }

    #[test]
    fn pod_scheduling_gate_checks_annotation() {
        let mut pod = host_mount_pod();
        assert!(pod.downward_allowed("super-1"), "unannotated pods pass");
        pod.metadata.annotations = Some(
            [(meta::SCHEDULED_CLUSTER.to_string(), "super-2".to_string())]
                .into_iter()
                .collect(),
        );
        assert!(!pod.downward_allowed("super-1"));
        assert!(pod.downward_allowed("super-2"));
    }

    #[test]
    fn service_cluster_ip_cleared_then_mirrored_back() {
        let mut svc = Service {
            metadata: ObjectMeta {
                name: Some("api".into()),
                namespace: Some("prod".into()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.96.0.17".into()),
                ports: Some(vec![ServicePort {
                    port: 80,
                    node_port: Some(30080),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        svc.mutate_for_super();
        let spec = svc.spec.as_ref().expect("spec");
        assert_eq!(spec.cluster_ip, None);
        assert_eq!(spec.ports.as_ref().expect("ports")[0].node_port, None);

        // Super assigns a fresh address; the tenant service mirrors it.
        let mut on_super = svc.clone();
        on_super.spec.as_mut().expect("spec").cluster_ip = Some("10.200.0.3".into());
        assert!(Service::status_differs(&svc, &on_super));
        assert!(Service::back_populate(&mut svc, &on_super));
        assert_eq!(
            svc.spec.expect("spec").cluster_ip.as_deref(),
            Some("10.200.0.3")
        );
    }

    #[test]
    fn pvc_binding_dropped() {
        let mut pvc = PersistentVolumeClaim::default();
        pvc.spec = Some(k8s_openapi::api::core::v1::PersistentVolumeClaimSpec {
            volume_name: Some("pv-123".into()),
            ..Default::default()
        });
        pvc.mutate_for_super();
        assert_eq!(pvc.spec.expect("spec").volume_name, None);
    }

    #[test]
    fn configmap_equality_tolerates_extra_server_metadata() {
        let desired = ConfigMap {
            metadata: ObjectMeta {
                name: Some("cm".into()),
                ..Default::default()
            },
            data: Some([("a".to_string(), "1".to_string())].into_iter().collect()),
            ..Default::default()
        };
        let mut actual = desired.clone();
        actual.metadata.annotations = Some(
            [("server.example/added".to_string(), "x".to_string())]
                .into_iter()
                .collect(),
        );
        assert!(ConfigMap::desired_equal(&desired, &actual));
        let mut drifted = actual.clone();
        drifted.data = Some([("a".to_string(), "2".to_string())].into_iter().collect());
        assert!(!ConfigMap::desired_equal(&desired, &drifted));
    }
}
