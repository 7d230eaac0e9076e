//! Prints the canopy CRDs as YAML for `kubectl apply -f -`.

use kube::CustomResourceExt;

use canopy::api::{
    CanopyConfiguration, HierarchyConfiguration, SubnamespaceAnchor, VirtualCluster,
};

fn main() {
    for crd in [
        HierarchyConfiguration::crd(),
        SubnamespaceAnchor::crd(),
        CanopyConfiguration::crd(),
        VirtualCluster::crd(),
    ] {
        let yaml = serde_yaml::to_string(&crd).expect("CRDs serialize to yaml");
        println!("---\n{yaml}");
    }
}
