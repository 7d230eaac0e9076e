use std::time::Duration;

use tokio::time::sleep;

use canopy::api::meta;
use canopy::config::Config;
use canopy::server::CanopyServer;

use crate::functional::{TenancyResources, TestCluster};

async fn start_server(cluster: &TestCluster) -> Result<String, Box<dyn std::error::Error>> {
    let mut config = Config::default();
    config.bind_addr = "127.0.0.1:0".to_string();
    let server = CanopyServer::new_with_client(cluster.client.clone(), config).await?;
    let url = format!("http://{}", server.addr);
    tokio::spawn(async move { server.serve().await });
    sleep(Duration::from_secs(3)).await;
    Ok(url)
}

#[tokio::test]
async fn subnamespace_anchor_creates_child() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = TestCluster::new().await?;
    let resources = TenancyResources::new(cluster.client.clone());
    let _url = start_server(&cluster).await?;

    resources.create_namespace("team").await?;
    resources.set_parent("team", None).await?;
    resources.create_anchor("team", "dev").await?;
    sleep(Duration::from_secs(5)).await;

    // The anchor materialized the subnamespace with an owner annotation.
    let namespaces: kube::Api<k8s_openapi::api::core::v1::Namespace> =
        kube::Api::all(cluster.client.clone());
    let dev = namespaces.get("dev").await?;
    assert_eq!(
        dev.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(meta::SUBNAMESPACE_OF))
            .map(String::as_str),
        Some("team")
    );

    // The parent reports the child and the child carries depth labels.
    let team = resources.hierarchy_status("team").await?.expect("singleton");
    let status = team.status.unwrap_or_default();
    assert!(status.children.contains(&"dev".to_string()));

    let dev_hc = resources.hierarchy_status("dev").await?.expect("singleton");
    let dev_status = dev_hc.status.unwrap_or_default();
    assert_eq!(
        dev_status.labels.get(&meta::tree_depth_label("dev")),
        Some(&0i64)
    );
    assert_eq!(
        dev_status.labels.get(&meta::tree_depth_label("team")),
        Some(&1i64)
    );

    cluster.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn cycle_attempt_reports_crit_cycle() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = TestCluster::new().await?;
    let resources = TenancyResources::new(cluster.client.clone());
    let _url = start_server(&cluster).await?;

    resources.create_namespace("a").await?;
    resources.create_namespace("b").await?;
    resources.set_parent("b", Some("a")).await?;
    sleep(Duration::from_secs(3)).await;

    // a -> b while b descends from a: must be rejected.
    resources.set_parent("a", Some("b")).await?;
    sleep(Duration::from_secs(5)).await;

    let a = resources.hierarchy_status("a").await?.expect("singleton");
    let status = a.status.unwrap_or_default();
    assert!(
        status.conditions.iter().any(|c| c.type_ == "CritCycle"),
        "expected a CritCycle condition, got {:?}",
        status.conditions
    );

    // b's edge is intact.
    let b = resources.hierarchy_status("b").await?.expect("singleton");
    assert_eq!(b.spec.parent.as_deref(), Some("a"));

    cluster.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn configmaps_propagate_to_descendants() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = TestCluster::new().await?;
    let resources = TenancyResources::new(cluster.client.clone());
    let _url = start_server(&cluster).await?;

    resources.enable_configmap_propagation().await?;
    resources.create_namespace("team").await?;
    resources.create_namespace("dev").await?;
    resources.set_parent("team", None).await?;
    resources.set_parent("dev", Some("team")).await?;
    sleep(Duration::from_secs(3)).await;

    resources
        .create_configmap("team", "shared", &[("env", "staging")])
        .await?;

    let mut copy = None;
    for _ in 0..30 {
        if let Some(found) = resources.get_configmap("dev", "shared").await? {
            copy = Some(found);
            break;
        }
        sleep(Duration::from_secs(1)).await;
    }
    let copy = copy.expect("copy should appear in the descendant");
    assert_eq!(
        copy.data.as_ref().and_then(|d| d.get("env")).map(String::as_str),
        Some("staging")
    );
    assert_eq!(
        copy.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(meta::INHERITED_FROM))
            .map(String::as_str),
        Some("team/shared"),
        "copies carry a back-reference to their source"
    );

    // Deleting the source withdraws the copy.
    let api: kube::Api<k8s_openapi::api::core::v1::ConfigMap> =
        kube::Api::namespaced(cluster.client.clone(), "team");
    api.delete("shared", &Default::default()).await?;
    let mut gone = false;
    for _ in 0..30 {
        if resources.get_configmap("dev", "shared").await?.is_none() {
            gone = true;
            break;
        }
        sleep(Duration::from_secs(1)).await;
    }
    assert!(gone, "copy should be withdrawn with its source");

    cluster.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn diagnostic_endpoint_reports_forest() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = TestCluster::new().await?;
    let resources = TenancyResources::new(cluster.client.clone());
    let url = start_server(&cluster).await?;

    resources.create_namespace("team").await?;
    resources.set_parent("team", None).await?;
    sleep(Duration::from_secs(3)).await;

    let body: serde_json::Value = reqwest::get(format!("{url}/state")).await?.json().await?;
    let names: Vec<&str> = body
        .as_array()
        .expect("array of namespaces")
        .iter()
        .filter_map(|n| n.get("name").and_then(|v| v.as_str()))
        .collect();
    assert!(names.contains(&"team"), "state endpoint lists the forest: {names:?}");

    let metrics = reqwest::get(format!("{url}/metrics")).await?.text().await?;
    assert!(metrics.contains("canopy_"), "metrics endpoint renders counters");

    cluster.cleanup().await?;
    Ok(())
}

// Scenarios that span a second (tenant) control plane - downward pod sync,
// upward status sync, patrol orphan cleanup - need two k3s containers and a
// kubeconfig secret wired into a VirtualCluster object. The unit suites in
// src/sync cover the translation, precondition and differ logic those flows
// are built from.
