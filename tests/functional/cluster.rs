use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::PostParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config, CustomResourceExt};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::k3s::K3s;

use canopy::api::{
    CanopyConfiguration, HierarchyConfiguration, SubnamespaceAnchor, VirtualCluster,
};

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

/// A disposable k3s control plane with the canopy CRDs installed.
pub struct TestCluster {
    pub container: ContainerAsync<K3s>,
    pub client: Client,
}

impl TestCluster {
    /// Boots k3s, connects through the mapped apiserver port, and installs
    /// every canopy CRD before handing the cluster to the test.
    pub async fn new() -> TestResult<Self> {
        let container = boot_k3s().await?;
        let client = admin_client(&container).await?;

        let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
        for crd in [
            HierarchyConfiguration::crd(),
            SubnamespaceAnchor::crd(),
            CanopyConfiguration::crd(),
            VirtualCluster::crd(),
        ] {
            match crds.create(&PostParams::default(), &crd).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(TestCluster { container, client })
    }

    pub async fn cleanup(self) -> TestResult<()> {
        self.container.stop().await?;
        Ok(())
    }
}

async fn boot_k3s() -> TestResult<ContainerAsync<K3s>> {
    let conf_dir = std::env::temp_dir().join(format!("canopy-k3s-{}", std::process::id()));
    std::fs::create_dir_all(&conf_dir)?;
    std::fs::copy(
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/k3s-config.yaml"),
        conf_dir.join("config.yaml"),
    )?;
    Ok(K3s::default()
        .with_conf_mount(&conf_dir)
        .with_privileged(true)
        .start()
        .await?)
}

/// The kubeconfig inside the container points at the in-container address;
/// rewrite every cluster entry to the host-mapped port before connecting.
async fn admin_client(container: &ContainerAsync<K3s>) -> TestResult<Client> {
    let mut kubeconfig: Kubeconfig =
        serde_yaml::from_str(&container.image().read_kube_config()?)?;
    let port = container.get_host_port_ipv4(6443).await?;
    for named in kubeconfig.clusters.iter_mut() {
        if let Some(cluster) = named.cluster.as_mut() {
            cluster.server = Some(format!("https://127.0.0.1:{port}"));
        }
    }
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    Ok(Client::try_from(config)?)
}
