use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client};

use canopy::api::{
    CanopyConfiguration, CanopyConfigurationSpec, HIERARCHY_SINGLETON, HierarchyConfiguration,
    HierarchySpec, PropagationMode, ResourceSyncMode, SubnamespaceAnchor, SubnamespaceAnchorSpec,
};

pub struct TenancyResources {
    pub client: Client,
}

impl TenancyResources {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn create_namespace(&self, name: &str) -> Result<(), Box<dyn std::error::Error>> {
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        match namespaces.create(&PostParams::default(), &namespace).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn set_parent(
        &self,
        ns: &str,
        parent: Option<&str>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let api: Api<HierarchyConfiguration> = Api::namespaced(self.client.clone(), ns);
        let mut hc = HierarchyConfiguration::new(
            HIERARCHY_SINGLETON,
            HierarchySpec {
                parent: parent.map(String::from),
                allow_cascading_delete: false,
            },
        );
        hc.metadata.namespace = Some(ns.to_string());
        match api.create(&PostParams::default(), &hc).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                let existing = api.get(HIERARCHY_SINGLETON).await?;
                hc.metadata.resource_version = existing.metadata.resource_version;
                api.replace(HIERARCHY_SINGLETON, &PostParams::default(), &hc)
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn hierarchy_status(
        &self,
        ns: &str,
    ) -> Result<Option<HierarchyConfiguration>, Box<dyn std::error::Error>> {
        let api: Api<HierarchyConfiguration> = Api::namespaced(self.client.clone(), ns);
        Ok(api.get_opt(HIERARCHY_SINGLETON).await?)
    }

    pub async fn create_anchor(
        &self,
        parent: &str,
        name: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let api: Api<SubnamespaceAnchor> = Api::namespaced(self.client.clone(), parent);
        let mut anchor = SubnamespaceAnchor::new(name, SubnamespaceAnchorSpec::default());
        anchor.metadata.namespace = Some(parent.to_string());
        match api.create(&PostParams::default(), &anchor).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn enable_configmap_propagation(&self) -> Result<(), Box<dyn std::error::Error>> {
        let api: Api<CanopyConfiguration> = Api::all(self.client.clone());
        let config = CanopyConfiguration::new(
            "config",
            CanopyConfigurationSpec {
                resources: vec![ResourceSyncMode {
                    group: String::new(),
                    version: "v1".into(),
                    resource: "configmaps".into(),
                    kind: "ConfigMap".into(),
                    mode: PropagationMode::Propagate,
                }],
            },
        );
        match api.create(&PostParams::default(), &config).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn create_configmap(
        &self,
        ns: &str,
        name: &str,
        data: &[(&str, &str)],
    ) -> Result<(), Box<dyn std::error::Error>> {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        };
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), ns);
        match api.create(&PostParams::default(), &cm).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_configmap(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Box<dyn std::error::Error>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), ns);
        Ok(api.get_opt(name).await?)
    }

    pub async fn delete_namespace(&self, name: &str) -> Result<(), Box<dyn std::error::Error>> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        match namespaces.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
