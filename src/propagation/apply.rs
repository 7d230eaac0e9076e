//! Applies propagation operations against the apiserver and keeps per-kind
//! watchers running for every kind the configuration singleton names.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject};
use kube::runtime::watcher;
use kube::{Api, Client};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{CanopyConfigurationSpec, KindKey, PropagationMode};
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::forest::{Affect, Code, Condition, SharedForest};
use crate::propagation::{Op, ModeTable, compute_namespace_ops, is_propagated_copy};

const FIELD_MANAGER: &str = "canopy";

/// Drives object propagation: owns the mode table, one watcher per managed
/// kind, and the write path towards the apiserver.
pub struct Propagator {
    client: Client,
    forest: SharedForest,
    config: Arc<Config>,
    modes: Mutex<ModeTable>,
    resources: Mutex<HashMap<KindKey, ApiResource>>,
    watchers: Mutex<HashMap<KindKey, JoinHandle<()>>>,
    stop: watch::Receiver<bool>,
}

impl Propagator {
    pub fn new(
        client: Client,
        forest: SharedForest,
        config: Arc<Config>,
        stop: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            forest,
            modes: Mutex::new(ModeTable::new(config.force_propagation)),
            config,
            resources: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            stop,
        })
    }

    /// Applies the configuration singleton: records modes, starts or stops
    /// kind watchers, and resyncs every known namespace for kinds whose mode
    /// changed.
    pub async fn apply_config(self: &Arc<Self>, spec: &CanopyConfigurationSpec) -> Result<()> {
        let mut changed = Vec::new();
        {
            let mut modes = self.modes.lock().await;
            let mut resources = self.resources.lock().await;
            for entry in &spec.resources {
                let kind = entry.kind_key();
                resources.insert(kind.clone(), entry.api_resource());
                let old = modes.set_mode(kind.clone(), entry.mode);
                if old != entry.mode {
                    info!(kind = %kind, ?old, new = ?entry.mode, "propagation mode changed");
                    changed.push((kind, entry.mode));
                }
            }
        }

        for (kind, mode) in changed {
            match mode {
                PropagationMode::Ignore => self.stop_watcher(&kind).await,
                _ => self.ensure_watcher(&kind).await?,
            }
            self.resync_kind(&kind).await;
        }
        Ok(())
    }

    async fn ensure_watcher(self: &Arc<Self>, kind: &KindKey) -> Result<()> {
        let mut watchers = self.watchers.lock().await;
        if watchers.contains_key(kind) {
            return Ok(());
        }
        let ar = self
            .resources
            .lock()
            .await
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::InvalidConfig(format!("no api resource known for {kind}")))?;
        let this = Arc::clone(self);
        let key = kind.clone();
        info!(kind = %kind, "starting propagation watcher");
        watchers.insert(
            kind.clone(),
            tokio::spawn(async move { this.watch_kind(key, ar).await }),
        );
        Ok(())
    }

    async fn stop_watcher(&self, kind: &KindKey) {
        if let Some(handle) = self.watchers.lock().await.remove(kind) {
            info!(kind = %kind, "stopping propagation watcher");
            handle.abort();
        }
    }

    /// Watches one kind cluster-wide and keeps the forest's source index and
    /// the descendants' copies in step with what it sees.
    async fn watch_kind(self: Arc<Self>, kind: KindKey, ar: ApiResource) {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let mut stop = self.stop.clone();
        let mut stream = std::pin::pin!(watcher(api, watcher::Config::default()));
        loop {
            let event = tokio::select! {
                _ = stop.changed() => break,
                event = stream.next() => event,
            };
            match event {
                Some(Ok(watcher::Event::Apply(obj) | watcher::Event::InitApply(obj))) => {
                    self.observe_upsert(&kind, obj).await;
                }
                Some(Ok(watcher::Event::Delete(obj))) => {
                    self.observe_delete(&kind, obj).await;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(kind = %kind, error = %err, "propagation watch error");
                }
                None => break,
            }
        }
        debug!(kind = %kind, "propagation watcher stopped");
    }

    async fn observe_upsert(&self, kind: &KindKey, obj: DynamicObject) {
        let (ns, name) = match (obj.metadata.namespace.clone(), obj.metadata.name.clone()) {
            (Some(ns), Some(name)) => (ns, name),
            _ => return,
        };
        if self.config.is_excluded_namespace(&ns) {
            return;
        }
        if is_propagated_copy(&obj) {
            // One of our copies moved underneath us; re-derive it.
            if let Err(err) = self.sync_namespace_kind(&ns, kind).await {
                warn!(namespace = %ns, kind = %kind, error = %err, "copy resync failed");
            }
            return;
        }
        let descendants = {
            let mut forest = self.forest.lock().await;
            forest.get(&ns).exists = true;
            forest.set_source_object(&ns, kind, &name, obj);
            forest.descendant_names(&ns)
        };
        self.sync_namespaces(kind, &descendants).await;
    }

    async fn observe_delete(&self, kind: &KindKey, obj: DynamicObject) {
        let (ns, name) = match (obj.metadata.namespace.clone(), obj.metadata.name.clone()) {
            (Some(ns), Some(name)) => (ns, name),
            _ => return,
        };
        if is_propagated_copy(&obj) {
            // A copy vanished; the sync below recreates it if still desired.
            if let Err(err) = self.sync_namespace_kind(&ns, kind).await {
                warn!(namespace = %ns, kind = %kind, error = %err, "copy resync failed");
            }
            return;
        }
        let descendants = {
            let mut forest = self.forest.lock().await;
            forest.remove_source_object(&ns, kind, &name);
            forest.descendant_names(&ns)
        };
        self.sync_namespaces(kind, &descendants).await;
    }

    async fn sync_namespaces(&self, kind: &KindKey, namespaces: &[String]) {
        for ns in namespaces {
            if let Err(err) = self.sync_namespace_kind(ns, kind).await {
                warn!(namespace = %ns, kind = %kind, error = %err, "propagation sync failed");
            }
        }
    }

    /// Resyncs every kind for the given namespaces; used after hierarchy
    /// edits move a subtree.
    pub async fn resync_subtree(&self, namespaces: &[String]) {
        let kinds = self.modes.lock().await.kinds();
        for kind in kinds {
            self.sync_namespaces(&kind, namespaces).await;
        }
    }

    async fn resync_kind(&self, kind: &KindKey) {
        let namespaces = {
            let forest = self.forest.lock().await;
            forest.names()
        };
        self.sync_namespaces(kind, &namespaces).await;
    }

    /// Brings one (namespace, kind) pair to its target state.
    pub async fn sync_namespace_kind(&self, ns: &str, kind: &KindKey) -> Result<()> {
        if self.config.is_excluded_namespace(ns) {
            return Ok(());
        }
        let ar = match self.resources.lock().await.get(kind).cloned() {
            Some(ar) => ar,
            None => return Ok(()),
        };
        let (mode, overwrite) = {
            let modes = self.modes.lock().await;
            (modes.mode(kind), modes.overwrite_allowed(kind))
        };

        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), ns, &ar);
        let existing = api
            .list(&ListParams::default())
            .await
            .map_err(Error::classify)?
            .items;

        let ops = {
            let mut forest = self.forest.lock().await;
            if !forest.contains(ns) {
                return Ok(());
            }
            let kind_name = kind.kind.clone();
            forest.get(ns).clear_conditions_where(|cond| {
                cond.code == Code::CannotPropagate
                    && matches!(&cond.affect, Affect::Object { kind: k, .. } if *k == kind_name)
            });
            compute_namespace_ops(&forest, ns, kind, mode, &existing, overwrite)
        };
        self.apply_ops(&api, ns, kind, ops).await
    }

    async fn apply_ops(
        &self,
        api: &Api<DynamicObject>,
        ns: &str,
        kind: &KindKey,
        ops: Vec<Op>,
    ) -> Result<()> {
        for op in ops {
            match op {
                Op::Upsert { name, object, .. } => {
                    debug!(namespace = %ns, kind = %kind, name = %name, "propagating copy");
                    api.patch(
                        &name,
                        &PatchParams::apply(FIELD_MANAGER).force(),
                        &Patch::Apply(object.as_ref()),
                    )
                    .await
                    .map_err(Error::classify)?;
                }
                Op::Delete { name, .. } => {
                    debug!(namespace = %ns, kind = %kind, name = %name, "removing stale copy");
                    match api.delete(&name, &DeleteParams::default()).await {
                        Ok(_) => {}
                        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                        Err(err) => return Err(Error::classify(err)),
                    }
                }
                Op::Conflict { name, source, .. } => {
                    error!(
                        namespace = %ns,
                        kind = %kind,
                        name = %name,
                        source = %source,
                        "user object blocks propagation"
                    );
                    let mut forest = self.forest.lock().await;
                    forest.get(ns).set_condition(Condition::new(
                        Code::CannotPropagate,
                        Affect::object(kind.kind.clone(), ns, name),
                        format!("a conflicting object blocks the copy of {source}"),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Watches the cluster-scoped configuration singleton and feeds it into the
/// propagator.
pub async fn run_config_controller(propagator: Arc<Propagator>, client: Client) {
    use futures::FutureExt;
    use kube::runtime::Controller;
    use kube::runtime::controller::Action;

    use crate::api::{ApiCondition, CONFIGURATION_SINGLETON, CanopyConfiguration};

    struct Ctx {
        propagator: Arc<Propagator>,
        client: Client,
    }

    async fn reconcile(
        cfg: Arc<CanopyConfiguration>,
        ctx: Arc<Ctx>,
    ) -> std::result::Result<Action, Error> {
        let name = match cfg.metadata.name.as_deref() {
            Some(n) => n,
            None => return Ok(Action::await_change()),
        };
        if name != CONFIGURATION_SINGLETON {
            warn!(name = %name, "ignoring non-singleton configuration object");
            return Ok(Action::await_change());
        }

        let mut conditions = Vec::new();
        for entry in &cfg.spec.resources {
            if entry.resource.is_empty() || entry.kind.is_empty() {
                conditions.push(ApiCondition {
                    type_: Code::InvalidMode.to_string(),
                    reason: Some("IncompleteResource".into()),
                    message: format!(
                        "resource entry {} needs both a resource and a kind",
                        entry.kind_key()
                    ),
                    affects: vec![entry.kind_key().to_string()],
                    last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
                });
            }
        }
        let valid = CanopyConfigurationSpec {
            resources: cfg
                .spec
                .resources
                .iter()
                .filter(|e| !e.resource.is_empty() && !e.kind.is_empty())
                .cloned()
                .collect(),
        };
        ctx.propagator.apply_config(&valid).await?;

        let status = serde_json::json!({"status": {"conditions": conditions}});
        let api: Api<CanopyConfiguration> = Api::all(ctx.client.clone());
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status),
        )
        .await
        .map_err(Error::classify)?;
        Ok(Action::await_change())
    }

    fn error_policy(
        _cfg: Arc<CanopyConfiguration>,
        error: &Error,
        _ctx: Arc<Ctx>,
    ) -> Action {
        error!(error = %error, "configuration reconcile failed");
        Action::requeue(std::time::Duration::from_secs(30))
    }

    let ctx = Arc::new(Ctx {
        propagator,
        client: client.clone(),
    });
    Controller::new(
        Api::<CanopyConfiguration>::all(client),
        watcher::Config::default().any_semantic(),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(|res| async move {
        if let Err(e) = res {
            info!("configuration controller error: {:?}", e);
        }
    })
    .boxed()
    .await;
}
