//! Lantern kubehub: the cluster [`Transport`] (discovery, list, watch) over kube's dynamic API.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, WatchEvent, WatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject},
    discovery::{ApiCapabilities, Discovery, Scope},
    Client, Config,
};
use lantern_core::{
    ChangeEvent, Error, EventKind, ListOptions, Object, ResourceId, ResourceMeta, Result, Transport, UpstreamWatch,
    WatchFeed,
};
use metrics::{counter, histogram};
use serde_json::json;
use tracing::{debug, info, warn};

/// Connection and caching knobs for [`KubeTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Explicit kubeconfig file; `None` infers (in-cluster, `KUBECONFIG`, `~/.kube/config`).
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    /// How long a discovery result is served before it is fetched again.
    pub discovery_ttl: Duration,
    /// Buffered events per upstream watch.
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { kubeconfig: None, context: None, discovery_ttl: Duration::from_secs(180), channel_capacity: 128 }
    }
}

impl TransportConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let ttl = std::env::var("LANTERN_DISCOVERY_TTL_SECS").ok().and_then(|s| s.parse::<u64>().ok());
        let cap = std::env::var("LANTERN_UPSTREAM_CAP").ok().and_then(|s| s.parse::<usize>().ok());
        Self {
            kubeconfig: std::env::var_os("LANTERN_KUBECONFIG").map(PathBuf::from),
            context: std::env::var("LANTERN_CONTEXT").ok().filter(|s| !s.is_empty()),
            discovery_ttl: ttl.map(Duration::from_secs).unwrap_or(d.discovery_ttl),
            channel_capacity: cap.filter(|c| *c > 0).unwrap_or(d.channel_capacity),
        }
    }
}

struct Catalog {
    fetched: Instant,
    metas: Vec<ResourceMeta>,
    index: HashMap<ResourceId, (ApiResource, bool)>,
}

impl Catalog {
    fn from_discovery(discovery: &Discovery) -> Self {
        let mut metas = Vec::new();
        let mut index = HashMap::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let meta = resource_meta(&ar, &caps);
                index.insert(meta.id.clone(), (ar, meta.namespaced));
                metas.push(meta);
            }
        }
        metas.sort_by(|a, b| a.id.cmp(&b.id));
        Self { fetched: Instant::now(), metas, index }
    }

    fn fresh(&self, ttl: Duration) -> bool { self.fetched.elapsed() < ttl }
}

fn resource_meta(ar: &ApiResource, caps: &ApiCapabilities) -> ResourceMeta {
    ResourceMeta::new(
        ResourceId::new(ar.group.as_str(), ar.version.as_str(), ar.plural.as_str()),
        ar.kind.as_str(),
        caps.operations.iter().map(String::as_str),
        matches!(caps.scope, Scope::Namespaced),
    )
}

/// [`Transport`] backed by a kube [`Client`]. Discovery results are cached for
/// `discovery_ttl` and refreshed once when a resource is not found.
pub struct KubeTransport {
    client: Client,
    cfg: TransportConfig,
    catalog: ArcSwapOption<Catalog>,
    refresh: tokio::sync::Mutex<()>,
}

impl KubeTransport {
    pub fn from_client(client: Client, cfg: TransportConfig) -> Self {
        Self { client, cfg, catalog: ArcSwapOption::empty(), refresh: tokio::sync::Mutex::new(()) }
    }

    /// Connect using `LANTERN_*` environment settings.
    pub async fn try_default() -> anyhow::Result<Self> { Self::connect(TransportConfig::from_env()).await }

    pub async fn connect(cfg: TransportConfig) -> anyhow::Result<Self> {
        let opts = KubeConfigOptions { context: cfg.context.clone(), ..KubeConfigOptions::default() };
        let config = match (&cfg.kubeconfig, &cfg.context) {
            (Some(path), _) => {
                let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
                Config::from_custom_kubeconfig(kc, &opts).await.context("loading kubeconfig")?
            }
            (None, Some(_)) => Config::from_kubeconfig(&opts).await.context("loading kubeconfig")?,
            (None, None) => Config::infer().await.context("inferring kube config")?,
        };
        let client = Client::try_from(config).context("building kube client")?;
        info!(context = ?cfg.context, "kubehub: client ready");
        Ok(Self::from_client(client, cfg))
    }

    async fn catalog(&self, force: bool) -> Result<Arc<Catalog>> {
        if !force {
            if let Some(c) = self.catalog.load_full().filter(|c| c.fresh(self.cfg.discovery_ttl)) {
                return Ok(c);
            }
        }
        let _single = self.refresh.lock().await;
        if !force {
            if let Some(c) = self.catalog.load_full().filter(|c| c.fresh(self.cfg.discovery_ttl)) {
                return Ok(c);
            }
        }
        let t0 = Instant::now();
        let discovery = Discovery::new(self.client.clone()).run().await.map_err(Error::discovery)?;
        let cat = Arc::new(Catalog::from_discovery(&discovery));
        histogram!("kubehub_discovery_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(resources = cat.metas.len(), took_ms = %t0.elapsed().as_millis(), "kubehub: discovery ok");
        self.catalog.store(Some(cat.clone()));
        Ok(cat)
    }

    async fn resolve(&self, res: &ResourceId) -> anyhow::Result<(ApiResource, bool)> {
        if let Some(hit) = self.catalog(false).await?.index.get(res) {
            return Ok(hit.clone());
        }
        debug!(resource = %res, "kubehub: catalog miss, refreshing");
        let cat = self.catalog(true).await?;
        cat.index.get(res).cloned().ok_or_else(|| anyhow!("resource {res} is not served"))
    }

    async fn api(&self, res: &ResourceId, namespace: &str) -> anyhow::Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.resolve(res).await?;
        Ok(if namespaced && !namespace.is_empty() {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        })
    }
}

fn list_params(opts: &ListOptions) -> ListParams {
    let mut lp = ListParams::default();
    if let Some(l) = &opts.label_selector {
        lp = lp.labels(l);
    }
    if let Some(f) = &opts.field_selector {
        lp = lp.fields(f);
    }
    if let Some(t) = opts.timeout_secs {
        lp = lp.timeout(t);
    }
    lp
}

fn watch_params(opts: &ListOptions) -> WatchParams {
    let mut wp = WatchParams::default();
    if let Some(l) = &opts.label_selector {
        wp = wp.labels(l);
    }
    if let Some(f) = &opts.field_selector {
        wp = wp.fields(f);
    }
    if let Some(t) = opts.timeout_secs {
        wp = wp.timeout(t);
    }
    wp
}

/// Resource version a watch starts from. Empty leaves it unset, so the server starts at its most recent state.
fn watch_version(opts: &ListOptions) -> &str { opts.resource_version.as_deref().unwrap_or("") }

fn object_from(obj: &DynamicObject) -> anyhow::Result<Object> {
    let raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    Ok(Object::from_server(raw))
}

fn change_event(res: &ResourceId, ev: WatchEvent<DynamicObject>) -> anyhow::Result<ChangeEvent> {
    let (kind, object) = match ev {
        WatchEvent::Added(o) => (EventKind::Added, object_from(&o)?),
        WatchEvent::Modified(o) => (EventKind::Modified, object_from(&o)?),
        WatchEvent::Deleted(o) => (EventKind::Deleted, object_from(&o)?),
        WatchEvent::Bookmark(b) => (
            EventKind::Bookmark,
            Object::new(json!({
                "apiVersion": res.api_version(),
                "metadata": { "resourceVersion": b.metadata.resource_version },
            })),
        ),
        WatchEvent::Error(e) => (
            EventKind::Error,
            Object::new(json!({
                "kind": "Status",
                "status": e.status,
                "message": e.message,
                "reason": e.reason,
                "code": e.code,
            })),
        ),
    };
    Ok(ChangeEvent::new(kind, res.clone(), object))
}

async fn pump<S>(res: ResourceId, stream: S, feed: WatchFeed)
where
    S: futures::Stream<Item = std::result::Result<WatchEvent<DynamicObject>, kube::Error>> + Send,
{
    futures::pin_mut!(stream);
    let mut sent = 0u64;
    loop {
        let next = tokio::select! {
            _ = feed.stopped() => break,
            n = stream.next() => n,
        };
        match next {
            Some(Ok(ev)) => match change_event(&res, ev) {
                Ok(ev) => {
                    if !feed.send(ev).await {
                        break;
                    }
                    sent += 1;
                }
                Err(e) => warn!(resource = %res, error = %e, "kubehub: dropping undecodable event"),
            },
            Some(Err(e)) => {
                counter!("kubehub_watch_errors_total", 1u64);
                warn!(resource = %res, error = %e, "kubehub: watch stream error");
                break;
            }
            None => break,
        }
    }
    debug!(resource = %res, sent, stopped = feed.is_stopped(), "kubehub: watch ended");
}

#[async_trait]
impl Transport for KubeTransport {
    async fn resources(&self) -> Result<Vec<ResourceMeta>> { Ok(self.catalog(false).await?.metas.clone()) }

    async fn list(&self, res: &ResourceId, opts: &ListOptions) -> Result<Vec<Object>> {
        let t0 = Instant::now();
        let api = self.api(res, &opts.namespace).await.map_err(|e| Error::list(res, e))?;
        let list = api.list(&list_params(opts)).await.map_err(|e| Error::list(res, e))?;
        let out = list.items.iter().map(object_from).collect::<anyhow::Result<Vec<_>>>().map_err(|e| Error::list(res, e))?;
        debug!(resource = %res, ns = %opts.namespace, count = out.len(), took_ms = %t0.elapsed().as_millis(), "kubehub: list ok");
        Ok(out)
    }

    async fn watch(&self, res: &ResourceId, opts: &ListOptions) -> Result<UpstreamWatch> {
        let api = self.api(res, &opts.namespace).await.map_err(|e| Error::watch(res, e))?;
        let version = watch_version(opts);
        let stream = api.watch(&watch_params(opts), version).await.map_err(|e| Error::watch(res, e))?;
        let (feed, watch) = UpstreamWatch::channel(res.clone(), self.cfg.channel_capacity);
        info!(resource = %res, ns = %opts.namespace, version, "kubehub: watch started");
        tokio::spawn(pump(res.clone(), stream, feed));
        Ok(watch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::discovery::verbs;

    fn pods() -> ResourceId { ResourceId::new("", "v1", "pods") }

    fn dynamic(name: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": "default",
                "resourceVersion": "42",
                "managedFields": [{"manager": "kubectl"}],
            },
            "spec": {"nodeName": "n1"},
        }))
        .unwrap()
    }

    #[test]
    fn object_events_keep_payload_and_drop_managed_fields() {
        let ev = change_event(&pods(), WatchEvent::Modified(dynamic("web"))).unwrap();
        assert_eq!(ev.kind, EventKind::Modified);
        assert_eq!(ev.resource, pods());
        assert_eq!(ev.object.name(), Some("web"));
        assert_eq!(ev.object.namespace(), "default");
        assert_eq!(ev.object.resource_version(), Some("42"));
        assert_eq!(ev.object.raw()["spec"]["nodeName"], "n1");
        assert!(ev.object.raw()["metadata"].get("managedFields").is_none());

        let ev = change_event(&pods(), WatchEvent::Deleted(dynamic("web"))).unwrap();
        assert_eq!(ev.kind, EventKind::Deleted);
    }

    #[test]
    fn bookmark_and_error_events_become_status_documents() {
        let b: WatchEvent<DynamicObject> = serde_json::from_value(json!({
            "type": "BOOKMARK",
            "object": {"apiVersion": "v1", "kind": "Pod", "metadata": {"resourceVersion": "99"}},
        }))
        .unwrap();
        let ev = change_event(&pods(), b).unwrap();
        assert_eq!(ev.kind, EventKind::Bookmark);
        assert_eq!(ev.object.resource_version(), Some("99"));
        assert!(ev.object.key().is_none());

        let e: WatchEvent<DynamicObject> = serde_json::from_value(json!({
            "type": "ERROR",
            "object": {"status": "Failure", "message": "too old", "reason": "Expired", "code": 410},
        }))
        .unwrap();
        let ev = change_event(&pods(), e).unwrap();
        assert_eq!(ev.kind, EventKind::Error);
        assert_eq!(ev.object.raw()["code"], 410);
        assert_eq!(ev.object.raw()["reason"], "Expired");
    }

    #[test]
    fn options_pass_through_to_params() {
        let opts = ListOptions {
            namespace: "ns1".into(),
            label_selector: Some("app=web".into()),
            field_selector: Some("status.phase=Running".into()),
            resource_version: Some("5".into()),
            timeout_secs: Some(30),
        };
        let lp = list_params(&opts);
        assert_eq!(lp.label_selector.as_deref(), Some("app=web"));
        assert_eq!(lp.field_selector.as_deref(), Some("status.phase=Running"));
        assert_eq!(lp.timeout, Some(30));
        let wp = watch_params(&opts);
        assert_eq!(wp.label_selector.as_deref(), Some("app=web"));
        assert_eq!(wp.timeout, Some(30));
        assert_eq!(watch_version(&opts), "5");

        let lp = list_params(&ListOptions::default());
        assert!(lp.label_selector.is_none() && lp.field_selector.is_none());
        assert_eq!(watch_version(&ListOptions::default()), "");
    }

    #[test]
    fn discovery_entries_map_to_catalog_metadata() {
        let ar = ApiResource {
            group: "apps".into(),
            version: "v1".into(),
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            plural: "deployments".into(),
        };
        let caps = ApiCapabilities {
            scope: Scope::Namespaced,
            subresources: Vec::new(),
            operations: vec![verbs::LIST.to_string(), verbs::WATCH.to_string()],
        };
        let meta = resource_meta(&ar, &caps);
        assert_eq!(meta.id.key(), "apps/v1/deployments");
        assert_eq!(meta.kind, "Deployment");
        assert!(meta.namespaced);
        assert!(meta.is_watchable());
    }

    #[test]
    fn config_defaults() {
        let c = TransportConfig::default();
        assert_eq!(c.discovery_ttl, Duration::from_secs(180));
        assert_eq!(c.channel_capacity, 128);
        assert!(c.kubeconfig.is_none());
    }
}
