//! The reconciliation engine: watches ImageCache and Node resources, decides
//! what work to do, fans per-(image, node) requests out to the image work
//! manager and writes aggregated results back to the ImageCache status.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashSet;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::runtime::events::{Recorder, Reporter};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{
    ImageCache, ImageCacheActionStatus, ImageCacheReason, CONTROLLER_AGENT_NAME,
    IMAGE_CACHE_PURGE_ANNOTATION, IMAGE_CACHE_REFRESH_ANNOTATION,
};
use crate::config::Config;
use crate::error::Error;
use crate::images::manager::ImageManager;
use crate::images::{ImageWorkRequest, WorkQueueKey, WorkType};
use crate::store::{Store, Writer};
use crate::workqueue::RateLimitingQueue;

mod preflight;
mod sync;
mod validation;

/// Give the watches this long to deliver their first complete list before
/// declaring startup failed.
const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(120);

pub struct Controller {
    client: Client,
    config: Arc<Config>,
    workqueue: RateLimitingQueue<WorkQueueKey>,
    imageworkqueue: RateLimitingQueue<ImageWorkRequest>,
    image_caches: Store<ImageCache>,
    nodes: Store<Node>,
    /// Names of nodes currently known to be ready; written only by the node
    /// watch loop.
    nodes_ready: Mutex<AHashSet<String>>,
    recorder: Recorder,
    image_manager: Arc<ImageManager>,
    cache_writer: Mutex<Option<Writer<ImageCache>>>,
    node_writer: Mutex<Option<Writer<Node>>>,
}

impl Controller {
    pub fn new(client: Client, config: Config) -> Arc<Self> {
        let config = Arc::new(config);
        let workqueue = RateLimitingQueue::new();
        let imageworkqueue = RateLimitingQueue::new();
        let cache_writer = Writer::new();
        let node_writer = Writer::new();
        let image_caches = cache_writer.as_reader();
        let nodes = node_writer.as_reader();
        let recorder = Recorder::new(client.clone(), Reporter {
            controller: CONTROLLER_AGENT_NAME.into(),
            instance: std::env::var("KUBEFLEDGED_POD_NAME").ok(),
        });
        let image_manager = Arc::new(ImageManager::new(
            client.clone(),
            config.clone(),
            workqueue.clone(),
            imageworkqueue.clone(),
        ));

        Arc::new(Self {
            client,
            config,
            workqueue,
            imageworkqueue,
            image_caches,
            nodes,
            nodes_ready: Mutex::new(AHashSet::new()),
            recorder,
            image_manager,
            cache_writer: Mutex::new(Some(cache_writer)),
            node_writer: Mutex::new(Some(node_writer)),
        })
    }

    /// Start the watches, wait for the local caches to synchronize, then run
    /// the workers, the refresh timer and the image manager until `token` is
    /// cancelled. Workers observe shutdown only between items.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<(), Error> {
        let cache_writer = self
            .cache_writer
            .lock()
            .take()
            .ok_or(Error::AlreadyRunning)?;
        let node_writer = self.node_writer.lock().take().ok_or(Error::AlreadyRunning)?;

        info!("starting kubefledged controller");
        let mut tasks: JoinSet<()> = JoinSet::new();
        {
            let this = Arc::clone(&self);
            let token = token.clone();
            tasks.spawn(async move { this.run_image_cache_watch(cache_writer, token).await });
        }
        {
            let this = Arc::clone(&self);
            let token = token.clone();
            tasks.spawn(async move { this.run_node_watch(node_writer, token).await });
        }

        let synced = async {
            self.image_caches.wait_until_ready().await;
            self.nodes.wait_until_ready().await;
        };
        tokio::select! {
            _ = synced => {}
            _ = tokio::time::sleep(CACHE_SYNC_TIMEOUT) => {}
            _ = token.cancelled() => {}
        }
        if !token.is_cancelled() && !(self.image_caches.is_ready() && self.nodes.is_ready()) {
            error!("informer caches failed to synchronize");
            token.cancel();
            self.shut_down_queues();
            while tasks.join_next().await.is_some() {}
            return Err(Error::CacheSyncFailed);
        }
        info!("informer caches synchronized");

        for _ in 0..self.config.threadiness.max(1) {
            let this = Arc::clone(&self);
            tasks.spawn(async move { this.run_worker().await });
        }
        info!(workers = self.config.threadiness.max(1), "image cache workers started");

        if !self.config.image_cache_refresh_frequency.is_zero() {
            let this = Arc::clone(&self);
            let token = token.clone();
            tasks.spawn(async move { this.run_refresh_timer(token).await });
            info!("image cache refresh worker started");
        }

        {
            let manager = Arc::clone(&self.image_manager);
            let token = token.clone();
            tasks.spawn(async move { manager.run(token).await });
        }

        token.cancelled().await;
        info!("shutting down workers");
        self.shut_down_queues();
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    fn shut_down_queues(&self) {
        self.workqueue.shut_down();
        self.imageworkqueue.shut_down();
    }

    async fn run_worker(self: Arc<Self>) {
        while let Some(key) = self.workqueue.next().await {
            match self.sync_handler(&key).await {
                Ok(()) => self.workqueue.forget(&key),
                Err(e) => {
                    error!(
                        cache = %key.obj_key,
                        work_type = %key.work_type,
                        error = %e,
                        "error syncing image cache"
                    );
                    self.workqueue.add_rate_limited(key.clone());
                }
            }
            self.workqueue.done(&key);
        }
    }

    async fn run_image_cache_watch(
        self: Arc<Self>,
        mut writer: Writer<ImageCache>,
        token: CancellationToken,
    ) {
        let api: Api<ImageCache> = Api::all(self.client.clone());
        let mut stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = stream.try_next() => match event {
                    Ok(Some(watcher::Event::Init)) => writer.begin_init(),
                    Ok(Some(watcher::Event::InitApply(ic))) => {
                        let old = writer.apply_init(ic.clone());
                        self.handle_image_cache_apply(old.as_deref(), &ic);
                    }
                    Ok(Some(watcher::Event::InitDone)) => {
                        // deletes observed while the watch was down; consumed
                        // silently, like any other ImageCache delete
                        writer.end_init();
                    }
                    Ok(Some(watcher::Event::Apply(ic))) => {
                        let old = writer.apply(ic.clone());
                        self.handle_image_cache_apply(old.as_deref(), &ic);
                    }
                    Ok(Some(watcher::Event::Delete(ic))) => {
                        writer.remove(&ic);
                        debug!(cache = %ic.obj_key(), "image cache deleted");
                    }
                    Ok(None) => break,
                    Err(e) => warn!(error = %e, "image cache watch stream error"),
                }
            }
        }
    }

    fn handle_image_cache_apply(&self, old: Option<&ImageCache>, new: &ImageCache) {
        match old {
            None => self.enqueue_image_cache(WorkType::Create, None, Some(new)),
            Some(old) => self.enqueue_image_cache(WorkType::Update, Some(old), Some(new)),
        };
    }

    async fn run_node_watch(self: Arc<Self>, mut writer: Writer<Node>, token: CancellationToken) {
        let api: Api<Node> = Api::all(self.client.clone());
        let mut stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = stream.try_next() => match event {
                    Ok(Some(watcher::Event::Init)) => writer.begin_init(),
                    Ok(Some(watcher::Event::InitApply(node))) => {
                        writer.apply_init(node.clone());
                        self.handle_node_apply(&node, &token);
                    }
                    Ok(Some(watcher::Event::InitDone)) => {
                        for gone in writer.end_init() {
                            self.nodes_ready.lock().remove(&gone.name_any());
                        }
                    }
                    Ok(Some(watcher::Event::Apply(node))) => {
                        writer.apply(node.clone());
                        self.handle_node_apply(&node, &token);
                    }
                    Ok(Some(watcher::Event::Delete(node))) => {
                        writer.remove(&node);
                        self.nodes_ready.lock().remove(&node.name_any());
                    }
                    Ok(None) => break,
                    Err(e) => warn!(error = %e, "node watch stream error"),
                }
            }
        }
    }

    /// A node transitioning to Ready schedules a refresh fan-out for every
    /// known ImageCache after a short settle delay, so the api server can
    /// converge before the mass enqueue.
    pub(crate) fn handle_node_apply(self: &Arc<Self>, node: &Node, token: &CancellationToken) {
        if !is_node_ready(node) {
            return;
        }
        let name = node.name_any();
        if !self.nodes_ready.lock().insert(name.clone()) {
            return;
        }
        debug!(node = %name, "node is ready");
        let this = Arc::clone(self);
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(this.config.node_settle_delay) => {
                    debug!(node = %name, "enqueuing refresh for all image caches");
                    for ic in this.image_caches.list() {
                        this.enqueue_image_cache(WorkType::Refresh, Some(ic.as_ref()), None);
                    }
                }
            }
        });
    }

    async fn run_refresh_timer(self: Arc<Self>, token: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.image_cache_refresh_frequency);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick fires immediately; the caches were just listed, so
        // skip it
        tick.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => self.refresh_pass(),
            }
        }
    }

    /// One refresh tick: enqueue at most one Refresh per eligible cache.
    pub(crate) fn refresh_pass(&self) {
        for ic in self.image_caches.list() {
            if is_refresh_eligible(&ic) {
                self.enqueue_image_cache(WorkType::Refresh, Some(ic.as_ref()), None);
            }
        }
    }

    /// Admission of watch events onto the control queue. Returns whether a
    /// key was enqueued.
    pub(crate) fn enqueue_image_cache(
        &self,
        work_type: WorkType,
        old: Option<&ImageCache>,
        new: Option<&ImageCache>,
    ) -> bool {
        let key = match work_type {
            WorkType::Create => {
                let Some(ic) = new else { return false };
                // already carries a status: it was observed before, this is
                // not a creation
                if ic.has_status() {
                    return false;
                }
                WorkQueueKey::new(WorkType::Create, ic.obj_key())
            }
            WorkType::Update => {
                let (Some(old_ic), Some(new_ic)) = (old, new) else {
                    return false;
                };
                if old_ic.is_processing() {
                    if old_ic.spec != new_ic.spec
                        || old_ic.annotations() != new_ic.annotations()
                    {
                        warn!(
                            cache = %new_ic.obj_key(),
                            "received update for image cache while it is being processed, ignoring"
                        );
                    }
                    return false;
                }
                if newly_annotated(old_ic, new_ic, IMAGE_CACHE_PURGE_ANNOTATION) {
                    WorkQueueKey::new(WorkType::Purge, new_ic.obj_key())
                } else if newly_annotated(old_ic, new_ic, IMAGE_CACHE_REFRESH_ANNOTATION) {
                    WorkQueueKey::new(WorkType::Refresh, new_ic.obj_key())
                } else if old_ic.spec == new_ic.spec {
                    return false;
                } else {
                    WorkQueueKey::update(new_ic.obj_key(), old_ic.clone())
                }
            }
            WorkType::Refresh => {
                let Some(ic) = old else { return false };
                WorkQueueKey::new(WorkType::Refresh, ic.obj_key())
            }
            // deletes cascade to the jobs through ownership; nothing to do
            WorkType::Delete | WorkType::Purge | WorkType::StatusUpdate => return false,
        };
        debug!(cache = %key.obj_key, work_type = %key.work_type, "image cache queued");
        self.workqueue.add_rate_limited(key);
        true
    }

    /// Nodes matching the selector; an empty or absent selector matches all.
    pub(crate) fn select_nodes(
        &self,
        selector: Option<&BTreeMap<String, String>>,
    ) -> Vec<Arc<Node>> {
        let nodes = self.nodes.list();
        match selector {
            Some(sel) if !sel.is_empty() => nodes
                .into_iter()
                .filter(|n| {
                    let labels = n.labels();
                    sel.iter().all(|(k, v)| labels.get(k) == Some(v))
                })
                .collect(),
            _ => nodes,
        }
    }

    #[cfg(test)]
    pub(crate) fn seed_image_cache(&self, ic: ImageCache) {
        if let Some(writer) = self.cache_writer.lock().as_mut() {
            writer.apply(ic);
        }
    }

    #[cfg(test)]
    pub(crate) fn seed_node(&self, node: Node) {
        if let Some(writer) = self.node_writer.lock().as_mut() {
            writer.apply(node);
        }
    }

    #[cfg(test)]
    pub(crate) fn control_queue(&self) -> &RateLimitingQueue<WorkQueueKey> {
        &self.workqueue
    }

    #[cfg(test)]
    pub(crate) fn image_work_queue(&self) -> &RateLimitingQueue<ImageWorkRequest> {
        &self.imageworkqueue
    }
}

fn newly_annotated(old: &ImageCache, new: &ImageCache, key: &str) -> bool {
    new.annotations().contains_key(key) && !old.annotations().contains_key(key)
}

pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Refresh timer eligibility: skip brand-new caches awaiting their first
/// sync, in-flight ones, permanently invalid specs, and purged caches.
pub(crate) fn is_refresh_eligible(ic: &ImageCache) -> bool {
    let Some(status) = &ic.status else { return false };
    if status.status == ImageCacheActionStatus::Processing {
        return false;
    }
    if status.status == ImageCacheActionStatus::Failed
        && status.reason == ImageCacheReason::CacheSpecValidationFailed
    {
        return false;
    }
    if status.reason == ImageCacheReason::ImageCachePurge {
        return false;
    }
    true
}
