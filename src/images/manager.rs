//! The image work manager: consumes [`ImageWorkRequest`]s, runs one job per
//! request, watches the jobs to completion, and hands one aggregated
//! [`WorkQueueKey::status_update`] per reconciliation pass back to the
//! reconciliation engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::JOB_LABEL_SELECTOR;
use crate::config::Config;
use crate::images::{
    jobs, ImageWorkRequest, ImageWorkResult, ImageWorkResultStatus, WorkQueueKey, WorkType,
    REASON_IMAGE_PULL_DEADLINE_EXCEEDED, REASON_IMAGE_PULL_STATUS_UNKNOWN,
    REASON_JOB_CREATION_FAILED,
};
use crate::workqueue::RateLimitingQueue;

/// How often in-flight jobs are checked against the pull deadline.
const DEADLINE_CHECK_PERIOD: Duration = Duration::from_secs(10);

pub struct ImageManager {
    client: Client,
    config: Arc<Config>,
    workqueue: RateLimitingQueue<WorkQueueKey>,
    imageworkqueue: RateLimitingQueue<ImageWorkRequest>,
}

impl ImageManager {
    pub fn new(
        client: Client,
        config: Arc<Config>,
        workqueue: RateLimitingQueue<WorkQueueKey>,
        imageworkqueue: RateLimitingQueue<ImageWorkRequest>,
    ) -> Self {
        Self {
            client,
            config,
            workqueue,
            imageworkqueue,
        }
    }

    /// Single consumer loop over the image work queue, the job watch stream
    /// and the deadline tick. All pass state lives here, touched by no other
    /// task.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let jobs_api: Api<Job> = Api::all(self.client.clone());
        let watch_config = watcher::Config::default().labels(JOB_LABEL_SELECTOR);
        let mut job_stream = watcher(jobs_api, watch_config)
            .default_backoff()
            .boxed();
        let mut tracker = PassTracker::default();
        let mut deadline_tick = tokio::time::interval(DEADLINE_CHECK_PERIOD);
        deadline_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("image manager started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                request = self.imageworkqueue.next() => {
                    let Some(request) = request else { break };
                    self.handle_request(&mut tracker, request.clone()).await;
                    self.imageworkqueue.forget(&request);
                    self.imageworkqueue.done(&request);
                    self.flush_completed(&mut tracker).await;
                }
                event = job_stream.try_next() => {
                    match event {
                        Ok(Some(watcher::Event::Apply(job) | watcher::Event::InitApply(job))) => {
                            self.observe_job(&mut tracker, &job).await;
                            self.flush_completed(&mut tracker).await;
                        }
                        Ok(Some(watcher::Event::Delete(job))) => {
                            tracker.job_deleted(&job.name_any());
                            self.flush_completed(&mut tracker).await;
                        }
                        Ok(Some(_)) => {}
                        Ok(None) => break,
                        Err(e) => warn!(error = %e, "job watch stream error"),
                    }
                }
                _ = deadline_tick.tick() => {
                    tracker.expire(self.config.image_pull_deadline_duration);
                    self.flush_completed(&mut tracker).await;
                }
            }
        }
        info!("image manager stopped");
    }

    async fn handle_request(&self, tracker: &mut PassTracker, request: ImageWorkRequest) {
        let cache_key = request.image_cache.obj_key();
        if request.is_sentinel() {
            debug!(cache = %cache_key, "all work requests for the pass are in");
            tracker.sentinel(cache_key);
            return;
        }

        let node = request.node.as_ref().map(|n| n.name_any()).unwrap_or_default();
        let hostname = request
            .node
            .as_ref()
            .and_then(|n| n.labels().get(crate::api::HOSTNAME_LABEL).cloned())
            .unwrap_or_else(|| node.clone());

        let job = match request.work_type {
            WorkType::Purge => jobs::purge_job(
                &request.image_cache,
                &request.image,
                &hostname,
                &request.container_runtime_version,
                &self.config,
            ),
            _ if request.force_full_cache => {
                jobs::full_cache_job(&request.image_cache, &request.image, &hostname, &self.config)
            }
            _ => jobs::pull_job(&request.image_cache, &request.image, &hostname, &self.config),
        };

        let namespace = job
            .namespace()
            .unwrap_or_else(|| self.config.namespace.clone());
        let api: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), &job).await {
            Ok(created) => {
                let name = created.name_any();
                debug!(job = %name, image = %request.image, node = %node, "job created");
                tracker.track(cache_key, name, namespace, request);
            }
            Err(e) => {
                warn!(image = %request.image, node = %node, error = %e, "failed to create job");
                tracker.track_failed(cache_key, request, e.to_string());
            }
        }
    }

    async fn observe_job(&self, tracker: &mut PassTracker, job: &Job) {
        let name = job.name_any();
        if !tracker.is_tracked(&name) {
            return;
        }
        let Some(status) = &job.status else { return };
        if status.active.unwrap_or(0) > 0 {
            tracker.mark_active(&name);
        }
        if status.succeeded.unwrap_or(0) > 0 {
            tracker.resolve(&name, ImageWorkResultStatus::Succeeded, "", "");
        } else if status.failed.unwrap_or(0) > 0 {
            let (result, reason, message) = self.classify_failure(job).await;
            tracker.resolve(&name, result, &reason, &message);
        }
    }

    /// Dig the failure out of the job's pod: last termination or waiting
    /// state of any container. A runtime message saying the image is already
    /// on the node is not a failure at all.
    async fn classify_failure(&self, job: &Job) -> (ImageWorkResultStatus, String, String) {
        let namespace = job
            .namespace()
            .unwrap_or_else(|| self.config.namespace.clone());
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let selector = format!("job-name={}", job.name_any());
        let mut reason = String::from("Failed");
        let mut message = String::new();

        match pods.list(&ListParams::default().labels(&selector)).await {
            Ok(list) => {
                for pod in &list.items {
                    let Some(status) = &pod.status else { continue };
                    let statuses = status
                        .container_statuses
                        .iter()
                        .flatten()
                        .chain(status.init_container_statuses.iter().flatten());
                    for cs in statuses {
                        if let Some(waiting) = cs.state.as_ref().and_then(|s| s.waiting.as_ref()) {
                            if let Some(r) = &waiting.reason {
                                reason = r.clone();
                                message = waiting.message.clone().unwrap_or_default();
                            }
                        }
                        if let Some(terminated) =
                            cs.state.as_ref().and_then(|s| s.terminated.as_ref())
                        {
                            if terminated.exit_code != 0 {
                                reason = terminated
                                    .reason
                                    .clone()
                                    .unwrap_or_else(|| "Error".to_string());
                                message = terminated.message.clone().unwrap_or_default();
                            }
                        }
                        if let Some(terminated) =
                            cs.last_state.as_ref().and_then(|s| s.terminated.as_ref())
                        {
                            if terminated.exit_code != 0 && message.is_empty() {
                                reason = terminated
                                    .reason
                                    .clone()
                                    .unwrap_or_else(|| "Error".to_string());
                                message = terminated.message.clone().unwrap_or_default();
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(job = %job.name_any(), error = %e, "failed to list pods of failed job");
            }
        }

        if message.is_empty() {
            // fall back to the job's own condition
            if let Some(condition) = job
                .status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .and_then(|c| c.iter().find(|c| c.type_ == "Failed" && c.status == "True"))
            {
                reason = condition.reason.clone().unwrap_or(reason);
                message = condition.message.clone().unwrap_or_default();
            }
        }

        if already_present(&message) {
            (ImageWorkResultStatus::AlreadyPulled, reason, message)
        } else {
            (ImageWorkResultStatus::Failed, reason, message)
        }
    }

    async fn flush_completed(&self, tracker: &mut PassTracker) {
        for pass in tracker.take_completed() {
            if self.config.can_delete_job {
                for (namespace, name) in &pass.jobs {
                    let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
                    if let Err(e) = api.delete(name, &DeleteParams::background()).await {
                        warn!(job = %name, error = %e, "failed to delete harvested job");
                    }
                }
            }
            info!(
                cache = %pass.cache_key,
                results = pass.results.len(),
                "reconciliation pass complete"
            );
            self.workqueue
                .add(WorkQueueKey::status_update(pass.cache_key, pass.results));
        }
    }
}

fn already_present(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("already present") || lower.contains("already exists")
}

struct TrackedJob {
    request: ImageWorkRequest,
    namespace: Option<String>,
    created: Instant,
    seen_active: bool,
    result: Option<ImageWorkResult>,
}

#[derive(Default)]
struct Pass {
    sentinel_seen: bool,
    jobs: HashMap<String, TrackedJob>,
}

impl Pass {
    fn is_complete(&self) -> bool {
        self.sentinel_seen && self.jobs.values().all(|j| j.result.is_some())
    }
}

pub(crate) struct CompletedPass {
    pub cache_key: String,
    pub results: HashMap<String, ImageWorkResult>,
    /// (namespace, name) of jobs actually created on the cluster.
    pub jobs: Vec<(String, String)>,
}

/// Bookkeeping for in-flight reconciliation passes, one per ImageCache.
/// A pass completes when its sentinel has arrived and every tracked job has
/// a terminal result; completion yields exactly one result per request.
#[derive(Default)]
pub(crate) struct PassTracker {
    passes: HashMap<String, Pass>,
    job_index: HashMap<String, String>,
}

impl PassTracker {
    fn pass(&mut self, cache_key: &str) -> &mut Pass {
        self.passes.entry(cache_key.to_string()).or_default()
    }

    pub fn track(
        &mut self,
        cache_key: String,
        job_name: String,
        namespace: String,
        request: ImageWorkRequest,
    ) {
        self.job_index.insert(job_name.clone(), cache_key.clone());
        self.pass(&cache_key).jobs.insert(job_name, TrackedJob {
            request,
            namespace: Some(namespace),
            created: Instant::now(),
            seen_active: false,
            result: None,
        });
    }

    /// Record a request whose job could never be created; keyed by a
    /// synthetic id so the pass still completes with one result per request.
    pub fn track_failed(&mut self, cache_key: String, request: ImageWorkRequest, message: String) {
        let id = format!("{}@{}", request.image, request.node_name());
        let result = ImageWorkResult {
            status: ImageWorkResultStatus::Failed,
            reason: REASON_JOB_CREATION_FAILED.to_string(),
            message,
            request: request.clone(),
        };
        self.pass(&cache_key).jobs.insert(id, TrackedJob {
            request,
            namespace: None,
            created: Instant::now(),
            seen_active: false,
            result: Some(result),
        });
    }

    pub fn sentinel(&mut self, cache_key: String) {
        self.pass(&cache_key).sentinel_seen = true;
    }

    pub fn is_tracked(&self, job_name: &str) -> bool {
        self.job_index.contains_key(job_name)
    }

    pub fn mark_active(&mut self, job_name: &str) {
        if let Some(job) = self.tracked_mut(job_name) {
            job.seen_active = true;
        }
    }

    pub fn resolve(
        &mut self,
        job_name: &str,
        status: ImageWorkResultStatus,
        reason: &str,
        message: &str,
    ) {
        if let Some(job) = self.tracked_mut(job_name) {
            if job.result.is_none() {
                job.result = Some(ImageWorkResult {
                    status,
                    reason: reason.to_string(),
                    message: message.to_string(),
                    request: job.request.clone(),
                });
            }
        }
    }

    /// A tracked job vanished before reaching a terminal state.
    pub fn job_deleted(&mut self, job_name: &str) {
        self.resolve(
            job_name,
            ImageWorkResultStatus::Unknown,
            REASON_IMAGE_PULL_STATUS_UNKNOWN,
            "job was deleted before completion",
        );
    }

    /// Force a terminal result on every job older than `deadline`.
    pub fn expire(&mut self, deadline: Duration) {
        let now = Instant::now();
        for pass in self.passes.values_mut() {
            for job in pass.jobs.values_mut() {
                if job.result.is_some() || now.duration_since(job.created) < deadline {
                    continue;
                }
                job.result = Some(if job.seen_active {
                    ImageWorkResult {
                        status: ImageWorkResultStatus::Failed,
                        reason: REASON_IMAGE_PULL_DEADLINE_EXCEEDED.to_string(),
                        message: format!(
                            "job did not complete within {}s",
                            deadline.as_secs()
                        ),
                        request: job.request.clone(),
                    }
                } else {
                    ImageWorkResult {
                        status: ImageWorkResultStatus::Unknown,
                        reason: REASON_IMAGE_PULL_STATUS_UNKNOWN.to_string(),
                        message: format!(
                            "job phase unknown after {}s",
                            deadline.as_secs()
                        ),
                        request: job.request.clone(),
                    }
                });
            }
        }
    }

    /// Drain every pass whose sentinel has arrived and whose jobs are all
    /// terminal.
    pub fn take_completed(&mut self) -> Vec<CompletedPass> {
        let done: Vec<String> = self
            .passes
            .iter()
            .filter(|(_, pass)| pass.is_complete())
            .map(|(key, _)| key.clone())
            .collect();

        done.into_iter()
            .map(|cache_key| {
                let pass = self.passes.remove(&cache_key).unwrap_or_default();
                let mut results = HashMap::new();
                let mut created_jobs = Vec::new();
                for (id, job) in pass.jobs {
                    self.job_index.remove(&id);
                    if let Some(namespace) = job.namespace {
                        created_jobs.push((namespace, id.clone()));
                    }
                    if let Some(result) = job.result {
                        results.insert(id, result);
                    }
                }
                CompletedPass {
                    cache_key,
                    results,
                    jobs: created_jobs,
                }
            })
            .collect()
    }

    fn tracked_mut(&mut self, job_name: &str) -> Option<&mut TrackedJob> {
        let cache_key = self.job_index.get(job_name)?;
        self.passes.get_mut(cache_key)?.jobs.get_mut(job_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CacheSpecImages, Image, ImageCache, ImageCacheSpec};
    use k8s_openapi::api::core::v1::Node;
    use tokio::time::{advance, pause};

    fn request(image: &str, node: &str, work_type: WorkType) -> ImageWorkRequest {
        let mut ic = ImageCache::new("foo", ImageCacheSpec {
            cache_spec: vec![CacheSpecImages {
                images: vec![Image {
                    name: image.into(),
                    force_full_cache: false,
                }],
                node_selector: None,
            }],
            image_pull_secrets: None,
        });
        ic.metadata.namespace = Some("kf".into());
        let mut n = Node::default();
        n.metadata.name = Some(node.into());
        ImageWorkRequest {
            image: image.into(),
            force_full_cache: false,
            node: Some(n),
            container_runtime_version: "containerd://1.7.2".into(),
            work_type,
            image_cache: ic,
        }
    }

    #[tokio::test]
    async fn pass_completes_with_one_result_per_request() {
        let mut tracker = PassTracker::default();
        tracker.track(
            "kf/foo".into(),
            "foo-a".into(),
            "kf".into(),
            request("bar:1", "n1", WorkType::Create),
        );
        tracker.track(
            "kf/foo".into(),
            "foo-b".into(),
            "kf".into(),
            request("bar:1", "n2", WorkType::Create),
        );
        tracker.sentinel("kf/foo".into());

        tracker.resolve("foo-a", ImageWorkResultStatus::Succeeded, "", "");
        assert!(tracker.take_completed().is_empty());

        tracker.resolve("foo-b", ImageWorkResultStatus::Failed, "ImagePullBackOff", "nope");
        let completed = tracker.take_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].results.len(), 2);
        assert_eq!(completed[0].jobs.len(), 2);
        assert!(!tracker.is_tracked("foo-a"));
    }

    #[tokio::test]
    async fn empty_pass_completes_on_sentinel_alone() {
        let mut tracker = PassTracker::default();
        tracker.sentinel("kf/foo".into());
        let completed = tracker.take_completed();
        assert_eq!(completed.len(), 1);
        assert!(completed[0].results.is_empty());
    }

    #[tokio::test]
    async fn results_before_sentinel_do_not_complete_the_pass() {
        let mut tracker = PassTracker::default();
        tracker.track(
            "kf/foo".into(),
            "foo-a".into(),
            "kf".into(),
            request("bar:1", "n1", WorkType::Create),
        );
        tracker.resolve("foo-a", ImageWorkResultStatus::Succeeded, "", "");
        assert!(tracker.take_completed().is_empty());
        tracker.sentinel("kf/foo".into());
        assert_eq!(tracker.take_completed().len(), 1);
    }

    #[tokio::test]
    async fn creation_failure_is_a_terminal_result() {
        let mut tracker = PassTracker::default();
        tracker.track_failed(
            "kf/foo".into(),
            request("bar:1", "n1", WorkType::Create),
            "forbidden".into(),
        );
        tracker.sentinel("kf/foo".into());
        let completed = tracker.take_completed();
        let result = completed[0].results.get("bar:1@n1").unwrap();
        assert_eq!(result.status, ImageWorkResultStatus::Failed);
        assert_eq!(result.reason, REASON_JOB_CREATION_FAILED);
        // nothing to delete for a job that was never created
        assert!(completed[0].jobs.is_empty());
    }

    #[tokio::test]
    async fn expiry_distinguishes_active_from_unknown_jobs() {
        pause();
        let mut tracker = PassTracker::default();
        tracker.track(
            "kf/foo".into(),
            "foo-a".into(),
            "kf".into(),
            request("bar:1", "n1", WorkType::Create),
        );
        tracker.track(
            "kf/foo".into(),
            "foo-b".into(),
            "kf".into(),
            request("baz:1", "n1", WorkType::Create),
        );
        tracker.sentinel("kf/foo".into());
        tracker.mark_active("foo-a");

        advance(Duration::from_secs(301)).await;
        tracker.expire(Duration::from_secs(300));

        let completed = tracker.take_completed();
        let results = &completed[0].results;
        assert_eq!(
            results["foo-a"].reason,
            REASON_IMAGE_PULL_DEADLINE_EXCEEDED
        );
        assert_eq!(results["foo-a"].status, ImageWorkResultStatus::Failed);
        assert_eq!(results["foo-b"].status, ImageWorkResultStatus::Unknown);
    }

    #[tokio::test]
    async fn deleted_job_resolves_unknown() {
        let mut tracker = PassTracker::default();
        tracker.track(
            "kf/foo".into(),
            "foo-a".into(),
            "kf".into(),
            request("bar:1", "n1", WorkType::Create),
        );
        tracker.sentinel("kf/foo".into());
        tracker.job_deleted("foo-a");
        let completed = tracker.take_completed();
        assert_eq!(
            completed[0].results["foo-a"].status,
            ImageWorkResultStatus::Unknown
        );
    }

    #[test]
    fn already_present_detection() {
        assert!(already_present("Image is already present on machine"));
        assert!(already_present("layer already exists"));
        assert!(!already_present("no space left on device"));
    }
}
