//! The sync handler: drives one [`WorkQueueKey`] to completion, either by
//! fanning a reconciliation pass out to the image work manager or by folding
//! a finished pass's results back into the ImageCache status.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::chrono::Utc;
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType};
use kube::{Api, Resource, ResourceExt};
use tracing::{debug, info, warn};

use super::validation::validate_cache_spec;
use super::Controller;
use crate::api::{
    messages, split_obj_key, CacheSpecImages, Image, ImageCache, ImageCacheActionStatus,
    ImageCacheReason, ImageCacheStatus, HOSTNAME_LABEL, IMAGE_CACHE_PURGE_ANNOTATION,
    IMAGE_CACHE_REFRESH_ANNOTATION,
};
use crate::error::Error;
use crate::images::{ImageWorkRequest, ImageWorkResult, ImageWorkResultStatus, WorkQueueKey, WorkType};

impl Controller {
    pub(crate) async fn sync_handler(&self, key: &WorkQueueKey) -> Result<(), Error> {
        match key.work_type {
            WorkType::Create | WorkType::Update | WorkType::Refresh | WorkType::Purge => {
                self.sync_image_cache(key).await
            }
            WorkType::StatusUpdate => self.sync_status_update(key).await,
            WorkType::Delete => Ok(()),
        }
    }

    /// Start one reconciliation pass: mark the cache Processing, resolve the
    /// node set per cache spec entry and push one work request per
    /// (image, node), terminated by the pass sentinel.
    async fn sync_image_cache(&self, key: &WorkQueueKey) -> Result<(), Error> {
        let (namespace, name) = split_obj_key(&key.obj_key);
        let namespace = namespace.unwrap_or(&self.config.namespace);
        info!(cache = %name, work_type = %key.work_type, "starting image cache sync");

        let cached = self
            .image_caches
            .get(&key.obj_key)
            .ok_or_else(|| Error::ImageCacheGone(key.obj_key.clone()))?;
        let api: Api<ImageCache> = Api::namespaced(self.client.clone(), namespace);

        if key.work_type == WorkType::Update && key.old_image_cache.is_none() {
            let status = ImageCacheStatus {
                status: ImageCacheActionStatus::Failed,
                reason: ImageCacheReason::OldImageCacheNotFound,
                message: messages::OLD_IMAGE_CACHE_NOT_FOUND.into(),
                start_time: Some(Time(Utc::now())),
                ..ImageCacheStatus::default()
            };
            self.update_image_cache_status(&api, name, status).await?;
            return Err(Error::OldImageCacheNotFound(name.to_string()));
        }

        if let Err(detail) = validate_cache_spec(&cached) {
            warn!(cache = %name, %detail, "cache spec validation failed");
            let status = ImageCacheStatus {
                status: ImageCacheActionStatus::Failed,
                reason: ImageCacheReason::CacheSpecValidationFailed,
                message: detail.clone(),
                start_time: Some(Time(Utc::now())),
                ..ImageCacheStatus::default()
            };
            let updated = self.update_image_cache_status(&api, name, status).await?;
            self.publish_event(
                &updated,
                EventType::Warning,
                ImageCacheReason::CacheSpecValidationFailed,
                &detail,
            )
            .await;
            return Ok(());
        }

        let (reason, message) = match key.work_type {
            WorkType::Update => (ImageCacheReason::ImageCacheUpdate, messages::UPDATING_CACHE),
            WorkType::Refresh => (
                ImageCacheReason::ImageCacheRefresh,
                messages::REFRESHING_CACHE,
            ),
            WorkType::Purge => (ImageCacheReason::ImageCachePurge, messages::PURGING_CACHE),
            _ => (ImageCacheReason::ImageCacheCreate, messages::PULLING_IMAGES),
        };
        let status = ImageCacheStatus {
            status: ImageCacheActionStatus::Processing,
            reason,
            message: message.into(),
            start_time: Some(Time(Utc::now())),
            ..ImageCacheStatus::default()
        };
        let fresh = self.update_image_cache_status(&api, name, status).await?;

        // The data-plane enqueues below are plain adds: the sentinel must
        // observably come after every request of the pass.
        for (index, entry) in cached.spec.cache_spec.iter().enumerate() {
            let nodes = self.select_nodes(entry.node_selector.as_ref());
            debug!(
                cache = %name,
                entry = index,
                nodes = nodes.len(),
                "resolved node set for cache spec entry"
            );
            let old_entry = key
                .old_image_cache
                .as_ref()
                .and_then(|old| old.spec.cache_spec.get(index));
            for node in &nodes {
                for image in &entry.images {
                    self.imageworkqueue.add(ImageWorkRequest {
                        image: image.name.clone(),
                        force_full_cache: image.force_full_cache,
                        node: Some((**node).clone()),
                        container_runtime_version: runtime_version(node),
                        work_type: key.work_type,
                        image_cache: fresh.clone(),
                    });
                }
                if key.work_type == WorkType::Update {
                    for image in images_to_purge(old_entry, entry) {
                        self.imageworkqueue.add(ImageWorkRequest {
                            image: image.name.clone(),
                            force_full_cache: image.force_full_cache,
                            node: Some((**node).clone()),
                            container_runtime_version: runtime_version(node),
                            work_type: WorkType::Purge,
                            image_cache: fresh.clone(),
                        });
                    }
                }
            }
        }
        self.imageworkqueue
            .add(ImageWorkRequest::sentinel(key.work_type, fresh));
        Ok(())
    }

    /// Fold a finished pass back onto the resource: aggregate the per-job
    /// results, write the terminal status, consume the purge/refresh
    /// annotation that triggered the pass, and emit a cluster event.
    async fn sync_status_update(&self, key: &WorkQueueKey) -> Result<(), Error> {
        let (namespace, name) = split_obj_key(&key.obj_key);
        let namespace = namespace.unwrap_or(&self.config.namespace);
        let api: Api<ImageCache> = Api::namespaced(self.client.clone(), namespace);

        let current = api.get(name).await?;
        let previous = current.status.clone().unwrap_or_default();
        let empty = HashMap::new();
        let results = key.status.as_ref().unwrap_or(&empty);

        let status = aggregate_results(&previous, results);
        let terminal_status = status.status;
        let terminal_reason = status.reason;
        let note = status.message.clone();
        self.update_image_cache_status(&api, name, status).await?;

        if matches!(
            previous.reason,
            ImageCacheReason::ImageCachePurge | ImageCacheReason::ImageCacheRefresh
        ) {
            let fresh = api.get(name).await?;
            let annotation = match previous.reason {
                ImageCacheReason::ImageCachePurge => IMAGE_CACHE_PURGE_ANNOTATION,
                _ => IMAGE_CACHE_REFRESH_ANNOTATION,
            };
            if fresh.annotations().contains_key(annotation) {
                self.remove_annotation(&api, name, annotation).await?;
            }
        }

        let event_type = if terminal_status == ImageCacheActionStatus::Failed {
            EventType::Warning
        } else {
            EventType::Normal
        };
        self.publish_event(&current, event_type, terminal_reason, &note)
            .await;

        info!(cache = %name, status = ?terminal_status, "completed sync actions for image cache");
        Ok(())
    }

    /// Read-modify-write of the status subresource: always refetch first,
    /// never write an object taken from the local store. Conflicts surface
    /// to the caller and ride the queue retry.
    pub(crate) async fn update_image_cache_status(
        &self,
        api: &Api<ImageCache>,
        name: &str,
        mut status: ImageCacheStatus,
    ) -> Result<ImageCache, Error> {
        let mut latest = api.get(name).await?;
        if status.status != ImageCacheActionStatus::Processing {
            status.completion_time = Some(Time(Utc::now()));
        }
        latest.status = Some(status);
        let data = serde_json::to_vec(&latest)?;
        let updated = api
            .replace_status(name, &PostParams::default(), data)
            .await?;
        Ok(updated)
    }

    async fn remove_annotation(
        &self,
        api: &Api<ImageCache>,
        name: &str,
        annotation: &str,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": { "annotations": { annotation: null } }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(cache = %name, %annotation, "annotation removed from image cache");
        Ok(())
    }

    /// Cluster events are best effort; a failed publish never fails the sync.
    async fn publish_event(
        &self,
        image_cache: &ImageCache,
        event_type: EventType,
        reason: ImageCacheReason,
        note: &str,
    ) {
        let event = Event {
            type_: event_type,
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: "Reconcile".into(),
            secondary: None,
        };
        if let Err(e) = self
            .recorder
            .publish(&event, &image_cache.object_ref(&()))
            .await
        {
            warn!(cache = %image_cache.obj_key(), error = %e, "failed to publish event");
        }
    }
}

fn runtime_version(node: &Node) -> String {
    node.status
        .as_ref()
        .and_then(|s| s.node_info.as_ref())
        .map(|i| i.container_runtime_version.clone())
        .unwrap_or_default()
}

fn node_hostname(node: Option<&Node>) -> String {
    match node {
        Some(node) => node
            .labels()
            .get(HOSTNAME_LABEL)
            .cloned()
            .unwrap_or_else(|| node.name_any()),
        None => String::new(),
    }
}

/// Images present in the same-index old entry but gone from the new one.
/// Old entries with no same-index counterpart are skipped entirely.
pub(crate) fn images_to_purge<'a>(
    old_entry: Option<&'a CacheSpecImages>,
    new_entry: &CacheSpecImages,
) -> Vec<&'a Image> {
    match old_entry {
        Some(old) => old
            .images
            .iter()
            .filter(|image| !new_entry.images.contains(*image))
            .collect(),
        None => Vec::new(),
    }
}

/// Fold a pass's per-job results into one terminal status. The pre-existing
/// reason survives (it says why the pass ran); the new status and message
/// describe how it went. An empty batch means nothing was pulled or deleted.
pub(crate) fn aggregate_results(
    previous: &ImageCacheStatus,
    results: &HashMap<String, ImageWorkResult>,
) -> ImageCacheStatus {
    let mut status = ImageCacheStatus {
        status: ImageCacheActionStatus::NoImagesPulledOrDeleted,
        reason: previous.reason,
        message: messages::NO_IMAGES_PULLED_OR_DELETED.into(),
        failures: Default::default(),
        start_time: previous.start_time.clone(),
        completion_time: None,
    };
    let mut failures = false;
    for result in results.values() {
        match result.status {
            ImageWorkResultStatus::Succeeded | ImageWorkResultStatus::AlreadyPulled
                if !failures =>
            {
                status.status = ImageCacheActionStatus::Succeeded;
                status.message = if result.request.work_type == WorkType::Purge {
                    messages::IMAGES_DELETED.into()
                } else {
                    messages::IMAGES_PULLED.into()
                };
            }
            ImageWorkResultStatus::Failed | ImageWorkResultStatus::Unknown => {
                if !failures {
                    failures = true;
                    status.status = ImageCacheActionStatus::Failed;
                    status.message = if result.request.work_type == WorkType::Purge {
                        messages::DELETE_FAILED_FOR_SOME.into()
                    } else {
                        messages::PULL_FAILED_FOR_SOME.into()
                    };
                }
                status
                    .failures
                    .entry(result.request.image.clone())
                    .or_default()
                    .push(crate::api::NodeReasonMessage {
                        node: node_hostname(result.request.node.as_ref()),
                        reason: result.reason.clone(),
                        message: result.message.clone(),
                    });
            }
            _ => {}
        }
    }
    status
}
