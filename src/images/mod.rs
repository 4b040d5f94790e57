//! Typed items flowing between the reconciliation engine and the image work
//! manager: control-plane keys and data-plane work requests/results.

use std::collections::HashMap;
use std::fmt;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

use crate::api::ImageCache;
use crate::workqueue::QueueItem;

pub mod jobs;
pub mod manager;

/// The kind of work a queue item asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkType {
    Create,
    Update,
    Refresh,
    Purge,
    Delete,
    StatusUpdate,
}

impl fmt::Display for WorkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkType::Create => "create",
            WorkType::Update => "update",
            WorkType::Refresh => "refresh",
            WorkType::Purge => "purge",
            WorkType::Delete => "delete",
            WorkType::StatusUpdate => "statusupdate",
        };
        f.write_str(s)
    }
}

/// One reconciliation intent on a named ImageCache.
#[derive(Clone, Debug)]
pub struct WorkQueueKey {
    pub work_type: WorkType,
    /// `namespace/name` of the ImageCache.
    pub obj_key: String,
    /// Snapshot of the previous revision; present only for `Update`.
    pub old_image_cache: Option<ImageCache>,
    /// Aggregated results of a finished pass; present only for `StatusUpdate`.
    pub status: Option<HashMap<String, ImageWorkResult>>,
}

impl WorkQueueKey {
    pub fn new(work_type: WorkType, obj_key: String) -> Self {
        Self {
            work_type,
            obj_key,
            old_image_cache: None,
            status: None,
        }
    }

    pub fn update(obj_key: String, old_image_cache: ImageCache) -> Self {
        Self {
            work_type: WorkType::Update,
            obj_key,
            old_image_cache: Some(old_image_cache),
            status: None,
        }
    }

    pub fn status_update(obj_key: String, status: HashMap<String, ImageWorkResult>) -> Self {
        Self {
            work_type: WorkType::StatusUpdate,
            obj_key,
            old_image_cache: None,
            status: Some(status),
        }
    }
}

impl QueueItem for WorkQueueKey {
    type Key = (String, WorkType);

    fn queue_key(&self) -> Self::Key {
        (self.obj_key.clone(), self.work_type)
    }
}

/// One unit of data-plane work: pull or purge a single image on a single
/// node. The sentinel variant (empty image, no node) marks the end of a
/// reconciliation pass.
#[derive(Clone, Debug)]
pub struct ImageWorkRequest {
    pub image: String,
    pub force_full_cache: bool,
    pub node: Option<Node>,
    pub container_runtime_version: String,
    pub work_type: WorkType,
    pub image_cache: ImageCache,
}

impl ImageWorkRequest {
    pub fn sentinel(work_type: WorkType, image_cache: ImageCache) -> Self {
        Self {
            image: String::new(),
            force_full_cache: false,
            node: None,
            container_runtime_version: String::new(),
            work_type,
            image_cache,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.image.is_empty() && self.node.is_none()
    }

    pub fn node_name(&self) -> String {
        self.node.as_ref().map(|n| n.name_any()).unwrap_or_default()
    }
}

impl QueueItem for ImageWorkRequest {
    type Key = (String, String, String, WorkType);

    fn queue_key(&self) -> Self::Key {
        (
            self.image_cache.obj_key(),
            self.image.clone(),
            self.node_name(),
            self.work_type,
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageWorkResultStatus {
    Succeeded,
    AlreadyPulled,
    Failed,
    Unknown,
}

/// Terminal outcome of one [`ImageWorkRequest`], keyed by job id in the
/// aggregated batch handed back to the reconciliation engine.
#[derive(Clone, Debug)]
pub struct ImageWorkResult {
    pub status: ImageWorkResultStatus,
    pub reason: String,
    pub message: String,
    pub request: ImageWorkRequest,
}

/// Failure reason applied when a job outlives the image pull deadline.
pub const REASON_IMAGE_PULL_DEADLINE_EXCEEDED: &str = "ImagePullDeadlineExceeded";
/// Failure reason applied when the job could not be created at all.
pub const REASON_JOB_CREATION_FAILED: &str = "JobCreationFailed";
/// Reason applied when a job's phase could not be determined.
pub const REASON_IMAGE_PULL_STATUS_UNKNOWN: &str = "ImagePullStatusUnknown";
