//! The `kubefledged.io/v1alpha3` ImageCache resource and its status model.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::LocalObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation requesting deletion of the cached images from matching nodes.
pub const IMAGE_CACHE_PURGE_ANNOTATION: &str = "kubefledged.io/purge-imagecache";
/// Annotation forcing an immediate refresh pass.
pub const IMAGE_CACHE_REFRESH_ANNOTATION: &str = "kubefledged.io/refresh-imagecache";

pub const CONTROLLER_AGENT_NAME: &str = "kubefledged-controller";

/// Labels carried by every job owned by the image manager, and the selector
/// used to find them again (job watch, preflight cleanup).
pub const APP_LABEL: (&str, &str) = ("app", "kubefledged");
pub const IMAGE_MANAGER_LABEL: (&str, &str) = ("kubefledged", "kubefledged-image-manager");
pub const JOB_LABEL_SELECTOR: &str = "app=kubefledged,kubefledged=kubefledged-image-manager";

pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Declares a set of container images to be cached on a selected set of nodes.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "kubefledged.io",
    version = "v1alpha3",
    kind = "ImageCache",
    plural = "imagecaches",
    namespaced,
    status = "ImageCacheStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ImageCacheSpec {
    /// Ordered list of (images, node selector) groups.
    pub cache_spec: Vec<CacheSpecImages>,
    /// Pull secrets forwarded verbatim to the pull jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secrets: Option<Vec<LocalObjectReference>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CacheSpecImages {
    pub images: Vec<Image>,
    /// Empty or absent selector means all nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    /// Container image reference.
    pub name: String,
    /// Materialize the entire image filesystem at pull time to defeat
    /// lazy-loading snapshotters.
    #[serde(default)]
    pub force_full_cache: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageCacheStatus {
    pub status: ImageCacheActionStatus,
    pub reason: ImageCacheReason,
    pub message: String,
    /// Per-image failure records; present only for non-success outcomes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failures: BTreeMap<String, Vec<NodeReasonMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,
    /// Set iff the status is terminal (anything but `Processing`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeReasonMessage {
    pub node: String,
    pub reason: String,
    pub message: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ImageCacheActionStatus {
    #[default]
    Processing,
    Succeeded,
    Failed,
    Aborted,
    NoImagesPulledOrDeleted,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ImageCacheReason {
    #[default]
    ImageCacheCreate,
    ImageCacheUpdate,
    ImageCacheRefresh,
    ImageCachePurge,
    CacheSpecValidationFailed,
    ImagePullAborted,
    OldImageCacheNotFound,
}

impl fmt::Display for ImageCacheReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImageCacheReason::ImageCacheCreate => "ImageCacheCreate",
            ImageCacheReason::ImageCacheUpdate => "ImageCacheUpdate",
            ImageCacheReason::ImageCacheRefresh => "ImageCacheRefresh",
            ImageCacheReason::ImageCachePurge => "ImageCachePurge",
            ImageCacheReason::CacheSpecValidationFailed => "CacheSpecValidationFailed",
            ImageCacheReason::ImagePullAborted => "ImagePullAborted",
            ImageCacheReason::OldImageCacheNotFound => "OldImageCacheNotFound",
        };
        f.write_str(s)
    }
}

/// Human-readable texts written to `status.message`.
pub mod messages {
    pub const PULLING_IMAGES: &str =
        "Images are being pulled on to the nodes. Please view the status after some time";
    pub const UPDATING_CACHE: &str =
        "Image cache is being updated. Please view the status after some time";
    pub const REFRESHING_CACHE: &str =
        "Image cache is being refreshed. Please view the status after some time";
    pub const PURGING_CACHE: &str =
        "Images in the cache are being deleted. Please view the status after some time";
    pub const IMAGES_PULLED: &str = "images pulled successfully";
    pub const IMAGES_DELETED: &str = "images deleted successfully";
    pub const PULL_FAILED_FOR_SOME: &str =
        "image pull failed for some images. please see \"failures\" section";
    pub const DELETE_FAILED_FOR_SOME: &str =
        "image delete failed for some images. please see \"failures\" section";
    pub const NO_IMAGES_PULLED_OR_DELETED: &str = "no images were pulled or deleted";
    pub const IMAGE_PULL_ABORTED: &str =
        "image cache processing was aborted. the cache will be refreshed in the next refresh cycle";
    pub const OLD_IMAGE_CACHE_NOT_FOUND: &str =
        "previous revision of the image cache was not found, unable to determine images to be removed";
}

impl ImageCache {
    /// The `namespace/name` key used on the work queues and in the stores.
    pub fn obj_key(&self) -> String {
        obj_key(self.namespace().as_deref(), &self.name_any())
    }

    /// Whether the resource carries any status at all. A brand-new resource
    /// has none; anything observed by the controller does.
    pub fn has_status(&self) -> bool {
        self.status.is_some()
    }

    pub fn is_processing(&self) -> bool {
        matches!(
            self.status.as_ref().map(|s| s.status),
            Some(ImageCacheActionStatus::Processing)
        )
    }
}

/// `namespace/name` for namespaced objects, bare `name` for cluster-scoped.
pub fn obj_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_string(),
    }
}

/// Inverse of [`obj_key`].
pub fn split_obj_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((ns, name)) => (Some(ns), name),
        None => (None, key),
    }
}
