//! Process configuration shared by the controller and the image manager.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    /// The controller's home namespace. Jobs land in the namespace of their
    /// ImageCache (ownership requires it); this is the fallback when a cache
    /// somehow carries none.
    pub namespace: String,
    /// Number of worker tasks draining the control work queue.
    pub threadiness: usize,
    /// Period of the automatic refresh timer. Zero disables it.
    pub image_cache_refresh_frequency: Duration,
    /// Upper bound on how long a single pull/purge job may take before its
    /// result is forced to a terminal failure.
    pub image_pull_deadline_duration: Duration,
    /// Image used by purge jobs to talk to the container runtime.
    pub cri_client_image: String,
    /// Image providing the `echo` binary copied into pull-job pods.
    pub busybox_image: String,
    /// Pull policy forwarded to the pull jobs.
    pub image_pull_policy: String,
    /// Service account assigned to job pods. Empty means the namespace default.
    pub service_account_name: String,
    /// Whether purge jobs share the node network namespace.
    pub image_delete_job_host_network: bool,
    /// Priority class assigned to job pods. Empty means none.
    pub job_priority_class_name: String,
    /// Whether harvested jobs are deleted once their result is recorded.
    pub can_delete_job: bool,
    /// Host path of the CRI socket mounted into purge jobs.
    pub cri_socket_path: String,
    /// How long to wait after a node becomes ready before fanning out
    /// refreshes, so the api server can converge first.
    pub node_settle_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "kube-fledged".to_string(),
            threadiness: 1,
            image_cache_refresh_frequency: Duration::from_secs(15 * 60),
            image_pull_deadline_duration: Duration::from_secs(5 * 60),
            cri_client_image: "senthilrch/kubefledged-cri-client:v0.10.0".to_string(),
            busybox_image: "senthilrch/busybox:1.35.0".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            service_account_name: String::new(),
            image_delete_job_host_network: false,
            job_priority_class_name: String::new(),
            can_delete_job: true,
            cri_socket_path: "/run/containerd/containerd.sock".to_string(),
            node_settle_delay: Duration::from_secs(5),
        }
    }
}
