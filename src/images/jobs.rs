//! Builders for the short-lived per-(image, node) jobs.
//!
//! Three shapes: a pull job whose only side effect is the image pull itself
//! (the container just echoes and exits), a full-cache job that additionally
//! reads every file of the image to defeat lazy-loading snapshotters, and a
//! purge job that asks the node's container runtime to remove the image.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, HostPathVolumeSource, PodSpec, PodTemplateSpec, Toleration,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::api::{ImageCache, APP_LABEL, HOSTNAME_LABEL, IMAGE_MANAGER_LABEL};
use crate::config::Config;

/// Upper bound on any job's lifetime, independent of the pull deadline.
const ACTIVE_DEADLINE_SECONDS: i64 = 3600;

const TMP_BIN_VOLUME: &str = "tmp-bin";
const TMP_BIN_MOUNT_PATH: &str = "/tmp/bin";
const CRI_SOCK_VOLUME: &str = "cri-sock";

pub fn job_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.0.to_string(), APP_LABEL.1.to_string()),
        (
            IMAGE_MANAGER_LABEL.0.to_string(),
            IMAGE_MANAGER_LABEL.1.to_string(),
        ),
    ])
}

fn job_meta(image_cache: &ImageCache, fallback_namespace: &str) -> ObjectMeta {
    ObjectMeta {
        generate_name: Some(format!("{}-", image_cache.name_any())),
        namespace: image_cache
            .namespace()
            .or_else(|| Some(fallback_namespace.to_string())),
        owner_references: image_cache.controller_owner_ref(&()).map(|r| vec![r]),
        labels: Some(job_labels()),
        ..ObjectMeta::default()
    }
}

fn job_shell(image_cache: &ImageCache, fallback_namespace: &str, pod: PodSpec) -> Job {
    Job {
        metadata: job_meta(image_cache, fallback_namespace),
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            active_deadline_seconds: Some(ACTIVE_DEADLINE_SECONDS),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(job_labels()),
                    ..ObjectMeta::default()
                }),
                spec: Some(pod),
            },
            ..JobSpec::default()
        }),
        status: None,
    }
}

fn base_pod(image_cache: &ImageCache, hostname: &str, config: &Config) -> PodSpec {
    PodSpec {
        node_selector: Some(BTreeMap::from([(
            HOSTNAME_LABEL.to_string(),
            hostname.to_string(),
        )])),
        restart_policy: Some("Never".to_string()),
        image_pull_secrets: image_cache.spec.image_pull_secrets.clone(),
        // reach tainted nodes too
        tolerations: Some(vec![Toleration {
            operator: Some("Exists".to_string()),
            ..Toleration::default()
        }]),
        service_account_name: non_empty(&config.service_account_name),
        priority_class_name: non_empty(&config.job_priority_class_name),
        ..PodSpec::default()
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// A pod pinned to `hostname` whose main container runs `image`; pulling the
/// image is the point, the command just succeeds cheaply using the echo
/// binary staged by the init container.
pub fn pull_job(image_cache: &ImageCache, image: &str, hostname: &str, config: &Config) -> Job {
    let mount = VolumeMount {
        name: TMP_BIN_VOLUME.to_string(),
        mount_path: TMP_BIN_MOUNT_PATH.to_string(),
        ..VolumeMount::default()
    };
    let mut pod = base_pod(image_cache, hostname, config);
    pod.init_containers = Some(vec![Container {
        name: "busybox".to_string(),
        image: Some(config.busybox_image.clone()),
        command: Some(vec![
            "cp".to_string(),
            "/bin/echo".to_string(),
            TMP_BIN_MOUNT_PATH.to_string(),
        ]),
        volume_mounts: Some(vec![mount.clone()]),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ..Container::default()
    }]);
    pod.containers = vec![Container {
        name: "imagepuller".to_string(),
        image: Some(image.to_string()),
        command: Some(vec![
            format!("{TMP_BIN_MOUNT_PATH}/echo"),
            "Image pulled successfully!".to_string(),
        ]),
        volume_mounts: Some(vec![mount]),
        image_pull_policy: non_empty(&config.image_pull_policy),
        ..Container::default()
    }];
    pod.volumes = Some(vec![Volume {
        name: TMP_BIN_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Volume::default()
    }]);
    job_shell(image_cache, &config.namespace, pod)
}

/// Streams every regular file of the listed directories through `cat` so a
/// lazy-loading filesystem has to materialize the bytes. Failures along the
/// way are swallowed; touching pages is the goal, not asserting them.
fn dir_cache_job(
    image_cache: &ImageCache,
    image: &str,
    hostname: &str,
    config: &Config,
    cache_dirs: &[&str],
) -> Job {
    let command = format!(
        "find {} \
         -prune -o -path \"/dev/*\" \
         -prune -o -path \"/proc/*\" \
         -prune -o -path \"/sys/*\" \
         -prune -o -path \"/mnt/*\" \
         -type f -print0 | xargs -0 cat > /dev/null || true",
        cache_dirs.join(" ")
    );
    let mut pod = base_pod(image_cache, hostname, config);
    pod.containers = vec![Container {
        name: "imagepuller".to_string(),
        image: Some(image.to_string()),
        command: Some(vec!["bash".to_string(), "-c".to_string(), command]),
        image_pull_policy: non_empty(&config.image_pull_policy),
        ..Container::default()
    }];
    job_shell(image_cache, &config.namespace, pod)
}

/// Full-cache variant of the pull job: reads the whole image filesystem.
pub fn full_cache_job(
    image_cache: &ImageCache,
    image: &str,
    hostname: &str,
    config: &Config,
) -> Job {
    dir_cache_job(image_cache, image, hostname, config, &["/"])
}

/// Removes `image` from the node by invoking the container runtime CLI from
/// a pre-provisioned client image with the CRI socket mounted in.
pub fn purge_job(
    image_cache: &ImageCache,
    image: &str,
    hostname: &str,
    container_runtime_version: &str,
    config: &Config,
) -> Job {
    let command = if container_runtime_version.starts_with("docker://") {
        vec!["docker".to_string(), "rmi".to_string(), image.to_string()]
    } else {
        vec![
            "crictl".to_string(),
            "-r".to_string(),
            format!("unix://{}", config.cri_socket_path),
            "rmi".to_string(),
            image.to_string(),
        ]
    };
    let mut pod = base_pod(image_cache, hostname, config);
    pod.host_network = Some(config.image_delete_job_host_network);
    pod.containers = vec![Container {
        name: "cri-client".to_string(),
        image: Some(config.cri_client_image.clone()),
        command: Some(command),
        volume_mounts: Some(vec![VolumeMount {
            name: CRI_SOCK_VOLUME.to_string(),
            mount_path: config.cri_socket_path.clone(),
            ..VolumeMount::default()
        }]),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ..Container::default()
    }];
    pod.volumes = Some(vec![Volume {
        name: CRI_SOCK_VOLUME.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: config.cri_socket_path.clone(),
            type_: None,
        }),
        ..Volume::default()
    }]);
    job_shell(image_cache, &config.namespace, pod)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CacheSpecImages, Image, ImageCacheSpec};
    use k8s_openapi::api::core::v1::LocalObjectReference;

    fn sample_cache() -> ImageCache {
        let mut ic = ImageCache::new("foo", ImageCacheSpec {
            cache_spec: vec![CacheSpecImages {
                images: vec![Image {
                    name: "nginx:1.27".into(),
                    force_full_cache: false,
                }],
                node_selector: None,
            }],
            image_pull_secrets: Some(vec![LocalObjectReference {
                name: "regcred".into(),
            }]),
        });
        ic.metadata.namespace = Some("kf".into());
        ic.metadata.uid = Some("uid-1".into());
        ic
    }

    #[test]
    fn pull_job_shape() {
        let job = pull_job(&sample_cache(), "nginx:1.27", "node-1", &Config::default());

        assert_eq!(job.metadata.generate_name.as_deref(), Some("foo-"));
        assert_eq!(job.metadata.namespace.as_deref(), Some("kf"));
        let owner = &job.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "ImageCache");
        assert_eq!(owner.name, "foo");
        assert_eq!(owner.controller, Some(true));
        assert_eq!(
            job.metadata.labels.as_ref().unwrap()["kubefledged"],
            "kubefledged-image-manager"
        );

        let spec = job.spec.as_ref().unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.active_deadline_seconds, Some(3600));
        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(
            pod.node_selector.as_ref().unwrap()["kubernetes.io/hostname"],
            "node-1"
        );
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(
            pod.tolerations.as_ref().unwrap()[0].operator.as_deref(),
            Some("Exists")
        );
        assert_eq!(
            pod.image_pull_secrets.as_ref().unwrap()[0].name,
            "regcred"
        );

        let init = &pod.init_containers.as_ref().unwrap()[0];
        assert_eq!(init.command.as_ref().unwrap()[0], "cp");
        let main = &pod.containers[0];
        assert_eq!(main.image.as_deref(), Some("nginx:1.27"));
        assert_eq!(main.command.as_ref().unwrap()[0], "/tmp/bin/echo");
    }

    #[test]
    fn full_cache_job_reads_whole_filesystem() {
        let job = full_cache_job(&sample_cache(), "nginx:1.27", "node-1", &Config::default());
        let pod = job.spec.unwrap().template.spec.unwrap();
        assert!(pod.init_containers.is_none());
        let command = pod.containers[0].command.as_ref().unwrap();
        assert_eq!(command[0], "bash");
        assert!(command[2].starts_with("find / "));
        assert!(command[2].contains("-path \"/proc/*\""));
        assert!(command[2].ends_with("|| true"));
    }

    #[test]
    fn purge_job_picks_runtime_cli() {
        let config = Config::default();
        let job = purge_job(
            &sample_cache(),
            "nginx:1.27",
            "node-1",
            "containerd://1.7.2",
            &config,
        );
        let pod = job.spec.unwrap().template.spec.unwrap();
        let command = pod.containers[0].command.as_ref().unwrap();
        assert_eq!(command[0], "crictl");
        assert_eq!(command[2], "unix:///run/containerd/containerd.sock");
        assert_eq!(
            pod.volumes.as_ref().unwrap()[0]
                .host_path
                .as_ref()
                .unwrap()
                .path,
            config.cri_socket_path
        );
        assert_eq!(pod.host_network, Some(false));

        let docker = purge_job(
            &sample_cache(),
            "nginx:1.27",
            "node-1",
            "docker://24.0.5",
            &config,
        );
        let pod = docker.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.containers[0].command.as_ref().unwrap()[0], "docker");
    }
}
