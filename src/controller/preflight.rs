//! Startup preflight: clear the wreckage of a previous process before the
//! main loop starts, so nothing races the fresh passes.

use k8s_openapi::api::batch::v1::Job;
use kube::api::{DeleteParams, ListParams};
use kube::{Api, ResourceExt};
use tracing::info;

use super::Controller;
use crate::api::{
    messages, ImageCache, ImageCacheActionStatus, ImageCacheReason, ImageCacheStatus,
    JOB_LABEL_SELECTOR,
};
use crate::error::Error;

impl Controller {
    /// Runs once before the informers start. Errors here are fatal: a leaked
    /// running job would race the first reconciliation pass.
    pub async fn preflight_checks(&self) -> Result<(), Error> {
        self.delete_dangling_jobs().await?;
        self.abort_dangling_image_caches().await?;
        Ok(())
    }

    /// Delete every job left behind by a previous incarnation, children
    /// included.
    async fn delete_dangling_jobs(&self) -> Result<(), Error> {
        let all: Api<Job> = Api::all(self.client.clone());
        let jobs = all
            .list(&ListParams::default().labels(JOB_LABEL_SELECTOR))
            .await?;
        if jobs.items.is_empty() {
            info!("no dangling or stuck jobs found");
            return Ok(());
        }
        for job in &jobs.items {
            let namespace = job
                .namespace()
                .unwrap_or_else(|| self.config.namespace.clone());
            let api: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
            api.delete(&job.name_any(), &DeleteParams::background())
                .await?;
            info!(job = %job.name_any(), "dangling job deleted");
        }
        Ok(())
    }

    /// Rewrite every ImageCache stuck in `Processing` to `Aborted`, keeping
    /// its original start time, so the refresh loop picks it up again.
    async fn abort_dangling_image_caches(&self) -> Result<(), Error> {
        let all: Api<ImageCache> = Api::all(self.client.clone());
        let caches = all.list(&ListParams::default()).await?;
        let mut dangling = false;
        for cache in &caches.items {
            if !cache.is_processing() {
                continue;
            }
            let namespace = cache
                .namespace()
                .unwrap_or_else(|| self.config.namespace.clone());
            let api: Api<ImageCache> = Api::namespaced(self.client.clone(), &namespace);
            let status = ImageCacheStatus {
                status: ImageCacheActionStatus::Aborted,
                reason: ImageCacheReason::ImagePullAborted,
                message: messages::IMAGE_PULL_ABORTED.into(),
                start_time: cache.status.as_ref().and_then(|s| s.start_time.clone()),
                ..ImageCacheStatus::default()
            };
            self.update_image_cache_status(&api, &cache.name_any(), status)
                .await?;
            dangling = true;
            info!(cache = %cache.obj_key(), "dangling image cache marked as aborted");
        }
        if !dangling {
            info!("no dangling or stuck image caches found");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::test_support::{json_response, mock_client, read_json_body};
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn preflight_deletes_jobs_and_aborts_processing_caches() {
        let (client, mut handle) = mock_client();
        let controller = crate::Controller::new(client, Config::default());

        let processing = json!({
            "apiVersion": "kubefledged.io/v1alpha3",
            "kind": "ImageCache",
            "metadata": { "name": "stuck", "namespace": "kf", "uid": "uid-stuck" },
            "spec": { "cacheSpec": [ { "images": [ { "name": "bar:1" } ] } ] },
            "status": {
                "status": "Processing",
                "reason": "ImageCacheCreate",
                "message": "Images are being pulled on to the nodes. Please view the status after some time",
                "startTime": "2026-01-01T00:00:00Z"
            }
        });
        let succeeded = json!({
            "apiVersion": "kubefledged.io/v1alpha3",
            "kind": "ImageCache",
            "metadata": { "name": "done", "namespace": "kf", "uid": "uid-done" },
            "spec": { "cacheSpec": [ { "images": [ { "name": "baz:1" } ] } ] },
            "status": {
                "status": "Succeeded",
                "reason": "ImageCacheCreate",
                "message": "images pulled successfully",
                "startTime": "2026-01-01T00:00:00Z",
                "completionTime": "2026-01-01T00:01:00Z"
            }
        });

        let server = tokio::spawn(async move {
            // controller-labelled jobs are listed cluster-wide
            let (request, send) = handle.next_request().await.expect("list jobs");
            assert_eq!(request.method(), http::Method::GET);
            let uri = request.uri().to_string();
            assert!(uri.contains("labelSelector="));
            assert!(uri.contains("jobs"));
            send.send_response(json_response(json!({
                "apiVersion": "batch/v1",
                "kind": "JobList",
                "metadata": { "resourceVersion": "1" },
                "items": [ { "metadata": { "name": "stuck-abc", "namespace": "kf" } } ]
            })));

            // each dangling job is deleted with background propagation
            let (request, send) = handle.next_request().await.expect("delete job");
            assert_eq!(request.method(), http::Method::DELETE);
            assert!(request
                .uri()
                .path()
                .ends_with("/namespaces/kf/jobs/stuck-abc"));
            let body = read_json_body(request).await;
            assert_eq!(body["propagationPolicy"], "Background");
            send.send_response(json_response(json!({
                "metadata": { "name": "stuck-abc", "namespace": "kf" }
            })));

            let (request, send) = handle.next_request().await.expect("list image caches");
            assert_eq!(request.method(), http::Method::GET);
            assert!(request.uri().path().ends_with("/imagecaches"));
            send.send_response(json_response(json!({
                "apiVersion": "kubefledged.io/v1alpha3",
                "kind": "ImageCacheList",
                "metadata": { "resourceVersion": "2" },
                "items": [ processing.clone(), succeeded ]
            })));

            // only the Processing cache is rewritten: refetch, then replace
            let (request, send) = handle.next_request().await.expect("get stuck cache");
            assert_eq!(request.method(), http::Method::GET);
            assert!(request
                .uri()
                .path()
                .ends_with("/namespaces/kf/imagecaches/stuck"));
            send.send_response(json_response(processing.clone()));

            let (request, send) = handle.next_request().await.expect("replace status");
            assert_eq!(request.method(), http::Method::PUT);
            assert!(request.uri().path().ends_with("/imagecaches/stuck/status"));
            let body = read_json_body(request).await;
            assert_eq!(body["status"]["status"], "Aborted");
            assert_eq!(body["status"]["reason"], "ImagePullAborted");
            // original start time survives, completion time is stamped now
            assert_eq!(body["status"]["startTime"], "2026-01-01T00:00:00Z");
            assert!(body["status"]["completionTime"].is_string());
            send.send_response(json_response(body));
        });

        controller.preflight_checks().await.unwrap();
        server.await.unwrap();
    }
}
