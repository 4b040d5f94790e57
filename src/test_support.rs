//! Shared helpers for tests that talk to a scripted fake api server.

use http::{Request, Response};
use kube::client::Body;
use kube::Client;

pub type MockHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

/// A client wired to an in-process mock service; drive the returned handle
/// to play the api server side of the conversation.
pub fn mock_client() -> (Client, MockHandle) {
    let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    (Client::new(mock_service, "kube-fledged"), handle)
}

pub fn json_response(body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

pub async fn read_json_body(request: Request<Body>) -> serde_json::Value {
    let bytes = request.into_body().collect_bytes().await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
