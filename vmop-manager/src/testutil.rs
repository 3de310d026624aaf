//! Fake-API-server fixture shared by the crate's reconciler tests. A
//! `tower_test::mock` stands in for the Kubernetes API: tests script the
//! exact requests they expect and hand back canned responses.

#![cfg(test)]

use http::{Method, Request, Response};
use kube::Client;
use kube::client::Body;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_test::mock::{self, Handle};
use vmop_types::{VirtualMachine, VirtualMachineSpec, VmSpec};

use crate::config::ReconcilerConfig;
use crate::model::VmDefinition;

pub type MockHandle = Handle<Request<Body>, Response<Body>>;

pub fn mock_client() -> (Client, MockHandle) {
    let (mock_service, handle) = mock::pair::<Request<Body>, Response<Body>>();
    let client = Client::new(mock_service, "default");
    (client, handle)
}

/// A single expected request/response exchange in a [`run_script`] sequence.
pub struct Step {
    assert: Box<dyn Fn(&Request<Body>) + Send>,
    response: Response<Body>,
}

/// Expects a request with the given method whose path contains
/// `path_contains`, then hands back `response`.
pub fn expect(method: Method, path_contains: &'static str, response: Response<Body>) -> Step {
    Step {
        assert: Box::new(move |req| {
            assert_eq!(req.method(), &method, "unexpected method for path containing {path_contains}");
            assert!(
                req.uri().path().contains(path_contains),
                "unexpected path {}, expected it to contain {path_contains}",
                req.uri()
            );
        }),
        response,
    }
}

/// JSON 200 response carrying `value`.
pub fn json_response<T: serde::Serialize>(value: &T) -> Response<Body> {
    Response::builder()
        .status(200)
        .body(Body::from(serde_json::to_vec(value).expect("serialize fixture")))
        .unwrap()
}

/// A `NotFound` API error response, the shape `Api::get_opt` treats as `Ok(None)`.
pub fn not_found_response() -> Response<Body> {
    let body = serde_json::json!({
        "status": "Failure",
        "message": "not found",
        "reason": "NotFound",
        "code": 404,
    });
    Response::builder()
        .status(404)
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

/// Drives `handle` through `steps` in order on a background task. Await the
/// returned handle (with [`await_script`]) to confirm every scripted request
/// actually arrived.
pub fn run_script(mut handle: MockHandle, steps: Vec<Step>) -> JoinHandle<()> {
    tokio::spawn(async move {
        for step in steps {
            let (request, send) = handle.next_request().await.expect("mock server: expected a request");
            (step.assert)(&request);
            send.send_response(step.response);
        }
    })
}

/// Waits for a [`run_script`] task to consume its whole sequence, with a
/// timeout so a reconciler that skips a scripted call fails the test instead
/// of hanging it.
pub async fn await_script(verifier: JoinHandle<()>) {
    tokio::time::timeout(Duration::from_secs(1), verifier)
        .await
        .expect("mock script timed out: fewer requests were issued than scripted")
        .expect("mock script task panicked");
}

/// Bounds an operation against the mock API server so an unscripted extra
/// request (which would otherwise hang waiting on a response) fails fast.
pub async fn with_timeout<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(1), fut)
        .await
        .expect("operation timed out waiting on the mock api server")
}

/// A minimal `VirtualMachine` fixture with a namespace and uid, so
/// `RenderModel::owner_reference` can build an `OwnerReference` from it.
pub fn sample_vm(name: &str) -> VmDefinition {
    let mut object = VirtualMachine::new(
        name,
        VirtualMachineSpec {
            vm: VmSpec {
                maximum_ram: "4Gi".to_string(),
                current_ram: "2Gi".to_string(),
                maximum_cpus: 4,
                current_cpus: 2,
                ..Default::default()
            },
            ..Default::default()
        },
    );
    object.metadata.namespace = Some("default".to_string());
    object.metadata.uid = Some("11111111-1111-1111-1111-111111111111".to_string());
    VmDefinition::from_object(object)
}

pub fn sample_config() -> ReconcilerConfig {
    ReconcilerConfig {
        namespace: "default".to_string(),
        ..Default::default()
    }
}
