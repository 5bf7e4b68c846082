// SPDX-FileCopyrightText: The cloud-api-adaptor e2e authors
//
// SPDX-License-Identifier: MIT

use http::{Request, Response, StatusCode};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus, Event,
    ObjectReference, Pod, PodCondition, PodSpec, PodStatus, ServiceAccount,
};
use kube::api::ObjectMeta;
use kube::{Client, client::Body, error::ErrorResponse};
use serde_json::json;
use std::collections::BTreeMap;
use std::convert::Infallible;
use tower::service_fn;

use crate::{E2eConfig, TestContext};

macro_rules! assert_kube_api_error {
    ($err:expr, $code:expr, $reason:expr) => {{
        let kube_error = $err
            .chain()
            .find_map(|e| e.downcast_ref::<kube::Error>())
            .expect(&format!("Expected kube::Error, got: {:?}", $err));

        if let kube::Error::Api(error_response) = kube_error {
            assert_eq!(error_response.code, $code);
            assert_eq!(error_response.reason, $reason);
        } else {
            assert!(false, "Expected kube::Error::Api, got: {:?}", kube_error);
        }
    }};
}

pub(crate) use assert_kube_api_error;

async fn create_response<T: Future<Output = Result<String, StatusCode>>>(
    response: T,
) -> Result<Response<Body>, Infallible> {
    let (body, status_code) = match response.await {
        Ok(response_data) => (Body::from(response_data.into_bytes()), StatusCode::OK),
        Err(status_code) => {
            let unknown_msg = format!("error with status code {status_code}");
            let (message, reason) = match status_code {
                StatusCode::CONFLICT => ("resource already exists", "AlreadyExists"),
                StatusCode::INTERNAL_SERVER_ERROR => ("internal server error", "ServerTimeout"),
                StatusCode::NOT_FOUND => ("resource not found", "NotFound"),
                StatusCode::BAD_REQUEST => ("bad request", "BadRequest"),
                _ => (unknown_msg.as_str(), "Unknown"),
            };
            let error_response = ErrorResponse {
                status: "Failure".to_string(),
                message: message.to_string(),
                reason: reason.to_string(),
                code: status_code.as_u16(),
            };
            let error_json = serde_json::to_string(&error_response).unwrap();
            (Body::from(error_json.into_bytes()), status_code)
        }
    };
    Ok(Response::builder().status(status_code).body(body).unwrap())
}

/// A `kube::Client` whose API server is a closure over the request.
pub struct MockClient<F, T>
where
    F: Fn(Request<Body>) -> T + Send + Sync + 'static,
    T: Future<Output = Result<String, StatusCode>> + Send + 'static,
{
    response_closure: F,
    namespace: String,
}

impl<F, T> MockClient<F, T>
where
    F: Fn(Request<Body>) -> T + Send + Sync + 'static,
    T: Future<Output = Result<String, StatusCode>> + Send + 'static,
{
    pub fn new(response_closure: F, namespace: String) -> Self {
        Self {
            response_closure,
            namespace,
        }
    }

    pub fn into_client(self) -> Client {
        let namespace = self.namespace.clone();
        let mock_svc = service_fn(move |req: Request<Body>| {
            let response = (self.response_closure)(req);
            create_response(response)
        });
        Client::new(mock_svc, namespace)
    }

    pub fn into_context(self) -> TestContext {
        TestContext::new(self.into_client(), E2eConfig::default())
    }
}

/// Serialize items as the `<Kind>List` body of a list call.
pub fn list_json<K: k8s_openapi::serde::Serialize>(kind: &str, items: &[K]) -> String {
    json!({
        "apiVersion": "v1",
        "kind": format!("{kind}List"),
        "metadata": {},
        "items": items,
    })
    .to_string()
}

pub fn to_json<K: k8s_openapi::serde::Serialize>(object: &K) -> String {
    serde_json::to_string(object).unwrap()
}

pub fn dummy_pod(namespace: &str, name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some("worker-0".to_string()),
            containers: vec![k8s_openapi::api::core::v1::Container {
                name: "busybox".to_string(),
                image: Some("quay.io/prometheus/busybox:latest".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn with_phase(mut pod: Pod, phase: &str) -> Pod {
    pod.status.get_or_insert_with(PodStatus::default).phase = Some(phase.to_string());
    pod
}

pub fn with_containers_ready(mut pod: Pod) -> Pod {
    pod.status
        .get_or_insert_with(PodStatus::default)
        .conditions
        .get_or_insert_with(Vec::new)
        .push(PodCondition {
            type_: "ContainersReady".to_string(),
            status: "True".to_string(),
            ..Default::default()
        });
    pod
}

pub fn with_labels(mut pod: Pod, labels: &[(&str, &str)]) -> Pod {
    pod.metadata.labels = Some(
        labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
    );
    pod
}

pub fn with_waiting(mut pod: Pod, reason: &str) -> Pod {
    pod.status
        .get_or_insert_with(PodStatus::default)
        .container_statuses = Some(vec![ContainerStatus {
        name: "busybox".to_string(),
        state: Some(ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some(reason.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }]);
    pod
}

pub fn with_terminated(mut pod: Pod, reason: &str) -> Pod {
    pod.status
        .get_or_insert_with(PodStatus::default)
        .container_statuses = Some(vec![ContainerStatus {
        name: "busybox".to_string(),
        state: Some(ContainerState {
            terminated: Some(ContainerStateTerminated {
                reason: Some(reason.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }]);
    pod
}

pub fn dummy_event(pod_name: &str, type_: &str, reason: &str, message: &str) -> Event {
    Event {
        metadata: ObjectMeta {
            name: Some(format!("{pod_name}.{reason}")),
            ..Default::default()
        },
        involved_object: ObjectReference {
            kind: Some("Pod".to_string()),
            name: Some(pod_name.to_string()),
            ..Default::default()
        },
        type_: Some(type_.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        ..Default::default()
    }
}

pub fn dummy_service_account(namespace: &str, name: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}
