use crate::{
    core::{self, pod_security, Verdict},
    k8s::{self, DynamicObject, PodSpec, Resource, ResourceExt},
};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Serves `/mutate` and `/validate` admission reviews for `WebApp`s and pods.
#[derive(Clone)]
pub struct Admission {
    registry: Arc<Registry>,
}

/// The object kinds admission is configured for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    WebApp,
    Pod,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Mutate,
    Validate,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

/// Handlers receive the clock reading explicitly so that they stay pure.
type Handler = fn(&DynamicObject, DateTime<Utc>) -> Result<Verdict>;

/// Binds each `(Kind, Phase)` to its handler. Built once, at startup.
struct Registry(HashMap<(Kind, Phase), Handler>);

// === impl AdmissionService ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        let phase = match req.uri().path() {
            "/mutate" => Some(Phase::Mutate),
            "/validate" | "/" => Some(Phase::Validate),
            _ => None,
        };
        let Some(phase) = phase.filter(|_| req.method() == http::Method::POST) else {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        };

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: AdmissionReview = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(&req, phase, Utc::now())
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Default for Admission {
    fn default() -> Self {
        Self::new()
    }
}

impl Admission {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::new()),
        }
    }

    pub(crate) fn admit(
        &self,
        req: &AdmissionRequest,
        phase: Phase,
        now: DateTime<Utc>,
    ) -> AdmissionResponse {
        let Some(kind) = Kind::of(req) else {
            return AdmissionResponse::invalid(format_args!(
                "unsupported resource type: {}.{}.{}",
                req.kind.group, req.kind.version, req.kind.kind
            ));
        };
        let Some(handler) = self.registry.get(kind, phase) else {
            return AdmissionResponse::invalid(format_args!(
                "no {phase:?} handler for {kind:?}"
            ));
        };

        let rsp = AdmissionResponse::from(req);
        let Some(obj) = req.object.as_ref() else {
            info!(?kind, ?phase, "Admission request missing 'object'");
            return rsp.deny("admission request missing 'object'");
        };
        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();

        let verdict = match handler(obj, now) {
            Ok(verdict) => verdict,
            Err(error) => {
                info!(%error, %ns, %name, ?kind, "Failed to parse object");
                return rsp.deny(error);
            }
        };

        match verdict {
            Verdict::Approve(None) => rsp,
            Verdict::Approve(Some(patch)) => {
                debug!(%ns, %name, ?kind, ?phase, ?patch, "Patching");
                rsp.with_patch(patch).unwrap_or_else(|error| {
                    warn!(%error, "Failed to serialize patch");
                    AdmissionResponse::invalid(error)
                })
            }
            Verdict::Deny { code, messages } => {
                info!(%ns, %name, ?kind, code, ?messages, "Denied");
                let mut rsp = rsp.deny(messages.join("; "));
                rsp.result.code = code;
                rsp
            }
        }
    }
}

// === impl Kind ===

impl Kind {
    fn of(req: &AdmissionRequest) -> Option<Self> {
        if is_kind::<k8s::WebApp>(req) {
            return Some(Self::WebApp);
        }
        if is_kind::<k8s::Pod>(req) {
            return Some(Self::Pod);
        }
        None
    }
}

// === impl Registry ===

impl Registry {
    fn new() -> Self {
        let handlers: [((Kind, Phase), Handler); 4] = [
            ((Kind::WebApp, Phase::Mutate), mutate_webapp),
            ((Kind::WebApp, Phase::Validate), validate_webapp),
            ((Kind::Pod, Phase::Mutate), mutate_pod),
            ((Kind::Pod, Phase::Validate), validate_pod),
        ];
        Self(handlers.into_iter().collect())
    }

    fn get(&self, kind: Kind, phase: Phase) -> Option<Handler> {
        self.0.get(&(kind, phase)).copied()
    }
}

fn mutate_webapp(obj: &DynamicObject, now: DateTime<Utc>) -> Result<Verdict> {
    Ok(core::admission::mutate(obj, now))
}

fn validate_webapp(obj: &DynamicObject, _: DateTime<Utc>) -> Result<Verdict> {
    Ok(core::admission::validate(obj))
}

fn mutate_pod(obj: &DynamicObject, _: DateTime<Utc>) -> Result<Verdict> {
    let spec = parse_spec::<PodSpec>(obj)?;
    Ok(pod_security::mutate(&spec))
}

fn validate_pod(obj: &DynamicObject, _: DateTime<Utc>) -> Result<Verdict> {
    let spec = parse_spec::<PodSpec>(obj)?;
    Ok(pod_security::validate(&spec))
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

fn parse_spec<T: serde::de::DeserializeOwned>(obj: &DynamicObject) -> Result<T> {
    let data = obj
        .data
        .get("spec")
        .cloned()
        .ok_or_else(|| anyhow!("admission request missing 'spec'"))?;
    Ok(serde_json::from_value::<T>(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn request(group: &str, version: &str, kind: &str, object: Value) -> AdmissionRequest {
        let review: AdmissionReview = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": { "group": group, "version": version, "kind": kind },
                "resource": { "group": group, "version": version, "resource": "things" },
                "name": "app",
                "namespace": "ns-0",
                "operation": "CREATE",
                "userInfo": { "username": "admin" },
                "object": object,
                "oldObject": null,
                "dryRun": false,
            }
        }))
        .expect("review must parse");
        review.try_into().expect("request must be present")
    }

    fn webapp(spec: Value, status: Option<Value>) -> AdmissionRequest {
        let mut obj = json!({
            "apiVersion": "webapp.example.com/v1",
            "kind": "WebApp",
            "metadata": { "name": "app", "namespace": "ns-0" },
            "spec": spec,
        });
        if let Some(status) = status {
            obj["status"] = status;
        }
        request("webapp.example.com", "v1", "WebApp", obj)
    }

    fn pod(security_context: Value) -> AdmissionRequest {
        let mut container = json!({ "name": "app", "image": "nginx" });
        if !security_context.is_null() {
            container["securityContext"] = security_context;
        }
        request(
            "",
            "v1",
            "Pod",
            json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": { "name": "app", "namespace": "ns-0" },
                "spec": { "containers": [container] },
            }),
        )
    }

    fn response(rsp: AdmissionResponse) -> Value {
        let review = serde_json::to_value(rsp.into_review()).unwrap();
        review["response"].clone()
    }

    /// Decodes the response's patch, which is serialized as raw bytes.
    fn patch_of(rsp: &Value) -> Value {
        let bytes: Vec<u8> = serde_json::from_value(rsp["patch"].clone()).expect("patch bytes");
        serde_json::from_slice(&bytes).expect("patch must be json")
    }

    fn now() -> DateTime<Utc> {
        "2024-05-06T07:08:09Z".parse().unwrap()
    }

    #[test]
    fn approves_valid_webapp() {
        let req = webapp(json!({ "language": "english", "replicas": 1, "theme": "light" }), None);
        let rsp = response(Admission::new().admit(&req, Phase::Validate, now()));
        assert_eq!(rsp["allowed"], true);
    }

    #[test]
    fn denies_invalid_webapp_with_every_violation() {
        let req = webapp(json!({ "language": "french", "replicas": 0, "theme": "light" }), None);
        let rsp = response(Admission::new().admit(&req, Phase::Validate, now()));
        assert_eq!(rsp["allowed"], false);
        assert_eq!(rsp["status"]["code"], 422);
        assert_eq!(
            rsp["status"]["message"],
            format!(
                "{}; {}",
                core::admission::INVALID_LANGUAGE,
                core::admission::INVALID_REPLICAS
            )
        );
    }

    #[test]
    fn pending_webapp_passes_through_both_phases() {
        let status = json!({
            "conditions": [{
                "status": "Pending",
                "reason": "Processing",
                "observedGeneration": 2,
                "lastTransitionTime": "2024-01-01T00:00:00Z",
            }]
        });
        let req = webapp(json!({ "language": "french" }), Some(status));
        let admission = Admission::new();

        let rsp = response(admission.admit(&req, Phase::Validate, now()));
        assert_eq!(rsp["allowed"], true);
        let rsp = response(admission.admit(&req, Phase::Mutate, now()));
        assert_eq!(rsp["allowed"], true);
        assert!(rsp.get("patch").is_none());
    }

    #[test]
    fn mutate_webapp_returns_json_patch() {
        let req = webapp(json!({ "language": "english", "replicas": 1, "theme": "light" }), None);
        let rsp = response(Admission::new().admit(&req, Phase::Mutate, now()));
        assert_eq!(rsp["allowed"], true);
        assert_eq!(rsp["patchType"], "JSONPatch");
        assert_eq!(
            patch_of(&rsp),
            json!([
                { "op": "add", "path": "/metadata/annotations", "value": {} },
                {
                    "op": "add",
                    "path": "/metadata/annotations/webapp.example.com~1last-admitted",
                    "value": "2024-05-06T07:08:09Z",
                },
            ])
        );
    }

    #[test]
    fn mutates_unset_pod_escalation() {
        let req = pod(Value::Null);
        let rsp = response(Admission::new().admit(&req, Phase::Mutate, now()));
        assert_eq!(rsp["allowed"], true);
        assert_eq!(rsp["patchType"], "JSONPatch");
        assert_eq!(
            patch_of(&rsp),
            json!([{
                "op": "add",
                "path": "/spec/containers/0/securityContext",
                "value": { "allowPrivilegeEscalation": false },
            }])
        );
    }

    #[test]
    fn denies_pod_requesting_escalation() {
        let req = pod(json!({ "allowPrivilegeEscalation": true }));
        let admission = Admission::new();

        let rsp = response(admission.admit(&req, Phase::Mutate, now()));
        assert_eq!(rsp["allowed"], true);
        assert!(rsp.get("patch").is_none());

        let rsp = response(admission.admit(&req, Phase::Validate, now()));
        assert_eq!(rsp["allowed"], false);
        assert_eq!(rsp["status"]["code"], 403);
        assert_eq!(
            rsp["status"]["message"],
            pod_security::PRIVILEGE_ESCALATION_DENIED
        );
    }

    #[test]
    fn approves_pod_with_escalation_disabled() {
        let req = pod(json!({ "allowPrivilegeEscalation": false }));
        let rsp = response(Admission::new().admit(&req, Phase::Validate, now()));
        assert_eq!(rsp["allowed"], true);
    }

    #[test]
    fn rejects_unsupported_kinds() {
        let req = request(
            "apps",
            "v1",
            "Deployment",
            json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": { "name": "app", "namespace": "ns-0" },
                "spec": {},
            }),
        );
        let rsp = response(Admission::new().admit(&req, Phase::Validate, now()));
        assert_eq!(rsp["allowed"], false);
    }

    #[test]
    fn denies_unparseable_pod() {
        let req = request(
            "",
            "v1",
            "Pod",
            json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": { "name": "app", "namespace": "ns-0" },
                "spec": { "containers": "nope" },
            }),
        );
        let rsp = response(Admission::new().admit(&req, Phase::Validate, now()));
        assert_eq!(rsp["allowed"], false);
    }
}
