//! Admission rules for `WebApp` instances.
//!
//! While an instance's last condition is `Pending`, both steps pass the
//! request through untouched so that admission never races an in-flight
//! reconciliation (or rejects a periodic re-apply from the sync tool).

use crate::{Ledger, Verdict, UNPROCESSABLE_ENTITY};
use chrono::{DateTime, SecondsFormat, Utc};
use json_patch::{jsonptr::PointerBuf, AddOperation, Patch, PatchOperation};
use serde_json::Value;
use webapp_controller_k8s_api::{DynamicObject, Language, Theme, LAST_ADMITTED_ANNOTATION};

pub const INVALID_LANGUAGE: &str = "spec.language must be one of: english, spanish";
pub const INVALID_REPLICAS: &str = "spec.replicas must be an integer of at least 1";
pub const INVALID_THEME: &str = "spec.theme must be one of: dark, light";

/// Stamps the admission-timestamp annotation onto the instance.
///
/// Only `metadata.annotations` is ever touched.
pub fn mutate(obj: &DynamicObject, now: DateTime<Utc>) -> Verdict {
    if ledger(obj).is_pending() {
        return Verdict::approve();
    }

    let mut ops = Vec::with_capacity(2);
    if obj.metadata.annotations.is_none() {
        ops.push(PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["metadata", "annotations"]),
            value: Value::Object(Default::default()),
        }));
    }
    ops.push(PatchOperation::Add(AddOperation {
        path: PointerBuf::from_tokens(["metadata", "annotations", LAST_ADMITTED_ANNOTATION]),
        value: Value::String(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
    }));

    Verdict::Approve(Some(Patch(ops)))
}

/// Checks every spec field and reports all violations at once.
pub fn validate(obj: &DynamicObject) -> Verdict {
    if ledger(obj).is_pending() {
        return Verdict::approve();
    }

    let messages = violations(obj.data.get("spec"));
    if messages.is_empty() {
        return Verdict::approve();
    }
    Verdict::Deny {
        code: UNPROCESSABLE_ENTITY,
        messages,
    }
}

/// Returns one message per violated field rule, in field order.
///
/// The spec is inspected as raw JSON so that an unknown enum value is
/// reported alongside any other problem instead of failing deserialization.
pub fn violations(spec: Option<&Value>) -> Vec<String> {
    let field = |name: &str| spec.and_then(|s| s.get(name));
    let mut messages = Vec::new();

    let language = field("language")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<Language>().ok());
    if language.is_none() {
        messages.push(INVALID_LANGUAGE.to_string());
    }

    let replicas = field("replicas").and_then(Value::as_i64);
    if !matches!(replicas, Some(n) if n >= 1) {
        messages.push(INVALID_REPLICAS.to_string());
    }

    let theme = field("theme")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<Theme>().ok());
    if theme.is_none() {
        messages.push(INVALID_THEME.to_string());
    }

    messages
}

fn ledger(obj: &DynamicObject) -> Ledger {
    Ledger::from_json(obj.data.get("status"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn webapp(spec: Value, status: Option<Value>) -> DynamicObject {
        let mut obj = json!({
            "apiVersion": "webapp.example.com/v1",
            "kind": "WebApp",
            "metadata": { "namespace": "ns-0", "name": "app" },
            "spec": spec,
        });
        if let Some(status) = status {
            obj["status"] = status;
        }
        serde_json::from_value(obj).expect("valid object")
    }

    fn status_of(status: &str) -> Value {
        json!({
            "conditions": [{
                "status": status,
                "reason": "Processing",
                "observedGeneration": 1,
                "lastTransitionTime": "2024-01-01T00:00:00Z",
            }]
        })
    }

    fn now() -> DateTime<Utc> {
        "2024-05-06T07:08:09Z".parse().unwrap()
    }

    #[test]
    fn valid_spec_is_approved() {
        let obj = webapp(
            json!({ "language": "english", "replicas": 1, "theme": "light" }),
            None,
        );
        assert_eq!(validate(&obj), Verdict::approve());
    }

    #[test]
    fn every_violation_is_reported() {
        let obj = webapp(
            json!({ "language": "french", "replicas": 0, "theme": "blue" }),
            None,
        );
        assert_eq!(
            validate(&obj),
            Verdict::Deny {
                code: 422,
                messages: vec![
                    INVALID_LANGUAGE.to_string(),
                    INVALID_REPLICAS.to_string(),
                    INVALID_THEME.to_string(),
                ],
            }
        );
    }

    #[test]
    fn single_violation_is_reported_alone() {
        let obj = webapp(
            json!({ "language": "spanish", "replicas": -3, "theme": "dark" }),
            Some(status_of("Ready")),
        );
        assert_eq!(
            validate(&obj),
            Verdict::Deny {
                code: 422,
                messages: vec![INVALID_REPLICAS.to_string()],
            }
        );
    }

    #[test]
    fn missing_and_mistyped_fields_are_violations() {
        assert_eq!(violations(None).len(), 3);
        assert_eq!(
            violations(Some(&json!({ "language": 7, "replicas": "2", "theme": "dark" }))),
            vec![INVALID_LANGUAGE.to_string(), INVALID_REPLICAS.to_string()]
        );
        assert_eq!(
            violations(Some(&json!({ "language": "english", "replicas": 1.5, "theme": "light" }))),
            vec![INVALID_REPLICAS.to_string()]
        );
    }

    #[test]
    fn pending_instances_pass_through() {
        let obj = webapp(
            json!({ "language": "klingon", "replicas": 0, "theme": "neon" }),
            Some(status_of("Pending")),
        );
        assert_eq!(validate(&obj), Verdict::approve());
        assert_eq!(mutate(&obj, now()), Verdict::approve());
    }

    #[test]
    fn failed_instances_are_validated() {
        let obj = webapp(
            json!({ "language": "klingon", "replicas": 2, "theme": "dark" }),
            Some(status_of("Failed")),
        );
        assert!(!validate(&obj).is_allowed());
    }

    #[test]
    fn mutate_creates_annotations() {
        let obj = webapp(
            json!({ "language": "english", "replicas": 1, "theme": "light" }),
            None,
        );
        let verdict = mutate(&obj, now());
        let patch = serde_json::to_value(verdict.patch().expect("patch")).unwrap();
        assert_eq!(
            patch,
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
    fn mutate_refreshes_existing_annotation() {
        let mut obj = webapp(
            json!({ "language": "english", "replicas": 1, "theme": "light" }),
            Some(status_of("Ready")),
        );
        obj.metadata.annotations = Some(btreemap! {
            LAST_ADMITTED_ANNOTATION.to_string() => "2020-01-01T00:00:00Z".to_string(),
        });

        let patch = mutate(&obj, now()).patch().cloned().expect("patch");
        let mut doc = serde_json::to_value(&obj).unwrap();
        let spec = doc["spec"].clone();
        let status = doc["status"].clone();
        json_patch::patch(&mut doc, &patch.0).unwrap();

        assert_eq!(
            doc["metadata"]["annotations"][LAST_ADMITTED_ANNOTATION],
            "2024-05-06T07:08:09Z"
        );
        assert_eq!(doc["spec"], spec);
        assert_eq!(doc["status"], status);
    }

    #[test]
    fn mutate_does_not_depend_on_spec_validity() {
        let obj = webapp(json!({ "language": "french" }), None);
        assert!(mutate(&obj, now()).patch().is_some());
    }
}
