//! A fixed privilege-escalation rule for every pod admitted to the cluster.
//!
//! The platform treats an unset `allowPrivilegeEscalation` as `true`, so the
//! mutate step supplies an explicit `false` for containers that asked for
//! nothing either way. Containers that request elevated privilege (either
//! `privileged: true` or the `SYS_ADMIN` capability) are left alone and are
//! rejected by the validate step.
//!
//! Both steps share the predicates below: a container the mutate step
//! defaults always satisfies the validate step.

use crate::{Verdict, FORBIDDEN};
use json_patch::{jsonptr::PointerBuf, AddOperation, Patch, PatchOperation};
use serde_json::{json, Value};
use webapp_controller_k8s_api::{Container, PodSpec, SecurityContext};

pub const PRIVILEGE_ESCALATION_DENIED: &str =
    "privilege escalation is not allowed: containers must set securityContext.allowPrivilegeEscalation=false and must not be privileged";

const RAISED_CAPABILITY: &str = "SYS_ADMIN";

/// Defaults `allowPrivilegeEscalation` to `false` wherever it is safe to do so.
pub fn mutate(spec: &PodSpec) -> Verdict {
    let ops = containers(spec)
        .filter(|(_, _, c)| needs_default(c))
        .map(|(field, idx, c)| default_op(field, idx, c.security_context.as_ref()))
        .collect::<Vec<_>>();

    if ops.is_empty() {
        return Verdict::approve();
    }
    Verdict::Approve(Some(Patch(ops)))
}

/// Denies the pod if any container may escalate privileges.
///
/// This does not assume the mutate step has run.
pub fn validate(spec: &PodSpec) -> Verdict {
    if containers(spec).any(|(_, _, c)| may_escalate(c)) {
        return Verdict::Deny {
            code: FORBIDDEN,
            messages: vec![PRIVILEGE_ESCALATION_DENIED.to_string()],
        };
    }
    Verdict::approve()
}

/// True when the container made no explicit escalation choice and does not
/// request elevated privilege.
pub fn needs_default(c: &Container) -> bool {
    allow_privilege_escalation(c).is_none() && !is_privileged(c) && !raises_capability(c)
}

/// True when the container can escalate privileges, counting an unset
/// `allowPrivilegeEscalation` as `true`.
pub fn may_escalate(c: &Container) -> bool {
    allow_privilege_escalation(c).unwrap_or(true) || is_privileged(c)
}

fn allow_privilege_escalation(c: &Container) -> Option<bool> {
    c.security_context
        .as_ref()
        .and_then(|sc| sc.allow_privilege_escalation)
}

fn is_privileged(c: &Container) -> bool {
    c.security_context
        .as_ref()
        .and_then(|sc| sc.privileged)
        .unwrap_or(false)
}

fn raises_capability(c: &Container) -> bool {
    c.security_context
        .as_ref()
        .and_then(|sc| sc.capabilities.as_ref())
        .and_then(|caps| caps.add.as_ref())
        .into_iter()
        .flatten()
        .any(|cap| {
            let cap = cap.to_ascii_uppercase();
            cap.strip_prefix("CAP_").unwrap_or(&cap) == RAISED_CAPABILITY
        })
}

fn containers(spec: &PodSpec) -> impl Iterator<Item = (&'static str, usize, &Container)> {
    let init = spec
        .init_containers
        .iter()
        .flatten()
        .enumerate()
        .map(|(idx, c)| ("initContainers", idx, c));
    let main = spec
        .containers
        .iter()
        .enumerate()
        .map(|(idx, c)| ("containers", idx, c));
    init.chain(main)
}

fn default_op(field: &str, idx: usize, sc: Option<&SecurityContext>) -> PatchOperation {
    let idx = idx.to_string();
    match sc {
        Some(_) => PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens([
                "spec",
                field,
                idx.as_str(),
                "securityContext",
                "allowPrivilegeEscalation",
            ]),
            value: Value::Bool(false),
        }),
        None => PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["spec", field, idx.as_str(), "securityContext"]),
            value: json!({ "allowPrivilegeEscalation": false }),
        }),
    }
}
