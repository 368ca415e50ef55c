//! NDA issuance
//!
//! Pending → RiskAssessment → Review → {Approved, Rejected} → Signed →
//! AccessGranted → Expired. The document self-destructs: an unsigned NDA
//! lapses after the configured expiry, and granted access is revoked (or
//! lapses) on the same clock.

use std::time::Duration;

use serde_json::{json, Value};

use dealflow_durable::{StateSpec, StepFailure, Transition, WorkflowDefinition};

use crate::collaborators::Collaborators;

pub const KIND: &str = "nda";

const DEFAULT_EXPIRY_DAYS: u64 = 30;

fn expiry_of(input: &Value) -> Duration {
    let days = input
        .get("expiryDays")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_EXPIRY_DAYS);
    Duration::from_secs(days * 24 * 3600)
}

fn reviewers_of(input: &Value) -> Vec<String> {
    input
        .get("reviewers")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_else(|| vec!["legal".to_string()])
}

pub fn definition(collaborators: &Collaborators) -> WorkflowDefinition {
    let notifier = collaborators.notifier.clone();
    let media = collaborators.media.clone();

    WorkflowDefinition::builder(KIND, "v1")
        .initial("Pending")
        .event_with("risk_assessed", |payload| {
            payload
                .get("riskLevel")
                .and_then(|v| v.as_str())
                .map(|_| ())
                .ok_or_else(|| StepFailure::validation("risk_assessed requires `riskLevel`"))
        })
        .event("review_complete")
        .event("document_signed")
        .event("access_revoked")
        .state(StateSpec::new("Pending").on_enter({
            let notifier = notifier.clone();
            move |ctx| {
                let notifier = notifier.clone();
                async move {
                    let instance = ctx.instance_id();
                    ctx.record_external_call();
                    ctx.run_step("log_request", json!({}), |input| {
                        let notifier = notifier.clone();
                        async move {
                            notifier
                                .notify(
                                    &format!("{instance}:log_request"),
                                    "owner",
                                    "NDA requested for your pitch",
                                    input,
                                )
                                .await
                        }
                    })
                    .await?;
                    Ok(Transition::go("RiskAssessment"))
                }
            }
        }))
        .state(StateSpec::new("RiskAssessment").on_enter(|ctx| async move {
            let payload = ctx.wait_for_event("risk_assessed", None, None).await?;
            match payload.get("riskLevel").and_then(|v| v.as_str()) {
                Some("low") | Some("medium") | Some("high") => Ok(Transition::go("Review")),
                other => Ok(Transition::Fail(StepFailure::validation(format!(
                    "unknown risk level {other:?}"
                )))),
            }
        }))
        .state(StateSpec::new("Review").on_enter(|ctx| async move {
            let reviewers = reviewers_of(ctx.input());
            let outcome = ctx
                .wait_for_approval("review_complete", "nda-review", reviewers, None)
                .await?;
            if outcome.approved {
                Ok(Transition::go("Approved"))
            } else {
                Ok(Transition::go("Rejected"))
            }
        }))
        .state(StateSpec::new("Approved").on_enter({
            let media = media.clone();
            move |ctx| {
                let media = media.clone();
                async move {
                    let instance = ctx.instance_id();
                    ctx.record_external_call();
                    ctx.run_step("prepare_document", json!({}), |input| {
                        let media = media.clone();
                        async move {
                            media
                                .perform(
                                    &format!("{instance}:prepare_document"),
                                    "render_nda",
                                    input,
                                )
                                .await
                        }
                    })
                    .await?;
                    Ok(Transition::go("Signed"))
                }
            }
        }))
        .state(StateSpec::new("Signed").on_enter(|ctx| async move {
            let expiry = expiry_of(ctx.input());
            match ctx
                .wait_for_event("document_signed", None, Some(expiry))
                .await
            {
                Ok(_) => Ok(Transition::go("AccessGranted")),
                Err(interrupt) if interrupt.is_timeout() => Ok(Transition::go("Expired")),
                Err(other) => Err(other),
            }
        }))
        .state(StateSpec::new("AccessGranted").on_enter({
            let notifier = notifier.clone();
            move |ctx| {
                let notifier = notifier.clone();
                async move {
                    let instance = ctx.instance_id();
                    ctx.record_external_call();
                    ctx.run_step("grant_access", json!({}), |input| {
                        let notifier = notifier.clone();
                        async move {
                            notifier
                                .notify(
                                    &format!("{instance}:grant_access"),
                                    "requester",
                                    "Pitch access granted under NDA",
                                    input,
                                )
                                .await
                        }
                    })
                    .await?;

                    // Access lapses on the NDA clock or on explicit revocation
                    let expiry = expiry_of(ctx.input());
                    match ctx
                        .wait_for_event("access_revoked", None, Some(expiry))
                        .await
                    {
                        Ok(_) => Ok(Transition::go("Expired")),
                        Err(interrupt) if interrupt.is_timeout() => {
                            Ok(Transition::go("Expired"))
                        }
                        Err(other) => Err(other),
                    }
                }
            }
        }))
        .state(StateSpec::terminal("Expired"))
        .state(StateSpec::terminal("Rejected"))
        .build()
        .expect("nda definition is well-formed")
}
