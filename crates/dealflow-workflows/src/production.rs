//! Production deal negotiation
//!
//! Interest → Meeting → Proposal → Negotiation → Contract → Production →
//! Completed, with Rejected and Withdrawn reachable along the way.
//! Negotiation carries a timeout back to Rejected so deals cannot stall
//! forever.

use std::time::Duration;

use serde_json::json;

use dealflow_durable::{StateSpec, Transition, WorkflowDefinition};

use crate::collaborators::Collaborators;

pub const KIND: &str = "production_deal";

/// Stalled negotiations lapse after this long
const NEGOTIATION_WINDOW: Duration = Duration::from_secs(30 * 24 * 3600);

pub fn definition(collaborators: &Collaborators) -> WorkflowDefinition {
    let notifier = collaborators.notifier.clone();

    WorkflowDefinition::builder(KIND, "v1")
        .initial("Interest")
        .event("meeting_scheduled")
        .event("proposal_submitted")
        .event("terms_agreed")
        .event("contract_signed")
        .event("production_complete")
        .event("reject")
        .event("withdraw")
        .state(StateSpec::new("Interest").on_enter({
            let notifier = notifier.clone();
            move |ctx| {
                let notifier = notifier.clone();
                async move {
                    let instance = ctx.instance_id();
                    ctx.record_external_call();
                    ctx.run_step("notify_producer", json!({}), |input| {
                        let notifier = notifier.clone();
                        async move {
                            notifier
                                .notify(
                                    &format!("{instance}:notify_producer"),
                                    "producer",
                                    "A creator wants to talk production",
                                    input,
                                )
                                .await
                        }
                    })
                    .await?;

                    let (event, _) = ctx
                        .wait_for_any(&["meeting_scheduled", "reject", "withdraw"], None)
                        .await?;
                    Ok(match event.as_str() {
                        "reject" => Transition::go("Rejected"),
                        "withdraw" => Transition::go("Withdrawn"),
                        _ => Transition::go("Meeting"),
                    })
                }
            }
        }))
        .state(StateSpec::new("Meeting").on_enter(|ctx| async move {
            let (event, _) = ctx
                .wait_for_any(&["proposal_submitted", "reject", "withdraw"], None)
                .await?;
            Ok(match event.as_str() {
                "reject" => Transition::go("Rejected"),
                "withdraw" => Transition::go("Withdrawn"),
                _ => Transition::go("Proposal"),
            })
        }))
        .state(StateSpec::new("Proposal").on_enter({
            let notifier = notifier.clone();
            move |ctx| {
                let notifier = notifier.clone();
                async move {
                    let instance = ctx.instance_id();
                    ctx.record_external_call();
                    ctx.run_step("circulate_proposal", json!({}), |input| {
                        let notifier = notifier.clone();
                        async move {
                            notifier
                                .notify(
                                    &format!("{instance}:circulate_proposal"),
                                    "creator",
                                    "Proposal circulated to all parties",
                                    input,
                                )
                                .await
                        }
                    })
                    .await?;
                    Ok(Transition::go("Negotiation"))
                }
            }
        }))
        .state(
            StateSpec::new("Negotiation")
                .timeout(NEGOTIATION_WINDOW, "Rejected")
                .on_enter(|ctx| async move {
                    let (event, _) = ctx
                        .wait_for_any(&["terms_agreed", "reject", "withdraw"], None)
                        .await?;
                    Ok(match event.as_str() {
                        "reject" => Transition::go("Rejected"),
                        "withdraw" => Transition::go("Withdrawn"),
                        _ => Transition::go("Contract"),
                    })
                }),
        )
        .state(StateSpec::new("Contract").on_enter(|ctx| async move {
            let (event, _) = ctx
                .wait_for_any(&["contract_signed", "withdraw"], None)
                .await?;
            Ok(match event.as_str() {
                "withdraw" => Transition::go("Withdrawn"),
                _ => Transition::go("Production"),
            })
        }))
        .state(StateSpec::new("Production").on_enter(|ctx| async move {
            ctx.wait_for_event("production_complete", None, None).await?;
            Ok(Transition::go("Completed"))
        }))
        .state(StateSpec::terminal("Completed"))
        .state(StateSpec::terminal("Rejected"))
        .state(StateSpec::terminal("Withdrawn"))
        .build()
        .expect("production deal definition is well-formed")
}
