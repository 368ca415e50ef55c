//! Investment deal negotiation
//!
//! Interest → Qualified → PendingCreator → {Approved, CreatorRejected} →
//! TermSheet → Signed → Escrow → FundsReleased → Completed, with
//! Withdrawn reachable while the investor still can back out and Failed
//! for investors who do not pass qualification.

use serde_json::{json, Value};

use dealflow_durable::{StateSpec, StepFailure, Transition, WorkflowDefinition};

use crate::collaborators::Collaborators;

pub const KIND: &str = "investment_deal";

/// Non-accredited investors are capped below this amount
const ACCREDITATION_THRESHOLD: f64 = 25_000.0;

fn amount_of(input: &Value) -> f64 {
    input.get("amount").and_then(|v| v.as_f64()).unwrap_or(0.0)
}

pub fn definition(collaborators: &Collaborators) -> WorkflowDefinition {
    let notifier = collaborators.notifier.clone();

    WorkflowDefinition::builder(KIND, "v1")
        .initial("Interest")
        .validate_input(|input| {
            if amount_of(input) <= 0.0 {
                return Err(StepFailure::validation(
                    "investment amount must be a positive number",
                ));
            }
            Ok(())
        })
        .event_with("qualify", |payload| {
            payload
                .get("qualified")
                .and_then(|v| v.as_bool())
                .map(|_| ())
                .ok_or_else(|| StepFailure::validation("qualify requires a boolean `qualified`"))
        })
        .event_with("creator_decision", |payload| {
            payload
                .get("decision")
                .and_then(|v| v.as_str())
                .map(|_| ())
                .ok_or_else(|| {
                    StepFailure::validation("creator_decision requires a string `decision`")
                })
        })
        .event("term_sheet_signed")
        .event_with("payment_received", |payload| {
            payload
                .get("amount")
                .and_then(|v| v.as_f64())
                .map(|_| ())
                .ok_or_else(|| {
                    StepFailure::validation("payment_received requires a numeric `amount`")
                })
        })
        .event("funds_released")
        .event("withdraw")
        .state(
            StateSpec::new("Interest")
                .guard(|input| {
                    let accredited = input
                        .get("accredited")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    if !accredited && amount_of(input) >= ACCREDITATION_THRESHOLD {
                        return Err(StepFailure::guard(format!(
                            "non-accredited investors are capped below {ACCREDITATION_THRESHOLD}"
                        )));
                    }
                    Ok(())
                })
                .on_enter({
                    let notifier = notifier.clone();
                    move |ctx| {
                        let notifier = notifier.clone();
                        async move {
                            let instance = ctx.instance_id();
                            let amount = amount_of(ctx.input());
                            ctx.record_external_call();
                            ctx.run_step(
                                "record_interest",
                                json!({ "amount": amount }),
                                |input| {
                                    let notifier = notifier.clone();
                                    async move {
                                        notifier
                                            .notify(
                                                &format!("{instance}:record_interest"),
                                                "creator",
                                                "New investment interest",
                                                input,
                                            )
                                            .await
                                    }
                                },
                            )
                            .await?;

                            let (event, payload) =
                                ctx.wait_for_any(&["qualify", "withdraw"], None).await?;
                            match event.as_str() {
                                "withdraw" => Ok(Transition::go("Withdrawn")),
                                _ => {
                                    let qualified = payload
                                        .get("qualified")
                                        .and_then(|v| v.as_bool())
                                        .unwrap_or(false);
                                    if qualified {
                                        Ok(Transition::go("Qualified"))
                                    } else {
                                        Ok(Transition::go("Failed"))
                                    }
                                }
                            }
                        }
                    }
                }),
        )
        .state(StateSpec::new("Qualified").on_enter({
            let notifier = notifier.clone();
            move |ctx| {
                let notifier = notifier.clone();
                async move {
                    let instance = ctx.instance_id();
                    ctx.record_external_call();
                    ctx.run_step("open_creator_review", json!({}), |input| {
                        let notifier = notifier.clone();
                        async move {
                            notifier
                                .notify(
                                    &format!("{instance}:open_creator_review"),
                                    "creator",
                                    "Qualified investor awaits your decision",
                                    input,
                                )
                                .await
                        }
                    })
                    .await?;
                    Ok(Transition::go("PendingCreator"))
                }
            }
        }))
        .state(StateSpec::new("PendingCreator").on_enter(|ctx| async move {
            let (event, payload) = ctx
                .wait_for_any(&["creator_decision", "withdraw"], None)
                .await?;
            match event.as_str() {
                "withdraw" => Ok(Transition::go("Withdrawn")),
                _ => match payload.get("decision").and_then(|v| v.as_str()) {
                    Some("approve") | Some("approved") => Ok(Transition::go("Approved")),
                    _ => Ok(Transition::go("CreatorRejected")),
                },
            }
        }))
        .state(StateSpec::new("Approved").on_enter({
            let notifier = notifier.clone();
            move |ctx| {
                let notifier = notifier.clone();
                async move {
                    let instance = ctx.instance_id();
                    let amount = amount_of(ctx.input());
                    ctx.record_external_call();
                    ctx.run_step(
                        "prepare_term_sheet",
                        json!({ "amount": amount }),
                        |input| {
                            let notifier = notifier.clone();
                            async move {
                                notifier
                                    .notify(
                                        &format!("{instance}:prepare_term_sheet"),
                                        "investor",
                                        "Term sheet ready for signature",
                                        input,
                                    )
                                    .await
                            }
                        },
                    )
                    .await?;
                    Ok(Transition::go("TermSheet"))
                }
            }
        }))
        .state(StateSpec::new("TermSheet").on_enter(|ctx| async move {
            let (event, _payload) = ctx
                .wait_for_any(&["term_sheet_signed", "withdraw"], None)
                .await?;
            match event.as_str() {
                "withdraw" => Ok(Transition::go("Withdrawn")),
                _ => Ok(Transition::go("Signed")),
            }
        }))
        .state(StateSpec::new("Signed").on_enter({
            let notifier = notifier.clone();
            move |ctx| {
                let notifier = notifier.clone();
                async move {
                    let instance = ctx.instance_id();
                    let amount = amount_of(ctx.input());
                    ctx.record_external_call();
                    ctx.run_step("open_escrow", json!({ "amount": amount }), |input| {
                        let notifier = notifier.clone();
                        async move {
                            notifier
                                .notify(
                                    &format!("{instance}:open_escrow"),
                                    "investor",
                                    "Escrow account opened, awaiting payment",
                                    input,
                                )
                                .await
                        }
                    })
                    .await?;
                    Ok(Transition::go("Escrow"))
                }
            }
        }))
        .state(
            StateSpec::new("Escrow")
                .on_enter(|ctx| async move {
                    let expected = amount_of(ctx.input());
                    let payload = ctx.wait_for_event("payment_received", None, None).await?;
                    let received = payload
                        .get("amount")
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.0);
                    if received < expected {
                        return Ok(Transition::Fail(StepFailure::validation(format!(
                            "escrow received {received}, expected {expected}"
                        ))));
                    }
                    Ok(Transition::go("FundsReleased"))
                })
                .compensate({
                    let notifier = notifier.clone();
                    move |ctx| {
                        let notifier = notifier.clone();
                        async move {
                            let instance = ctx.instance_id();
                            ctx.record_external_call();
                            ctx.run_step("refund_escrow", json!({}), |input| {
                                let notifier = notifier.clone();
                                async move {
                                    notifier
                                        .notify(
                                            &format!("{instance}:refund_escrow"),
                                            "investor",
                                            "Escrow refunded",
                                            input,
                                        )
                                        .await
                                }
                            })
                            .await?;
                            Ok(())
                        }
                    }
                }),
        )
        .state(StateSpec::new("FundsReleased").on_enter(|ctx| async move {
            ctx.wait_for_event("funds_released", None, None).await?;
            Ok(Transition::go("Completed"))
        }))
        .state(StateSpec::terminal("Completed").on_enter(|ctx| async move {
            Ok(Transition::Complete(json!({
                "finalState": "FundsReleased",
                "amount": amount_of(ctx.input()),
            })))
        }))
        .state(StateSpec::terminal("Withdrawn"))
        .state(StateSpec::terminal("CreatorRejected"))
        .state(StateSpec::new("Failed").on_enter(|_ctx| async move {
            Ok(Transition::Fail(StepFailure::validation(
                "investor did not pass qualification",
            )))
        }))
        .build()
        .expect("investment deal definition is well-formed")
}
