//! Multi-step AI analysis with human-in-the-loop review
//!
//! DataCollection → ContentAnalysis → Analysis (parallel fan-out over the
//! enabled dimensions) → Synthesis → HumanReview (optional) →
//! ReportGeneration → Completed. The fan-out runs cooperatively inside
//! the instance's worker slot; cancelling the instance cancels every
//! branch at its next suspension point.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use dealflow_durable::{ParallelBranch, StateSpec, StepContext, Transition, WorkflowDefinition};

use crate::collaborators::{AnalysisProvider, Collaborators};

pub const KIND: &str = "ai_analysis";

/// Reviewers have a week before the gate auto-passes unreviewed
const REVIEW_WINDOW: Duration = Duration::from_secs(7 * 24 * 3600);

/// (input flag, dimension) pairs in fan-out order
const DIMENSIONS: &[(&str, &str)] = &[
    ("includeMarketAnalysis", "market_analysis"),
    ("includeFinancialAnalysis", "financial_analysis"),
    ("includeTeamAnalysis", "team_analysis"),
    ("includeSentimentAnalysis", "sentiment_analysis"),
    ("includeCompetitorAnalysis", "competitor_analysis"),
    ("includeRiskAssessment", "risk_assessment"),
];

fn enabled_dimensions(input: &Value) -> Vec<&'static str> {
    DIMENSIONS
        .iter()
        .filter(|(flag, _)| input.get(*flag).and_then(|v| v.as_bool()).unwrap_or(false))
        .map(|(_, dimension)| *dimension)
        .collect()
}

fn wants_human_review(input: &Value) -> bool {
    input
        .get("requireHumanReview")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// One fan-out branch: a single memoized analysis step
fn analysis_branch(analyst: Arc<dyn AnalysisProvider>, dimension: &'static str) -> ParallelBranch {
    ParallelBranch::new(dimension, move |ctx: StepContext| async move {
        let instance = ctx.instance_id();
        ctx.record_external_call();
        ctx.run_step(dimension, json!({}), |input| {
            let analyst = analyst.clone();
            async move {
                analyst
                    .analyse(&format!("{instance}:{dimension}"), dimension, input)
                    .await
            }
        })
        .await
    })
}

pub fn definition(collaborators: &Collaborators) -> WorkflowDefinition {
    let analyst = collaborators.analyst.clone();
    let notifier = collaborators.notifier.clone();
    let media = collaborators.media.clone();

    WorkflowDefinition::builder(KIND, "v1")
        .initial("DataCollection")
        .event("human_review")
        .state(StateSpec::new("DataCollection").on_enter({
            let analyst = analyst.clone();
            move |ctx| {
                let analyst = analyst.clone();
                async move {
                    let instance = ctx.instance_id();
                    ctx.record_external_call();
                    ctx.run_step("collect_data", json!({}), |input| {
                        let analyst = analyst.clone();
                        async move {
                            analyst
                                .analyse(
                                    &format!("{instance}:collect_data"),
                                    "data_collection",
                                    input,
                                )
                                .await
                        }
                    })
                    .await?;
                    Ok(Transition::go("ContentAnalysis"))
                }
            }
        }))
        .state(StateSpec::new("ContentAnalysis").on_enter({
            let analyst = analyst.clone();
            move |ctx| {
                let analyst = analyst.clone();
                async move {
                    let instance = ctx.instance_id();
                    ctx.record_external_call();
                    ctx.run_step("analyse_content", json!({}), |input| {
                        let analyst = analyst.clone();
                        async move {
                            analyst
                                .analyse(
                                    &format!("{instance}:analyse_content"),
                                    "content_analysis",
                                    input,
                                )
                                .await
                        }
                    })
                    .await?;
                    Ok(Transition::go("Analysis"))
                }
            }
        }))
        .state(
            StateSpec::new("Analysis")
                .on_enter({
                    let analyst = analyst.clone();
                    move |ctx| {
                        let analyst = analyst.clone();
                        async move {
                            let dimensions = enabled_dimensions(ctx.input());
                            if dimensions.is_empty() {
                                return Ok(Transition::go("Synthesis"));
                            }

                            let branches = dimensions
                                .into_iter()
                                .map(|dimension| analysis_branch(analyst.clone(), dimension))
                                .collect();
                            ctx.parallel("dimensions", branches).await?;
                            Ok(Transition::go("Synthesis"))
                        }
                    }
                })
                .compensate({
                    let notifier = notifier.clone();
                    move |ctx| {
                        let notifier = notifier.clone();
                        async move {
                            let instance = ctx.instance_id();
                            ctx.record_external_call();
                            ctx.run_step("discard_partial_results", json!({}), |input| {
                                let notifier = notifier.clone();
                                async move {
                                    notifier
                                        .notify(
                                            &format!("{instance}:discard_partial_results"),
                                            "requester",
                                            "Analysis aborted, partial results discarded",
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
        .state(StateSpec::new("Synthesis").on_enter({
            let analyst = analyst.clone();
            move |ctx| {
                let analyst = analyst.clone();
                async move {
                    let instance = ctx.instance_id();
                    ctx.record_external_call();
                    ctx.run_step("synthesise", json!({}), |input| {
                        let analyst = analyst.clone();
                        async move {
                            analyst
                                .analyse(&format!("{instance}:synthesise"), "synthesis", input)
                                .await
                        }
                    })
                    .await?;

                    if wants_human_review(ctx.input()) {
                        Ok(Transition::go("HumanReview"))
                    } else {
                        Ok(Transition::go("ReportGeneration"))
                    }
                }
            }
        }))
        .state(StateSpec::new("HumanReview").on_enter(|ctx| async move {
            let reviewers = ctx
                .input()
                .get("reviewers")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_else(|| vec!["analyst-team".to_string()]);

            match ctx
                .wait_for_approval(
                    "human_review",
                    "analysis-review",
                    reviewers,
                    Some(REVIEW_WINDOW),
                )
                .await
            {
                Ok(outcome) if outcome.approved => Ok(Transition::go("ReportGeneration")),
                // Rejected work goes back for another synthesis pass
                Ok(_) => Ok(Transition::go("Synthesis")),
                // An unanswered gate does not block the report forever
                Err(interrupt) if interrupt.is_timeout() => {
                    Ok(Transition::go("ReportGeneration"))
                }
                Err(other) => Err(other),
            }
        }))
        .state(StateSpec::new("ReportGeneration").on_enter({
            let media = media.clone();
            move |ctx| {
                let media = media.clone();
                async move {
                    let instance = ctx.instance_id();
                    ctx.record_external_call();
                    ctx.run_step("generate_report", json!({}), |input| {
                        let media = media.clone();
                        async move {
                            media
                                .perform(
                                    &format!("{instance}:generate_report"),
                                    "render_report",
                                    input,
                                )
                                .await
                        }
                    })
                    .await?;
                    Ok(Transition::go("Completed"))
                }
            }
        }))
        .state(StateSpec::terminal("Completed"))
        .build()
        .expect("ai analysis definition is well-formed")
}
