//! Media publishing pipeline
//!
//! Validated → VisualAssets → Transcoded → Manifests → Optimised →
//! Published → CdnConfigured → AnalyticsWired → Finalised. Every state
//! orchestrates one operation against the media processor; the engine
//! never touches media bytes. Publishing carries its own tight retry
//! budget, and failures after the publish step unpublish on the way out.

use std::time::Duration;

use serde_json::{json, Value};

use dealflow_durable::{
    RetryPolicy, StateSpec, StepFailure, StepOptions, Transition, WorkflowDefinition,
};

use crate::collaborators::{Collaborators, MediaProcessor};
use std::sync::Arc;

pub const KIND: &str = "media_publishing";

fn media_id_of(input: &Value) -> String {
    input
        .get("mediaId")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string()
}

/// A state that performs one pipeline operation and moves on
fn pipeline_state(
    name: &str,
    operation: &'static str,
    next: &'static str,
    media: Arc<dyn MediaProcessor>,
    options: StepOptions,
) -> StateSpec {
    StateSpec::new(name).on_enter(move |ctx| {
        let media = media.clone();
        let options = options.clone();
        async move {
            let instance = ctx.instance_id();
            let media_id = media_id_of(ctx.input());
            ctx.record_external_call();
            ctx.run_step_opts(
                operation,
                json!({ "mediaId": media_id }),
                options,
                |input| {
                    let media = media.clone();
                    async move {
                        media
                            .perform(&format!("{instance}:{operation}"), operation, input)
                            .await
                    }
                },
            )
            .await?;
            Ok(Transition::go(next))
        }
    })
}

pub fn definition(collaborators: &Collaborators) -> WorkflowDefinition {
    let media = collaborators.media.clone();
    let default_options = StepOptions::default();

    // Publishing talks to the outside world; keep its budget tight so a
    // broken upstream surfaces quickly instead of retrying for an hour
    let publish_options = StepOptions::with_retry(
        RetryPolicy::fixed(Duration::from_secs(5), 3),
    );

    let unpublish_compensation = {
        let media = media.clone();
        move |ctx: dealflow_durable::StepContext| {
            let media = media.clone();
            async move {
                let instance = ctx.instance_id();
                let media_id = media_id_of(ctx.input());
                ctx.record_external_call();
                ctx.run_step("unpublish_media", json!({ "mediaId": media_id }), |input| {
                    let media = media.clone();
                    async move {
                        media
                            .perform(
                                &format!("{instance}:unpublish_media"),
                                "unpublish_media",
                                input,
                            )
                            .await
                    }
                })
                .await?;
                Ok(())
            }
        }
    };

    WorkflowDefinition::builder(KIND, "v1")
        .initial("Validated")
        .retry(RetryPolicy::new(5))
        .validate_input(|input| {
            input
                .get("mediaId")
                .and_then(|v| v.as_str())
                .map(|_| ())
                .ok_or_else(|| StepFailure::validation("mediaId is required"))
        })
        .state(pipeline_state(
            "Validated",
            "validate_source",
            "VisualAssets",
            media.clone(),
            default_options.clone(),
        ))
        .state(pipeline_state(
            "VisualAssets",
            "generate_visual_assets",
            "Transcoded",
            media.clone(),
            default_options.clone(),
        ))
        .state(pipeline_state(
            "Transcoded",
            "transcode_renditions",
            "Manifests",
            media.clone(),
            default_options.clone(),
        ))
        .state(pipeline_state(
            "Manifests",
            "write_manifests",
            "Optimised",
            media.clone(),
            default_options.clone(),
        ))
        .state(pipeline_state(
            "Optimised",
            "optimise_delivery",
            "Published",
            media.clone(),
            default_options.clone(),
        ))
        .state(
            pipeline_state(
                "Published",
                "publish_media",
                "CdnConfigured",
                media.clone(),
                publish_options,
            )
            .compensate(unpublish_compensation.clone()),
        )
        .state(
            pipeline_state(
                "CdnConfigured",
                "configure_cdn",
                "AnalyticsWired",
                media.clone(),
                default_options.clone(),
            )
            .compensate(unpublish_compensation.clone()),
        )
        .state(
            pipeline_state(
                "AnalyticsWired",
                "wire_analytics",
                "Finalised",
                media.clone(),
                default_options,
            )
            .compensate(unpublish_compensation),
        )
        .state(StateSpec::terminal("Finalised").on_enter(|ctx| async move {
            Ok(Transition::Complete(json!({
                "finalState": "Finalised",
                "mediaId": media_id_of(ctx.input()),
            })))
        }))
        .build()
        .expect("media publishing definition is well-formed")
}
