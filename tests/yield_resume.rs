//! Yield / resume protocol scenarios

mod common;

use common::{create_request, drive_to_settlement, fixture, MockResponse};
use serde_json::json;
use orka::{
    EngineEvent, ExecutionStatus, Plan, PlanStep, SegmentOutcome, StepStatus, ToolCategory,
    ToolDescriptor, ToolSchema, YieldReason,
};

fn slow_chain(len: usize) -> Plan {
    let mut steps = Vec::new();
    for i in 0..len {
        let mut step = PlanStep::new(
            format!("step-{}", i),
            "lookup_menu",
            json!({"restaurantId": "R1"}),
        );
        if i > 0 {
            step = step.after(format!("step-{}", i - 1));
        }
        steps.push(step);
    }
    Plan::new(steps)
}

#[tokio::test]
async fn long_plan_spans_multiple_segments() {
    let mut fix = fixture();
    for _ in 0..10 {
        fix.invoker
            .script("lookup_menu", MockResponse::ok(json!({"menu": []})).slow(60));
    }

    let id = fix
        .engine
        .create_execution(create_request(slow_chain(10)))
        .await
        .unwrap();

    let first = fix.engine.run_segment(id, "trace-1").await.unwrap();
    let yielded = matches!(first, SegmentOutcome::Yielded { .. });
    assert!(yielded, "expected a yield, got {:?}", first);

    // The checkpoint recorded progress and the upcoming segment number.
    let (record, _) = fix.engine.store().load(id).await.unwrap();
    let checkpoint = record.checkpoint.clone().unwrap();
    assert!(checkpoint.next_step_index > 0);
    assert!(checkpoint.next_step_index < 10);
    assert_eq!(checkpoint.reason, YieldReason::TimeoutApproaching);
    assert_eq!(record.segment_number, 1);
    assert!(!record.tool_versions.is_empty());
    let completed_so_far = record.count_with_status(StepStatus::Completed);
    assert_eq!(completed_so_far, checkpoint.next_step_index);

    // Feed resume messages back until the workflow settles.
    let outcome = drive_to_settlement(&mut fix, first).await;
    assert_eq!(outcome, SegmentOutcome::Completed);

    let (record, _) = fix.engine.store().load(id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.count_with_status(StepStatus::Completed), 10);
    assert!(record.segment_number >= 2, "expected at least two segments");
    assert_eq!(fix.invoker.call_count("lookup_menu"), 10);
}

#[tokio::test]
async fn tool_drift_across_yield_suspends() {
    let mut fix = fixture();
    for _ in 0..10 {
        fix.invoker
            .script("lookup_menu", MockResponse::ok(json!({"menu": []})).slow(60));
    }

    let id = fix
        .engine
        .create_execution(create_request(slow_chain(10)))
        .await
        .unwrap();
    let first = fix.engine.run_segment(id, "trace-1").await.unwrap();
    assert!(matches!(first, SegmentOutcome::Yielded { .. }));

    // The tool's schema fingerprint changes while the workflow is parked.
    fix.registry.register(ToolDescriptor::new(
        "lookup_menu",
        "2.0.0",
        ToolSchema::default(),
        ToolCategory::ReadOnly,
    ));

    let (signed, _) = fix.queue.drain().pop().unwrap();
    let outcome = fix.engine.resume(&signed).await.unwrap();
    match outcome {
        SegmentOutcome::Suspended { reason } => {
            assert!(reason.starts_with("SCHEMA_DRIFT"), "reason was {}", reason)
        }
        other => panic!("expected suspension, got {:?}", other),
    }

    let (record, _) = fix.engine.store().load(id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Suspended);
    assert_eq!(record.context_str("suspend_reason"), Some("SCHEMA_DRIFT"));

    let mut saw_drift_event = false;
    while let Ok(event) = fix.events.try_recv() {
        if matches!(event, EngineEvent::SchemaDriftDetected { .. }) {
            saw_drift_event = true;
        }
    }
    assert!(saw_drift_event);
}

#[tokio::test]
async fn tampered_resume_message_is_rejected_without_state_change() {
    let mut fix = fixture();
    for _ in 0..10 {
        fix.invoker
            .script("lookup_menu", MockResponse::ok(json!({"menu": []})).slow(60));
    }

    let id = fix
        .engine
        .create_execution(create_request(slow_chain(10)))
        .await
        .unwrap();
    let first = fix.engine.run_segment(id, "trace-1").await.unwrap();
    assert!(matches!(first, SegmentOutcome::Yielded { .. }));
    let (_, version_before) = fix.engine.store().load(id).await.unwrap();

    let (mut signed, _) = fix.queue.drain().pop().unwrap();
    signed.message.segment_number += 1;
    let err = fix.engine.resume(&signed).await.unwrap_err();
    assert_eq!(err.code(), "SIGNATURE_INVALID");

    // Rejection at the boundary produced no write.
    let (_, version_after) = fix.engine.store().load(id).await.unwrap();
    assert_eq!(version_before, version_after);
}

#[tokio::test]
async fn queue_outage_falls_back_to_event() {
    let mut fix = fixture();
    for _ in 0..10 {
        fix.invoker
            .script("lookup_menu", MockResponse::ok(json!({"menu": []})).slow(60));
    }
    *fix.queue.fail_publishes.lock() = true;

    let id = fix
        .engine
        .create_execution(create_request(slow_chain(10)))
        .await
        .unwrap();
    let first = fix.engine.run_segment(id, "trace-1").await.unwrap();
    assert!(matches!(first, SegmentOutcome::Yielded { .. }));

    let mut fallback = None;
    while let Ok(event) = fix.events.try_recv() {
        if let EngineEvent::ResumeFallback { message } = event {
            fallback = Some(message);
        }
    }
    let message = fallback.expect("expected a resume fallback event");
    assert_eq!(message.execution_id, id);

    // Both paths converge on the same resume handler.
    *fix.queue.fail_publishes.lock() = false;
    let signed = fix.engine.signer().sign(message).unwrap();
    let outcome = fix.engine.resume(&signed).await.unwrap();
    assert!(!matches!(outcome, SegmentOutcome::LockBusy));
}

#[tokio::test]
async fn inflight_step_is_reissued_on_resume() {
    let fix = fixture();
    let plan = Plan::new(vec![PlanStep::new(
        "step-0",
        "lookup_menu",
        json!({"restaurantId": "R1"}),
    )]);
    let id = fix.engine.create_execution(create_request(plan)).await.unwrap();

    // Simulate a segment that died mid-call: the step is parked in
    // progress with one attempt burned.
    fix.engine
        .store()
        .update(id, |r| {
            r.transition_to(ExecutionStatus::Executing)?;
            let step = r.step_state_mut("step-0")?;
            step.status = StepStatus::InProgress;
            step.attempts = 1;
            Ok(())
        })
        .await
        .unwrap();

    let outcome = fix.engine.run_segment(id, "trace-1").await.unwrap();
    assert_eq!(outcome, SegmentOutcome::Completed);

    let (record, _) = fix.engine.store().load(id).await.unwrap();
    let step = record.step_state("step-0").unwrap();
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.attempts, 2);
    assert_eq!(fix.invoker.call_count("lookup_menu"), 1);
}
