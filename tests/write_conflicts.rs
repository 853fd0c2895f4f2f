//! Write-conflict serialisation within a segment
//!
//! Steps with no dependency edge but overlapping output keys must never
//! run concurrently: the resolver splits them into consecutive single-step
//! batches and the segment loop consumes batches in order.

mod common;

use common::{create_request, drive_to_settlement, fixture, MockResponse};
use serde_json::json;
use orka::{ExecutionStatus, Plan, PlanStep, SegmentOutcome, StepStatus};

#[tokio::test]
async fn conflicting_writers_never_run_concurrently() {
    let mut fix = fixture();
    // Both calls linger so an accidental fan-out would overlap them.
    fix.invoker
        .script("lookup_menu", MockResponse::ok(json!({"held": "a"})).slow(30));
    fix.invoker
        .script("lookup_menu", MockResponse::ok(json!({"held": "b"})).slow(30));

    // No dependency edge between the steps; only the shared output key
    // keeps them apart.
    let plan = Plan::new(vec![
        PlanStep::new(
            "hold-a",
            "lookup_menu",
            json!({"restaurantId": "R1", "slot": "a"}),
        )
        .writing("calendar"),
        PlanStep::new(
            "hold-b",
            "lookup_menu",
            json!({"restaurantId": "R1", "slot": "b"}),
        )
        .writing("calendar"),
    ]);
    let id = fix.engine.create_execution(create_request(plan)).await.unwrap();

    let first = fix.engine.run_segment(id, "trace-1").await.unwrap();
    let outcome = drive_to_settlement(&mut fix, first).await;
    assert_eq!(outcome, SegmentOutcome::Completed);

    let (record, _) = fix.engine.store().load(id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.step_state("hold-a").unwrap().status, StepStatus::Completed);
    assert_eq!(record.step_state("hold-b").unwrap().status, StepStatus::Completed);

    // Never more than one conflicting writer in flight, and the
    // deterministic plan-order tie-break decides who goes first.
    assert_eq!(fix.invoker.call_count("lookup_menu"), 2);
    assert_eq!(fix.invoker.max_in_flight(), 1);
    let calls = fix.invoker.calls();
    assert_eq!(calls[0].step_id, "hold-a");
    assert_eq!(calls[1].step_id, "hold-b");
}

#[tokio::test]
async fn non_conflicting_steps_still_fan_out() {
    let mut fix = fixture();
    fix.invoker
        .script("lookup_menu", MockResponse::ok(json!({"menu": ["a"]})).slow(30));
    fix.invoker
        .script("lookup_menu", MockResponse::ok(json!({"menu": ["b"]})).slow(30));

    // Same layer, disjoint output keys: the batch is parallelizable.
    let plan = Plan::new(vec![
        PlanStep::new(
            "read-a",
            "lookup_menu",
            json!({"restaurantId": "R1", "slot": "a"}),
        ),
        PlanStep::new(
            "read-b",
            "lookup_menu",
            json!({"restaurantId": "R1", "slot": "b"}),
        ),
    ]);
    let id = fix.engine.create_execution(create_request(plan)).await.unwrap();

    let first = fix.engine.run_segment(id, "trace-1").await.unwrap();
    let outcome = drive_to_settlement(&mut fix, first).await;
    assert_eq!(outcome, SegmentOutcome::Completed);

    assert_eq!(fix.invoker.call_count("lookup_menu"), 2);
    assert_eq!(fix.invoker.max_in_flight(), 2);
}
