//! End-to-end saga scenarios against the in-memory store

mod common;

use common::{create_request, fixture, MockResponse};
use serde_json::json;
use orka::{
    CompensationStatus, ExecutionStatus, Plan, PlanStep, SegmentOutcome, StepStatus,
};

#[tokio::test]
async fn happy_path_single_step() {
    let fix = fixture();
    fix.invoker
        .script("book_restaurant_table", MockResponse::ok(json!({"confirmed": true})));

    let plan = Plan::new(vec![PlanStep::new(
        "step-1",
        "book_restaurant_table",
        json!({"restaurantId": "R1", "partySize": 2, "time": "19:00"}),
    )]);
    let id = fix.engine.create_execution(create_request(plan)).await.unwrap();

    let outcome = fix.engine.run_segment(id, "trace-1").await.unwrap();
    assert_eq!(outcome, SegmentOutcome::Completed);

    let (record, _) = fix.engine.store().load(id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.count_with_status(StepStatus::Completed), 1);
    assert_eq!(record.count_with_status(StepStatus::Failed), 0);
    assert_eq!(
        record.step_state("step-1").unwrap().output,
        Some(json!({"confirmed": true}))
    );
    assert_eq!(fix.invoker.call_count("book_restaurant_table"), 1);
}

#[tokio::test]
async fn failed_booking_unwinds_the_ride() {
    let fix = fixture();
    fix.invoker.script(
        "book_ride",
        MockResponse::ok(json!({"rideId": "ride-123"}))
            .with_compensation("cancel_ride", Some(json!({"rideId": "ride-123"}))),
    );
    // The booking is scripted to fail on the first call and on the policy
    // retry with a shifted time.
    fix.invoker.script(
        "book_restaurant_table",
        MockResponse::fail("Restaurant fully booked"),
    );

    let plan = Plan::new(vec![
        PlanStep::new("ride", "book_ride", json!({"from": "home", "to": "R1"})),
        PlanStep::new(
            "table",
            "book_restaurant_table",
            json!({"restaurantId": "R1", "partySize": 2, "time": "19:00"}),
        )
        .after("ride")
        .with_intent("reservation"),
    ]);
    let id = fix.engine.create_execution(create_request(plan)).await.unwrap();

    let outcome = fix.engine.run_segment(id, "trace-1").await.unwrap();
    assert_eq!(
        outcome,
        SegmentOutcome::Compensated {
            status: CompensationStatus::Compensated
        }
    );

    let (record, _) = fix.engine.store().load(id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.compensation_status, Some(CompensationStatus::Compensated));
    assert_eq!(record.step_state("ride").unwrap().status, StepStatus::Compensated);
    assert_eq!(record.step_state("table").unwrap().status, StepStatus::Failed);

    // Call order: forward steps first, then the compensation.
    let tools: Vec<String> = fix.invoker.calls().iter().map(|c| c.tool.clone()).collect();
    assert_eq!(tools.first().unwrap(), "book_ride");
    assert_eq!(tools.last().unwrap(), "cancel_ride");
    assert_eq!(fix.invoker.call_count("cancel_ride"), 1);

    let cancel_call = fix
        .invoker
        .calls()
        .into_iter()
        .find(|c| c.tool == "cancel_ride")
        .unwrap();
    assert_eq!(cancel_call.params, json!({"rideId": "ride-123"}));
}

#[tokio::test]
async fn completed_execution_reentry_calls_no_tools() {
    let fix = fixture();
    let plan = Plan::new(vec![PlanStep::new(
        "step-1",
        "book_restaurant_table",
        json!({"restaurantId": "R1", "partySize": 2}),
    )]);
    let id = fix.engine.create_execution(create_request(plan)).await.unwrap();

    assert_eq!(
        fix.engine.run_segment(id, "trace-1").await.unwrap(),
        SegmentOutcome::Completed
    );
    assert_eq!(fix.invoker.total_calls(), 1);

    // Re-entry must be a no-op.
    assert_eq!(
        fix.engine.run_segment(id, "trace-2").await.unwrap(),
        SegmentOutcome::Completed
    );
    let (record, _) = fix.engine.store().load(id).await.unwrap();
    assert_eq!(record.count_with_status(StepStatus::Completed), 1);
    assert_eq!(fix.invoker.total_calls(), 1);
}

#[tokio::test]
async fn duplicate_call_short_circuits_across_executions() {
    let fix = fixture();
    let params = json!({"restaurantId": "R1", "partySize": 2, "time": "19:00"});

    let first = Plan::new(vec![PlanStep::new(
        "step-1",
        "book_restaurant_table",
        params.clone(),
    )]);
    let id1 = fix.engine.create_execution(create_request(first)).await.unwrap();
    fix.engine.run_segment(id1, "t1").await.unwrap();
    assert_eq!(fix.invoker.call_count("book_restaurant_table"), 1);

    // Same user, same tool, equivalent parameters (padded time format).
    let second = Plan::new(vec![PlanStep::new(
        "step-1",
        "book_restaurant_table",
        json!({"restaurantId": "R1", "partySize": 2, "time": "19:00:00"}),
    )]);
    let id2 = fix.engine.create_execution(create_request(second)).await.unwrap();
    let outcome = fix.engine.run_segment(id2, "t2").await.unwrap();
    assert_eq!(outcome, SegmentOutcome::Completed);

    // The tool was not called a second time; the step carries the skip
    // marker payload.
    assert_eq!(fix.invoker.call_count("book_restaurant_table"), 1);
    let (record, _) = fix.engine.store().load(id2).await.unwrap();
    assert_eq!(
        record.step_state("step-1").unwrap().output,
        Some(json!({"skipped": true}))
    );
}

#[tokio::test]
async fn time_slot_failure_retries_with_shifted_time() {
    let fix = fixture();
    fix.invoker.script(
        "book_restaurant_table",
        MockResponse::fail("time slot unavailable"),
    );
    fix.invoker
        .script("book_restaurant_table", MockResponse::ok(json!({"confirmed": true})));

    let plan = Plan::new(vec![PlanStep::new(
        "step-1",
        "book_restaurant_table",
        json!({"restaurantId": "R1", "partySize": 2, "time": "19:00"}),
    )
    .with_intent("reservation")]);
    let id = fix.engine.create_execution(create_request(plan)).await.unwrap();

    let outcome = fix.engine.run_segment(id, "trace-1").await.unwrap();
    assert_eq!(outcome, SegmentOutcome::Completed);

    let calls = fix.invoker.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].params["time"], json!("19:00"));
    // Retry carries the first policy offset (+30 minutes).
    assert_eq!(calls[1].params["time"], json!("19:30:00"));

    let (record, _) = fix.engine.store().load(id).await.unwrap();
    assert_eq!(record.step_state("step-1").unwrap().attempts, 2);
}

#[tokio::test]
async fn unreachable_dependents_are_skipped_on_failure() {
    let fix = fixture();
    // Payment failures escalate instead of retrying; no corrector is
    // configured, so the step fails terminally.
    fix.invoker
        .script("capture_payment", MockResponse::fail("payment declined by issuer"));

    let plan = Plan::new(vec![
        PlanStep::new("pay", "capture_payment", json!({"amount": 12.0})),
        PlanStep::new(
            "table",
            "book_restaurant_table",
            json!({"restaurantId": "R1", "partySize": 2}),
        )
        .after("pay"),
    ]);
    let id = fix.engine.create_execution(create_request(plan)).await.unwrap();

    let outcome = fix.engine.run_segment(id, "trace-1").await.unwrap();
    assert_eq!(
        outcome,
        SegmentOutcome::Failed {
            code: "TOOL_EXECUTION_FAILED".to_string()
        }
    );

    let (record, _) = fix.engine.store().load(id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.step_state("pay").unwrap().status, StepStatus::Failed);
    assert_eq!(record.step_state("table").unwrap().status, StepStatus::Skipped);
    assert_eq!(fix.invoker.call_count("book_restaurant_table"), 0);
}
