//! Shared fixtures for scenario tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use orka::cancel::CancelToken;
use orka::compensation::SagaRetryConfig;
use orka::{
    CompensationTable, CreateExecution, EngineConfig, EngineEvent, EngineResult, EventBus,
    InProcessQueue, MemoryKv, ParamSpec, ParamType, Plan, SagaEngine, ToolCall, ToolCategory,
    ToolDescriptor, ToolInvoker, ToolOutcome, ToolRegistry, ToolSchema,
};

/// One scripted response for a tool
#[derive(Clone)]
pub struct MockResponse {
    pub outcome: ToolOutcome,
    pub delay_ms: u64,
}

impl MockResponse {
    pub fn ok(output: Value) -> Self {
        Self {
            outcome: ToolOutcome::ok(output, 5),
            delay_ms: 0,
        }
    }

    pub fn fail(error: &str) -> Self {
        Self {
            outcome: ToolOutcome::failed(error, 5),
            delay_ms: 0,
        }
    }

    pub fn slow(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_compensation(mut self, tool: &str, params: Option<Value>) -> Self {
        self.outcome.compensation = Some(orka::tool::CompensationDirective {
            tool: tool.to_string(),
            params,
        });
        self
    }
}

/// Scripted tool invoker recording every call
#[derive(Default)]
pub struct MockInvoker {
    calls: Mutex<Vec<ToolCall>>,
    responses: Mutex<HashMap<String, VecDeque<MockResponse>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, tool: &str, response: MockResponse) {
        self.responses
            .lock()
            .entry(tool.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self) -> Vec<ToolCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, tool: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.tool == tool).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// Peak number of calls that were in flight at the same instant
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolInvoker for MockInvoker {
    async fn execute(
        &self,
        call: &ToolCall,
        _deadline: Duration,
        _cancel: CancelToken,
    ) -> EngineResult<ToolOutcome> {
        self.calls.lock().push(call.clone());
        let concurrent = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(concurrent, Ordering::SeqCst);

        let scripted = self
            .responses
            .lock()
            .get_mut(&call.tool)
            .and_then(|queue| queue.pop_front());
        let response = scripted.unwrap_or_else(|| MockResponse::ok(json!({"ok": true})));
        if response.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(response.delay_ms)).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(response.outcome)
    }
}

/// Tool registry for the restaurant/delivery domain the tests speak
pub fn registry() -> Arc<ToolRegistry> {
    let registry = ToolRegistry::new();
    registry.register(ToolDescriptor::new(
        "book_restaurant_table",
        "2.1.0",
        ToolSchema::new(vec![
            ("restaurantId", ParamSpec::required(ParamType::String)),
            (
                "partySize",
                ParamSpec::required(ParamType::Integer).bounded(1.0, 20.0),
            ),
            ("time", ParamSpec::optional(ParamType::String)),
        ]),
        ToolCategory::Booking,
    ));
    registry.register(ToolDescriptor::new(
        "book_ride",
        "1.4.2",
        ToolSchema::new(vec![
            ("from", ParamSpec::required(ParamType::String)),
            ("to", ParamSpec::required(ParamType::String)),
        ]),
        ToolCategory::Booking,
    ));
    registry.register(ToolDescriptor::new(
        "cancel_ride",
        "1.4.2",
        ToolSchema::new(vec![("rideId", ParamSpec::required(ParamType::String))]),
        ToolCategory::Booking,
    ));
    registry.register(ToolDescriptor::new(
        "cancel_table",
        "2.1.0",
        ToolSchema::new(vec![("bookingId", ParamSpec::required(ParamType::String))]),
        ToolCategory::Booking,
    ));
    registry.register(ToolDescriptor::new(
        "capture_payment",
        "3.0.0",
        ToolSchema::new(vec![("amount", ParamSpec::required(ParamType::Number))]),
        ToolCategory::Payment,
    ));
    registry.register(ToolDescriptor::new(
        "lookup_menu",
        "1.0.0",
        ToolSchema::new(vec![("restaurantId", ParamSpec::required(ParamType::String))]),
        ToolCategory::ReadOnly,
    ));
    registry.register(ToolDescriptor::new(
        "notify_user",
        "1.0.0",
        ToolSchema::new(vec![("message", ParamSpec::required(ParamType::String))]),
        ToolCategory::Communication,
    ));
    Arc::new(registry)
}

pub fn compensation_table() -> Arc<CompensationTable> {
    Arc::new(
        CompensationTable::new()
            .register("book_ride", "cancel_ride", |_original, output| {
                json!({"rideId": output.get("rideId").cloned().unwrap_or(Value::Null)})
            })
            .register("book_restaurant_table", "cancel_table", |_original, output| {
                json!({"bookingId": output.get("bookingId").cloned().unwrap_or(Value::Null)})
            }),
    )
}

pub struct Fixture {
    pub kv: Arc<MemoryKv>,
    pub invoker: Arc<MockInvoker>,
    pub queue: Arc<InProcessQueue>,
    pub registry: Arc<ToolRegistry>,
    pub engine: SagaEngine,
    pub events: mpsc::Receiver<EngineEvent>,
}

/// Fast timings so scenario tests finish in milliseconds
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.segment.min_yield_check_ms = 100;
    config.segment.checkpoint_threshold_ms = 200;
    config.segment.yield_buffer_ms = 50;
    config.segment.step_timeout_ms = 2_000;
    config.segment.default_step_estimate_ms = 100;
    config.segment.resume_delay_ms = 1;
    config
}

pub fn fixture_with(config: EngineConfig) -> Fixture {
    let kv = Arc::new(MemoryKv::new());
    let invoker = Arc::new(MockInvoker::new());
    let queue = Arc::new(InProcessQueue::new());
    let registry = registry();
    let (bus, events) = EventBus::channel(64);

    let engine = SagaEngine::builder(kv.clone(), invoker.clone())
        .config(config)
        .registry(registry.clone())
        .compensations(compensation_table())
        .events(Arc::new(bus))
        .queue(queue.clone())
        .saga_retry(SagaRetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
            cap_delay_ms: 4,
            deadline_ms: 1_000,
        })
        .signing_seed([42u8; 32])
        .build();

    Fixture {
        kv,
        invoker,
        queue,
        registry,
        engine,
        events,
    }
}

pub fn fixture() -> Fixture {
    fixture_with(fast_config())
}

pub fn create_request(plan: Plan) -> CreateExecution {
    CreateExecution {
        plan,
        user_id: "user-1".to_string(),
        trace_id: "trace-1".to_string(),
        intent_id: None,
        budget: None,
        context: HashMap::new(),
    }
}

/// Drain the resume queue, feeding each message back into the engine until
/// the workflow settles. Returns the final outcome.
pub async fn drive_to_settlement(fixture: &mut Fixture, first: orka::SegmentOutcome) -> orka::SegmentOutcome {
    let mut last = first;
    for _ in 0..64 {
        let pending = fixture.queue.drain();
        if pending.is_empty() {
            return last;
        }
        for (signed, _delay) in pending {
            last = fixture.engine.resume(&signed).await.unwrap();
        }
    }
    last
}
