use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use voyage_core::context::ExecutionContext;
use voyage_core::error::{CapabilityError, VoyageError};
use voyage_core::traits::ContextStore;
use voyage_core::types::{ErrorKind, HistoryEntry, HistoryOutcome, RunEvent, RunStatus};
use voyage_engine::{
    AgentNode, GraphRunner, MemoryStore, Node, NodeSpec, Outcome, RetryPolicy, Route, SlotWrite,
    SqliteStore, WorkflowGraph,
};
use voyage_test_utils::{sample_request, ScriptedCapability};

type Cap = ScriptedCapability<String>;

fn search_node(cap: Arc<Cap>, retry: RetryPolicy) -> Arc<dyn Node> {
    Arc::new(AgentNode::new(
        NodeSpec::new("search", "Search Flights")
            .with_slot("flight")
            .with_retry(retry)
            .goto("found", "select")
            .fail_on("no_flights"),
        cap,
        |_: &String| Route::to("found"),
    ))
}

fn select_node(cap: Arc<Cap>) -> Arc<dyn Node> {
    Arc::new(AgentNode::new(
        NodeSpec::new("select", "Select Seat")
            .with_slot("seat")
            .with_retry(RetryPolicy::new(3, 1))
            .goto("selected", "pay"),
        cap,
        |_: &String| Route::to("selected"),
    ))
}

fn pay_node(cap: Arc<Cap>, retry: RetryPolicy) -> Arc<dyn Node> {
    Arc::new(AgentNode::new(
        NodeSpec::new("pay", "Process Payment")
            .with_slot("payment")
            .with_retry(retry)
            .complete_on("confirmed")
            .goto("declined", "search"),
        cap,
        |_: &String| Route::to("confirmed"),
    ))
}

struct Caps {
    search: Arc<Cap>,
    select: Arc<Cap>,
    pay: Arc<Cap>,
}

impl Caps {
    fn happy() -> Self {
        Self {
            search: Arc::new(Cap::always("AA123".into())),
            select: Arc::new(Cap::always("14A".into())),
            pay: Arc::new(Cap::always("CONF-1".into())),
        }
    }

    fn graph(&self) -> WorkflowGraph {
        WorkflowGraph::new(
            "booking_graph",
            "search",
            vec![
                search_node(self.search.clone(), RetryPolicy::new(3, 1)),
                select_node(self.select.clone()),
                pay_node(self.pay.clone(), RetryPolicy::new(2, 1)),
            ],
        )
        .unwrap()
    }
}

fn runner(graph: WorkflowGraph, store: Arc<dyn ContextStore>) -> GraphRunner {
    GraphRunner::new(Arc::new(graph), store)
}

fn node_path(ctx: &ExecutionContext) -> Vec<(String, u32)> {
    ctx.history()
        .iter()
        .map(|h| (h.node_id.clone(), h.attempt))
        .collect()
}

#[tokio::test]
async fn search_recovers_after_two_failures() {
    let caps = Caps {
        search: Arc::new(Cap::failing_then(2, "AA123".into())),
        ..Caps::happy()
    };
    let r = runner(caps.graph(), Arc::new(MemoryStore::new()));

    let ctx = r.submit(sample_request(), &CancellationToken::new()).await.unwrap();

    assert_eq!(ctx.status(), RunStatus::Completed);
    assert_eq!(caps.search.calls(), 3);
    assert_eq!(ctx.slot("flight"), Some(&json!("AA123")));
    assert_eq!(ctx.slot("payment"), Some(&json!("CONF-1")));

    let search: Vec<_> = ctx.history().iter().filter(|h| h.node_id == "search").collect();
    assert_eq!(search.len(), 3);
    assert_eq!(
        search.iter().map(|h| h.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    let delays: Vec<u64> = search
        .iter()
        .filter_map(|h| match h.outcome {
            HistoryOutcome::Retried { backoff_ms, .. } => Some(backoff_ms),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![1, 2]);
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));

    // the slot belongs to the attempt that succeeded
    assert_eq!(ctx.slot_entry("flight").unwrap().attempt, 3);
}

/// Node that ignores its declared transitions.
struct RogueSelect {
    spec: NodeSpec,
    runs: AtomicUsize,
}

impl Node for RogueSelect {
    fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    fn execute<'a>(&'a self, _ctx: &'a ExecutionContext) -> BoxFuture<'a, Outcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Outcome::advance("confirm") })
    }
}

#[tokio::test]
async fn undeclared_advance_fails_run() {
    let caps = Caps::happy();
    let rogue = Arc::new(RogueSelect {
        spec: NodeSpec::new("select", "Select Seat").goto("selected", "pay"),
        runs: AtomicUsize::new(0),
    });
    let rogue_node: Arc<dyn Node> = rogue.clone();
    let graph = WorkflowGraph::new(
        "booking_graph",
        "search",
        vec![
            search_node(caps.search.clone(), RetryPolicy::new(3, 1)),
            rogue_node,
            pay_node(caps.pay.clone(), RetryPolicy::new(2, 1)),
        ],
    )
    .unwrap();
    let store = Arc::new(MemoryStore::new());
    let r = runner(graph, store.clone());

    let err = r
        .submit(sample_request(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VoyageError::InvalidTransition { ref node, ref target }
            if node == "select" && target == "confirm"
    ));

    let runs = store.list().await.unwrap();
    assert_eq!(runs.len(), 1);
    let ctx = &runs[0];
    assert_eq!(ctx.status(), RunStatus::Failed);
    assert_eq!(ctx.current_node(), "select");
    assert_eq!(ctx.error().unwrap().kind, ErrorKind::InvalidTransition);
    assert_eq!(rogue.runs.load(Ordering::SeqCst), 1);
    assert_eq!(caps.pay.calls(), 0);
}

#[tokio::test]
async fn pay_exhausts_retries() {
    let caps = Caps {
        pay: Arc::new(Cap::new(vec![
            Err(CapabilityError::retryable("gateway 503")),
            Err(CapabilityError::Timeout(30)),
            Err(CapabilityError::retryable("gateway 503")),
        ])),
        ..Caps::happy()
    };
    let r = runner(caps.graph(), Arc::new(MemoryStore::new()));

    let ctx = r.submit(sample_request(), &CancellationToken::new()).await.unwrap();

    assert_eq!(ctx.status(), RunStatus::Failed);
    let error = ctx.error().unwrap();
    assert_eq!(error.node_id, "pay");
    assert_eq!(error.kind, ErrorKind::RetryLimitExceeded);
    assert_eq!(error.retry_count, 2);
    assert_eq!(caps.pay.calls(), 3);
    assert!(ctx.slot("payment").is_none());

    let report = r.status(ctx.run_id()).await.unwrap();
    assert_eq!(report.error.unwrap().retry_count, 2);
    assert!(report.payload.is_empty());
}

#[tokio::test]
async fn cancellation_after_search_keeps_committed_slot() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let caps = Caps {
        search: Arc::new(Cap::always("AA123".into()).on_invoke(move |_| trigger.cancel())),
        ..Caps::happy()
    };
    let r = runner(caps.graph(), Arc::new(MemoryStore::new()));

    let ctx = r.submit(sample_request(), &cancel).await.unwrap();

    assert_eq!(ctx.status(), RunStatus::Failed);
    let error = ctx.error().unwrap();
    assert_eq!(error.kind, ErrorKind::Cancelled);
    assert_eq!(error.node_id, "select");
    assert_eq!(ctx.slot("flight"), Some(&json!("AA123")));
    assert_eq!(caps.select.calls(), 0);
    assert_eq!(node_path(&ctx), vec![("search".to_string(), 1)]);
}

#[tokio::test]
async fn cancellation_interrupts_backoff() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let search = Arc::new(
        Cap::new(vec![Err(CapabilityError::retryable("busy"))])
            .on_invoke(move |_| trigger.cancel()),
    );
    let graph = WorkflowGraph::new(
        "booking_graph",
        "search",
        vec![
            search_node(search.clone(), RetryPolicy::new(3, 60_000)),
            select_node(Arc::new(Cap::always("14A".into()))),
            pay_node(Arc::new(Cap::always("CONF-1".into())), RetryPolicy::new(2, 1)),
        ],
    )
    .unwrap();
    let r = runner(graph, Arc::new(MemoryStore::new()));

    let ctx = tokio::time::timeout(Duration::from_secs(5), r.submit(sample_request(), &cancel))
        .await
        .expect("backoff should not wait out the full delay")
        .unwrap();

    assert_eq!(ctx.error().unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(search.calls(), 1);
    assert_eq!(ctx.error().unwrap().retry_count, 1);
}

#[tokio::test]
async fn resume_after_crash_continues_from_last_step() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("runs.db");

    // first process: select hangs, then the process "dies"
    let caps = Caps {
        select: Arc::new(Cap::always("14A".into()).with_delay(Duration::from_secs(10))),
        ..Caps::happy()
    };
    let store: Arc<dyn ContextStore> = Arc::new(SqliteStore::open(&db).unwrap());
    let r = runner(caps.graph(), store.clone());
    let pending = r.start(sample_request()).await.unwrap();
    let run_id = pending.run_id().clone();

    let cancel = CancellationToken::new();
    let crashed =
        tokio::time::timeout(Duration::from_millis(300), r.drive(pending, &cancel)).await;
    assert!(crashed.is_err());
    drop(r);
    drop(store);

    // second process: fresh capabilities over the same database
    let fresh = Caps::happy();
    let store: Arc<dyn ContextStore> = Arc::new(SqliteStore::open(&db).unwrap());
    let r = runner(fresh.graph(), store);

    let before = r.status(&run_id).await.unwrap();
    assert_eq!(before.status, RunStatus::Running);
    assert_eq!(before.current_node, "select");

    let ctx = r.resume(&run_id, &CancellationToken::new()).await.unwrap();
    assert_eq!(ctx.status(), RunStatus::Completed);
    assert_eq!(fresh.search.calls(), 0);
    assert_eq!(fresh.select.calls(), 1);
    assert_eq!(
        node_path(&ctx),
        vec![
            ("search".to_string(), 1),
            ("select".to_string(), 1),
            ("pay".to_string(), 1),
        ]
    );
}

#[tokio::test]
async fn stale_snapshot_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let r = runner(Caps::happy().graph(), store.clone());

    let pending = r.start(sample_request()).await.unwrap();
    let stale = store.load(pending.run_id()).await.unwrap();

    let done = r.drive(pending, &CancellationToken::new()).await.unwrap();
    assert_eq!(done.status(), RunStatus::Completed);

    let err = r.drive(stale, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, VoyageError::PersistenceConflict { .. }));

    let stored = store.load(done.run_id()).await.unwrap();
    assert_eq!(stored, done);
}

#[tokio::test]
async fn concurrent_runs_are_independent() {
    let caps = Caps::happy();
    let store = Arc::new(MemoryStore::new());
    let r = Arc::new(runner(caps.graph(), store.clone()));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let r = r.clone();
            tokio::spawn(async move {
                let mut request = sample_request();
                request["passenger"] = json!(i);
                r.submit(request, &CancellationToken::new()).await
            })
        })
        .collect();

    let mut ids = std::collections::HashSet::new();
    for handle in handles {
        let ctx = handle.await.unwrap().unwrap();
        assert_eq!(ctx.status(), RunStatus::Completed);
        assert_eq!(ctx.history().len(), 3);
        ids.insert(ctx.run_id().clone());
    }
    assert_eq!(ids.len(), 8);
    assert_eq!(store.len(), 8);
    assert_eq!(caps.pay.calls(), 8);
}

#[tokio::test]
async fn events_trace_the_run() {
    let caps = Caps {
        search: Arc::new(Cap::failing_then(1, "AA123".into())),
        ..Caps::happy()
    };
    let r = runner(caps.graph(), Arc::new(MemoryStore::new()));
    let mut rx = r.events().subscribe();

    let ctx = r.submit(sample_request(), &CancellationToken::new()).await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.run_id(), ctx.run_id());
        kinds.push(match event {
            RunEvent::RunStarted { .. } => "started",
            RunEvent::NodeStarted { .. } => "node",
            RunEvent::NodeRetrying { .. } => "retry",
            RunEvent::NodeAdvanced { .. } => "advance",
            RunEvent::RunCompleted { .. } => "completed",
            RunEvent::RunFailed { .. } => "failed",
        });
    }
    assert_eq!(
        kinds,
        vec![
            "started", "node", "retry", "node", "advance", "node", "advance", "node", "completed"
        ]
    );
}

/// Node that returns the same outcome every time.
struct FixedOutcome {
    spec: NodeSpec,
    outcome: Outcome,
}

impl Node for FixedOutcome {
    fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    fn execute<'a>(&'a self, _ctx: &'a ExecutionContext) -> BoxFuture<'a, Outcome> {
        let outcome = self.outcome.clone();
        Box::pin(async move { outcome })
    }
}

#[tokio::test]
async fn write_to_foreign_slot_fails_run() {
    let caps = Caps::happy();
    let pay: Arc<dyn Node> = Arc::new(FixedOutcome {
        spec: NodeSpec::new("pay", "Process Payment")
            .with_slot("payment")
            .complete_on("confirmed"),
        outcome: Outcome::complete(Some(SlotWrite::new("flight", json!("XX999")))),
    });
    let graph = WorkflowGraph::new(
        "booking_graph",
        "search",
        vec![
            search_node(caps.search.clone(), RetryPolicy::new(3, 1)),
            select_node(caps.select.clone()),
            pay,
        ],
    )
    .unwrap();
    let store = Arc::new(MemoryStore::new());
    let r = runner(graph, store.clone());

    let err = r
        .submit(sample_request(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VoyageError::UndeclaredSlot { ref node, ref slot } if node == "pay" && slot == "flight"
    ));

    let stored = store.list().await.unwrap().remove(0);
    assert_eq!(stored.status(), RunStatus::Failed);
    let error = stored.error().unwrap();
    assert_eq!(error.node_id, "pay");
    assert_eq!(error.kind, ErrorKind::SlotConflict);
    assert_eq!(stored.slot("flight"), Some(&json!("AA123")));
    assert!(matches!(
        stored.history().last().unwrap().outcome,
        HistoryOutcome::Failed {
            kind: ErrorKind::SlotConflict,
            ..
        }
    ));

    // the failure is final; resuming does not re-run the node
    let err = r
        .resume(stored.run_id(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, VoyageError::InvalidState { status: RunStatus::Failed, .. }));
}

#[tokio::test]
async fn shared_slot_conflict_fails_run() {
    let caps = Caps::happy();
    let select: Arc<dyn Node> = Arc::new(FixedOutcome {
        spec: NodeSpec::new("select", "Select Seat")
            .with_slot("flight")
            .goto("selected", "pay"),
        outcome: Outcome::advance_with("pay", SlotWrite::new("flight", json!("DL456"))),
    });
    let graph = WorkflowGraph::new(
        "booking_graph",
        "search",
        vec![
            search_node(caps.search.clone(), RetryPolicy::new(3, 1)),
            select,
            pay_node(caps.pay.clone(), RetryPolicy::new(2, 1)),
        ],
    )
    .unwrap();
    let store = Arc::new(MemoryStore::new());
    let r = runner(graph, store.clone());

    let err = r
        .submit(sample_request(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VoyageError::SlotConflict { ref slot, ref owner, .. }
            if slot == "flight" && owner == "search"
    ));

    let stored = store.list().await.unwrap().remove(0);
    assert_eq!(stored.status(), RunStatus::Failed);
    assert_eq!(stored.current_node(), "select");
    assert_eq!(stored.error().unwrap().kind, ErrorKind::SlotConflict);
    assert_eq!(stored.slot("flight"), Some(&json!("AA123")));
    assert_eq!(caps.pay.calls(), 0);
}

#[tokio::test]
async fn unmapped_route_category_fails_run() {
    let caps = Caps::happy();
    let search: Arc<dyn Node> = Arc::new(AgentNode::new(
        NodeSpec::new("search", "Search Flights")
            .with_slot("flight")
            .goto("found", "select")
            .fail_on("no_flights"),
        caps.search.clone(),
        |_: &String| Route::to("sold_out"),
    ));
    let graph = WorkflowGraph::new(
        "booking_graph",
        "search",
        vec![
            search,
            select_node(caps.select.clone()),
            pay_node(caps.pay.clone(), RetryPolicy::new(2, 1)),
        ],
    )
    .unwrap();
    let store = Arc::new(MemoryStore::new());
    let r = runner(graph, store.clone());

    let ctx = r.submit(sample_request(), &CancellationToken::new()).await.unwrap();

    assert_eq!(ctx.status(), RunStatus::Failed);
    let error = ctx.error().unwrap();
    assert_eq!(error.node_id, "search");
    assert_eq!(error.kind, ErrorKind::InvalidTransition);
    assert!(error.message.contains("sold_out"));
    assert!(ctx.slot("flight").is_none());
    assert_eq!(caps.select.calls(), 0);

    let stored = store.load(ctx.run_id()).await.unwrap();
    assert_eq!(stored, ctx);
}

#[tokio::test]
async fn resume_waits_out_recorded_backoff() {
    let caps = Caps::happy();
    let store = Arc::new(MemoryStore::new());
    let r = runner(caps.graph(), store.clone());

    // a run interrupted right after scheduling a 300ms retry of search
    let interrupted = ExecutionContext::new("booking_graph", "search", sample_request())
        .with_status(RunStatus::Running)
        .unwrap()
        .with_history(HistoryEntry::new(
            "search",
            1,
            HistoryOutcome::Retried {
                reason: "busy".into(),
                backoff_ms: 300,
            },
        ))
        .unwrap()
        .with_retries("search", 1)
        .unwrap()
        .committed();
    store.save(&interrupted).await.unwrap();

    let started = std::time::Instant::now();
    let ctx = r
        .resume(interrupted.run_id(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(ctx.status(), RunStatus::Completed);
    assert_eq!(caps.search.calls(), 1);
    assert_eq!(ctx.slot_entry("flight").unwrap().attempt, 2);
}
