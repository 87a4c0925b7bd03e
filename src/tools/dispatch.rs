//! Executes the tool calls of one assistant turn.
//!
//! Every call runs in its own task and writes into the slot of its request
//! position, so results come back in request order whatever the completion
//! order. A call is executed at most once; there is no retry here.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::arguments::ToolArguments;
use super::registry::ToolRegistry;
use super::tool::{Tool, ToolExecutionContext};
use super::validation::validate_arguments;
use crate::error::TillerError;
use crate::types::{Message, ToolCall, ToolResult};
use crate::util::timeout::with_timeout;

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Progress notification for one call.
#[derive(Debug)]
pub enum DispatchEvent<'a> {
    Started {
        index: usize,
        call: &'a ToolCall,
    },
    Finished {
        index: usize,
        call: &'a ToolCall,
        result: &'a ToolResult,
        duration: Duration,
        /// False when the call was aborted after the cancellation grace period.
        completed: bool,
    },
}

/// Results of one dispatch, in request order.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub results: Vec<ToolResult>,
    /// Whether each call actually ran to completion. Calls skipped or aborted
    /// because of cancellation carry a forced `cancelled` result.
    pub completed: Vec<bool>,
    /// The cancellation token fired during dispatch.
    pub cancelled: bool,
}

impl DispatchOutcome {
    pub fn all_completed(&self) -> bool {
        self.completed.iter().all(|done| *done)
    }

    /// Tool messages answering `calls`, one per call, in request order.
    pub fn to_messages(&self, calls: &[ToolCall]) -> Vec<Message> {
        calls
            .iter()
            .zip(&self.results)
            .map(|(call, result)| {
                Message::tool(&call.id, &call.tool_name, &result.content).with_is_error(!result.success)
            })
            .collect()
    }
}

/// Runs tool calls against a registry.
#[derive(Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    parallel: bool,
    tool_timeout: Duration,
    cancel_grace: Duration,
}

struct Slots {
    results: Vec<Option<ToolResult>>,
    completed: Vec<bool>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            parallel: true,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    /// Run the calls of a turn concurrently (default) or one at a time.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// How long in-flight calls may keep running once cancellation fires.
    pub fn cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Execute `calls`, returning exactly one result per call in request order.
    pub async fn dispatch(
        &self,
        calls: &[ToolCall],
        cancel: &CancellationToken,
        on_event: &(dyn Fn(DispatchEvent<'_>) + Sync),
    ) -> DispatchOutcome {
        let mut slots = Slots {
            results: vec![None; calls.len()],
            completed: vec![false; calls.len()],
        };

        if self.parallel && calls.len() > 1 {
            self.run_batch(calls, 0..calls.len(), &mut slots, cancel, on_event)
                .await;
        } else {
            for index in 0..calls.len() {
                if cancel.is_cancelled() {
                    break;
                }
                self.run_batch(calls, index..index + 1, &mut slots, cancel, on_event)
                    .await;
            }
        }

        DispatchOutcome {
            results: slots
                .results
                .into_iter()
                .map(|slot| slot.unwrap_or_else(ToolResult::cancelled))
                .collect(),
            completed: slots.completed,
            cancelled: cancel.is_cancelled(),
        }
    }

    /// Look the tool up and validate arguments; a failure becomes the result.
    fn resolve(&self, call: &ToolCall) -> Result<Arc<dyn Tool>, ToolResult> {
        let tool = self
            .registry
            .get(&call.tool_name)
            .ok_or_else(|| ToolResult::failure(format!("unknown tool: {}", call.tool_name)))?;
        validate_arguments(&call.arguments_value(), &tool.parameters().schema).map_err(|e| {
            ToolResult::failure(format!("invalid arguments for {}: {e}", call.tool_name))
        })?;
        Ok(tool.clone())
    }

    async fn run_batch(
        &self,
        calls: &[ToolCall],
        indices: std::ops::Range<usize>,
        slots: &mut Slots,
        cancel: &CancellationToken,
        on_event: &(dyn Fn(DispatchEvent<'_>) + Sync),
    ) {
        let mut pending = FuturesUnordered::new();
        let mut running: Vec<(usize, AbortHandle, Instant)> = Vec::new();

        for index in indices {
            let call = &calls[index];
            on_event(DispatchEvent::Started { index, call });
            debug!(tool = %call.tool_name, call_id = %call.id, "tool started");
            let started = Instant::now();

            let tool = match self.resolve(call) {
                Ok(tool) => tool,
                Err(result) => {
                    record(calls, slots, index, result, started.elapsed(), true, on_event);
                    continue;
                }
            };

            let ctx = ToolExecutionContext {
                call_id: call.id.clone(),
                cancel: cancel.clone(),
            };
            let args = ToolArguments::new(call.arguments.clone());
            let timeout = self.tool_timeout;
            let handle = tokio::spawn(async move { run_tool(tool, args, ctx, timeout).await });
            running.push((index, handle.abort_handle(), started));
            pending.push(async move { (index, started, handle.await) });
        }

        let mut deadline: Option<Instant> = None;
        while !pending.is_empty() {
            let grace_expired = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                biased;
                Some((index, started, joined)) = pending.next() => {
                    let result = match joined {
                        Ok(result) => result,
                        Err(e) if e.is_panic() => ToolResult::failure(format!(
                            "tool '{}' panicked",
                            calls[index].tool_name
                        )),
                        Err(e) => ToolResult::failure(format!("tool task failed: {e}")),
                    };
                    record(calls, slots, index, result, started.elapsed(), true, on_event);
                }
                _ = cancel.cancelled(), if deadline.is_none() => {
                    warn!(
                        in_flight = pending.len(),
                        grace_ms = self.cancel_grace.as_millis() as u64,
                        "cancellation during tool dispatch"
                    );
                    deadline = Some(Instant::now() + self.cancel_grace);
                }
                _ = grace_expired => break,
            }
        }

        for (index, abort, started) in running {
            if slots.results[index].is_none() {
                abort.abort();
                warn!(tool = %calls[index].tool_name, call_id = %calls[index].id, "tool aborted after grace period");
                record(
                    calls,
                    slots,
                    index,
                    ToolResult::cancelled(),
                    started.elapsed(),
                    false,
                    on_event,
                );
            }
        }
    }
}

fn record(
    calls: &[ToolCall],
    slots: &mut Slots,
    index: usize,
    result: ToolResult,
    duration: Duration,
    completed: bool,
    on_event: &(dyn Fn(DispatchEvent<'_>) + Sync),
) {
    let call = &calls[index];
    debug!(
        tool = %call.tool_name,
        call_id = %call.id,
        success = result.success,
        duration_ms = duration.as_millis() as u64,
        "tool finished"
    );
    on_event(DispatchEvent::Finished {
        index,
        call,
        result: &result,
        duration,
        completed,
    });
    slots.results[index] = Some(result);
    slots.completed[index] = completed;
}

async fn run_tool(
    tool: Arc<dyn Tool>,
    args: ToolArguments,
    ctx: ToolExecutionContext,
    timeout: Duration,
) -> ToolResult {
    match with_timeout(timeout, tool.execute(&args, &ctx)).await {
        Ok(result) => result,
        Err(TillerError::Timeout(ms)) => {
            ToolResult::failure(format!("tool '{}' timed out after {ms}ms", tool.name()))
        }
        Err(e) => ToolResult::failure(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{AgentTool, AgentToolParameters};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn sleeper(name: &str, millis: u64) -> Arc<dyn Tool> {
        let reply = name.to_string();
        Arc::new(AgentTool::new(
            name,
            "sleeps then answers",
            AgentToolParameters::empty(),
            move |_, _| {
                let reply = reply.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    Ok(ToolResult::ok(reply))
                }
            },
        ))
    }

    fn call(id: &str, tool: &str, arguments: Value) -> ToolCall {
        let arguments = arguments.as_object().cloned().unwrap_or_default();
        ToolCall::new(id, tool, arguments)
    }

    fn dispatcher(tools: Vec<Arc<dyn Tool>>) -> ToolDispatcher {
        let registry = tools
            .into_iter()
            .fold(ToolRegistry::new(), |registry, tool| registry.with(tool));
        ToolDispatcher::new(Arc::new(registry))
    }

    fn ignore(_: DispatchEvent<'_>) {}

    #[tokio::test(start_paused = true)]
    async fn parallel_results_keep_request_order() {
        let dispatcher = dispatcher(vec![sleeper("slow", 30), sleeper("fast", 10)]);
        let calls = vec![call("c1", "slow", json!({})), call("c2", "fast", json!({}))];

        let started = Instant::now();
        let outcome = dispatcher
            .dispatch(&calls, &CancellationToken::new(), &ignore)
            .await;

        assert_eq!(outcome.results[0].content, "slow");
        assert_eq!(outcome.results[1].content, "fast");
        assert!(outcome.all_completed());
        assert!(!outcome.cancelled);
        assert!(started.elapsed() < Duration::from_millis(40));

        let messages = outcome.to_messages(&calls);
        assert_eq!(messages[0].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(messages[1].tool_name.as_deref(), Some("fast"));
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_mode_never_overlaps() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tool = {
            let (active, peak) = (active.clone(), peak.clone());
            Arc::new(AgentTool::new(
                "track",
                "tracks concurrency",
                AgentToolParameters::empty(),
                move |_, _| {
                    let (active, peak) = (active.clone(), peak.clone());
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(ToolResult::ok("done"))
                    }
                },
            ))
        };
        let dispatcher = dispatcher(vec![tool]).parallel(false);
        let calls: Vec<_> = (0..3)
            .map(|i| call(&format!("c{i}"), "track", json!({})))
            .collect();

        let outcome = dispatcher
            .dispatch(&calls, &CancellationToken::new(), &ignore)
            .await;

        assert_eq!(outcome.results.len(), 3);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_tool_and_invalid_arguments_become_failures() {
        let echo: Arc<dyn Tool> = Arc::new(AgentTool::new(
            "echo",
            "echoes text",
            AgentToolParameters::object()
                .string("text", "Text to echo", true)
                .build(),
            |args, _| async move { Ok(ToolResult::ok(args.get_str("text")?)) },
        ));
        let dispatcher = dispatcher(vec![echo]);
        let calls = vec![
            call("c1", "missing", json!({})),
            call("c2", "echo", json!({ "text": 3 })),
            call("c3", "echo", json!({ "text": "hi" })),
        ];

        let outcome = dispatcher
            .dispatch(&calls, &CancellationToken::new(), &ignore)
            .await;

        assert_eq!(outcome.results[0].content, "Error: unknown tool: missing");
        assert!(!outcome.results[1].success);
        assert!(outcome.results[1]
            .content
            .contains("arguments.text: expected string, got number"));
        assert_eq!(outcome.results[2], ToolResult::ok("hi"));
        assert!(outcome.all_completed());
    }

    #[tokio::test]
    async fn panicking_tool_is_contained() {
        let boom: Arc<dyn Tool> = Arc::new(AgentTool::new(
            "boom",
            "always panics",
            AgentToolParameters::empty(),
            |_, _| async move {
                if true {
                    panic!("tool exploded");
                }
                Ok(ToolResult::ok("unreachable"))
            },
        ));
        let dispatcher = dispatcher(vec![boom, sleeper("ok", 1)]);
        let calls = vec![call("c1", "boom", json!({})), call("c2", "ok", json!({}))];

        let outcome = dispatcher
            .dispatch(&calls, &CancellationToken::new(), &ignore)
            .await;

        assert_eq!(outcome.results[0].content, "Error: tool 'boom' panicked");
        assert_eq!(outcome.results[1].content, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_times_out() {
        let dispatcher =
            dispatcher(vec![sleeper("slow", 10_000)]).tool_timeout(Duration::from_millis(50));
        let calls = vec![call("c1", "slow", json!({}))];

        let outcome = dispatcher
            .dispatch(&calls, &CancellationToken::new(), &ignore)
            .await;

        assert_eq!(
            outcome.results[0].content,
            "Error: tool 'slow' timed out after 50ms"
        );
        assert!(outcome.completed[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_stragglers_after_grace() {
        let dispatcher = dispatcher(vec![sleeper("fast", 5), sleeper("stuck", 60_000)])
            .cancel_grace(Duration::from_millis(100));
        let calls = vec![call("c1", "fast", json!({})), call("c2", "stuck", json!({}))];
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = dispatcher.dispatch(&calls, &cancel, &ignore).await;

        assert!(outcome.cancelled);
        assert_eq!(outcome.completed, vec![true, false]);
        assert_eq!(outcome.results[0].content, "fast");
        assert_eq!(outcome.results[1], ToolResult::cancelled());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn sequential_dispatch_skips_calls_after_cancellation() {
        let dispatcher = dispatcher(vec![sleeper("a", 1)]).parallel(false);
        let calls = vec![call("c1", "a", json!({})), call("c2", "a", json!({}))];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = dispatcher.dispatch(&calls, &cancel, &ignore).await;

        assert_eq!(outcome.completed, vec![false, false]);
        assert!(outcome.results.iter().all(|r| r == &ToolResult::cancelled()));
    }

    #[tokio::test]
    async fn emits_started_before_finished() {
        let dispatcher = dispatcher(vec![sleeper("a", 1), sleeper("b", 1)]);
        let calls = vec![call("c1", "a", json!({})), call("c2", "b", json!({}))];
        let log = Mutex::new(Vec::new());
        let on_event = |event: DispatchEvent<'_>| {
            let entry = match event {
                DispatchEvent::Started { index, .. } => format!("start {index}"),
                DispatchEvent::Finished { index, .. } => format!("finish {index}"),
            };
            log.lock().unwrap().push(entry);
        };

        dispatcher
            .dispatch(&calls, &CancellationToken::new(), &on_event)
            .await;

        let log = log.into_inner().unwrap();
        assert_eq!(log.len(), 4);
        for index in 0..2 {
            let start = log.iter().position(|e| e == &format!("start {index}"));
            let finish = log.iter().position(|e| e == &format!("finish {index}"));
            assert!(start < finish);
        }
    }
}
