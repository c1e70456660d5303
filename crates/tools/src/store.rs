//! Tool store.
//!
//! Holds descriptors keyed by name. Built per request from the built-in
//! tools and the requester's remote tool servers, then shared read-only
//! through the request context.

use crate::args::ToolArgs;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tm_domain::context::RequestContext;
use tm_domain::error::{Error, Result};
use tm_domain::tool::{ToolCatalog, ToolDefinition};
use tm_domain::trace::TraceEvent;
use tracing::Instrument;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Descriptors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Executes one tool call.
#[async_trait::async_trait]
pub trait ToolResolver: Send + Sync {
    async fn call(&self, ctx: &RequestContext, args: ToolArgs) -> Result<String>;
}

#[async_trait::async_trait]
impl<F, Fut> ToolResolver for F
where
    F: Fn(RequestContext, ToolArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String>> + Send,
{
    async fn call(&self, ctx: &RequestContext, args: ToolArgs) -> Result<String> {
        (self)(ctx.clone(), args).await
    }
}

/// A callable tool: name, description, argument schema and resolver.
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub schema: Arc<Value>,
    pub resolver: Arc<dyn ToolResolver>,
}

impl Tool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        resolver: impl ToolResolver + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: Arc::new(schema),
            resolver: Arc::new(resolver),
        }
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: (*self.schema).clone(),
        }
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool").field("name", &self.name).finish_non_exhaustive()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trace sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Receives one event per resolved tool call.
pub trait TraceSink: Send + Sync {
    fn record(&self, event: TraceEvent);
}

/// Writes events to the log as `tm_event` lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTraceSink;

impl TraceSink for LogTraceSink {
    fn record(&self, event: TraceEvent) {
        event.emit();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ToolStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct ToolStore {
    tools: RwLock<HashMap<String, Tool>>,
    trace: Option<Arc<dyn TraceSink>>,
}

impl ToolStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(sink);
        self
    }

    /// Register tools. On a name collision the later tool replaces the
    /// earlier one.
    pub fn add_tools(&self, tools: impl IntoIterator<Item = Tool>) {
        let mut map = self.tools.write();
        for tool in tools {
            if map.contains_key(&tool.name) {
                tracing::warn!(tool = %tool.name, "tool name collision, replacing earlier registration");
            }
            map.insert(tool.name.clone(), tool);
        }
    }

    pub fn get(&self, name: &str) -> Option<Tool> {
        self.tools.read().get(name).cloned()
    }

    /// Definitions sorted by name.
    pub fn get_tools(&self) -> Vec<ToolDefinition> {
        let map = self.tools.read();
        let mut defs: Vec<ToolDefinition> = map.values().map(Tool::definition).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// Run tool `name`. Resolver errors are returned as-is.
    pub async fn resolve_tool(&self, name: &str, arguments: Value, ctx: &RequestContext) -> Result<String> {
        // Clone out of the map so no lock is held across the call.
        let tool = self
            .get(name)
            .ok_or_else(|| Error::UnknownTool(name.to_string()))?;

        let span = tracing::info_span!("tool.resolve", tool = %name, request_id = %ctx.request_id);
        let started = Instant::now();
        let args = ToolArgs::new(name, arguments, tool.schema.clone());
        let outcome = tool.resolver.call(ctx, args).instrument(span).await;

        if let Err(e) = &outcome {
            tracing::debug!(tool = %name, error = %e, "tool call failed");
        }
        if let Some(sink) = &self.trace {
            sink.record(TraceEvent::ToolInvoked {
                request_id: ctx.request_id.clone(),
                tool: name.to_string(),
                success: outcome.is_ok(),
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }
        outcome
    }
}

#[async_trait::async_trait]
impl ToolCatalog for ToolStore {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.get_tools()
    }

    async fn resolve(&self, name: &str, arguments: &Value, ctx: &RequestContext) -> Result<String> {
        self.resolve_tool(name, arguments.clone(), ctx).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde::Deserialize;
    use serde_json::json;
    use tm_domain::context::{BotSummary, UserSummary};

    fn ctx() -> RequestContext {
        RequestContext::new(UserSummary::default(), BotSummary::default())
    }

    #[derive(Deserialize)]
    struct Echo {
        text: String,
    }

    fn echo(name: &str, prefix: &'static str) -> Tool {
        Tool::new(
            name,
            "echo the text",
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}),
            move |_ctx: RequestContext, args: ToolArgs| async move {
                let a: Echo = args.decode()?;
                Ok::<_, Error>(format!("{prefix}{}", a.text))
            },
        )
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<TraceEvent>>);

    impl TraceSink for Recorder {
        fn record(&self, event: TraceEvent) {
            self.0.lock().push(event);
        }
    }

    #[tokio::test]
    async fn resolves_registered_tool() {
        let store = ToolStore::new();
        store.add_tools([echo("echo", "")]);
        let out = store.resolve_tool("echo", json!({"text": "hi"}), &ctx()).await.unwrap();
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn unknown_tool() {
        let store = ToolStore::new();
        let err = store.resolve_tool("nope", json!({}), &ctx()).await.unwrap_err();
        assert!(err.to_string().contains("unknown tool"));
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let store = ToolStore::new();
        store.add_tools([echo("echo", "a:")]);
        store.add_tools([echo("echo", "b:")]);
        assert_eq!(store.len(), 1);
        let out = store.resolve_tool("echo", json!({"text": "x"}), &ctx()).await.unwrap();
        assert_eq!(out, "b:x");
    }

    #[tokio::test]
    async fn resolver_error_propagates_verbatim() {
        let store = ToolStore::new();
        store.add_tools([Tool::new(
            "fail",
            "always fails",
            json!({}),
            |_ctx: RequestContext, _args: ToolArgs| async move {
                Err::<String, _>(Error::Other("backend exploded".into()))
            },
        )]);
        let err = store.resolve_tool("fail", json!({}), &ctx()).await.unwrap_err();
        assert_eq!(err.to_string(), "backend exploded");
    }

    #[test]
    fn definitions_are_sorted() {
        let store = ToolStore::new();
        store.add_tools([echo("zeta", ""), echo("alpha", ""), echo("mid", "")]);
        let names: Vec<String> = store.get_tools().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn trace_sink_sees_each_call() {
        let sink = Arc::new(Recorder::default());
        let store = ToolStore::new().with_trace_sink(sink.clone());
        store.add_tools([echo("echo", "")]);
        store.resolve_tool("echo", json!({"text": "ok"}), &ctx()).await.unwrap();
        let _ = store.resolve_tool("echo", json!({"text": 1}), &ctx()).await;

        let events = sink.0.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], TraceEvent::ToolInvoked { success: true, .. }));
        assert!(matches!(&events[1], TraceEvent::ToolInvoked { success: false, .. }));
    }

    #[tokio::test]
    async fn catalog_view_through_context() {
        let store = Arc::new(ToolStore::new());
        store.add_tools([echo("echo", "")]);
        let ctx = ctx().with_tools(store);
        assert_eq!(ctx.tool_definitions().len(), 1);
        let catalog = ctx.tools.clone().unwrap();
        let out = catalog.resolve("echo", &json!({"text": "via ctx"}), &ctx).await.unwrap();
        assert_eq!(out, "via ctx");
    }
}
