//! Runtime introspection tools, resources and prompts
//!
//! Registered by the reference binary so a fresh server has something to
//! serve. Everything here goes through the public store and tracker APIs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::mcp::context::RequestContext;
use crate::progress::ProgressTracker;
use crate::registry::{
    HandlerError, PromptArgument, PromptDefinition, PromptInfo, PromptProvider, ResourceContents,
    ResourceDefinition, ResourceHandler, ResourceInfo, ResourceProvider, ResourceTemplateInfo,
    ToolDefinition, ToolHandler, ToolInfo, ToolOutput, ToolProvider,
};
use crate::session::SessionStore;

pub const ACTIVE_SESSIONS_URI: &str = "runtime://sessions/active";
pub const SESSION_TEMPLATE_URI: &str = "runtime://sessions/{sessionId}";

const MAX_SIMULATED_STEPS: u32 = 1_000;
const MAX_STEP_DELAY_MS: u64 = 5_000;

/// Contributes the runtime's own tools, resources and prompts.
#[derive(Clone)]
pub struct RuntimeProvider {
    sessions: Arc<dyn SessionStore>,
    progress: Arc<ProgressTracker>,
}

impl RuntimeProvider {
    pub fn new(sessions: Arc<dyn SessionStore>, progress: Arc<ProgressTracker>) -> Self {
        Self { sessions, progress }
    }
}

fn bound_session(ctx: &RequestContext) -> Result<&str, HandlerError> {
    ctx.session_id()
        .ok_or_else(|| HandlerError::InvalidParams("request is not bound to a session".to_string()))
}

fn parse_arguments<T: for<'de> Deserialize<'de>>(
    arguments: Map<String, Value>,
) -> Result<T, HandlerError> {
    serde_json::from_value(Value::Object(arguments))
        .map_err(|err| HandlerError::InvalidParams(err.to_string()))
}

#[derive(Debug, Deserialize)]
struct AttributeKey {
    key: String,
}

#[derive(Debug, Deserialize)]
struct AttributeAssignment {
    key: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimulateProgressArgs {
    steps: u32,
    #[serde(default)]
    delay_ms: u64,
}

struct GetAttribute(Arc<dyn SessionStore>);

#[async_trait]
impl ToolHandler for GetAttribute {
    async fn call(
        &self,
        ctx: &RequestContext,
        arguments: Map<String, Value>,
    ) -> Result<ToolOutput, HandlerError> {
        let session_id = bound_session(ctx)?;
        let AttributeKey { key } = parse_arguments(arguments)?;

        let session = self
            .0
            .get_session(session_id)
            .await?
            .ok_or_else(|| HandlerError::NotFound(format!("session {session_id}")))?;
        let value = session.attributes.get(&key).cloned().unwrap_or(Value::Null);

        let mut structured = Map::new();
        structured.insert("key".to_string(), Value::String(key));
        structured.insert("value".to_string(), value.clone());
        Ok(ToolOutput::structured(value.to_string(), structured))
    }
}

struct SetAttribute(Arc<dyn SessionStore>);

#[async_trait]
impl ToolHandler for SetAttribute {
    async fn call(
        &self,
        ctx: &RequestContext,
        arguments: Map<String, Value>,
    ) -> Result<ToolOutput, HandlerError> {
        let session_id = bound_session(ctx)?;
        let AttributeAssignment { key, value } = parse_arguments(arguments)?;

        if !self.0.set_attribute(session_id, &key, value).await? {
            return Err(HandlerError::NotFound(format!("session {session_id}")));
        }
        Ok(ToolOutput::text(format!("attribute '{key}' stored")))
    }
}

struct SimulateProgress(Arc<ProgressTracker>);

#[async_trait]
impl ToolHandler for SimulateProgress {
    async fn call(
        &self,
        ctx: &RequestContext,
        arguments: Map<String, Value>,
    ) -> Result<ToolOutput, HandlerError> {
        let session_id = bound_session(ctx)?;
        let args: SimulateProgressArgs = parse_arguments(arguments)?;
        if args.steps > MAX_SIMULATED_STEPS {
            return Err(HandlerError::InvalidParams(format!(
                "steps must not exceed {MAX_SIMULATED_STEPS}"
            )));
        }
        let delay = Duration::from_millis(args.delay_ms.min(MAX_STEP_DELAY_MS));

        let token = self
            .0
            .start(session_id, "simulate_progress", args.steps)
            .map_err(|err| HandlerError::InvalidParams(err.to_string()))?;

        for _ in 0..args.steps {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.0.step(&token);
        }
        self.0.complete(&token);

        let mut structured = Map::new();
        structured.insert("progressToken".to_string(), json!(token));
        structured.insert("steps".to_string(), json!(args.steps));
        Ok(ToolOutput::structured(
            format!("completed {} steps", args.steps),
            structured,
        ))
    }
}

struct ActiveSessions(Arc<dyn SessionStore>);

#[async_trait]
impl ResourceHandler for ActiveSessions {
    async fn read(
        &self,
        _ctx: &RequestContext,
        uri: &str,
        _variables: &HashMap<String, String>,
    ) -> Result<ResourceContents, HandlerError> {
        let active = self.0.active_session_count().await?;
        Ok(ResourceContents::json(uri, &json!({ "activeSessions": active })))
    }
}

struct SessionSnapshot(Arc<dyn SessionStore>);

#[async_trait]
impl ResourceHandler for SessionSnapshot {
    async fn read(
        &self,
        _ctx: &RequestContext,
        uri: &str,
        variables: &HashMap<String, String>,
    ) -> Result<ResourceContents, HandlerError> {
        let session_id = variables
            .get("sessionId")
            .ok_or_else(|| HandlerError::InvalidParams("sessionId missing".to_string()))?;

        let session = self
            .0
            .get_session(session_id)
            .await?
            .ok_or_else(|| HandlerError::NotFound(format!("session {session_id}")))?;
        let snapshot =
            serde_json::to_value(&session).map_err(|err| HandlerError::Internal(err.to_string()))?;
        Ok(ResourceContents::json(uri, &snapshot))
    }
}

impl ToolProvider for RuntimeProvider {
    fn tools(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::new(
                ToolInfo::new(
                    "session_get_attribute",
                    "Read one attribute of the caller's session",
                    r#"{"type":"object","properties":{"key":{"type":"string"}},"required":["key"]}"#,
                ),
                Arc::new(GetAttribute(self.sessions.clone())),
            ),
            ToolDefinition::new(
                ToolInfo::new(
                    "session_set_attribute",
                    "Store one attribute on the caller's session",
                    r#"{"type":"object","properties":{"key":{"type":"string"},"value":{}},"required":["key","value"]}"#,
                ),
                Arc::new(SetAttribute(self.sessions.clone())),
            ),
            ToolDefinition::new(
                ToolInfo::new(
                    "simulate_progress",
                    "Run a no-op job that reports progress to the caller's event stream",
                    r#"{"type":"object","properties":{"steps":{"type":"integer","minimum":1,"maximum":1000},"delayMs":{"type":"integer","minimum":0}},"required":["steps"]}"#,
                ),
                Arc::new(SimulateProgress(self.progress.clone())),
            ),
        ]
    }
}

impl ResourceProvider for RuntimeProvider {
    fn resources(&self) -> Vec<ResourceDefinition> {
        vec![
            ResourceDefinition::Fixed {
                info: ResourceInfo {
                    uri: ACTIVE_SESSIONS_URI.to_string(),
                    name: "Active sessions".to_string(),
                    description: Some("Number of live sessions in the store".to_string()),
                    mime_type: Some("application/json".to_string()),
                },
                handler: Arc::new(ActiveSessions(self.sessions.clone())),
            },
            ResourceDefinition::Template {
                info: ResourceTemplateInfo {
                    uri_template: SESSION_TEMPLATE_URI.to_string(),
                    name: "Session snapshot".to_string(),
                    description: Some("Timestamps and attributes of one session".to_string()),
                    mime_type: Some("application/json".to_string()),
                },
                handler: Arc::new(SessionSnapshot(self.sessions.clone())),
            },
        ]
    }
}

impl PromptProvider for RuntimeProvider {
    fn prompts(&self) -> Vec<PromptDefinition> {
        vec![PromptDefinition {
            info: PromptInfo {
                name: "summarize_session".to_string(),
                description: Some("Ask for a summary of a session's work".to_string()),
                arguments: vec![
                    PromptArgument {
                        name: "sessionId".to_string(),
                        description: None,
                        required: true,
                    },
                    PromptArgument {
                        name: "topic".to_string(),
                        description: Some("What the summary should focus on".to_string()),
                        required: false,
                    },
                ],
            },
            template: "Summarize the work done in session {sessionId} focusing on {topic}."
                .to_string(),
        }]
    }
}

#[cfg(test)]
mod tests {
    use crate::progress::NotificationHub;
    use crate::registry::{PromptRegistry, ResourceRegistry, ToolRegistry};
    use crate::session::LocalSessionStore;

    use super::*;

    struct Fixture {
        store: Arc<LocalSessionStore>,
        hub: Arc<NotificationHub>,
        tools: ToolRegistry,
        resources: ResourceRegistry,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(LocalSessionStore::new(Duration::from_secs(60)));
        let hub = Arc::new(NotificationHub::new());
        let tracker = Arc::new(ProgressTracker::new(hub.clone(), Duration::from_secs(60)));
        let provider = Arc::new(RuntimeProvider::new(store.clone(), tracker));

        Fixture {
            store,
            hub,
            tools: ToolRegistry::build(&[provider.clone() as Arc<dyn ToolProvider>])
                .expect("tools register"),
            resources: ResourceRegistry::build(&[provider as Arc<dyn ResourceProvider>])
                .expect("resources register"),
        }
    }

    fn arguments(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object arguments")
    }

    #[tokio::test]
    async fn attributes_round_trip_through_tools() {
        let fixture = fixture();
        let session = fixture.store.create_session().await.expect("session created");
        let ctx = RequestContext::new(None, Some(session.id.clone()));

        fixture
            .tools
            .call(
                &ctx,
                "session_set_attribute",
                arguments(json!({"key": "cart", "value": [1, 2]})),
            )
            .await
            .expect("set succeeds");

        let result = fixture
            .tools
            .call(&ctx, "session_get_attribute", arguments(json!({"key": "cart"})))
            .await
            .expect("get succeeds");
        let result = serde_json::to_value(result).expect("serializes");
        assert_eq!(result["structuredContent"]["value"], json!([1, 2]));
    }

    #[tokio::test]
    async fn session_tools_require_a_bound_session() {
        let fixture = fixture();
        let outcome = fixture
            .tools
            .call(
                &RequestContext::new(None, None),
                "session_get_attribute",
                arguments(json!({"key": "cart"})),
            )
            .await;

        assert!(matches!(
            outcome,
            Err(crate::registry::tools::ToolCallError::Failed(HandlerError::InvalidParams(_)))
        ));
    }

    #[tokio::test]
    async fn simulate_progress_streams_to_the_session_sink() {
        let fixture = fixture();
        let session = fixture.store.create_session().await.expect("session created");
        let (_guard, mut events) = fixture.hub.register(&session.id);
        let ctx = RequestContext::new(None, Some(session.id.clone()));

        fixture
            .tools
            .call(&ctx, "simulate_progress", arguments(json!({"steps": 2})))
            .await
            .expect("simulation runs");

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event["params"]["progress"].as_u64().expect("numeric progress"));
        }
        assert_eq!(seen, vec![0, 50, 99, 100]);
    }

    #[tokio::test]
    async fn zero_steps_is_rejected() {
        let fixture = fixture();
        let ctx = RequestContext::new(None, Some("bound".to_string()));
        let outcome = fixture
            .tools
            .call(&ctx, "simulate_progress", arguments(json!({"steps": 0})))
            .await;

        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn session_resources_report_store_state() {
        let fixture = fixture();
        let session = fixture.store.create_session().await.expect("session created");
        let ctx = RequestContext::new(None, None);

        let active = fixture
            .resources
            .read(&ctx, ACTIVE_SESSIONS_URI)
            .await
            .expect("active count reads");
        let active = serde_json::to_value(active).expect("serializes");
        assert_eq!(active["contents"][0]["text"], r#"{"activeSessions":1}"#);

        let snapshot = fixture
            .resources
            .read(&ctx, &format!("runtime://sessions/{}", session.id))
            .await
            .expect("snapshot reads");
        let snapshot = serde_json::to_value(snapshot).expect("serializes");
        let body: Value = serde_json::from_str(
            snapshot["contents"][0]["text"].as_str().expect("text content"),
        )
        .expect("json body");
        assert_eq!(body["id"], session.id);
    }

    #[test]
    fn summarize_prompt_fills_known_arguments() {
        let provider = Arc::new(RuntimeProvider::new(
            Arc::new(LocalSessionStore::new(Duration::from_secs(60))),
            Arc::new(ProgressTracker::new(
                Arc::new(NotificationHub::new()),
                Duration::from_secs(60),
            )),
        ));
        let prompts = PromptRegistry::build(&[provider as Arc<dyn PromptProvider>])
            .expect("prompts register");

        let rendered = prompts
            .get("summarize_session", &arguments(json!({"sessionId": "abc", "topic": "errors"})))
            .expect("prompt exists");
        assert_eq!(
            rendered["messages"][0]["content"]["text"],
            "Summarize the work done in session abc focusing on errors."
        );
    }
}
