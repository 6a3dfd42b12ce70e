//! The agent loop driver and the per-user record buffer.

use crate::decision::{classify, Decision};
use chrono::Utc;
use lily_config::ConfigStore;
use lily_core::agent::{AgentLoopRecord, AgentStep, AgentStepType};
use lily_core::event::{DomainEvent, EventBus};
use lily_core::message::Role;
use lily_core::model::{first_candidate_text, LanguageModel};
use lily_core::tool::{tool_description, tool_name, ToolRouter};
use lily_memory::ConversationStore;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Hard ceiling on loop iterations; thinking-only iterations count.
const MAX_STEPS: u32 = 20;

/// Completed loops retained per user for introspection.
const LOOP_BUFFER_CAPACITY: usize = 10;

/// The reply sent when the ceiling is hit.
const SAFETY_MESSAGE: &str =
    "I'm having trouble processing this request. Please try again with a simpler question.";

/// Drives the reason-act loop and records each run.
pub struct AgentEngine {
    llm: Arc<dyn LanguageModel>,
    tools: Arc<dyn ToolRouter>,
    memory: Arc<ConversationStore>,
    config: Arc<ConfigStore>,
    event_bus: Arc<EventBus>,
    /// Completed loops per user, oldest first, bounded
    loops: RwLock<HashMap<String, VecDeque<AgentLoopRecord>>>,
    /// User id of the most recently completed loop
    last_user: RwLock<Option<String>>,
}

impl AgentEngine {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        tools: Arc<dyn ToolRouter>,
        memory: Arc<ConversationStore>,
        config: Arc<ConfigStore>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            llm,
            tools,
            memory,
            config,
            event_bus,
            loops: RwLock::new(HashMap::new()),
            last_user: RwLock::new(None),
        }
    }

    /// Run the full loop for one user message and return the reply text.
    pub async fn run(&self, user_message: &str, user_id: &str) -> String {
        info!(user_id = %user_id, "Agent loop starting");
        let mut record = AgentLoopRecord::begin(user_id, user_message);

        let system_prompt = self.config.gemini_system_prompt();
        let history = self.memory.get(user_id).await;
        let mut context = compose_context(&system_prompt, &history, user_message);
        let catalog = self.tools.catalog().await;

        let mut step: u32 = 1;
        loop {
            if step > MAX_STEPS {
                warn!(user_id = %user_id, "Step ceiling reached, aborting loop");
                record.final_response = SAFETY_MESSAGE.to_string();
                break;
            }

            let step_start = Instant::now();
            let prompt = compose_prompt(&context, &catalog);
            let response = self.llm.generate(&prompt, &catalog).await;

            let Some(text) = first_candidate_text(&response) else {
                debug!(user_id = %user_id, step, "No candidate in LLM response");
                record.steps.push(step_record(
                    step,
                    AgentStepType::Thinking,
                    "LLM returned no candidate; continuing analysis",
                    step_start,
                ));
                step += 1;
                continue;
            };

            match classify(&text) {
                Decision::Final(answer) => {
                    record.steps.push(step_record(
                        step,
                        AgentStepType::Response,
                        "Decided to provide direct response",
                        step_start,
                    ));
                    record.final_response = answer;
                    break;
                }
                Decision::ToolCall {
                    tool_name,
                    reasoning,
                    parameters,
                } => {
                    debug!(user_id = %user_id, step, tool = %tool_name, "Executing tool");
                    let result = self.tools.execute(&tool_name, parameters.clone()).await;
                    let success = result.get("status").and_then(|s| s.as_str()) != Some("error");
                    self.event_bus.publish(DomainEvent::ToolExecuted {
                        tool_name: tool_name.clone(),
                        success,
                        duration_ms: step_start.elapsed().as_millis() as u64,
                        timestamp: Utc::now(),
                    });

                    let mut tool_step = step_record(
                        step,
                        AgentStepType::ToolCall,
                        reasoning,
                        step_start,
                    );
                    tool_step.tool_name = tool_name;
                    tool_step.tool_parameters = parameters;
                    tool_step.tool_result = result.clone();
                    record.steps.push(tool_step);

                    context.push_str("\nTool execution result: ");
                    context.push_str(&result.to_string());
                    step += 1;
                }
                Decision::Thinking(reasoning) => {
                    record.steps.push(step_record(
                        step,
                        AgentStepType::Thinking,
                        reasoning,
                        step_start,
                    ));
                    step += 1;
                }
            }
        }

        record.finish();
        let final_response = record.final_response.clone();

        self.memory.append(user_id, Role::User, user_message).await;
        self.memory
            .append(user_id, Role::Assistant, final_response.clone())
            .await;

        self.event_bus.publish(DomainEvent::ResponseGenerated {
            user_id: user_id.to_string(),
            steps: record.steps.len(),
            timestamp: Utc::now(),
        });
        info!(
            user_id = %user_id,
            steps = record.steps.len(),
            duration_seconds = record.duration_seconds,
            "Agent loop finished"
        );

        self.push_record(record).await;
        final_response
    }

    async fn push_record(&self, record: AgentLoopRecord) {
        let user_id = record.user_id.clone();
        {
            let mut guard = self.loops.write().await;
            let buffer = guard.entry(user_id.clone()).or_default();
            buffer.push_back(record);
            while buffer.len() > LOOP_BUFFER_CAPACITY {
                buffer.pop_front();
            }
        }
        *self.last_user.write().await = Some(user_id);
    }

    /// The most recently completed loop across all users.
    pub async fn last_loop(&self) -> Option<AgentLoopRecord> {
        let user = self.last_user.read().await.clone()?;
        self.loops
            .read()
            .await
            .get(&user)
            .and_then(|buffer| buffer.back().cloned())
    }

    /// Retained loops for one user, oldest first.
    pub async fn loops_for_user(&self, user_id: &str) -> Vec<AgentLoopRecord> {
        self.loops
            .read()
            .await
            .get(user_id)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop the retained loops for one user.
    pub async fn clear_loops(&self, user_id: &str) {
        self.loops.write().await.remove(user_id);
    }

    /// User ids with at least one retained loop.
    pub async fn users_with_loops(&self) -> Vec<String> {
        self.loops
            .read()
            .await
            .iter()
            .filter(|(_, buffer)| !buffer.is_empty())
            .map(|(user, _)| user.clone())
            .collect()
    }
}

fn step_record(
    step_number: u32,
    step_type: AgentStepType,
    reasoning: impl Into<String>,
    started: Instant,
) -> AgentStep {
    AgentStep {
        step_number,
        step_type,
        reasoning: reasoning.into(),
        tool_name: String::new(),
        tool_parameters: serde_json::Value::Null,
        tool_result: serde_json::Value::Null,
        timestamp: Utc::now(),
        duration_seconds: started.elapsed().as_secs_f64(),
    }
}

/// Seed the loop context from the system prompt and stored history.
fn compose_context(
    system_prompt: &str,
    history: &[lily_core::message::Message],
    user_message: &str,
) -> String {
    let mut context = String::from(system_prompt);
    if !history.is_empty() {
        context.push_str("\n\nConversation history:\n");
        for msg in history {
            context.push_str(&format!("{}: {}\n", msg.role, msg.content));
        }
    }
    context.push_str("\nCurrent user message: ");
    context.push_str(user_message);
    context
}

/// Compose the per-step prompt: role, context, tool list, instructions.
fn compose_prompt(context: &str, catalog: &[serde_json::Value]) -> String {
    let mut prompt = String::from(
        "You are Lily, an intelligent AI assistant that can use tools to help users.\n\n",
    );
    prompt.push_str(context);

    if catalog.is_empty() {
        prompt.push_str("\n\nNo tools are available.");
    } else {
        prompt.push_str("\n\nAvailable tools:\n");
        for (i, tool) in catalog.iter().enumerate() {
            let name = tool_name(tool).unwrap_or("unknown");
            prompt.push_str(&format!("{}. {}: {}\n", i + 1, name, tool_description(tool)));
        }
    }

    prompt.push_str(
        "\nRespond with exactly one of:\n\
         TOOL_CALL:{\"tool_name\": \"...\", \"reasoning\": \"...\", \"parameters\": {...}}\n\
         FINAL_RESPONSE:<your answer to the user>\n",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lily_config::ConfigData;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    /// Scripted model: pops one reply per call, empty body when drained.
    struct ScriptedModel {
        replies: Mutex<VecDeque<Value>>,
    }

    impl ScriptedModel {
        fn new(texts: &[&str]) -> Arc<Self> {
            let replies = texts
                .iter()
                .map(|t| json!({"candidates": [{"content": {"parts": [{"text": t}]}}]}))
                .collect();
            Arc::new(Self {
                replies: Mutex::new(replies),
            })
        }

        fn always(text: &str) -> Arc<AlwaysModel> {
            Arc::new(AlwaysModel {
                text: text.to_string(),
            })
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn generate(&self, _prompt: &str, _tools: &[Value]) -> Value {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| json!({}))
        }
    }

    struct AlwaysModel {
        text: String,
    }

    #[async_trait]
    impl LanguageModel for AlwaysModel {
        fn name(&self) -> &str {
            "always"
        }
        async fn generate(&self, _prompt: &str, _tools: &[Value]) -> Value {
            json!({"candidates": [{"content": {"parts": [{"text": self.text}]}}]})
        }
    }

    /// Router with a fixed catalog and canned execution result.
    struct StubRouter {
        tools: Vec<Value>,
        result: Value,
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl StubRouter {
        fn new(tools: Vec<Value>, result: Value) -> Arc<Self> {
            Arc::new(Self {
                tools,
                result,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ToolRouter for StubRouter {
        async fn catalog(&self) -> Vec<Value> {
            self.tools.clone()
        }
        async fn execute(&self, tool_name: &str, params: Value) -> Value {
            self.calls
                .lock()
                .unwrap()
                .push((tool_name.to_string(), params));
            self.result.clone()
        }
    }

    fn engine(
        llm: Arc<dyn LanguageModel>,
        tools: Arc<dyn ToolRouter>,
    ) -> (AgentEngine, Arc<ConversationStore>) {
        let memory = Arc::new(ConversationStore::new());
        let config = Arc::new(ConfigStore::new(
            ConfigData::default(),
            "/tmp/lily-agent-test-unused.json",
        ));
        let bus = Arc::new(EventBus::default());
        (
            AgentEngine::new(llm, tools, memory.clone(), config, bus),
            memory,
        )
    }

    fn no_tools() -> Arc<StubRouter> {
        StubRouter::new(vec![], json!({}))
    }

    #[tokio::test]
    async fn direct_response_records_single_response_step() {
        let llm = ScriptedModel::new(&["FINAL_RESPONSE: hello"]);
        let (agent, memory) = engine(llm, no_tools());

        let reply = agent.run("hi", "u1").await;
        assert_eq!(reply, "hello");

        let conv = memory.get("u1").await;
        assert_eq!(conv.len(), 2);
        assert_eq!(conv[0].role, Role::User);
        assert_eq!(conv[0].content, "hi");
        assert_eq!(conv[1].role, Role::Assistant);
        assert_eq!(conv[1].content, "hello");

        let record = agent.last_loop().await.unwrap();
        assert!(record.completed);
        assert_eq!(record.steps.len(), 1);
        assert_eq!(record.steps[0].step_type, AgentStepType::Response);
        assert_eq!(record.steps[0].reasoning, "Decided to provide direct response");
        assert_eq!(record.final_response, "hello");
    }

    #[tokio::test]
    async fn single_tool_hop() {
        let llm = ScriptedModel::new(&[
            r#"TOOL_CALL:{"tool_name":"echo","reasoning":"r","parameters":{"x":1}}"#,
            "FINAL_RESPONSE: done",
        ]);
        let tools = StubRouter::new(
            vec![json!({"name": "echo", "description": "echoes"})],
            json!({"result": {"ok": true}}),
        );
        let (agent, _) = engine(llm, tools.clone());

        let reply = agent.run("use the tool", "u1").await;
        assert_eq!(reply, "done");

        let record = agent.last_loop().await.unwrap();
        assert_eq!(record.steps.len(), 2);
        assert_eq!(record.steps[0].step_type, AgentStepType::ToolCall);
        assert_eq!(record.steps[0].tool_name, "echo");
        assert_eq!(record.steps[0].tool_parameters, json!({"x": 1}));
        assert_eq!(record.steps[0].tool_result, json!({"result": {"ok": true}}));
        assert_eq!(record.steps[1].step_type, AgentStepType::Response);

        let calls = tools.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "echo");
        assert_eq!(calls[0].1, json!({"x": 1}));
    }

    #[tokio::test]
    async fn tool_error_feeds_back_and_loop_continues() {
        let llm = ScriptedModel::new(&[
            r#"TOOL_CALL:{"tool_name":"broken","parameters":{}}"#,
            "FINAL_RESPONSE: recovered",
        ]);
        let tools = StubRouter::new(
            vec![json!({"name": "broken", "description": ""})],
            json!({"status": "error", "message": "all servers failed"}),
        );
        let (agent, _) = engine(llm, tools);

        let reply = agent.run("try it", "u1").await;
        assert_eq!(reply, "recovered");
        let record = agent.last_loop().await.unwrap();
        assert_eq!(record.steps[0].tool_result["status"], "error");
    }

    #[tokio::test]
    async fn malformed_tool_call_becomes_thinking_step() {
        let llm = ScriptedModel::new(&["TOOL_CALL:{broken json", "FINAL_RESPONSE: ok"]);
        let (agent, _) = engine(llm, no_tools());

        let reply = agent.run("hi", "u1").await;
        assert_eq!(reply, "ok");
        let record = agent.last_loop().await.unwrap();
        assert_eq!(record.steps.len(), 2);
        assert_eq!(record.steps[0].step_type, AgentStepType::Thinking);
        assert!(record.steps[0].reasoning.starts_with("Error parsing tool call:"));
    }

    #[tokio::test]
    async fn safety_ceiling_aborts_with_fallback_message() {
        let llm = ScriptedModel::always("still thinking about it");
        let (agent, memory) = engine(llm, no_tools());

        let reply = agent.run("hard question", "u1").await;
        assert_eq!(reply, SAFETY_MESSAGE);

        let record = agent.last_loop().await.unwrap();
        assert!(record.completed);
        assert_eq!(record.steps.len(), MAX_STEPS as usize);
        assert!(record
            .steps
            .iter()
            .all(|s| s.step_type == AgentStepType::Thinking));

        // Both turns land in memory even on abort
        assert_eq!(memory.get("u1").await.len(), 2);
    }

    #[tokio::test]
    async fn empty_llm_body_counts_toward_ceiling() {
        // Script is empty: every call yields an empty body
        let llm = ScriptedModel::new(&[]);
        let (agent, _) = engine(llm, no_tools());

        let reply = agent.run("hello?", "u1").await;
        assert_eq!(reply, SAFETY_MESSAGE);
        let record = agent.last_loop().await.unwrap();
        assert_eq!(record.steps.len(), MAX_STEPS as usize);
    }

    #[tokio::test]
    async fn step_numbers_are_contiguous_and_response_is_last() {
        let llm = ScriptedModel::new(&[
            "hmm",
            r#"TOOL_CALL:{"tool_name":"echo","parameters":{}}"#,
            "FINAL_RESPONSE: end",
        ]);
        let tools = StubRouter::new(
            vec![json!({"name": "echo", "description": ""})],
            json!({"status": "success"}),
        );
        let (agent, _) = engine(llm, tools);

        agent.run("go", "u1").await;
        let record = agent.last_loop().await.unwrap();
        for (i, step) in record.steps.iter().enumerate() {
            assert_eq!(step.step_number, i as u32 + 1);
        }
        let responses: Vec<_> = record
            .steps
            .iter()
            .filter(|s| s.step_type == AgentStepType::Response)
            .collect();
        assert_eq!(responses.len(), 1);
        assert_eq!(
            record.steps.last().unwrap().step_type,
            AgentStepType::Response
        );
    }

    #[tokio::test]
    async fn ring_buffer_keeps_last_ten() {
        let llm = ScriptedModel::always("FINAL_RESPONSE: ok");
        let (agent, _) = engine(llm, no_tools());

        for i in 0..12 {
            agent.run(&format!("msg {i}"), "u1").await;
        }
        let loops = agent.loops_for_user("u1").await;
        assert_eq!(loops.len(), 10);
        // Oldest two were evicted
        assert_eq!(loops[0].user_message, "msg 2");
        assert_eq!(loops[9].user_message, "msg 11");
    }

    #[tokio::test]
    async fn clear_loops_removes_history() {
        let llm = ScriptedModel::always("FINAL_RESPONSE: ok");
        let (agent, _) = engine(llm, no_tools());
        agent.run("hi", "u1").await;
        agent.clear_loops("u1").await;
        assert!(agent.loops_for_user("u1").await.is_empty());
    }

    #[tokio::test]
    async fn users_with_loops_lists_active_buffers() {
        let llm = ScriptedModel::always("FINAL_RESPONSE: ok");
        let (agent, _) = engine(llm, no_tools());
        agent.run("hi", "u1").await;
        agent.run("hi", "u2").await;
        let mut users = agent.users_with_loops().await;
        users.sort();
        assert_eq!(users, vec!["u1".to_string(), "u2".to_string()]);

        agent.clear_loops("u1").await;
        assert_eq!(agent.users_with_loops().await, vec!["u2".to_string()]);
    }

    #[tokio::test]
    async fn history_is_embedded_in_context() {
        let history = vec![
            lily_core::message::Message::user("earlier question"),
            lily_core::message::Message::assistant("earlier answer"),
        ];
        let context = compose_context("You are Lily.", &history, "follow-up");
        assert!(context.starts_with("You are Lily."));
        assert!(context.contains("user: earlier question"));
        assert!(context.contains("assistant: earlier answer"));
        assert!(context.ends_with("Current user message: follow-up"));
    }

    #[test]
    fn prompt_lists_tools_with_descriptions() {
        let catalog = vec![
            json!({"name": "web_search", "description": "Search the web"}),
            json!({"name": "echo", "description": "Echo input"}),
        ];
        let prompt = compose_prompt("ctx", &catalog);
        assert!(prompt.contains("1. web_search: Search the web"));
        assert!(prompt.contains("2. echo: Echo input"));
        assert!(prompt.contains("TOOL_CALL:"));
        assert!(prompt.contains("FINAL_RESPONSE:"));
    }

    #[test]
    fn prompt_without_tools_says_so() {
        let prompt = compose_prompt("ctx", &[]);
        assert!(prompt.contains("No tools are available."));
    }
}
