//! The per-turn agent loop: assemble context, call the model, run requested tools in
//! order, repeat until the model answers in text or a cap is hit.

use crate::session::Session;
use anyhow::Result;
use chrono::Utc;
use pkm_context::ContextAssembler;
use pkm_llm::{ContentBlock, Message, ModelProvider, ModelRequest, Role, Usage};
use pkm_tools::ToolRegistry;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct AgentLimits {
    /// Model calls per turn.
    pub max_iterations: usize,
    pub max_turn: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStop {
    Final,
    IterationCap,
    TimeCap,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    pub text: String,
    pub stop: TurnStop,
    pub iterations: usize,
    pub tool_calls: usize,
    pub tool_errors: usize,
    pub usage: Usage,
    pub retrieved_chunks: usize,
    pub history_over_budget: bool,
    pub elapsed_ms: u64,
}

pub struct AssistantAgent {
    model: Arc<dyn ModelProvider>,
    assembler: ContextAssembler,
    tools: ToolRegistry,
    limits: AgentLimits,
}

impl AssistantAgent {
    pub fn new(
        model: Arc<dyn ModelProvider>,
        assembler: ContextAssembler,
        tools: ToolRegistry,
        limits: AgentLimits,
    ) -> Self {
        Self {
            model,
            assembler,
            tools,
            limits,
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.model()
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.names()
    }

    pub fn assembler(&self) -> &ContextAssembler {
        &self.assembler
    }

    /// Runs one user turn against `session`.
    ///
    /// The session is only written on success: its history becomes the budgeted prior
    /// history plus the complete turn. A model failure returns an error and leaves the
    /// session exactly as it was. Hitting a cap is not an error; the reply says so.
    #[tracing::instrument(level = "info", skip_all, fields(session_id = %session.id))]
    pub async fn run(&self, session: &mut Session, user_message: &str) -> Result<TurnReply> {
        let started = Instant::now();
        let deadline = started + self.limits.max_turn;
        let estimator = self.assembler.budgeter().estimator();

        tracing::info!(
            model = %self.model.model(),
            prior_history_messages = session.history.len(),
            tools_registered = self.tools.len(),
            "assistant run started"
        );

        let assembled = self.assembler.assemble(&session.history, user_message).await;
        let system = assembled.system_blocks();
        let retrieved_chunks = assembled.retrieved_chunks;
        let history_over_budget = assembled.history.over_budget;
        let base = assembled.history.messages;
        let tool_defs = self.tools.definitions();

        let mut turn = vec![Message::user_text(user_message, estimator)];
        let mut usage = Usage::default();
        let mut iterations = 0usize;
        let mut tool_calls = 0usize;
        let mut tool_errors = 0usize;
        let mut final_text = String::new();

        let stop = loop {
            if iterations >= self.limits.max_iterations {
                tracing::warn!(iterations, "assistant iteration cap reached");
                break TurnStop::IterationCap;
            }
            let Some(remaining) = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
            else {
                tracing::warn!(iterations, "assistant time cap reached");
                break TurnStop::TimeCap;
            };
            iterations += 1;

            let request = ModelRequest {
                system: system.clone(),
                messages: base.iter().chain(turn.iter()).cloned().collect(),
                tools: tool_defs.clone(),
            };
            let llm_started = Instant::now();
            let response = match tokio::time::timeout(remaining, self.model.complete(&request)).await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    tracing::error!(iteration = iterations, error = %e, "model call failed, turn abandoned");
                    return Err(anyhow::anyhow!("model call failed: {e}"));
                }
                Err(_) => {
                    tracing::warn!(iteration = iterations, "model call overran the turn time cap");
                    break TurnStop::TimeCap;
                }
            };
            usage.add(&response.usage);
            tracing::info!(
                iteration = iterations,
                latency_ms = llm_started.elapsed().as_millis() as u64,
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                cache_creation_input_tokens = response.usage.cache_creation_input_tokens,
                cache_read_input_tokens = response.usage.cache_read_input_tokens,
                stop_reason = %response.stop_reason,
                "assistant llm call completed"
            );

            if !response.has_tool_uses() {
                final_text = response.text();
                let content = if response.content.is_empty() {
                    vec![ContentBlock::text("(empty response)")]
                } else {
                    response.content
                };
                turn.push(Message::new(Role::Assistant, content, estimator));
                break TurnStop::Final;
            }

            let calls: Vec<(String, String, serde_json::Value)> = response
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => {
                        Some((id.clone(), name.clone(), input.clone()))
                    }
                    _ => None,
                })
                .collect();
            turn.push(Message::new(Role::Assistant, response.content, estimator));

            // Every call gets a result, even when the clock has run out, so the stored
            // history never holds a tool use without its answer.
            let mut results = Vec::with_capacity(calls.len());
            for (id, name, input) in &calls {
                tool_calls += 1;
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    tool_errors += 1;
                    let skipped = serde_json::json!({
                        "outcome": "skipped",
                        "error": "turn time limit reached before this call ran",
                    });
                    results.push(ContentBlock::tool_result(id, skipped.to_string(), true));
                    continue;
                }
                // A running tool is abandoned at the deadline; dropping the dispatch stops it.
                match tokio::time::timeout(remaining, self.tools.dispatch(id, name, input)).await {
                    Ok(dispatched) => {
                        if dispatched.is_error {
                            tool_errors += 1;
                        }
                        results.push(dispatched.block);
                    }
                    Err(_) => {
                        tool_errors += 1;
                        tracing::warn!(tool = %name, tool_call_id = %id, "tool call overran the turn time cap");
                        let timed_out = serde_json::json!({
                            "outcome": "timeout",
                            "error": "turn time limit reached while this call was running",
                        });
                        results.push(ContentBlock::tool_result(id, timed_out.to_string(), true));
                    }
                }
            }
            turn.push(Message::new(Role::Tool, results, estimator));
        };

        let text = match stop {
            TurnStop::Final => final_text,
            cap => {
                let note = cap_reply(cap, iterations, self.limits.max_turn, &turn);
                turn.push(Message::assistant_text(note.clone(), estimator));
                note
            }
        };

        let mut history = base;
        history.extend(turn);
        for message in &mut history {
            message.refresh_token_estimate(estimator);
        }
        session.history = history;
        session.usage_totals.add(&usage);
        session.turns += 1;
        session.last_active = Utc::now();

        let reply = TurnReply {
            text,
            stop,
            iterations,
            tool_calls,
            tool_errors,
            usage,
            retrieved_chunks,
            history_over_budget,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            stop = ?reply.stop,
            iterations = reply.iterations,
            tool_calls = reply.tool_calls,
            tool_errors = reply.tool_errors,
            elapsed_ms = reply.elapsed_ms,
            session_history_messages = session.history.len(),
            "assistant run completed"
        );
        Ok(reply)
    }
}

fn cap_reply(stop: TurnStop, iterations: usize, max_turn: Duration, turn: &[Message]) -> String {
    let mut out = match stop {
        TurnStop::IterationCap => format!(
            "I stopped after {iterations} model calls, the limit for one request, before \
             reaching a final answer."
        ),
        _ => format!(
            "I stopped after {}s, the time limit for one request, before reaching a final answer.",
            max_turn.as_secs()
        ),
    };
    let progress = turn
        .iter()
        .rev()
        .filter(|m| m.role == Role::Assistant)
        .map(Message::text)
        .find(|t| !t.trim().is_empty());
    if let Some(progress) = progress {
        out.push_str("\n\nLatest progress:\n");
        out.push_str(progress.trim());
    }
    out.push_str("\n\nAsk me to continue if you need more.");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pkm_context::{AssemblerSettings, HistoryBudgeter, StaticProfile};
    use pkm_llm::{CharRatioEstimator, LlmError, ModelResponse};
    use pkm_tools::{
        CommandValidator, ExecuteShellTool, ExecutionPolicy, SandboxedExecutor, Tool, ToolSpec,
    };
    use serde_json::json;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;

    /// Replays canned responses and records every request it sees.
    struct ScriptedModel {
        replies: Mutex<VecDeque<pkm_llm::Result<ModelResponse>>>,
        requests: Mutex<Vec<ModelRequest>>,
        delay: Duration,
    }

    impl ScriptedModel {
        fn new(replies: Vec<pkm_llm::Result<ModelResponse>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
                delay,
            })
        }

        fn requests(&self) -> Vec<ModelRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedModel {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: &ModelRequest) -> pkm_llm::Result<ModelResponse> {
            self.requests.lock().unwrap().push(request.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.replies.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(tool_use("tu_loop", "echo", json!({ "text": "again" }))))
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".to_string(),
                description: "Echo".to_string(),
                parameters_schema: json!({
                    "type": "object",
                    "properties": { "text": { "type": "string" } },
                    "required": ["text"]
                }),
            }
        }

        async fn execute(&self, arguments: serde_json::Value) -> pkm_tools::Result<serde_json::Value> {
            Ok(json!({ "echo": arguments["text"] }))
        }
    }

    fn usage(input: u64, output: u64) -> Usage {
        Usage {
            input_tokens: input,
            output_tokens: output,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: input / 2,
        }
    }

    fn text_reply(text: &str) -> ModelResponse {
        ModelResponse {
            content: vec![ContentBlock::text(text)],
            usage: usage(100, 10),
            stop_reason: "end_turn".to_string(),
        }
    }

    fn tool_use(id: &str, name: &str, input: serde_json::Value) -> ModelResponse {
        ModelResponse {
            content: vec![
                ContentBlock::text("Let me check."),
                ContentBlock::ToolUse {
                    id: id.to_string(),
                    name: name.to_string(),
                    input,
                },
            ],
            usage: usage(120, 20),
            stop_reason: "tool_use".to_string(),
        }
    }

    fn assembler(budget: usize, preserve_turns: usize) -> ContextAssembler {
        ContextAssembler::new(
            "Be brief.",
            Arc::new(StaticProfile::new("Name: Sam")),
            None,
            HistoryBudgeter::new(Arc::new(CharRatioEstimator::default()), 1_000),
            AssemblerSettings {
                history_token_budget: budget,
                preserve_turns,
                retrieval_limit: 5,
                min_similarity: 0.6,
            },
        )
    }

    fn registry(notes_root: &std::path::Path) -> ToolRegistry {
        registry_with_command_timeout(notes_root, Duration::from_millis(200))
    }

    fn registry_with_command_timeout(notes_root: &std::path::Path, timeout: Duration) -> ToolRegistry {
        let executor = SandboxedExecutor::without_audit(ExecutionPolicy {
            command_timeout: timeout,
            ..ExecutionPolicy::default()
        });
        let mut r = ToolRegistry::new();
        r.register(Arc::new(EchoTool)).unwrap();
        r.register(Arc::new(ExecuteShellTool::new(
            Arc::new(CommandValidator::new().unwrap()),
            Arc::new(executor),
            notes_root,
        )))
        .unwrap();
        r
    }

    fn agent(model: Arc<ScriptedModel>, root: &std::path::Path, limits: AgentLimits) -> AssistantAgent {
        AssistantAgent::new(model, assembler(100_000, 10), registry(root), limits)
    }

    fn limits() -> AgentLimits {
        AgentLimits {
            max_iterations: 5,
            max_turn: Duration::from_secs(30),
        }
    }

    fn assert_pairs_complete(history: &[Message]) {
        let uses: HashSet<&str> = history.iter().flat_map(|m| m.tool_use_ids()).collect();
        let results: HashSet<&str> = history.iter().flat_map(|m| m.tool_result_ids()).collect();
        assert_eq!(uses, results);
    }

    #[tokio::test]
    async fn plain_answer_completes_in_one_call() {
        let tmp = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new(vec![Ok(text_reply("Your boat is in slip 4."))]);
        let agent = agent(model.clone(), tmp.path(), limits());
        let mut session = Session::new("s");

        let reply = agent.run(&mut session, "where is my boat?").await.unwrap();
        assert_eq!(reply.stop, TurnStop::Final);
        assert_eq!(reply.text, "Your boat is in slip 4.");
        assert_eq!(reply.iterations, 1);
        assert_eq!(session.history.len(), 2);
        assert_eq!(session.history[0].text(), "where is my boat?");
        assert_eq!(session.turns, 1);
        assert_eq!(session.usage_totals.input_tokens, 100);
        assert_eq!(session.usage_totals.cache_read_input_tokens, 50);

        let requests = model.requests();
        assert_eq!(requests[0].system.len(), 4);
        assert!(requests[0].system[0].cacheable);
        assert_eq!(requests[0].system[1].text, "Name: Sam");
        let tools: Vec<&str> = requests[0].tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(tools, vec!["echo", "execute_shell"]);
    }

    #[tokio::test]
    async fn tool_timeout_is_fed_back_and_the_turn_continues() {
        let tmp = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new(vec![
            Ok(tool_use("tu_1", "execute_shell", json!({ "command": "sleep 5" }))),
            Ok(text_reply("That search took too long; try a narrower one.")),
        ]);
        let agent = agent(model.clone(), tmp.path(), limits());
        let mut session = Session::new("s");

        let reply = agent.run(&mut session, "grep everything").await.unwrap();
        assert_eq!(reply.stop, TurnStop::Final);
        assert_eq!(reply.iterations, 2);
        assert_eq!(reply.tool_calls, 1);
        assert_eq!(reply.tool_errors, 1);

        let second = &model.requests()[1];
        let last = second.messages.last().unwrap();
        assert_eq!(last.role, Role::Tool);
        match &last.content()[0] {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                assert_eq!(tool_use_id, "tu_1");
                assert!(*is_error);
                let body: serde_json::Value = serde_json::from_str(content).unwrap();
                assert_eq!(body["outcome"], "timeout");
            }
            other => panic!("expected tool result, got {other:?}"),
        }

        assert_eq!(session.history.len(), 4);
        assert_pairs_complete(&session.history);
    }

    fn tool_results(message: &Message) -> Vec<(&str, &str, bool)> {
        message
            .content()
            .iter()
            .map(|block| match block {
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => (tool_use_id.as_str(), content.as_str(), *is_error),
                other => panic!("expected tool result, got {other:?}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn calls_in_one_response_run_in_order_with_paired_results() {
        let tmp = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new(vec![
            Ok(ModelResponse {
                content: vec![
                    ContentBlock::text("Checking three things."),
                    ContentBlock::ToolUse {
                        id: "tu_1".to_string(),
                        name: "echo".to_string(),
                        input: json!({ "text": "first" }),
                    },
                    ContentBlock::ToolUse {
                        id: "tu_2".to_string(),
                        name: "teleport".to_string(),
                        input: json!({}),
                    },
                    ContentBlock::ToolUse {
                        id: "tu_3".to_string(),
                        name: "echo".to_string(),
                        input: json!({ "text": "third" }),
                    },
                ],
                usage: usage(120, 30),
                stop_reason: "tool_use".to_string(),
            }),
            Ok(text_reply("done")),
        ]);
        let agent = agent(model.clone(), tmp.path(), limits());
        let mut session = Session::new("s");

        let reply = agent.run(&mut session, "three lookups").await.unwrap();
        assert_eq!(reply.stop, TurnStop::Final);
        assert_eq!(reply.iterations, 2);
        assert_eq!(reply.tool_calls, 3);
        assert_eq!(reply.tool_errors, 1);

        let second = &model.requests()[1];
        let results = tool_results(second.messages.last().unwrap());
        let ids: Vec<&str> = results.iter().map(|r| r.0).collect();
        assert_eq!(ids, vec!["tu_1", "tu_2", "tu_3"]);
        assert_eq!(results[0].1, r#"{"echo":"first"}"#);
        assert!(results[1].2);
        assert_eq!(results[2].1, r#"{"echo":"third"}"#);
        assert_pairs_complete(&session.history);
    }

    #[tokio::test]
    async fn running_tool_is_stopped_at_the_turn_deadline() {
        let tmp = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new(vec![Ok(tool_use(
            "tu_1",
            "execute_shell",
            json!({ "command": "sleep 2; touch late.txt" }),
        ))]);
        let agent = AssistantAgent::new(
            model,
            assembler(100_000, 10),
            registry_with_command_timeout(tmp.path(), Duration::from_secs(5)),
            AgentLimits {
                max_iterations: 5,
                max_turn: Duration::from_millis(300),
            },
        );
        let mut session = Session::new("s");

        let started = Instant::now();
        let reply = agent.run(&mut session, "slow lookup").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
        assert_eq!(reply.stop, TurnStop::TimeCap);
        assert_eq!(reply.tool_calls, 1);
        assert_eq!(reply.tool_errors, 1);

        let results = tool_results(&session.history[2]);
        assert_eq!(results[0].0, "tu_1");
        let body: serde_json::Value = serde_json::from_str(results[0].1).unwrap();
        assert_eq!(body["outcome"], "timeout");
        assert_pairs_complete(&session.history);

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(!tmp.path().join("late.txt").exists());
    }

    #[tokio::test]
    async fn malformed_and_unknown_calls_do_not_end_the_turn() {
        let tmp = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new(vec![
            Ok(tool_use("tu_1", "echo", json!({ "txt": 1 }))),
            Ok(tool_use("tu_2", "teleport", json!({}))),
            Ok(text_reply("done")),
        ]);
        let agent = agent(model, tmp.path(), limits());
        let mut session = Session::new("s");

        let reply = agent.run(&mut session, "hi").await.unwrap();
        assert_eq!(reply.stop, TurnStop::Final);
        assert_eq!(reply.tool_errors, 2);
        assert_pairs_complete(&session.history);
    }

    #[tokio::test]
    async fn iteration_cap_synthesizes_a_final_message() {
        let tmp = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new(vec![]);
        let agent = agent(
            model.clone(),
            tmp.path(),
            AgentLimits {
                max_iterations: 3,
                max_turn: Duration::from_secs(30),
            },
        );
        let mut session = Session::new("s");

        let reply = agent.run(&mut session, "loop forever").await.unwrap();
        assert_eq!(reply.stop, TurnStop::IterationCap);
        assert_eq!(reply.iterations, 3);
        assert_eq!(model.requests().len(), 3);
        assert!(reply.text.contains("3 model calls"));
        assert!(reply.text.contains("Let me check."));

        let last = session.history.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.text(), reply.text);
        assert_pairs_complete(&session.history);
    }

    #[tokio::test]
    async fn time_cap_ends_a_slow_turn() {
        let tmp = tempfile::tempdir().unwrap();
        let model = ScriptedModel::slow(Duration::from_secs(5));
        let agent = agent(
            model,
            tmp.path(),
            AgentLimits {
                max_iterations: 5,
                max_turn: Duration::from_millis(100),
            },
        );
        let mut session = Session::new("s");

        let reply = agent.run(&mut session, "slow").await.unwrap();
        assert_eq!(reply.stop, TurnStop::TimeCap);
        assert!(reply.text.contains("time limit"));
        assert_eq!(session.history.len(), 2);
        assert_eq!(session.history[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn model_failure_leaves_session_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new(vec![
            Ok(tool_use("tu_1", "echo", json!({ "text": "x" }))),
            Err(LlmError::RateLimited("slow down".to_string())),
        ]);
        let agent = agent(model, tmp.path(), limits());
        let est = CharRatioEstimator::default();
        let mut session = Session::new("s");
        session.history.push(Message::user_text("earlier", &est));
        session.history.push(Message::assistant_text("answer", &est));
        let before = session.history.clone();

        let err = agent.run(&mut session, "now").await.unwrap_err();
        assert!(err.to_string().contains("model call failed"));
        assert_eq!(session.history, before);
        assert_eq!(session.turns, 0);
        assert_eq!(session.usage_totals, Usage::default());
    }

    #[tokio::test]
    async fn stored_history_is_the_budgeted_one() {
        let tmp = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new(vec![Ok(text_reply("ok"))]);
        let agent = AssistantAgent::new(model, assembler(50, 1), registry(tmp.path()), limits());
        let est = CharRatioEstimator::default();
        let mut session = Session::new("s");
        // Five turns of 20 tokens each against a 50-token budget.
        for i in 0..5 {
            session
                .history
                .push(Message::user_text(format!("{i}{}", "q".repeat(39)), &est));
            session
                .history
                .push(Message::assistant_text(format!("{i}{}", "a".repeat(39)), &est));
        }

        let reply = agent.run(&mut session, "next").await.unwrap();
        assert!(!reply.history_over_budget);
        assert_eq!(session.history.len(), 6);
        assert!(session.history[0].text().starts_with('3'));
        assert_eq!(session.history[4].text(), "next");
    }
}
