//! Wires configuration into the agent and serves the HTTP API.

use crate::assistant::{AgentLimits, AssistantAgent, TurnReply};
use crate::config::PkmConfig;
use crate::routes;
use crate::session::{SessionManager, SessionStore};
use anyhow::Result;
use axum::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use chrono::{DateTime, Utc};
use pkm_context::{
    AssemblerSettings, ContextAssembler, FileProfile, HistoryBudgeter, ProfileSource,
    SqliteChunkStore, StaticProfile, VectorRetriever,
};
use pkm_llm::{AnthropicClient, CharRatioEstimator, TokenEstimator, VoyageEmbeddings};
use pkm_tools::{
    AddJournalNoteTool, CommandValidator, ExecuteScriptTool, ExecuteShellTool, ExecutionPolicy,
    JsonlAuditSink, ListFilesTool, ReadNoteTool, SandboxedExecutor, SearchNotesTool,
    SemanticSearchTool, ToolRegistry,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub struct AppState {
    pub agent: Arc<AssistantAgent>,
    pub sessions: Arc<SessionManager>,
    pub chunk_store: Option<SqliteChunkStore>,
    pub history_token_budget: usize,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Runs one turn, holding the session lock throughout. A blank or missing session id
    /// starts a new session.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn answer(&self, session_id: Option<String>, query: &str) -> Result<(String, TurnReply)> {
        let session_id = session_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut session = self.sessions.lock(&session_id).await;
        let reply = self.agent.run(&mut session, query).await?;
        // The reply is already computed; a storage failure only costs durability.
        if let Err(e) = self.sessions.persist(&session).await {
            tracing::error!(session_id = %session_id, error = %e, "session persist failed");
        }
        Ok((session_id, reply))
    }
}

pub async fn build_state(cfg: &PkmConfig) -> Result<Arc<AppState>> {
    let notes_dir = cfg.notes_dir()?;
    if !notes_dir.is_dir() {
        return Err(anyhow::anyhow!(
            "notes directory {} does not exist",
            notes_dir.display()
        ));
    }
    let api_key = cfg.anthropic_api_key().ok_or_else(|| {
        anyhow::anyhow!("ANTHROPIC_API_KEY (or keys.anthropic_api_key) is required")
    })?;
    let provider_timeout = Duration::from_secs(cfg.general.provider_timeout_seconds);
    let model = AnthropicClient::new(&api_key, &cfg.general.model, provider_timeout)
        .with_max_tokens(cfg.general.max_output_tokens);

    let chunk_store = cfg.chunk_db_path()?.map(SqliteChunkStore::new);
    let retriever = build_retriever(cfg, chunk_store.clone(), provider_timeout);

    let profile: Arc<dyn ProfileSource> = match cfg.profile_path()? {
        Some(path) => Arc::new(FileProfile::new(path)),
        None => Arc::new(StaticProfile::empty()),
    };
    let estimator: Arc<dyn TokenEstimator> =
        Arc::new(CharRatioEstimator::new(cfg.history.chars_per_token));
    let assembler = ContextAssembler::new(
        cfg.instructions().await?,
        profile,
        retriever.clone(),
        HistoryBudgeter::new(estimator, cfg.history.tool_result_threshold),
        AssemblerSettings {
            history_token_budget: cfg.history.token_budget,
            preserve_turns: cfg.history.preserve_turns,
            retrieval_limit: cfg.retrieval.limit,
            min_similarity: cfg.retrieval.min_similarity,
        },
    );

    let tools = build_tools(cfg, &notes_dir, retriever)?;
    preflight_log_tools(&tools);

    let agent = AssistantAgent::new(
        Arc::new(model),
        assembler,
        tools,
        AgentLimits {
            max_iterations: cfg.agent.max_iterations,
            max_turn: Duration::from_secs(cfg.agent.max_turn_seconds),
        },
    );

    let store = SessionStore::open(cfg.sessions_db_path()?).await?;
    let sessions = SessionManager::load_or_new(store).await?;

    Ok(Arc::new(AppState {
        agent: Arc::new(agent),
        sessions: Arc::new(sessions),
        chunk_store,
        history_token_budget: cfg.history.token_budget,
        started_at: Utc::now(),
    }))
}

fn build_retriever(
    cfg: &PkmConfig,
    chunk_store: Option<SqliteChunkStore>,
    timeout: Duration,
) -> Option<VectorRetriever> {
    if !cfg.retrieval.enabled {
        tracing::info!("retrieval disabled by configuration");
        return None;
    }
    let Some(store) = chunk_store else {
        tracing::warn!("paths.chunk_db is not set; retrieval disabled");
        return None;
    };
    let Some(key) = cfg.voyage_api_key() else {
        tracing::warn!("VOYAGE_API_KEY is not set; retrieval disabled");
        return None;
    };
    let embedder = VoyageEmbeddings::new(&key, &cfg.retrieval.embedding_model, timeout);
    Some(
        VectorRetriever::new(Arc::new(embedder), Arc::new(store))
            .with_candidate_limit(cfg.retrieval.candidate_limit),
    )
}

fn build_tools(
    cfg: &PkmConfig,
    notes_dir: &Path,
    retriever: Option<VectorRetriever>,
) -> Result<ToolRegistry> {
    let extra: Vec<(String, String)> = cfg
        .shell
        .extra_blocked_patterns
        .iter()
        .map(|p| (p.name.clone(), p.regex.clone()))
        .collect();
    let validator = Arc::new(CommandValidator::with_extra_patterns(&extra)?);

    let policy = ExecutionPolicy {
        command_timeout: Duration::from_secs(cfg.shell.command_timeout_seconds),
        script_timeout: Duration::from_secs(cfg.shell.script_timeout_seconds),
        output_bytes_max: cfg.shell.output_bytes_max,
        keep_scripts: cfg.shell.keep_scripts,
        script_dir: if cfg.shell.keep_scripts {
            Some(cfg.data_dir()?.join("scripts"))
        } else {
            None
        },
        ..ExecutionPolicy::default()
    };
    let audit = JsonlAuditSink::new(cfg.audit_log_path()?)?;
    tracing::info!(audit_log = %audit.path().display(), "execution audit log ready");
    let executor = Arc::new(SandboxedExecutor::new(policy, Arc::new(audit)));

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(ExecuteShellTool::new(
        validator.clone(),
        executor.clone(),
        notes_dir,
    )))?;
    tools.register(Arc::new(ExecuteScriptTool::new(validator, executor, notes_dir)))?;
    tools.register(Arc::new(SearchNotesTool::new(notes_dir, cfg.shell.output_bytes_max)))?;
    tools.register(Arc::new(ListFilesTool::new(notes_dir)))?;
    tools.register(Arc::new(ReadNoteTool::new(notes_dir, cfg.shell.file_bytes_max)))?;
    tools.register(Arc::new(AddJournalNoteTool::new(
        notes_dir,
        &cfg.shell.journal_path,
    )?))?;
    if let Some(retriever) = retriever {
        tools.register(Arc::new(SemanticSearchTool::new(retriever)))?;
    }
    Ok(tools)
}

fn preflight_log_tools(tools: &ToolRegistry) {
    tracing::info!(
        tool_count = tools.len(),
        tools = ?tools.names(),
        "tool registry ready"
    );
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = PkmConfig::load(config_path).await?;
    let addr: SocketAddr = cfg
        .server
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid server.bind {:?}: {e}", cfg.server.bind))?;
    tracing::info!(
        model = %cfg.general.model,
        notes_dir = %cfg.paths.notes_dir,
        %addr,
        "server configuration loaded"
    );

    let state = build_state(&cfg).await?;
    let listener = preflight_bind_listener(addr).await?;

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = routes::router()
        .layer(Extension(state.clone()))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.request_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let shutdown = CancellationToken::new();
    tracing::info!(%addr, "pkm-bridge serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");
    Ok(())
}

/// One turn from the command line; prints the reply and the session id to continue with.
pub async fn query_once(
    config_path: Option<PathBuf>,
    session_id: Option<String>,
    message: &str,
) -> Result<()> {
    if message.trim().is_empty() {
        return Err(anyhow::anyhow!("message must not be empty"));
    }
    let cfg = PkmConfig::load(config_path).await?;
    let state = build_state(&cfg).await?;
    let (session_id, reply) = state.answer(session_id, message).await?;
    println!("{}", reply.text);
    eprintln!(
        "session {session_id} | {} model call(s), {} tool call(s), {} in / {} out tokens ({} cache read)",
        reply.iterations,
        reply.tool_calls,
        reply.usage.input_tokens,
        reply.usage.output_tokens,
        reply.usage.cache_read_input_tokens
    );
    Ok(())
}

/// Checks configuration and local resources without calling any provider.
pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let started = Instant::now();
    let cfg = PkmConfig::load(config_path).await?;
    println!("config: ok (model {})", cfg.general.model);

    let notes_dir = cfg.notes_dir()?;
    if !notes_dir.is_dir() {
        return Err(anyhow::anyhow!(
            "notes directory {} does not exist",
            notes_dir.display()
        ));
    }
    println!("notes dir: {}", notes_dir.display());

    if cfg.anthropic_api_key().is_none() {
        return Err(anyhow::anyhow!("ANTHROPIC_API_KEY is not set"));
    }
    println!("anthropic key: present");
    println!(
        "voyage key: {}",
        if cfg.voyage_api_key().is_some() { "present" } else { "missing (retrieval off)" }
    );

    match cfg.chunk_db_path()? {
        Some(path) => {
            let count = SqliteChunkStore::new(&path)
                .embedded_chunk_count()
                .await
                .map_err(|e| anyhow::anyhow!("chunk db {}: {e}", path.display()))?;
            println!("chunk db: {} ({count} embedded chunks)", path.display());
        }
        None => println!("chunk db: not configured (retrieval off)"),
    }

    if let Some(path) = cfg.profile_path()? {
        let state = if path.is_file() { "found" } else { "missing" };
        println!("user profile: {} ({state})", path.display());
    }

    let tools = build_tools(&cfg, &notes_dir, None)?;
    println!("tools: {}", tools.names().join(", "));

    let store = SessionStore::open(cfg.sessions_db_path()?).await?;
    let sessions = store.load_all().await?;
    println!(
        "sessions db: {} ({} sessions)",
        store.path().display(),
        sessions.len()
    );

    tracing::info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        "doctor checks passed"
    );
    println!("doctor: ok");
    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("bind {addr}: {e}"))?;
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable, waiting for ctrl-c only");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
