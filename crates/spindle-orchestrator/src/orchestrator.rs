// SPDX-License-Identifier: MIT OR Apache-2.0
//! The orchestrator: entry operation and global thread coordination.

use crate::entry::{EntryInput, EntryInternal, EntryResult, resolve_directive_chain, resolve_limits};
use crate::meta::{read_thread_meta, write_thread_meta};
use crate::spawn::{kill_pid, spawn_detached};
use crate::table::InProcessTable;
use crate::tools::primary_tool_schemas;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use spindle_artifact::{ArtifactSigner, ArtifactStore, ItemType};
use spindle_config::ConfigCascade;
use spindle_core::{Directive, DirectiveParser, Message, Role, ThreadStatus, generate_thread_id};
use spindle_dispatch::ToolDispatcher;
use spindle_harness::{CancellationToken, SafetyHarness, assess_capability_risk};
use spindle_ledger::BudgetLedger;
use spindle_provider::{HttpProvider, load_env_cascade, resolve_provider};
use spindle_registry::ThreadRegistry;
use spindle_runner::{RunOutcome, RunnerOptions, ThreadCoordinator, ThreadRunner};
use spindle_transcript::{EventEmitter, Transcript, TranscriptSigner};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONTINUATION_DIRECTIVE: &str = "spindle/agent/continuation";
const DEFAULT_CONTINUATION_PROMPT: &str =
    "Pick up where the previous thread left off. Continue executing the directive's instructions.";
const MAX_RESULT_CHARS: usize = 4000;

/// Orchestrator construction parameters.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Project root all durable state lives under.
    pub project_root: PathBuf,
    /// Command used to re-enter the kernel for detached spawns.
    pub spawn_command: String,
    /// Grace period between TERM and KILL.
    pub kill_grace: Duration,
}

impl OrchestratorConfig {
    /// Defaults for a project root.
    #[must_use]
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            spawn_command: "spindle-thread".to_string(),
            kill_grace: Duration::from_secs(3),
        }
    }
}

/// Result of `wait_threads`.
#[derive(Debug, Clone)]
pub struct WaitResult {
    /// Overall success: every waited thread completed.
    pub success: bool,
    /// Per-thread results (keyed by the requested, unresolved ids).
    pub results: BTreeMap<String, Value>,
}

/// Global coordination surface with in-process and cross-process semantics.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<ArtifactStore>,
    cascade: ConfigCascade,
    registry: Arc<ThreadRegistry>,
    ledger: Arc<BudgetLedger>,
    dispatcher: Arc<ToolDispatcher>,
    signer: Arc<ArtifactSigner>,
    parser: Arc<dyn DirectiveParser>,
    table: Arc<InProcessTable>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("project_root", &self.config.project_root)
            .finish_non_exhaustive()
    }
}

/// Coordinator handle the runner holds; keeps the orchestrator alive for
/// the duration of a run.
struct CoordinatorHandle(Arc<Orchestrator>);

#[async_trait]
impl ThreadCoordinator for CoordinatorHandle {
    fn register_thread(&self, thread_id: &str, cancel: CancellationToken, depth: u32) {
        self.0.table.register(thread_id, cancel, depth);
    }

    fn complete_thread(&self, thread_id: &str, result: Value) {
        self.0.table.complete(thread_id, result);
    }

    async fn handoff_thread(&self, thread_id: &str) -> anyhow::Result<String> {
        let result = Arc::clone(&self.0).handoff(thread_id, None).await;
        match result {
            Ok(new_id) => Ok(new_id),
            Err(e) => anyhow::bail!(e),
        }
    }
}

impl Orchestrator {
    /// Build an orchestrator over a project root.
    ///
    /// # Errors
    ///
    /// Durable-store open failures.
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<ArtifactStore>,
        dispatcher: Arc<ToolDispatcher>,
        signer: Arc<ArtifactSigner>,
        parser: Arc<dyn DirectiveParser>,
    ) -> anyhow::Result<Arc<Self>> {
        let registry = Arc::new(ThreadRegistry::open(&config.project_root)?);
        let ledger = Arc::new(BudgetLedger::open(&config.project_root)?);
        let cascade = ConfigCascade::for_project(&config.project_root);
        Ok(Arc::new(Self {
            config,
            store,
            cascade,
            registry,
            ledger,
            dispatcher,
            signer,
            parser,
            table: InProcessTable::shared(),
        }))
    }

    /// The durable registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    /// The budget ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    /// The in-process thread table.
    #[must_use]
    pub fn table(&self) -> &Arc<InProcessTable> {
        &self.table
    }

    // -----------------------------------------------------------------
    // Entry operation
    // -----------------------------------------------------------------

    /// Execute the thread-directive entry operation: load and verify the
    /// directive, compose its extends chain, resolve model and limits,
    /// reserve budget, register the thread, and run it (in-process for
    /// sync, detached child process for async).
    pub async fn run_directive(
        self: Arc<Self>,
        input: EntryInput,
        internal: EntryInternal,
    ) -> EntryResult {
        let directive_id = input.directive_id.clone();
        let thread_id = internal
            .thread_id_override
            .clone()
            .unwrap_or_else(|| generate_thread_id(&directive_id));
        let project_root = self.config.project_root.clone();
        let created_at = chrono::Utc::now();

        let fail = |registry: &ThreadRegistry, thread_id: &str, directive: &str, error: String| {
            let _ = registry.update_status(thread_id, ThreadStatus::Error);
            EntryResult::failure(thread_id, directive, error)
        };

        // 1. Parent context: explicit param, then environment inheritance
        //    (detached children), then root.
        let parent_thread_id = input
            .parent_thread_id
            .clone()
            .or_else(|| std::env::var("SPINDLE_PARENT_THREAD_ID").ok().filter(|s| !s.is_empty()));
        let parent_meta = match &parent_thread_id {
            Some(parent_id) => {
                let meta = read_thread_meta(&project_root, parent_id);
                if meta.is_none() {
                    return EntryResult::failure(
                        &thread_id,
                        &directive_id,
                        format!(
                            "parent thread '{parent_id}' declared but thread.json not found; \
                             misaligned parent thread data"
                        ),
                    );
                }
                meta
            }
            None => None,
        };

        // 2. Register (detached children arrive pre-registered).
        if !internal.pre_registered {
            if let Err(e) =
                self.registry
                    .register(&thread_id, &directive_id, parent_thread_id.as_deref())
            {
                return EntryResult::failure(&thread_id, &directive_id, e.to_string());
            }
        }

        // 3. Load and verify the directive.
        let artifact = match self.store.load_verified(ItemType::Directive, &directive_id) {
            Ok(artifact) => artifact,
            Err(e) => {
                return fail(&self.registry, &thread_id, &directive_id, e.to_string());
            }
        };
        let mut directive = match self.parser.parse(&directive_id, &artifact.body) {
            Ok(directive) => directive,
            Err(e) => {
                return fail(&self.registry, &thread_id, &directive_id, e.to_string());
            }
        };

        // 3.5. Extends chain and context composition.
        let mut system_prompt = String::new();
        let mut context_before = String::new();
        let mut context_after = String::new();
        let mut suppress: Vec<String> = Vec::new();
        if directive.extends.is_some() || !directive.context.is_empty() {
            let resolution =
                match resolve_directive_chain(&directive, &self.store, self.parser.as_ref()) {
                    Ok(resolution) => resolution,
                    Err(e) => return fail(&self.registry, &thread_id, &directive_id, e),
                };
            system_prompt = self.load_knowledge_blocks(&resolution.system);
            context_before = self.load_knowledge_blocks(&resolution.before);
            context_after = self.load_knowledge_blocks(&resolution.after);
            suppress = resolution.suppress;
            if let Some(inherited) = resolution.inherited_permissions {
                directive.permissions = inherited;
            }
        }

        // 3.6. Reconstruct resume messages from the previous transcript.
        let mut resume_messages: Option<Vec<Message>> = None;
        if let Some(prev_tid) = &input.previous_thread_id {
            match self.build_resume_messages(
                prev_tid,
                &directive,
                internal.continuation_message.as_deref(),
            ) {
                Ok(messages) => resume_messages = Some(messages),
                Err(e) => return fail(&self.registry, &thread_id, &directive_id, e),
            }
        }

        // 4. Limits, with the parent as upper bound.
        let resilience = match self.cascade.resilience() {
            Ok(resilience) => resilience,
            Err(e) => return fail(&self.registry, &thread_id, &directive_id, e.to_string()),
        };
        let parent_limits: Option<BTreeMap<String, f64>> = parent_meta.as_ref().and_then(|meta| {
            meta.get("limits")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
        });
        let limits = match resolve_limits(
            &resilience.limits.defaults,
            &directive.limits,
            &input.limit_overrides,
            parent_limits.as_ref(),
        ) {
            Ok(limits) => limits,
            Err(e) => return fail(&self.registry, &thread_id, &directive_id, e),
        };

        // 5. Depth: negative means the parent's depth was exhausted.
        if limits.get("depth").copied().unwrap_or(10.0) < 0.0 {
            return fail(
                &self.registry,
                &thread_id,
                &directive_id,
                format!(
                    "depth limit exhausted (resolved depth={})",
                    limits.get("depth").copied().unwrap_or(-1.0)
                ),
            );
        }
        let depth = parent_meta
            .as_ref()
            .and_then(|meta| meta.get("depth").and_then(Value::as_u64))
            .map_or(0, |d| (d + 1) as u32);

        // 6. Spawn limit on the parent.
        if let Some(parent_id) = &parent_thread_id {
            let spawn_limit = parent_limits
                .as_ref()
                .and_then(|p| p.get("spawns").copied())
                .or_else(|| limits.get("spawns").copied())
                .unwrap_or(10.0) as u32;
            let current = self.table.spawn_count(parent_id);
            if current >= spawn_limit {
                return fail(
                    &self.registry,
                    &thread_id,
                    &directive_id,
                    format!("spawn limit exceeded for parent {parent_id}: {current}/{spawn_limit}"),
                );
            }
            self.table.increment_spawn_count(parent_id);
        }

        // 7. Hooks and harness.
        let mut hooks = match self.cascade.hooks() {
            Ok(config) => config.hooks,
            Err(e) => return fail(&self.registry, &thread_id, &directive_id, e.to_string()),
        };
        hooks.extend(directive.hooks.clone());

        let parent_capabilities: Vec<String> = parent_meta
            .as_ref()
            .and_then(|meta| {
                meta.get("capabilities")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
            })
            .unwrap_or_default();

        let mut harness = SafetyHarness::new(
            &thread_id,
            &directive_id,
            limits.clone(),
            directive.permissions.clone(),
            &parent_capabilities,
        )
        .with_hooks(hooks, suppress)
        .with_inputs(input.inputs.clone())
        .with_depth(depth)
        .with_tools(primary_tool_schemas());
        if !directive.outputs.is_empty() {
            harness = harness.with_output_fields(
                directive.outputs.iter().map(|o| o.name.clone()).collect(),
            );
        }

        // Risk assessment on the effective capability set.
        let risk_config = self.cascade.capability_risk().unwrap_or_default();
        let acknowledged: HashSet<String> = directive
            .acknowledged_risks
            .iter()
            .map(|a| a.risk.clone())
            .collect();
        if let Err(violation) = assess_capability_risk(
            harness.capabilities(),
            &acknowledged,
            &risk_config,
            &thread_id,
        ) {
            return fail(&self.registry, &thread_id, &directive_id, violation.to_string());
        }

        // 8. Budget reservation.
        let spend_limit = limits.get("spend").copied().unwrap_or(1.0);
        let budget_result = match &parent_thread_id {
            Some(parent_id) => self.ledger.reserve(&thread_id, spend_limit, parent_id),
            None => self.ledger.register(&thread_id, spend_limit),
        };
        if let Err(e) = budget_result {
            return fail(
                &self.registry,
                &thread_id,
                &directive_id,
                format!("budget reservation failed: {e}"),
            );
        }

        // 9. Model → provider resolution.
        let model = input
            .model
            .clone()
            .or_else(|| directive.model.id.clone())
            .or_else(|| directive.model.tier.clone())
            .unwrap_or_else(|| "general".to_string());
        let resolved = match resolve_provider(
            &model,
            directive.model.provider.as_deref(),
            &self.store,
        ) {
            Ok(resolved) => resolved,
            Err(e) => return fail(&self.registry, &thread_id, &directive_id, e.to_string()),
        };

        // 10. Mark running and write the signed metadata snapshot.
        let _ = self.registry.update_status(&thread_id, ThreadStatus::Running);
        let _ = self
            .registry
            .set_permission_context(&thread_id, harness.capabilities().to_vec());
        let meta = thread_meta_map(
            &thread_id,
            &directive_id,
            "running",
            created_at,
            Some(&resolved.model),
            &limits,
            harness.capabilities(),
            depth,
            None,
            None,
        );
        if let Err(e) = write_thread_meta(&project_root, &thread_id, meta, &self.signer) {
            return fail(&self.registry, &thread_id, &directive_id, e.to_string());
        }

        // 11. Detached spawn for async.
        if input.r#async {
            return self.spawn_async(&input, &thread_id, &directive_id);
        }

        // 12. Run synchronously.
        let env = load_env_cascade(dirs::home_dir().as_deref(), &project_root);
        let provider = HttpProvider::new(
            resolved.model.clone(),
            resolved.provider_item_id.clone(),
            resolved.config,
            env,
        );
        let transcript = match Transcript::open(&thread_id, &project_root) {
            Ok(transcript) => Arc::new(transcript),
            Err(e) => return fail(&self.registry, &thread_id, &directive_id, e.to_string()),
        };
        let events_config = self.cascade.events().unwrap_or_default();
        let coordination = self.cascade.coordination().unwrap_or_default();

        let directive_intent: String = [
            directive_id.as_str(),
            directive.description.as_str(),
            directive.body.trim(),
        ]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

        let runner = ThreadRunner {
            thread_id: thread_id.clone(),
            harness: Arc::new(harness),
            provider,
            dispatcher: Arc::clone(&self.dispatcher),
            emitter: EventEmitter::new(events_config),
            transcript,
            registry: Arc::clone(&self.registry),
            signer: Arc::clone(&self.signer),
            coordination,
            retry_policy: resilience.retry.clone(),
            coordinator: Arc::new(CoordinatorHandle(Arc::clone(&self))),
        };

        let previous_thread_id = input.previous_thread_id.clone();
        let outcome = runner
            .run(RunnerOptions {
                user_prompt: directive.build_prompt(),
                system_prompt,
                directive_body: directive_intent,
                context_before,
                context_after,
                resume_messages,
                previous_thread_id,
                inputs: input.inputs.clone(),
                extra_sinks: Vec::new(),
            })
            .await;

        // 13. Budget: report, cascade, release.
        let actual_spend = outcome.cost.spend;
        if let Err(e) = self.ledger.report_actual(&thread_id, actual_spend) {
            tracing::warn!(target: "spindle.orchestrator", error = %e, "spend report failed");
        }
        if let Some(parent_id) = &parent_thread_id {
            let _ = self.ledger.cascade_spend(&thread_id, parent_id, actual_spend);
        }
        let _ = self.ledger.release(&thread_id);

        // 14. Final registry status, result, and metadata snapshot.
        let _ = self.registry.update_status(&thread_id, outcome.status);
        let mut result_data = json!({"cost": outcome.cost});
        if let Some(outputs) = &outcome.outputs {
            result_data["outputs"] = outputs.clone();
        }
        let _ = self.registry.set_result(&thread_id, result_data);
        if let Some(new_id) = &outcome.continuation_thread_id {
            let _ = self.registry.set_continuation(&thread_id, new_id);
            let chain = self.registry.get_chain(&thread_id);
            let root = chain
                .first()
                .map_or_else(|| thread_id.clone(), |r| r.thread_id.clone());
            let _ = self.registry.set_chain_info(new_id, &root, &thread_id);
        }

        let meta = thread_meta_map(
            &thread_id,
            &directive_id,
            outcome.status.as_str(),
            created_at,
            Some(&resolved.model),
            &limits,
            &self
                .registry
                .get_thread(&thread_id)
                .map(|r| r.permission_context)
                .unwrap_or_default(),
            depth,
            Some(&outcome.cost),
            outcome.outputs.as_ref(),
        );
        let _ = write_thread_meta(&project_root, &thread_id, meta, &self.signer);

        entry_result_from_outcome(&directive_id, outcome)
    }

    fn load_knowledge_blocks(&self, ids: &[String]) -> String {
        let mut parts: Vec<String> = Vec::new();
        for id in ids {
            match self.store.load_verified(ItemType::Knowledge, id) {
                Ok(artifact) => {
                    let trimmed = artifact.body.trim();
                    if !trimmed.is_empty() {
                        parts.push(trimmed.to_string());
                    }
                }
                Err(e) => {
                    tracing::warn!(target: "spindle.orchestrator", knowledge = %id, error = %e, "context knowledge skipped");
                }
            }
        }
        parts.join("\n\n")
    }

    /// Verify the previous transcript, reconstruct its messages, trim the
    /// trailing window to the resume ceiling, and append the continuation
    /// prompt.
    fn build_resume_messages(
        &self,
        prev_tid: &str,
        directive: &Directive,
        continuation_message: Option<&str>,
    ) -> Result<Vec<Message>, String> {
        let coordination = self.cascade.coordination().unwrap_or_default();
        let prev_transcript = Transcript::open(prev_tid, &self.config.project_root)
            .map_err(|e| format!("cannot open previous transcript for {prev_tid}: {e}"))?;

        let lenient = coordination.continuation.transcript_integrity == "lenient";
        let verification =
            TranscriptSigner::verify(prev_transcript.path(), self.store.trust(), lenient);
        if !verification.valid {
            return Err(format!(
                "transcript integrity check failed for {prev_tid}: {}; cannot resume from an untrusted transcript",
                verification
                    .error
                    .unwrap_or_else(|| "unknown failure".to_string())
            ));
        }

        let full_messages = prev_transcript
            .reconstruct_messages()
            .map_err(|e| format!("cannot reconstruct messages for {prev_tid}: {e}"))?
            .ok_or_else(|| format!("cannot reconstruct messages for {prev_tid}: transcript empty"))?;

        // Trim trailing messages to the resume ceiling.
        let ceiling = coordination.continuation.resume_ceiling_tokens;
        let mut trailing: Vec<Message> = Vec::new();
        let mut trailing_tokens: u64 = 0;
        for msg in full_messages.iter().rev() {
            let msg_tokens = (msg.content.len() / 4) as u64;
            if trailing_tokens + msg_tokens > ceiling {
                break;
            }
            trailing.insert(0, msg.clone());
            trailing_tokens += msg_tokens;
        }
        if trailing.is_empty() {
            if let Some(last) = full_messages.last() {
                trailing.push(last.clone());
            }
        }
        // Providers require the conversation to open with a user message.
        while trailing.first().is_some_and(|m| m.role != Role::User) {
            trailing.remove(0);
        }

        if let Err(shape) = spindle_core::validate_conversation_shape(&trailing) {
            return Err(format!(
                "reconstructed conversation for {prev_tid} is malformed: {shape}"
            ));
        }

        // Continuation prompt: per-directive override or the system default
        // directive, falling back to the plain default message.
        let cont_directive_id = directive
            .continuation_directive
            .clone()
            .unwrap_or_else(|| DEFAULT_CONTINUATION_DIRECTIVE.to_string());
        let base_message =
            continuation_message.unwrap_or(DEFAULT_CONTINUATION_PROMPT).to_string();
        let cont_prompt = self
            .store
            .load_verified(ItemType::Directive, &cont_directive_id)
            .ok()
            .and_then(|artifact| self.parser.parse(&cont_directive_id, &artifact.body).ok())
            .map(|d| d.body)
            .filter(|body| !body.trim().is_empty())
            .unwrap_or(base_message);

        trailing.push(Message::user(cont_prompt));
        Ok(trailing)
    }

    fn spawn_async(
        &self,
        input: &EntryInput,
        thread_id: &str,
        directive_id: &str,
    ) -> EntryResult {
        let mut child_params = json!({
            "directive_id": directive_id,
            "inputs": input.inputs,
        });
        if let Some(model) = &input.model {
            child_params["model"] = json!(model);
        }
        if !input.limit_overrides.is_empty() {
            child_params["limit_overrides"] = json!(input.limit_overrides);
        }
        if let Some(prev) = &input.previous_thread_id {
            child_params["previous_thread_id"] = json!(prev);
        }
        if let Some(parent) = &input.parent_thread_id {
            child_params["parent_thread_id"] = json!(parent);
        }

        let thread_dir = self
            .config
            .project_root
            .join(".ai")
            .join("agent")
            .join("threads")
            .join(thread_id);
        let log_path = thread_dir.join("spawn.log");

        let args = vec![
            "run".to_string(),
            "--params".to_string(),
            child_params.to_string(),
            "--project-path".to_string(),
            self.config.project_root.display().to_string(),
            "--thread-id".to_string(),
            thread_id.to_string(),
            "--pre-registered".to_string(),
        ];

        match spawn_detached(
            &self.config.spawn_command,
            &args,
            &log_path,
            &spawn_env(thread_id),
        ) {
            Ok(pid) => {
                let _ = self.registry.set_pid(thread_id, pid);
                EntryResult {
                    success: true,
                    thread_id: thread_id.to_string(),
                    status: ThreadStatus::Running,
                    directive: directive_id.to_string(),
                    pid: Some(pid),
                    cost: None,
                    result_text: None,
                    outputs: None,
                    error: None,
                    continuation_thread_id: None,
                }
            }
            Err(e) => {
                let _ = self.registry.update_status(thread_id, ThreadStatus::Error);
                EntryResult::failure(
                    thread_id,
                    directive_id,
                    format!("failed to spawn async thread: {e}"),
                )
            }
        }
    }

    // -----------------------------------------------------------------
    // Continuation machinery
    // -----------------------------------------------------------------

    /// Follow continuation links to the terminal thread, with cycle
    /// detection (stops at the first revisited id).
    #[must_use]
    pub fn resolve_thread_chain(&self, thread_id: &str) -> String {
        let mut current = thread_id.to_string();
        let mut visited: HashSet<String> = HashSet::new();
        loop {
            if !visited.insert(current.clone()) {
                return current;
            }
            let Some(record) = self.registry.get_thread(&current) else {
                return current;
            };
            if record.status != ThreadStatus::Continued {
                return current;
            }
            match record.continuation_thread_id {
                Some(next) => current = next,
                None => return current,
            }
        }
    }

    /// The context-exhaustion path: spawn a fresh thread for the same
    /// directive with `previous_thread_id` set, link old → new, and log
    /// the handoff on the old transcript. Returns the new thread id.
    ///
    /// # Errors
    ///
    /// A message when the thread is unknown or the continuation spawn
    /// fails.
    pub async fn handoff(
        self: Arc<Self>,
        thread_id: &str,
        continuation_message: Option<String>,
    ) -> Result<String, String> {
        let record = self
            .registry
            .get_thread(thread_id)
            .ok_or_else(|| format!("thread not found: {thread_id}"))?;

        let mut input = EntryInput::new(&record.directive_id);
        input.previous_thread_id = Some(thread_id.to_string());
        input.parent_thread_id = record.parent_id.clone();

        let result = Arc::clone(&self)
            .run_directive(
                input,
                EntryInternal {
                    continuation_message,
                    ..EntryInternal::default()
                },
            )
            .await;

        let new_thread_id = result.thread_id.clone();
        if !result.success && result.status == ThreadStatus::Error {
            return Err(result
                .error
                .unwrap_or_else(|| "continuation spawn failed".to_string()));
        }

        // Link old → new and record the chain root on the successor.
        let _ = self.registry.set_continuation(thread_id, &new_thread_id);
        let chain = self.registry.get_chain(thread_id);
        let root = chain
            .first()
            .map_or_else(|| thread_id.to_string(), |r| r.thread_id.clone());
        let _ = self
            .registry
            .set_chain_info(&new_thread_id, &root, thread_id);

        if let Ok(old_transcript) = Transcript::open(thread_id, &self.config.project_root) {
            let _ = old_transcript.write_event(
                spindle_core::event::THREAD_HANDOFF,
                json!({"new_thread_id": new_thread_id, "directive": record.directive_id}),
            );
        }

        Ok(new_thread_id)
    }

    /// Resume a terminal (but not killed) thread with an explicit user
    /// message.
    ///
    /// # Errors
    ///
    /// A message when the thread is missing, still running, or killed.
    pub async fn resume_thread(
        self: Arc<Self>,
        thread_id: &str,
        message: &str,
    ) -> Result<String, String> {
        let resolved = self.resolve_thread_chain(thread_id);
        let record = self
            .registry
            .get_thread(&resolved)
            .ok_or_else(|| format!("thread not found: {resolved}"))?;
        if !record.status.is_terminal() {
            return Err(format!(
                "thread is still {}, cannot resume",
                record.status
            ));
        }
        if !record.status.is_resumable() {
            return Err(format!("thread was {}, cannot resume", record.status));
        }

        let new_thread_id = Arc::clone(&self)
            .handoff(&resolved, Some(message.to_string()))
            .await?;

        if let Ok(old_transcript) = Transcript::open(&resolved, &self.config.project_root) {
            let preview: String = message.chars().take(200).collect();
            let _ = old_transcript.write_event(
                spindle_core::event::THREAD_RESUMED,
                json!({
                    "new_thread_id": new_thread_id,
                    "directive": record.directive_id,
                    "message_preview": preview,
                }),
            );
        }

        Ok(new_thread_id)
    }

    // -----------------------------------------------------------------
    // Wait / cancel / kill / query
    // -----------------------------------------------------------------

    /// Wait for threads to reach a terminal state, resolving continuation
    /// chains first. In-process threads await their completion signal;
    /// cross-process threads fall back to bounded registry polling.
    pub async fn wait_threads(&self, thread_ids: &[String], timeout: Duration) -> WaitResult {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut results = BTreeMap::new();

        for thread_id in thread_ids {
            let resolved = self.resolve_thread_chain(thread_id);
            let result = self.wait_single(&resolved, deadline).await;
            results.insert(thread_id.clone(), result);
        }

        let success = !results.is_empty()
            && results
                .values()
                .all(|r| r.get("status").and_then(Value::as_str) == Some("completed"));
        WaitResult { success, results }
    }

    async fn wait_single(&self, thread_id: &str, deadline: tokio::time::Instant) -> Value {
        if let Some(result) = self.table.result(thread_id) {
            return result;
        }
        if self.table.is_live(thread_id) {
            return match self.table.wait_for(thread_id, deadline).await {
                Some(result) => result,
                None => json!({"status": "timeout", "thread_id": thread_id}),
            };
        }

        // Not in this process: the registry is the source of truth.
        loop {
            match self.registry.get_thread(thread_id) {
                Some(record) if record.status.is_terminal() => {
                    return json!({"status": record.status.as_str(), "thread_id": thread_id});
                }
                None => return json!({"status": "not_found", "thread_id": thread_id}),
                Some(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return json!({"status": "timeout", "thread_id": thread_id});
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Request cooperative cancellation of an in-process thread. The
    /// runner observes the flag at the next turn boundary.
    ///
    /// # Errors
    ///
    /// A message when the thread is not live in this process.
    pub fn cancel_thread(&self, thread_id: &str) -> Result<(), String> {
        match self.table.cancel_token(thread_id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(format!("thread not found in this process: {thread_id}")),
        }
    }

    /// Kill a detached thread by its recorded PID with TERM → KILL
    /// escalation, then mark it `killed`. Terminates the target's own PID
    /// only.
    ///
    /// # Errors
    ///
    /// A message when the thread or PID is unknown or signalling fails.
    pub async fn kill_thread(&self, thread_id: &str) -> Result<u32, String> {
        let record = self
            .registry
            .get_thread(thread_id)
            .ok_or_else(|| format!("thread not found: {thread_id}"))?;
        let pid = record
            .pid
            .ok_or_else(|| format!("no PID recorded for thread: {thread_id}"))?;

        kill_pid(pid, self.config.kill_grace)
            .await
            .map_err(|e| format!("failed to kill PID {pid}: {e}"))?;

        let _ = self.registry.update_status(thread_id, ThreadStatus::Killed);
        self.table
            .complete(thread_id, json!({"status": "killed", "thread_id": thread_id}));
        Ok(pid)
    }

    /// Current status: in-process result or live marker first, registry
    /// fallback.
    #[must_use]
    pub fn get_status(&self, thread_id: &str) -> Option<Value> {
        if let Some(result) = self.table.result(thread_id) {
            return Some(result);
        }
        if self.table.is_live(thread_id) {
            return Some(json!({"status": "running", "thread_id": thread_id}));
        }
        self.registry
            .get_thread(thread_id)
            .map(|record| json!({"status": record.status.as_str(), "thread_id": thread_id}))
    }

    /// Active threads: in-process live threads plus registry actives.
    #[must_use]
    pub fn list_active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.table.live_threads();
        for record in self.registry.list_active() {
            if !ids.contains(&record.thread_id) {
                ids.push(record.thread_id);
            }
        }
        ids
    }

    /// Aggregate results for a set of threads.
    #[must_use]
    pub fn aggregate_results(&self, thread_ids: &[String]) -> BTreeMap<String, Value> {
        thread_ids
            .iter()
            .map(|id| {
                let value = self.table.result(id).unwrap_or_else(|| {
                    self.registry.get_thread(id).map_or_else(
                        || json!({"status": "not_found"}),
                        |record| json!({"status": record.status.as_str(), "thread_id": id}),
                    )
                });
                (id.clone(), value)
            })
            .collect()
    }

    /// Read a thread's human-readable transcript (knowledge markdown),
    /// optionally tailing the last `tail_lines` lines.
    ///
    /// # Errors
    ///
    /// A message when the transcript does not exist.
    pub fn read_transcript(
        &self,
        thread_id: &str,
        tail_lines: Option<usize>,
    ) -> Result<String, String> {
        let transcript = Transcript::open(thread_id, &self.config.project_root)
            .map_err(|e| e.to_string())?;
        let path = transcript.knowledge_path();
        let content = std::fs::read_to_string(&path)
            .map_err(|_| format!("transcript not found for thread: {thread_id}"))?;
        Ok(match tail_lines {
            Some(n) if n > 0 => {
                let lines: Vec<&str> = content.lines().collect();
                let start = lines.len().saturating_sub(n);
                lines[start..].join("\n")
            }
            _ => content,
        })
    }

    /// Search every transcript in a thread's continuation chain.
    ///
    /// `search_type` is `text` (substring) or `regex`. Returns up to
    /// `max_results` matches as `{thread_id, line_no, snippet}`.
    ///
    /// # Errors
    ///
    /// A message when the regex is invalid.
    pub fn chain_search(
        &self,
        thread_id: &str,
        query: &str,
        search_type: &str,
        max_results: usize,
    ) -> Result<Vec<Value>, String> {
        let pattern = match search_type {
            "regex" => Some(regex::Regex::new(query).map_err(|e| format!("invalid regex: {e}"))?),
            _ => None,
        };

        let chain = self.registry.get_chain(thread_id);
        let members: Vec<String> = if chain.is_empty() {
            vec![thread_id.to_string()]
        } else {
            chain.into_iter().map(|r| r.thread_id).collect()
        };

        let mut matches = Vec::new();
        'outer: for member in members {
            let Ok(transcript) = Transcript::open(&member, &self.config.project_root) else {
                continue;
            };
            let Ok(text) = std::fs::read_to_string(transcript.path()) else {
                continue;
            };
            for (line_no, line) in text.lines().enumerate() {
                let hit = match &pattern {
                    Some(re) => re.is_match(line),
                    None => line.contains(query),
                };
                if hit {
                    let snippet: String = line.chars().take(200).collect();
                    matches.push(json!({
                        "thread_id": member,
                        "line_no": line_no + 1,
                        "snippet": snippet,
                    }));
                    if matches.len() >= max_results {
                        break 'outer;
                    }
                }
            }
        }
        Ok(matches)
    }
}

#[allow(clippy::too_many_arguments)]
fn thread_meta_map(
    thread_id: &str,
    directive_id: &str,
    status: &str,
    created_at: chrono::DateTime<chrono::Utc>,
    model: Option<&str>,
    limits: &BTreeMap<String, f64>,
    capabilities: &[String],
    depth: u32,
    cost: Option<&spindle_core::Cost>,
    outputs: Option<&Value>,
) -> Map<String, Value> {
    let mut meta = Map::new();
    meta.insert("thread_id".to_string(), json!(thread_id));
    meta.insert("directive".to_string(), json!(directive_id));
    meta.insert("status".to_string(), json!(status));
    meta.insert("created_at".to_string(), json!(created_at.to_rfc3339()));
    meta.insert(
        "updated_at".to_string(),
        json!(chrono::Utc::now().to_rfc3339()),
    );
    meta.insert("limits".to_string(), json!(limits));
    meta.insert("capabilities".to_string(), json!(capabilities));
    meta.insert("depth".to_string(), json!(depth));
    if let Some(model) = model {
        meta.insert("model".to_string(), json!(model));
    }
    if let Some(cost) = cost {
        meta.insert("cost".to_string(), json!(cost));
    }
    if let Some(outputs) = outputs {
        meta.insert("outputs".to_string(), outputs.clone());
    }
    meta
}

fn entry_result_from_outcome(directive_id: &str, outcome: RunOutcome) -> EntryResult {
    let mut result_text = outcome.result_text;
    if result_text.len() > MAX_RESULT_CHARS {
        let mut end = MAX_RESULT_CHARS;
        while end > 0 && !result_text.is_char_boundary(end) {
            end -= 1;
        }
        result_text.truncate(end);
        result_text.push_str("\n\n[... truncated]");
    }
    EntryResult {
        success: outcome.success,
        thread_id: outcome.thread_id,
        status: outcome.status,
        directive: directive_id.to_string(),
        pid: None,
        cost: Some(outcome.cost),
        result_text: Some(result_text),
        outputs: outcome.outputs,
        error: outcome.error,
        continuation_thread_id: outcome.continuation_thread_id,
    }
}

/// Environment for a detached child: parent inheritance plus a filtered
/// passthrough of what the child needs to bootstrap.
fn spawn_env(thread_id: &str) -> BTreeMap<String, String> {
    let mut envs = BTreeMap::new();
    envs.insert("SPINDLE_PARENT_THREAD_ID".to_string(), thread_id.to_string());
    for (key, value) in std::env::vars() {
        let keep = key.starts_with("SPINDLE_")
            || key.starts_with("ANTHROPIC_")
            || key.starts_with("OPENAI_")
            || key.starts_with("GOOGLE_")
            || matches!(key.as_str(), "HOME" | "PATH" | "LANG" | "TERM" | "USER");
        if keep {
            envs.entry(key).or_insert(value);
        }
    }
    envs
}
