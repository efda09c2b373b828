// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fallback-chain orchestration with account rotation.
//!
//! Walks a trigger's ordered `(backend, account?)` chain, checking
//! scheduler eligibility and rate-limit cooldowns per entry, and rotates
//! to the next entry when an execution reports a rate-limit cooldown. The
//! execution service itself is an external collaborator behind the
//! [`Executor`] trait.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;

use crate::backend::BackendKind;
use crate::ratelimit::RateLimitTracker;
use crate::scheduler::AdmissionScheduler;
use crate::store::{AccountRow, Store};

/// Outcome of a pre-execution budget check.
#[derive(Debug, Clone)]
pub enum BudgetDecision {
    Allowed,
    SoftWarning { message: String },
    Blocked { message: String },
}

/// Pre-execution budget policy (external collaborator). Hard limits block,
/// soft limits warn. When no policy is wired the check is treated as
/// allowed.
pub trait BudgetPolicy: Send + Sync {
    fn check(&self, trigger_id: &str) -> BudgetDecision;
}

/// One execution attempt handed to the execution service.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub trigger_id: String,
    pub message: String,
    pub backend: BackendKind,
    pub account_id: Option<i64>,
    pub env: HashMap<String, String>,
}

/// What the execution service reports back for one attempt.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub execution_id: Option<String>,
    /// Cooldown seconds when the execution hit a rate limit.
    pub rate_limited_cooldown: Option<u64>,
}

/// Execution service interface (external collaborator).
pub trait Executor: Send + Sync {
    fn run(
        &self,
        request: ExecutionRequest,
    ) -> Pin<Box<dyn Future<Output = ExecutionOutcome> + Send + '_>>;
}

/// Orchestrator wrapping the executor with fallback chains, admission
/// control, and cooldown rotation.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    scheduler: Arc<AdmissionScheduler>,
    tracker: RateLimitTracker,
    budget: Option<Arc<dyn BudgetPolicy>>,
    executor: Arc<dyn Executor>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        scheduler: Arc<AdmissionScheduler>,
        budget: Option<Arc<dyn BudgetPolicy>>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let tracker = RateLimitTracker::new(Arc::clone(&store));
        Self { store, scheduler, tracker, budget, executor }
    }

    pub fn tracker(&self) -> &RateLimitTracker {
        &self.tracker
    }

    /// Execute a trigger through its fallback chain.
    ///
    /// Returns the execution id from the first entry that runs without a
    /// rate-limit signal, or `None` when every entry was ineligible or
    /// rate-limited (or the budget blocked the run).
    pub async fn execute_with_fallback(
        &self,
        trigger_id: &str,
        message: &str,
        default_backend: BackendKind,
    ) -> Option<String> {
        let chain = self.store.fallback_chain(trigger_id).unwrap_or_default();

        if chain.is_empty() {
            // No chain configured: direct execution, backward compatible.
            let outcome = self
                .executor
                .run(ExecutionRequest {
                    trigger_id: trigger_id.to_owned(),
                    message: message.to_owned(),
                    backend: default_backend,
                    account_id: None,
                    env: HashMap::new(),
                })
                .await;
            return outcome.execution_id;
        }

        tracing::info!(trigger_id, entries = chain.len(), "executing with fallback chain");

        match self.budget.as_ref().map(|b| b.check(trigger_id)) {
            Some(BudgetDecision::Blocked { message }) => {
                tracing::warn!(trigger_id, message = %message, "budget check blocked execution");
                return None;
            }
            Some(BudgetDecision::SoftWarning { message }) => {
                tracing::warn!(trigger_id, message = %message, "soft budget limit warning");
            }
            Some(BudgetDecision::Allowed) | None => {}
        }

        for entry in chain {
            let now = Utc::now();

            let account = match entry.account_id {
                Some(account_id) => {
                    // Admission check runs per entry, not as a blanket
                    // pre-check over the whole chain.
                    let eligibility = self.scheduler.check_eligibility(account_id);
                    if !eligibility.eligible {
                        tracing::info!(
                            account_id,
                            reason = %eligibility.reason,
                            message = eligibility.message.as_deref().unwrap_or(""),
                            "scheduler paused account, trying next entry"
                        );
                        continue;
                    }
                    if self.tracker.is_rate_limited(account_id, now) {
                        tracing::info!(
                            account_id,
                            backend = %entry.backend,
                            "account rate-limited, skipping chain entry"
                        );
                        continue;
                    }
                    match self.store.account(account_id) {
                        Ok(Some(account)) => account,
                        _ => {
                            tracing::warn!(account_id, "account not found, skipping chain entry");
                            continue;
                        }
                    }
                }
                None => match self.tracker.pick_best_account(entry.backend, now) {
                    Some(account) => account,
                    None => {
                        tracing::info!(
                            backend = %entry.backend,
                            "no available accounts, trying next entry"
                        );
                        continue;
                    }
                },
            };

            let env = build_account_env(&account);
            tracing::info!(
                backend = %entry.backend,
                account_id = account.id,
                account = %account.name,
                "attempting execution"
            );

            self.scheduler.mark_running(account.id);
            let outcome = self
                .executor
                .run(ExecutionRequest {
                    trigger_id: trigger_id.to_owned(),
                    message: message.to_owned(),
                    backend: entry.backend,
                    account_id: Some(account.id),
                    env,
                })
                .await;
            // Always runs, even when the attempt was rate-limited: the
            // finally arm of the lifecycle.
            self.scheduler.mark_completed(account.id);

            if let Some(cooldown) = outcome.rate_limited_cooldown {
                tracing::info!(
                    account_id = account.id,
                    cooldown,
                    "execution rate-limited, rotating to next entry"
                );
                self.tracker.mark_rate_limited(account.id, cooldown);
                continue;
            }

            if outcome.execution_id.is_some() {
                if let Err(e) = self.store.record_execution(account.id, now) {
                    tracing::warn!(account_id = account.id, err = %e, "failed to record execution");
                }
            }
            return outcome.execution_id;
        }

        tracing::warn!(trigger_id, "all fallback chain entries exhausted");
        None
    }
}

/// Environment overlays from account config: the account's API key (via
/// env var indirection) mapped to the backend's standard variable, and the
/// config path mapped to the backend's config directory variable.
pub fn build_account_env(account: &AccountRow) -> HashMap<String, String> {
    let mut env = HashMap::new();

    if let Some(key_env) = account.api_key_env.as_deref() {
        if let Ok(value) = std::env::var(key_env) {
            if !value.is_empty() {
                let target = match account.backend {
                    BackendKind::Claude => Some("ANTHROPIC_API_KEY"),
                    BackendKind::Codex => Some("OPENAI_API_KEY"),
                    BackendKind::Gemini => Some("GEMINI_API_KEY"),
                    BackendKind::Opencode => None,
                };
                if let Some(target) = target {
                    env.insert(target.to_owned(), value);
                }
            }
        }
    }

    if let Some(config_path) = account.config_path.as_deref() {
        if let Some(dir_env) = account.backend.config_dir_env() {
            env.insert(dir_env.to_owned(), config_path.to_owned());
        }
    }

    env
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
