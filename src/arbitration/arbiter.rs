use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::guard::contains_injection;
use super::reasoning::{ChatMessage, ReasoningService};
use super::search::WebSearch;
use super::session::{search_tool, ArbitrationSession, CallAction, Phase, Source, SYSTEM_DIRECTIVE};
use super::verdict::{verdict_or_unresolvable, ResolutionStatus, VerdictPayload};
use super::ArbitrationConfig;
use crate::clock::Clock;
use crate::errors::ArbitrationError;
use crate::ledger::{ArbitrationRun, LedgerDb};
use crate::models::{ArbitratorType, Market, Side};

/// A decided AI arbitration, ready to hand to settlement.
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub market_id: Uuid,
    pub outcome: Side,
    pub reasoning: String,
    pub sources: Vec<Source>,
    pub search_count: usize,
    pub queries: Vec<String>,
    pub transcript_sha256: String,
}

struct LoopOutcome {
    payload: VerdictPayload,
    search_count: usize,
    queries: Vec<String>,
    sources: Vec<Source>,
    transcript_sha256: String,
}

pub struct Arbiter {
    reasoning: Arc<dyn ReasoningService>,
    search: Arc<dyn WebSearch>,
    clock: Arc<dyn Clock>,
    ledger: Option<LedgerDb>,
    config: ArbitrationConfig,
}

impl Arbiter {
    pub fn new(
        reasoning: Arc<dyn ReasoningService>,
        search: Arc<dyn WebSearch>,
        clock: Arc<dyn Clock>,
        config: ArbitrationConfig,
    ) -> Self {
        Self {
            reasoning,
            search,
            clock,
            ledger: None,
            config,
        }
    }

    /// Record every finished run in `arbitration_runs`.
    pub fn with_ledger(mut self, ledger: LedgerDb) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn config(&self) -> &ArbitrationConfig {
        &self.config
    }

    /// Checks that must pass before any model or search call is made.
    pub fn precheck(&self, market: &Market) -> Result<(), ArbitrationError> {
        if market.state.is_settled() {
            return Err(ArbitrationError::BetResolved);
        }
        if market.arbitrator_type != ArbitratorType::Ai {
            return Err(ArbitrationError::NotAiBet);
        }
        if !market.deadline_passed(self.clock.now()) {
            return Err(ArbitrationError::DeadlineNotPassed);
        }
        let description = market.description.as_deref().unwrap_or("");
        if contains_injection(&market.title) || contains_injection(description) {
            warn!(market_id = %market.id, "injection marker in market text, refusing to arbitrate");
            return Err(ArbitrationError::SecurityViolation);
        }
        Ok(())
    }

    pub async fn arbitrate(&self, market: &Market) -> Result<Verdict, ArbitrationError> {
        self.precheck(market)?;

        let limit = self.config.loop_timeout();
        info!(market_id = %market.id, budget = self.config.search_budget, "⚖️ AI arbitration started");

        let outcome = match tokio::time::timeout(limit, self.run_loop(market)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(market_id = %market.id, timeout = ?limit, "AI arbitration timed out");
                return Err(ArbitrationError::Timeout(limit));
            }
        };

        self.record_run(market.id, &outcome).await;

        let reasoning = outcome.payload.reasoning_text(outcome.search_count);
        let outcome_side = match outcome.payload.resolution_status {
            ResolutionStatus::ResolvedTrue => Side::Yes,
            ResolutionStatus::ResolvedFalse => Side::No,
            ResolutionStatus::Unresolvable => {
                let conclusion = match outcome.payload.reasoning.conclusion.trim() {
                    "" => "Insufficient evidence".to_string(),
                    c => c.to_string(),
                };
                info!(
                    market_id = %market.id,
                    searches = outcome.search_count,
                    "AI arbitration concluded UNRESOLVABLE"
                );
                return Err(ArbitrationError::Unresolvable {
                    conclusion,
                    reasoning,
                    search_count: outcome.search_count,
                });
            }
        };

        info!(
            market_id = %market.id,
            outcome = outcome_side.as_str(),
            searches = outcome.search_count,
            sources = outcome.sources.len(),
            "AI arbitration reached a verdict"
        );

        Ok(Verdict {
            market_id: market.id,
            outcome: outcome_side,
            reasoning,
            sources: outcome.sources,
            search_count: outcome.search_count,
            queries: outcome.queries,
            transcript_sha256: outcome.transcript_sha256,
        })
    }

    async fn run_loop(&self, market: &Market) -> Result<LoopOutcome, ArbitrationError> {
        let mut session = ArbitrationSession::new(market, &self.config);
        let tools = [search_tool()];

        while session.phase() == Phase::Gathering {
            let turn = self
                .reasoning
                .converse(
                    SYSTEM_DIRECTIVE,
                    session.history(),
                    &tools,
                    self.config.gather_max_tokens,
                )
                .await
                .map_err(ArbitrationError::Service)?;
            session.begin_round(&turn);

            for call in session.plan_tool_calls(&turn.tool_calls) {
                match call.action {
                    CallAction::Search(query) => {
                        debug!(
                            market_id = %market.id,
                            n = session.search_count(),
                            budget = self.config.search_budget,
                            query = %query,
                            "arbitration search"
                        );
                        match self.search.search(&query).await {
                            Ok(results) => session.record_search(&call.call_id, &query, results),
                            Err(e) => {
                                warn!(market_id = %market.id, query = %query, error = %e, "search failed");
                                session.record_failure(
                                    &call.call_id,
                                    format!("Search failed: {}. Treat this as no results.", e),
                                );
                            }
                        }
                    }
                    CallAction::Reject(message) => {
                        debug!(market_id = %market.id, reason = %message, "tool call refused");
                        session.record_failure(&call.call_id, message);
                    }
                }
            }

            session.finish_round(!turn.tool_calls.is_empty());
        }

        let history = session.decision_history();
        let final_turn = self
            .reasoning
            .converse(SYSTEM_DIRECTIVE, &history, &[], self.config.decide_max_tokens)
            .await
            .map_err(ArbitrationError::Service)?;
        session.complete();

        let (payload, parsed) = verdict_or_unresolvable(final_turn.content.as_deref());
        if !parsed {
            warn!(market_id = %market.id, "could not parse AI decision, treating as UNRESOLVABLE");
        }

        Ok(LoopOutcome {
            payload,
            search_count: session.search_count(),
            queries: session.queries().to_vec(),
            sources: session.sources().to_vec(),
            transcript_sha256: transcript_digest(&history, final_turn.content.as_deref()),
        })
    }

    async fn record_run(&self, market_id: Uuid, outcome: &LoopOutcome) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        let run = ArbitrationRun {
            id: Uuid::new_v4(),
            market_id,
            resolution_status: outcome.payload.resolution_status.as_str().to_string(),
            search_count: outcome.search_count as i64,
            queries: outcome.queries.clone(),
            sources: serde_json::to_value(&outcome.sources).unwrap_or_default(),
            transcript_sha256: outcome.transcript_sha256.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) = ledger.atomic(|tx| tx.insert_arbitration_run(&run)).await {
            warn!(market_id = %market_id, error = %e, "failed to record arbitration run");
        }
    }
}

fn transcript_digest(history: &[ChatMessage], final_answer: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    if let Ok(bytes) = serde_json::to_vec(history) {
        hasher.update(&bytes);
    }
    hasher.update(final_answer.unwrap_or("").as_bytes());
    hex::encode(hasher.finalize())
}
