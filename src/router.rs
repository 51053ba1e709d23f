//! # Stage: Response Router
//!
//! ## Responsibility
//! Walk one question through the tier pipeline and stop at the first state
//! that can answer, in strict priority order:
//!
//! | # | State                    | Condition                               | Tier logged            |
//! |---|--------------------------|-----------------------------------------|------------------------|
//! | 1 | `LearnedHit`             | learned cache returns a promoted answer | `learned`              |
//! | 2 | `JsonValidation`         | question is a pasted template           | `json_validation`      |
//! | 3 | `DisclosureRefused`      | question asks for internal instructions | `disclosure_refused`   |
//! | 4 | `FallbackHighConfidence` | fallback confidence above threshold     | `fallback`             |
//! | 5 | `ExternalCall`           | external model answers                  | `external`             |
//! | 6 | `FallbackLowConfidence`  | no key, or the external call failed     | `no_api_key` / `error` |
//!
//! ## Guarantees
//! - Always answers: after request validation no stage failure reaches the
//!   caller; the fallback answer is the floor.
//! - One write: every terminal state logs exactly one interaction; a failed
//!   write is logged and swallowed.
//! - Learning: only state 5 feeds template intelligence.
//! - Continuity: every state except `DisclosureRefused` updates the
//!   conversation state and returns its progress.
//!
//! ## NOT Responsible For
//! - Transport, authentication, or rate limiting of inbound requests
//! - Scheduling maintenance (that belongs to `scheduler`)

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::classify;
use crate::clock::Clock;
use crate::config::{self, EngineConfig, ExternalConfig};
use crate::conversation::{ConversationStateStore, StatePatch};
use crate::external::{ChatPrompt, ExternalAnswerClient, OpenAiChatModel};
use crate::fallback::SmartFallbackGenerator;
use crate::feedback::{self, FeedbackError, FeedbackRequest};
use crate::guards::{self, GuardVerdict};
use crate::intelligence::TemplateLearner;
use crate::interaction::{Interaction, InteractionStore, SourceTier};
use crate::learned::LearnedResponseCache;
use crate::{metrics, RequestError, RouteRequest, RouteResponse};

/// Terminal state of one routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteState {
    /// A promoted answer from the learned cache.
    LearnedHit,
    /// The question was a pasted template definition.
    JsonValidation,
    /// The question tried to extract internal instructions.
    DisclosureRefused,
    /// The rule-based answer cleared the accept threshold.
    FallbackHighConfidence,
    /// The external model answered.
    ExternalCall,
    /// The rule-based answer served because no external answer was available.
    FallbackLowConfidence,
}

impl RouteState {
    /// Stable snake_case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LearnedHit => "learned_hit",
            Self::JsonValidation => "json_validation",
            Self::DisclosureRefused => "disclosure_refused",
            Self::FallbackHighConfidence => "fallback_high_confidence",
            Self::ExternalCall => "external_call",
            Self::FallbackLowConfidence => "fallback_low_confidence",
        }
    }

    /// `false` only for refusals, which leave conversation state untouched.
    pub fn updates_conversation(&self) -> bool {
        !matches!(self, Self::DisclosureRefused)
    }

    /// `true` when the state answered without attempting an external call.
    pub fn avoided_external_call(&self) -> bool {
        matches!(
            self,
            Self::LearnedHit
                | Self::JsonValidation
                | Self::DisclosureRefused
                | Self::FallbackHighConfidence
        )
    }
}

impl fmt::Display for RouteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer chosen by the pipeline, before logging.
struct Decision {
    state: RouteState,
    tier: SourceTier,
    answer: String,
    confidence: Option<f64>,
}

/// Orchestrates the tiers into a single decision pipeline.
///
/// ```rust
/// use std::sync::Arc;
/// use learned_response_router::clock::SystemClock;
/// use learned_response_router::config::EngineConfig;
/// use learned_response_router::{
///     MemoryConversationStore, MemoryInteractionStore, ResponseRouter, RouteRequest, SourceTier,
/// };
/// # #[tokio::main]
/// # async fn main() {
/// let config = EngineConfig::default();
/// let clock = Arc::new(SystemClock);
/// let router = ResponseRouter::new(
///     &config,
///     Arc::new(MemoryInteractionStore::new()),
///     Arc::new(MemoryConversationStore::new(clock.clone(), &config.conversation)),
///     clock,
/// );
/// let res = router
///     .route(&RouteRequest::new("How do I add OpenAI credentials?", Some("T1")))
///     .await
///     .unwrap();
/// assert_eq!(res.source, SourceTier::Fallback);
/// # }
/// ```
#[derive(Clone)]
pub struct ResponseRouter {
    interactions: Arc<dyn InteractionStore>,
    conversations: Arc<dyn ConversationStateStore>,
    learned: LearnedResponseCache,
    fallback: SmartFallbackGenerator,
    external: Option<ExternalAnswerClient>,
    learner: TemplateLearner,
    clock: Arc<dyn Clock>,
    accept_threshold: f64,
    max_question_chars: usize,
    history_turns: usize,
}

impl ResponseRouter {
    /// Router with no external tier; add one with
    /// [`with_external`](Self::with_external) or
    /// [`with_openai_from_env`](Self::with_openai_from_env).
    pub fn new(
        config: &EngineConfig,
        interactions: Arc<dyn InteractionStore>,
        conversations: Arc<dyn ConversationStateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            learned: LearnedResponseCache::new(
                interactions.clone(),
                clock.clone(),
                config.learned.clone(),
            ),
            learner: TemplateLearner::new(
                interactions.clone(),
                clock.clone(),
                config.retention.clone(),
            ),
            interactions,
            conversations,
            fallback: SmartFallbackGenerator::new(),
            external: None,
            clock,
            accept_threshold: config.routing.fallback_accept_threshold,
            max_question_chars: config.external.max_question_chars,
            history_turns: config.external.history_turns,
        }
    }

    /// Enable the external tier with `client`.
    pub fn with_external(mut self, client: ExternalAnswerClient) -> Self {
        self.external = Some(client);
        self
    }

    /// Enable the external tier with an OpenAI-compatible model if the API
    /// key variable is set. Without a key the router answers from the
    /// learned and fallback tiers only.
    pub fn with_openai_from_env(
        self,
        config: &ExternalConfig,
        shutdown: CancellationToken,
    ) -> Self {
        match config::external_api_key(config) {
            Some(key) => {
                let model = OpenAiChatModel::new(key, config);
                info!(model = %config.model, base_url = %config.base_url, "external tier enabled");
                self.with_external(ExternalAnswerClient::new(
                    Arc::new(model),
                    config.timeout(),
                    shutdown,
                ))
            }
            None => {
                warn!(
                    env = %config.api_key_env,
                    "external API key not set; serving learned and fallback answers only"
                );
                self
            }
        }
    }

    /// `true` when an external tier is configured.
    pub fn has_external(&self) -> bool {
        self.external.is_some()
    }

    /// Interaction log shared by the tiers.
    pub fn interactions(&self) -> &Arc<dyn InteractionStore> {
        &self.interactions
    }

    /// Conversation state store.
    pub fn conversations(&self) -> &Arc<dyn ConversationStateStore> {
        &self.conversations
    }

    /// Template intelligence maintainer.
    pub fn learner(&self) -> &TemplateLearner {
        &self.learner
    }

    /// Answer one question.
    ///
    /// # Errors
    ///
    /// Only [`RequestError`] for a malformed request; every later failure
    /// degrades to a fallback answer.
    pub async fn route(&self, req: &RouteRequest) -> Result<RouteResponse, RequestError> {
        self.route_with_state(req).await.map(|(_, res)| res)
    }

    /// Like [`route`](Self::route), also returning the terminal state.
    ///
    /// # Errors
    ///
    /// Only [`RequestError`] for a malformed request.
    pub async fn route_with_state(
        &self,
        req: &RouteRequest,
    ) -> Result<(RouteState, RouteResponse), RequestError> {
        req.validate()?;
        let span = info_span!(
            "route",
            template_id = %req.template_id(),
            user_id = %req.user_id(),
        );
        Ok(self.route_inner(req).instrument(span).await)
    }

    async fn route_inner(&self, req: &RouteRequest) -> (RouteState, RouteResponse) {
        let started = Instant::now();
        let template_id = req.template_id();
        let user_id = req.user_id();
        let question = req.question.trim();

        let decision = self.decide(req, question, template_id, user_id).await;

        let record = Interaction::new(
            template_id,
            user_id,
            question,
            decision.answer.as_str(),
            decision.tier,
            classify::classify_category(question),
            self.clock.now_secs(),
        );
        let record_id = record.id.clone();
        let interaction_id = match self.interactions.insert(record).await {
            Ok(()) => Some(record_id),
            Err(e) => {
                warn!(error = %e, tier = %decision.tier, "failed to log interaction");
                None
            }
        };

        if decision.state == RouteState::ExternalCall {
            if let Err(e) = self.learner.record_external_success(template_id, question).await {
                warn!(error = %e, "failed to update template intelligence");
            }
        }

        let progress = if decision.state.updates_conversation() {
            let phases = classify::classify_phases(req.user_turns());
            let state = self
                .conversations
                .update(user_id, template_id, StatePatch::interaction(phases))
                .await;
            Some(state.progress())
        } else {
            None
        };

        let elapsed = started.elapsed();
        metrics::record_route_duration(elapsed);
        metrics::inc_response(decision.tier.as_str());
        if decision.state.avoided_external_call() {
            metrics::inc_external_call_avoided();
        }
        info!(
            state = %decision.state,
            source = %decision.tier,
            confidence = decision.confidence,
            logged = interaction_id.is_some(),
            elapsed_ms = elapsed.as_millis() as u64,
            "question routed"
        );

        (
            decision.state,
            RouteResponse {
                answer: decision.answer,
                source: decision.tier,
                confidence: decision.confidence,
                interaction_id,
                progress,
            },
        )
    }

    async fn decide(
        &self,
        req: &RouteRequest,
        question: &str,
        template_id: &str,
        user_id: &str,
    ) -> Decision {
        if let Some(hit) = self.learned.lookup(question, template_id).await {
            return Decision {
                state: RouteState::LearnedHit,
                tier: SourceTier::Learned,
                answer: hit.answer,
                confidence: Some(hit.confidence),
            };
        }

        match guards::check(question) {
            Some(GuardVerdict::TemplateValidation) => {
                return Decision {
                    state: RouteState::JsonValidation,
                    tier: SourceTier::JsonValidation,
                    answer: GuardVerdict::TemplateValidation.response().to_string(),
                    confidence: None,
                }
            }
            Some(GuardVerdict::DisclosureRefused) => {
                return Decision {
                    state: RouteState::DisclosureRefused,
                    tier: SourceTier::DisclosureRefused,
                    answer: GuardVerdict::DisclosureRefused.response().to_string(),
                    confidence: None,
                }
            }
            None => {}
        }

        let fallback = self
            .fallback
            .generate(question, template_id, &req.conversation_history);
        if fallback.confidence > self.accept_threshold {
            return Decision {
                state: RouteState::FallbackHighConfidence,
                tier: SourceTier::Fallback,
                answer: fallback.answer,
                confidence: Some(fallback.confidence),
            };
        }

        let Some(client) = &self.external else {
            return Decision {
                state: RouteState::FallbackLowConfidence,
                tier: SourceTier::NoApiKey,
                answer: fallback.answer,
                confidence: Some(fallback.confidence),
            };
        };

        let progress = self.conversations.get(user_id, template_id).await.progress();
        let prompt = ChatPrompt::build(
            question,
            template_id,
            &req.conversation_history,
            Some(&progress),
            self.history_turns,
        )
        .truncate_question(self.max_question_chars);
        match client.answer(&prompt).await {
            Ok(answer) => Decision {
                state: RouteState::ExternalCall,
                tier: SourceTier::External,
                answer,
                confidence: None,
            },
            Err(_) => Decision {
                state: RouteState::FallbackLowConfidence,
                tier: SourceTier::Error,
                answer: fallback.answer,
                confidence: Some(fallback.confidence),
            },
        }
    }

    /// Apply user feedback to a logged interaction.
    ///
    /// # Errors
    ///
    /// See [`feedback::apply_feedback`].
    pub async fn record_feedback(
        &self,
        req: &FeedbackRequest,
    ) -> Result<Interaction, FeedbackError> {
        feedback::apply_feedback(self.interactions.as_ref(), req).await
    }
}

impl fmt::Debug for ResponseRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseRouter")
            .field("has_external", &self.external.is_some())
            .field("accept_threshold", &self.accept_threshold)
            .field("max_question_chars", &self.max_question_chars)
            .finish_non_exhaustive()
    }
}
