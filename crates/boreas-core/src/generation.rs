//! Generation stage: platform-constrained drafting with in-stage fallback
//! degrade, bounded self-repair, and immutable content versioning.
//!
//! The caller never retries the primary model manually — on timeout or
//! failure the stage degrades to the fallback model itself and the item keeps
//! flowing. The self-repair loop is counter-driven (never recursive), so it
//! terminates in bounded time even if the model never converges; exhausting
//! the bound yields the best attempt so far, flagged as not gate-eligible.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{GenerationConfig, PlatformConstraint};
use crate::dedup::{content_hash, similarity_ratio};
use crate::draft::{ContentDraft, DraftStatus, DraftVersion, GenerationMeta, QualityDetails};
use crate::error::AppError;
use crate::models::{TrendSource, compute_hash};
use crate::traits::{DraftStore, Generator, QualityScorer};

/// One model invocation's result with its observability metadata.
#[derive(Debug, Clone)]
pub struct Generated {
    pub text: String,
    pub backend: String,
    pub model: String,
    pub latency_ms: f64,
    pub used_fallback: bool,
}

/// Primary/fallback model pair executing under an explicit time budget.
#[derive(Clone)]
pub struct FallbackGenerator {
    primary: Arc<dyn Generator>,
    fallback: Option<Arc<dyn Generator>>,
}

impl FallbackGenerator {
    pub fn new(primary: Arc<dyn Generator>, fallback: Option<Arc<dyn Generator>>) -> Self {
        Self { primary, fallback }
    }

    /// Invoke the primary model; on timeout or failure degrade in-stage to
    /// the fallback when budget remains. Surfaces an error only when the
    /// fallback also fails (or none is configured).
    pub async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        budget: Duration,
    ) -> Result<Generated, AppError> {
        let started = Instant::now();
        let primary_result = tokio::time::timeout(
            budget,
            self.primary.generate(prompt, max_tokens, budget),
        )
        .await
        .map_err(|_| AppError::GenerationTimeout(budget.as_millis() as u64))
        .and_then(|inner| inner);

        match primary_result {
            Ok(text) => Ok(Generated {
                text,
                backend: self.primary.backend().to_string(),
                model: self.primary.model().to_string(),
                latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                used_fallback: false,
            }),
            Err(primary_error) => {
                let remaining = budget.saturating_sub(started.elapsed());
                let Some(fallback) = &self.fallback else {
                    return Err(primary_error);
                };
                if remaining < Duration::from_millis(50) {
                    return Err(primary_error);
                }
                tracing::warn!(
                    error = %primary_error,
                    backend = fallback.backend(),
                    "primary generation failed, degrading to fallback"
                );
                let fallback_started = Instant::now();
                let text = tokio::time::timeout(
                    remaining,
                    fallback.generate(prompt, max_tokens, remaining),
                )
                .await
                .map_err(|_| AppError::GenerationTimeout(remaining.as_millis() as u64))
                .and_then(|inner| inner)
                .map_err(|e| AppError::GenerationFailure(format!(
                    "primary: {primary_error}; fallback: {e}"
                )))?;
                Ok(Generated {
                    text,
                    backend: fallback.backend().to_string(),
                    model: fallback.model().to_string(),
                    latency_ms: fallback_started.elapsed().as_secs_f64() * 1000.0,
                    used_fallback: true,
                })
            }
        }
    }
}

/// Scores plus human-readable violation details for one candidate.
#[derive(Debug, Clone)]
struct Evaluation {
    quality_score: f64,
    compliance_score: f64,
    repetition_ratio: f64,
    issues: Vec<String>,
}

pub struct GenerationStage<D: DraftStore> {
    generator: FallbackGenerator,
    store: D,
    config: GenerationConfig,
    scorer: Option<Arc<dyn QualityScorer>>,
}

impl<D: DraftStore> GenerationStage<D> {
    pub fn new(generator: FallbackGenerator, store: D, config: GenerationConfig) -> Self {
        Self {
            generator,
            store,
            config,
            scorer: None,
        }
    }

    /// Attach a model-backed secondary reviewer. Its scores are blended
    /// conservatively: quality/compliance take the lower opinion, repetition
    /// the higher.
    pub fn with_scorer(mut self, scorer: Arc<dyn QualityScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    async fn apply_external_review(&self, candidate: &ContentDraft, evaluation: &mut Evaluation) {
        let Some(scorer) = &self.scorer else { return };
        let text = format!("{}\n{}", candidate.title, candidate.body);
        match scorer.score(&text).await {
            Ok(scores) => {
                evaluation.quality_score = evaluation.quality_score.min(scores.quality);
                evaluation.compliance_score = evaluation.compliance_score.min(scores.compliance);
                evaluation.repetition_ratio = evaluation.repetition_ratio.max(scores.repetition);

                if evaluation.quality_score < self.config.min_quality_score
                    && !evaluation.issues.iter().any(|i| i.starts_with("quality below"))
                {
                    evaluation.issues.push(format!(
                        "quality below threshold {:.2} < {:.2}",
                        evaluation.quality_score, self.config.min_quality_score
                    ));
                }
                if evaluation.compliance_score < self.config.min_compliance_score
                    && !evaluation
                        .issues
                        .iter()
                        .any(|i| i.starts_with("compliance below"))
                {
                    evaluation.issues.push(format!(
                        "compliance below threshold {:.2} < {:.2}",
                        evaluation.compliance_score, self.config.min_compliance_score
                    ));
                }
                if evaluation.repetition_ratio > self.config.max_repeat_ratio
                    && !evaluation.issues.iter().any(|i| i.contains("repeat ratio"))
                {
                    evaluation.issues.push(format!(
                        "repeat ratio too high ({:.3})",
                        evaluation.repetition_ratio
                    ));
                }
            }
            Err(error) => {
                // Degrade to rule-based scoring only.
                tracing::warn!(error = %error, "external quality review failed");
            }
        }
    }

    /// Produce, score, and persist one platform-targeted draft for a source.
    ///
    /// Always returns a draft when at least one generation attempt produced
    /// content: a draft that never satisfied the checks comes back with
    /// `status = Rejected` and `gate_eligible = false` rather than as an
    /// error.
    pub async fn draft_for(
        &self,
        source: &TrendSource,
        platform: &str,
    ) -> Result<ContentDraft, AppError> {
        let constraint = self.config.constraint_for(platform).clone();
        let base_prompt = self.build_prompt(source, platform, &constraint);
        let deadline = Instant::now() + self.config.stage_budget;

        let recent_bodies = self
            .store
            .recent_bodies(platform, self.config.recent_output_window)
            .await?;

        let max_attempts = 1 + self.config.self_repair_max_attempts;
        let mut best: Option<(ContentDraft, Evaluation, Generated, String, u32)> = None;
        let mut last_issues: Vec<String> = Vec::new();

        for attempt in 1..=max_attempts {
            let attempt_prompt = if attempt == 1 {
                base_prompt.clone()
            } else {
                let previous = best.as_ref().map(|(draft, ..)| draft);
                build_repair_prompt(&base_prompt, previous, &last_issues)
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() && best.is_some() {
                break;
            }
            let generated = match self
                .generator
                .generate(&attempt_prompt, self.config.max_tokens, remaining.max(Duration::from_millis(100)))
                .await
            {
                Ok(generated) => generated,
                Err(e) if best.is_some() => {
                    tracing::warn!(error = %e, attempt, "repair attempt failed, keeping best so far");
                    break;
                }
                Err(e) => return Err(e),
            };

            let parsed = parse_response(&generated.text);
            let candidate = self.build_candidate(source, platform, &parsed);
            let mut evaluation = self.evaluate(&candidate, source, &constraint, &recent_bodies);
            self.apply_external_review(&candidate, &mut evaluation).await;

            let better = match &best {
                Some((_, best_eval, ..)) => evaluation.quality_score > best_eval.quality_score,
                None => true,
            };
            let clean = evaluation.issues.is_empty();
            if better || clean {
                best = Some((
                    candidate,
                    evaluation.clone(),
                    generated,
                    attempt_prompt,
                    attempt,
                ));
            }
            if clean {
                break;
            }
            last_issues = evaluation.issues;
        }

        let (mut draft, evaluation, generated, prompt, attempt) = best
            .ok_or_else(|| AppError::GenerationFailure("no generation attempt produced output".into()))?;

        let accepted = evaluation.issues.is_empty();
        draft.quality_score = evaluation.quality_score;
        draft.compliance_score = evaluation.compliance_score;
        draft.repetition_ratio = evaluation.repetition_ratio;
        draft.gate_eligible = accepted;
        draft.status = if accepted {
            DraftStatus::Summarized
        } else {
            DraftStatus::Rejected
        };
        draft.quality_details = QualityDetails {
            compliance_score: evaluation.compliance_score,
            repetition_ratio: evaluation.repetition_ratio,
            issues: evaluation.issues.clone(),
        };
        draft.generation_meta = GenerationMeta {
            backend: generated.backend.clone(),
            model: generated.model.clone(),
            latency_ms: generated.latency_ms,
            used_fallback: generated.used_fallback,
            attempt,
            prompt_hash: compute_hash(&prompt)[..16].to_string(),
            output_hash: content_hash(&draft.dedup_text()),
        };

        self.store.save_draft(&draft).await?;
        let version = DraftVersion::snapshot(
            &draft,
            prompt,
            &generated.model,
            json!({
                "max_tokens": self.config.max_tokens,
                "used_fallback": generated.used_fallback,
            }),
        );
        draft.current_version = self.store.append_version(&version).await?;
        self.store.update_draft(&draft).await?;

        tracing::info!(
            draft_id = %draft.id,
            platform,
            attempt,
            quality = draft.quality_score,
            accepted,
            "draft generated"
        );
        Ok(draft)
    }

    /// Restore a draft's current content from an earlier version. History is
    /// never rewritten: the restored state is appended as a new version.
    pub async fn rollback(
        &self,
        draft_id: Uuid,
        version_no: u32,
    ) -> Result<ContentDraft, AppError> {
        let version = self
            .store
            .get_version(draft_id, version_no)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("version {version_no} of draft {draft_id}"))
            })?;
        let mut draft = self
            .store
            .get_draft(draft_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("draft {draft_id}")))?;

        version.apply_to(&mut draft);

        let restored = DraftVersion::snapshot(
            &draft,
            version.prompt.clone(),
            version.model.clone(),
            json!({ "restored_from_version": version_no }),
        );
        draft.current_version = self.store.append_version(&restored).await?;
        self.store.update_draft(&draft).await?;

        tracing::info!(%draft_id, version_no, "draft rolled back");
        Ok(draft)
    }

    fn build_prompt(
        &self,
        source: &TrendSource,
        platform: &str,
        constraint: &PlatformConstraint,
    ) -> String {
        let mut rules = vec![
            format!(
                "Title length {}-{} characters.",
                constraint.title_min, constraint.title_max
            ),
            format!(
                "Body length {}-{} characters.",
                constraint.body_min, constraint.body_max
            ),
            format!("At most {} hashtags.", constraint.max_hashtags),
        ];
        rules.extend(constraint.style_rules.iter().cloned());
        if !self.config.banned_words.is_empty() {
            rules.push(format!(
                "Never use any of these words: {}.",
                self.config.banned_words.join(", ")
            ));
        }
        let rule_block = rules
            .iter()
            .map(|r| format!("- {r}"))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "You are writing a {platform} post from a trending item.\n\
             Constraints:\n{rule_block}\n\n\
             Source title: {}\n\
             Source description: {}\n\
             Category: {}\n\n\
             Return ONLY a JSON object: {{\"title\":\"\",\"body\":\"\",\"summary\":\"\",\"hashtags\":[]}}.\n\
             No markdown, no explanations.",
            source.title,
            source.description,
            source.category.as_deref().unwrap_or("general"),
        )
    }

    fn build_candidate(
        &self,
        source: &TrendSource,
        platform: &str,
        parsed: &serde_json::Value,
    ) -> ContentDraft {
        let mut draft = ContentDraft::new(source.id, platform);
        draft.title = string_field(parsed, "title")
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| source.title.clone());
        draft.body = string_field(parsed, "body").unwrap_or_default();
        draft.summary = string_field(parsed, "summary").unwrap_or_default();
        draft.hashtags = parsed
            .get("hashtags")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        draft.media_urls = source.media_urls.clone();
        draft.language = source.language.clone();
        draft
    }

    fn evaluate(
        &self,
        candidate: &ContentDraft,
        source: &TrendSource,
        constraint: &PlatformConstraint,
        recent_bodies: &[String],
    ) -> Evaluation {
        let title_len = candidate.title.chars().count();
        let body_len = candidate.body.chars().count();
        let text = format!(
            "{}\n{}\n{}",
            candidate.title, candidate.body, candidate.summary
        );
        let mut issues = Vec::new();

        if title_len < constraint.title_min {
            issues.push(format!("title too short (<{})", constraint.title_min));
        }
        if title_len > constraint.title_max {
            issues.push(format!("title too long (>{})", constraint.title_max));
        }
        if body_len < constraint.body_min {
            issues.push(format!("body too short (<{})", constraint.body_min));
        }
        if body_len > constraint.body_max {
            issues.push(format!("body too long (>{})", constraint.body_max));
        }
        if candidate.summary.trim().is_empty() {
            issues.push("summary missing".to_string());
        }

        for word in &self.config.banned_words {
            if !word.is_empty() && text.contains(word.as_str()) {
                issues.push(format!("contains banned word: {word}"));
            }
        }

        // Repetition against the source text and against recent accepted
        // output for the same platform.
        let source_text = format!("{}\n{}", source.title, source.description);
        let mut repetition = if candidate.body.is_empty() {
            0.0
        } else {
            similarity_ratio(&source_text, &candidate.body)
        };
        for body in recent_bodies {
            repetition = repetition.max(similarity_ratio(body, &candidate.body));
        }
        if repetition > self.config.max_repeat_ratio {
            issues.push(format!("repeat ratio too high ({repetition:.3})"));
        }

        let length_issues = issues
            .iter()
            .filter(|i| i.contains("too short") || i.contains("too long"))
            .count() as f64;
        let banned_issues = issues
            .iter()
            .filter(|i| i.contains("banned word"))
            .count() as f64;
        let repeat_issues = issues
            .iter()
            .filter(|i| i.contains("repeat ratio"))
            .count() as f64;

        let quality_score = (1.0
            - 0.10 * length_issues
            - 0.20 * banned_issues
            - 0.35 * repeat_issues)
            .clamp(0.0, 1.0);
        let compliance_score =
            (1.0 - 0.40 * banned_issues - 0.20 * repeat_issues).clamp(0.0, 1.0);

        if quality_score < self.config.min_quality_score {
            issues.push(format!(
                "quality below threshold {quality_score:.2} < {:.2}",
                self.config.min_quality_score
            ));
        }
        if compliance_score < self.config.min_compliance_score {
            issues.push(format!(
                "compliance below threshold {compliance_score:.2} < {:.2}",
                self.config.min_compliance_score
            ));
        }

        Evaluation {
            quality_score,
            compliance_score,
            repetition_ratio: repetition,
            issues,
        }
    }
}

fn string_field(value: &serde_json::Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
}

/// Extract the JSON object from a model response, tolerating prose around it.
fn parse_response(response: &str) -> serde_json::Value {
    let text = response.trim();
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}'))
        && end > start
        && let Ok(value) = serde_json::from_str::<serde_json::Value>(&text[start..=end])
        && value.is_object()
    {
        return value;
    }

    // Plain-text answer: salvage it as a body.
    if text.chars().count() > 20 {
        let title: String = text.chars().take(30).collect();
        let summary: String = text.chars().take(120).collect();
        return json!({ "title": title, "body": text, "summary": summary, "hashtags": [] });
    }
    json!({})
}

fn build_repair_prompt(
    base_prompt: &str,
    previous: Option<&ContentDraft>,
    issues: &[String],
) -> String {
    let previous_json = previous
        .map(|draft| {
            json!({
                "title": draft.title,
                "body": draft.body,
                "summary": draft.summary,
                "hashtags": draft.hashtags,
            })
            .to_string()
        })
        .unwrap_or_else(|| "{}".to_string());
    let issue_text = if issues.is_empty() {
        "output did not meet the quality bar".to_string()
    } else {
        issues.join("; ")
    };
    format!(
        "{base_prompt}\n\nPrevious output:\n{previous_json}\n\
         Problems found:\n- {issue_text}\n\
         Fix these problems and return the corrected JSON object."
    )
}
