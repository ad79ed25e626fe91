//! Batched enrichment
//!
//! Entities still carrying their raw table name are sent to the model in
//! fixed-size batches. Batches run concurrently over a bounded worker pool
//! and the whole run commits in one store call: either every entity is
//! enriched or none is. Entities a higher-precedence writer took over while
//! the model was working are left alone at commit time. A batch that fails,
//! comes back unparseable or misses any requested table fails the run.

use super::llm::{GenerateRequest, LlmClient};
use super::parse::{parse_response, EnrichedEntity};
use super::prompt::{build_prompt, EntityContext, SYSTEM_MESSAGE};
use super::questions::QuestionSink;
use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::changes::suggested_entity_name;
use crate::config::EnrichmentConfig;
use crate::db::{OntologyStore, SchemaStore};
use crate::error::AppError;
use crate::models::EntityEnrichment;
use crate::provenance::{Provenance, ProvenanceGuard};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentSummary {
    pub entities_enriched: usize,
    /// Entities a human or agent took over while the model was working
    pub entities_skipped: usize,
    pub aliases_created: usize,
    pub batches: usize,
    pub questions: usize,
}

struct BatchOutcome {
    enrichments: Vec<EntityEnrichment>,
    questions: Vec<String>,
    conversation_id: Option<String>,
}

struct BatchError {
    error: AppError,
    batch: usize,
    conversation_id: Option<String>,
}

pub struct EnrichmentPipeline {
    schema: Arc<dyn SchemaStore>,
    ontology: Arc<dyn OntologyStore>,
    llm: Arc<dyn LlmClient>,
    questions: Arc<dyn QuestionSink>,
    audit: Arc<AuditLog>,
    config: EnrichmentConfig,
}

impl EnrichmentPipeline {
    pub fn new(
        schema: Arc<dyn SchemaStore>,
        ontology: Arc<dyn OntologyStore>,
        llm: Arc<dyn LlmClient>,
        questions: Arc<dyn QuestionSink>,
        audit: Arc<AuditLog>,
        config: EnrichmentConfig,
    ) -> Self {
        Self { schema, ontology, llm, questions, audit, config }
    }

    pub async fn enrich(
        &self,
        project_id: Uuid,
        actor: Option<&str>,
    ) -> Result<EnrichmentSummary, AppError> {
        let contexts = self.candidates(project_id).await?;
        if contexts.is_empty() {
            debug!("Nothing to enrich for project {}", project_id);
            return Ok(EnrichmentSummary::default());
        }

        let batches: Vec<Vec<EntityContext>> = contexts
            .chunks(self.config.batch_size.max(1))
            .map(<[EntityContext]>::to_vec)
            .collect();
        let batch_count = batches.len();
        info!(
            "Enriching {} entities for project {} in {} batches",
            contexts.len(),
            project_id,
            batch_count
        );

        let mut runs: Vec<_> = batches
            .into_iter()
            .enumerate()
            .map(|(index, batch)| self.run_batch(index, batch_count, batch))
            .collect();
        let outcomes = if batch_count == 1 {
            match runs.pop() {
                Some(run) => run.await.map(|outcome| vec![outcome]),
                None => Ok(Vec::new()),
            }
        } else {
            stream::iter(runs)
                .buffer_unordered(self.config.max_workers.max(1))
                .try_collect::<Vec<_>>()
                .await
        };

        let outcomes = match outcomes {
            Ok(outcomes) => outcomes,
            Err(failure) => {
                warn!("Enrichment failed for project {}: {}", project_id, failure.error);
                self.audit
                    .record(
                        AuditEntry::new(project_id, AuditAction::EnrichmentFailed, "project")
                            .actor(actor)
                            .resource(project_id)
                            .details(json!({
                                "error": failure.error.to_string(),
                                "batch": failure.batch + 1,
                                "batches": batch_count,
                                "conversationId": failure.conversation_id,
                            })),
                    )
                    .await;
                return Err(failure.error);
            }
        };

        let enrichments: Vec<EntityEnrichment> = outcomes
            .iter()
            .flat_map(|outcome| outcome.enrichments.iter().cloned())
            .collect();
        let commit = self.ontology.apply_enrichment(project_id, &enrichments).await?;
        if !commit.skipped.is_empty() {
            info!(
                "{} entities in project {} changed hands during enrichment and were left alone",
                commit.skipped.len(),
                project_id
            );
        }

        // Questions only describe a run that was committed
        let mut question_count = 0;
        for outcome in &outcomes {
            if !outcome.questions.is_empty() {
                question_count += outcome.questions.len();
                self.questions
                    .submit(project_id, outcome.conversation_id.as_deref(), &outcome.questions)
                    .await;
            }
        }

        let summary = EnrichmentSummary {
            entities_enriched: commit.entities_updated,
            entities_skipped: commit.skipped.len(),
            aliases_created: commit.aliases_created,
            batches: batch_count,
            questions: question_count,
        };

        info!(
            "Enriched {} entities for project {} ({} aliases)",
            summary.entities_enriched, project_id, summary.aliases_created
        );
        self.audit
            .record(
                AuditEntry::new(project_id, AuditAction::EntitiesEnriched, "project")
                    .actor(actor)
                    .resource(project_id)
                    .details(json!(summary)),
            )
            .await;
        Ok(summary)
    }

    /// Live entities still named after their table, that an inferred
    /// writer is allowed to touch
    async fn candidates(&self, project_id: Uuid) -> Result<Vec<EntityContext>, AppError> {
        let mut contexts = Vec::new();
        for entity in self.ontology.list_entities(project_id).await? {
            if entity.is_stale || !entity.needs_enrichment() {
                continue;
            }
            let what = format!("Entity '{}'", entity.name);
            if let Err(e) =
                ProvenanceGuard::check(&what, entity.created_by, entity.updated_by, Provenance::Inferred)
            {
                debug!("Skipping enrichment: {}", e);
                continue;
            }

            let columns = match self
                .schema
                .find_table(project_id, Some(&entity.primary_schema), &entity.primary_table)
                .await?
            {
                Some(table) => self.schema.list_columns(table.id).await?,
                None => Vec::new(),
            };
            contexts.push(EntityContext { entity, columns });
        }
        Ok(contexts)
    }

    async fn run_batch(
        &self,
        index: usize,
        total: usize,
        batch: Vec<EntityContext>,
    ) -> Result<BatchOutcome, BatchError> {
        let response = self
            .llm
            .generate(GenerateRequest {
                prompt: build_prompt(&batch),
                system_message: SYSTEM_MESSAGE.to_string(),
                temperature: self.config.temperature,
                thinking: self.config.thinking,
            })
            .await
            .map_err(|e| BatchError {
                error: AppError::EnrichmentBatch(format!(
                    "batch {} of {}: {}",
                    index + 1,
                    total,
                    e
                )),
                batch: index,
                conversation_id: None,
            })?;
        let conversation_id = response.conversation_id;

        let fail = |error: AppError| BatchError {
            error,
            batch: index,
            conversation_id: conversation_id.clone(),
        };
        let parsed = parse_response(&response.content).map_err(fail)?;
        let enrichments = match_batch(&batch, &parsed.entities).map_err(fail)?;

        Ok(BatchOutcome {
            enrichments,
            questions: parsed.questions,
            conversation_id,
        })
    }
}

/// Pair every requested entity with its reply entry. Replies may name a
/// table bare when that is unambiguous within the batch.
fn match_batch(
    batch: &[EntityContext],
    replies: &[EnrichedEntity],
) -> Result<Vec<EntityEnrichment>, AppError> {
    let by_table: HashMap<&str, &EnrichedEntity> =
        replies.iter().map(|r| (r.table_name.trim(), r)).collect();
    let mut bare_counts: HashMap<&str, usize> = HashMap::new();
    for context in batch {
        *bare_counts.entry(context.entity.primary_table.as_str()).or_default() += 1;
    }

    let mut missing = Vec::new();
    let mut enrichments = Vec::with_capacity(batch.len());
    for context in batch {
        let key = context.table_key();
        let bare = context.entity.primary_table.as_str();
        let reply = by_table.get(key.as_str()).or_else(|| {
            if bare_counts.get(bare) == Some(&1) {
                by_table.get(bare)
            } else {
                None
            }
        });

        match reply {
            Some(reply) => enrichments.push(to_enrichment(context, reply)),
            None => missing.push(key),
        }
    }

    if !missing.is_empty() {
        return Err(AppError::EnrichmentIncomplete { missing });
    }
    Ok(enrichments)
}

fn to_enrichment(context: &EntityContext, reply: &EnrichedEntity) -> EntityEnrichment {
    let name = match reply.entity_name.trim() {
        "" => suggested_entity_name(&context.entity.primary_table),
        name => name.to_string(),
    };

    let mut seen = HashSet::new();
    let aliases = reply
        .alternative_names
        .iter()
        .map(|a| a.trim())
        .filter(|a| !a.is_empty() && seen.insert(*a))
        .map(str::to_string)
        .collect();

    EntityEnrichment {
        entity_id: context.entity.id,
        name,
        description: reply.description.trim().to_string(),
        domain: reply
            .domain
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string),
        aliases,
    }
}
