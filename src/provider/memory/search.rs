//! Retrieval engine: substring FTS, semantic (cosine) search, hybrid
//! reciprocal-rank fusion, and union fallback across candidate types.

use indexmap::IndexMap;
use serde_json::Value;
use tracing::warn;

use crate::embedding::EmbeddingProvider;
use crate::model::{entity_url, Entity, Record};
use crate::provider::{
    SearchOptions, SemanticSearchOptions, HybridSearchOptions, UnionErrorPolicy,
    UnionSearchError, UnionSearchMode, UnionSearchOptions, UnionSearchResult,
};
use crate::validate::{validate_field_name, validate_type_name};
use crate::Result;

use super::artifacts::EMBEDDING_KIND;
use super::MemoryProvider;

impl MemoryProvider {
    // ========================================================================
    // Full-text search
    // ========================================================================

    /// Case-insensitive substring search over the named fields, or over
    /// the serialized record when no fields are given. Score is
    /// `1 − first_hit / text_len`, so earlier hits rank higher.
    pub async fn search(
        &self,
        entity_type: &str,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<Record>> {
        validate_type_name(entity_type)?;
        if let Some(fields) = &options.fields {
            for field in fields {
                validate_field_name(field)?;
            }
        }

        let snapshot: Vec<Entity> = {
            let entities = self.inner.entities.read();
            entities
                .get(entity_type)
                .map(|map| map.values().cloned().collect())
                .unwrap_or_default()
        };

        let needle = query.to_lowercase();
        let mut hits: Vec<(f64, Record)> = Vec::new();
        for entity in &snapshot {
            let haystack = match &options.fields {
                Some(fields) => field_text(entity, fields),
                None => entity.search_text(),
            };
            let lowered = haystack.to_lowercase();
            let Some(index) = lowered.find(&needle) else { continue };
            let score = if lowered.is_empty() {
                1.0
            } else {
                1.0 - index as f64 / lowered.len() as f64
            };
            if score < options.min_score {
                continue;
            }
            let mut record = entity.record();
            record.insert("$score".into(), score.into());
            hits.push((score, record));
        }

        hits.sort_by(|a, b| b.0.total_cmp(&a.0));
        let limit = options.limit.unwrap_or(usize::MAX);
        Ok(hits.into_iter().take(limit).map(|(_, r)| r).collect())
    }

    // ========================================================================
    // Semantic search
    // ========================================================================

    /// Embed the query, rank the type's stored embeddings by cosine
    /// similarity, and project the top hits with `$score`.
    pub async fn semantic_search(
        &self,
        entity_type: &str,
        query: &str,
        options: SemanticSearchOptions,
    ) -> Result<Vec<Record>> {
        validate_type_name(entity_type)?;
        let query_vec = self.embed_text(query).await;

        let (entities, embeddings) = self.embeddings_snapshot(entity_type);
        if entities.is_empty() {
            return Ok(Vec::new());
        }

        let embedder = self.inner.embedder.read().clone();
        let hits = match &embedder {
            Some(provider) => {
                match provider
                    .find_similar(&query_vec, &embeddings, options.limit, options.min_score)
                    .await
                {
                    Ok(hits) => hits,
                    Err(err) => {
                        warn!(error = %err, "embedding backend similarity failed, using default ranking");
                        self.inner
                            .mock
                            .find_similar(&query_vec, &embeddings, options.limit, options.min_score)
                            .await?
                    }
                }
            }
            None => {
                self.inner
                    .mock
                    .find_similar(&query_vec, &embeddings, options.limit, options.min_score)
                    .await?
            }
        };

        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                let entity = entities.get(hit.index)?;
                let mut record = entity.record();
                record.insert("$score".into(), (hit.score as f64).into());
                Some(record)
            })
            .collect())
    }

    /// Entities of the type that have an embedding artifact, with their
    /// vectors, index-aligned.
    fn embeddings_snapshot(&self, entity_type: &str) -> (Vec<Entity>, Vec<Vec<f32>>) {
        let entities = self.inner.entities.read();
        let artifacts = self.inner.artifacts.read();
        let mut out_entities = Vec::new();
        let mut out_vectors = Vec::new();
        if let Some(map) = entities.get(entity_type) {
            for entity in map.values() {
                let key = (
                    entity_url(entity_type, &entity.id),
                    EMBEDDING_KIND.to_string(),
                );
                let Some(artifact) = artifacts.get(&key) else { continue };
                let Ok(vector) = serde_json::from_value::<Vec<f32>>(artifact.content.clone())
                else {
                    continue;
                };
                out_entities.push(entity.clone());
                out_vectors.push(vector);
            }
        }
        (out_entities, out_vectors)
    }

    // ========================================================================
    // Hybrid search (reciprocal-rank fusion)
    // ========================================================================

    /// Fuse FTS and semantic ranks: `w_fts/(k + fts) + w_sem/(k + sem)`,
    /// a missing rank contributing 0. The candidate set is the union of
    /// both result lists; `2·(limit+offset)` candidates are fetched from
    /// each side before `offset`/`limit` apply.
    pub async fn hybrid_search(
        &self,
        entity_type: &str,
        query: &str,
        options: HybridSearchOptions,
    ) -> Result<Vec<Record>> {
        validate_type_name(entity_type)?;
        let fetch = (2 * (options.limit + options.offset)).max(1);

        let fts = self
            .search(
                entity_type,
                query,
                SearchOptions {
                    fields: options.fields.clone(),
                    min_score: 0.0,
                    limit: Some(fetch),
                },
            )
            .await?;
        let semantic = self
            .semantic_search(
                entity_type,
                query,
                SemanticSearchOptions {
                    // All candidates; RRF does the ranking.
                    min_score: -1.0,
                    limit: fetch,
                },
            )
            .await?;

        struct Candidate {
            record: Record,
            fts_rank: Option<usize>,
            sem_rank: Option<usize>,
            sem_score: Option<f64>,
        }

        let mut candidates: IndexMap<String, Candidate> = IndexMap::new();
        for (i, mut record) in fts.into_iter().enumerate() {
            let Some(id) = record.get("$id").and_then(Value::as_str).map(String::from) else {
                continue;
            };
            record.shift_remove("$score");
            candidates.insert(
                id,
                Candidate {
                    record,
                    fts_rank: Some(i + 1),
                    sem_rank: None,
                    sem_score: None,
                },
            );
        }
        for (i, mut record) in semantic.into_iter().enumerate() {
            let Some(id) = record.get("$id").and_then(Value::as_str).map(String::from) else {
                continue;
            };
            let score = record.get("$score").and_then(Value::as_f64);
            record.shift_remove("$score");
            match candidates.get_mut(&id) {
                Some(candidate) => {
                    candidate.sem_rank = Some(i + 1);
                    candidate.sem_score = score;
                }
                None => {
                    candidates.insert(
                        id,
                        Candidate {
                            record,
                            fts_rank: None,
                            sem_rank: Some(i + 1),
                            sem_score: score,
                        },
                    );
                }
            }
        }

        let mut fused: Vec<(f64, Candidate)> = candidates
            .into_values()
            .map(|c| {
                let score = rrf_score(
                    options.k,
                    options.fts_weight,
                    options.semantic_weight,
                    c.fts_rank,
                    c.sem_rank,
                );
                (score, c)
            })
            .collect();
        fused.sort_by(|a, b| b.0.total_cmp(&a.0));

        Ok(fused
            .into_iter()
            .skip(options.offset)
            .take(options.limit)
            .map(|(score, c)| {
                let mut record = c.record;
                record.insert("$rrfScore".into(), score.into());
                record.insert("$ftsRank".into(), rank_value(c.fts_rank));
                record.insert("$semanticRank".into(), rank_value(c.sem_rank));
                record.insert(
                    "$score".into(),
                    c.sem_score.map(Value::from).unwrap_or(Value::Null),
                );
                record
            })
            .collect())
    }

    // ========================================================================
    // Union fallback search
    // ========================================================================

    /// Resolve a `<~Type1|Type2|…` reference: search the candidate types
    /// in declaration order (stopping at the first hit) or in parallel.
    /// The input `types` slice is never mutated.
    pub async fn union_search(
        &self,
        types: &[String],
        query: &str,
        options: UnionSearchOptions,
    ) -> Result<UnionSearchResult> {
        match options.mode {
            UnionSearchMode::Ordered => self.union_search_ordered(types, query, options).await,
            UnionSearchMode::Parallel => self.union_search_parallel(types, query, options).await,
        }
    }

    async fn union_search_ordered(
        &self,
        types: &[String],
        query: &str,
        options: UnionSearchOptions,
    ) -> Result<UnionSearchResult> {
        let mut result = UnionSearchResult::default();

        for entity_type in types {
            let threshold = options
                .per_type_thresholds
                .get(entity_type)
                .copied()
                .unwrap_or(options.threshold);
            result.search_order.push(entity_type.clone());
            result.searched_types.push(entity_type.clone());

            match self
                .semantic_search(
                    entity_type,
                    query,
                    SemanticSearchOptions {
                        min_score: threshold,
                        limit: options.limit,
                    },
                )
                .await
            {
                Ok(records) if !records.is_empty() => {
                    result.matched_type = Some(entity_type.clone());
                    result.results = records;
                    break;
                }
                Ok(_) => {}
                Err(err) => match options.on_error {
                    UnionErrorPolicy::Fail => return Err(err),
                    UnionErrorPolicy::Continue => result.errors.push(UnionSearchError {
                        entity_type: entity_type.clone(),
                        message: err.to_string(),
                    }),
                },
            }
        }

        result.fallback_triggered = result.searched_types.len() > 1;
        result.all_types_exhausted = result.matched_type.is_none();

        if result.all_types_exhausted && options.collect_below_threshold {
            let mut below = Vec::new();
            for entity_type in types {
                if let Ok(records) = self
                    .semantic_search(
                        entity_type,
                        query,
                        SemanticSearchOptions {
                            min_score: -1.0,
                            limit: options.limit,
                        },
                    )
                    .await
                {
                    below.extend(records);
                }
            }
            below.sort_by(|a, b| record_score(b).total_cmp(&record_score(a)));
            below.truncate(options.limit);
            result.below_threshold_matches = below;
        }

        Ok(result)
    }

    async fn union_search_parallel(
        &self,
        types: &[String],
        query: &str,
        options: UnionSearchOptions,
    ) -> Result<UnionSearchResult> {
        let mut result = UnionSearchResult {
            search_order: types.to_vec(),
            searched_types: types.to_vec(),
            ..Default::default()
        };

        let searches = self
            .inner
            .limiter
            .map(types.to_vec(), |entity_type| {
                let provider = self.clone();
                let query = query.to_string();
                let threshold = options
                    .per_type_thresholds
                    .get(&entity_type)
                    .copied()
                    .unwrap_or(options.threshold);
                let limit = options.limit;
                async move {
                    let outcome = provider
                        .semantic_search(
                            &entity_type,
                            &query,
                            SemanticSearchOptions {
                                min_score: threshold,
                                limit,
                            },
                        )
                        .await;
                    (entity_type, outcome)
                }
            })
            .await;

        let mut merged: Vec<Record> = Vec::new();
        for (entity_type, outcome) in searches {
            match outcome {
                Ok(records) => merged.extend(records),
                Err(err) => match options.on_error {
                    UnionErrorPolicy::Fail => return Err(err),
                    UnionErrorPolicy::Continue => result.errors.push(UnionSearchError {
                        entity_type,
                        message: err.to_string(),
                    }),
                },
            }
        }

        merged.sort_by(|a, b| record_score(b).total_cmp(&record_score(a)));
        result.fallback_triggered = types.len() > 1;
        result.all_types_exhausted = merged.is_empty();
        result.matched_type = merged
            .first()
            .and_then(|r| r.get("$type"))
            .and_then(Value::as_str)
            .map(String::from);
        result.results = if options.return_all {
            merged.truncate(options.limit);
            merged
        } else {
            merged.into_iter().take(1).collect()
        };
        Ok(result)
    }
}

// ============================================================================
// Scoring helpers
// ============================================================================

/// Reciprocal-rank fusion. Missing rank → `+∞` → contributes 0.
pub(crate) fn rrf_score(
    k: f64,
    fts_weight: f64,
    semantic_weight: f64,
    fts_rank: Option<usize>,
    sem_rank: Option<usize>,
) -> f64 {
    let fts = fts_rank.map(|r| fts_weight / (k + r as f64)).unwrap_or(0.0);
    let sem = sem_rank
        .map(|r| semantic_weight / (k + r as f64))
        .unwrap_or(0.0);
    fts + sem
}

fn rank_value(rank: Option<usize>) -> Value {
    rank.map(|r| Value::from(r as u64)).unwrap_or(Value::Null)
}

fn record_score(record: &Record) -> f64 {
    record
        .get("$score")
        .and_then(Value::as_f64)
        .unwrap_or(f64::MIN)
}

/// Concatenated text of the named fields: strings verbatim, other values
/// JSON-serialized.
fn field_text(entity: &Entity, fields: &[String]) -> String {
    let mut parts = Vec::new();
    for field in fields {
        match entity.fields.get(field) {
            Some(Value::String(s)) => parts.push(s.clone()),
            Some(Value::Null) | None => {}
            Some(other) => parts.push(other.to_string()),
        }
    }
    parts.join(" ")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json_record;
    use crate::provider::{UnionErrorPolicy, UnionSearchMode};

    async fn seeded(texts: &[(&str, &str)]) -> MemoryProvider {
        let db = MemoryProvider::new();
        for (id, text) in texts {
            db.create("Doc", Some(id), json_record!({"body": text}))
                .await
                .unwrap();
        }
        db
    }

    #[tokio::test]
    async fn test_fts_scores_earlier_hits_higher() {
        let db = seeded(&[
            ("early", "rust is everywhere here"),
            ("late", "everything else and then rust"),
        ])
        .await;
        let hits = db
            .search(
                "Doc",
                "rust",
                SearchOptions {
                    fields: Some(vec!["body".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0]["$id"], "early");
        assert!(hits[0]["$score"].as_f64() > hits[1]["$score"].as_f64());
    }

    #[tokio::test]
    async fn test_fts_literal_percent() {
        let db = seeded(&[
            ("a", "100% Complete"),
            ("b", "100 Items"),
            ("c", "100 Dollars"),
        ])
        .await;
        let hits = db
            .search("Doc", "100%", SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["$id"], "a");
    }

    #[tokio::test]
    async fn test_fts_case_insensitive_and_min_score() {
        let db = seeded(&[("a", "Hello World")]).await;
        let hits = db
            .search("Doc", "hello", SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let none = db
            .search(
                "Doc",
                "World",
                SearchOptions {
                    min_score: 0.99,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_semantic_search_ranks_overlap() {
        let db = seeded(&[
            ("rust1", "rust database engine"),
            ("rust2", "rust compiler internals"),
            ("food", "chocolate pancake recipe"),
        ])
        .await;
        let hits = db
            .semantic_search(
                "Doc",
                "rust database",
                SemanticSearchOptions {
                    min_score: 0.1,
                    limit: 2,
                },
            )
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0]["$id"], "rust1");
        assert!(hits[0]["$score"].as_f64().unwrap() > 0.5);
    }

    #[tokio::test]
    async fn test_hybrid_search_attaches_rank_projection() {
        let db = seeded(&[
            ("a", "searchable text about databases"),
            ("b", "another searchable database text"),
        ])
        .await;
        let hits = db
            .hybrid_search("Doc", "database", HybridSearchOptions::default())
            .await
            .unwrap();
        assert!(!hits.is_empty());
        for hit in &hits {
            assert!(hit.contains_key("$rrfScore"));
            assert!(hit.contains_key("$ftsRank"));
            assert!(hit.contains_key("$semanticRank"));
            assert!(hit.contains_key("$score"));
        }
        // Descending by fused score.
        let scores: Vec<f64> = hits
            .iter()
            .map(|h| h["$rrfScore"].as_f64().unwrap())
            .collect();
        let mut sorted = scores.clone();
        sorted.sort_by(|a, b| b.total_cmp(a));
        assert_eq!(scores, sorted);
    }

    #[test]
    fn test_rrf_computation() {
        // d1: fts 1 / sem 3; d2: fts 5 / sem 1, k = 60, equal weights.
        let d1 = rrf_score(60.0, 0.5, 0.5, Some(1), Some(3));
        let d2 = rrf_score(60.0, 0.5, 0.5, Some(5), Some(1));
        assert!((d1 - (0.5 / 61.0 + 0.5 / 63.0)).abs() < 1e-12);
        assert!((d2 - (0.5 / 65.0 + 0.5 / 61.0)).abs() < 1e-12);
        assert!(d1 > d2);
        // Missing rank contributes nothing.
        assert_eq!(rrf_score(60.0, 0.5, 0.5, None, None), 0.0);
        assert!(rrf_score(60.0, 0.5, 0.5, Some(1), None) > 0.0);
    }

    #[tokio::test]
    async fn test_union_ordered_stops_at_first_hit() {
        let db = MemoryProvider::new();
        db.create("Person", Some("p1"), json_record!({"name": "ada lovelace"}))
            .await
            .unwrap();
        db.create("Company", Some("c1"), json_record!({"name": "ada systems"}))
            .await
            .unwrap();

        let types = vec!["Person".to_string(), "Company".to_string()];
        let result = db
            .union_search(
                &types,
                "ada lovelace",
                UnionSearchOptions {
                    threshold: 0.5,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(result.matched_type.as_deref(), Some("Person"));
        assert_eq!(result.searched_types, vec!["Person"]);
        assert!(!result.fallback_triggered);
        assert!(!result.all_types_exhausted);
        // The input list is untouched.
        assert_eq!(types, vec!["Person".to_string(), "Company".to_string()]);
    }

    #[tokio::test]
    async fn test_union_ordered_falls_through() {
        let db = MemoryProvider::new();
        db.create("Person", Some("p1"), json_record!({"name": "gardening tips"}))
            .await
            .unwrap();
        db.create("Company", Some("c1"), json_record!({"name": "quantum flux widgets"}))
            .await
            .unwrap();

        let types = vec!["Person".to_string(), "Company".to_string()];
        let result = db
            .union_search(
                &types,
                "quantum flux widgets",
                UnionSearchOptions {
                    threshold: 0.6,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(result.matched_type.as_deref(), Some("Company"));
        assert_eq!(result.searched_types.len(), 2);
        assert!(result.fallback_triggered);
    }

    #[tokio::test]
    async fn test_union_exhausted_reports_below_threshold() {
        let db = MemoryProvider::new();
        db.create("Person", Some("p1"), json_record!({"name": "alpha"}))
            .await
            .unwrap();

        let types = vec!["Person".to_string()];
        let result = db
            .union_search(
                &types,
                "completely unrelated query terms",
                UnionSearchOptions {
                    threshold: 0.9,
                    collect_below_threshold: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(result.all_types_exhausted);
        assert!(result.matched_type.is_none());
        assert!(!result.below_threshold_matches.is_empty());
    }

    #[tokio::test]
    async fn test_union_parallel_return_all() {
        let db = MemoryProvider::new();
        db.create("Person", Some("p1"), json_record!({"name": "ada research"}))
            .await
            .unwrap();
        db.create("Company", Some("c1"), json_record!({"name": "ada research labs"}))
            .await
            .unwrap();

        let types = vec!["Person".to_string(), "Company".to_string()];
        let all = db
            .union_search(
                &types,
                "ada research",
                UnionSearchOptions {
                    mode: UnionSearchMode::Parallel,
                    threshold: 0.1,
                    return_all: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(all.results.len(), 2);

        let best = db
            .union_search(
                &types,
                "ada research",
                UnionSearchOptions {
                    mode: UnionSearchMode::Parallel,
                    threshold: 0.1,
                    return_all: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(best.results.len(), 1);
        assert!(best.matched_type.is_some());
    }

    #[tokio::test]
    async fn test_union_parallel_collects_errors() {
        let db = MemoryProvider::new();
        db.create("Person", Some("p1"), json_record!({"name": "ada"}))
            .await
            .unwrap();

        // "Bad Name" fails type validation inside semantic_search.
        let types = vec!["Person".to_string(), "Bad Name".to_string()];
        let result = db
            .union_search(
                &types,
                "ada",
                UnionSearchOptions {
                    mode: UnionSearchMode::Parallel,
                    threshold: 0.1,
                    return_all: true,
                    on_error: UnionErrorPolicy::Continue,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].entity_type, "Bad Name");
        assert!(!result.results.is_empty());

        let failed = db
            .union_search(
                &types,
                "ada",
                UnionSearchOptions {
                    mode: UnionSearchMode::Parallel,
                    on_error: UnionErrorPolicy::Fail,
                    ..Default::default()
                },
            )
            .await;
        assert!(failed.is_err());
    }
}
