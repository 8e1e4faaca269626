//! Artifact cache and the automatic embedding pipeline.
//!
//! Artifacts are keyed `(url, kind)` with `url = "<Type>/<id>"`. The
//! embedding artifact is derived from the entity's text fields and
//! content-addressed via `source_hash`, so unchanged text skips the
//! (potentially remote) embed call.

use chrono::Utc;
use serde_json::json;
use tracing::warn;

use crate::embedding::{content_hash, EmbeddingConfig};
use crate::model::{entity_url, Artifact, ArtifactDraft, Entity};
use crate::Result;

use super::MemoryProvider;

/// Artifact kind of the automatically maintained embedding.
pub const EMBEDDING_KIND: &str = "embedding";

impl MemoryProvider {
    pub async fn get_artifact(&self, url: &str, kind: &str) -> Result<Option<Artifact>> {
        Ok(self
            .inner
            .artifacts
            .read()
            .get(&(url.to_string(), kind.to_string()))
            .cloned())
    }

    /// Upsert by `(url, kind)`. Overwriting keeps `created_at` and stamps
    /// `updated_at`.
    pub async fn set_artifact(&self, draft: ArtifactDraft) -> Result<Artifact> {
        let key = (draft.url.clone(), draft.kind.clone());
        let mut artifacts = self.inner.artifacts.write();
        let now = Utc::now();
        let artifact = match artifacts.get(&key) {
            Some(existing) => Artifact {
                url: draft.url,
                kind: draft.kind,
                source_hash: draft.source_hash,
                content: draft.content,
                metadata: draft.metadata,
                created_at: existing.created_at,
                updated_at: Some(now),
            },
            None => Artifact {
                url: draft.url,
                kind: draft.kind,
                source_hash: draft.source_hash,
                content: draft.content,
                metadata: draft.metadata,
                created_at: now,
                updated_at: None,
            },
        };
        artifacts.insert(key, artifact.clone());
        Ok(artifact)
    }

    /// Remove every kind scoped to `url`. Returns how many were removed.
    pub async fn delete_artifact(&self, url: &str) -> Result<usize> {
        let mut artifacts = self.inner.artifacts.write();
        let before = artifacts.len();
        artifacts.retain(|(artifact_url, _), _| artifact_url != url);
        Ok(before - artifacts.len())
    }

    pub async fn list_artifacts(&self, url: &str) -> Result<Vec<Artifact>> {
        Ok(self
            .inner
            .artifacts
            .read()
            .iter()
            .filter(|((artifact_url, _), _)| artifact_url == url)
            .map(|(_, artifact)| artifact.clone())
            .collect())
    }

    /// Update-time invalidation: every artifact of the entity except the
    /// embedding, which is regenerated explicitly.
    pub(crate) fn invalidate_derived_artifacts(&self, url: &str) {
        self.inner
            .artifacts
            .write()
            .retain(|(artifact_url, kind), _| artifact_url != url || kind == EMBEDDING_KIND);
    }

    /// Delete-time cleanup: everything scoped to `url`.
    pub(crate) fn remove_all_artifacts(&self, url: &str) {
        self.inner
            .artifacts
            .write()
            .retain(|(artifact_url, _), _| artifact_url != url);
    }

    // ========================================================================
    // Automatic embedding
    // ========================================================================

    /// Run after create/update:
    /// 1. consult the per-type config (`false` disables; unset enables)
    /// 2. extract embeddable text from configured or auto-detected fields
    /// 3. empty text → no-op
    /// 4. unchanged `source_hash` → no-op
    /// 5. embed (injected provider, mock fallback) and store the artifact
    pub(crate) async fn auto_embed(&self, entity: &Entity) -> Result<()> {
        let config = self
            .inner
            .embedding_configs
            .read()
            .get(&entity.entity_type)
            .cloned()
            .unwrap_or_default();
        if !config.enabled {
            return Ok(());
        }

        let text = embeddable_text(entity, &config);
        if text.is_empty() {
            return Ok(());
        }

        let url = entity_url(&entity.entity_type, &entity.id);
        let hash = content_hash(&text);
        let unchanged = self
            .inner
            .artifacts
            .read()
            .get(&(url.clone(), EMBEDDING_KIND.to_string()))
            .is_some_and(|existing| existing.source_hash == hash);
        if unchanged {
            return Ok(());
        }

        let vector = self.embed_text(&text).await;
        self.set_artifact(ArtifactDraft::new(url, EMBEDDING_KIND, hash, json!(vector)))
            .await?;
        Ok(())
    }

    /// Embed one text under a limiter permit. Precedence: injected
    /// provider, then the mock generator; injected failures are logged
    /// and degrade to the mock.
    pub(crate) async fn embed_text(&self, text: &str) -> Vec<f32> {
        let provider = self.inner.embedder.read().clone();
        let _permit = self.inner.limiter.acquire().await;
        if let Some(provider) = provider {
            match provider.embed_texts(&[text.to_string()]).await {
                Ok(mut vectors) if !vectors.is_empty() => return vectors.remove(0),
                Ok(_) => {
                    warn!("embedding backend returned no vectors, using mock generator");
                }
                Err(err) => {
                    warn!(error = %err, "embedding backend failed, using mock generator");
                }
            }
        }
        self.inner.mock.embed_one(text)
    }
}

/// Concatenate the configured fields — or, unconfigured, every
/// string-valued field — into one stripped text.
fn embeddable_text(entity: &Entity, config: &EmbeddingConfig) -> String {
    let mut parts: Vec<String> = Vec::new();
    match &config.fields {
        Some(fields) => {
            for field in fields {
                match entity.fields.get(field) {
                    Some(serde_json::Value::String(s)) => parts.push(s.clone()),
                    Some(other) if !other.is_null() => {
                        parts.push(other.to_string());
                    }
                    _ => {}
                }
            }
        }
        None => {
            for value in entity.fields.values() {
                if let serde_json::Value::String(s) = value {
                    parts.push(s.clone());
                }
            }
        }
    }
    parts.join(" ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::FailingEmbedding;
    use crate::json_record;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_set_get_overwrite() {
        let db = MemoryProvider::new();
        let first = db
            .set_artifact(ArtifactDraft::new("Post/p1", "render", "h1", json!("<p>a</p>")))
            .await
            .unwrap();
        assert!(first.updated_at.is_none());

        let second = db
            .set_artifact(ArtifactDraft::new("Post/p1", "render", "h2", json!("<p>b</p>")))
            .await
            .unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at.is_some());

        let fetched = db.get_artifact("Post/p1", "render").await.unwrap().unwrap();
        assert_eq!(fetched.source_hash, "h2");
    }

    #[tokio::test]
    async fn test_delete_removes_all_kinds() {
        let db = MemoryProvider::new();
        db.set_artifact(ArtifactDraft::new("Post/p1", "render", "h", json!(1)))
            .await
            .unwrap();
        db.set_artifact(ArtifactDraft::new("Post/p1", "summary", "h", json!(2)))
            .await
            .unwrap();
        db.set_artifact(ArtifactDraft::new("Post/p2", "render", "h", json!(3)))
            .await
            .unwrap();

        assert_eq!(db.delete_artifact("Post/p1").await.unwrap(), 2);
        assert!(db.get_artifact("Post/p1", "render").await.unwrap().is_none());
        assert!(db.get_artifact("Post/p2", "render").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_embeds_text_fields() {
        let db = MemoryProvider::new();
        db.create("Post", Some("p1"), json_record!({"title": "Hello world"}))
            .await
            .unwrap();
        let artifact = db
            .get_artifact("Post/p1", EMBEDDING_KIND)
            .await
            .unwrap()
            .expect("embedding artifact");
        let vector: Vec<f32> = serde_json::from_value(artifact.content).unwrap();
        assert!(!vector.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_type_does_not_embed() {
        let db = MemoryProvider::new();
        db.configure_embedding(
            "Secret",
            EmbeddingConfig {
                enabled: false,
                fields: None,
            },
        );
        db.create("Secret", Some("s1"), json_record!({"note": "text"}))
            .await
            .unwrap();
        assert!(db
            .get_artifact("Secret/s1", EMBEDDING_KIND)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_no_text_no_embedding() {
        let db = MemoryProvider::new();
        db.create("Point", Some("p1"), json_record!({"x": 1, "y": 2}))
            .await
            .unwrap();
        assert!(db
            .get_artifact("Point/p1", EMBEDDING_KIND)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_unchanged_text_keeps_artifact() {
        let db = MemoryProvider::new();
        db.create("Post", Some("p1"), json_record!({"title": "same", "views": 1}))
            .await
            .unwrap();
        let before = db
            .get_artifact("Post/p1", EMBEDDING_KIND)
            .await
            .unwrap()
            .unwrap();

        // Non-text update: embeddable text unchanged, artifact untouched.
        db.update("Post", "p1", json_record!({"views": 2})).await.unwrap();
        let after = db
            .get_artifact("Post/p1", EMBEDDING_KIND)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.source_hash, before.source_hash);
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[tokio::test]
    async fn test_update_invalidates_derived_but_not_embedding() {
        let db = MemoryProvider::new();
        db.create("Post", Some("p1"), json_record!({"title": "hello"}))
            .await
            .unwrap();
        db.set_artifact(ArtifactDraft::new("Post/p1", "render", "h", json!("x")))
            .await
            .unwrap();

        db.update("Post", "p1", json_record!({"title": "hello again"}))
            .await
            .unwrap();

        assert!(db.get_artifact("Post/p1", "render").await.unwrap().is_none());
        assert!(db
            .get_artifact("Post/p1", EMBEDDING_KIND)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_delete_cleans_artifacts() {
        let db = MemoryProvider::new();
        db.create("Post", Some("p1"), json_record!({"title": "hello"}))
            .await
            .unwrap();
        db.delete("Post", "p1").await.unwrap();
        assert!(db.list_artifacts("Post/p1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_backend_falls_back_to_mock() {
        let db = MemoryProvider::new();
        db.set_embedding_provider(Arc::new(FailingEmbedding));
        db.create("Post", Some("p1"), json_record!({"title": "resilient"}))
            .await
            .unwrap();
        // The mock generator produced the artifact despite the backend error.
        assert!(db
            .get_artifact("Post/p1", EMBEDDING_KIND)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_configured_fields_only() {
        let db = MemoryProvider::new();
        db.configure_embedding(
            "Post",
            EmbeddingConfig {
                enabled: true,
                fields: Some(vec!["title".into()]),
            },
        );
        db.create(
            "Post",
            Some("p1"),
            json_record!({"title": "keep", "body": "ignored"}),
        )
        .await
        .unwrap();
        let with_title = db
            .get_artifact("Post/p1", EMBEDDING_KIND)
            .await
            .unwrap()
            .unwrap();

        // Changing an unconfigured field leaves the hash unchanged.
        db.update("Post", "p1", json_record!({"body": "still ignored"}))
            .await
            .unwrap();
        let after = db
            .get_artifact("Post/p1", EMBEDDING_KIND)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.source_hash, with_title.source_hash);
    }
}
