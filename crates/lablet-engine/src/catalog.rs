//! Definition catalog.
//!
//! Definitions are immutable per `(id, version)`. The artifact is fetched
//! once when a new version is registered and its SHA-256 digest is kept
//! with the definition; later fetches (after a restart, say) must match.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use lablet_core::{ArtifactStore, ArtifactUri, ContentDigest, DefinitionRef, LabletDefinition};
use lablet_placement::Requirements;
use lablet_state::StateStore;

use crate::error::{EngineError, EngineResult};

pub struct DefinitionCatalog {
    state: StateStore,
    artifacts: Arc<dyn ArtifactStore>,
    contents: Mutex<HashMap<String, Arc<str>>>,
}

impl DefinitionCatalog {
    pub fn new(state: StateStore, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            state,
            artifacts,
            contents: Mutex::new(HashMap::new()),
        }
    }

    /// Register a definition version.
    ///
    /// Registering the same version again with the same fields is a
    /// no-op that returns the stored copy; any difference is a conflict.
    pub async fn register(&self, mut def: LabletDefinition) -> EngineResult<LabletDefinition> {
        validate(&def)?;
        let reference = def.reference();

        if let Some(existing) = self.state.get_definition(&reference)? {
            let unchanged = LabletDefinition {
                artifact_digest: None,
                ..existing.clone()
            } == LabletDefinition {
                artifact_digest: None,
                ..def.clone()
            };
            let digest_agrees = def
                .artifact_digest
                .as_ref()
                .is_none_or(|d| existing.artifact_digest.as_ref() == Some(d));
            if unchanged && digest_agrees {
                debug!(definition = %reference, "definition already registered");
                return Ok(existing);
            }
            return Err(EngineError::DefinitionConflict {
                definition: reference.to_string(),
            });
        }

        let artifact = self.artifacts.fetch(&def.artifact_uri).await?;
        let digest = ContentDigest::of(artifact.content.as_bytes());
        if let Some(expected) = &def.artifact_digest {
            if expected != digest.as_str() {
                return Err(EngineError::DigestMismatch {
                    definition: reference.to_string(),
                    expected: expected.clone(),
                    actual: digest.to_string(),
                });
            }
        }

        def.artifact_digest = Some(digest.to_string());
        self.state.put_definition(&def)?;
        self.cache(&reference, artifact.content);
        info!(
            definition = %reference,
            digest = %digest,
            ports = def.port_count(),
            nodes = def.node_count,
            "definition registered"
        );
        Ok(def)
    }

    pub fn get(&self, reference: &DefinitionRef) -> EngineResult<Option<LabletDefinition>> {
        Ok(self.state.get_definition(reference)?)
    }

    pub fn list(&self) -> EngineResult<Vec<LabletDefinition>> {
        Ok(self.state.list_definitions()?)
    }

    /// Artifact content for a registered definition, refetched and
    /// checked against the stored digest when not cached.
    pub async fn artifact(&self, def: &LabletDefinition) -> EngineResult<Arc<str>> {
        let reference = def.reference();
        let key = reference.table_key();
        if let Some(content) = self
            .contents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(Arc::clone(content));
        }

        let artifact = self.artifacts.fetch(&def.artifact_uri).await?;
        let digest = ContentDigest::of(artifact.content.as_bytes());
        if let Some(expected) = &def.artifact_digest {
            if expected != digest.as_str() {
                return Err(EngineError::DigestMismatch {
                    definition: reference.to_string(),
                    expected: expected.clone(),
                    actual: digest.to_string(),
                });
            }
        }
        Ok(self.cache(&reference, artifact.content))
    }

    fn cache(&self, reference: &DefinitionRef, content: String) -> Arc<str> {
        let content: Arc<str> = Arc::from(content);
        self.contents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference.table_key(), Arc::clone(&content));
        content
    }
}

fn validate(def: &LabletDefinition) -> EngineResult<()> {
    let invalid = |reason: String| EngineError::InvalidDefinition {
        definition: def.reference().to_string(),
        reason,
    };

    if def.license_affinity.is_empty() {
        return Err(invalid("license affinity is empty".to_string()));
    }
    if def.max_duration_secs == 0 {
        return Err(invalid("max duration must be positive".to_string()));
    }
    let mut names = BTreeSet::new();
    for name in &def.port_template {
        if !names.insert(name.as_str()) {
            return Err(invalid(format!("duplicate port name {name}")));
        }
    }
    ArtifactUri::parse(&def.artifact_uri).map_err(|e| invalid(e.to_string()))?;
    Requirements::from_definition(def).map_err(|e| invalid(e.to_string()))?;
    Ok(())
}
