//! Path registry: the catalog of submittable definitions.
//!
//! Thread-safe via interior `RwLock`; designed to be wrapped in `Arc` and
//! shared across the application. Reads never block each other; writes only
//! happen on administrative registration or a catalog reload.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tumbler_core::definition::{Definition, DefinitionKind};
use tumbler_core::error::CoreError;
use tumbler_core::path::JobPath;

#[derive(Debug)]
pub struct PathRegistry {
    definitions: RwLock<BTreeMap<JobPath, Arc<Definition>>>,
}

impl PathRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            definitions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Build a registry from a list of definitions, rejecting duplicates.
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = Definition>,
    ) -> Result<Self, CoreError> {
        let mut table = BTreeMap::new();
        for definition in definitions {
            insert_unique(&mut table, definition)?;
        }
        Ok(Self {
            definitions: RwLock::new(table),
        })
    }

    /// Register a definition. Fails with `Conflict` if the path is taken.
    pub async fn register(&self, definition: Definition) -> Result<(), CoreError> {
        let mut definitions = self.definitions.write().await;
        insert_unique(&mut definitions, definition)
    }

    /// Swap the whole table (catalog reload). Nothing changes on error.
    pub async fn replace_all(
        &self,
        definitions: impl IntoIterator<Item = Definition>,
    ) -> Result<usize, CoreError> {
        let mut table = BTreeMap::new();
        for definition in definitions {
            insert_unique(&mut table, definition)?;
        }
        let count = table.len();
        *self.definitions.write().await = table;
        Ok(count)
    }

    /// Remove a definition. Returns `false` if nothing was registered there.
    pub async fn remove(&self, path: &JobPath) -> bool {
        self.definitions.write().await.remove(path).is_some()
    }

    /// Resolve a path to exactly one definition.
    ///
    /// An exact registration wins; otherwise the nearest ancestor wildcard
    /// (`prefix/*`) registration is used.
    pub async fn resolve(&self, path: &JobPath) -> Result<Arc<Definition>, CoreError> {
        let definitions = self.definitions.read().await;

        if let Some(definition) = definitions.get(path) {
            return Ok(Arc::clone(definition));
        }

        if !path.is_wildcard() {
            for ancestor in path.ancestors() {
                if let Some(definition) = definitions.get(&ancestor.wildcard()) {
                    return Ok(Arc::clone(definition));
                }
            }
        }

        Err(CoreError::not_found("Job", path))
    }

    /// Snapshot of every registration as `(path, kind)`, in path order.
    ///
    /// Each call takes a fresh snapshot, so the sequence can be restarted
    /// and reflects registrations current at call time.
    pub async fn list(&self) -> impl Iterator<Item = (JobPath, DefinitionKind)> {
        let snapshot: Vec<(JobPath, DefinitionKind)> = self
            .definitions
            .read()
            .await
            .values()
            .map(|d| (d.path.clone(), d.kind))
            .collect();
        snapshot.into_iter()
    }

    /// All definitions, in path order.
    pub async fn definitions(&self) -> Vec<Arc<Definition>> {
        self.definitions.read().await.values().cloned().collect()
    }

    /// Definitions strictly below `prefix`, in path order.
    pub async fn list_under(&self, prefix: &JobPath) -> Vec<Arc<Definition>> {
        self.definitions
            .read()
            .await
            .values()
            .filter(|d| d.path.is_descendant_of(prefix))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.definitions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.definitions.read().await.is_empty()
    }
}

impl Default for PathRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_unique(
    table: &mut BTreeMap<JobPath, Arc<Definition>>,
    definition: Definition,
) -> Result<(), CoreError> {
    if table.contains_key(&definition.path) {
        return Err(CoreError::Conflict(format!(
            "A definition is already registered at '{}'",
            definition.path
        )));
    }
    table.insert(definition.path.clone(), Arc::new(definition));
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn path(raw: &str) -> JobPath {
        JobPath::parse(raw).unwrap()
    }

    fn pipeline(raw: &str) -> Definition {
        Definition::new(path(raw), DefinitionKind::Pipeline, "sh 'true'")
    }

    fn job(raw: &str) -> Definition {
        Definition::new(path(raw), DefinitionKind::Job, "true")
    }

    #[tokio::test]
    async fn resolves_exact_path() {
        let registry = PathRegistry::from_definitions([job("team/build")]).unwrap();
        let definition = registry.resolve(&path("/team/build/")).await.unwrap();
        assert_eq!(definition.path, path("team/build"));
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let registry = PathRegistry::from_definitions([job("team/build")]).unwrap();
        assert_matches!(
            registry.resolve(&path("team/deploy")).await,
            Err(CoreError::NotFound { entity: "Job", .. })
        );
        // A prefix of a registered path is not itself a definition.
        assert_matches!(
            registry.resolve(&path("team")).await,
            Err(CoreError::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn duplicate_registration_is_conflict() {
        let registry = PathRegistry::new();
        registry.register(job("a/b")).await.unwrap();
        assert_matches!(
            registry.register(pipeline("a/b")).await,
            Err(CoreError::Conflict(_))
        );
        assert_eq!(registry.len().await, 1);
        assert_matches!(
            PathRegistry::from_definitions([job("x"), job("/x/")]),
            Err(CoreError::Conflict(_))
        );
    }

    #[tokio::test]
    async fn wildcard_resolves_descendants() {
        let registry = PathRegistry::from_definitions([pipeline("team/service/*")]).unwrap();

        let direct = registry.resolve(&path("team/service/main")).await.unwrap();
        assert_eq!(direct.path, path("team/service/*"));

        let nested = registry
            .resolve(&path("team/service/feature/login"))
            .await
            .unwrap();
        assert_eq!(nested.path, path("team/service/*"));

        assert_matches!(
            registry.resolve(&path("team/service")).await,
            Err(CoreError::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn exact_beats_wildcard_and_nearest_wildcard_wins() {
        let registry = PathRegistry::from_definitions([
            pipeline("team/*"),
            pipeline("team/service/*"),
            job("team/service/release"),
        ])
        .unwrap();

        let exact = registry.resolve(&path("team/service/release")).await.unwrap();
        assert_eq!(exact.kind, DefinitionKind::Job);

        let nearest = registry.resolve(&path("team/service/main")).await.unwrap();
        assert_eq!(nearest.path, path("team/service/*"));

        let outer = registry.resolve(&path("team/docs")).await.unwrap();
        assert_eq!(outer.path, path("team/*"));
    }

    #[tokio::test]
    async fn list_is_restartable_and_reflects_changes() {
        let registry = PathRegistry::from_definitions([job("b"), pipeline("a/x")]).unwrap();

        let first: Vec<_> = registry.list().await.collect();
        let again: Vec<_> = registry.list().await.collect();
        assert_eq!(first, again);
        assert_eq!(
            first,
            vec![
                (path("a/x"), DefinitionKind::Pipeline),
                (path("b"), DefinitionKind::Job),
            ]
        );

        assert!(registry.remove(&path("b")).await);
        assert!(!registry.remove(&path("b")).await);
        assert_eq!(registry.list().await.count(), 1);
    }

    #[tokio::test]
    async fn list_under_returns_only_descendants() {
        let registry = PathRegistry::from_definitions([
            job("team/build"),
            job("team/ops/deploy"),
            job("teamwork/other"),
            job("solo"),
        ])
        .unwrap();

        let under: Vec<String> = registry
            .list_under(&path("team"))
            .await
            .iter()
            .map(|d| d.path.to_string())
            .collect();
        assert_eq!(under, vec!["team/build", "team/ops/deploy"]);
    }

    #[tokio::test]
    async fn replace_all_is_atomic_on_conflict() {
        let registry = PathRegistry::from_definitions([job("keep")]).unwrap();
        assert_matches!(
            registry.replace_all([job("a"), job("a")]).await,
            Err(CoreError::Conflict(_))
        );
        assert!(registry.resolve(&path("keep")).await.is_ok());

        assert_eq!(registry.replace_all([job("new")]).await.unwrap(), 1);
        assert_matches!(
            registry.resolve(&path("keep")).await,
            Err(CoreError::NotFound { .. })
        );
    }
}
