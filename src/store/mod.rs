//! Recipe store collaborator
//!
//! The relay only reads recipes to build the conversational context for a
//! session. Storage and versioning live elsewhere.

mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::Result;

pub use sqlite::{DbPool, SqliteRecipeStore};

/// Recipe data the assistant needs during a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeContext {
    pub recipe_id: Uuid,
    pub title: String,
    pub ingredients: Vec<String>,
    pub steps: Vec<String>,
}

/// A saved variant of a recipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeVersion {
    pub version_id: Uuid,
    /// Parent recipe this version belongs to
    pub recipe_id: Uuid,
    pub context: RecipeContext,
}

/// Read-only access to recipes
#[async_trait]
pub trait RecipeStore: Send + Sync {
    /// Look up a recipe by ID
    async fn get_recipe(&self, id: Uuid) -> Result<Option<RecipeContext>>;

    /// Look up a recipe version by ID
    async fn get_recipe_version(&self, id: Uuid) -> Result<Option<RecipeVersion>>;
}

/// In-memory store for tests and local demos
#[derive(Debug, Default, Clone)]
pub struct MemoryRecipeStore {
    recipes: HashMap<Uuid, RecipeContext>,
    versions: HashMap<Uuid, RecipeVersion>,
}

impl MemoryRecipeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a recipe
    #[must_use]
    pub fn with_recipe(mut self, recipe: RecipeContext) -> Self {
        self.recipes.insert(recipe.recipe_id, recipe);
        self
    }

    /// Add a recipe version
    #[must_use]
    pub fn with_version(mut self, version: RecipeVersion) -> Self {
        self.versions.insert(version.version_id, version);
        self
    }
}

#[async_trait]
impl RecipeStore for MemoryRecipeStore {
    async fn get_recipe(&self, id: Uuid) -> Result<Option<RecipeContext>> {
        Ok(self.recipes.get(&id).cloned())
    }

    async fn get_recipe_version(&self, id: Uuid) -> Result<Option<RecipeVersion>> {
        Ok(self.versions.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_lookups() {
        let recipe_id = Uuid::new_v4();
        let version_id = Uuid::new_v4();
        let recipe = RecipeContext {
            recipe_id,
            title: "Shakshuka".to_string(),
            ingredients: vec!["eggs".to_string()],
            steps: vec![],
        };
        let store = MemoryRecipeStore::new()
            .with_recipe(recipe.clone())
            .with_version(RecipeVersion {
                version_id,
                recipe_id,
                context: RecipeContext {
                    title: "Green Shakshuka".to_string(),
                    ..recipe.clone()
                },
            });

        assert_eq!(store.get_recipe(recipe_id).await.unwrap(), Some(recipe));
        assert!(store.get_recipe(Uuid::new_v4()).await.unwrap().is_none());

        let version = store.get_recipe_version(version_id).await.unwrap().unwrap();
        assert_eq!(version.recipe_id, recipe_id);
        assert_eq!(version.context.title, "Green Shakshuka");
    }
}
