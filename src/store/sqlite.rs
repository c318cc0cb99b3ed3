//! SQLite-backed recipe store

use std::path::Path;

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use super::{RecipeContext, RecipeStore, RecipeVersion};
use crate::{Error, Result};

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Current schema version
const SCHEMA_VERSION: i32 = 1;

/// Read-only recipe lookups over a connection pool
#[derive(Clone)]
pub struct SqliteRecipeStore {
    pool: DbPool,
}

impl SqliteRecipeStore {
    /// Open (and create if missing) a recipe database
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened or initialized
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| Error::Database(e.to_string()))?;
        Self::from_pool(pool)
    }

    /// Open an in-memory database (for testing)
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be initialized
    pub fn open_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| Error::Database(e.to_string()))?;
        Self::from_pool(pool)
    }

    fn from_pool(pool: DbPool) -> Result<Self> {
        let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
        init_schema(&conn)?;
        tracing::debug!(version = SCHEMA_VERSION, "recipe store initialized");
        Ok(Self { pool })
    }

    /// Underlying pool, for tooling that seeds recipes
    #[must_use]
    pub const fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Run a query on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
            f(&conn)
        })
        .await
        .map_err(|e| Error::Database(format!("query task failed: {e}")))?
    }
}

#[async_trait]
impl RecipeStore for SqliteRecipeStore {
    async fn get_recipe(&self, id: Uuid) -> Result<Option<RecipeContext>> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT title, ingredients_json, steps_json FROM recipes WHERE id = ?1",
                    [id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?;

            row.map(|(title, ingredients, steps)| build_context(id, title, &ingredients, &steps))
                .transpose()
        })
        .await
    }

    async fn get_recipe_version(&self, id: Uuid) -> Result<Option<RecipeVersion>> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT recipe_id, title, ingredients_json, steps_json
                     FROM recipe_versions WHERE id = ?1",
                    [id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?;

            let Some((parent, title, ingredients, steps)) = row else {
                return Ok(None);
            };
            let recipe_id = Uuid::parse_str(&parent)
                .map_err(|e| Error::Database(format!("bad recipe_id on version {id}: {e}")))?;

            Ok(Some(RecipeVersion {
                version_id: id,
                recipe_id,
                context: build_context(recipe_id, title, &ingredients, &steps)?,
            }))
        })
        .await
    }
}

fn build_context(
    recipe_id: Uuid,
    title: String,
    ingredients_json: &str,
    steps_json: &str,
) -> Result<RecipeContext> {
    Ok(RecipeContext {
        recipe_id,
        title,
        ingredients: serde_json::from_str(ingredients_json)?,
        steps: serde_json::from_str(steps_json)?,
    })
}

fn init_schema(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS recipes (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                ingredients_json TEXT NOT NULL DEFAULT '[]',
                steps_json TEXT NOT NULL DEFAULT '[]'
            );
            CREATE TABLE IF NOT EXISTS recipe_versions (
                id TEXT PRIMARY KEY,
                recipe_id TEXT NOT NULL,
                title TEXT NOT NULL,
                ingredients_json TEXT NOT NULL DEFAULT '[]',
                steps_json TEXT NOT NULL DEFAULT '[]'
            );
            CREATE INDEX IF NOT EXISTS idx_recipe_versions_recipe ON recipe_versions(recipe_id);
            PRAGMA user_version = 1;",
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(store: &SqliteRecipeStore, recipe_id: Uuid, version_id: Uuid) {
        let conn = store.pool().get().unwrap();
        conn.execute(
            "INSERT INTO recipes (id, title, ingredients_json, steps_json) VALUES (?1, ?2, ?3, ?4)",
            [
                recipe_id.to_string(),
                "Risotto".to_string(),
                r#"["arborio rice","stock","parmesan"]"#.to_string(),
                r#"["toast the rice","add stock slowly"]"#.to_string(),
            ],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO recipe_versions (id, recipe_id, title, ingredients_json, steps_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            [
                version_id.to_string(),
                recipe_id.to_string(),
                "Mushroom Risotto".to_string(),
                r#"["arborio rice","porcini"]"#.to_string(),
                "[]".to_string(),
            ],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn reads_recipes_and_versions() {
        let store = SqliteRecipeStore::open_memory().unwrap();
        let recipe_id = Uuid::new_v4();
        let version_id = Uuid::new_v4();
        seed(&store, recipe_id, version_id);

        let recipe = store.get_recipe(recipe_id).await.unwrap().unwrap();
        assert_eq!(recipe.title, "Risotto");
        assert_eq!(recipe.ingredients.len(), 3);
        assert_eq!(recipe.steps[1], "add stock slowly");

        let version = store.get_recipe_version(version_id).await.unwrap().unwrap();
        assert_eq!(version.recipe_id, recipe_id);
        assert_eq!(version.context.title, "Mushroom Risotto");
    }

    #[tokio::test]
    async fn missing_rows_are_none() {
        let store = SqliteRecipeStore::open_memory().unwrap();
        assert!(store.get_recipe(Uuid::new_v4()).await.unwrap().is_none());
        assert!(store.get_recipe_version(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_database_persists_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recipes.db");
        let recipe_id = Uuid::new_v4();
        {
            let store = SqliteRecipeStore::open(&path).unwrap();
            seed(&store, recipe_id, Uuid::new_v4());
        }
        let store = SqliteRecipeStore::open(&path).unwrap();
        assert!(store.get_recipe(recipe_id).await.unwrap().is_some());
    }
}
