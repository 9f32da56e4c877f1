use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::embedding::cosine_similarity;

pub type Payload = HashMap<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: Payload,
}

/// Payload filter: every `must` condition holds and no `must_not` one does.
///
/// A condition on a list-valued field holds when any element matches.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    must: Vec<(String, Value)>,
    must_not: Vec<(String, Vec<Value>)>,
}

fn field_matches(field: Option<&Value>, expected: &Value) -> bool {
    match field {
        Some(Value::Array(items)) => items.iter().any(|item| item == expected),
        Some(value) => value == expected,
        None => false,
    }
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn must(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.must.push((key.to_string(), value.into()));
        self
    }

    pub fn must_not_in<I, S>(mut self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Value>,
    {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        if !values.is_empty() {
            self.must_not.push((key.to_string(), values));
        }
        self
    }

    pub fn matches(&self, payload: &Payload) -> bool {
        let required = self
            .must
            .iter()
            .all(|(key, value)| field_matches(payload.get(key), value));
        let excluded = self.must_not.iter().any(|(key, values)| {
            values
                .iter()
                .any(|value| field_matches(payload.get(key), value))
        });
        required && !excluded
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScrollPage {
    pub points: Vec<VectorPoint>,
    /// Offset of the next page, `None` when exhausted.
    pub next_offset: Option<usize>,
}

/// Vector storage with payload filters, partitioned into named collections.
pub trait VectorStore: Send + Sync {
    fn upsert(&self, collection: &str, point: VectorPoint) -> Result<()>;
    fn search(
        &self,
        collection: &str,
        query: &[f32],
        filter: &Filter,
        score_threshold: f32,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>>;
    fn delete(&self, collection: &str, filter: &Filter) -> Result<usize>;
    fn scroll(&self, collection: &str, filter: &Filter, offset: usize, limit: usize) -> Result<ScrollPage>;
    /// Merge `payload` keys into an existing point; false when the id is unknown.
    fn set_payload(&self, collection: &str, id: &str, payload: Payload) -> Result<bool>;

    /// Every point matching `filter`, following scroll pages to the end.
    fn scroll_all(&self, collection: &str, filter: &Filter) -> Result<Vec<VectorPoint>> {
        let mut points = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.scroll(collection, filter, offset, 100)?;
            points.extend(page.points);
            match page.next_offset {
                Some(next) => offset = next,
                None => break,
            }
        }
        Ok(points)
    }
}

/// SQLite-backed store; similarity is computed in process.
pub struct SqliteVectorStore {
    conn: Mutex<Connection>,
}

impl SqliteVectorStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open vector store")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS vector_points (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                vector TEXT NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            );
            "#,
        )
        .context("Failed to initialize vector store schema")?;
        info!("Vector store initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Vector store connection lock poisoned"))
    }

    fn load(&self, collection: &str, filter: &Filter) -> Result<Vec<VectorPoint>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, vector, payload FROM vector_points WHERE collection = ?1 ORDER BY id",
        )?;

        let rows = stmt
            .query_map(params![collection], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut points = Vec::with_capacity(rows.len());
        for (id, vector_json, payload_json) in rows {
            let payload: Payload = serde_json::from_str(&payload_json)
                .with_context(|| format!("Corrupt payload for vector point {}", id))?;
            if !filter.matches(&payload) {
                continue;
            }
            let vector: Vec<f32> = serde_json::from_str(&vector_json)
                .with_context(|| format!("Corrupt vector for vector point {}", id))?;
            points.push(VectorPoint {
                id,
                vector,
                payload,
            });
        }
        Ok(points)
    }
}

impl VectorStore for SqliteVectorStore {
    fn upsert(&self, collection: &str, point: VectorPoint) -> Result<()> {
        let vector = serde_json::to_string(&point.vector)?;
        let payload = serde_json::to_string(&point.payload)?;
        self.conn()?.execute(
            "INSERT INTO vector_points (collection, id, vector, payload)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(collection, id) DO UPDATE SET
                vector = excluded.vector,
                payload = excluded.payload",
            params![collection, point.id, vector, payload],
        )?;
        Ok(())
    }

    fn search(
        &self,
        collection: &str,
        query: &[f32],
        filter: &Filter,
        score_threshold: f32,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let mut scored: Vec<ScoredPoint> = self
            .load(collection, filter)?
            .into_iter()
            .map(|point| ScoredPoint {
                score: cosine_similarity(query, &point.vector),
                id: point.id,
                payload: point.payload,
            })
            .filter(|point| point.score >= score_threshold)
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);

        debug!("Vector search in {} found {} results", collection, scored.len());
        Ok(scored)
    }

    fn delete(&self, collection: &str, filter: &Filter) -> Result<usize> {
        let ids: Vec<String> = self
            .load(collection, filter)?
            .into_iter()
            .map(|point| point.id)
            .collect();

        let conn = self.conn()?;
        let mut deleted = 0;
        for id in &ids {
            deleted += conn.execute(
                "DELETE FROM vector_points WHERE collection = ?1 AND id = ?2",
                params![collection, id],
            )?;
        }
        Ok(deleted)
    }

    fn scroll(&self, collection: &str, filter: &Filter, offset: usize, limit: usize) -> Result<ScrollPage> {
        let matching = self.load(collection, filter)?;
        let total = matching.len();
        let points: Vec<VectorPoint> = matching.into_iter().skip(offset).take(limit).collect();
        let end = offset + points.len();
        Ok(ScrollPage {
            next_offset: (end < total && !points.is_empty()).then_some(end),
            points,
        })
    }

    fn set_payload(&self, collection: &str, id: &str, payload: Payload) -> Result<bool> {
        let conn = self.conn()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT payload FROM vector_points WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(existing) = existing else {
            return Ok(false);
        };
        let mut merged: Payload = serde_json::from_str(&existing)
            .with_context(|| format!("Corrupt payload for vector point {}", id))?;
        merged.extend(payload);

        conn.execute(
            "UPDATE vector_points SET payload = ?1 WHERE collection = ?2 AND id = ?3",
            params![serde_json::to_string(&merged)?, collection, id],
        )?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: &str, vector: Vec<f32>, pairs: &[(&str, &str)]) -> VectorPoint {
        VectorPoint {
            id: id.to_string(),
            vector,
            payload: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), Value::from(*v)))
                .collect(),
        }
    }

    fn store_with_components() -> SqliteVectorStore {
        let store = SqliteVectorStore::in_memory().unwrap();
        store
            .upsert("components", point("a", vec![1.0, 0.0], &[("name", "M59"), ("ecu_system", "TPM2")]))
            .unwrap();
        store
            .upsert("components", point("b", vec![0.9, 0.1], &[("name", "E186"), ("ecu_system", "TPM2")]))
            .unwrap();
        store
            .upsert("components", point("c", vec![1.0, 0.0], &[("name", "X1"), ("ecu_system", "APS2")]))
            .unwrap();
        store
    }

    #[test]
    fn test_search_respects_filter_threshold_and_exclusions() {
        let store = store_with_components();
        let filter = Filter::new().must("ecu_system", "TPM2");

        let results = store.search("components", &[1.0, 0.0], &filter, 0.5, 3).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].payload["name"], "M59");

        let excluded = filter.clone().must_not_in("name", ["M59"]);
        let results = store.search("components", &[1.0, 0.0], &excluded, 0.5, 3).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].payload["name"], "E186");

        let results = store.search("components", &[0.0, 1.0], &filter, 0.5, 3).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_upsert_replaces_and_delete_by_filter() {
        let store = store_with_components();
        store
            .upsert("components", point("a", vec![0.0, 1.0], &[("name", "M59"), ("ecu_system", "TPM2")]))
            .unwrap();
        let results = store
            .search("components", &[0.0, 1.0], &Filter::new(), 0.99, 10)
            .unwrap();
        assert_eq!(results.len(), 1);

        let deleted = store
            .delete("components", &Filter::new().must("name", "M59").must("ecu_system", "TPM2"))
            .unwrap();
        assert_eq!(deleted, 1);
        let page = store.scroll("components", &Filter::new(), 0, 10).unwrap();
        assert_eq!(page.points.len(), 2);
    }

    #[test]
    fn test_list_fields_match_any_element() {
        let store = SqliteVectorStore::in_memory().unwrap();
        let mut payload = Payload::new();
        payload.insert("name".to_string(), Value::from("Heating"));
        payload.insert("uf_numbers".to_string(), serde_json::json!([12, 40]));
        store
            .upsert(
                "function_groups",
                VectorPoint {
                    id: "g1".to_string(),
                    vector: vec![1.0],
                    payload,
                },
            )
            .unwrap();

        let hits = store
            .scroll_all("function_groups", &Filter::new().must("uf_numbers", 40))
            .unwrap();
        assert_eq!(hits.len(), 1);
        let misses = store
            .scroll_all("function_groups", &Filter::new().must("uf_numbers", 41))
            .unwrap();
        assert!(misses.is_empty());

        let mut update = Payload::new();
        update.insert("pending".to_string(), Value::Bool(true));
        assert!(store.set_payload("function_groups", "g1", update.clone()).unwrap());
        assert!(!store.set_payload("function_groups", "missing", update).unwrap());
        let pending = store
            .scroll_all("function_groups", &Filter::new().must("pending", true))
            .unwrap();
        assert_eq!(pending[0].payload["name"], "Heating");
    }

    #[test]
    fn test_scroll_pages() {
        let store = store_with_components();
        let first = store.scroll("components", &Filter::new(), 0, 2).unwrap();
        assert_eq!(first.points.len(), 2);
        assert_eq!(first.next_offset, Some(2));

        let second = store.scroll("components", &Filter::new(), 2, 2).unwrap();
        assert_eq!(second.points.len(), 1);
        assert_eq!(second.next_offset, None);
    }

    #[test]
    fn test_points_survive_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("vectors.db");
        {
            let store = SqliteVectorStore::new(&path).unwrap();
            store
                .upsert("components", point("a", vec![1.0, 0.0], &[("name", "M59"), ("ecu_system", "TPM2")]))
                .unwrap();
        }

        let reopened = SqliteVectorStore::new(&path).unwrap();
        let points = reopened.scroll_all("components", &Filter::new()).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].vector, vec![1.0, 0.0]);
        assert_eq!(points[0].payload["name"], "M59");
    }
}
