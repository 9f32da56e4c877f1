use anyhow::Result;
use ecu_synth_schemas::{ContentHash, DocumentCategory, IdempotencyRecord};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::Database;

/// Already-processed documents per category, keyed by `(digest, ecu_system)`.
///
/// The snapshot is read once at run start and kept in step with every write,
/// so checks during a run never touch the store.
pub struct IdempotencyLedger {
    db: Arc<Mutex<Database>>,
    snapshot: HashMap<DocumentCategory, HashSet<(String, String)>>,
}

impl IdempotencyLedger {
    pub async fn load(db: Arc<Mutex<Database>>) -> Result<Self> {
        let mut snapshot: HashMap<DocumentCategory, HashSet<(String, String)>> = HashMap::new();
        {
            let store = db.lock().await;
            for category in DocumentCategory::all() {
                let keys = store
                    .ledger_records(category)?
                    .into_iter()
                    .map(|record| (record.content_hash.0, record.ecu_system))
                    .collect();
                snapshot.insert(category, keys);
            }
        }

        debug!(
            "Ledger loaded with {} record(s)",
            snapshot.values().map(HashSet::len).sum::<usize>()
        );
        Ok(Self { db, snapshot })
    }

    pub fn is_processed(&self, category: DocumentCategory, hash: &ContentHash, ecu_system: &str) -> bool {
        self.snapshot
            .get(&category)
            .map_or(false, |keys| keys.contains(&(hash.0.clone(), ecu_system.to_string())))
    }

    /// Record a document. Call only after its entity writes have succeeded.
    pub async fn record(&mut self, category: DocumentCategory, record: IdempotencyRecord) -> Result<()> {
        self.db.lock().await.insert_ledger_record(category, &record)?;
        info!("Recorded {} {} in the ledger", category.as_str(), record.filename);
        self.snapshot
            .entry(category)
            .or_default()
            .insert((record.content_hash.0, record.ecu_system));
        Ok(())
    }

    /// Forget every `category` document of `ecu_system`.
    pub async fn invalidate(&mut self, category: DocumentCategory, ecu_system: &str) -> Result<usize> {
        let removed = self.db.lock().await.delete_ledger_records(category, ecu_system)?;
        if let Some(keys) = self.snapshot.get_mut(&category) {
            keys.retain(|(_, ecu)| ecu != ecu_system);
        }
        if removed > 0 {
            info!("Invalidated {} {} ledger record(s) for {}", removed, category.as_str(), ecu_system);
        }
        Ok(removed)
    }
}
