//! Process-wide incident table, replaced wholesale on every ingest.

use std::sync::Arc;

use insera_core::{merge, Table};
use tokio::sync::{Mutex, RwLock};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub added: usize,
    pub skipped: usize,
    pub total: usize,
}

/// Readers clone the current `Arc<Table>` and never observe a half-merged
/// table; writers build the merged table off to the side and swap the pointer.
#[derive(Debug)]
pub struct TableStore {
    current: RwLock<Arc<Table>>,
    writer: Mutex<()>,
}

impl TableStore {
    pub fn new(table: Table) -> Self {
        Self {
            current: RwLock::new(Arc::new(table)),
            writer: Mutex::new(()),
        }
    }

    pub async fn snapshot(&self) -> Arc<Table> {
        self.current.read().await.clone()
    }

    /// Merges `incoming` after the current table, first occurrence wins.
    pub async fn ingest(&self, incoming: Table) -> IngestSummary {
        let _writer = self.writer.lock().await;
        let base = self.snapshot().await;
        let outcome = merge(&base, &incoming);
        let summary = IngestSummary {
            added: outcome.added,
            skipped: outcome.skipped,
            total: outcome.table.len(),
        };
        *self.current.write().await = Arc::new(outcome.table);
        info!(
            added = summary.added,
            skipped = summary.skipped,
            total = summary.total,
            "table replaced"
        );
        summary
    }
}
