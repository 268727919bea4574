//! Work queue
//!
//! At-least-once delivery of work items. Enqueue suppresses duplicates
//! against the pending set; claim hands each item to exactly one worker at a
//! time. Handlers stay idempotent because a claimed item that is released
//! (or whose worker crashes) is delivered again.

use async_trait::async_trait;
use chrono::Utc;
use pennant_core::workitem::{WorkItem, WorkItemKind};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;

/// Shared queue the engine both consumes and produces on
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue a work item. Returns `false` when an identical pending item
    /// already exists and the enqueue was suppressed.
    async fn enqueue(
        &self,
        kind: WorkItemKind,
        subject_id: Uuid,
        workspace_id: Uuid,
    ) -> Result<bool>;

    /// Claim up to `batch` pending items for exclusive processing.
    async fn claim(&self, batch: i64) -> Result<Vec<WorkItem>>;

    /// Acknowledge a processed item.
    async fn complete(&self, id: Uuid) -> Result<()>;

    /// Return a claimed item to the pending set after a transient failure.
    async fn release(&self, id: Uuid) -> Result<()>;
}

// =============================================================================
// Postgres implementation
// =============================================================================

pub struct PgWorkQueue {
    pool: PgPool,
}

impl PgWorkQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkQueue for PgWorkQueue {
    async fn enqueue(
        &self,
        kind: WorkItemKind,
        subject_id: Uuid,
        workspace_id: Uuid,
    ) -> Result<bool> {
        // The partial unique index on pending (kind, subject) makes this the
        // enqueue-time duplicate suppression.
        let result = sqlx::query(
            r#"
            INSERT INTO work_items (id, kind, subject_id, workspace_id, status, enqueued_at)
            VALUES ($1, $2, $3, $4, 'pending', now())
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(kind.as_str())
        .bind(subject_id)
        .bind(workspace_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim(&self, batch: i64) -> Result<Vec<WorkItem>> {
        let rows = sqlx::query_as::<_, WorkItemRow>(
            r#"
            UPDATE work_items
            SET status = 'claimed', claimed_at = now()
            WHERE id IN (
                SELECT id FROM work_items
                WHERE status = 'pending'
                ORDER BY enqueued_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, kind, subject_id, workspace_id, enqueued_at
            "#,
        )
        .bind(batch)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(|r| r.into_item()).collect())
    }

    async fn complete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM work_items WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn release(&self, id: Uuid) -> Result<()> {
        // Re-enqueue at the back; the dedup index does not apply to claimed
        // rows, so flipping the status back can race a duplicate pending
        // insert. Losing that race just drops this copy.
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'pending', claimed_at = NULL, enqueued_at = now()
            WHERE id = $1
              AND NOT EXISTS (
                  SELECT 1 FROM work_items w2
                  WHERE w2.kind = work_items.kind
                    AND w2.subject_id = work_items.subject_id
                    AND w2.status = 'pending'
                    AND w2.id <> work_items.id
              )
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            sqlx::query("DELETE FROM work_items WHERE id = $1 AND status = 'claimed'")
                .bind(id)
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: Uuid,
    kind: String,
    subject_id: Uuid,
    workspace_id: Uuid,
    enqueued_at: chrono::DateTime<chrono::Utc>,
}

impl WorkItemRow {
    fn into_item(self) -> Option<WorkItem> {
        Some(WorkItem {
            id: self.id,
            kind: WorkItemKind::parse(&self.kind)?,
            subject_id: self.subject_id,
            workspace_id: self.workspace_id,
            enqueued_at: self.enqueued_at,
        })
    }
}

// =============================================================================
// In-memory implementation
// =============================================================================

/// Process-local queue with the same dedup and claim semantics.
///
/// Used by tests and embedded single-process runs.
#[derive(Default)]
pub struct MemoryWorkQueue {
    inner: tokio::sync::Mutex<MemoryQueueState>,
}

#[derive(Default)]
struct MemoryQueueState {
    pending: std::collections::VecDeque<WorkItem>,
    claimed: std::collections::HashMap<Uuid, WorkItem>,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending items, for assertions and drain loops.
    pub async fn pending_len(&self) -> usize {
        self.inner.lock().await.pending.len()
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(
        &self,
        kind: WorkItemKind,
        subject_id: Uuid,
        workspace_id: Uuid,
    ) -> Result<bool> {
        let mut state = self.inner.lock().await;
        let duplicate = state
            .pending
            .iter()
            .any(|item| item.kind == kind && item.subject_id == subject_id);
        if duplicate {
            return Ok(false);
        }

        state.pending.push_back(WorkItem {
            id: Uuid::new_v4(),
            kind,
            subject_id,
            workspace_id,
            enqueued_at: Utc::now(),
        });
        Ok(true)
    }

    async fn claim(&self, batch: i64) -> Result<Vec<WorkItem>> {
        let mut state = self.inner.lock().await;
        let mut items = Vec::new();
        for _ in 0..batch {
            let Some(item) = state.pending.pop_front() else {
                break;
            };
            state.claimed.insert(item.id, item.clone());
            items.push(item);
        }
        Ok(items)
    }

    async fn complete(&self, id: Uuid) -> Result<()> {
        self.inner.lock().await.claimed.remove(&id);
        Ok(())
    }

    async fn release(&self, id: Uuid) -> Result<()> {
        let mut state = self.inner.lock().await;
        if let Some(item) = state.claimed.remove(&id) {
            let duplicate = state
                .pending
                .iter()
                .any(|p| p.kind == item.kind && p.subject_id == item.subject_id);
            if !duplicate {
                state.pending.push_back(item);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_suppresses_pending_duplicates() {
        let queue = MemoryWorkQueue::new();
        let subject = Uuid::new_v4();
        let ws = Uuid::new_v4();

        assert!(
            queue
                .enqueue(WorkItemKind::EvaluateReleaseTarget, subject, ws)
                .await
                .unwrap()
        );
        assert!(
            !queue
                .enqueue(WorkItemKind::EvaluateReleaseTarget, subject, ws)
                .await
                .unwrap()
        );
        // A different kind for the same subject is not a duplicate.
        assert!(
            queue
                .enqueue(WorkItemKind::ResourceChanged, subject, ws)
                .await
                .unwrap()
        );
        assert_eq!(queue.pending_len().await, 2);
    }

    #[tokio::test]
    async fn test_claimed_item_can_be_enqueued_again() {
        let queue = MemoryWorkQueue::new();
        let subject = Uuid::new_v4();
        let ws = Uuid::new_v4();

        queue
            .enqueue(WorkItemKind::EvaluateReleaseTarget, subject, ws)
            .await
            .unwrap();
        let claimed = queue.claim(10).await.unwrap();
        assert_eq!(claimed.len(), 1);

        // Dedup is against the pending set only; at-least-once delivery.
        assert!(
            queue
                .enqueue(WorkItemKind::EvaluateReleaseTarget, subject, ws)
                .await
                .unwrap()
        );

        queue.complete(claimed[0].id).await.unwrap();
        assert_eq!(queue.pending_len().await, 1);
    }

    #[tokio::test]
    async fn test_release_requeues_without_duplicating() {
        let queue = MemoryWorkQueue::new();
        let subject = Uuid::new_v4();
        let ws = Uuid::new_v4();

        queue
            .enqueue(WorkItemKind::PolicyChanged, subject, ws)
            .await
            .unwrap();
        let claimed = queue.claim(1).await.unwrap();

        queue
            .enqueue(WorkItemKind::PolicyChanged, subject, ws)
            .await
            .unwrap();
        queue.release(claimed[0].id).await.unwrap();

        // The released copy was dropped in favour of the fresher pending one.
        assert_eq!(queue.pending_len().await, 1);
    }

    #[tokio::test]
    async fn test_claim_batches_in_fifo_order() {
        let queue = MemoryWorkQueue::new();
        let ws = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        queue
            .enqueue(WorkItemKind::ResourceChanged, first, ws)
            .await
            .unwrap();
        queue
            .enqueue(WorkItemKind::ResourceChanged, second, ws)
            .await
            .unwrap();

        let claimed = queue.claim(1).await.unwrap();
        assert_eq!(claimed[0].subject_id, first);
        let claimed = queue.claim(1).await.unwrap();
        assert_eq!(claimed[0].subject_id, second);
    }
}
