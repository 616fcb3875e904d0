use std::sync::Arc;

use tracing::info;

use super::store::StateStore;
use crate::errors::SequenceError;

/// Records consumer acknowledgement of delivered jobs.
///
/// Confirmation is write-once-true and may arrive in any order; it only
/// matters to the watcher of the next index.
#[derive(Clone)]
pub struct ConfirmationGate {
    store: Arc<dyn StateStore>,
}

impl ConfirmationGate {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub async fn confirm(&self, sequence_id: &str, index: usize) -> Result<(), SequenceError> {
        let sequence = self
            .store
            .get_sequence_info(sequence_id)
            .await?
            .ok_or_else(|| SequenceError::SequenceNotFound {
                id: sequence_id.to_string(),
            })?;
        if index >= sequence.len() {
            return Err(SequenceError::InvalidRequest(format!(
                "topic index {} out of range for a sequence of {} topics",
                index,
                sequence.len()
            )));
        }
        self.store.set_confirmed(sequence_id, index).await?;
        info!(sequence_id, index, "job confirmed");
        Ok(())
    }

    pub async fn is_confirmed(&self, sequence_id: &str, index: usize) -> Result<bool, SequenceError> {
        Ok(self.store.is_confirmed(sequence_id, index).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::memory::MemoryStore;
    use std::time::Duration;

    async fn gate_with_sequence(n: usize) -> (ConfirmationGate, Arc<MemoryStore>, String) {
        let store = Arc::new(MemoryStore::new(Duration::from_secs(60)));
        let topics: Vec<String> = (0..n).map(|i| format!("t{}", i)).collect();
        let id = store.create_sequence(&topics, &[]).await.unwrap();
        (ConfirmationGate::new(store.clone()), store, id)
    }

    #[tokio::test]
    async fn test_confirm_twice_is_same_as_once() {
        let (gate, _, id) = gate_with_sequence(3).await;
        gate.confirm(&id, 1).await.unwrap();
        gate.confirm(&id, 1).await.unwrap();
        assert!(gate.is_confirmed(&id, 1).await.unwrap());
        assert!(!gate.is_confirmed(&id, 0).await.unwrap());
        assert!(!gate.is_confirmed(&id, 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_confirm_out_of_order_is_accepted() {
        let (gate, _, id) = gate_with_sequence(3).await;
        gate.confirm(&id, 2).await.unwrap();
        assert!(gate.is_confirmed(&id, 2).await.unwrap());
        assert!(!gate.is_confirmed(&id, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_sequence_is_not_found() {
        let (gate, _, _) = gate_with_sequence(1).await;
        let err = gate.confirm("seq-ffffffffffff", 0).await.unwrap_err();
        assert!(matches!(err, SequenceError::SequenceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_index_past_end_is_invalid() {
        let (gate, _, id) = gate_with_sequence(2).await;
        let err = gate.confirm(&id, 2).await.unwrap_err();
        assert!(matches!(err, SequenceError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_store_outage_surfaces_as_unavailable() {
        let (gate, store, id) = gate_with_sequence(2).await;
        store.set_available(false);
        let err = gate.confirm(&id, 0).await.unwrap_err();
        assert!(matches!(err, SequenceError::StoreUnavailable(_)));
    }
}
