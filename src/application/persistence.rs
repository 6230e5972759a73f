//! Conversation turn storage. Persistence is best-effort by contract: the
//! bridge reports a failed save to the caller but never fails the stream
//! over it.

use crate::domain::ConversationTurn;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to persist turn for chat '{chat_id}': {message}")]
    SaveFailed { chat_id: String, message: String },
}

#[async_trait]
pub trait TurnStore: Send + Sync {
    async fn save(&self, turn: ConversationTurn) -> Result<(), StorageError>;
}

/// In-process store backing single-node deployments and tests.
#[derive(Default)]
pub struct MemoryTurnStore {
    turns: Mutex<Vec<ConversationTurn>>,
    saves: AtomicUsize,
}

impl MemoryTurnStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn turns(&self) -> Vec<ConversationTurn> {
        self.turns.lock().expect("store lock poisoned").clone()
    }
}

#[async_trait]
impl TurnStore for MemoryTurnStore {
    async fn save(&self, turn: ConversationTurn) -> Result<(), StorageError> {
        self.turns.lock().expect("store lock poisoned").push(turn);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
