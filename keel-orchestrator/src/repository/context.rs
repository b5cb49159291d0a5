//! Context store
//!
//! Persistence of execution contexts, keyed by the owning execution.

use async_trait::async_trait;
use keel_core::{ContextOwner, ExecutionContext};

use crate::error::StoreResult;

/// Store trait for execution contexts
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Loads the context of `owner`, or an empty one if none was saved
    async fn get_context(&self, owner: ContextOwner) -> StoreResult<ExecutionContext>;

    /// Persists the context of a newly saved execution
    async fn save_context(&self, owner: ContextOwner, context: &ExecutionContext)
    -> StoreResult<()>;

    /// Overwrites the stored context of `owner`
    async fn update_context(
        &self,
        owner: ContextOwner,
        context: &ExecutionContext,
    ) -> StoreResult<()>;

    /// Persists several contexts
    async fn save_contexts(&self, contexts: &[(ContextOwner, &ExecutionContext)]) -> StoreResult<()> {
        for (owner, context) in contexts {
            self.save_context(*owner, context).await?;
        }
        Ok(())
    }
}
