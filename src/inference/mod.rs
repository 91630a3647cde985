pub mod device;
pub mod dialogue;
pub mod loader;
pub mod pool;
pub mod sampling;

use crate::config::GenerationParams;

pub use dialogue::DialogueService;

/// The opaque text-generation capability the HTTP layer talks to.
///
/// Implementations are synchronous and may block for the length of a whole
/// generation; callers run them on tokio's blocking pool.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, text: &str, params: &GenerationParams) -> anyhow::Result<String>;

    fn model_id(&self) -> &str;
}
