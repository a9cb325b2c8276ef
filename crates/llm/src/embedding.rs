use std::sync::Arc;

use async_trait::async_trait;
use mnemos_common::Result;

/// Text embedding capability. Vectors returned by one client all share
/// `dimension()` entries.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Loads whatever the client needs before its first call. No-op unless
    /// the client has something expensive to set up.
    async fn warmup(&self) -> Result<()> {
        Ok(())
    }

    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;
}

#[async_trait]
impl<T: EmbeddingClient + ?Sized> EmbeddingClient for Arc<T> {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        (**self).embed(text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        (**self).embed_batch(texts).await
    }

    async fn warmup(&self) -> Result<()> {
        (**self).warmup().await
    }

    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }
}
