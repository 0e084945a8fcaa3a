use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::errors::UpstreamError;
use crate::messages::Turn;
use crate::stream::StreamEvent;

pub type FragmentStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Client for an upstream completion API.
///
/// The one-shot and streaming response shapes are separate operations.
/// Both receive the full ordered history; the implementation prepends its
/// own system instruction.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn complete(&self, turns: &[Turn]) -> Result<String, UpstreamError>;

    async fn stream(&self, turns: &[Turn]) -> Result<FragmentStream, UpstreamError>;
}
