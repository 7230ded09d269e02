//! Common type definitions used throughout the runtime

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::error::{EngineError, Result};

/// One event on a generation stream.
///
/// A stream carries zero or more `Token` events followed by exactly one
/// terminal event, either `Error` or `Complete`, never both.
#[derive(Debug)]
pub enum GenerationEvent {
    /// A decoded text fragment for one sampled token.
    Token {
        /// The sampled token id.
        id: u32,
        /// The decoded text fragment, in generation order.
        text: String,
    },
    /// Terminal: the generation failed.
    Error(EngineError),
    /// Terminal: the generation reached a stop condition.
    Complete {
        /// Number of tokens generated, including any unemitted stop token.
        generated: usize,
    },
}

/// Handle for consuming a generation as it runs.
#[derive(Debug)]
pub struct GenerationStream {
    receiver: mpsc::UnboundedReceiver<GenerationEvent>,
}

impl GenerationStream {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<GenerationEvent>) -> Self {
        Self { receiver }
    }

    /// Receive the next event, or `None` once the stream is exhausted.
    pub async fn recv(&mut self) -> Option<GenerationEvent> {
        self.receiver.recv().await
    }

    /// Drain the stream and concatenate all token fragments.
    pub async fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(event) = self.recv().await {
            match event {
                GenerationEvent::Token { text: fragment, .. } => text.push_str(&fragment),
                GenerationEvent::Error(e) => return Err(e),
                GenerationEvent::Complete { .. } => break,
            }
        }
        Ok(text)
    }
}

impl Stream for GenerationStream {
    type Item = GenerationEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
