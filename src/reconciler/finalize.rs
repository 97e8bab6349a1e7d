use log::{ info, warn };
use std::time::Duration;

use super::Finalization;
use crate::llm::image::{ decode_data_url, ImageClient, DEFAULT_IMAGE_MIME };
use crate::models::chat::{ GroundingChunk, Message, Part, StreamState };

/// Single attempt at the out-of-band image call, bounded by `limit`.
/// Failures and timeouts are logged and yield `None`.
pub async fn generate_image_part(
    client: &dyn ImageClient,
    prompt: &str,
    limit: Duration
) -> Option<Part> {
    info!("Generating image for directive prompt ({} chars)", prompt.chars().count());
    let data_url = match tokio::time::timeout(limit, client.generate(prompt)).await {
        Ok(Ok(url)) => url,
        Ok(Err(e)) => {
            log_dropped_image("image generation", &e);
            return None;
        }
        Err(e) => {
            log_dropped_image("image generation", &e);
            return None;
        }
    };
    match decode_data_url(&data_url, DEFAULT_IMAGE_MIME) {
        Ok(inline_data) => Some(Part::Inline { inline_data }),
        Err(e) => {
            log_dropped_image("image decoding", &e);
            None
        }
    }
}

fn log_dropped_image(stage: &str, e: &dyn std::error::Error) {
    warn!("Dropping generated image after failed {}: {}", stage, e);
}

/// Writes the finished answer into the in-flight message.
pub fn apply_finalization(
    message: &mut Message,
    finalization: Finalization,
    image: Option<Part>,
    grounding_chunks: Vec<GroundingChunk>
) {
    let mut parts = vec![Part::text(finalization.text)];
    parts.extend(image);
    message.parts = parts;
    message.action = finalization.action;
    message.grounding_chunks = if grounding_chunks.is_empty() { None } else { Some(grounding_chunks) };
    message.advance_stream_state(StreamState::Done);
}

/// Replaces whatever was streamed with a single error text.
pub fn apply_failure(message: &mut Message, error_text: &str) {
    message.parts = vec![Part::text(error_text)];
    message.advance_stream_state(StreamState::Done);
}
