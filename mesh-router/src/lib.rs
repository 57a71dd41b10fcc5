//! Splits a prompt into chunks and assigns each to its nearest expert.

use mesh_core::{Chunk, EmbedFn, MeshError, Routing};
use mesh_index::ExpertIndex;
use std::sync::Arc;
use tracing::debug;

fn flush_into(current: &mut String, chunks: &mut Vec<String>) {
    if !current.is_empty() {
        chunks.push(std::mem::take(current));
    }
}

/// Splits `prompt` into chunks of at most `max_chunk_length` chars,
/// preferring whitespace boundaries. A single token longer than the cap is
/// split mid-token. An empty prompt yields an empty vector.
pub fn split_into_chunks(prompt: &str, max_chunk_length: usize) -> Vec<String> {
    let max_chunk_length = max_chunk_length.max(1);
    if prompt.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for word in prompt.split_whitespace() {
        if word.chars().count() > max_chunk_length {
            flush_into(&mut current, &mut chunks);
            let mut piece = String::new();
            for ch in word.chars() {
                piece.push(ch);
                if piece.chars().count() == max_chunk_length {
                    chunks.push(std::mem::take(&mut piece));
                }
            }
            current = piece;
            continue;
        }

        let candidate_len = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };

        if candidate_len > max_chunk_length {
            flush_into(&mut current, &mut chunks);
            current.push_str(word);
        } else {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
    }
    flush_into(&mut current, &mut chunks);
    chunks
}

/// Splits a prompt, embeds each chunk, and assigns each chunk to its nearest
/// expert. Deterministic given the same index contents, `EmbedFn`, and
/// prompt; ties are broken by the index, never reordered here.
pub struct ChunkRouter {
    index: Arc<ExpertIndex>,
    embed: Arc<dyn EmbedFn>,
    max_chunk_length: usize,
}

impl ChunkRouter {
    pub fn new(index: Arc<ExpertIndex>, embed: Arc<dyn EmbedFn>, max_chunk_length: usize) -> Self {
        Self {
            index,
            embed,
            max_chunk_length,
        }
    }

    pub async fn route(&self, prompt: &str) -> Result<Vec<Routing>, MeshError> {
        let texts = split_into_chunks(prompt, self.max_chunk_length);
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut routings = Vec::with_capacity(texts.len());
        for (i, text) in texts.into_iter().enumerate() {
            let embedding = self
                .embed
                .embed(&text)
                .await
                .map_err(|e| MeshError::ComputeError(e.to_string()))?;
            let best = self.index.find_best_experts(&embedding, 1);
            let (worker_id, distance) = best.into_iter().next().ok_or(MeshError::NoExperts)?;
            debug!(chunk_index = i, worker_id = %worker_id, distance, "chunk routed");
            routings.push(Routing {
                chunk: Chunk {
                    index: i as u32,
                    text,
                    embedding,
                },
                worker_id,
                distance,
            });
        }
        Ok(routings)
    }
}
