/// Sliding-window chunker for KB sources.
///
/// Windows target `TARGET_CHUNK_CHARS` with `CHUNK_OVERLAP_CHARS` of
/// lookback, snapping the cut to the last sentence end in the back half of
/// the window when one exists. Emitted chunks are never longer than the
/// target; trailing chunks are never shorter than `MIN_CHUNK_CHARS` except
/// when the whole text is shorter than that.
pub const TARGET_CHUNK_CHARS: usize = 800;
pub const CHUNK_OVERLAP_CHARS: usize = 200;
pub const MIN_CHUNK_CHARS: usize = 100;

/// Characters that end a sentence for boundary snapping.
fn is_sentence_end(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '\n')
}

pub fn split_into_chunks(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.trim().chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    if chars.len() <= TARGET_CHUNK_CHARS {
        return vec![chars.iter().collect::<String>().trim().to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let remaining = chars.len() - start;
        if remaining <= TARGET_CHUNK_CHARS {
            let tail: String = chars[start..].iter().collect();
            let tail = tail.trim();
            if !tail.is_empty() {
                chunks.push(tail.to_string());
            }
            break;
        }

        let window_end = start + TARGET_CHUNK_CHARS;
        // Snap back to a sentence end, but only within the back half of the
        // window so chunks stay comfortably above the minimum.
        let half = start + TARGET_CHUNK_CHARS / 2;
        let cut = (half..window_end)
            .rev()
            .find(|&i| is_sentence_end(chars[i]))
            .map_or(window_end, |i| i + 1);

        let chunk: String = chars[start..cut].iter().collect();
        let chunk = chunk.trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        start = cut.saturating_sub(CHUNK_OVERLAP_CHARS);
    }

    chunks
}
