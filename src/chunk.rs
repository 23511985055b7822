//! Chunking strategies: prose and code.
//!
//! The prose chunker aims for 500–1000 tokens per chunk, preferring soft
//! breaks at paragraph and sentence boundaries. The code chunker splits on
//! top-level declarations with a hard line cap. Both are deterministic
//! given identical input, and both report byte spans into the extracted
//! text so chunks of one file cover disjoint ranges.

use crate::models::ChunkKind;

/// Approximate tokens per word for English text.
const TOKENS_PER_WORD: f64 = 1.3;

/// A chunk before persistence: text plus its span in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSpan {
    pub text: String,
    pub kind: ChunkKind,
    pub start_byte: usize,
    pub end_byte: usize,
    pub token_count: usize,
}

pub fn estimate_tokens(text: &str) -> usize {
    (text.split_whitespace().count() as f64 * TOKENS_PER_WORD).round() as usize
}

/// Split prose into chunks of roughly `target_tokens`, never exceeding
/// `max_tokens` except for a single unbreakable word run.
pub fn chunk_prose(text: &str, target_tokens: usize, max_tokens: usize) -> Vec<ChunkSpan> {
    let paragraphs = paragraph_ranges(text);
    if paragraphs.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut cur: Option<(usize, usize, usize)> = None; // (start, end, tokens)

    for &(p_start, p_end) in &paragraphs {
        let p_tokens = estimate_tokens(&text[p_start..p_end]);

        // Oversize paragraph: flush the buffer, then split by sentences.
        if p_tokens > max_tokens {
            if let Some((start, end, _)) = cur.take() {
                chunks.push(make_span(text, start, end, ChunkKind::Prose));
            }
            for (s_start, s_end) in split_range_by_sentences(text, p_start, p_end, target_tokens, max_tokens)
            {
                chunks.push(make_span(text, s_start, s_end, ChunkKind::Prose));
            }
            continue;
        }

        match cur {
            None => cur = Some((p_start, p_end, p_tokens)),
            Some((start, _, tokens)) => {
                if tokens >= target_tokens || tokens + p_tokens > max_tokens {
                    let (s, e, _) = cur.take().unwrap();
                    chunks.push(make_span(text, s, e, ChunkKind::Prose));
                    cur = Some((p_start, p_end, p_tokens));
                } else {
                    cur = Some((start, p_end, tokens + p_tokens));
                }
            }
        }
    }

    if let Some((start, end, _)) = cur {
        chunks.push(make_span(text, start, end, ChunkKind::Prose));
    }

    chunks
}

/// Split code on top-level declarations, capping each chunk at
/// `max_lines`. Falls back to fixed line blocks when no structure is found.
pub fn chunk_code(text: &str, max_lines: usize) -> Vec<ChunkSpan> {
    let lines = line_ranges(text);
    if lines.is_empty() {
        return Vec::new();
    }

    // Top-level declaration boundaries (column zero, known keyword).
    let mut boundaries: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, &(start, end))| is_top_level_decl(&text[start..end]))
        .map(|(i, _)| i)
        .collect();

    if boundaries.is_empty() {
        boundaries = (0..lines.len()).step_by(max_lines.max(1)).collect();
    }
    if boundaries[0] != 0 {
        boundaries.insert(0, 0);
    }

    let mut chunks = Vec::new();
    for (i, &from) in boundaries.iter().enumerate() {
        let to = boundaries.get(i + 1).copied().unwrap_or(lines.len());
        // Hard cap: an oversize element is split into fixed blocks.
        let mut block_start = from;
        while block_start < to {
            let block_end = (block_start + max_lines).min(to);
            let start_byte = lines[block_start].0;
            let end_byte = lines[block_end - 1].1;
            if text[start_byte..end_byte].trim().is_empty() {
                block_start = block_end;
                continue;
            }
            chunks.push(make_span(text, start_byte, end_byte, ChunkKind::Code));
            block_start = block_end;
        }
    }

    chunks
}

fn make_span(text: &str, start: usize, end: usize, kind: ChunkKind) -> ChunkSpan {
    let slice = &text[start..end];
    ChunkSpan {
        text: slice.to_string(),
        kind,
        start_byte: start,
        end_byte: end,
        token_count: estimate_tokens(slice),
    }
}

/// Byte ranges of non-empty paragraphs (separated by blank lines), trimmed.
fn paragraph_ranges(text: &str) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut offset = 0;

    for raw in text.split("\n\n") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let lead = raw.len() - raw.trim_start().len();
            let start = offset + lead;
            ranges.push((start, start + trimmed.len()));
        }
        offset += raw.len() + 2;
    }

    ranges
}

/// Byte ranges of lines, newline excluded.
fn line_ranges(text: &str) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let end = offset + line.trim_end_matches('\n').trim_end_matches('\r').len();
        ranges.push((offset, end));
        offset += line.len();
    }
    ranges
}

fn is_top_level_decl(line: &str) -> bool {
    if line.starts_with(char::is_whitespace) || line.is_empty() {
        return false;
    }
    const KEYWORDS: &[&str] = &[
        "fn ", "pub ", "struct ", "enum ", "trait ", "impl ", "mod ", "class ", "def ",
        "function ", "interface ", "export ", "async ",
    ];
    KEYWORDS.iter().any(|k| line.starts_with(k))
}

/// Split a paragraph range at sentence boundaries, grouping sentences up to
/// `target_tokens`. A single sentence longer than `max_tokens` is split at
/// word boundaries.
fn split_range_by_sentences(
    text: &str,
    start: usize,
    end: usize,
    target_tokens: usize,
    max_tokens: usize,
) -> Vec<(usize, usize)> {
    let sentences = sentence_ranges(text, start, end);
    let mut out = Vec::new();
    let mut cur: Option<(usize, usize, usize)> = None;

    for (s_start, s_end) in sentences {
        let s_tokens = estimate_tokens(&text[s_start..s_end]);

        if s_tokens > max_tokens {
            if let Some((c_start, c_end, _)) = cur.take() {
                out.push((c_start, c_end));
            }
            out.extend(split_range_by_words(text, s_start, s_end, max_tokens));
            continue;
        }

        match cur {
            None => cur = Some((s_start, s_end, s_tokens)),
            Some((c_start, _, c_tokens)) => {
                if c_tokens >= target_tokens || c_tokens + s_tokens > max_tokens {
                    let (cs, ce, _) = cur.take().unwrap();
                    out.push((cs, ce));
                    cur = Some((s_start, s_end, s_tokens));
                } else {
                    cur = Some((c_start, s_end, c_tokens + s_tokens));
                }
            }
        }
    }

    if let Some((c_start, c_end, _)) = cur {
        out.push((c_start, c_end));
    }

    out
}

/// Sentence ranges within `[start, end)`: boundary after `.`, `!`, or `?`
/// followed by whitespace.
fn sentence_ranges(text: &str, start: usize, end: usize) -> Vec<(usize, usize)> {
    let slice = &text[start..end];
    let mut ranges = Vec::new();
    let mut sentence_start = 0;
    let mut prev_terminator = false;

    for (i, c) in slice.char_indices() {
        if prev_terminator && c.is_whitespace() {
            ranges.push((start + sentence_start, start + i));
            sentence_start = i + c.len_utf8();
        }
        prev_terminator = matches!(c, '.' | '!' | '?');
    }
    if sentence_start < slice.len() {
        ranges.push((start + sentence_start, end));
    }

    ranges
        .into_iter()
        .filter(|(s, e)| !text[*s..*e].trim().is_empty())
        .collect()
}

fn split_range_by_words(
    text: &str,
    start: usize,
    end: usize,
    max_tokens: usize,
) -> Vec<(usize, usize)> {
    let slice = &text[start..end];
    let max_words = ((max_tokens as f64) / TOKENS_PER_WORD).max(1.0) as usize;

    let mut out = Vec::new();
    let mut words = 0usize;
    let mut piece_start = 0usize;
    let mut in_word = false;
    let mut last_ws = 0usize;

    for (i, c) in slice.char_indices() {
        if c.is_whitespace() {
            if in_word {
                words += 1;
                in_word = false;
            }
            last_ws = i;
            if words >= max_words {
                out.push((start + piece_start, start + last_ws));
                piece_start = i + c.len_utf8();
                words = 0;
            }
        } else {
            in_word = true;
        }
    }
    if piece_start < slice.len() {
        out.push((start + piece_start, end));
    }

    out.into_iter()
        .filter(|(s, e)| s < e && !text[*s..*e].trim().is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_no_chunks() {
        assert!(chunk_prose("", 500, 1000).is_empty());
        assert!(chunk_prose("   \n\n  ", 500, 1000).is_empty());
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_prose("Hello, world!", 500, 1000);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].kind, ChunkKind::Prose);
    }

    #[test]
    fn test_paragraphs_merge_under_target() {
        let text = "First paragraph here.\n\nSecond paragraph here.\n\nThird paragraph here.";
        let chunks = chunk_prose(text, 500, 1000);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("First paragraph"));
        assert!(chunks[0].text.contains("Third paragraph"));
    }

    #[test]
    fn test_target_forces_split() {
        // Each paragraph ~13 tokens; target 10 forces one paragraph per chunk.
        let text = (0..6)
            .map(|i| format!("Paragraph number {} has exactly ten words in it today right now.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_prose(&text, 10, 40);
        assert!(chunks.len() > 1);
    }

    #[test]
    fn test_spans_disjoint_and_ordered() {
        let text = (0..20)
            .map(|i| format!("Paragraph {} with a handful of words to chunk.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_prose(&text, 15, 30);
        for pair in chunks.windows(2) {
            assert!(pair[0].end_byte <= pair[1].start_byte);
        }
        for chunk in &chunks {
            assert_eq!(&text[chunk.start_byte..chunk.end_byte], chunk.text);
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha beta gamma.\n\nDelta epsilon zeta.\n\nEta theta iota kappa lambda.";
        let a = chunk_prose(text, 5, 10);
        let b = chunk_prose(text, 5, 10);
        assert_eq!(a, b);
    }

    #[test]
    fn test_oversize_paragraph_split_by_sentences() {
        let sentence = "This sentence has exactly eight words in it. ";
        let text = sentence.repeat(40);
        let chunks = chunk_prose(&text, 20, 40);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            // ~40 token cap plus one sentence of slack
            assert!(chunk.token_count <= 55, "chunk too large: {}", chunk.token_count);
        }
    }

    #[test]
    fn test_code_splits_on_declarations() {
        let text = "fn alpha() {\n    1\n}\n\nfn beta() {\n    2\n}\n\nfn gamma() {\n    3\n}\n";
        let chunks = chunk_code(text, 100);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].text.contains("alpha"));
        assert!(chunks[2].text.contains("gamma"));
        assert!(chunks.iter().all(|c| c.kind == ChunkKind::Code));
    }

    #[test]
    fn test_code_hard_cap() {
        let body: String = (0..250).map(|i| format!("    let x{} = {};\n", i, i)).collect();
        let text = format!("fn big() {{\n{}}}\n", body);
        let chunks = chunk_code(&text, 100);
        assert!(chunks.len() >= 3);
        for chunk in &chunks {
            assert!(chunk.text.lines().count() <= 100);
        }
    }

    #[test]
    fn test_code_without_structure_uses_line_blocks() {
        let text: String = (0..120).map(|i| format!("    line {}\n", i)).collect();
        let chunks = chunk_code(&text, 50);
        assert_eq!(chunks.len(), 3);
    }
}
