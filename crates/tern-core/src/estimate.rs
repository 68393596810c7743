// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use tern_model::{ContentBlock, Message};

/// Extra tokens charged per fenced code block: fences, language tag, and the
/// denser tokenization of code relative to prose.
const CODE_FENCE_OVERHEAD: usize = 12;

/// Discount per URL: long URLs inflate the character count far beyond their
/// token cost.
const URL_DISCOUNT: usize = 4;

/// Fixed overhead of a tool_use block (name, id, structure).
const TOOL_USE_OVERHEAD: usize = 20;

/// Fixed overhead of a tool_result block (id back-reference, structure).
const TOOL_RESULT_OVERHEAD: usize = 15;

/// Flat estimate for an image block, any size.
const IMAGE_TOKENS: usize = 765;

/// Per-page estimate for document attachments.
const DOCUMENT_PAGE_TOKENS: usize = 750;

/// Deterministic token estimate for plain text.
///
/// Base: ⌈max(words · 1.3, chars / 4)⌉ — the word form dominates for prose,
/// the char form for dense text.  Adjusted upward per fenced code block and
/// downward per URL.  Never below 1.
pub fn estimate_text(text: &str) -> usize {
    if text.is_empty() {
        return 1;
    }
    let words = text.split_whitespace().count() as f64;
    let chars = text.chars().count() as f64;
    let base = (words * 1.3).max(chars / 4.0).ceil() as usize;

    let fences = text.matches("```").count() / 2;
    let urls = text.matches("://").count();

    (base + fences * CODE_FENCE_OVERHEAD)
        .saturating_sub(urls * URL_DISCOUNT)
        .max(1)
}

pub fn estimate_block(block: &ContentBlock) -> usize {
    match block {
        ContentBlock::Text { text } => estimate_text(text),
        ContentBlock::Image { .. } => IMAGE_TOKENS,
        ContentBlock::ToolUse { input, .. } => {
            TOOL_USE_OVERHEAD + estimate_text(&input.to_string())
        }
        ContentBlock::ToolResult { content, .. } => {
            TOOL_RESULT_OVERHEAD + estimate_text(content)
        }
    }
}

/// Estimate for a whole message: the sum of its blocks.
pub fn estimate_message(message: &Message) -> usize {
    message.content.iter().map(estimate_block).sum::<usize>().max(1)
}

/// Estimate for a document attachment of `pages` pages.
pub fn estimate_document(pages: usize) -> usize {
    pages * DOCUMENT_PAGE_TOKENS
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Determinism ───────────────────────────────────────────────────────────

    #[test]
    fn same_input_same_estimate() {
        let text = "a deterministic estimate for a deterministic input";
        assert_eq!(estimate_text(text), estimate_text(text));
    }

    // ── Text heuristics ───────────────────────────────────────────────────────

    #[test]
    fn empty_text_is_one_token() {
        assert_eq!(estimate_text(""), 1);
    }

    #[test]
    fn prose_uses_word_count_times_1_3() {
        // 10 short words: words·1.3 = 13 dominates chars/4.
        let text = "a b c d e f g h i j";
        assert_eq!(estimate_text(text), 13);
    }

    #[test]
    fn dense_text_uses_char_count_over_4() {
        // One 100-char "word": chars/4 = 25 dominates words·1.3 = 1.3.
        let text = "x".repeat(100);
        assert_eq!(estimate_text(&text), 25);
    }

    #[test]
    fn code_fences_raise_the_estimate() {
        let plain = "let x = compute_value(input);";
        let fenced = format!("```rust\n{plain}\n```");
        assert!(estimate_text(&fenced) > estimate_text(plain) + CODE_FENCE_OVERHEAD / 2);
    }

    #[test]
    fn urls_lower_the_estimate() {
        let with_url = "see https://docs.example.com/very/long/path/to/page for details";
        let without = "see docs.example.com/very/long/path/to/page page for details";
        assert!(estimate_text(with_url) < estimate_text(without) + URL_DISCOUNT);
    }

    #[test]
    fn discount_never_drops_below_one() {
        assert_eq!(estimate_text("a://b"), 1);
    }

    // ── Blocks ────────────────────────────────────────────────────────────────

    #[test]
    fn image_block_is_flat_765() {
        let b = ContentBlock::Image {
            media_type: "image/png".into(),
            data: "AAAA".into(),
        };
        assert_eq!(estimate_block(&b), 765);
    }

    #[test]
    fn tool_use_adds_fixed_overhead_to_serialized_input() {
        let b = ContentBlock::ToolUse {
            id: "t".into(),
            name: "Read".into(),
            input: json!({"file_path": "/src/main.rs"}),
        };
        let input_only = estimate_text(&json!({"file_path": "/src/main.rs"}).to_string());
        assert_eq!(estimate_block(&b), TOOL_USE_OVERHEAD + input_only);
    }

    #[test]
    fn tool_result_adds_fixed_overhead_to_content() {
        let b = ContentBlock::tool_result("t", "output text here");
        assert_eq!(
            estimate_block(&b),
            TOOL_RESULT_OVERHEAD + estimate_text("output text here")
        );
    }

    #[test]
    fn message_estimate_sums_blocks() {
        let m = Message {
            role: tern_model::Role::Assistant,
            content: vec![
                ContentBlock::text("hello world"),
                ContentBlock::tool_result("t", "result"),
            ],
        };
        assert_eq!(
            estimate_message(&m),
            estimate_text("hello world") + estimate_block(&m.content[1])
        );
    }

    #[test]
    fn document_scales_with_pages() {
        assert_eq!(estimate_document(3), 3 * DOCUMENT_PAGE_TOKENS);
        assert_eq!(estimate_document(0), 0);
    }
}
