// Text Processing Service
// Normalization, lexical sentence splitting and clause-aware chunking

use regex::Regex;
use std::sync::OnceLock;

/// Abbreviations that end in a period but rarely end a sentence.
const NON_TERMINAL_ABBREVIATIONS: &[&str] = &[
    "e.g.", "i.e.", "vs.", "mr.", "mrs.", "ms.", "dr.", "prof.", "inc.", "ltd.", "co.",
    "u.s.", "art.", "sec.",
];

/// `No.` only abbreviates "number" when a digit follows (`No. 5`); otherwise it ends a sentence.
const NUMBER_ABBREVIATION: &str = "no.";

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static regex must compile"))
}

fn paragraph_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"\n\s*\n")
}

fn sentence_end_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Keep closing quotes/brackets with the sentence they end.
    regex(&RE, r#"([.!?]["'\)\]]*)\s+"#)
}

fn clause_boundary_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"[.!?;]\s+[A-Z0-9(]")
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"\s+")
}

/// Normalize extracted document text before segmentation
pub fn normalize_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let mut s = text
        .replace(['\u{201c}', '\u{201d}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace(['\u{00A0}', '\u{3000}'], " ");

    s = s.replace("\r\n", "\n").replace('\r', "\n");

    static HSPACE: OnceLock<Regex> = OnceLock::new();
    s = regex(&HSPACE, r"[ \t\x0C\x0B]+").replace_all(&s, " ").to_string();

    s = s.lines().map(|ln| ln.trim()).collect::<Vec<_>>().join("\n");

    static BLANKS: OnceLock<Regex> = OnceLock::new();
    s = regex(&BLANKS, r"\n{3,}").replace_all(&s, "\n\n").to_string();

    s.trim().to_string()
}

/// Crude token proxy: whitespace-separated words
pub fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

fn ends_with_token(lower: &str, abbr: &str) -> bool {
    lower.ends_with(abbr)
        && lower[..lower.len() - abbr.len()]
            .chars()
            .last()
            .map(|c| !c.is_alphanumeric())
            .unwrap_or(true)
}

fn ends_with_abbreviation(piece: &str) -> bool {
    let lower = piece.trim_end().to_ascii_lowercase();
    NON_TERMINAL_ABBREVIATIONS.iter().any(|abbr| ends_with_token(&lower, abbr))
}

fn ends_with_number_abbreviation(piece: &str) -> bool {
    ends_with_token(&piece.trim_end().to_ascii_lowercase(), NUMBER_ABBREVIATION)
}

/// Section numbers such as `1.`, `12.` or `a.` are never sentences on their own.
fn is_list_marker(piece: &str) -> bool {
    let Some(body) = piece.trim().strip_suffix('.') else {
        return false;
    };
    !body.is_empty()
        && body.len() <= 3
        && (body.chars().all(|c| c.is_ascii_digit()) || (body.len() == 1 && body.chars().all(|c| c.is_ascii_alphabetic())))
}

/// Lexical sentence splitter: split on sentence-ending punctuation followed by whitespace.
///
/// Paragraph breaks always end a sentence. Splits after common abbreviations are undone.
/// Output sentences are trimmed, whitespace-collapsed and never empty.
pub fn split_sentences(text: &str) -> Vec<String> {
    if text.trim().is_empty() {
        return vec![];
    }

    let mut sentences = Vec::new();
    for para in paragraph_re().split(text) {
        if para.trim().is_empty() {
            continue;
        }
        let marked = sentence_end_re().replace_all(para, "$1\x00");
        // (text so far, joins the next piece only if that piece starts with a digit)
        let mut pending: Option<(String, bool)> = None;
        for piece in marked.split('\x00') {
            let piece = whitespace_re().replace_all(piece.trim(), " ").to_string();
            if piece.is_empty() {
                continue;
            }
            let joined = match pending.take() {
                Some((prev, true)) if !piece.starts_with(|c: char| c.is_ascii_digit()) => {
                    sentences.push(prev);
                    piece
                }
                Some((prev, _)) => format!("{} {}", prev, piece),
                None => piece,
            };
            if ends_with_abbreviation(&joined) || is_list_marker(&joined) {
                pending = Some((joined, false));
            } else if ends_with_number_abbreviation(&joined) {
                pending = Some((joined, true));
            } else {
                sentences.push(joined);
            }
        }
        if let Some((rest, _)) = pending {
            sentences.push(rest);
        }
    }
    sentences
}

/// Split a paragraph at clause boundaries (`.!?;` + whitespace + capital/digit/paren).
fn split_clauses(paragraph: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut last = 0usize;
    for m in clause_boundary_re().find_iter(paragraph) {
        // Both the punctuation and the following character are ASCII.
        let cut = m.start() + 1;
        let next = m.end() - 1;
        let part = paragraph[last..cut].trim();
        if !part.is_empty() {
            parts.push(part);
        }
        last = next;
    }
    let tail = paragraph[last..].trim();
    if !tail.is_empty() {
        parts.push(tail);
    }
    parts
}

fn tail_words(piece: &str, count: usize) -> String {
    if count == 0 {
        return String::new();
    }
    let words: Vec<&str> = piece.split_whitespace().collect();
    let start = words.len().saturating_sub(count);
    words[start..].join(" ")
}

/// Clause-aware chunking for passage indexes.
///
/// Prefers paragraph and sentence boundaries, carries `overlap` trailing words into the
/// next chunk, and folds chunks smaller than `soft_min_tokens` into their predecessor.
pub fn dynamic_chunk(text: &str, max_tokens: usize, soft_min_tokens: usize, overlap: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();

    for para in paragraph_re().split(text) {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }

        let mut cur: Vec<String> = Vec::new();
        let mut cur_tok = 0usize;
        for part in split_clauses(para) {
            let part_tok = estimate_tokens(part);
            if cur_tok + part_tok > max_tokens && cur_tok >= soft_min_tokens {
                let piece = cur.join(" ").trim().to_string();
                let tail = tail_words(&piece, overlap);
                if !piece.is_empty() {
                    out.push(piece);
                }
                cur.clear();
                cur_tok = 0;
                if !tail.is_empty() {
                    cur_tok += estimate_tokens(&tail);
                    cur.push(tail);
                }
                cur.push(part.to_string());
                cur_tok += part_tok;
            } else {
                cur.push(part.to_string());
                cur_tok += part_tok;
            }
        }

        if cur.is_empty() {
            continue;
        }
        let piece = cur.join(" ").trim().to_string();
        if estimate_tokens(&piece) < soft_min_tokens && !out.is_empty() {
            let prev = out.pop().unwrap_or_default();
            let merged = format!("{} {}", prev, piece).trim().to_string();
            if estimate_tokens(&merged) <= max_tokens + overlap {
                out.push(merged);
            } else {
                out.push(prev);
                out.push(piece);
            }
        } else {
            out.push(piece);
        }
    }

    if out.len() >= 2 && out.last().map(|c| estimate_tokens(c) < soft_min_tokens).unwrap_or(false) {
        if let Some(last) = out.pop() {
            if let Some(prev) = out.last_mut() {
                *prev = format!("{} {}", prev, last).trim().to_string();
            }
        }
    }

    let mut deduped: Vec<String> = Vec::with_capacity(out.len());
    for chunk in out {
        if chunk.is_empty() || deduped.last() == Some(&chunk) {
            continue;
        }
        deduped.push(chunk);
    }
    deduped
}

/// Chunk with the default soft minimum of a third of `max_tokens`
pub fn chunk_text(text: &str, max_tokens: usize, overlap: usize) -> Vec<String> {
    dynamic_chunk(text, max_tokens, max_tokens / 3, overlap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_text() {
        let input = "Hello\u{201c}World\u{201d}\r\n\r\n\r\n  It\u{2019}s   here ";
        assert_eq!(normalize_text(input), "Hello\"World\"\n\nIt's here");
    }

    #[test]
    fn test_split_sentences_empty() {
        assert!(split_sentences("").is_empty());
        assert!(split_sentences("   \n\n  ").is_empty());
    }

    #[test]
    fn test_split_sentences_basic() {
        let text = "We may change these terms at any time without notice. We do not share personal data. Disputes go to binding arbitration.";
        let sentences = split_sentences(text);
        assert_eq!(
            sentences,
            vec![
                "We may change these terms at any time without notice.",
                "We do not share personal data.",
                "Disputes go to binding arbitration.",
            ]
        );
    }

    #[test]
    fn test_split_sentences_keeps_abbreviations_and_decimals() {
        let text = "Fees are 3.5 percent, e.g. for transfers. Acme Inc. may update them!";
        let sentences = split_sentences(text);
        assert_eq!(
            sentences,
            vec!["Fees are 3.5 percent, e.g. for transfers.", "Acme Inc. may update them!"]
        );
    }

    #[test]
    fn test_split_sentences_no_only_abbreviates_before_digit() {
        assert_eq!(split_sentences("No. We don't."), vec!["No.", "We don't."]);
        assert_eq!(
            split_sentences("See clause No. 12 for fees. Refunds are final."),
            vec!["See clause No. 12 for fees.", "Refunds are final."]
        );
        assert_eq!(split_sentences("Do we sell data? No."), vec!["Do we sell data?", "No."]);
    }

    #[test]
    fn test_split_sentences_paragraph_break_ends_sentence() {
        let text = "1. Terms of Use\n\nBy using the service you agree.";
        let sentences = split_sentences(text);
        assert_eq!(sentences, vec!["1. Terms of Use", "By using the service you agree."]);
    }

    #[test]
    fn test_split_sentences_is_deterministic() {
        let text = "One. Two? Three!\n\nFour.";
        assert_eq!(split_sentences(text), split_sentences(text));
        assert_eq!(split_sentences(text).len(), 4);
    }

    #[test]
    fn test_split_clauses() {
        let parts = split_clauses("First part; Second part. third stays. Fourth (x).");
        assert_eq!(parts, vec!["First part;", "Second part. third stays.", "Fourth (x)."]);
    }

    #[test]
    fn test_chunk_text_respects_paragraphs() {
        let para_a = "Alpha beta gamma delta. ".repeat(10);
        let para_b = "Epsilon zeta eta theta. ".repeat(10);
        let text = format!("{}\n\n{}", para_a.trim(), para_b.trim());
        let chunks = chunk_text(&text, 40, 0);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with("Alpha"));
        assert!(chunks[1].starts_with("Epsilon"));
    }

    #[test]
    fn test_chunk_text_overlap_carries_tail() {
        let text = (0..30)
            .map(|i| format!("Sentence number w{} ends here.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = dynamic_chunk(&text, 20, 5, 3);
        assert!(chunks.len() > 1);
        let first_tail = tail_words(&chunks[0], 3);
        assert!(chunks[1].starts_with(&first_tail));
    }

    #[test]
    fn test_chunk_text_merges_tiny_tail() {
        let text = format!("{}\n\nTiny end.", "Word word word word word. ".repeat(8).trim());
        let chunks = chunk_text(&text, 60, 0);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].ends_with("Tiny end."));
    }
}
