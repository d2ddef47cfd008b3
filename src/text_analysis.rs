//! Editor-snapshot analysis: sentence neighbourhood extraction and the
//! change-significance predicate

use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

/// Sentence neighbourhood around the cursor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextContext {
    pub current_sentence: String,
    pub previous_sentence: Option<String>,
    pub next_sentence: Option<String>,
    pub paragraph: String,
    pub section: Option<String>,
    pub position: usize,
}

/// Editor-supplied hints accompanying a snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EditorContext {
    #[serde(rename = "cursorPosition", default)]
    pub cursor_position: Option<usize>,
    #[serde(default)]
    pub section: Option<String>,
}

/// Service for analyzing and extracting context from editor text
pub struct TextAnalyzer {
    min_sentence_length: usize,
    whitespace: Regex,
    disallowed: Regex,
    repeated_periods: Regex,
    space_before_punct: Regex,
    paragraph_break: Regex,
}

impl TextAnalyzer {
    pub fn new() -> Self {
        Self {
            min_sentence_length: 10,
            whitespace: Regex::new(r"\s+").unwrap_or_else(|_| unreachable!("fixed pattern")),
            disallowed: Regex::new(r"[^\w\s.!?,;:\-()]")
                .unwrap_or_else(|_| unreachable!("fixed pattern")),
            repeated_periods: Regex::new(r"\.{2,}")
                .unwrap_or_else(|_| unreachable!("fixed pattern")),
            space_before_punct: Regex::new(r"\s+([.!?])")
                .unwrap_or_else(|_| unreachable!("fixed pattern")),
            paragraph_break: Regex::new(r"\n\s*\n")
                .unwrap_or_else(|_| unreachable!("fixed pattern")),
        }
    }

    /// Clean and prepare text for sentence analysis
    pub fn preprocess_text(&self, text: &str) -> String {
        let text = self.whitespace.replace_all(text, " ");
        let text = self.disallowed.replace_all(&text, "");
        let text = self.repeated_periods.replace_all(&text, ".");
        let text = self.space_before_punct.replace_all(&text, "$1");
        text.trim().to_string()
    }

    /// Sentences of at least the minimum length
    fn extract_sentences(&self, text: &str) -> Vec<String> {
        text.unicode_sentences()
            .map(|s| s.trim().to_string())
            .filter(|s| s.len() >= self.min_sentence_length)
            .collect()
    }

    /// Find which sentence contains the cursor by scanning sentence
    /// positions in the original (pre-normalisation) text
    fn find_current_sentence_index(
        sentences: &[String],
        original_text: &str,
        cursor_pos: usize,
    ) -> usize {
        if sentences.is_empty() {
            return 0;
        }

        let mut current_pos = 0usize;
        for (i, sentence) in sentences.iter().enumerate() {
            let Some(found) = original_text[current_pos.min(original_text.len())..]
                .find(sentence.as_str())
                .map(|p| p + current_pos)
            else {
                continue;
            };

            let sentence_end = found + sentence.len();
            if cursor_pos <= sentence_end {
                return i;
            }
            current_pos = sentence_end;
        }

        sentences.len() - 1
    }

    /// Extract the paragraph containing the cursor position
    fn extract_paragraph(&self, text: &str, cursor_pos: usize) -> String {
        let mut last = "";
        let mut cursor = 0usize;
        let mut start = 0usize;

        for sep in self.paragraph_break.find_iter(text) {
            let paragraph = &text[start..sep.start()];
            if cursor_pos <= sep.start() && cursor_pos >= cursor {
                return paragraph.trim().to_string();
            }
            last = paragraph;
            cursor = sep.start();
            start = sep.end();
        }

        let tail = &text[start..];
        if cursor_pos >= start || tail.trim().is_empty() {
            let candidate = tail.trim();
            if !candidate.is_empty() {
                return candidate.to_string();
            }
        }
        last.trim().to_string()
    }

    /// Extract the sentence neighbourhood from an editor snapshot
    pub fn extract_context(&self, text: &str, editor_context: &EditorContext) -> TextContext {
        let cleaned = self.preprocess_text(text);
        let cursor_pos = editor_context.cursor_position.unwrap_or(text.len());
        let sentences = self.extract_sentences(&cleaned);
        let current_idx = Self::find_current_sentence_index(&sentences, text, cursor_pos);

        TextContext {
            current_sentence: sentences.get(current_idx).cloned().unwrap_or_default(),
            previous_sentence: if current_idx > 0 {
                sentences.get(current_idx - 1).cloned()
            } else {
                None
            },
            next_sentence: sentences.get(current_idx + 1).cloned(),
            paragraph: self.extract_paragraph(text, cursor_pos),
            section: editor_context.section.clone(),
            position: cursor_pos,
        }
    }

    /// Decide whether a text change warrants recomputing suggestions
    pub fn should_update_suggestions(&self, old_text: &str, new_text: &str) -> bool {
        if old_text == new_text {
            return false;
        }

        let old_clean = self.whitespace.replace_all(old_text.trim(), " ").to_string();
        let new_clean = self.whitespace.replace_all(new_text.trim(), " ").to_string();

        if old_clean == new_clean {
            return false;
        }

        if old_clean.is_empty() {
            return new_clean.len() > self.min_sentence_length;
        }

        Self::change_ratio(&old_clean, &new_clean) > 0.2
    }

    /// Position-matched character change ratio in [0, 1]
    fn change_ratio(old_text: &str, new_text: &str) -> f64 {
        if old_text.is_empty() && new_text.is_empty() {
            return 0.0;
        }
        if old_text.is_empty() || new_text.is_empty() {
            return 1.0;
        }

        let old_chars: Vec<char> = old_text.chars().collect();
        let new_chars: Vec<char> = new_text.chars().collect();
        let max_len = old_chars.len().max(new_chars.len());

        let matches = old_chars
            .iter()
            .zip(new_chars.iter())
            .filter(|(a, b)| a == b)
            .count();

        1.0 - (matches as f64 / max_len as f64)
    }
}

impl Default for TextAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}
