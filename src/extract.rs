//! Text extraction from uploaded documents with page-offset tracking

use crate::error::{ExtractionError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Byte range of a single page within the extracted UTF-8 text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSpan {
    pub page_number: i64,
    pub start_char: i64,
    pub end_char: i64,
}

/// Extracted document content: unicode text plus its page map
#[derive(Debug, Clone)]
pub struct Extraction {
    pub text: String,
    /// Contiguous half-open ranges covering `text` exactly; a single span
    /// for non-paginated formats
    pub pages: Vec<PageSpan>,
}

impl Extraction {
    fn single_page(text: String) -> Self {
        let len = text.len() as i64;
        Self {
            text,
            pages: vec![PageSpan {
                page_number: 1,
                start_char: 0,
                end_char: len,
            }],
        }
    }
}

/// Service for extracting text from paper files
pub struct TextExtractor {
    allowed_extensions: Vec<String>,
}

impl TextExtractor {
    pub fn new(allowed_extensions: Vec<String>) -> Self {
        Self { allowed_extensions }
    }

    /// Extract text and page map from a file, dispatching on its extension
    pub fn extract(&self, path: &Path) -> Result<Extraction> {
        if !path.exists() {
            return Err(
                ExtractionError::MissingFile(path.display().to_string()).into(),
            );
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        if !self.allowed_extensions.iter().any(|a| a == &ext) {
            return Err(ExtractionError::UnsupportedFormat(ext).into());
        }

        let extraction = match ext.as_str() {
            "pdf" => self.extract_pdf(path)?,
            "txt" => self.extract_plain(path)?,
            "rtf" => self.extract_rtf(path)?,
            "docx" | "doc" => {
                return Err(ExtractionError::ExtractionFailed(format!(
                    "no extractable text layer for .{ext} files"
                ))
                .into())
            }
            other => return Err(ExtractionError::UnsupportedFormat(other.to_string()).into()),
        };

        if extraction.text.trim().is_empty() {
            return Err(ExtractionError::ExtractionEmpty.into());
        }

        info!(
            "Extracted {} pages, total {} characters from {}",
            extraction.pages.len(),
            extraction.text.len(),
            path.display()
        );
        Ok(extraction)
    }

    /// Extract a PDF page by page so chunks can later be mapped back to pages
    fn extract_pdf(&self, path: &Path) -> Result<Extraction> {
        let doc = lopdf::Document::load(path).map_err(|e| {
            ExtractionError::ExtractionFailed(format!("failed to open PDF: {e}"))
        })?;

        let mut text = String::new();
        let mut pages = Vec::new();
        let mut char_position: i64 = 0;

        for (page_number, _) in doc.get_pages() {
            let page_text = match doc.extract_text(&[page_number]) {
                Ok(t) => t,
                Err(e) => {
                    debug!("Page {} text extraction failed: {}", page_number, e);
                    continue;
                }
            };

            if page_text.is_empty() {
                continue;
            }

            let page_len = page_text.len() as i64;
            pages.push(PageSpan {
                page_number: page_number as i64,
                start_char: char_position,
                end_char: char_position + page_len,
            });
            text.push_str(&page_text);
            char_position += page_len;
        }

        // Some PDFs carry no per-page text objects lopdf understands; fall
        // back to whole-document extraction with a single page span.
        if text.trim().is_empty() {
            warn!(
                "Per-page extraction empty for {}, falling back to whole-document pass",
                path.display()
            );
            let whole = pdf_extract::extract_text(path).map_err(|e| {
                ExtractionError::ExtractionFailed(format!("PDF extraction failed: {e}"))
            })?;
            return Ok(Extraction::single_page(whole));
        }

        Ok(Extraction { text, pages })
    }

    fn extract_plain(&self, path: &Path) -> Result<Extraction> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ExtractionError::ExtractionFailed(format!("failed to read file: {e}"))
        })?;
        Ok(Extraction::single_page(text))
    }

    /// Strip RTF control words and groups, keeping the plain text runs
    fn extract_rtf(&self, path: &Path) -> Result<Extraction> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ExtractionError::ExtractionFailed(format!("failed to read file: {e}"))
        })?;

        let mut text = String::new();
        let mut chars = raw.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    // Control word: consume alphabetic run and optional numeric
                    // parameter; \par and \line become newlines
                    let mut word = String::new();
                    while let Some(&next) = chars.peek() {
                        if next.is_ascii_alphabetic() {
                            word.push(next);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    while let Some(&next) = chars.peek() {
                        if next.is_ascii_digit() || next == '-' {
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if let Some(&' ') = chars.peek() {
                        chars.next();
                    }
                    if word == "par" || word == "line" {
                        text.push('\n');
                    }
                }
                '{' | '}' => {}
                '\r' | '\n' => {}
                other => text.push(other),
            }
        }

        Ok(Extraction::single_page(text))
    }
}

impl Default for TextExtractor {
    fn default() -> Self {
        Self::new(
            ["pdf", "docx", "doc", "txt", "rtf"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file() {
        let extractor = TextExtractor::default();
        let err = extractor
            .extract(Path::new("/nonexistent/paper.pdf"))
            .unwrap_err();
        assert_eq!(err.category(), "extraction");
    }

    #[test]
    fn test_unsupported_format() {
        let mut file = tempfile::Builder::new().suffix(".exe").tempfile().unwrap();
        file.write_all(b"binary").unwrap();
        let extractor = TextExtractor::default();
        let err = extractor.extract(file.path()).unwrap_err();
        assert!(err.to_string().contains("Unsupported format"));
    }

    #[test]
    fn test_plain_text_single_page_span() {
        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        file.write_all("Transformers revolutionised NLP.".as_bytes())
            .unwrap();

        let extractor = TextExtractor::default();
        let extraction = extractor.extract(file.path()).unwrap();

        assert_eq!(extraction.pages.len(), 1);
        assert_eq!(extraction.pages[0].start_char, 0);
        assert_eq!(
            extraction.pages[0].end_char,
            extraction.text.len() as i64
        );
    }

    #[test]
    fn test_empty_file_rejected() {
        let file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        let extractor = TextExtractor::default();
        let err = extractor.extract(file.path()).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_rtf_control_words_stripped() {
        let mut file = tempfile::Builder::new().suffix(".rtf").tempfile().unwrap();
        file.write_all(br"{\rtf1\ansi Hello citation \b world\b0 .\par}")
            .unwrap();

        let extractor = TextExtractor::default();
        let extraction = extractor.extract(file.path()).unwrap();
        assert!(extraction.text.contains("Hello citation"));
        assert!(extraction.text.contains("world"));
        assert!(!extraction.text.contains("rtf1"));
    }
}
