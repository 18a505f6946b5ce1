use crate::error::IndexError;
use lopdf::Document;
use std::path::Path;

const BINARY_SNIFF_BYTES: usize = 8 * 1024;

/// Turns a file into the text that gets embedded. An empty (or whitespace-only)
/// result means "nothing to index" and is not an error.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<String, IndexError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExtractor;

impl TextExtractor for DefaultExtractor {
    fn extract(&self, path: &Path) -> Result<String, IndexError> {
        let is_pdf = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            extract_pdf_text(path)
        } else {
            let bytes = std::fs::read(path)?;
            Ok(decode_text(&bytes))
        }
    }
}

/// Lossy UTF-8 decode; content with a NUL byte near the start is treated as
/// binary and yields no text.
pub fn decode_text(bytes: &[u8]) -> String {
    let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    if sniff.contains(&0) {
        return String::new();
    }
    String::from_utf8_lossy(bytes).into_owned()
}

/// Page texts joined with form feeds. A PDF without any text layer yields an
/// empty string.
pub fn extract_pdf_text(path: &Path) -> Result<String, IndexError> {
    let document =
        Document::load(path).map_err(|error| IndexError::Extraction(error.to_string()))?;

    let mut pages = Vec::new();
    for (page_no, _page_id) in document.get_pages() {
        let text = document
            .extract_text(&[page_no])
            .map_err(|error| IndexError::Extraction(error.to_string()))?;

        if !text.trim().is_empty() {
            pages.push(text);
        }
    }

    Ok(pages.join("\u{000c}"))
}
