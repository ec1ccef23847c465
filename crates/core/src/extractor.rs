use crate::error::IngestError;
use lopdf::Document;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

/// Where a PDF's bytes come from: a file on disk or an upload held in memory.
#[derive(Debug, Clone)]
pub enum PdfSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl PdfSource {
    pub fn describe(&self) -> String {
        match self {
            Self::Path(path) => path.display().to_string(),
            Self::Bytes(bytes) => format!("<{} in-memory bytes>", bytes.len()),
        }
    }

    fn load(&self) -> Result<Document, IngestError> {
        let loaded = match self {
            Self::Path(path) => {
                if !path.is_file() {
                    return Err(IngestError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no such file: {}", path.display()),
                    )));
                }
                Document::load(path)
            }
            Self::Bytes(bytes) => Document::load_mem(bytes),
        };

        loaded.map_err(|error| {
            IngestError::Extraction(format!("{}: {error}", self.describe()))
        })
    }
}

impl From<&Path> for PdfSource {
    fn from(value: &Path) -> Self {
        Self::Path(value.to_path_buf())
    }
}

impl From<PathBuf> for PdfSource {
    fn from(value: PathBuf) -> Self {
        Self::Path(value)
    }
}

impl From<Vec<u8>> for PdfSource {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<&[u8]> for PdfSource {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

pub trait PdfExtractor {
    fn extract_pages(&self, source: &PdfSource) -> Result<Vec<PageText>, IngestError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, source: &PdfSource) -> Result<Vec<PageText>, IngestError> {
        let document = source.load()?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = match document.extract_text(&[page_no]) {
                Ok(text) => text,
                Err(error) => {
                    warn!(source = %source.describe(), page = page_no, %error, "skipping unreadable page");
                    continue;
                }
            };

            if !text.trim().is_empty() {
                pages.push(PageText {
                    number: page_no,
                    text,
                });
            }
        }

        Ok(pages)
    }
}

/// Concatenate the text of every readable page, in page order, one newline
/// between pages.
pub fn extract_text(
    extractor: &impl PdfExtractor,
    source: &PdfSource,
) -> Result<String, IngestError> {
    let pages = extractor.extract_pages(source)?;
    let text = join_pages(&pages);

    if text.trim().is_empty() {
        return Err(IngestError::EmptyDocument);
    }

    Ok(text)
}

pub fn extract_page_texts(source: &PdfSource) -> Result<Vec<PageText>, IngestError> {
    LopdfExtractor.extract_pages(source)
}

fn join_pages(pages: &[PageText]) -> String {
    pages
        .iter()
        .map(|page| page.text.trim_end_matches(['\n', '\r']))
        .filter(|text| !text.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
