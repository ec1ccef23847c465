use crate::chunking::TokenCounter;
use crate::embeddings::Embedder;
use crate::orchestrator::RetrievalEngine;
use crate::traits::CollectionStore;
use crate::{IngestError, IngestReport, RetrievalError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use walkdir::WalkDir;

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

/// Collection name for a document: its lowercased file stem with every run of
/// characters outside `[a-z0-9._-]` replaced by `_`.
pub fn collection_name_from_path(path: &Path) -> Result<String, IngestError> {
    static INVALID: OnceLock<Option<Regex>> = OnceLock::new();

    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| {
            IngestError::InvalidArgument(format!("path has no file name: {}", path.display()))
        })?;

    let lowered = stem.trim().to_lowercase();
    let replaced = match INVALID.get_or_init(|| Regex::new(r"[^a-z0-9._-]+").ok()) {
        Some(pattern) => pattern.replace_all(&lowered, "_").into_owned(),
        None => lowered,
    };
    let name = replaced.trim_matches('_').chars().take(128).collect::<String>();

    if name.is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "cannot derive a collection name from {}",
            path.display()
        )));
    }
    Ok(name)
}

pub struct SkippedPdf {
    pub path: PathBuf,
    pub reason: String,
}

pub struct FolderIngestionReport {
    pub ingested: Vec<IngestReport>,
    pub skipped_files: Vec<SkippedPdf>,
}

impl FolderIngestionReport {
    pub fn chunk_count(&self) -> usize {
        self.ingested.iter().map(|report| report.chunk_count).sum()
    }
}

/// Ingests every PDF under `folder`, each into `collection` or, when none is
/// given, into a collection named after the file. A file that fails is
/// recorded and skipped; the remaining files are still ingested.
pub async fn ingest_folder_best_effort<S, E, T>(
    engine: &RetrievalEngine<S, E, T>,
    folder: &Path,
    collection: Option<&str>,
) -> Result<FolderIngestionReport, RetrievalError>
where
    S: CollectionStore,
    E: Embedder,
    T: TokenCounter,
{
    let files = discover_pdf_files(folder);

    if files.is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "no pdf files found in {}",
            folder.display()
        ))
        .into());
    }

    let mut ingested = Vec::new();
    let mut skipped_files = Vec::new();

    for path in files {
        match engine.ingest_path(&path, collection).await {
            Ok(report) => ingested.push(report),
            Err(error) if error.is_caller_error() => skipped_files.push(SkippedPdf {
                path,
                reason: error.to_string(),
            }),
            Err(error) => return Err(error),
        }
    }

    Ok(FolderIngestionReport {
        ingested,
        skipped_files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::testing::WordCounter;
    use crate::chunking::{ChunkingConfig, TextChunker};
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::extractor::fixtures::pdf_with_pages;
    use crate::stores::{SqliteCollectionStore, StoreSettings};
    use crate::DistanceMetric;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::tempdir;

    fn engine(
        dir: &Path,
    ) -> RetrievalEngine<SqliteCollectionStore, CharacterNgramEmbedder, WordCounter> {
        let store = SqliteCollectionStore::open(
            dir.join("db").join("store.sqlite3"),
            StoreSettings {
                dimensions: 32,
                metric: DistanceMetric::Cosine,
                embedding_model: crate::CHARACTER_NGRAM_MODEL_ID.to_string(),
            },
        )
        .expect("store should open");
        let chunker = TextChunker::new(ChunkingConfig::default(), WordCounter)
            .expect("default chunking config is valid");
        RetrievalEngine::new(store, CharacterNgramEmbedder::new(32), chunker)
            .expect("engine should build")
    }

    #[test]
    fn discover_pdf_files_is_recursive() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        File::create(base.join("a.pdf")).and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        File::create(nested.join("b.PDF"))
            .and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        File::create(base.join("notes.txt"))?;

        let files = discover_pdf_files(base);
        assert_eq!(files.len(), 2);
        Ok(())
    }

    #[test]
    fn collection_names_derive_from_file_stems() -> Result<(), IngestError> {
        assert_eq!(
            collection_name_from_path(Path::new("/tmp/Italy Trip Itinerary.pdf"))?,
            "italy_trip_itinerary"
        );
        assert_eq!(
            collection_name_from_path(Path::new("itineraries/rome-2024.v2.pdf"))?,
            "rome-2024.v2"
        );
        assert!(collection_name_from_path(Path::new("/tmp/%%%.pdf")).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn folder_ingestion_skips_unreadable_pdfs() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let docs = dir.path().join("docs");
        fs::create_dir(&docs)?;
        fs::write(docs.join("unreadable.pdf"), b"%PDF-1.4\n%broken")?;
        fs::write(docs.join("Rome.pdf"), pdf_with_pages(&[&["Colosseum tickets at 9am"]]))?;

        let engine = engine(dir.path());
        let report = ingest_folder_best_effort(&engine, &docs, None).await?;

        assert_eq!(report.ingested.len(), 1);
        assert_eq!(report.ingested[0].collection, "rome");
        assert_eq!(report.chunk_count(), 1);
        assert_eq!(report.skipped_files.len(), 1);
        assert_eq!(
            report.skipped_files[0]
                .path
                .file_name()
                .and_then(|name| name.to_str()),
            Some("unreadable.pdf")
        );
        Ok(())
    }

    #[tokio::test]
    async fn folder_ingestion_fails_without_pdfs() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let engine = engine(dir.path());
        let empty = dir.path().join("empty");
        fs::create_dir(&empty)?;
        assert!(ingest_folder_best_effort(&engine, &empty, None).await.is_err());
        Ok(())
    }
}
