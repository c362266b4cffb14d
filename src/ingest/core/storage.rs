// VELIN Core - Collaborateur stockage et layout persistant
// Un préfixe par document ; exports JSON canoniques (UTF-8, LF, clés triées)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::ingest::core::raw_chunk_cache::CachedRawChunks;
use crate::ingest::extract::stitcher::StitchReport;
use crate::ingest::{
    Chunk, Document, IngestError, IngestResult, RawChunk, StageRecord, StageReport, UnicodeForm,
};

/// Version du layout persistant. Les imports refusent un major inconnu.
pub const MANIFEST_VERSION: &str = "1.0.0";

/// Collaborateur stockage : la seule surface dont le core dépend
#[async_trait]
pub trait Storage: Send + Sync {
    async fn upload(&self, path: &str, bytes: &[u8]) -> IngestResult<()>;
    async fn download(&self, path: &str) -> IngestResult<Vec<u8>>;
    async fn exists(&self, path: &str) -> bool;
}

/// Stockage filesystem enraciné dans un répertoire de base
pub struct FsStorage {
    base: PathBuf,
}

impl FsStorage {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.base.join(path)
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn upload(&self, path: &str, bytes: &[u8]) -> IngestResult<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, bytes).await?;
        debug!("uploaded {} ({} bytes)", path, bytes.len());
        Ok(())
    }

    async fn download(&self, path: &str) -> IngestResult<Vec<u8>> {
        Ok(tokio::fs::read(self.resolve(path)).await?)
    }

    async fn exists(&self, path: &str) -> bool {
        tokio::fs::try_exists(self.resolve(path)).await.unwrap_or(false)
    }
}

// === Fichiers persistés ===

/// Inventaire des fichiers d'un document, versionné
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub extractor_version: String,
    pub files: Vec<String>,
    /// Durées par étape (ms)
    pub processing_ms: BTreeMap<String, u64>,
    pub stitch_reports: Vec<StitchReport>,
    pub unicode_normalization: UnicodeForm,
    /// Empreintes de checkpoint par étape, pour la reprise
    pub checkpoints: BTreeMap<String, String>,
    /// Coûts estimés par poste (unités arbitraires du fournisseur de modèles)
    pub costs: BTreeMap<String, f64>,
    pub stage_records: Vec<StageRecord>,
    /// Erreurs d'unités (lot, chunk) collectées par étape
    pub stage_reports: Vec<StageReport>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Manifest {
    pub fn new(extractor_version: String, unicode_normalization: UnicodeForm) -> Self {
        Self {
            version: MANIFEST_VERSION.to_string(),
            extractor_version,
            files: Vec::new(),
            processing_ms: BTreeMap::new(),
            stitch_reports: Vec::new(),
            unicode_normalization,
            checkpoints: BTreeMap::new(),
            costs: BTreeMap::new(),
            stage_records: Vec::new(),
            stage_reports: Vec::new(),
            created_at: chrono::Utc::now(),
        }
    }
}

/// Contenu de `cached_chunks.json` : sortie extracteur verbatim + version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedChunksFile {
    pub extractor_version: String,
    pub total_pages: u32,
    pub raw_stream_len: usize,
    pub raw_chunks: Vec<RawChunk>,
}

/// Sérialisation canonique : clés récursivement triées, LF, newline final.
/// Le passage par `Value` trie les objets (map BTreeMap de serde_json).
pub fn canonical_json<T: Serialize>(data: &T) -> IngestResult<String> {
    let value = serde_json::to_value(data)?;
    let mut text = serde_json::to_string_pretty(&value)?;
    text.push('\n');
    Ok(text)
}

/// Store typé au-dessus du collaborateur stockage : écrit le layout
/// `<owner>/<document_id>/{source, content.md, chunks.json, cached_chunks.json,
/// metadata.json, manifest.json}`
pub struct DocumentStore {
    storage: Arc<dyn Storage>,
}

impl DocumentStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    fn path(&self, document: &Document, file: &str) -> String {
        format!("{}/{}", document.storage_prefix(), file)
    }

    /// Copie la source originale sous `source.<ext>`
    pub async fn write_source(&self, document: &Document) -> IngestResult<String> {
        let ext = document
            .source_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin");
        let bytes = tokio::fs::read(&document.source_path)
            .await
            .map_err(|e| IngestError::SourceUnreadable(e.to_string()))?;
        let name = format!("source.{ext}");
        self.storage.upload(&self.path(document, &name), &bytes).await?;
        Ok(name)
    }

    pub async fn write_content(&self, document: &Document, text: &str) -> IngestResult<String> {
        let name = "content.md".to_string();
        self.storage
            .upload(&self.path(document, &name), text.as_bytes())
            .await?;
        Ok(name)
    }

    pub async fn read_content(&self, document: &Document) -> IngestResult<String> {
        let bytes = self.storage.download(&self.path(document, "content.md")).await?;
        String::from_utf8(bytes)
            .map_err(|e| IngestError::SourceUnreadable(format!("content.md not UTF-8: {e}")))
    }

    /// Export des chunks sans embeddings (régénérables), canonique
    pub async fn write_chunks(&self, document: &Document, chunks: &[Chunk]) -> IngestResult<String> {
        let mut values: Vec<Value> = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let mut value = serde_json::to_value(chunk)?;
            if let Some(object) = value.as_object_mut() {
                object.remove("embedding");
            }
            values.push(value);
        }
        let text = canonical_json(&values)?;
        let name = "chunks.json".to_string();
        self.storage
            .upload(&self.path(document, &name), text.as_bytes())
            .await?;
        info!("💾 {} chunks exported for {}", chunks.len(), document.id);
        Ok(name)
    }

    pub async fn read_chunks(&self, document: &Document) -> IngestResult<Vec<Chunk>> {
        let bytes = self.storage.download(&self.path(document, "chunks.json")).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn write_cached_chunks(
        &self,
        document: &Document,
        cached: &CachedRawChunks,
    ) -> IngestResult<String> {
        let file = CachedChunksFile {
            extractor_version: cached.extractor_version.clone(),
            total_pages: cached.total_pages,
            raw_stream_len: cached.raw_stream_len,
            raw_chunks: cached.raw_chunks.clone(),
        };
        let text = canonical_json(&file)?;
        let name = "cached_chunks.json".to_string();
        self.storage
            .upload(&self.path(document, &name), text.as_bytes())
            .await?;
        Ok(name)
    }

    pub async fn read_cached_chunks(&self, document: &Document) -> IngestResult<CachedRawChunks> {
        let bytes = self
            .storage
            .download(&self.path(document, "cached_chunks.json"))
            .await?;
        let file: CachedChunksFile = serde_json::from_slice(&bytes)?;
        Ok(CachedRawChunks {
            raw_chunks: file.raw_chunks,
            extractor_version: file.extractor_version,
            total_pages: file.total_pages,
            raw_stream_len: file.raw_stream_len,
        })
    }

    pub async fn write_metadata(&self, document: &Document) -> IngestResult<String> {
        let text = canonical_json(document)?;
        let name = "metadata.json".to_string();
        self.storage
            .upload(&self.path(document, &name), text.as_bytes())
            .await?;
        Ok(name)
    }

    /// Relit l'état d'un document persisté (reprise CLI)
    pub async fn read_metadata(&self, owner: &str, document_id: &str) -> IngestResult<Document> {
        let bytes = self
            .storage
            .download(&format!("{owner}/{document_id}/metadata.json"))
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn write_manifest(&self, document: &Document, manifest: &Manifest) -> IngestResult<String> {
        let text = canonical_json(manifest)?;
        let name = "manifest.json".to_string();
        self.storage
            .upload(&self.path(document, &name), text.as_bytes())
            .await?;
        Ok(name)
    }

    /// Lit et valide le manifest ; un major inconnu est refusé
    pub async fn read_manifest(&self, document: &Document) -> IngestResult<Manifest> {
        let bytes = self.storage.download(&self.path(document, "manifest.json")).await?;
        let manifest: Manifest = serde_json::from_slice(&bytes)?;
        check_manifest_version(&manifest.version)?;
        Ok(manifest)
    }

    pub async fn has_manifest(&self, document: &Document) -> bool {
        self.storage.exists(&self.path(document, "manifest.json")).await
    }
}

/// Refuse les manifests d'un major différent du notre
pub fn check_manifest_version(version: &str) -> IngestResult<()> {
    let ours = MANIFEST_VERSION.split('.').next().unwrap_or("0");
    let theirs = version.split('.').next().unwrap_or("");
    if theirs != ours {
        return Err(IngestError::ManifestVersion(version.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{ChunkerKind, SourceKind};
    use tempfile::TempDir;

    fn document(dir: &TempDir) -> Document {
        let mut doc = Document::new("user1", dir.path().join("source.md"), SourceKind::Markdown);
        doc.id = "doc_fixture".to_string();
        doc
    }

    fn sample_chunks() -> Vec<Chunk> {
        let mut chunk = Chunk::bare(0, "contenu".to_string(), 0, 7, 2, ChunkerKind::Recursive);
        chunk.embedding = Some(vec![0.1, 0.2]);
        chunk.enrichment.themes = vec!["thème".to_string()];
        vec![chunk]
    }

    #[tokio::test]
    async fn test_fs_storage_roundtrip() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::new(dir.path().to_path_buf());
        storage.upload("a/b/c.txt", b"bonjour").await.unwrap();
        assert!(storage.exists("a/b/c.txt").await);
        assert_eq!(storage.download("a/b/c.txt").await.unwrap(), b"bonjour");
        assert!(!storage.exists("a/b/d.txt").await);
    }

    #[tokio::test]
    async fn test_chunks_export_is_byte_stable() {
        let dir = TempDir::new().unwrap();
        let store = DocumentStore::new(Arc::new(FsStorage::new(dir.path().to_path_buf())));
        let doc = document(&dir);
        let chunks = sample_chunks();

        store.write_chunks(&doc, &chunks).await.unwrap();
        let first = store
            .storage()
            .download("user1/doc_fixture/chunks.json")
            .await
            .unwrap();

        // Ré-export : byte-à-byte identique
        let reread = store.read_chunks(&doc).await.unwrap();
        store.write_chunks(&doc, &reread).await.unwrap();
        let second = store
            .storage()
            .download("user1/doc_fixture/chunks.json")
            .await
            .unwrap();
        assert_eq!(first, second);

        // Pas d'embedding dans l'export ; LF et newline final
        let text = String::from_utf8(first).unwrap();
        assert!(!text.contains("embedding"));
        assert!(!text.contains('\r'));
        assert!(text.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_cached_chunks_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = DocumentStore::new(Arc::new(FsStorage::new(dir.path().to_path_buf())));
        let doc = document(&dir);

        let cached = CachedRawChunks {
            raw_chunks: vec![RawChunk {
                content: "brut".to_string(),
                page_start: Some(2),
                page_end: Some(3),
                heading_path: vec!["T".to_string()],
                bboxes: Vec::new(),
                char_span: (10, 14),
            }],
            extractor_version: "velin-model-extractor/0.1.0".to_string(),
            total_pages: 12,
            raw_stream_len: 5_000,
        };
        store.write_cached_chunks(&doc, &cached).await.unwrap();
        let back = store.read_cached_chunks(&doc).await.unwrap();
        assert_eq!(back.raw_chunks, cached.raw_chunks);
        assert_eq!(back.total_pages, 12);
        assert_eq!(back.raw_stream_len, 5_000);
    }

    #[tokio::test]
    async fn test_manifest_version_gate() {
        let dir = TempDir::new().unwrap();
        let store = DocumentStore::new(Arc::new(FsStorage::new(dir.path().to_path_buf())));
        let doc = document(&dir);

        let mut manifest = Manifest::new("x/1".to_string(), UnicodeForm::None);
        manifest.version = "2.0.0".to_string();
        store.write_manifest(&doc, &manifest).await.unwrap();

        let err = store.read_manifest(&doc).await.unwrap_err();
        assert!(matches!(err, IngestError::ManifestVersion(_)));

        manifest.version = MANIFEST_VERSION.to_string();
        store.write_manifest(&doc, &manifest).await.unwrap();
        assert!(store.read_manifest(&doc).await.is_ok());
    }

    #[test]
    fn test_canonical_json_sorted_keys() {
        #[derive(Serialize)]
        struct Unordered {
            zeta: u32,
            alpha: u32,
            milieu: u32,
        }
        let text = canonical_json(&Unordered { zeta: 1, alpha: 2, milieu: 3 }).unwrap();
        let a = text.find("alpha").unwrap();
        let m = text.find("milieu").unwrap();
        let z = text.find("zeta").unwrap();
        assert!(a < m && m < z);
    }
}
