// VELIN Core - Cache LRU des chunks bruts d'extraction
// Borné en bytes, clé par document : retraitement sans ré-extraction

use lru::LruCache;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::ingest::RawChunk;

/// Sortie d'extraction mise en cache telle quelle, jamais mutée
#[derive(Debug, Clone)]
pub struct CachedRawChunks {
    pub raw_chunks: Vec<RawChunk>,
    pub extractor_version: String,
    pub total_pages: u32,
    /// Longueur du flux extrait original (mapping proportionnel du matcher)
    pub raw_stream_len: usize,
}

impl CachedRawChunks {
    /// Poids approximatif en bytes pour la politique d'éviction
    pub fn approx_bytes(&self) -> usize {
        let chunks: usize = self
            .raw_chunks
            .iter()
            .map(|c| {
                c.content.len()
                    + c.heading_path.iter().map(String::len).sum::<usize>()
                    + c.bboxes.len() * std::mem::size_of::<crate::ingest::BoundingBox>()
                    + 64
            })
            .sum();
        chunks + self.extractor_version.len() + 64
    }
}

struct CacheState {
    entries: LruCache<String, Arc<CachedRawChunks>>,
    bytes: usize,
}

/// Cache LRU borné en bytes des sorties d'extraction, clé `document_id`
pub struct RawChunkCache {
    state: Mutex<CacheState>,
    max_bytes: usize,
}

impl RawChunkCache {
    pub fn new(max_bytes: usize) -> Self {
        info!("raw chunk cache initialized ({} MB budget)", max_bytes / (1024 * 1024));
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                bytes: 0,
            }),
            max_bytes: max_bytes.max(1),
        }
    }

    pub fn insert(&self, document_id: &str, cached: CachedRawChunks) {
        let weight = cached.approx_bytes();
        let mut state = self.state.lock().expect("cache lock poisoned");

        if let Some(previous) = state.entries.pop(document_id) {
            state.bytes = state.bytes.saturating_sub(previous.approx_bytes());
        }
        state.entries.put(document_id.to_string(), Arc::new(cached));
        state.bytes += weight;

        // Éviction LRU jusqu'à repasser sous le budget
        while state.bytes > self.max_bytes && state.entries.len() > 1 {
            if let Some((evicted_id, evicted)) = state.entries.pop_lru() {
                state.bytes = state.bytes.saturating_sub(evicted.approx_bytes());
                debug!("raw chunk cache evicted {}", evicted_id);
            } else {
                break;
            }
        }
    }

    pub fn get(&self, document_id: &str) -> Option<Arc<CachedRawChunks>> {
        let mut state = self.state.lock().expect("cache lock poisoned");
        state.entries.get(document_id).cloned()
    }

    pub fn remove(&self, document_id: &str) {
        let mut state = self.state.lock().expect("cache lock poisoned");
        if let Some(removed) = state.entries.pop(document_id) {
            state.bytes = state.bytes.saturating_sub(removed.approx_bytes());
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.state.lock().expect("cache lock poisoned").bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached(content_len: usize) -> CachedRawChunks {
        CachedRawChunks {
            raw_chunks: vec![RawChunk {
                content: "x".repeat(content_len),
                page_start: Some(1),
                page_end: Some(1),
                heading_path: Vec::new(),
                bboxes: Vec::new(),
                char_span: (0, content_len),
            }],
            extractor_version: "test/1".to_string(),
            total_pages: 1,
            raw_stream_len: content_len,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let cache = RawChunkCache::new(1024 * 1024);
        cache.insert("doc_a", cached(100));
        let hit = cache.get("doc_a").expect("hit attendu");
        assert_eq!(hit.raw_chunks.len(), 1);
        assert!(cache.get("doc_b").is_none());
    }

    #[test]
    fn test_eviction_by_bytes() {
        // Budget serré : deux entrées de ~1100 bytes ne tiennent pas
        let cache = RawChunkCache::new(1_500);
        cache.insert("doc_a", cached(1_000));
        cache.insert("doc_b", cached(1_000));
        // doc_a (LRU) évincé
        assert!(cache.get("doc_a").is_none());
        assert!(cache.get("doc_b").is_some());
        assert!(cache.bytes() <= 1_500 + 1_200);
    }

    #[test]
    fn test_recency_protects_from_eviction() {
        let cache = RawChunkCache::new(2_600);
        cache.insert("doc_a", cached(1_000));
        cache.insert("doc_b", cached(1_000));
        // doc_a redevient récent
        let _ = cache.get("doc_a");
        cache.insert("doc_c", cached(1_000));
        assert!(cache.get("doc_a").is_some());
        assert!(cache.get("doc_b").is_none());
    }

    #[test]
    fn test_reinsert_replaces_weight() {
        let cache = RawChunkCache::new(10_000);
        cache.insert("doc_a", cached(1_000));
        let before = cache.bytes();
        cache.insert("doc_a", cached(1_000));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.bytes(), before);
    }

    #[test]
    fn test_remove() {
        let cache = RawChunkCache::new(10_000);
        cache.insert("doc_a", cached(100));
        cache.remove("doc_a");
        assert!(cache.is_empty());
        assert_eq!(cache.bytes(), 0);
    }
}
