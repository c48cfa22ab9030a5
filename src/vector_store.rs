//! Índice vectorial en memoria para los chunks de una sesión.
//!
//! API pública:
//!   - `build_index(&dyn Embedder, Vec<Chunk>, batch_size)`
//!   - `VectorIndex::search(&[f64], usize)`
//!   - `VectorIndex::merge(..)` para el modo de índice único.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::models::Chunk;

/// Servicio remoto de embeddings: devuelve un vector por texto, en el mismo orden.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Vec<f64>>>;
}

/// Un chunk con su embedding. Inmutable una vez insertado.
#[derive(Debug, Clone)]
struct IndexedChunk {
    chunk: Chunk,
    vector: Vec<f64>,
}

/// Resultado de una búsqueda: similitud coseno y chunk recuperado.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub score: f64,
    pub chunk: Chunk,
}

#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    entries: Vec<IndexedChunk>,
    dimension: Option<usize>,
}

impl VectorIndex {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, chunk: Chunk, vector: Vec<f64>) -> Result<()> {
        match self.dimension {
            Some(dim) if dim != vector.len() => {
                return Err(anyhow!(
                    "Dimensión de embedding inconsistente: esperada {}, recibida {}",
                    dim,
                    vector.len()
                ));
            }
            None => self.dimension = Some(vector.len()),
            _ => {}
        }
        self.entries.push(IndexedChunk { chunk, vector });
        Ok(())
    }

    /// Búsqueda exacta de los `top_k` chunks más similares (coseno, descendente).
    /// A igual puntuación se conserva el orden de inserción.
    pub fn search(&self, query: &[f64], top_k: usize) -> Vec<ScoredChunk> {
        let mut scored: Vec<(f64, usize)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (cosine_similarity(query, &entry.vector), i))
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

        scored
            .into_iter()
            .take(top_k)
            .map(|(score, i)| ScoredChunk {
                score,
                chunk: self.entries[i].chunk.clone(),
            })
            .collect()
    }

    /// Une varios índices en uno solo, conservando el orden de entrada.
    pub fn merge(indices: impl IntoIterator<Item = VectorIndex>) -> Result<VectorIndex> {
        let mut merged = VectorIndex::default();
        for index in indices {
            for entry in index.entries {
                merged.insert(entry.chunk, entry.vector)?;
            }
        }
        Ok(merged)
    }
}

fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Calcula los embeddings de todos los chunks y construye un índice nuevo.
/// Si falla cualquier lote, falla la construcción completa.
pub async fn build_index(
    embedder: &dyn Embedder,
    chunks: Vec<Chunk>,
    batch_size: usize,
) -> Result<VectorIndex> {
    let mut index = VectorIndex::default();
    let total = chunks.len();

    for (batch_no, batch) in chunks.chunks(batch_size.max(1)).enumerate() {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = embedder.embed_texts(texts).await?;

        if vectors.len() != batch.len() {
            return Err(anyhow!(
                "Número de embeddings ({}) distinto al número de chunks ({})",
                vectors.len(),
                batch.len()
            ));
        }
        debug!("Lote de embeddings {} completado ({} chunks).", batch_no + 1, batch.len());

        for (chunk, vector) in batch.iter().cloned().zip(vectors) {
            index.insert(chunk, vector)?;
        }
    }

    info!("Índice vectorial construido con {total} chunks.");
    Ok(index)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embedder determinista para pruebas: cuenta apariciones de palabras clave.
    pub(crate) struct KeywordEmbedder {
        pub keywords: Vec<&'static str>,
        pub calls: AtomicUsize,
        pub fail_on_call: Option<usize>,
    }

    impl KeywordEmbedder {
        pub(crate) fn new(keywords: Vec<&'static str>) -> Self {
            Self {
                keywords,
                calls: AtomicUsize::new(0),
                fail_on_call: None,
            }
        }
    }

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Vec<f64>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on_call == Some(call) {
                return Err(anyhow!("servicio de embeddings no disponible"));
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let lower = t.to_lowercase();
                    let mut v: Vec<f64> = self
                        .keywords
                        .iter()
                        .map(|k| lower.matches(k).count() as f64)
                        .collect();
                    v.push(0.01);
                    v
                })
                .collect())
        }
    }

    pub(crate) fn chunk(id: &str, text: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            text: text.to_string(),
            source: "teste.txt".to_string(),
            segment_id: "seg".to_string(),
            start_index: 0,
        }
    }

    #[tokio::test]
    async fn search_returns_most_similar_first() {
        let embedder = KeywordEmbedder::new(vec!["aluguel", "multa", "prazo"]);
        let chunks = vec![
            chunk("a", "O prazo do contrato é de doze meses."),
            chunk("b", "A multa por atraso é de dez por cento; multa cumulativa."),
            chunk("c", "O aluguel vence todo dia cinco."),
        ];
        let index = build_index(&embedder, chunks, 2).await.unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);

        let query = embedder.embed_texts(vec!["qual a multa?".into()]).await.unwrap();
        let hits = index.search(&query[0], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.id, "b");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn failed_batch_fails_the_whole_build() {
        let mut embedder = KeywordEmbedder::new(vec!["x"]);
        embedder.fail_on_call = Some(2);
        let chunks = (0..5).map(|i| chunk(&i.to_string(), "x")).collect();

        assert!(build_index(&embedder, chunks, 2).await.is_err());
    }

    #[tokio::test]
    async fn merge_keeps_every_entry_and_checks_dimensions() {
        let embedder = KeywordEmbedder::new(vec!["x", "y"]);
        let a = build_index(&embedder, vec![chunk("a", "x")], 4).await.unwrap();
        let b = build_index(&embedder, vec![chunk("b", "y")], 4).await.unwrap();
        let merged = VectorIndex::merge([a, b]).unwrap();
        assert_eq!(merged.len(), 2);

        let other = KeywordEmbedder::new(vec!["x"]);
        let c = build_index(&other, vec![chunk("c", "x")], 4).await.unwrap();
        assert!(VectorIndex::merge([merged, c]).is_err());
    }

    #[test]
    fn cosine_handles_zero_vectors() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 1.0], &[2.0, 2.0]) - 1.0).abs() < 1e-9);
    }
}
