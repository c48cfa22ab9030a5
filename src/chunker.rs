//! División de segmentos en ventanas solapadas de tamaño fijo.
//!
//! Las longitudes se miden en caracteres. Cada segmento se divide por separado:
//! se corta justo después del último salto de línea que cabe en la ventana y,
//! si no lo hay, se corta a la longitud máxima. Dos chunks consecutivos de un
//! mismo segmento comparten exactamente `overlap` caracteres.

use crate::models::{Chunk, TextSegment};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP)
    }
}

impl Chunker {
    /// `overlap` debe ser menor que `chunk_size`; se ajusta si no lo es.
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            overlap: overlap.min(chunk_size - 1),
        }
    }

    pub fn split(&self, segments: &[TextSegment]) -> Vec<Chunk> {
        segments
            .iter()
            .flat_map(|segment| self.split_segment(segment))
            .collect()
    }

    fn split_segment(&self, segment: &TextSegment) -> Vec<Chunk> {
        if segment.text.trim().is_empty() {
            return Vec::new();
        }

        let chars: Vec<char> = segment.text.chars().collect();
        let mut chunks = Vec::new();
        let mut start = 0usize;

        loop {
            let end = if chars.len() - start <= self.chunk_size {
                chars.len()
            } else {
                self.window_end(&chars, start)
            };

            chunks.push(Chunk {
                id: format!("{}:{}", segment.id, chunks.len()),
                text: chars[start..end].iter().collect(),
                source: segment.label(),
                segment_id: segment.id.clone(),
                start_index: start,
            });

            if end == chars.len() {
                break;
            }
            start = end - self.overlap;
        }

        chunks
    }

    /// Fin (exclusivo) de una ventana que no llega al final del texto.
    fn window_end(&self, chars: &[char], start: usize) -> usize {
        let hard_end = start + self.chunk_size;
        // El corte debe dejar avanzar la siguiente ventana: end > start + overlap.
        let earliest = start + self.overlap + 1;

        (earliest..=hard_end)
            .rev()
            .find(|&end| chars[end - 1] == '\n')
            .unwrap_or(hard_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SegmentPosition;

    fn segment(id: &str, text: &str) -> TextSegment {
        TextSegment {
            id: id.to_string(),
            text: text.to_string(),
            source: "contrato.pdf".to_string(),
            position: SegmentPosition::Whole,
        }
    }

    fn numbered_lines(count: usize) -> String {
        (0..count)
            .map(|i| format!("Cláusula {i:04}: o contratante declara ciência das condições."))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn assert_invariants(chunker: &Chunker, chunks: &[Chunk]) {
        for chunk in chunks {
            assert!(chunk.text.chars().count() <= chunker.chunk_size);
        }
        for pair in chunks.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if a.segment_id != b.segment_id {
                continue;
            }
            let a_chars: Vec<char> = a.text.chars().collect();
            let tail: String = a_chars[a_chars.len() - chunker.overlap..].iter().collect();
            let head: String = b.text.chars().take(chunker.overlap).collect();
            assert_eq!(tail, head);
            assert_eq!(b.start_index, a.start_index + a_chars.len() - chunker.overlap);
        }
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = Chunker::default().split(&[segment("s1", "texto curto")]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "texto curto");
        assert_eq!(chunks[0].start_index, 0);
        assert_eq!(chunks[0].source, "contrato.pdf");
    }

    #[test]
    fn blank_segments_produce_nothing() {
        let chunks = Chunker::default().split(&[segment("s1", "  \n\n "), segment("s2", "")]);
        assert!(chunks.is_empty());
    }

    #[test]
    fn prefers_newline_boundaries() {
        let chunker = Chunker::default();
        let text = numbered_lines(60);
        let chunks = chunker.split(&[segment("s1", &text)]);

        assert!(chunks.len() > 1);
        assert_invariants(&chunker, &chunks);
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.text.ends_with('\n'));
        }
        assert_eq!(chunks.last().unwrap().text.chars().last(), text.chars().last());
    }

    #[test]
    fn falls_back_to_hard_cuts_without_newlines() {
        let chunker = Chunker::default();
        let text = "ação".repeat(700);
        let chunks = chunker.split(&[segment("s1", &text)]);

        assert_invariants(&chunker, &chunks);
        assert_eq!(chunks[0].text.chars().count(), 1000);
        assert_eq!(chunks[1].start_index, 800);
        let covered = chunks.last().unwrap().start_index + chunks.last().unwrap().text.chars().count();
        assert_eq!(covered, text.chars().count());
    }

    #[test]
    fn newline_too_close_to_start_is_ignored() {
        let chunker = Chunker::new(10, 4);
        let text = "ab\ncdefghijklmnopqrstu";
        let chunks = chunker.split(&[segment("s1", text)]);

        assert_eq!(chunks[0].text, "ab\ncdefghi");
        assert_invariants(&chunker, &chunks);
    }

    #[test]
    fn split_is_deterministic_and_per_segment() {
        let chunker = Chunker::default();
        let segments = vec![
            segment("p1", &numbered_lines(40)),
            segment("p2", &"x".repeat(2500)),
        ];

        let first = chunker.split(&segments);
        let second = chunker.split(&segments);
        assert_eq!(first, second);
        assert_invariants(&chunker, &first);

        let p2: Vec<_> = first.iter().filter(|c| c.segment_id == "p2").collect();
        assert_eq!(p2[0].start_index, 0);
        assert_eq!(p2[0].id, "p2:0");
    }
}
