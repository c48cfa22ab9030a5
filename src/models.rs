//! Modelos de dominio: ficheros subidos, segmentos de texto, chunks y turnos
//! de conversación.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Fichero recibido desde el frontend. Sólo vive mientras se procesa la sesión.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub content: Vec<u8>,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Extensión declarada en el nombre, en minúsculas y sin el punto.
    pub fn extension(&self) -> String {
        match self.name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => ext.to_lowercase(),
            _ => String::new(),
        }
    }
}

/// Posición de un segmento dentro de su fichero de origen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SegmentPosition {
    Whole,
    Page { number: u32 },
    Sheet { name: String, number: u32 },
}

/// Trozo de texto normalizado producido por el cargador.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSegment {
    pub id: String,
    pub text: String,
    pub source: String,
    pub position: SegmentPosition,
}

impl TextSegment {
    /// Referencia legible al origen, usada para citar fuentes.
    pub fn label(&self) -> String {
        match &self.position {
            SegmentPosition::Whole => self.source.clone(),
            SegmentPosition::Page { number } => format!("{}, página {}", self.source, number),
            SegmentPosition::Sheet { name, .. } => format!("{}, hoja '{}'", self.source, name),
        }
    }
}

/// Ventana de texto acotada, preparada para calcular su embedding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub source: String,
    pub segment_id: String,
    /// Offset (en caracteres) del inicio de la ventana dentro del segmento.
    pub start_index: usize,
}

/// Un turno pregunta/respuesta de la conversación.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub question: String,
    pub answer: String,
    pub asked_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_is_lowercase_and_requires_a_stem() {
        assert_eq!(UploadedFile::new("Contrato.PDF", vec![]).extension(), "pdf");
        assert_eq!(UploadedFile::new("dados.tar.json", vec![]).extension(), "json");
        assert_eq!(UploadedFile::new(".env", vec![]).extension(), "");
        assert_eq!(UploadedFile::new("LEIAME", vec![]).extension(), "");
    }

    #[test]
    fn labels_cite_page_or_sheet() {
        let mut segment = TextSegment {
            id: "s".into(),
            text: "x".into(),
            source: "balanco.xlsx".into(),
            position: SegmentPosition::Sheet { name: "2024".into(), number: 1 },
        };
        assert_eq!(segment.label(), "balanco.xlsx, hoja '2024'");

        segment.position = SegmentPosition::Page { number: 3 };
        assert_eq!(segment.label(), "balanco.xlsx, página 3");
    }
}
