//! Carga de ficheros subidos y conversión a segmentos de texto normalizados.
//!
//! PDF y hojas de cálculo se decodifican desde un directorio temporal propio de
//! cada llamada; el directorio se elimina al salir, tanto si la carga funciona
//! como si falla.

use std::fs;
use std::path::{Path, PathBuf};

use calamine::Reader;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{SegmentPosition, TextSegment, UploadedFile};

/// Tipos de origen soportados, resueltos a partir de la extensión.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Pdf,
    Excel,
    Text,
    Json,
    Unsupported(String),
}

impl SourceKind {
    pub fn from_extension(extension: &str) -> Self {
        match extension.to_lowercase().as_str() {
            "pdf" => Self::Pdf,
            "xlsx" | "xls" | "xlsm" | "ods" => Self::Excel,
            "txt" | "md" | "csv" => Self::Text,
            "json" => Self::Json,
            other => Self::Unsupported(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("extensión no soportada: '.{0}'")]
    Unsupported(String),
    #[error("no se pudo extraer texto del PDF: {0}")]
    Pdf(String),
    #[error("no se pudo leer la hoja de cálculo: {0}")]
    Excel(String),
    #[error("el fichero no es UTF-8 válido: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
    #[error("JSON inválido: {0}")]
    Json(#[from] serde_json::Error),
    #[error("error de E/S en el directorio temporal: {0}")]
    Io(#[from] std::io::Error),
}

/// Cargador de documentos. Los directorios temporales se crean bajo `scratch_root`.
#[derive(Debug, Clone)]
pub struct Loader {
    scratch_root: PathBuf,
}

impl Loader {
    pub fn new(scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: scratch_root.into(),
        }
    }

    /// Convierte un fichero en segmentos de texto según su extensión.
    pub fn load(&self, file: &UploadedFile) -> Result<Vec<TextSegment>, LoadError> {
        let segments = match SourceKind::from_extension(&file.extension()) {
            SourceKind::Pdf => self.load_pdf(file)?,
            SourceKind::Excel => self.load_excel(file)?,
            SourceKind::Text => {
                let text = String::from_utf8(file.content.clone())?;
                vec![whole_segment(&file.name, text)]
            }
            SourceKind::Json => {
                let value: serde_json::Value = serde_json::from_slice(&file.content)?;
                // serde_json no escapa los caracteres no ASCII.
                let text = serde_json::to_string_pretty(&value)?;
                vec![whole_segment(&file.name, text)]
            }
            SourceKind::Unsupported(ext) => return Err(LoadError::Unsupported(ext)),
        };

        info!("Cargado '{}': {} segmentos.", file.name, segments.len());
        Ok(segments)
    }

    /// Escribe las líneas como documento de texto sintético y lo vuelve a cargar.
    pub fn load_lines(&self, name: &str, lines: &[String]) -> Result<Vec<TextSegment>, LoadError> {
        let scratch = self.scratch()?;
        let path = scratch.path().join("dados_receita_federal.txt");
        fs::write(&path, lines.join("\n"))?;

        let text = fs::read_to_string(&path)?;
        scratch.close()?;
        Ok(vec![whole_segment(name, text)])
    }

    fn scratch(&self) -> Result<TempDir, LoadError> {
        fs::create_dir_all(&self.scratch_root)?;
        let dir = tempfile::Builder::new()
            .prefix("carga-")
            .tempdir_in(&self.scratch_root)?;
        debug!("Directorio temporal creado: {}", dir.path().display());
        Ok(dir)
    }

    fn write_scratch_file(scratch: &TempDir, file: &UploadedFile) -> Result<PathBuf, LoadError> {
        // Nombre fijo: el original puede contener separadores de ruta.
        let path = scratch.path().join(format!("documento.{}", file.extension()));
        fs::write(&path, &file.content)?;
        Ok(path)
    }

    fn load_pdf(&self, file: &UploadedFile) -> Result<Vec<TextSegment>, LoadError> {
        let scratch = self.scratch()?;
        let path = Self::write_scratch_file(&scratch, file)?;

        let pages = extract_pdf_pages(&path)?;
        scratch.close()?;

        Ok(pages
            .into_iter()
            .enumerate()
            .map(|(i, text)| TextSegment {
                id: Uuid::new_v4().to_string(),
                text,
                source: file.name.clone(),
                position: SegmentPosition::Page {
                    number: i as u32 + 1,
                },
            })
            .collect())
    }

    fn load_excel(&self, file: &UploadedFile) -> Result<Vec<TextSegment>, LoadError> {
        let scratch = self.scratch()?;
        let path = Self::write_scratch_file(&scratch, file)?;

        let mut workbook =
            calamine::open_workbook_auto(&path).map_err(|e| LoadError::Excel(e.to_string()))?;

        let mut segments = Vec::new();
        for (i, sheet_name) in workbook.sheet_names().to_vec().into_iter().enumerate() {
            let range = workbook
                .worksheet_range(&sheet_name)
                .map_err(|e| LoadError::Excel(e.to_string()))?;

            let rows: Vec<String> = range
                .rows()
                .map(|row| row.iter().map(cell_text).collect::<Vec<_>>())
                .filter(|cells| !cells.iter().all(|c| c.is_empty()))
                .map(|cells| cells.join(" | "))
                .collect();

            if rows.is_empty() {
                debug!("Hoja '{sheet_name}' vacía en '{}'.", file.name);
                continue;
            }

            segments.push(TextSegment {
                id: Uuid::new_v4().to_string(),
                text: rows.join("\n"),
                source: file.name.clone(),
                position: SegmentPosition::Sheet {
                    name: sheet_name,
                    number: i as u32 + 1,
                },
            });
        }

        drop(workbook);
        scratch.close()?;
        Ok(segments)
    }
}

fn whole_segment(source: &str, text: String) -> TextSegment {
    TextSegment {
        id: Uuid::new_v4().to_string(),
        text,
        source: source.to_string(),
        position: SegmentPosition::Whole,
    }
}

/// pdf-extract puede abortar con ciertos PDFs mal formados; se trata como error de carga.
fn extract_pdf_pages(path: &Path) -> Result<Vec<String>, LoadError> {
    match std::panic::catch_unwind(|| pdf_extract::extract_text_by_pages(path)) {
        Ok(Ok(pages)) => Ok(pages),
        Ok(Err(e)) => Err(LoadError::Pdf(e.to_string())),
        Err(_) => Err(LoadError::Pdf("el extractor abortó al procesar el fichero".to_string())),
    }
}

fn cell_text(cell: &calamine::Data) -> String {
    match cell {
        calamine::Data::Empty => String::new(),
        calamine::Data::String(s) => s.trim().to_string(),
        calamine::Data::Float(f) => f.to_string(),
        calamine::Data::Int(i) => i.to_string(),
        calamine::Data::Bool(b) => b.to_string(),
        calamine::Data::DateTime(dt) => dt.to_string(),
        calamine::Data::DateTimeIso(s) | calamine::Data::DurationIso(s) => s.clone(),
        _ => String::new(),
    }
}
