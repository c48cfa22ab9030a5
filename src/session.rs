//! Controlador de sesión: subida → procesado → preguntas.
//!
//! Ciclo de vida: `NoConversation -> Ready` tras un procesado correcto,
//! `Ready -> Answering -> Ready` durante cada pregunta y vuelta a
//! `NoConversation` al reiniciar la sesión.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    app_state::Status,
    chunker::Chunker,
    cnpj::{self, CnpjClient},
    config::{AnswerMode, AppConfig},
    llm::ChatModel,
    loader::Loader,
    models::{ConversationTurn, UploadedFile},
    rag::{AgentAnswerer, Answerer, ConversationalAnswerer},
    tools::{self, RetrievalTool, ToolRegistry},
    vector_store::{self, Embedder, VectorIndex},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    NoConversation,
    Ready,
    Answering,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Primero debe subir y procesar los documentos.")]
    NotReady,
    #[error("Hay otra operación en curso. Espere a que termine.")]
    Busy,
    #[error("No hay documentos subidos para procesar.")]
    NoFiles,
    #[error("La pregunta está vacía.")]
    EmptyQuestion,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    pub name: String,
    pub reason: String,
}

/// Resumen de un procesado.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSummary {
    pub mode: AnswerMode,
    pub files_processed: usize,
    pub files_skipped: Vec<SkippedFile>,
    pub chunks_indexed: usize,
    pub identifiers_found: Vec<String>,
    pub identifiers_resolved: Vec<String>,
    pub tools: Vec<String>,
}

impl std::fmt::Display for ProcessSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Resumen: {} ficheros procesados, {} omitidos, {} chunks indexados, {} de {} CNPJ resueltos.",
            self.files_processed,
            self.files_skipped.len(),
            self.chunks_indexed,
            self.identifiers_resolved.len(),
            self.identifiers_found.len()
        )
    }
}

/// Índice construido para un documento (o para los datos de CNPJ).
struct IndexedSource {
    name: String,
    description: String,
    index: VectorIndex,
}

/// Contexto explícito de una sesión de usuario.
pub struct Session {
    embedder: Arc<dyn Embedder>,
    chat: Arc<dyn ChatModel>,
    registry_client: CnpjClient,
    loader: Loader,
    chunker: Chunker,
    mode: AnswerMode,
    top_k: usize,
    batch_size: usize,
    status: Arc<Mutex<Status>>,

    files: Vec<UploadedFile>,
    phase: SessionPhase,
    answerer: Option<Arc<dyn Answerer>>,
    tool_names: Vec<String>,
    history: Vec<ConversationTurn>,
}

impl Session {
    pub fn from_config(
        cfg: &AppConfig,
        embedder: Arc<dyn Embedder>,
        chat: Arc<dyn ChatModel>,
        status: Arc<Mutex<Status>>,
    ) -> anyhow::Result<Self> {
        let registry_client = CnpjClient::new(
            &cfg.cnpj_registry_url,
            Duration::from_secs(cfg.cnpj_timeout_secs),
        )?;

        Ok(Self {
            embedder,
            chat,
            registry_client,
            loader: Loader::new(&cfg.scratch_dir),
            chunker: Chunker::default(),
            mode: cfg.answer_mode,
            top_k: cfg.retrieval_top_k,
            batch_size: cfg.embedding_batch_size,
            status,
            files: Vec::new(),
            phase: SessionPhase::NoConversation,
            answerer: None,
            tool_names: Vec::new(),
            history: Vec::new(),
        })
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    pub fn tool_names(&self) -> &[String] {
        &self.tool_names
    }

    pub fn file_names(&self) -> Vec<String> {
        self.files.iter().map(|f| f.name.clone()).collect()
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        self.phase = phase;
        publish_phase(&self.status, phase);
    }

    fn report(&self, message: String, progress: f32) {
        let mut status = self.status.lock().unwrap();
        status.message = message;
        status.progress = progress;
    }

    /// Añade ficheros a la sesión. Un fichero con el mismo nombre sustituye al anterior.
    pub fn upload(&mut self, files: Vec<UploadedFile>) -> Vec<String> {
        for file in files {
            info!("Fichero subido: {} ({} bytes)", file.name, file.content.len());
            self.files.retain(|f| f.name != file.name);
            self.files.push(file);
        }
        self.file_names()
    }

    /// Vacía la sesión: ficheros, herramientas y conversación.
    pub fn reset(&mut self) {
        self.files.clear();
        self.answerer = None;
        self.tool_names.clear();
        self.history.clear();
        self.set_phase(SessionPhase::NoConversation);
        info!("Sesión reiniciada.");
    }

    /// Procesa todos los ficheros subidos y deja la sesión lista para preguntar.
    /// Si falla la construcción de algún índice no se modifica el estado previo.
    pub async fn process(&mut self) -> Result<ProcessSummary, SessionError> {
        if self.phase == SessionPhase::Answering {
            return Err(SessionError::Busy);
        }
        if self.files.is_empty() {
            return Err(SessionError::NoFiles);
        }

        let total = self.files.len();
        let mut sources = Vec::new();
        let mut skipped = Vec::new();
        let mut identifiers = BTreeSet::new();
        let mut chunks_indexed = 0usize;

        for (i, file) in self.files.iter().enumerate() {
            self.report(
                format!("[{}/{}] Procesando: {}...", i + 1, total, file.name),
                i as f32 / total as f32,
            );

            let segments = match self.loader.load(file) {
                Ok(segments) => segments,
                Err(e) => {
                    warn!("Saltando '{}': {}", file.name, e);
                    skipped.push(SkippedFile {
                        name: file.name.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            // Por segmento (página u hoja): un CNPJ no puede formarse uniendo dos páginas.
            for segment in &segments {
                identifiers.extend(cnpj::extract_identifiers(&segment.text));
            }

            let chunks = self.chunker.split(&segments);
            if chunks.is_empty() {
                warn!("Fichero vacío o sin texto útil: {}", file.name);
                skipped.push(SkippedFile {
                    name: file.name.clone(),
                    reason: "sin texto extraíble".to_string(),
                });
                continue;
            }
            chunks_indexed += chunks.len();

            let index = vector_store::build_index(self.embedder.as_ref(), chunks, self.batch_size)
                .await
                .with_context(|| format!("Error indexando '{}'", file.name))
                .inspect_err(|e| error!("{e:#}"))?;

            sources.push(IndexedSource {
                name: file.name.clone(),
                description: tools::describe_document(&file.name),
                index,
            });
        }

        self.report(
            format!("Consultando {} CNPJ en el registro...", identifiers.len()),
            0.9,
        );
        let records = self.registry_client.enrich(&identifiers).await;
        let resolved: Vec<String> = records.iter().map(|(id, _)| id.clone()).collect();

        if !records.is_empty() {
            let mut segments = Vec::new();
            for (identifier, lines) in &records {
                let name = format!("dados_receita_federal_{}.txt", cnpj::digits_only(identifier));
                segments.extend(
                    self.loader
                        .load_lines(&name, lines)
                        .context("Error generando el documento de CNPJ")?,
                );
            }
            let chunks = self.chunker.split(&segments);
            chunks_indexed += chunks.len();

            let index = vector_store::build_index(self.embedder.as_ref(), chunks, self.batch_size)
                .await
                .context("Error indexando los datos de CNPJ")
                .inspect_err(|e| error!("{e:#}"))?;

            sources.push(IndexedSource {
                name: tools::CNPJ_TOOL_NAME.to_string(),
                description: tools::CNPJ_TOOL_DESCRIPTION.to_string(),
                index,
            });
        }

        let (answerer, tool_names) = self.build_answerer(sources)?;

        self.answerer = Some(answerer);
        self.tool_names = tool_names.clone();
        self.history.clear();
        self.set_phase(SessionPhase::Ready);

        let summary = ProcessSummary {
            mode: self.mode,
            files_processed: total - skipped.len(),
            files_skipped: skipped,
            chunks_indexed,
            identifiers_found: identifiers.into_iter().collect(),
            identifiers_resolved: resolved,
            tools: tool_names,
        };
        info!("{summary}");
        Ok(summary)
    }

    fn build_answerer(
        &self,
        sources: Vec<IndexedSource>,
    ) -> anyhow::Result<(Arc<dyn Answerer>, Vec<String>)> {
        match self.mode {
            AnswerMode::Agent => {
                let mut registry = ToolRegistry::default();
                for source in sources {
                    let base = if source.name == tools::CNPJ_TOOL_NAME {
                        source.name.clone()
                    } else {
                        tools::sanitize_tool_name(&source.name)
                    };
                    let name = registry.unique_name(&base);
                    if name != base {
                        warn!("Nombre de herramienta '{base}' repetido; se usa '{name}'.");
                    }
                    registry.register(Arc::new(RetrievalTool::new(
                        name,
                        source.description,
                        source.index,
                        self.embedder.clone(),
                        self.chat.clone(),
                        self.top_k,
                    )))?;
                }
                let names = registry.names();
                Ok((Arc::new(AgentAnswerer::new(registry, self.chat.clone())), names))
            }
            AnswerMode::Conversational => {
                let index = VectorIndex::merge(sources.into_iter().map(|s| s.index))?;
                info!("Índice combinado con {} chunks.", index.len());
                let answerer = ConversationalAnswerer::new(
                    index,
                    self.embedder.clone(),
                    self.chat.clone(),
                    self.top_k,
                );
                Ok((Arc::new(answerer), Vec::new()))
            }
        }
    }

    /// Responde una pregunta y la añade al historial.
    pub async fn ask(&mut self, question: &str) -> Result<ConversationTurn, SessionError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(SessionError::EmptyQuestion);
        }
        match self.phase {
            SessionPhase::NoConversation => return Err(SessionError::NotReady),
            SessionPhase::Answering => return Err(SessionError::Busy),
            SessionPhase::Ready => {}
        }
        let answerer = self.answerer.clone().ok_or(SessionError::NotReady)?;

        let answering = AnsweringGuard::enter(&mut self.phase, &self.status);
        let result = answerer.answer(question, &self.history).await;
        drop(answering);

        let answer = result.inspect_err(|e| error!("Error respondiendo: {e:#}"))?;
        let turn = ConversationTurn {
            question: question.to_string(),
            answer,
            asked_at: Utc::now(),
        };
        self.history.push(turn.clone());
        Ok(turn)
    }
}

fn publish_phase(status: &Mutex<Status>, phase: SessionPhase) {
    if let Ok(mut status) = status.lock() {
        status.phase = phase;
    }
}

/// Mantiene la sesión en `Answering` mientras vive. Al soltarse vuelve a `Ready`,
/// también cuando se cancela el futuro de `ask` a mitad de la respuesta.
struct AnsweringGuard<'a> {
    phase: &'a mut SessionPhase,
    status: &'a Mutex<Status>,
}

impl<'a> AnsweringGuard<'a> {
    fn enter(phase: &'a mut SessionPhase, status: &'a Mutex<Status>) -> Self {
        *phase = SessionPhase::Answering;
        publish_phase(status, SessionPhase::Answering);
        Self { phase, status }
    }
}

impl Drop for AnsweringGuard<'_> {
    fn drop(&mut self) {
        *self.phase = SessionPhase::Ready;
        publish_phase(self.status, SessionPhase::Ready);
    }
}
