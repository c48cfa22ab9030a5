//! Respuesta aumentada por recuperación (RAG) sobre los índices de la sesión.
//!
//! Dos modos:
//!   1. Agente multi-herramienta: un paso de enrutado elige qué herramientas
//!      (una por documento) consultar y otro paso sintetiza la respuesta final.
//!   2. Conversacional con índice único: la pregunta se reformula con el
//!      historial, se recupera contra el índice combinado y se responde con la
//!      memoria de la conversación.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::llm::ChatModel;
use crate::models::ConversationTurn;
use crate::tools::ToolRegistry;
use crate::vector_store::{Embedder, VectorIndex};

pub const NO_CONTEXT_ANSWER: &str =
    "No se encontró información relevante en los documentos para responder a esta pregunta.";

const QA_PREAMBLE: &str = r#"
Eres un asistente jurídico experto en análisis de documentos.
Respondes de forma clara y concisa, en el mismo idioma en que se formula la pregunta.
Sólo puedes usar la información suministrada en el contexto y en el historial de la conversación.
Si el contexto no contiene la respuesta, di explícitamente que no la sabes.
"#;

const ROUTER_PREAMBLE: &str = r#"
Eres el enrutador de un asistente jurídico. Dispones de herramientas de consulta sobre documentos.
Decide qué herramientas hay que consultar para responder a la última pregunta del usuario,
teniendo en cuenta el historial de la conversación.
La salida DEBE ser una lista JSON con los nombres exactos de las herramientas, por ejemplo ["contratopdf"].
Si ninguna herramienta es necesaria, devuelve []. No incluyas explicaciones, solo el JSON.
"#;

const CONDENSE_PREAMBLE: &str = r#"
Dado el historial de la conversación y una pregunta de seguimiento, reformula la pregunta
para que se entienda por sí sola, en su idioma original.
Devuelve únicamente la pregunta reformulada.
"#;

/// Respuesta a una pregunta a partir del historial de la sesión.
#[async_trait]
pub trait Answerer: Send + Sync {
    async fn answer(&self, question: &str, history: &[ConversationTurn]) -> Result<String>;
}

/// Convierte el historial en texto para el contexto del modelo.
pub fn format_history(history: &[ConversationTurn]) -> String {
    history
        .iter()
        .map(|turn| format!("Usuario: {}\nAsistente: {}", turn.question, turn.answer))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Recupera los `top_k` chunks más cercanos a la pregunta y responde con ellos.
pub async fn retrieval_qa(
    embedder: &dyn Embedder,
    chat: &dyn ChatModel,
    index: &VectorIndex,
    question: &str,
    history: &str,
    top_k: usize,
) -> Result<String> {
    let query_vec = embedder
        .embed_texts(vec![question.to_string()])
        .await?
        .into_iter()
        .next()
        .context("No se pudo generar embedding de la pregunta")?;

    let hits = index.search(&query_vec, top_k);
    if hits.is_empty() {
        return Ok(NO_CONTEXT_ANSWER.to_string());
    }
    debug!(
        "Recuperados {} chunks (mejor puntuación {:.3}).",
        hits.len(),
        hits[0].score
    );

    let documents = hits
        .iter()
        .map(|hit| format!("[Fuente: {}]\n{}", hit.chunk.source, hit.chunk.text))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n");

    let context = if history.is_empty() {
        format!("**Información de Documentos:**\n{documents}")
    } else {
        format!("**Historial de la conversación:**\n{history}\n\n**Información de Documentos:**\n{documents}")
    };

    chat.complete(QA_PREAMBLE, &context, question).await
}

/// Nombres de herramientas elegidos por el enrutador, filtrados contra el registro.
///
/// Acepta una lista JSON (opcionalmente dentro de un bloque ```json) o un objeto
/// `{"tools": [...]}`. Si la respuesta no es JSON, se toman las herramientas
/// cuyo nombre aparece en el texto. El resultado sigue el orden del registro.
pub fn select_tools(response: &str, registry: &ToolRegistry) -> Vec<String> {
    let cleaned = response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let requested: Option<Vec<String>> = match serde_json::from_str::<serde_json::Value>(cleaned) {
        Ok(serde_json::Value::Array(items)) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        ),
        Ok(serde_json::Value::Object(map)) => map.get("tools").and_then(|v| v.as_array()).map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        }),
        _ => None,
    };

    match requested {
        Some(names) => registry
            .names()
            .into_iter()
            .filter(|name| names.iter().any(|n| n.trim() == name))
            .collect(),
        None => {
            warn!("Respuesta del enrutador no es JSON: '{response}'. Se buscan nombres en el texto.");
            registry
                .names()
                .into_iter()
                .filter(|name| cleaned.contains(name.as_str()))
                .collect()
        }
    }
}

/// Modo agente: una herramienta de recuperación por documento.
pub struct AgentAnswerer {
    registry: ToolRegistry,
    chat: Arc<dyn ChatModel>,
}

impl AgentAnswerer {
    pub fn new(registry: ToolRegistry, chat: Arc<dyn ChatModel>) -> Self {
        Self { registry, chat }
    }

    async fn route(&self, question: &str, history: &str) -> Result<Vec<String>> {
        if self.registry.is_empty() {
            return Ok(Vec::new());
        }

        let catalog = self
            .registry
            .iter()
            .map(|tool| format!("- {}: {}", tool.name(), tool.description()))
            .collect::<Vec<_>>()
            .join("\n");
        let context = if history.is_empty() {
            format!("Herramientas disponibles:\n{catalog}")
        } else {
            format!("Herramientas disponibles:\n{catalog}\n\nHistorial de la conversación:\n{history}")
        };

        let response = self.chat.complete(ROUTER_PREAMBLE, &context, question).await?;
        Ok(select_tools(&response, &self.registry))
    }
}

#[async_trait]
impl Answerer for AgentAnswerer {
    async fn answer(&self, question: &str, history: &[ConversationTurn]) -> Result<String> {
        let history_text = format_history(history);
        let selected = self.route(question, &history_text).await?;
        info!("Herramientas seleccionadas: {:?}", selected);

        let mut observations = Vec::new();
        for name in &selected {
            if let Some(tool) = self.registry.get(name) {
                let output = tool
                    .query(question)
                    .await
                    .with_context(|| format!("Error consultando la herramienta '{name}'"))?;
                observations.push(format!("Resultado de '{name}':\n{output}"));
            }
        }

        let mut context = String::new();
        if !history_text.is_empty() {
            context.push_str(&format!("**Historial de la conversación:**\n{history_text}\n\n"));
        }
        if !observations.is_empty() {
            context.push_str(&format!(
                "**Resultados de las herramientas:**\n{}",
                observations.join("\n\n")
            ));
        }

        self.chat.complete(QA_PREAMBLE, &context, question).await
    }
}

/// Modo conversacional: un único índice con todos los chunks de la sesión.
pub struct ConversationalAnswerer {
    index: VectorIndex,
    embedder: Arc<dyn Embedder>,
    chat: Arc<dyn ChatModel>,
    top_k: usize,
}

impl ConversationalAnswerer {
    pub fn new(
        index: VectorIndex,
        embedder: Arc<dyn Embedder>,
        chat: Arc<dyn ChatModel>,
        top_k: usize,
    ) -> Self {
        Self {
            index,
            embedder,
            chat,
            top_k,
        }
    }
}

#[async_trait]
impl Answerer for ConversationalAnswerer {
    async fn answer(&self, question: &str, history: &[ConversationTurn]) -> Result<String> {
        let history_text = format_history(history);

        let standalone = if history.is_empty() {
            question.to_string()
        } else {
            let condensed = self
                .chat
                .complete(CONDENSE_PREAMBLE, &history_text, question)
                .await?;
            let condensed = condensed.trim();
            if condensed.is_empty() {
                question.to_string()
            } else {
                debug!("Pregunta reformulada: {condensed}");
                condensed.to_string()
            }
        };

        retrieval_qa(
            self.embedder.as_ref(),
            self.chat.as_ref(),
            &self.index,
            &standalone,
            &history_text,
            self.top_k,
        )
        .await
    }
}
