//! Carga y gestión de configuración de la aplicación (LLM, registro CNPJ y RAG).

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use url::Url;

#[derive(Clone, Debug)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
    Ollama,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            other => Err(anyhow!("Proveedor LLM no soportado: {other}")),
        }
    }
}

/// Modo de respuesta de la sesión.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerMode {
    /// Un índice y una herramienta por documento; un agente elige cuáles consultar.
    Agent,
    /// Un único índice combinado con memoria conversacional.
    Conversational,
}

impl AnswerMode {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "agent" | "agente" => Ok(Self::Agent),
            "conversational" | "conversacional" => Ok(Self::Conversational),
            other => Err(anyhow!("Modo de respuesta no soportado: {other}")),
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,

    pub llm_provider: LlmProvider,
    pub llm_embedding_model: String,
    pub llm_chat_model: String,

    pub answer_mode: AnswerMode,
    pub retrieval_top_k: usize,
    pub embedding_batch_size: usize,

    pub cnpj_registry_url: String,
    pub cnpj_timeout_secs: u64,

    /// Directorio bajo el que se crean los directorios temporales de carga.
    pub scratch_dir: PathBuf,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3322".to_string());

        let llm_provider_str =
            env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let llm_provider = LlmProvider::from_str(&llm_provider_str)?;

        let llm_embedding_model = env::var("LLM_EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let llm_chat_model =
            env::var("LLM_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let answer_mode_str = env::var("ANSWER_MODE").unwrap_or_else(|_| "agent".to_string());
        let answer_mode = AnswerMode::from_str(&answer_mode_str)?;

        let retrieval_top_k = parse_var("RETRIEVAL_TOP_K", 4usize)?;
        let embedding_batch_size = parse_var("EMBEDDING_BATCH_SIZE", 16usize)?;
        if retrieval_top_k == 0 || embedding_batch_size == 0 {
            return Err(anyhow!(
                "RETRIEVAL_TOP_K y EMBEDDING_BATCH_SIZE deben ser mayores que cero"
            ));
        }

        let cnpj_registry_url = env::var("CNPJ_REGISTRY_URL")
            .unwrap_or_else(|_| "https://www.receitaws.com.br".to_string());
        Url::parse(&cnpj_registry_url)
            .map_err(|e| anyhow!("CNPJ_REGISTRY_URL inválida ({cnpj_registry_url}): {e}"))?;
        let cnpj_timeout_secs = parse_var("CNPJ_TIMEOUT_SECS", 20u64)?;

        let scratch_dir = env::var("SCRATCH_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::temp_dir());

        Ok(Self {
            server_addr,
            llm_provider,
            llm_embedding_model,
            llm_chat_model,
            answer_mode,
            retrieval_top_k,
            embedding_batch_size,
            cnpj_registry_url: cnpj_registry_url.trim_end_matches('/').to_string(),
            cnpj_timeout_secs,
            scratch_dir,
        })
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Valor inválido para {name} ('{raw}'): {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answer_mode_accepts_both_languages() {
        assert_eq!(AnswerMode::from_str("Agent").unwrap(), AnswerMode::Agent);
        assert_eq!(
            AnswerMode::from_str("conversacional").unwrap(),
            AnswerMode::Conversational
        );
        assert!(AnswerMode::from_str("batch").is_err());
    }

    #[test]
    fn provider_rejects_unknown_names() {
        assert!(matches!(LlmProvider::from_str("OPENAI").unwrap(), LlmProvider::OpenAI));
        assert!(LlmProvider::from_str("azure").is_err());
    }
}
