//! Abstracción sobre Rig para trabajar con distintos proveedores de LLM.
//! De momento se implementa OpenAI; Gemini/Ollama quedan preparados para el futuro.
//!
//! El resto de la aplicación sólo ve los traits `Embedder` y `ChatModel`.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rig::completion::Prompt;
use rig::embeddings::EmbeddingModel; // <- para .embed_texts
use tracing::debug;

use crate::config::{AppConfig, LlmProvider};
use crate::vector_store::Embedder;

/// Servicio remoto de chat: instrucciones de sistema + contexto + mensaje del usuario.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, preamble: &str, context: &str, prompt: &str) -> Result<String>;
}

/// Gestor de LLMs y embeddings.
#[derive(Debug, Clone)]
pub struct LlmManager {
    pub provider: LlmProvider,
    pub embedding_model: String,
    pub chat_model: String,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        Ok(Self {
            provider: cfg.llm_provider.clone(),
            embedding_model: cfg.llm_embedding_model.clone(),
            chat_model: cfg.llm_chat_model.clone(),
        })
    }

    // `openai::Client::from_env` aborta si falta la clave; se comprueba antes.
    fn ensure_openai_key() -> Result<()> {
        match std::env::var("OPENAI_API_KEY") {
            Ok(key) if !key.trim().is_empty() => Ok(()),
            _ => Err(anyhow!("Falta OPENAI_API_KEY en el entorno")),
        }
    }

    // ---------------------------------------------------------------------
    // EMBEDDINGS
    // ---------------------------------------------------------------------

    async fn embed_with_openai(&self, texts: Vec<String>) -> Result<Vec<Vec<f64>>> {
        use rig::providers::openai::{self, TEXT_EMBEDDING_3_SMALL};
        // Trait para client.embedding_model(...)
        use rig::client::EmbeddingsClient as _;

        Self::ensure_openai_key()?;
        let client = openai::Client::from_env();

        // Modelo de embeddings: config o default
        let model_name = if self.embedding_model.is_empty() {
            TEXT_EMBEDDING_3_SMALL
        } else {
            self.embedding_model.as_str()
        };
        let embedding_model = client.embedding_model(model_name);

        let expected = texts.len();
        let embeddings = embedding_model.embed_texts(texts).await?;
        if embeddings.len() != expected {
            return Err(anyhow!(
                "Número de embeddings ({}) distinto al número de textos ({})",
                embeddings.len(),
                expected
            ));
        }

        Ok(embeddings.into_iter().map(|e| e.vec).collect())
    }

    // ---------------------------------------------------------------------
    // CHAT / COMPLETION
    // ---------------------------------------------------------------------

    async fn complete_with_openai(
        &self,
        preamble: &str,
        context: &str,
        prompt: &str,
    ) -> Result<String> {
        use rig::providers::openai;
        // Trait para client.agent(...)
        use rig::client::CompletionClient as _;

        Self::ensure_openai_key()?;
        let client = openai::Client::from_env();

        // Modelo de chat por defecto si no se ha configurado otro
        let model_name = if self.chat_model.is_empty() {
            "gpt-4o-mini"
        } else {
            self.chat_model.as_str()
        };

        let mut builder = client.agent(model_name).preamble(preamble);
        if !context.trim().is_empty() {
            builder = builder.context(context);
        }
        let agent = builder.build();

        let answer = agent.prompt(prompt).await?;
        debug!("Respuesta del modelo de chat ({} caracteres).", answer.len());
        Ok(answer)
    }
}

#[async_trait]
impl Embedder for LlmManager {
    async fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Vec<f64>>> {
        match self.provider {
            LlmProvider::OpenAI => self.embed_with_openai(texts).await,
            ref other => Err(anyhow!(
                "Proveedor LLM {:?} aún no implementado para embeddings",
                other
            )),
        }
    }
}

#[async_trait]
impl ChatModel for LlmManager {
    async fn complete(&self, preamble: &str, context: &str, prompt: &str) -> Result<String> {
        match self.provider {
            LlmProvider::OpenAI => self.complete_with_openai(preamble, context, prompt).await,
            ref other => Err(anyhow!(
                "Proveedor LLM {:?} aún no implementado para chat",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unimplemented_providers_fail_cleanly() {
        let manager = LlmManager {
            provider: LlmProvider::Ollama,
            embedding_model: String::new(),
            chat_model: String::new(),
        };
        assert!(manager.embed_texts(vec!["hola".into()]).await.is_err());
        assert!(manager.complete("p", "", "hola").await.is_err());
    }
}
