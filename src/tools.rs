//! Herramientas de recuperación: cada documento indexado se expone como un
//! objeto con nombre, descripción y una operación `query`.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::llm::ChatModel;
use crate::rag;
use crate::vector_store::{Embedder, VectorIndex};

static INVALID_NAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_-]").expect("patrón de nombre válido"));

/// Límite de longitud de nombre de función de la API de chat.
const MAX_TOOL_NAME_LEN: usize = 64;

pub const CNPJ_TOOL_NAME: &str = "CNPJ_receita_federal_database";
pub const CNPJ_TOOL_DESCRIPTION: &str =
    "useful when you want to answer questions about the CNPJ Receita Federal database";

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    async fn query(&self, question: &str) -> Result<String>;
}

/// Deja sólo `[A-Za-z0-9_-]` del nombre de fichero: `Contrato Social.pdf` -> `ContratoSocialpdf`.
pub fn sanitize_tool_name(file_name: &str) -> String {
    let mut name = INVALID_NAME_CHARS.replace_all(file_name, "").into_owned();
    name.truncate(MAX_TOOL_NAME_LEN);
    if name.is_empty() {
        "documento".to_string()
    } else {
        name
    }
}

pub fn describe_document(file_name: &str) -> String {
    format!("useful when you want to answer questions about {file_name}")
}

/// Índice de un documento + pregunta/respuesta sobre él.
pub struct RetrievalTool {
    name: String,
    description: String,
    index: VectorIndex,
    embedder: Arc<dyn Embedder>,
    chat: Arc<dyn ChatModel>,
    top_k: usize,
}

impl RetrievalTool {
    pub fn new(
        name: String,
        description: String,
        index: VectorIndex,
        embedder: Arc<dyn Embedder>,
        chat: Arc<dyn ChatModel>,
        top_k: usize,
    ) -> Self {
        Self {
            name,
            description,
            index,
            embedder,
            chat,
            top_k,
        }
    }
}

#[async_trait]
impl Tool for RetrievalTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn query(&self, question: &str) -> Result<String> {
        rag::retrieval_qa(
            self.embedder.as_ref(),
            self.chat.as_ref(),
            &self.index,
            question,
            "",
            self.top_k,
        )
        .await
    }
}

/// Colección ordenada de herramientas, indexada por nombre.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Tool>> {
        self.tools.iter()
    }

    /// Nombre libre a partir de `base`, añadiendo `_2`, `_3`... si ya está en uso.
    pub fn unique_name(&self, base: &str) -> String {
        if self.get(base).is_none() {
            return base.to_string();
        }
        (2..)
            .map(|n| {
                let suffix = format!("_{n}");
                let mut name = base.to_string();
                name.truncate(MAX_TOOL_NAME_LEN.saturating_sub(suffix.len()));
                name + &suffix
            })
            .find(|candidate| self.get(candidate).is_none())
            .unwrap_or_else(|| base.to_string())
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        if self.get(tool.name()).is_some() {
            return Err(anyhow!("Ya existe una herramienta llamada '{}'", tool.name()));
        }
        self.tools.push(tool);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct StaticTool {
        pub name: String,
        pub reply: String,
    }

    #[async_trait]
    impl Tool for StaticTool {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "herramienta de prueba"
        }

        async fn query(&self, _question: &str) -> Result<String> {
            Ok(self.reply.clone())
        }
    }

    pub(crate) fn static_tool(name: &str, reply: &str) -> Arc<dyn Tool> {
        Arc::new(StaticTool {
            name: name.to_string(),
            reply: reply.to_string(),
        })
    }

    #[test]
    fn sanitizes_file_names() {
        assert_eq!(sanitize_tool_name("Contrato Social (v2).pdf"), "ContratoSocialv2pdf");
        assert_eq!(sanitize_tool_name("relatório_2024-final.xlsx"), "relatrio_2024-finalxlsx");
        assert_eq!(sanitize_tool_name("ção.ñ"), "documento");
        assert_eq!(sanitize_tool_name(&"a".repeat(100)).len(), 64);
    }

    #[test]
    fn registry_rejects_duplicates_and_suggests_free_names() {
        let mut registry = ToolRegistry::default();
        registry.register(static_tool("contratopdf", "a")).unwrap();
        assert!(registry.register(static_tool("contratopdf", "b")).is_err());

        assert_eq!(registry.unique_name("outropdf"), "outropdf");
        assert_eq!(registry.unique_name("contratopdf"), "contratopdf_2");
        registry.register(static_tool("contratopdf_2", "b")).unwrap();
        assert_eq!(registry.unique_name("contratopdf"), "contratopdf_3");
        assert_eq!(registry.names(), vec!["contratopdf", "contratopdf_2"]);
    }

    #[test]
    fn unique_name_respects_length_limit() {
        let mut registry = ToolRegistry::default();
        let long = "b".repeat(64);
        registry.register(static_tool(&long, "x")).unwrap();
        let name = registry.unique_name(&long);
        assert_eq!(name.len(), 64);
        assert!(name.ends_with("_2"));
    }
}
