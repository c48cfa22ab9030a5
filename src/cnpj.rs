//! Detección de CNPJ en el texto de los documentos y enriquecimiento con los
//! datos públicos del registro (API tipo ReceitaWS).
//!
//! Los registros se convierten en frases en portugués que se indexan como un
//! documento sintético más; la estructura original se descarta tras formatear.

use std::collections::BTreeSet;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

static CNPJ_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d{2}\.\d{3}\.\d{3}/\d{4}-\d{2}").expect("patrón CNPJ válido")
});

const UNKNOWN: &str = "desconhecido";
pub const RECORD_END: &str = "Fim dos dados desse CNPJ.";

/// Fallos del registro que no son un simple "no encontrado".
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("fallo de red consultando el registro: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("respuesta del registro ilegible: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Activity {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Partner {
    #[serde(default)]
    pub nome: Option<String>,
    #[serde(default)]
    pub qual: Option<String>,
}

/// Registro de empresa tal y como lo devuelve el servicio.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CompanyRecord {
    pub nome: Option<String>,
    pub fantasia: Option<String>,
    pub abertura: Option<String>,
    pub situacao: Option<String>,
    pub tipo: Option<String>,
    pub natureza_juridica: Option<String>,
    pub porte: Option<String>,
    pub atividade_principal: Vec<Activity>,
    pub atividades_secundarias: Vec<Activity>,
    pub qsa: Vec<Partner>,
    pub logradouro: Option<String>,
    pub numero: Option<String>,
    pub complemento: Option<String>,
    pub bairro: Option<String>,
    pub municipio: Option<String>,
    pub uf: Option<String>,
    pub cep: Option<String>,
    pub telefone: Option<String>,
    pub email: Option<String>,
    pub data_situacao: Option<String>,
    pub cnpj: Option<String>,
    pub ultima_atualizacao: Option<String>,
    pub status: Option<String>,
    pub capital_social: Option<String>,
}

/// Devuelve los CNPJ distintos (formato `DD.DDD.DDD/DDDD-DD`) presentes en el texto.
pub fn extract_identifiers(text: &str) -> BTreeSet<String> {
    CNPJ_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Elimina la puntuación del identificador: `11.222.333/0001-81` -> `11222333000181`.
pub fn digits_only(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !matches!(c, '.' | '/' | '-'))
        .collect()
}

/// Cliente HTTP del registro público de CNPJ.
#[derive(Debug, Clone)]
pub struct CnpjClient {
    http: reqwest::Client,
    base_url: String,
}

impl CnpjClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Consulta un CNPJ. `Ok(None)` significa "no encontrado" (HTTP no 2xx o
    /// `status == "ERROR"` en el cuerpo); los fallos de red son `Err`.
    pub async fn fetch_record(
        &self,
        identifier: &str,
    ) -> Result<Option<CompanyRecord>, RegistryError> {
        let url = format!("{}/v1/cnpj/{}", self.base_url, digits_only(identifier));
        debug!("Consultando registro CNPJ: {url}");

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            debug!("Registro respondió {} para {identifier}", response.status());
            return Ok(None);
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))?;
        if body.get("status").and_then(|s| s.as_str()) == Some("ERROR") {
            debug!("Registro sin datos para {identifier}: {body}");
            return Ok(None);
        }

        let record = serde_json::from_value(body).map_err(|e| RegistryError::Decode(e.to_string()))?;
        Ok(Some(record))
    }

    /// Resuelve cada identificador y lo convierte en líneas de prosa. Cualquier
    /// fallo para un identificador se registra y ese CNPJ se omite.
    pub async fn enrich<'a, I>(&self, identifiers: I) -> Vec<(String, Vec<String>)>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut records = Vec::new();
        for identifier in identifiers {
            match self.fetch_record(identifier).await {
                Ok(Some(record)) => {
                    info!("CNPJ {identifier} resuelto en el registro.");
                    records.push((identifier.clone(), format_record(&record)));
                }
                Ok(None) => warn!("CNPJ {identifier} no encontrado en el registro. Se omite."),
                Err(e) => warn!("No se pudo consultar el CNPJ {identifier}: {e}. Se omite."),
            }
        }
        records
    }
}

fn or_unknown(value: &Option<String>) -> &str {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => v,
        _ => UNKNOWN,
    }
}

fn lower_or_unknown(value: &Option<String>) -> String {
    or_unknown(value).to_lowercase()
}

/// Formatea un valor monetario con separador de miles y dos decimales (`1,234.50`).
fn format_money(value: f64) -> String {
    let fixed = format!("{:.2}", value.abs());
    let (int_part, frac_part) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    let sign = if value < 0.0 { "-" } else { "" };
    format!("{sign}{grouped}.{frac_part}")
}

/// Convierte un registro en frases legibles, en orden fijo.
pub fn format_record(info: &CompanyRecord) -> Vec<String> {
    let mut lines = Vec::new();

    lines.push(format!(
        "A empresa \"{}\" foi aberta em {} e está atualmente em situação {} como uma {}.",
        or_unknown(&info.nome),
        or_unknown(&info.abertura),
        lower_or_unknown(&info.situacao),
        lower_or_unknown(&info.tipo),
    ));
    lines.push(format!("Seu nome fantasia é {}.", or_unknown(&info.fantasia)));
    lines.push(format!(
        "A natureza jurídica da empresa é \"{}\" e seu porte é classificado como \"{}\".",
        or_unknown(&info.natureza_juridica),
        or_unknown(&info.porte),
    ));

    let main_activity = info.atividade_principal.first().cloned().unwrap_or_default();
    lines.push(format!(
        "A atividade principal da empresa é \"{}\" (código {}).",
        or_unknown(&main_activity.text),
        or_unknown(&main_activity.code),
    ));

    if !info.atividades_secundarias.is_empty() {
        lines.push(
            "Além da atividade principal, a empresa também exerce atividades secundárias, como:"
                .to_string(),
        );
        for activity in &info.atividades_secundarias {
            lines.push(format!(
                "\"{}\" (código {}).",
                or_unknown(&activity.text),
                or_unknown(&activity.code),
            ));
        }
    }

    if !info.qsa.is_empty() {
        lines.push("O quadro societário da empresa inclui os seguintes membros:".to_string());
        for partner in &info.qsa {
            lines.push(format!("{} ({})", or_unknown(&partner.nome), or_unknown(&partner.qual)));
        }
    }

    lines.push(format!(
        "A empresa está localizada na {}, número {}, {}, no bairro {}, município de {}, {}, CEP {}.",
        or_unknown(&info.logradouro),
        or_unknown(&info.numero),
        or_unknown(&info.complemento),
        or_unknown(&info.bairro),
        or_unknown(&info.municipio),
        or_unknown(&info.uf),
        or_unknown(&info.cep),
    ));
    lines.push(format!("O telefone para contato é {}.", or_unknown(&info.telefone)));
    lines.push(format!("O email para contato é {}.", or_unknown(&info.email)));
    lines.push(format!(
        "A situação da empresa foi estabelecida em {}, e o CNPJ é {}.",
        or_unknown(&info.data_situacao),
        or_unknown(&info.cnpj),
    ));
    lines.push(format!(
        "A última atualização dos dados foi em {}.",
        or_unknown(&info.ultima_atualizacao)
    ));
    lines.push(format!("O status da empresa é {}.", or_unknown(&info.status)));

    let capital = info
        .capital_social
        .as_deref()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .map(format_money)
        .unwrap_or_else(|| UNKNOWN.to_string());
    lines.push(format!("O capital social da empresa é de R$ {capital}."));
    lines.push(RECORD_END.to_string());

    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_payload() -> serde_json::Value {
        json!({
            "status": "OK",
            "nome": "EMPRESA EXEMPLO LTDA",
            "fantasia": "",
            "abertura": "01/02/2003",
            "situacao": "ATIVA",
            "tipo": "MATRIZ",
            "natureza_juridica": "206-2 - Sociedade Empresária Limitada",
            "porte": "DEMAIS",
            "atividade_principal": [{"code": "62.01-5-01", "text": "Desenvolvimento de programas"}],
            "atividades_secundarias": [
                {"code": "62.02-3-00", "text": "Consultoria em TI"},
                {"code": "63.11-9-00", "text": "Hospedagem na internet"}
            ],
            "qsa": [{"nome": "Maria Souza", "qual": "49-Sócio-Administrador"}],
            "logradouro": "RUA DAS FLORES",
            "numero": "100",
            "complemento": "",
            "bairro": "CENTRO",
            "municipio": "SAO PAULO",
            "uf": "SP",
            "cep": "01.001-000",
            "telefone": "(11) 5555-0000",
            "email": "contato@exemplo.com.br",
            "data_situacao": "01/02/2003",
            "cnpj": "11.222.333/0001-81",
            "ultima_atualizacao": "2024-01-01T00:00:00.000Z",
            "capital_social": "1234567.5"
        })
    }

    #[test]
    fn extracts_distinct_identifiers() {
        let found = extract_identifiers("empresa 12.345.678/0001-95 ativa");
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec!["12.345.678/0001-95"]);

        let text = "A 11.222.333/0001-81, B 11.222.333/0001-81 e C 99.888.777/0001-66; \
                    inválido 11222333000181 ou 1.222.333/0001-81";
        let found = extract_identifiers(text);
        assert_eq!(found.len(), 2);
        assert!(found.contains("11.222.333/0001-81"));
        assert!(found.contains("99.888.777/0001-66"));
    }

    #[test]
    fn extracts_nothing_from_plain_text() {
        assert!(extract_identifiers("sem identificadores aqui").is_empty());
    }

    #[test]
    fn strips_punctuation() {
        assert_eq!(digits_only("11.222.333/0001-81"), "11222333000181");
    }

    #[test]
    fn money_uses_thousands_separator_and_two_decimals() {
        assert_eq!(format_money(1234567.5), "1,234,567.50");
        assert_eq!(format_money(0.0), "0.00");
        assert_eq!(format_money(999.999), "1,000.00");
        assert_eq!(format_money(-1500.0), "-1,500.00");
    }

    #[test]
    fn formats_full_record() {
        let record: CompanyRecord = serde_json::from_value(sample_payload()).unwrap();
        let lines = format_record(&record);

        // 12 líneas fijas + (1 + 2) secundarias + (1 + 1) socios
        assert_eq!(lines.len(), 17);
        assert!(lines[0].contains("\"EMPRESA EXEMPLO LTDA\""));
        assert!(lines[0].contains("situação ativa como uma matriz"));
        assert_eq!(lines[1], "Seu nome fantasia é desconhecido.");
        assert!(lines[4].starts_with("Além da atividade principal"));
        assert_eq!(lines[8], "Maria Souza (49-Sócio-Administrador)");
        assert!(lines[9].contains(", desconhecido, no bairro CENTRO"));
        assert_eq!(lines[15], "O capital social da empresa é de R$ 1,234,567.50.");
        assert_eq!(lines.last().unwrap(), RECORD_END);
    }

    #[test]
    fn omits_empty_lists_but_not_scalars() {
        let record = CompanyRecord {
            nome: Some("ACME".into()),
            ..Default::default()
        };
        let lines = format_record(&record);

        assert_eq!(lines.len(), 12);
        assert!(lines.iter().all(|l| !l.contains("quadro societário")));
        assert!(lines.iter().all(|l| !l.contains("atividades secundárias")));
        assert_eq!(lines[3], "A atividade principal da empresa é \"desconhecido\" (código desconhecido).");
        assert_eq!(lines[10], "O capital social da empresa é de R$ desconhecido.");
        assert_eq!(lines[11], RECORD_END);
    }

    #[tokio::test]
    async fn fetches_record_with_digits_only_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/cnpj/11222333000181"))
            .respond_with(ResponseTemplate::new(200).set_body_json(sample_payload()))
            .expect(1)
            .mount(&server)
            .await;

        let client = CnpjClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let record = client.fetch_record("11.222.333/0001-81").await.unwrap().unwrap();
        assert_eq!(record.nome.as_deref(), Some("EMPRESA EXEMPLO LTDA"));
        assert_eq!(record.qsa.len(), 1);
    }

    #[tokio::test]
    async fn error_payload_and_http_failures_are_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/cnpj/00000000000000"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": "ERROR", "message": "CNPJ inválido"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/cnpj/99888777000166"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = CnpjClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        assert!(client.fetch_record("00.000.000/0000-00").await.unwrap().is_none());
        assert!(client.fetch_record("99.888.777/0001-66").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn network_failure_is_a_distinct_error() {
        // Puerto 1: conexión rechazada.
        let client = CnpjClient::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        let result = client.fetch_record("11.222.333/0001-81").await;
        assert!(matches!(result, Err(RegistryError::Transport(_))));
    }

    #[tokio::test]
    async fn enrich_skips_failed_identifiers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/cnpj/11222333000181"))
            .respond_with(ResponseTemplate::new(200).set_body_json(sample_payload()))
            .mount(&server)
            .await;

        let client = CnpjClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let ids = extract_identifiers("11.222.333/0001-81 e 99.888.777/0001-66");
        let records = client.enrich(&ids).await;

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "11.222.333/0001-81");
        assert_eq!(records[0].1.last().map(String::as_str), Some(RECORD_END));
    }
}
