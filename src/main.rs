// Módulos de la aplicación
mod api;
mod app_state;
mod chunker;
mod cnpj;
mod config;
mod llm;
mod loader;
mod models;
mod rag;
mod session;
mod tools;
mod vector_store;

use crate::app_state::{AppState, Status};
use crate::session::Session;
use axum::Router;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env().expect("Error al cargar la configuración");
    info!(
        "Modo de respuesta: {:?}. Registro CNPJ: {}",
        cfg.answer_mode, cfg.cnpj_registry_url
    );

    // 3. Inicializar gestor de LLMs (embeddings + chat)
    let llm_manager =
        Arc::new(llm::LlmManager::from_config(&cfg).expect("Error inicializando LLM Manager"));

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 4. Crear la sesión y el estado compartido de la aplicación
    let status = Arc::new(Mutex::new(Status {
        is_busy: false,
        message: "Servidor listo. Suba sus documentos.".to_string(),
        ..Status::default()
    }));
    let session = Session::from_config(&cfg, llm_manager.clone(), llm_manager, status.clone())
        .expect("Error inicializando la sesión");

    let app_state = AppState {
        config: cfg.clone(),
        session: Arc::new(tokio::sync::Mutex::new(session)),
        status,
        shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
    };

    // 5. Configurar el router de la API y el servicio de ficheros estáticos
    let app = Router::new()
        .merge(api::create_router(app_state.clone()))
        .fallback_service(ServeDir::new("frontend"))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 6. Iniciar el servidor
    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr)
        .await
        .expect("No se pudo abrir el puerto del servidor");
    let server_url = format!("http://{}", server_addr);
    info!("🚀 Servidor escuchando en {}", &server_url);

    // Abrir el frontend en el navegador por defecto
    if webbrowser::open(&server_url).is_err() {
        info!("No se pudo abrir el navegador. Por favor, accede a {} manualmente.", server_url);
    }

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await
        .expect("Error en el servidor HTTP");

    info!("✅ Servidor cerrado correctamente.");
}
