use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use crate::{config::AppConfig, session::{Session, SessionPhase}};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    // Una sola sesión por proceso; una acción a la vez.
    pub session: Arc<tokio::sync::Mutex<Session>>,
    pub status: Arc<Mutex<Status>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub is_busy: bool,
    pub message: String,
    pub progress: f32, // Valor entre 0.0 y 1.0
    pub phase: SessionPhase,
}

/// Marca el estado como ocupado mientras vive. Si se suelta sin `finish`
/// (petición cancelada a mitad) libera el indicador igualmente.
pub struct BusyGuard {
    status: Arc<Mutex<Status>>,
    finished: bool,
}

impl BusyGuard {
    pub fn start(status: &Arc<Mutex<Status>>, message: impl Into<String>) -> Self {
        if let Ok(mut current) = status.lock() {
            current.is_busy = true;
            current.message = message.into();
            current.progress = 0.0;
        }
        Self {
            status: status.clone(),
            finished: false,
        }
    }

    pub fn finish(mut self, message: impl Into<String>) {
        self.release(message.into());
        self.finished = true;
    }

    fn release(&self, message: String) {
        if let Ok(mut current) = self.status.lock() {
            current.is_busy = false;
            current.message = message;
        }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.release("Operación cancelada.".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_guard_keeps_its_message() {
        let status = Arc::new(Mutex::new(Status::default()));
        let guard = BusyGuard::start(&status, "Procesando...");
        assert!(status.lock().unwrap().is_busy);

        guard.finish("Listo.");
        let current = status.lock().unwrap();
        assert!(!current.is_busy);
        assert_eq!(current.message, "Listo.");
    }

    #[tokio::test]
    async fn dropped_request_releases_busy_flag() {
        let status = Arc::new(Mutex::new(Status::default()));
        let handler = {
            let status = status.clone();
            async move {
                let _busy = BusyGuard::start(&status, "Pensando...");
                std::future::pending::<()>().await;
            }
        };

        let outcome =
            tokio::time::timeout(std::time::Duration::from_millis(50), handler).await;
        assert!(outcome.is_err());
        let current = status.lock().unwrap();
        assert!(!current.is_busy);
        assert_eq!(current.message, "Operación cancelada.");
    }
}
