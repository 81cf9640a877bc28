use crate::core::BreakEvent;
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use katko_proto::protocol::{Command, DisplayState};
use katko_proto::state::StateManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<BreakEvent>,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<BreakEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(HttpState {
            state_manager,
            event_tx,
        });

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/start", post(start))
        .route("/api/reload", post(reload))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn get_state(State(state): State<HttpState>) -> Json<DisplayState> {
    Json(state.state_manager.get_state().await)
}

async fn start(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Start");
    forward(&state, Command::Start).await
}

async fn reload(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Reload");
    forward(&state, Command::Reload).await
}

async fn forward(state: &HttpState, cmd: Command) -> StatusCode {
    if state
        .event_tx
        .send(BreakEvent::ClientCommand(cmd))
        .await
        .is_err()
    {
        error!("Failed to forward command to the break core");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::ACCEPTED
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn(state: HttpState) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn state_and_commands() {
        let state_manager = Arc::new(StateManager::new());
        state_manager.set_slot(Some("1500".into())).await;
        let (event_tx, mut events) = mpsc::channel(4);
        let base = spawn(HttpState {
            state_manager,
            event_tx,
        })
        .await;
        let client = reqwest::Client::new();

        let state: DisplayState = client
            .get(format!("{base}/api/state"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(state.slot.as_deref(), Some("1500"));

        let resp = client.post(format!("{base}/api/start")).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 202);
        assert!(matches!(
            events.recv().await,
            Some(BreakEvent::ClientCommand(Command::Start))
        ));

        let resp = client.post(format!("{base}/api/reload")).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 202);
        assert!(matches!(
            events.recv().await,
            Some(BreakEvent::ClientCommand(Command::Reload))
        ));
    }
}
