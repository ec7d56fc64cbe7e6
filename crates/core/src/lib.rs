pub mod admission;
pub mod api;
pub mod app_state;
pub mod audit;
pub mod config;
pub mod email_change;
pub mod error;
pub mod exchange;
pub mod gate;
pub mod identity;
pub mod mailer;
pub mod rate_limit;
pub mod store;

pub use app_state::AppState;
pub use config::Config;
pub use error::GateError;

use tracing::info;

/// Build the application state and serve the API until the process exits.
pub async fn run(config: Config) {
    let state = AppState::new(&config).expect("Failed to initialize application state");
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.listen_on_port))
        .await
        .expect("Failed to bind listen port");
    info!(port = config.listen_on_port, "Memory gate listening");

    axum::serve(listener, app).await.expect("Server error");
}
