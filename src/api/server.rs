// API server implementation using actix-web

use crate::api::sessions::SessionStore;
use crate::api::{auth, middleware, routes};
use crate::database_ops::catalog::CatalogStore;
use crate::database_ops::db::Db;
use crate::database_ops::exchange::ExchangeService;
use crate::database_ops::media_store::ImageStore;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use std::env;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Shared handler state. Collaborators sit behind traits so tests can swap them out.
pub struct AppState {
    pub db: Option<Db>,
    pub catalog: Arc<dyn CatalogStore>,
    pub images: Arc<dyn ImageStore>,
    pub exchange: ExchangeService,
    pub started: Instant,
    sessions: Mutex<SessionStore>,
}

impl AppState {
    pub fn new(
        db: Option<Db>,
        catalog: Arc<dyn CatalogStore>,
        images: Arc<dyn ImageStore>,
        exchange: ExchangeService,
    ) -> Self {
        Self {
            db,
            catalog,
            images,
            exchange,
            started: Instant::now(),
            sessions: Mutex::new(SessionStore::default()),
        }
    }

    /// Override how long previews are kept and how many are held at once.
    pub fn with_session_limits(self, ttl: Duration, max: usize) -> Self {
        Self {
            sessions: Mutex::new(SessionStore::new(ttl, max)),
            ..self
        }
    }

    pub(crate) fn sessions(&self) -> MutexGuard<'_, SessionStore> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct ApiServer {
    pub host: String,
    pub port: u16,
    pub api_secret: String,
    pub allowed_origins: String,
}

impl ApiServer {
    /// Create server from environment variables
    pub fn from_env() -> Result<Self> {
        crate::util::env::init_env();

        let host = env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("API_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .context("Invalid API_PORT")?;

        let api_secret =
            env::var("API_SECRET").context("API_SECRET environment variable is required")?;

        let allowed_origins =
            env::var("ALLOWED_ORIGINS").unwrap_or_else(|_| "http://localhost:3000".to_string());

        Ok(Self {
            host,
            port,
            api_secret,
            allowed_origins,
        })
    }

    /// Start the HTTP server
    pub async fn run(self, state: AppState) -> Result<()> {
        let bind_addr = format!("{}:{}", self.host, self.port);

        tracing::info!(
            host = %self.host,
            port = %self.port,
            "Starting storefront admin API server"
        );

        let state = web::Data::new(state);
        let api_secret = self.api_secret.clone();
        let allowed_origins = self.allowed_origins.clone();

        HttpServer::new(move || {
            let (logger, compress) = middleware::setup_middleware();
            let cors = middleware::setup_cors(&allowed_origins);
            let auth = auth::Auth::new(api_secret.clone());

            App::new()
                .app_data(state.clone())
                .app_data(middleware::csv_payload_limit())
                // last wrap runs first: CORS answers preflights before auth sees them
                .wrap(auth)
                .wrap(compress)
                .wrap(cors)
                .wrap(logger)
                .configure(routes::configure_routes)
        })
        .bind(&bind_addr)
        .with_context(|| format!("Failed to bind to {}", bind_addr))?
        .run()
        .await
        .context("HTTP server error")?;

        Ok(())
    }
}
