use std::sync::Arc;

use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use delivery_service::{
    config::Config,
    db, handlers, logging, metrics,
    store::{MemoryStore, PgStore, Store},
    AppState,
};
use tracing::{info, warn};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("failed to load configuration")?;
    logging::init_tracing(&config.app.log_format);

    info!(env = %config.app.env, "starting delivery-service");

    let store: Arc<dyn Store> = match config.database.url.as_deref() {
        Some(url) => {
            let pool = db::init_pool(&config.database, url)
                .await
                .context("failed to connect to database")?;
            db::run_migrations(&pool)
                .await
                .context("failed to run database migrations")?;
            info!("database migrations applied");
            Arc::new(PgStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory store, data is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let state = AppState::new(
        store,
        &config.auth.jwt_secret,
        config.websocket.clone(),
    );

    let addr = config.bind_addr();
    info!(%addr, "starting HTTP server");

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(middleware::Logger::default())
            .wrap(metrics::MetricsMiddleware)
            .route("/health", web::get().to(|| async { "OK" }))
            .route("/metrics", web::get().to(metrics::serve_metrics))
            .configure(handlers::configure)
    })
    .bind(&addr)
    .with_context(|| format!("failed to bind {}", addr))?
    .run()
    .await
    .context("HTTP server error")?;

    info!("delivery-service stopped");
    Ok(())
}
