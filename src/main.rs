mod api;
mod auth;
mod config;
mod db;
mod error;
mod import;
mod models;
mod study;


use anyhow::Context;
use std::sync::Arc;

use api::{app_router, ApiState};
use auth::Auth;
use config::Config;
use db::Db;
use study::{SessionStore, StudyService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Missing .env is fine; real environment variables still apply.
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env()?;

    let db = Db::connect(&config.database_url)
        .await
        .with_context(|| format!("opening database {}", config.database_url))?;
    log::info!("Database ready at {}", config.database_url);

    let state = ApiState {
        db: db.clone(),
        auth: Auth::new(db.clone(), config.allowed_users.clone()),
        study: Arc::new(StudyService::new(db, SessionStore::new())),
        config: Arc::new(config.clone()),
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    log::info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app_router(state)).await?;

    Ok(())
}
