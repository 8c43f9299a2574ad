//! Dev helper: `cargo xtask <command>`. Only `migrate` is implemented
//! since there's nothing else to automate yet.

use anyhow::{bail, Context};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let command = std::env::args().nth(1).unwrap_or_default();
    match command.as_str() {
        "migrate" => migrate().await,
        "" => bail!("usage: cargo xtask <migrate>"),
        other => bail!("unknown xtask command `{other}` (expected: migrate)"),
    }
}

/// Runs `hie-core/migrations` against `DATABASE_URL`, the same schema
/// `hie-server` applies itself on startup -- useful for provisioning a
/// database ahead of time, or in a CI step that checks migrations apply
/// cleanly.
async fn migrate() -> anyhow::Result<()> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set to run migrations")?;
    let pool = sqlx::PgPool::connect(&database_url).await?;
    sqlx::migrate!("../hie-core/migrations").run(&pool).await?;
    tracing::info!("migrations applied");
    Ok(())
}
