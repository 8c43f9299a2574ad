use std::sync::Arc;

use hie_core::production::Production;
use hie_core::trace::MemoryTrace;
use hie_core::trace::Trace;
use hie_server::grpc::proto::production_control_server::ProductionControlServer;
use hie_server::grpc::ProductionControlService;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let addr = "0.0.0.0:50051".parse()?;

    let project_id = std::env::var("HIE_PROJECT_ID").unwrap_or_else(|_| "DEFAULT".to_string());
    let database_url = parse_database_url();

    let trace: Arc<dyn Trace> = match database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL...");
            let pool = sqlx::PgPool::connect(&url).await?;
            let pg = hie_core::trace::PostgresTrace::new(pool);
            pg.migrate().await?;
            tracing::info!("Using PostgresTrace (migrations applied)");
            Arc::new(pg)
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!(
                "--database-url / DATABASE_URL set but postgres feature not enabled, using MemoryTrace"
            );
            Arc::new(MemoryTrace::new())
        }
        None => {
            tracing::info!("Using MemoryTrace (no database URL configured)");
            Arc::new(MemoryTrace::new())
        }
    };

    let production = Arc::new(Production::new(project_id, trace));

    tracing::info!("HIE control-plane gRPC server listening on {}", addr);

    let service = ProductionControlService { production };

    Server::builder()
        .add_service(ProductionControlServer::new(service))
        .serve(addr)
        .await?;

    Ok(())
}

/// Parse database URL from `--database-url <url>` CLI arg or `DATABASE_URL` env var.
fn parse_database_url() -> Option<String> {
    // CLI arg takes precedence
    let args: Vec<String> = std::env::args().collect();
    if let Some(url) = args
        .windows(2)
        .find(|w| w[0] == "--database-url")
        .map(|w| w[1].clone())
    {
        return Some(url);
    }
    // Fall back to env var
    std::env::var("DATABASE_URL").ok()
}
