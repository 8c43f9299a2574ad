use std::sync::Arc;

use tonic::{Request, Response, Status};

use hie_core::config::ProductionConfig;
use hie_core::production::Production;
use hie_core::types::HeaderRow as CoreHeaderRow;

#[allow(clippy::enum_variant_names)]
pub mod proto {
    tonic::include_proto!("production.v1");
}

use proto::production_control_server::ProductionControl;
use proto::*;

pub struct ProductionControlService {
    pub production: Arc<Production>,
}

fn production_err(e: anyhow::Error) -> Status {
    Status::internal(format!("{:#}", e))
}

fn header_row_to_proto(row: CoreHeaderRow) -> HeaderRow {
    HeaderRow {
        id: row.id.to_string(),
        sequence_num: row.sequence_num,
        project_id: row.project_id,
        session_id: row.session_id,
        parent_header_id: row.parent_header_id.map(|u| u.to_string()),
        corresponding_header_id: row.corresponding_header_id.map(|u| u.to_string()),
        super_session_id: row.super_session_id,
        source_config_name: row.source_config_name,
        target_config_name: row.target_config_name,
        source_business_type: format!("{:?}", row.source_business_type),
        target_business_type: format!("{:?}", row.target_business_type),
        message_type: row.message_type,
        body_class_name: row.body_class_name,
        message_body_id: row.message_body_id.map(|u| u.to_string()),
        leg_type: format!("{:?}", row.leg_type),
        invocation: format!("{:?}", row.invocation),
        leg_priority: format!("{:?}", row.leg_priority),
        status: format!("{:?}", row.status),
        is_error: row.is_error,
        error_status: row.error_status,
        time_created: row.time_created.to_rfc3339(),
        time_processed: row.time_processed.map(|t| t.to_rfc3339()),
        description: row.description,
    }
}

#[tonic::async_trait]
impl ProductionControl for ProductionControlService {
    async fn deploy(&self, request: Request<DeployRequest>) -> Result<Response<DeployResponse>, Status> {
        let req = request.into_inner();
        let cfg = ProductionConfig::from_yaml_str(&req.config_yaml)
            .map_err(|e| Status::invalid_argument(format!("invalid config: {e}")))?;
        self.production.deploy(cfg).await.map_err(production_err)?;
        Ok(Response::new(DeployResponse {}))
    }

    async fn start(&self, _request: Request<StartRequest>) -> Result<Response<StartResponse>, Status> {
        self.production.start().await.map_err(production_err)?;
        Ok(Response::new(StartResponse {}))
    }

    async fn stop(&self, _request: Request<StopRequest>) -> Result<Response<StopResponse>, Status> {
        self.production.stop().await.map_err(production_err)?;
        Ok(Response::new(StopResponse {}))
    }

    async fn reload(&self, request: Request<ReloadRequest>) -> Result<Response<ReloadResponse>, Status> {
        let req = request.into_inner();
        let cfg = ProductionConfig::from_yaml_str(&req.config_yaml)
            .map_err(|e| Status::invalid_argument(format!("invalid config: {e}")))?;
        self.production.reload(cfg).await.map_err(production_err)?;
        Ok(Response::new(ReloadResponse {}))
    }

    async fn scale_host(&self, request: Request<ScaleHostRequest>) -> Result<Response<ScaleHostResponse>, Status> {
        let req = request.into_inner();
        self.production
            .scale_host(&req.name, req.new_pool_size)
            .await
            .map_err(production_err)?;
        Ok(Response::new(ScaleHostResponse {}))
    }

    async fn pause_host(&self, request: Request<HostRequest>) -> Result<Response<HostResponse>, Status> {
        let req = request.into_inner();
        self.production.pause_host(&req.name).await.map_err(production_err)?;
        Ok(Response::new(HostResponse {}))
    }

    async fn resume_host(&self, request: Request<HostRequest>) -> Result<Response<HostResponse>, Status> {
        let req = request.into_inner();
        self.production.resume_host(&req.name).await.map_err(production_err)?;
        Ok(Response::new(HostResponse {}))
    }

    async fn restart_host(&self, request: Request<HostRequest>) -> Result<Response<HostResponse>, Status> {
        let req = request.into_inner();
        self.production.restart_host(&req.name).await.map_err(production_err)?;
        Ok(Response::new(HostResponse {}))
    }

    async fn status(&self, _request: Request<StatusRequest>) -> Result<Response<StatusResponse>, Status> {
        let hosts = self
            .production
            .status()
            .await
            .into_iter()
            .map(|s| HostStatus {
                name: s.name,
                kind: format!("{:?}", s.kind),
                state: format!("{:?}", s.state),
                pool_size: s.pool_size,
                queue_len: s.queue_len as u64,
                restart_count: s.restart_count,
            })
            .collect();
        Ok(Response::new(StatusResponse { hosts }))
    }

    type TraceForSessionStream = tokio_stream::wrappers::ReceiverStream<Result<HeaderRow, Status>>;

    async fn trace_for_session(
        &self,
        request: Request<TraceForSessionRequest>,
    ) -> Result<Response<Self::TraceForSessionStream>, Status> {
        let req = request.into_inner();
        let session_id = req.session_id;

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let production = self.production.clone();

        // Poll for rows past the last-seen sequence_num and push them until
        // the session's terminal header is observed or the client cancels.
        tokio::spawn(async move {
            let mut last_seq: Option<u64> = None;
            loop {
                let rows = match production.trace().trace_for_session(&session_id).await {
                    Ok(rows) => rows,
                    Err(_) => break,
                };

                let mut terminal = false;
                for row in rows {
                    if let Some(seen) = last_seq {
                        if row.sequence_num <= seen {
                            continue;
                        }
                    }
                    terminal = terminal || row.status.is_terminal();
                    last_seq = Some(row.sequence_num);
                    if tx.send(Ok(header_row_to_proto(row))).await.is_err() {
                        return;
                    }
                }

                if terminal {
                    break;
                }
                tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            }
        });

        Ok(Response::new(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }
}
