//! Integration test: exercise a full production (§8.2 S1) end to end through
//! the `Production` facade — the same surface the gRPC handlers delegate to.
//!
//! Topology: `PAS-In` (HL7 MLLP service) -> `ADT_Router` (routing process,
//! fan-out to two targets) -> `EPR_Out`, `RIS_Out` (HL7 MLLP operations).
//! Both external peers are plain TCP listeners standing in for the HOSP/RIS
//! systems, each replying with `MSA|AA|0001`.

use std::sync::Arc;
use std::time::Duration;

use hie_core::config::ProductionConfig;
use hie_core::production::Production;
use hie_core::trace::MemoryTrace;
use hie_core::types::{BusinessType, HeaderRow, LegType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const START: u8 = 0x0B;
const END: u8 = 0x1C;
const CR: u8 = 0x0D;

const ADT_FRAME: &[u8] =
    b"MSH|^~\\&|PAS|HOSP|EPR|HOSP|20260213101500||ADT^A01|0001|P|2.4\rEVN||20260213101500\rPID|||NHS-1||SMITH^JOHN||19800101|M\r";

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 3);
    out.push(START);
    out.extend_from_slice(payload);
    out.push(END);
    out.push(CR);
    out
}

async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.unwrap();
        if byte[0] == START {
            break;
        }
    }
    let mut payload = Vec::new();
    loop {
        stream.read_exact(&mut byte).await.unwrap();
        if byte[0] == END {
            stream.read_exact(&mut byte).await.unwrap();
            assert_eq!(byte[0], CR);
            return payload;
        }
        payload.push(byte[0]);
    }
}

/// Stand-in external peer: accepts one connection, reads one frame, replies
/// with a fixed ACK.
async fn spawn_ack_peer(port: u16, control_id: &'static str) {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _received = read_frame(&mut stream).await;
        let ack = format!("MSH|^~\\&|EPR|HOSP|PAS|HOSP|20260213101501||ACK^A01|{control_id}|P|2.4\rMSA|AA|{control_id}\r");
        stream.write_all(&frame(ack.as_bytes())).await.unwrap();
    });
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}

fn yaml_config(project_id: &str, pas_port: u16, epr_port: u16, ris_port: u16) -> String {
    format!(
        r#"
project_id: {project_id}
items:
  - name: PAS-In
    class_name: engine.hl7.Service
    target_config_names: [ADT_Router]
    adapter:
      kind: mllp_inbound
      port: {pas_port}
      stay_connected: 0
    host:
      kind: hl_service
      message_schema_category: hl7
      ack_mode: Immediate
  - name: ADT_Router
    class_name: engine.routing.Process
    target_config_names: [EPR_Out, RIS_Out]
    host:
      kind: routing_process
  - name: EPR_Out
    class_name: engine.hl7.Operation
    adapter:
      kind: mllp_outbound
      ip_address: 127.0.0.1
      port: {epr_port}
      reconnect_retry: 0
      stay_connected: 0
    host:
      kind: hl_operation
      reply_code_actions: "AA=C,*=S"
  - name: RIS_Out
    class_name: engine.hl7.Operation
    adapter:
      kind: mllp_outbound
      ip_address: 127.0.0.1
      port: {ris_port}
      reconnect_retry: 0
      stay_connected: 0
    host:
      kind: hl_operation
      reply_code_actions: "AA=C,*=S"
"#
    )
}

/// Find the one row among `rows` matching a source/target/type/parent
/// combination, panicking with the full set for debugging if it's missing or
/// ambiguous -- the S1 table names exactly one such leg per row.
fn find_leg<'a>(
    rows: &'a [HeaderRow],
    source: &str,
    target: &str,
    leg_type: LegType,
    parent: Option<uuid::Uuid>,
) -> &'a HeaderRow {
    let matches: Vec<&HeaderRow> = rows
        .iter()
        .filter(|r| {
            r.source_config_name == source
                && r.target_config_name == target
                && r.leg_type == leg_type
                && r.parent_header_id == parent
        })
        .collect();
    assert_eq!(
        matches.len(),
        1,
        "expected exactly one {source} -> {target} {leg_type:?} leg (parent {parent:?}) among {rows:#?}"
    );
    matches[0]
}

#[tokio::test]
async fn s1_hl7_fan_out_produces_seven_headers_and_one_ack() {
    let pas_port = free_port().await;
    let epr_port = free_port().await;
    let ris_port = free_port().await;

    spawn_ack_peer(epr_port, "0001").await;
    spawn_ack_peer(ris_port, "0001").await;
    // Give the peer listeners a moment to bind before the production starts.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let trace = Arc::new(MemoryTrace::new());
    let production = Arc::new(Production::new("HOSP-PROD".into(), trace.clone()));

    let cfg = ProductionConfig::from_yaml_str(&yaml_config("HOSP-PROD", pas_port, epr_port, ris_port)).unwrap();
    production.deploy(cfg).await.unwrap();
    production.start().await.unwrap();

    // Give the MLLP inbound listener a moment to bind before connecting.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect(("127.0.0.1", pas_port)).await.unwrap();
    client.write_all(&frame(ADT_FRAME)).await.unwrap();
    let ack = read_frame(&mut client).await;
    let ack_text = String::from_utf8(ack).unwrap();
    assert!(ack_text.contains("MSA|AA|0001"));

    // Let the async fan-out and both outbound round trips settle.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let statuses = production.status().await;
    assert_eq!(statuses.len(), 4);

    let all_rows = trace.all_headers();
    let session_id = all_rows.first().expect("at least one header recorded").session_id.clone();
    let rows = trace.trace_for_session(&session_id).await.unwrap();
    assert_eq!(rows.len(), 7, "S1 expects 7 trace rows, got {rows:#?}");

    let epr_peer = format!("127.0.0.1:{epr_port}");
    let ris_peer = format!("127.0.0.1:{ris_port}");

    let leg1 = find_leg(&rows, "PAS-In", "ADT_Router", LegType::Request, None);
    assert_eq!(leg1.source_business_type, BusinessType::Service);
    assert_eq!(leg1.target_business_type, BusinessType::Process);

    let leg2 = find_leg(&rows, "ADT_Router", "EPR_Out", LegType::Request, Some(leg1.id));
    let leg3 = find_leg(&rows, "ADT_Router", "RIS_Out", LegType::Request, Some(leg1.id));

    let leg4 = find_leg(&rows, "EPR_Out", &epr_peer, LegType::Request, Some(leg2.id));
    assert_eq!(leg4.target_business_type, BusinessType::External);
    let leg5 = find_leg(&rows, &epr_peer, "EPR_Out", LegType::Response, Some(leg4.id));
    assert_eq!(leg5.corresponding_header_id, Some(leg4.id));

    let leg6 = find_leg(&rows, "RIS_Out", &ris_peer, LegType::Request, Some(leg3.id));
    assert_eq!(leg6.target_business_type, BusinessType::External);
    let leg7 = find_leg(&rows, &ris_peer, "RIS_Out", LegType::Response, Some(leg6.id));
    assert_eq!(leg7.corresponding_header_id, Some(leg6.id));

    production.stop().await.unwrap();
}

#[tokio::test]
async fn status_reports_all_deployed_hosts_before_start() {
    let pas_port = free_port().await;
    let epr_port = free_port().await;
    let ris_port = free_port().await;

    let trace = Arc::new(MemoryTrace::new());
    let production = Arc::new(Production::new("HOSP-PROD".into(), trace));
    let cfg = ProductionConfig::from_yaml_str(&yaml_config("HOSP-PROD", pas_port, epr_port, ris_port)).unwrap();
    production.deploy(cfg).await.unwrap();

    let statuses = production.status().await;
    assert_eq!(statuses.len(), 4);
    assert!(statuses.iter().any(|s| s.name == "PAS-In"));
    assert!(statuses.iter().any(|s| s.name == "ADT_Router"));
    assert!(statuses.iter().any(|s| s.name == "EPR_Out"));
    assert!(statuses.iter().any(|s| s.name == "RIS_Out"));
}
