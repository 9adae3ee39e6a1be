//! Unix-socket control surface
//!
//! Newline-delimited JSON between the running engine and control commands.
//! One request per line; every request gets one response line, except
//! `events`, which streams until the client hangs up. `quit` only queues an
//! exit request; the engine still gates it.

use crate::blocker::{LayerReport, LayerStatus};
use crate::engine::{ExitRequest, ExitSource, FocusEngine};
use crate::error::{FocusError, Result};
use crate::events::EngineEvent;
use crate::hosts::MutationOutcome;
use crate::layers::LayerAction;
use crate::state::{parse_time_of_day, EnforcementState, SessionPhase};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};

/// Request from a control command to the running engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum IpcRequest {
    Status,
    Start {
        from: String,
        until: String,
        difficulty: u8,
    },
    Stop,
    Block,
    Unblock,
    Events,
    Quit,
}

/// Response from the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    Status {
        state: EnforcementState,
        phase: SessionPhase,
    },
    Report {
        action: String,
        resource: String,
        layers: Vec<LayerRow>,
    },
    Ok,
    Error {
        msg: String,
    },
    Event {
        event: EngineEvent,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRow {
    pub layer: String,
    pub status: String,
    pub detail: Option<String>,
}

impl From<&LayerReport> for IpcResponse {
    fn from(report: &LayerReport) -> Self {
        let action = match report.action {
            LayerAction::Enforce => "enforce",
            LayerAction::Lift => "lift",
        };
        let resource = match &report.resource {
            Ok(MutationOutcome::Applied) => "applied".to_string(),
            Ok(MutationOutcome::Removed) => "removed".to_string(),
            Ok(MutationOutcome::NoOp) => "unchanged".to_string(),
            Err(e) => format!("failed: {e}"),
        };
        let layers = report
            .layers
            .iter()
            .map(|outcome| {
                let (status, detail) = match &outcome.status {
                    LayerStatus::Succeeded => ("ok", None),
                    LayerStatus::Skipped => ("skipped", None),
                    LayerStatus::Failed(reason) => ("failed", Some(reason.clone())),
                };
                LayerRow {
                    layer: outcome.layer.clone(),
                    status: status.to_string(),
                    detail,
                }
            })
            .collect();
        IpcResponse::Report {
            action: action.to_string(),
            resource,
            layers,
        }
    }
}

fn encode<T: Serialize>(msg: &T) -> String {
    match serde_json::to_string(msg) {
        Ok(line) => line,
        Err(e) => serde_json::json!({ "type": "error", "msg": format!("encode failed: {e}") })
            .to_string(),
    }
}

async fn write_line<W, T>(writer: &mut W, msg: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    writer.write_all(format!("{}\n", encode(msg)).as_bytes()).await
}

/// Answer one request that has a single response
pub async fn dispatch(engine: &FocusEngine, exit: &mpsc::Sender<ExitRequest>, req: IpcRequest) -> IpcResponse {
    let result = match req {
        IpcRequest::Status => {
            let state = engine.status().await;
            return IpcResponse::Status {
                phase: state.phase(),
                state,
            };
        }
        IpcRequest::Start {
            from,
            until,
            difficulty,
        } => start(engine, &from, &until, difficulty)
            .await
            .map(|state| IpcResponse::Status {
                phase: state.phase(),
                state,
            }),
        IpcRequest::Stop => engine
            .stop_focus_mode()
            .await
            .map(|state| IpcResponse::Status {
                phase: state.phase(),
                state,
            }),
        IpcRequest::Block => engine.manual_block().await.map(|r| IpcResponse::from(&r)),
        IpcRequest::Unblock => engine.manual_unblock().await.map(|r| IpcResponse::from(&r)),
        IpcRequest::Quit => exit
            .send(ExitRequest::new(ExitSource::Control))
            .await
            .map(|_| IpcResponse::Ok)
            .map_err(|_| FocusError::Ipc("engine is shutting down".into())),
        IpcRequest::Events => Err(FocusError::Ipc("events is a streaming request".into())),
    };
    result.unwrap_or_else(|e| IpcResponse::Error { msg: e.to_string() })
}

async fn start(engine: &FocusEngine, from: &str, until: &str, difficulty: u8) -> Result<EnforcementState> {
    let start = parse_time_of_day(from)?;
    let end = parse_time_of_day(until)?;
    engine.start_focus_mode(start, end, difficulty).await
}

/// Serve the control socket until the task is dropped
///
/// A stale socket file from a previous run is replaced.
pub async fn serve(engine: Arc<FocusEngine>, path: &Path, exit: mpsc::Sender<ExitRequest>) -> Result<()> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)
        .map_err(|e| FocusError::Ipc(format!("cannot bind {}: {e}", path.display())))?;
    tracing::debug!(socket = %path.display(), "Control socket listening");

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "Control socket accept failed");
                continue;
            }
        };
        tokio::spawn(handle_connection(engine.clone(), exit.clone(), stream));
    }
}

async fn handle_connection(engine: Arc<FocusEngine>, exit: mpsc::Sender<ExitRequest>, stream: UnixStream) {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let req: IpcRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                let resp = IpcResponse::Error {
                    msg: format!("bad request: {e}"),
                };
                if write_line(&mut writer, &resp).await.is_err() {
                    return;
                }
                continue;
            }
        };
        tracing::debug!(request = ?req, "Control request");

        if req == IpcRequest::Events {
            stream_events(&engine, &mut writer).await;
            return;
        }

        let resp = dispatch(&engine, &exit, req).await;
        if write_line(&mut writer, &resp).await.is_err() {
            return;
        }
    }
}

async fn stream_events<W: AsyncWrite + Unpin>(engine: &FocusEngine, writer: &mut W) {
    let mut rx = engine.subscribe();
    // Subscribed before the ack, so nothing after it is missed
    if write_line(writer, &IpcResponse::Ok).await.is_err() {
        return;
    }
    loop {
        match rx.recv().await {
            Ok(event) => {
                if write_line(writer, &IpcResponse::Event { event }).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "Event follower lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn connect(path: &Path) -> Result<UnixStream> {
    UnixStream::connect(path).await.map_err(|_| {
        FocusError::Ipc(format!(
            "no running engine at {}: start one with `focus-guard run`",
            path.display()
        ))
    })
}

/// Send one request and wait for its response
pub async fn send(path: &Path, req: &IpcRequest) -> Result<IpcResponse> {
    let stream = connect(path).await?;
    let (reader, mut writer) = tokio::io::split(stream);
    write_line(&mut writer, req).await?;

    let mut lines = BufReader::new(reader).lines();
    let resp_line = lines
        .next_line()
        .await?
        .ok_or_else(|| FocusError::Ipc("engine closed connection".into()))?;

    serde_json::from_str(&resp_line).map_err(|e| FocusError::Ipc(format!("bad response: {e}")))
}

/// Follow the event stream until the engine goes away
pub async fn follow(path: &Path, mut on_event: impl FnMut(EngineEvent)) -> Result<()> {
    let stream = connect(path).await?;
    let (reader, mut writer) = tokio::io::split(stream);
    write_line(&mut writer, &IpcRequest::Events).await?;

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        match serde_json::from_str::<IpcResponse>(&line) {
            Ok(IpcResponse::Event { event }) => on_event(event),
            Ok(IpcResponse::Error { msg }) => return Err(FocusError::Ipc(msg)),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Unreadable event line"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::engine;
    use crate::events::EventKind;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Serving {
        _dir: TempDir,
        path: std::path::PathBuf,
        engine: Arc<FocusEngine>,
        exits: mpsc::Receiver<ExitRequest>,
    }

    async fn serving(now: &str) -> Serving {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("focus-guard.sock");
        let (engine, _, _) = engine(now);
        let engine = Arc::new(engine);
        let (exit_tx, exits) = mpsc::channel(4);
        let server_path = path.clone();
        let server = engine.clone();
        tokio::spawn(async move { serve(server, &server_path, exit_tx).await });
        for _ in 0..100 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Serving {
            _dir: dir,
            path,
            engine,
            exits,
        }
    }

    fn exit_channel() -> mpsc::Sender<ExitRequest> {
        mpsc::channel(1).0
    }

    #[test]
    fn test_request_wire_format() {
        let req = IpcRequest::Start {
            from: "09:00".into(),
            until: "18:00".into(),
            difficulty: 2,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["cmd"], "start");
        assert_eq!(json["difficulty"], 2);

        let parsed: IpcRequest = serde_json::from_str(r#"{"cmd":"unblock"}"#).unwrap();
        assert_eq!(parsed, IpcRequest::Unblock);
    }

    #[tokio::test]
    async fn test_dispatch_start_reports_phase() {
        let (engine, _, _) = engine("10:00");
        let resp = dispatch(
            &engine,
            &exit_channel(),
            IpcRequest::Start {
                from: "09:00".into(),
                until: "18:00".into(),
                difficulty: 1,
            },
        )
        .await;
        match resp {
            IpcResponse::Status { state, phase } => {
                assert_eq!(phase, SessionPhase::Enforcing);
                assert_eq!(state.block_application_count, 1);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_rejects_bad_time() {
        let (engine, _, _) = engine("10:00");
        let resp = dispatch(
            &engine,
            &exit_channel(),
            IpcRequest::Start {
                from: "9am".into(),
                until: "18:00".into(),
                difficulty: 1,
            },
        )
        .await;
        assert!(matches!(resp, IpcResponse::Error { .. }));
        assert!(!engine.status().await.focus_mode_enabled);
    }

    #[tokio::test]
    async fn test_dispatch_block_reports_layers() {
        let (engine, _, _) = engine("10:00");
        match dispatch(&engine, &exit_channel(), IpcRequest::Block).await {
            IpcResponse::Report {
                action,
                resource,
                layers,
            } => {
                assert_eq!(action, "enforce");
                assert_eq!(resource, "applied");
                let restart = layers.iter().find(|r| r.layer == "restart").unwrap();
                assert_eq!(restart.status, "skipped");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let Serving { _dir, path, engine, .. } = serving("10:00").await;

        let resp = send(&path, &IpcRequest::Block).await.unwrap();
        assert!(matches!(resp, IpcResponse::Report { .. }));
        assert!(engine.status().await.blocked);

        match send(&path, &IpcRequest::Status).await.unwrap() {
            IpcResponse::Status { phase, state } => {
                assert!(state.blocked);
                assert_eq!(phase, SessionPhase::Enforcing);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_request_gets_error_line() {
        let Serving { _dir, path, .. } = serving("10:00").await;
        let stream = UnixStream::connect(&path).await.unwrap();
        let (reader, mut writer) = tokio::io::split(stream);
        writer.write_all(b"{\"cmd\":\"reboot\"}\n").await.unwrap();

        let line = BufReader::new(reader).lines().next_line().await.unwrap().unwrap();
        let resp: IpcResponse = serde_json::from_str(&line).unwrap();
        assert!(matches!(resp, IpcResponse::Error { msg } if msg.starts_with("bad request")));
    }

    #[tokio::test]
    async fn test_follow_streams_events() {
        let Serving { _dir, path, engine, .. } = serving("10:00").await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let _ = follow(&path, move |event| {
                let _ = tx.send(event);
            })
            .await;
        });

        // Wait for the follower's subscription
        for _ in 0..100 {
            if engine.events().receiver_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        engine.manual_block().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::Blocked);
    }

    #[tokio::test]
    async fn test_quit_queues_control_exit() {
        let Serving {
            _dir, path, mut exits, ..
        } = serving("10:00").await;

        assert_eq!(send(&path, &IpcRequest::Quit).await.unwrap(), IpcResponse::Ok);
        let request = exits.recv().await.unwrap();
        assert_eq!(request.source, ExitSource::Control);
    }

    #[tokio::test]
    async fn test_send_without_engine() {
        let dir = TempDir::new().unwrap();
        let err = send(&dir.path().join("missing.sock"), &IpcRequest::Status)
            .await
            .unwrap_err();
        assert!(matches!(err, FocusError::Ipc(_)));
    }
}
