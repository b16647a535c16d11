// Session gateway: authenticated WebSocket connections that join itinerary
// rooms and exchange realtime collaboration frames.

mod dispatch;

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, warn};
use voyage_common::protocol::ws::ServerEvent;

use self::dispatch::Session;
use crate::{
    api::AppState,
    auth::{jwt::JwtAccessTokenService, middleware::authenticate},
    error::{
        current_request_id, request_id_from_headers_or_generate, with_request_id_scope, ErrorCode,
    },
    metrics,
};

const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
const MAX_FRAME_BYTES: usize = 262_144;

#[derive(Clone)]
struct GatewayState {
    app: AppState,
    jwt_service: Arc<JwtAccessTokenService>,
}

#[derive(Debug, Default, Deserialize)]
struct ConnectQuery {
    token: Option<String>,
}

pub fn router(state: AppState, jwt_service: Arc<JwtAccessTokenService>) -> Router {
    Router::new().route("/ws", get(ws_upgrade)).with_state(GatewayState { app: state, jwt_service })
}

/// Credentials are checked before the upgrade so a rejected client gets a
/// plain 401 and never holds a socket.
async fn ws_upgrade(
    State(state): State<GatewayState>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let participant = match authenticate(&state.jwt_service, &headers, query.token.as_deref()) {
        Ok(participant) => participant,
        Err(error) => return error.into_response(),
    };

    let request_id = request_id_from_headers_or_generate(&headers);
    let app = state.app;
    ws.max_frame_size(MAX_FRAME_BYTES).on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, handle_socket(app, participant.participant_id, socket))
            .await;
    })
}

async fn handle_socket(state: AppState, participant_id: String, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerEvent>();
    let connection_id = state.presence.connect(&participant_id, outbound_sender).await;
    let session = Session { connection_id, participant_id };
    info!(
        participant = %session.participant_id,
        connection_id = %connection_id,
        request_id = %request_id,
        "websocket connected"
    );

    // Ping every HEARTBEAT_INTERVAL_MS; drop the connection when no pong has
    // arrived for HEARTBEAT_TIMEOUT_MS past that.
    let mut heartbeat_interval =
        tokio::time::interval(std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset();
    let mut last_pong = Instant::now();
    let heartbeat_timeout =
        std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS + HEARTBEAT_TIMEOUT_MS);

    'session: loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_timeout {
                    warn!(
                        connection_id = %connection_id,
                        request_id = %request_id,
                        "heartbeat timeout, disconnecting"
                    );
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(event) => {
                        if send_ws_message(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw)) => {
                        let started_at = Instant::now();
                        let (kind, outcome) =
                            dispatch::handle_text_frame(&state, &session, raw.as_str()).await;
                        metrics::record_ws_request(
                            &kind,
                            outcome.is_error,
                            started_at.elapsed().as_millis() as u64,
                        );
                        for reply in &outcome.replies {
                            if send_ws_message(&mut socket, reply).await.is_err() {
                                break 'session;
                            }
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        let reply = ErrorCode::ValidationFailed
                            .event("binary frames are not supported", None);
                        if send_ws_message(&mut socket, &reply).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Err(error) => {
                        debug!(connection_id = %connection_id, error = %error, "websocket receive failed");
                        break;
                    }
                }
            }
        }
    }

    let rooms = state.presence.disconnect(connection_id).await;
    info!(
        participant = %session.participant_id,
        connection_id = %connection_id,
        rooms = rooms.len(),
        "websocket disconnected"
    );
}

async fn send_ws_message(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let encoded = serde_json::to_string(event).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::{net::TcpListener, time::timeout};
    use tokio_tungstenite::{
        connect_async,
        tungstenite::{client::IntoClientRequest, Error as WsError, Message as WsFrame},
        MaybeTlsStream, WebSocketStream,
    };
    use voyage_common::protocol::ws::ServerEvent;

    use super::router;
    use crate::api::{
        test_support::{jwt_service, memory_state, token},
        AppState,
    };

    type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn spawn_gateway(state: AppState) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener should expose local address");
        let app = router(state, jwt_service());
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("gateway should serve");
        });
        addr
    }

    async fn connect_with_header(addr: SocketAddr, participant_id: &str) -> ClientSocket {
        let mut request =
            format!("ws://{addr}/ws").into_client_request().expect("request should build");
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token(participant_id)))
                .expect("header should encode"),
        );
        let (socket, _) = connect_async(request).await.expect("websocket should connect");
        socket
    }

    async fn connect_with_query(addr: SocketAddr, participant_id: &str) -> ClientSocket {
        let url = format!("ws://{addr}/ws?token={}", token(participant_id));
        let (socket, _) = connect_async(url).await.expect("websocket should connect");
        socket
    }

    async fn ws_send(socket: &mut ClientSocket, frame: Value) {
        socket.send(WsFrame::Text(frame.to_string().into())).await.expect("ws frame should send");
    }

    async fn ws_recv(socket: &mut ClientSocket) -> ServerEvent {
        loop {
            let next = timeout(std::time::Duration::from_secs(2), socket.next())
                .await
                .expect("timed out waiting for websocket frame");
            let frame =
                next.expect("websocket should remain open").expect("websocket frame should decode");

            match frame {
                WsFrame::Text(payload) => {
                    return serde_json::from_str::<ServerEvent>(&payload)
                        .expect("text frame should decode as server event");
                }
                WsFrame::Ping(payload) => {
                    socket.send(WsFrame::Pong(payload)).await.expect("pong should send");
                }
                WsFrame::Close(_) => panic!("websocket closed unexpectedly"),
                _ => {}
            }
        }
    }

    async fn expect_rejected(url: String) {
        match connect_async(url).await {
            Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::UNAUTHORIZED),
            Err(other) => panic!("unexpected connect error: {other}"),
            Ok(_) => panic!("unauthenticated websocket should be refused"),
        }
    }

    #[tokio::test]
    async fn upgrade_requires_a_valid_token() {
        let addr = spawn_gateway(memory_state()).await;

        expect_rejected(format!("ws://{addr}/ws")).await;
        expect_rejected(format!("ws://{addr}/ws?token=not-a-jwt")).await;
    }

    #[tokio::test]
    async fn room_members_see_joins_and_synced_changes() {
        let state = memory_state();
        let addr = spawn_gateway(state.clone()).await;
        let mut alice = connect_with_header(addr, "alice").await;
        let mut bob = connect_with_query(addr, "bob").await;

        ws_send(&mut alice, json!({ "type": "join_room", "doc_id": "trip-1" })).await;
        assert!(matches!(ws_recv(&mut alice).await, ServerEvent::JoinedRoom { .. }));

        ws_send(&mut bob, json!({ "type": "join_room", "doc_id": "trip-1" })).await;
        match ws_recv(&mut bob).await {
            ServerEvent::JoinedRoom { participants, .. } => {
                assert_eq!(participants, vec!["alice".to_string(), "bob".to_string()]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            ws_recv(&mut alice).await,
            ServerEvent::UserJoined { participant, .. } if participant == "bob"
        ));

        ws_send(
            &mut alice,
            json!({
                "type": "sync_change_set",
                "doc_id": "trip-1",
                "changes": [{ "field": "title", "old_value": null, "new_value": "Lisbon weekend" }]
            }),
        )
        .await;
        match ws_recv(&mut alice).await {
            ServerEvent::UpdateConfirmed { result, .. } => assert!(result.success),
            other => panic!("unexpected event: {other:?}"),
        }
        match ws_recv(&mut bob).await {
            ServerEvent::ItineraryUpdated { participant, resolved_data, changes, .. } => {
                assert_eq!(participant, "alice");
                assert_eq!(changes[0].submitter.as_deref(), Some("alice"));
                assert_eq!(resolved_data.expect("resolved data")["title"], "Lisbon weekend");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let stored = state.engine.state("trip-1").await.expect("state").expect("snapshot");
        assert_eq!(stored["lastModifiedBy"], "alice");
    }

    #[tokio::test]
    async fn unsupported_operation_keeps_the_socket_open() {
        let addr = spawn_gateway(memory_state()).await;
        let mut alice = connect_with_header(addr, "alice").await;

        ws_send(&mut alice, json!({ "type": "teleport", "doc_id": "trip-1" })).await;
        match ws_recv(&mut alice).await {
            ServerEvent::Error { code, retryable, .. } => {
                assert_eq!(code, "UNSUPPORTED_OPERATION");
                assert!(!retryable);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        alice.send(WsFrame::Text("{broken".into())).await.expect("frame should send");
        assert!(matches!(
            ws_recv(&mut alice).await,
            ServerEvent::Error { code, .. } if code == "VALIDATION_FAILED"
        ));

        ws_send(&mut alice, json!({ "type": "join_room", "doc_id": "trip-1" })).await;
        assert!(matches!(ws_recv(&mut alice).await, ServerEvent::JoinedRoom { .. }));
    }

    #[tokio::test]
    async fn closing_a_socket_tells_the_room() {
        let state = memory_state();
        let addr = spawn_gateway(state.clone()).await;
        let mut alice = connect_with_header(addr, "alice").await;
        let mut bob = connect_with_header(addr, "bob").await;

        ws_send(&mut alice, json!({ "type": "join_room", "doc_id": "trip-1" })).await;
        ws_recv(&mut alice).await;
        ws_send(&mut bob, json!({ "type": "join_room", "doc_id": "trip-1" })).await;
        ws_recv(&mut bob).await;
        ws_recv(&mut alice).await;

        bob.close(None).await.expect("close should send");

        assert!(matches!(
            ws_recv(&mut alice).await,
            ServerEvent::UserLeft { participant, doc_id, .. } if participant == "bob" && doc_id == "trip-1"
        ));
        assert_eq!(state.presence.participants("trip-1").await, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn chat_reaches_everyone_in_the_room() {
        let addr = spawn_gateway(memory_state()).await;
        let mut alice = connect_with_header(addr, "alice").await;
        let mut bob = connect_with_header(addr, "bob").await;

        ws_send(&mut alice, json!({ "type": "join_room", "doc_id": "trip-1" })).await;
        ws_recv(&mut alice).await;
        ws_send(&mut bob, json!({ "type": "join_room", "doc_id": "trip-1" })).await;
        ws_recv(&mut bob).await;
        ws_recv(&mut alice).await;

        ws_send(&mut bob, json!({ "type": "chat_message", "doc_id": "trip-1", "message": "dinner at 8?" })).await;

        for socket in [&mut alice, &mut bob] {
            match ws_recv(socket).await {
                ServerEvent::NewChatMessage { participant, message, message_id, .. } => {
                    assert_eq!(participant, "bob");
                    assert_eq!(message, "dinner at 8?");
                    assert!(message_id.starts_with("chat_bob_"));
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }
}
