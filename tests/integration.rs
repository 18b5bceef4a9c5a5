//! Integration tests for Lobbygate
//!
//! The backend is a shell process that prints the ready line and sleeps; its
//! game side is a mock server speaking the same JSON-lines protocol as the
//! proxy.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lobbygate::codec::{JsonCodec, PacketReader, PacketWriter, Phase, SharedCodec};
use lobbygate::config::Config;
use lobbygate::lifecycle::{BackendLifecycle, Status};
use lobbygate::packet::RawPacket;
use lobbygate::process::{ProcessLauncher, SystemLauncher};
use lobbygate::server::ProxyServer;
use serde_json::json;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

/// Entity id the mock backend assigns to every player
const BACKEND_PLAYER_ID: i32 = 7;

/// Upper bound for any single expected packet
const PACKET_TIMEOUT: Duration = Duration::from_secs(10);

fn codec() -> SharedCodec {
    Arc::new(JsonCodec)
}

/// Proxy config pointing at `backend_port`, with a `sh` backend that is ready
/// half a second after it starts
fn test_config(backend_port: u16) -> Config {
    let toml = format!(
        r#"
[proxy]
bind = "127.0.0.1"
motd = "Integration"

[backend]
port = {backend_port}
executable = "sh"
args = ["-c", "echo lobbygate-ready; exec sleep 30"]
ready_pattern = "lobbygate-ready"
warmup_ms = 500
shutdown_grace_period_secs = 2
"#
    );
    let mut config: Config = toml::from_str(&toml).unwrap();
    // SIGTERM instead of writing "stop" to a shell that never reads it
    config.backend.stop_command = None;
    config.validate().unwrap();
    config
}

struct TestProxy {
    addr: SocketAddr,
    lifecycle: Arc<BackendLifecycle>,
    shutdown_tx: watch::Sender<bool>,
}

impl TestProxy {
    async fn start(config: Config) -> Self {
        let launcher: Arc<dyn ProcessLauncher> = Arc::new(SystemLauncher);
        let lifecycle = BackendLifecycle::new(config.backend.clone(), launcher, None).unwrap();
        let context = ProxyServer::context(&config, Arc::clone(&lifecycle)).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = ProxyServer::new(addr, context, shutdown_rx);
        tokio::spawn(server.serve(listener));

        Self {
            addr,
            lifecycle,
            shutdown_tx,
        }
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.lifecycle.stop().await;
        assert!(self.lifecycle.wait_for_exit(Duration::from_secs(5)).await);
    }
}

/// Game side of the backend: answers logins and relays packets both ways
struct MockBackend {
    port: u16,
    received: mpsc::UnboundedReceiver<RawPacket>,
    outgoing: mpsc::UnboundedSender<RawPacket>,
}

impl MockBackend {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (received_tx, received) = mpsc::unbounded_channel();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<RawPacket>();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (read, write) = stream.into_split();
                let mut reader = PacketReader::new(read, codec());
                let mut writer = PacketWriter::new(write, codec());

                if reader.expect(Phase::Handshake, "handshake").await.is_err() {
                    continue;
                }
                let Ok(start) = reader.expect(Phase::Login, "login_start").await else {
                    continue;
                };
                let username = start
                    .as_raw()
                    .and_then(|raw| raw.get_str("username"))
                    .unwrap_or_default()
                    .to_string();
                writer
                    .send_raw(
                        Phase::Login,
                        RawPacket::with_fields("success", json!({ "username": username })),
                    )
                    .await
                    .unwrap();
                writer
                    .send_raw(
                        Phase::Play,
                        RawPacket::with_fields(
                            "login",
                            json!({
                                "entityId": BACKEND_PLAYER_ID,
                                "gameMode": 0,
                                "dimension": 0,
                                "levelType": "flat",
                                "hashedSeed": [1, 2]
                            }),
                        ),
                    )
                    .await
                    .unwrap();

                loop {
                    tokio::select! {
                        packet = reader.next(Phase::Play) => match packet {
                            Ok(Some(packet)) => {
                                let _ = received_tx.send(packet.into_raw().unwrap());
                            }
                            _ => break,
                        },
                        packet = outgoing_rx.recv() => match packet {
                            Some(packet) => {
                                if writer.send_raw(Phase::Play, packet).await.is_err() {
                                    break;
                                }
                            }
                            None => return,
                        },
                    }
                }
            }
        });

        Self {
            port,
            received,
            outgoing,
        }
    }

    fn send(&self, kind: &str, fields: serde_json::Value) {
        self.outgoing
            .send(RawPacket::with_fields(kind, fields))
            .unwrap();
    }

    async fn next_of(&mut self, kind: &str) -> RawPacket {
        tokio::time::timeout(PACKET_TIMEOUT, async {
            loop {
                let packet = self.received.recv().await.expect("mock backend stopped");
                if packet.kind == kind {
                    return packet;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("backend never received '{}'", kind))
    }
}

struct TestClient {
    reader: PacketReader<OwnedReadHalf>,
    writer: PacketWriter<OwnedWriteHalf>,
}

impl TestClient {
    async fn connect(addr: SocketAddr, next_state: i32) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, write) = stream.into_split();
        let mut client = Self {
            reader: PacketReader::new(read, codec()),
            writer: PacketWriter::new(write, codec()),
        };
        client
            .send(
                Phase::Handshake,
                "handshake",
                json!({ "serverHost": "localhost", "serverPort": addr.port(), "nextState": next_state }),
            )
            .await;
        client
    }

    async fn login(addr: SocketAddr, username: &str) -> Self {
        let mut client = Self::connect(addr, 2).await;
        client
            .send(Phase::Login, "login_start", json!({ "username": username }))
            .await;
        client
    }

    async fn send(&mut self, phase: Phase, kind: &str, fields: serde_json::Value) {
        self.writer
            .send_raw(phase, RawPacket::with_fields(kind, fields))
            .await
            .unwrap();
    }

    /// Next packet of `kind`, skipping everything else
    async fn next_of(&mut self, phase: Phase, kind: &str) -> RawPacket {
        tokio::time::timeout(PACKET_TIMEOUT, async {
            loop {
                let packet = self
                    .reader
                    .next(phase)
                    .await
                    .unwrap()
                    .unwrap_or_else(|| panic!("connection closed while waiting for '{}'", kind));
                let raw = packet.into_raw().unwrap();
                if raw.kind == kind {
                    return raw;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for '{}'", kind))
    }

    /// Next packet that is not a keep-alive
    async fn next_meaningful(&mut self) -> Option<RawPacket> {
        tokio::time::timeout(PACKET_TIMEOUT, async {
            loop {
                let packet = self.reader.next(Phase::Play).await.ok()??;
                let raw = packet.into_raw().unwrap();
                if raw.kind != "keep_alive" {
                    return Some(raw);
                }
            }
        })
        .await
        .expect("timed out waiting for a packet")
    }
}

/// Log `username` in and wait until the proxy has moved it onto the backend
async fn attached_client(proxy: &TestProxy, username: &str) -> (TestClient, i32) {
    let mut client = TestClient::login(proxy.addr, username).await;
    client.next_of(Phase::Login, "success").await;
    let login = client.next_of(Phase::Play, "login").await;
    let self_ref = login.get_i32("entityId").unwrap();

    // The holding world logged the client in, so the backend arrives as a respawn pair
    let flush = client.next_of(Phase::Play, "respawn").await;
    assert_eq!(flush.get_i32("dimension"), Some(-1));
    let respawn = client.next_of(Phase::Play, "respawn").await;
    assert_eq!(respawn.get_i32("dimension"), Some(0));
    assert_eq!(respawn.get_str("levelType"), Some("flat"));
    assert_eq!(proxy.lifecycle.status(), Status::Online);

    (client, self_ref)
}

#[tokio::test]
async fn test_status_ping_reports_backend_state() {
    let backend = MockBackend::start().await;
    let proxy = TestProxy::start(test_config(backend.port)).await;

    let mut client = TestClient::connect(proxy.addr, 1).await;
    client.send(Phase::Handshake, "ping_start", json!({})).await;
    let info = client.next_of(Phase::Handshake, "server_info").await;
    let response: serde_json::Value =
        serde_json::from_str(info.get_str("response").unwrap()).unwrap();
    assert_eq!(response["description"]["text"], "Integration");
    assert_eq!(response["players"]["online"], 0);
    assert_eq!(response["players"]["sample"], json!([]));
    assert_eq!(response["backend"], "OFFLINE");

    client
        .send(Phase::Handshake, "ping", json!({ "time": 42 }))
        .await;
    let pong = client.next_of(Phase::Handshake, "ping").await;
    assert_eq!(pong.get_i32("time"), Some(42));

    // A ping never wakes the backend
    assert_eq!(proxy.lifecycle.status(), Status::Offline);
    proxy.stop().await;
}

#[tokio::test]
async fn test_rejects_player_not_on_whitelist() {
    let backend = MockBackend::start().await;
    let mut config = test_config(backend.port);
    config.proxy.whitelist = Some(vec!["kyle".to_string()]);
    let proxy = TestProxy::start(config).await;

    let mut client = TestClient::login(proxy.addr, "mallory").await;
    let kick = client.next_of(Phase::Login, "disconnect").await;
    assert!(kick.get_str("reason").unwrap().contains("not whitelisted"));
    assert!(client.reader.next(Phase::Login).await.unwrap().is_none());

    assert_eq!(proxy.lifecycle.status(), Status::Offline);
    assert_eq!(proxy.lifecycle.pid(), None);
    proxy.stop().await;
}

#[tokio::test]
async fn test_player_waits_in_holding_world_then_attaches() {
    let mut backend = MockBackend::start().await;
    let proxy = TestProxy::start(test_config(backend.port)).await;

    let mut client = TestClient::login(proxy.addr, "kyle").await;
    client.next_of(Phase::Login, "success").await;

    let login = client.next_of(Phase::Play, "login").await;
    assert_eq!(login.get_i32("entityId"), Some(i32::MAX));
    assert_eq!(login.get_i32("gameMode"), Some(2));
    client.next_of(Phase::Play, "position").await;

    let flush = client.next_of(Phase::Play, "respawn").await;
    assert_eq!(flush.get_i32("dimension"), Some(-1));
    client.next_of(Phase::Play, "respawn").await;

    // Backend references reach the client as the client's own id
    backend.send("entity_velocity", json!({ "entityId": BACKEND_PLAYER_ID, "velocityX": 1 }));
    let velocity = client.next_of(Phase::Play, "entity_velocity").await;
    assert_eq!(velocity.get_i32("entityId"), Some(i32::MAX));

    // And the client's references reach the backend as the backend's id
    client
        .send(Phase::Play, "use_entity", json!({ "entityId": i32::MAX, "mouse": 0 }))
        .await;
    let used = backend.next_of("use_entity").await;
    assert_eq!(used.get_i32("entityId"), Some(BACKEND_PLAYER_ID));

    proxy.stop().await;
}

#[tokio::test]
async fn test_new_backend_entity_gets_client_id() {
    let backend = MockBackend::start().await;
    let proxy = TestProxy::start(test_config(backend.port)).await;
    let (mut client, self_ref) = attached_client(&proxy, "kyle").await;

    backend.send("entity_head_rotation", json!({ "entityId": 99, "headYaw": 5 }));
    let rotation = client.next_meaningful().await.unwrap();
    assert_eq!(rotation.kind, "entity_head_rotation");
    let mob = rotation.get_i32("entityId").unwrap();
    assert!(mob >= lobbygate::identity::CLIENT_SPACE_FLOOR);
    assert_ne!(mob, self_ref);

    // The same backend entity keeps its client id
    backend.send("entity_head_rotation", json!({ "entityId": 99, "headYaw": 6 }));
    let rotation = client.next_meaningful().await.unwrap();
    assert_eq!(rotation.get_i32("entityId"), Some(mob));
    assert_eq!(rotation.get_i32("headYaw"), Some(6));

    proxy.stop().await;
}

#[tokio::test]
async fn test_unknown_client_reference_is_dropped() {
    let mut backend = MockBackend::start().await;
    let proxy = TestProxy::start(test_config(backend.port)).await;
    let (mut client, self_ref) = attached_client(&proxy, "kyle").await;

    client
        .send(Phase::Play, "use_entity", json!({ "entityId": 12345, "mouse": 1 }))
        .await;
    client
        .send(Phase::Play, "use_entity", json!({ "entityId": self_ref, "mouse": 0 }))
        .await;

    // Only the packet with a known reference comes through
    let used = backend.next_of("use_entity").await;
    assert_eq!(used.get_i32("entityId"), Some(BACKEND_PLAYER_ID));
    assert_eq!(used.get_i32("mouse"), Some(0));

    proxy.stop().await;
}

#[tokio::test]
async fn test_backend_stop_moves_player_to_holding_world() {
    let backend = MockBackend::start().await;
    let proxy = TestProxy::start(test_config(backend.port)).await;
    let (mut client, _) = attached_client(&proxy, "kyle").await;

    proxy.lifecycle.stop().await;
    assert!(proxy.lifecycle.wait_for_exit(Duration::from_secs(5)).await);

    // The connection stays open; the client is flushed into the holding world
    let flush = client.next_of(Phase::Play, "respawn").await;
    assert_eq!(flush.get_i32("dimension"), Some(-1));
    let respawn = client.next_of(Phase::Play, "respawn").await;
    assert_eq!(respawn.get_i32("dimension"), Some(0));
    assert_eq!(respawn.get_i32("gamemode"), Some(2));
    client.next_of(Phase::Play, "position").await;

    assert_eq!(proxy.lifecycle.status(), Status::Offline);
    proxy.stop().await;
}

#[tokio::test]
async fn test_backend_kick_ends_session() {
    let backend = MockBackend::start().await;
    let proxy = TestProxy::start(test_config(backend.port)).await;
    let (mut client, _) = attached_client(&proxy, "kyle").await;

    backend.send("kick_disconnect", json!({ "reason": "Banned" }));
    let kick = client.next_meaningful().await.unwrap();
    assert_eq!(kick.kind, "kick_disconnect");
    assert_eq!(kick.get_str("reason"), Some("Banned"));
    assert!(client.next_meaningful().await.is_none());

    proxy.stop().await;
}
