//! One client connection from handshake to disconnect
//!
//! After login a client is always in exactly one of two places: attached to a
//! backend session, with packets flowing through the translator, or parked in
//! the holding world. Backend status changes move it between the two without
//! ever closing the client's socket.

use crate::codec::{PacketReader, PacketWriter, Phase, SharedCodec};
use crate::config::ProxyConfig;
use crate::error::CodecError;
use crate::holding::{respawn_pair, HoldingEntry, HoldingWorld};
use crate::lifecycle::{BackendLifecycle, Status};
use crate::packet::{Packet, RawPacket};
use crate::server::Orchestrator;
use crate::translate::{Direction, PacketTranslator, Translation};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

pub const HANDSHAKE: &str = "handshake";
pub const LOGIN_START: &str = "login_start";
pub const LOGIN_SUCCESS: &str = "success";
pub const LOGIN: &str = "login";
pub const DISCONNECT: &str = "disconnect";
pub const KICK_DISCONNECT: &str = "kick_disconnect";
pub const KEEP_ALIVE: &str = "keep_alive";
pub const PING_START: &str = "ping_start";
pub const SERVER_INFO: &str = "server_info";
pub const PING: &str = "ping";

/// Handshake `nextState` values
const NEXT_STATE_STATUS: i32 = 1;
const NEXT_STATE_LOGIN: i32 = 2;

/// Delay before retrying a failed attach while the backend reports ONLINE
const ATTACH_RETRY: Duration = Duration::from_secs(5);

/// Time allowed for the backend to complete its side of the login
const BACKEND_LOGIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a session needs, shared by all connections
pub struct SessionContext {
    pub proxy: ProxyConfig,
    pub backend_address: String,
    pub lifecycle: Arc<BackendLifecycle>,
    pub translator: PacketTranslator,
    pub holding: Arc<dyn HoldingWorld>,
    pub codec: SharedCodec,
    pub orchestrator: Arc<Orchestrator>,
}

/// Per-player state kept by the session task
#[derive(Debug, Clone)]
pub struct Player {
    pub id: Uuid,
    pub username: String,
    pub peer: SocketAddr,
    /// The player's own entity id as the client knows it
    pub self_ref: i32,
    /// Whether the client has received a login packet on this connection
    pub logged_in: bool,
}

struct BackendSession {
    reader: PacketReader<OwnedReadHalf>,
    writer: PacketWriter<OwnedWriteHalf>,
}

type ClientReader = PacketReader<OwnedReadHalf>;
type ClientWriter = PacketWriter<OwnedWriteHalf>;

enum Flow {
    Continue,
    Close,
}

/// Drive one client connection to completion
pub async fn handle_connection(
    ctx: Arc<SessionContext>,
    stream: TcpStream,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let (read, write) = stream.into_split();
    let mut reader = PacketReader::new(read, ctx.codec.clone());
    let mut writer = PacketWriter::new(write, ctx.codec.clone());

    let handshake = reader.expect(Phase::Handshake, HANDSHAKE).await?;
    let next_state = handshake
        .as_raw()
        .and_then(|raw| raw.get_i32("nextState"))
        .unwrap_or(NEXT_STATE_LOGIN);

    match next_state {
        NEXT_STATE_STATUS => answer_status(&ctx, &mut reader, &mut writer).await,
        NEXT_STATE_LOGIN => login(ctx, peer, reader, writer).await,
        other => {
            debug!(peer = %peer, next_state = other, "Unknown handshake state");
            Ok(())
        }
    }
}

/// Server list ping
async fn answer_status(
    ctx: &SessionContext,
    reader: &mut ClientReader,
    writer: &mut ClientWriter,
) -> anyhow::Result<()> {
    while let Some(packet) = reader.next(Phase::Handshake).await? {
        match packet.kind() {
            PING_START => {
                let info = json!({
                    "description": { "text": ctx.proxy.motd },
                    "players": {
                        "max": ctx.proxy.max_players,
                        "online": ctx.orchestrator.player_count(),
                        "sample": ctx.orchestrator.usernames()
                    },
                    "backend": ctx.lifecycle.status().to_string()
                });
                writer
                    .send_raw(
                        Phase::Handshake,
                        RawPacket::with_fields(SERVER_INFO, json!({ "response": info.to_string() })),
                    )
                    .await?;
            }
            PING => {
                writer.send(Phase::Handshake, &packet).await?;
                break;
            }
            other => trace!(kind = other, "Ignoring status packet"),
        }
    }
    Ok(())
}

async fn login(
    ctx: Arc<SessionContext>,
    peer: SocketAddr,
    mut reader: ClientReader,
    mut writer: ClientWriter,
) -> anyhow::Result<()> {
    let start = reader.expect(Phase::Login, LOGIN_START).await?;
    let username = start
        .as_raw()
        .and_then(|raw| raw.get_str("username"))
        .unwrap_or_default()
        .to_string();

    if username.is_empty() || !ctx.proxy.is_whitelisted(&username) {
        info!(peer = %peer, username = %username, "Rejected login: not whitelisted");
        kick(&mut writer, Phase::Login, "You are not whitelisted").await;
        return Ok(());
    }

    let allocated = ctx.lifecycle.identities().lock().allocate();
    let self_ref = match allocated {
        Ok(id) => id,
        Err(e) => {
            warn!(username = %username, error = %e, "Cannot issue an entity id");
            kick(&mut writer, Phase::Login, "Server is full").await;
            return Ok(());
        }
    };

    let mut player = Player {
        id: Uuid::new_v4(),
        username,
        peer,
        self_ref,
        logged_in: false,
    };

    writer
        .send_raw(
            Phase::Login,
            RawPacket::with_fields(
                LOGIN_SUCCESS,
                json!({ "uuid": player.id.to_string(), "username": player.username }),
            ),
        )
        .await?;

    info!(
        username = %player.username,
        peer = %peer,
        self_ref,
        backend = %ctx.lifecycle.status(),
        "Player logged in"
    );
    ctx.orchestrator.player_joined(&player).await;

    let result = play(&ctx, &mut player, reader, &mut writer).await;

    ctx.orchestrator.player_left(&player);
    info!(username = %player.username, "Player disconnected");
    result
}

async fn play(
    ctx: &SessionContext,
    player: &mut Player,
    mut client_reader: ClientReader,
    client_writer: &mut ClientWriter,
) -> anyhow::Result<()> {
    let mut status_rx = ctx.lifecycle.subscribe();
    let mut retry_at: Option<Instant> = None;

    let status = *status_rx.borrow_and_update();
    let mut backend = if status == Status::Online {
        try_attach(ctx, player, client_writer).await
    } else {
        None
    };
    if backend.is_none() {
        enter_holding(ctx, player, client_writer).await?;
        if status == Status::Online {
            retry_at = Some(Instant::now() + ATTACH_RETRY);
        }
    }

    let mut keep_alive = tokio::time::interval(ctx.proxy.keep_alive_interval());
    keep_alive.tick().await;

    loop {
        tokio::select! {
            packet = client_reader.next(Phase::Play) => {
                let packet = match packet {
                    Ok(Some(packet)) => packet,
                    Ok(None) => {
                        debug!(username = %player.username, "Client closed connection");
                        break;
                    }
                    Err(e) => {
                        debug!(username = %player.username, error = %e, "Client stream error");
                        break;
                    }
                };
                if let Err(e) = forward_to_backend(ctx, &mut backend, packet).await {
                    warn!(username = %player.username, error = %e, "Lost backend session");
                    backend = None;
                    enter_holding(ctx, player, client_writer).await?;
                    retry_at = Some(Instant::now() + ATTACH_RETRY);
                }
            }
            packet = next_backend_packet(&mut backend) => {
                match packet {
                    Ok(Some(packet)) => {
                        if let Flow::Close = forward_to_client(ctx, &mut backend, client_writer, packet).await? {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => {
                        info!(username = %player.username, "Backend session closed");
                        backend = None;
                        enter_holding(ctx, player, client_writer).await?;
                        if ctx.lifecycle.status() == Status::Online {
                            retry_at = Some(Instant::now() + ATTACH_RETRY);
                        }
                    }
                }
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *status_rx.borrow_and_update();
                match status {
                    Status::Online if backend.is_none() => {
                        backend = try_attach(ctx, player, client_writer).await;
                        retry_at = backend.is_none().then(|| Instant::now() + ATTACH_RETRY);
                    }
                    Status::Offline if backend.is_some() => {
                        info!(username = %player.username, "Backend went offline, moving player to holding world");
                        backend = None;
                        retry_at = None;
                        enter_holding(ctx, player, client_writer).await?;
                    }
                    _ => {}
                }
            }
            _ = wait_until(retry_at) => {
                retry_at = None;
                if backend.is_none() && ctx.lifecycle.status() == Status::Online {
                    backend = try_attach(ctx, player, client_writer).await;
                    if backend.is_none() {
                        retry_at = Some(Instant::now() + ATTACH_RETRY);
                    }
                }
            }
            _ = keep_alive.tick() => {
                let id = chrono::Utc::now().timestamp_millis();
                client_writer
                    .send_raw(Phase::Play, RawPacket::with_fields(KEEP_ALIVE, json!({ "keepAliveId": id })))
                    .await?;
            }
        }
    }
    Ok(())
}

async fn next_backend_packet(
    backend: &mut Option<BackendSession>,
) -> Result<Option<Packet>, CodecError> {
    match backend {
        Some(session) => session.reader.next(Phase::Play).await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn forward_to_backend(
    ctx: &SessionContext,
    backend: &mut Option<BackendSession>,
    packet: Packet,
) -> Result<(), CodecError> {
    // The proxy answers the client's keep-alives itself
    if packet.kind() == KEEP_ALIVE {
        return Ok(());
    }
    let Some(session) = backend.as_mut() else {
        trace!(kind = packet.kind(), "No backend session, discarding client packet");
        return Ok(());
    };

    let translation = {
        let identities = ctx.lifecycle.identities();
        let mut identities = identities.lock();
        ctx.translator
            .translate(&mut identities, packet, Direction::ToBackend)
    };
    match translation {
        Translation::Forward(packet) => session.writer.send(Phase::Play, &packet).await,
        Translation::Drop => Ok(()),
    }
}

async fn forward_to_client(
    ctx: &SessionContext,
    backend: &mut Option<BackendSession>,
    client_writer: &mut ClientWriter,
    packet: Packet,
) -> anyhow::Result<Flow> {
    match packet.kind() {
        KEEP_ALIVE => {
            if let Some(session) = backend.as_mut() {
                if let Err(e) = session.writer.send(Phase::Play, &packet).await {
                    debug!(error = %e, "Failed to answer backend keep-alive");
                }
            }
            return Ok(Flow::Continue);
        }
        KICK_DISCONNECT => {
            client_writer.send(Phase::Play, &packet).await?;
            return Ok(Flow::Close);
        }
        _ => {}
    }

    let translation = {
        let identities = ctx.lifecycle.identities();
        let mut identities = identities.lock();
        ctx.translator
            .translate(&mut identities, packet, Direction::ToClient)
    };
    if let Translation::Forward(packet) = translation {
        client_writer.send(Phase::Play, &packet).await?;
    }
    Ok(Flow::Continue)
}

async fn enter_holding(
    ctx: &SessionContext,
    player: &mut Player,
    client_writer: &mut ClientWriter,
) -> anyhow::Result<()> {
    let entry = if player.logged_in {
        HoldingEntry::Demotion
    } else {
        HoldingEntry::Login {
            self_ref: player.self_ref,
        }
    };
    for packet in ctx.holding.entry_packets(entry) {
        client_writer.send(Phase::Play, &packet).await?;
    }
    player.logged_in = true;
    debug!(username = %player.username, ?entry, "Player entered holding world");
    Ok(())
}

async fn try_attach(
    ctx: &SessionContext,
    player: &mut Player,
    client_writer: &mut ClientWriter,
) -> Option<BackendSession> {
    match attach(ctx, player, client_writer).await {
        Ok(session) => Some(session),
        Err(e) => {
            warn!(username = %player.username, error = %e, "Failed to attach to backend");
            None
        }
    }
}

/// Open a backend session for `player` and bring the client over to it
async fn attach(
    ctx: &SessionContext,
    player: &mut Player,
    client_writer: &mut ClientWriter,
) -> anyhow::Result<BackendSession> {
    let stream = TcpStream::connect(&ctx.backend_address).await?;
    stream.set_nodelay(true)?;
    let (read, write) = stream.into_split();
    let mut session = BackendSession {
        reader: PacketReader::new(read, ctx.codec.clone()),
        writer: PacketWriter::new(write, ctx.codec.clone()),
    };

    let (host, port) = ctx
        .backend_address
        .rsplit_once(':')
        .map(|(h, p)| (h.to_string(), p.parse::<u16>().unwrap_or_default()))
        .unwrap_or_else(|| (ctx.backend_address.clone(), 0));
    session
        .writer
        .send_raw(
            Phase::Handshake,
            RawPacket::with_fields(
                HANDSHAKE,
                json!({ "serverHost": host, "serverPort": port, "nextState": NEXT_STATE_LOGIN }),
            ),
        )
        .await?;
    session
        .writer
        .send_raw(
            Phase::Login,
            RawPacket::with_fields(LOGIN_START, json!({ "username": player.username })),
        )
        .await?;

    let login = tokio::time::timeout(BACKEND_LOGIN_TIMEOUT, backend_login(&mut session.reader))
        .await
        .map_err(|_| anyhow::anyhow!("Backend did not complete login in time"))??;

    let backend_ref = login
        .get_i32("entityId")
        .ok_or_else(|| anyhow::anyhow!("Backend login has no entityId"))?;
    ctx.lifecycle
        .identities()
        .lock()
        .associate(backend_ref, player.self_ref, None);

    if player.logged_in {
        let dimension = login.get_i32("dimension").unwrap_or(0);
        let game_mode = login.get_i32("gameMode").unwrap_or(0);
        let level_type = login.get_str("levelType").unwrap_or("default").to_string();
        let hashed_seed = login.get("hashedSeed").cloned().unwrap_or(Value::Null);
        for packet in respawn_pair(dimension, game_mode, &level_type, hashed_seed) {
            client_writer.send(Phase::Play, &packet).await?;
        }
    } else {
        let mut login = login;
        login.set("entityId", player.self_ref);
        login.set("reducedDebugInfo", false);
        client_writer.send(Phase::Play, &Packet::Other(login)).await?;
        player.logged_in = true;
    }

    info!(
        username = %player.username,
        backend_ref,
        self_ref = player.self_ref,
        "Player attached to backend"
    );
    Ok(session)
}

/// Read the backend's side of the login up to and including its `login` packet
async fn backend_login(reader: &mut PacketReader<OwnedReadHalf>) -> anyhow::Result<RawPacket> {
    let mut phase = Phase::Login;
    loop {
        let packet = reader.expect(phase, LOGIN).await?;
        match (phase, packet.kind()) {
            (Phase::Login, LOGIN_SUCCESS) => phase = Phase::Play,
            (_, DISCONNECT) | (_, KICK_DISCONNECT) => {
                let reason = packet
                    .as_raw()
                    .and_then(|raw| raw.get_str("reason"))
                    .unwrap_or("no reason")
                    .to_string();
                anyhow::bail!("Backend refused login: {}", reason);
            }
            (Phase::Play, LOGIN) => {
                return packet
                    .into_raw()
                    .map_err(|e| anyhow::anyhow!("Malformed backend login: {}", e));
            }
            (_, other) => trace!(kind = other, "Skipping packet before backend login"),
        }
    }
}

async fn kick(writer: &mut ClientWriter, phase: Phase, reason: &str) {
    let packet = RawPacket::with_fields(
        DISCONNECT,
        json!({ "reason": json!({ "text": reason }).to_string() }),
    );
    if let Err(e) = writer.send_raw(phase, packet).await {
        debug!(error = %e, "Failed to send disconnect");
    }
    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "Failed to close connection after disconnect");
    }
}
