//! One logical task per connection: receive, dispatch, reply ACK/NACK (§4.8).

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::client_registry::ClientRegistry;
use crate::client_session::ClientSession;
use crate::logger::Logger;
use crate::player_registry::PlayerRegistry;
use crate::protocol::{self, Clock, Header, PacketType, Role};

/// A loggable occurrence from inside the session loop.
pub enum Event {
    Registered { id: u64 },
    CapacityExceeded { id: u64 },
    LoggedIn { id: u64, name: String },
    Disconnected { id: u64 },
    Dispatch { id: u64, ptype: PacketType },
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Registered { id } => write!(f, "session {id} registered"),
            Event::CapacityExceeded { id } => {
                write!(f, "session {id} rejected: registry at capacity")
            }
            Event::LoggedIn { id, name } => write!(f, "session {id} logged in as {name:?}"),
            Event::Disconnected { id } => write!(f, "session {id} disconnected"),
            Event::Dispatch { id, ptype } => write!(f, "session {id} <- {ptype:?}"),
        }
    }
}

/// Run one connection end to end: register, receive/dispatch until EOF,
/// error, or a cooperative shutdown signal, then logout and unregister.
pub async fn run_session(
    stream: TcpStream,
    id: u64,
    client_registry: Arc<ClientRegistry>,
    player_registry: Arc<PlayerRegistry>,
    clock: Arc<Clock>,
    shutdown: CancellationToken,
    log: Arc<Logger>,
) {
    let (mut reader, writer) = stream.into_split();
    let session = ClientSession::new(id, writer, clock);

    if client_registry.register(session.clone()).is_err() {
        log.warn(Event::CapacityExceeded { id });
        return;
    }
    log.verbose(Event::Registered { id });

    loop {
        let received = tokio::select! {
            res = protocol::recv(&mut reader) => res,
            _ = shutdown.cancelled() => break,
        };

        let (header, payload) = match received {
            Ok(v) => v,
            Err(_) => break,
        };

        log.trace(Event::Dispatch { id, ptype: header.ptype });
        dispatch(&session, &client_registry, &player_registry, header, payload.unwrap_or_default(), &log).await;
    }

    log.info(Event::Disconnected { id });
    let _ = session.logout().await;
    client_registry.unregister(&session);
}

async fn ack(session: &Arc<ClientSession>, id: u8, role: Role, payload: &[u8]) {
    let _ = session.reply(PacketType::Ack, id, role, payload).await;
}

async fn nack(session: &Arc<ClientSession>, id: u8) {
    let _ = session.reply(PacketType::Nack, id, Role::None, &[]).await;
}

/// A bare username: UTF-8 already guaranteed by the caller's decode, no
/// embedded NUL/TAB/newline (§3, §9 open question).
fn validate_username(payload: &[u8]) -> Option<String> {
    let name = std::str::from_utf8(payload).ok()?;
    if name.is_empty() || name.contains(['\t', '\0', '\n']) {
        return None;
    }
    Some(name.to_string())
}

async fn dispatch(
    session: &Arc<ClientSession>,
    client_registry: &Arc<ClientRegistry>,
    player_registry: &Arc<PlayerRegistry>,
    header: Header,
    payload: Vec<u8>,
    log: &Arc<Logger>,
) {
    if header.ptype == PacketType::Login {
        if session.is_logged_in() {
            nack(session, header.id).await;
            return;
        }
        let Some(name) = validate_username(&payload) else {
            nack(session, header.id).await;
            return;
        };
        let player = player_registry.register(&name);
        // `client_registry.login` holds the registry's sessions lock across
        // the uniqueness check and the claim itself, so two concurrent LOGIN
        // packets for the same name can't both pass a separate check first.
        match client_registry.login(session, &name, player) {
            Ok(()) => {
                log.info(Event::LoggedIn { id: session.id(), name });
                ack(session, 0, Role::None, &[]).await;
            }
            Err(_) => nack(session, header.id).await,
        }
        return;
    }

    if !session.is_logged_in() {
        nack(session, header.id).await;
        return;
    }

    match header.ptype {
        PacketType::Users => {
            let mut text = String::new();
            for p in client_registry.all_players() {
                text.push_str(&format!("{}\t{}\n", p.username(), p.rating() as i64));
            }
            ack(session, 0, Role::None, text.as_bytes()).await;
        }

        PacketType::Invite => {
            let target_role = header.role;
            if target_role != Role::First && target_role != Role::Second {
                nack(session, header.id).await;
                return;
            }
            let source_role = target_role.other();
            let Ok(target_name) = std::str::from_utf8(&payload) else {
                nack(session, header.id).await;
                return;
            };
            let Some(target) = client_registry.lookup(target_name) else {
                nack(session, header.id).await;
                return;
            };
            match session.make_invitation(&target, source_role, target_role).await {
                Ok(source_id) => ack(session, source_id, Role::None, &[]).await,
                Err(_) => nack(session, header.id).await,
            }
        }

        PacketType::Revoke => match session.revoke_invitation(header.id).await {
            Ok(()) => ack(session, header.id, Role::None, &[]).await,
            Err(_) => nack(session, header.id).await,
        },

        PacketType::Decline => match session.decline_invitation(header.id).await {
            Ok(()) => ack(session, header.id, Role::None, &[]).await,
            Err(_) => nack(session, header.id).await,
        },

        PacketType::Accept => match session.accept_invitation(header.id).await {
            Ok(state) => ack(session, header.id, Role::None, state.as_bytes()).await,
            Err(_) => nack(session, header.id).await,
        },

        PacketType::Move => {
            let Ok(move_str) = std::str::from_utf8(&payload) else {
                nack(session, header.id).await;
                return;
            };
            match session.make_move(header.id, move_str).await {
                Ok(()) => ack(session, header.id, Role::None, &[]).await,
                Err(_) => nack(session, header.id).await,
            }
        }

        PacketType::Resign => match session.resign_game(header.id).await {
            Ok(()) => ack(session, header.id, Role::None, &[]).await,
            Err(_) => nack(session, header.id).await,
        },

        _ => nack(session, header.id).await,
    }
}
