//! Per-connection state: login, invitation list, write-serialized outbound
//! I/O (§3, §4.7).

use std::sync::{Arc, Mutex};

use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Result, ServerError};
use crate::invitation::{Invitation, State};
use crate::player::{post_result, Outcome, Player};
use crate::protocol::{self, Clock, Header, PacketType, Role};

struct SessionState {
    logged_in: bool,
    player: Option<Arc<Player>>,
    invitations: Vec<(u8, Arc<Invitation>)>,
}

/// A single connected client. Everything here is reachable only through an
/// `Arc<ClientSession>` — the invitation machinery needs to hand peers a
/// `Weak` back-reference to the session that owns a local id (§3
/// ownership graph).
pub struct ClientSession {
    id: u64,
    writer: AsyncMutex<OwnedWriteHalf>,
    clock: Arc<Clock>,
    state: Mutex<SessionState>,
}

impl ClientSession {
    pub fn new(id: u64, writer: OwnedWriteHalf, clock: Arc<Clock>) -> Arc<Self> {
        Arc::new(Self {
            id,
            writer: AsyncMutex::new(writer),
            clock,
            state: Mutex::new(SessionState {
                logged_in: false,
                player: None,
                invitations: Vec::new(),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_logged_in(&self) -> bool {
        self.state.lock().unwrap().logged_in
    }

    pub fn player(&self) -> Option<Arc<Player>> {
        self.state.lock().unwrap().player.clone()
    }

    pub fn username(&self) -> Option<String> {
        self.player().map(|p| p.username().to_string())
    }

    /// Send one packet, serialized under this session's write mutex; I/O
    /// failure is logged-and-swallowed at the call site (§7) — a peer that
    /// has gone away gets reaped by its own session loop, not by us.
    pub async fn notify(&self, ptype: PacketType, id: u8, role: Role, payload: &[u8]) {
        let header = Header::new(ptype, id, role, payload.len() as u16);
        let mut w = self.writer.lock().await;
        let _ = protocol::send(&mut *w, header, payload, &self.clock).await;
    }

    /// Send a reply and propagate I/O failure — used for the ACK/NACK to
    /// the request's own sender, where a broken connection should end that
    /// session's loop rather than be silently dropped.
    pub async fn reply(&self, ptype: PacketType, id: u8, role: Role, payload: &[u8]) -> Result<()> {
        let header = Header::new(ptype, id, role, payload.len() as u16);
        let mut w = self.writer.lock().await;
        protocol::send(&mut *w, header, payload, &self.clock).await
    }

    fn is_self(&self, other: &Arc<ClientSession>) -> bool {
        std::ptr::eq(self, other.as_ref())
    }

    fn local_id_of(&self, inv: &Arc<Invitation>) -> Option<u8> {
        let state = self.state.lock().unwrap();
        state
            .invitations
            .iter()
            .find(|(_, i)| Arc::ptr_eq(i, inv))
            .map(|(id, _)| *id)
    }

    fn find_invitation(&self, local_id: u8) -> Option<Arc<Invitation>> {
        let state = self.state.lock().unwrap();
        state
            .invitations
            .iter()
            .find(|(id, _)| *id == local_id)
            .map(|(_, inv)| inv.clone())
    }

    fn remove_invitation(&self, inv: &Arc<Invitation>) {
        let mut state = self.state.lock().unwrap();
        state.invitations.retain(|(_, i)| !Arc::ptr_eq(i, inv));
    }

    /// Smallest non-negative integer not currently used by this session's
    /// invitation list (§3 "Invitation IDs").
    fn next_local_id(invitations: &[(u8, Arc<Invitation>)]) -> u8 {
        let mut id = 0u8;
        while invitations.iter().any(|(used, _)| *used == id) {
            id = id.checked_add(1).expect("invitation id space exhausted");
        }
        id
    }

    /// Claim `player` for this session. Only checks this session's own
    /// login state; username uniqueness across *other* live sessions
    /// (§4.7) is the caller's responsibility — `ClientRegistry::login`
    /// holds the registry's sessions lock across that check and this call
    /// so the two can't race (§5 lock order: client registry > client
    /// session).
    pub fn login(&self, player: Arc<Player>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.logged_in {
            return Err(ServerError::AlreadyLoggedIn);
        }
        state.logged_in = true;
        state.player = Some(player);
        Ok(())
    }

    /// Walk the invitation list, closing every entry from this session's
    /// side (resign if a game is in progress, else revoke as source or
    /// decline as target), notifying peers as each call does, then clear
    /// login state. The list is snapshotted up front so the walk never
    /// holds `state` across an `.await` (§4.7).
    pub async fn logout(self: &Arc<Self>) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if !state.logged_in {
                return Err(ServerError::NotLoggedIn);
            }
        }

        let invitations: Vec<Arc<Invitation>> = {
            let state = self.state.lock().unwrap();
            state.invitations.iter().map(|(_, inv)| inv.clone()).collect()
        };

        for inv in invitations {
            if inv.state() == State::Accepted {
                let _ = self.do_resign(&inv).await;
            } else if inv.source().map(|s| self.is_self(&s)).unwrap_or(false) {
                let _ = self.do_revoke(&inv).await;
            } else {
                let _ = self.do_decline(&inv).await;
            }
        }

        let mut state = self.state.lock().unwrap();
        state.logged_in = false;
        state.player = None;
        Ok(())
    }

    /// Offer `target_role` to `target`, assigning each side's own local id
    /// independently. Returns the source's local id.
    pub async fn make_invitation(
        self: &Arc<Self>,
        target: &Arc<ClientSession>,
        source_role: Role,
        target_role: Role,
    ) -> Result<u8> {
        if self.is_self(target) {
            return Err(ServerError::WrongSide);
        }
        if !target.is_logged_in() {
            return Err(ServerError::NotLoggedIn);
        }
        let username = self.username().ok_or(ServerError::NotLoggedIn)?;

        let inv = Arc::new(Invitation::new(
            Arc::downgrade(self),
            Arc::downgrade(target),
            source_role,
            target_role,
        ));

        let source_id = {
            let mut state = self.state.lock().unwrap();
            let id = Self::next_local_id(&state.invitations);
            state.invitations.push((id, inv.clone()));
            id
        };
        let target_id = {
            let mut state = target.state.lock().unwrap();
            let id = Self::next_local_id(&state.invitations);
            state.invitations.push((id, inv.clone()));
            id
        };

        target
            .notify(PacketType::Invited, target_id, target_role, username.as_bytes())
            .await;

        Ok(source_id)
    }

    pub async fn revoke_invitation(&self, local_id: u8) -> Result<()> {
        let inv = self.find_invitation(local_id).ok_or(ServerError::UnknownId)?;
        self.do_revoke(&inv).await
    }

    async fn do_revoke(&self, inv: &Arc<Invitation>) -> Result<()> {
        let source = inv.source().ok_or(ServerError::PeerGone)?;
        if !self.is_self(&source) {
            return Err(ServerError::WrongSide);
        }
        if inv.state() != State::Open {
            return Err(ServerError::WrongState);
        }
        inv.close(Role::None)?;
        self.remove_invitation(inv);
        if let Some(target) = inv.target() {
            let target_id = target.local_id_of(inv);
            target.remove_invitation(inv);
            if let Some(target_id) = target_id {
                target.notify(PacketType::Revoked, target_id, Role::None, &[]).await;
            }
        }
        Ok(())
    }

    pub async fn decline_invitation(&self, local_id: u8) -> Result<()> {
        let inv = self.find_invitation(local_id).ok_or(ServerError::UnknownId)?;
        self.do_decline(&inv).await
    }

    async fn do_decline(&self, inv: &Arc<Invitation>) -> Result<()> {
        let target = inv.target().ok_or(ServerError::PeerGone)?;
        if !self.is_self(&target) {
            return Err(ServerError::WrongSide);
        }
        if inv.state() != State::Open {
            return Err(ServerError::WrongState);
        }
        inv.close(Role::None)?;
        self.remove_invitation(inv);
        if let Some(source) = inv.source() {
            let source_id = source.local_id_of(inv);
            source.remove_invitation(inv);
            if let Some(source_id) = source_id {
                source.notify(PacketType::Declined, source_id, Role::None, &[]).await;
            }
        }
        Ok(())
    }

    /// Accept as the target. Returns the payload for the *accepting*
    /// session's own ACK: empty if the source moves first (the initial
    /// state instead goes out asynchronously to the source), or the
    /// rendered initial state if the target moves first (§4.7).
    pub async fn accept_invitation(&self, local_id: u8) -> Result<String> {
        let inv = self.find_invitation(local_id).ok_or(ServerError::UnknownId)?;
        let target = inv.target().ok_or(ServerError::PeerGone)?;
        if !self.is_self(&target) {
            return Err(ServerError::WrongSide);
        }

        let game = inv.accept()?;
        let rendered = game.lock().unwrap().render();

        let Some(source) = inv.source() else {
            return Ok(String::new());
        };
        let source_id = source.local_id_of(&inv);

        if inv.source_role() == Role::First {
            if let Some(source_id) = source_id {
                source
                    .notify(PacketType::Accepted, source_id, Role::None, rendered.as_bytes())
                    .await;
            }
            Ok(String::new())
        } else {
            if let Some(source_id) = source_id {
                source.notify(PacketType::Accepted, source_id, Role::None, &[]).await;
            }
            Ok(rendered)
        }
    }

    /// Apply a move, notify the opponent, and — if that move ends the game
    /// — notify both sides and post the Elo result (§4.7).
    pub async fn make_move(&self, local_id: u8, move_str: &str) -> Result<()> {
        let inv = self.find_invitation(local_id).ok_or(ServerError::UnknownId)?;
        let source = inv.source().ok_or(ServerError::PeerGone)?;
        let target = inv.target().ok_or(ServerError::PeerGone)?;
        let my_role = if self.is_self(&source) {
            inv.source_role()
        } else if self.is_self(&target) {
            inv.target_role()
        } else {
            return Err(ServerError::WrongSide);
        };

        let game = inv.game().ok_or(ServerError::NoGame)?;

        let mv = {
            let g = game.lock().unwrap();
            if g.terminated() {
                return Err(ServerError::NoGame);
            }
            g.parse_move(my_role, move_str)?
        };

        {
            let mut g = game.lock().unwrap();
            g.apply(my_role, mv)?;
        }

        let (rendered, terminated, winner) = {
            let g = game.lock().unwrap();
            (g.render(), g.terminated(), g.winner())
        };

        let opponent = if self.is_self(&source) { &target } else { &source };
        if let Some(opp_id) = opponent.local_id_of(&inv) {
            opponent
                .notify(PacketType::Moved, opp_id, Role::None, rendered.as_bytes())
                .await;
        }

        if terminated {
            if let Some(my_id) = self.local_id_of(&inv) {
                self.notify(PacketType::Ended, my_id, winner, &[]).await;
            }
            if let Some(opp_id) = opponent.local_id_of(&inv) {
                opponent.notify(PacketType::Ended, opp_id, winner, &[]).await;
            }

            self.remove_invitation(&inv);
            opponent.remove_invitation(&inv);

            if let (Some(p1), Some(p2)) = (source.player(), target.player()) {
                let outcome = match winner {
                    Role::None => Outcome::Draw,
                    r if inv.source_role() == r => Outcome::FirstWins,
                    _ => Outcome::SecondWins,
                };
                post_result(&p1, &p2, outcome);
            }
        }

        Ok(())
    }

    pub async fn resign_game(&self, local_id: u8) -> Result<()> {
        let inv = self.find_invitation(local_id).ok_or(ServerError::UnknownId)?;
        self.do_resign(&inv).await
    }

    async fn do_resign(&self, inv: &Arc<Invitation>) -> Result<()> {
        let source = inv.source().ok_or(ServerError::PeerGone)?;
        let target = inv.target().ok_or(ServerError::PeerGone)?;
        let my_role = if self.is_self(&source) {
            inv.source_role()
        } else if self.is_self(&target) {
            inv.target_role()
        } else {
            return Err(ServerError::WrongSide);
        };

        {
            let game = inv.game().ok_or(ServerError::NoGame)?;
            if game.lock().unwrap().terminated() {
                return Err(ServerError::NoGame);
            }
        }

        inv.close(my_role)?;
        let winner = inv.game().map(|g| g.lock().unwrap().winner()).unwrap_or(Role::None);

        let opponent = if self.is_self(&source) { &target } else { &source };
        if let Some(opp_id) = opponent.local_id_of(inv) {
            opponent.notify(PacketType::Resigned, opp_id, Role::None, &[]).await;
        }
        if let Some(my_id) = self.local_id_of(inv) {
            self.notify(PacketType::Ended, my_id, winner, &[]).await;
        }
        if let Some(opp_id) = opponent.local_id_of(inv) {
            opponent.notify(PacketType::Ended, opp_id, winner, &[]).await;
        }

        self.remove_invitation(inv);
        opponent.remove_invitation(inv);

        if let (Some(p1), Some(p2)) = (source.player(), target.player()) {
            let outcome = if inv.source_role() == winner {
                Outcome::FirstWins
            } else {
                Outcome::SecondWins
            };
            post_result(&p1, &p2, outcome);
        }

        Ok(())
    }
}
