//! The two-sided OPEN/ACCEPTED/CLOSED invitation state machine (§4.6).
//!
//! An `Invitation` is shared by exactly two `ClientSession`s. Per the
//! ownership graph in §3 ("all back references are non-owning"), the
//! invitation's links back to its two sessions are `Weak` — the owning
//! direction is each session's own invitation list holding an `Arc` to
//! this object. That keeps the session/invitation pair free of reference
//! cycles without needing the C original's "the mutator remembers to break
//! the cycle on close" discipline (see DESIGN.md OQ-2).

use std::sync::{Arc, Mutex, Weak};

use crate::client_session::ClientSession;
use crate::error::{Result, ServerError};
use crate::game::Game;
use crate::protocol::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Open,
    Accepted,
    Closed,
}

struct Inner {
    state: State,
    game: Option<Arc<Mutex<Game>>>,
}

pub struct Invitation {
    source: Weak<ClientSession>,
    target: Weak<ClientSession>,
    source_role: Role,
    target_role: Role,
    inner: Mutex<Inner>,
}

impl Invitation {
    pub fn new(
        source: Weak<ClientSession>,
        target: Weak<ClientSession>,
        source_role: Role,
        target_role: Role,
    ) -> Self {
        debug_assert_ne!(source_role, target_role);
        debug_assert_ne!(source_role, Role::None);
        debug_assert_ne!(target_role, Role::None);
        Self {
            source,
            target,
            source_role,
            target_role,
            inner: Mutex::new(Inner { state: State::Open, game: None }),
        }
    }

    pub fn source(&self) -> Option<Arc<ClientSession>> {
        self.source.upgrade()
    }

    pub fn target(&self) -> Option<Arc<ClientSession>> {
        self.target.upgrade()
    }

    pub fn source_role(&self) -> Role {
        self.source_role
    }

    pub fn target_role(&self) -> Role {
        self.target_role
    }

    pub fn state(&self) -> State {
        self.inner.lock().unwrap().state
    }

    pub fn game(&self) -> Option<Arc<Mutex<Game>>> {
        self.inner.lock().unwrap().game.clone()
    }

    /// OPEN → ACCEPTED: creates the `Game`. Fails if not OPEN.
    pub fn accept(&self) -> Result<Arc<Mutex<Game>>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::Open {
            return Err(ServerError::WrongState);
        }
        let game = Arc::new(Mutex::new(Game::create()));
        inner.game = Some(game.clone());
        inner.state = State::Accepted;
        Ok(game)
    }

    /// `OPEN -> CLOSED` with `role = NONE` and no game; or
    /// `ACCEPTED -> CLOSED` with `role` the resigning side, which resigns
    /// the game on the way out (§4.6).
    pub fn close(&self, role: Role) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Open => {
                if role != Role::None || inner.game.is_some() {
                    return Err(ServerError::WrongState);
                }
                inner.state = State::Closed;
                Ok(())
            }
            State::Accepted => {
                if role == Role::None {
                    return Err(ServerError::WrongState);
                }
                if let Some(game) = &inner.game {
                    // Already terminated games (ended by a move) are closed
                    // without a second resign.
                    let mut g = game.lock().unwrap();
                    if !g.terminated() {
                        g.resign(role)?;
                    }
                }
                inner.state = State::Closed;
                Ok(())
            }
            State::Closed => Err(ServerError::WrongState),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weak_nobody() -> Weak<ClientSession> {
        Weak::new()
    }

    #[test]
    fn open_accepts_once() {
        let inv = Invitation::new(weak_nobody(), weak_nobody(), Role::First, Role::Second);
        assert!(inv.accept().is_ok());
        assert_eq!(inv.state(), State::Accepted);
        assert_eq!(inv.accept().unwrap_err(), ServerError::WrongState);
    }

    #[test]
    fn open_closes_with_none_role() {
        let inv = Invitation::new(weak_nobody(), weak_nobody(), Role::First, Role::Second);
        assert!(inv.close(Role::None).is_ok());
        assert_eq!(inv.state(), State::Closed);
        assert_eq!(inv.close(Role::None).unwrap_err(), ServerError::WrongState);
    }

    #[test]
    fn open_close_rejects_non_none_role() {
        let inv = Invitation::new(weak_nobody(), weak_nobody(), Role::First, Role::Second);
        assert_eq!(inv.close(Role::First).unwrap_err(), ServerError::WrongState);
    }

    #[test]
    fn accepted_close_resigns_the_game() {
        let inv = Invitation::new(weak_nobody(), weak_nobody(), Role::First, Role::Second);
        let game = inv.accept().unwrap();
        inv.close(Role::First).unwrap();
        assert_eq!(inv.state(), State::Closed);
        assert_eq!(game.lock().unwrap().winner(), Role::Second);
    }

    #[test]
    fn accepted_close_rejects_none_role() {
        let inv = Invitation::new(weak_nobody(), weak_nobody(), Role::First, Role::Second);
        inv.accept().unwrap();
        assert_eq!(inv.close(Role::None).unwrap_err(), ServerError::WrongState);
    }

    #[test]
    fn never_transitions_out_of_closed() {
        let inv = Invitation::new(weak_nobody(), weak_nobody(), Role::First, Role::Second);
        inv.close(Role::None).unwrap();
        assert_eq!(inv.accept().unwrap_err(), ServerError::WrongState);
        assert_eq!(inv.close(Role::First).unwrap_err(), ServerError::WrongState);
    }
}
