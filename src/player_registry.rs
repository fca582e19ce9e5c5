//! Username → `Player` interning, process-lifetime entries (§4.4).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::player::Player;

#[derive(Default)]
pub struct PlayerRegistry {
    players: Mutex<HashMap<String, Arc<Player>>>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the existing `Player` for `name`, or create and insert one.
    /// Never removes entries — a username lives as long as the process.
    pub fn register(&self, name: &str) -> Arc<Player> {
        let mut players = self.players.lock().unwrap();
        players
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Player::new(name.to_string())))
            .clone()
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Player>> {
        self.players.lock().unwrap().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent_by_name() {
        let reg = PlayerRegistry::new();
        let a = reg.register("alice");
        let b = reg.register("alice");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn distinct_names_get_distinct_players() {
        let reg = PlayerRegistry::new();
        let a = reg.register("alice");
        let b = reg.register("bob");
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
