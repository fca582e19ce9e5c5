//! Named identity with an Elo-style rating (§4.3).

use std::sync::Mutex;

/// One username, one rating, for the life of the process.
///
/// `username` is immutable; `rating` is the only mutable field, guarded by
/// its own mutex per the lock-ordering table in §5 (client session >
/// invitation > game > player).
pub struct Player {
    username: String,
    rating: Mutex<f64>,
}

pub const INITIAL_RATING: f64 = 1500.0;
const K_FACTOR: f64 = 32.0;

impl Player {
    pub fn new(username: String) -> Self {
        Self { username, rating: Mutex::new(INITIAL_RATING) }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Best-effort snapshot of the current rating (§4.3).
    pub fn rating(&self) -> f64 {
        *self.rating.lock().unwrap()
    }

    fn expected_score(r_self: f64, r_other: f64) -> f64 {
        1.0 / (1.0 + 10f64.powf((r_other - r_self) / 400.0))
    }
}

/// Outcome of a finished game, as seen by `post_result`'s first-listed
/// player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Draw,
    FirstWins,
    SecondWins,
}

/// Apply an Elo update to both players (§4.3). Always ordered
/// `(p1, p2, outcome)`; the session loop always calls this with the
/// invitation's source player first and target player second.
pub fn post_result(p1: &Player, p2: &Player, outcome: Outcome) {
    let (s1, s2) = match outcome {
        Outcome::Draw => (0.5, 0.5),
        Outcome::FirstWins => (1.0, 0.0),
        Outcome::SecondWins => (0.0, 1.0),
    };

    // Lock both ratings together; ordering by username keeps the lock
    // order consistent across concurrent calls that share a player.
    let (r1, r2) = if p1.username <= p2.username {
        let mut r1 = p1.rating.lock().unwrap();
        let mut r2 = p2.rating.lock().unwrap();
        let e1 = Player::expected_score(*r1, *r2);
        let e2 = Player::expected_score(*r2, *r1);
        *r1 += K_FACTOR * (s1 - e1);
        *r2 += K_FACTOR * (s2 - e2);
        (*r1, *r2)
    } else {
        let mut r2 = p2.rating.lock().unwrap();
        let mut r1 = p1.rating.lock().unwrap();
        let e1 = Player::expected_score(*r1, *r2);
        let e2 = Player::expected_score(*r2, *r1);
        *r1 += K_FACTOR * (s1 - e1);
        *r2 += K_FACTOR * (s2 - e2);
        (*r1, *r2)
    };
    let _ = (r1, r2);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_ratings_win_loss_matches_spec_example() {
        let p1 = Player::new("alice".into());
        let p2 = Player::new("bob".into());
        post_result(&p1, &p2, Outcome::FirstWins);
        assert_eq!(p1.rating(), 1516.0);
        assert_eq!(p2.rating(), 1484.0);
    }

    #[test]
    fn draw_conserves_total_rating() {
        let p1 = Player::new("alice".into());
        let p2 = Player::new("carol".into());
        let before = p1.rating() + p2.rating();
        post_result(&p1, &p2, Outcome::Draw);
        let after = p1.rating() + p2.rating();
        assert!((before - after).abs() < 1e-9);
    }

    #[test]
    fn expected_scores_sum_to_one() {
        let e1 = Player::expected_score(1600.0, 1400.0);
        let e2 = Player::expected_score(1400.0, 1600.0);
        assert!((e1 + e2 - 1.0).abs() < 1e-9);
    }
}
