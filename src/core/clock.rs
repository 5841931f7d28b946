//! World State Clock
//!
//! In-game age and time of day, derived from how long ago the world was
//! created. The result is a pure function of two timestamps; nothing is
//! accumulated tick by tick, so observers asking at the same instant always
//! agree.

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// How many game seconds pass per real second.
pub const GAME_ONE_SECOND: i64 = 72;

/// Length of one game day in game seconds.
pub const GAME_DAY_SECONDS: i64 = 24_000;

/// Length of one game day in real seconds (20 minutes).
pub const REAL_SECONDS_PER_GAME_DAY: i64 = 86_400 / GAME_ONE_SECOND;

const REAL_MILLIS_PER_GAME_DAY: i64 = REAL_SECONDS_PER_GAME_DAY * 1000;

/// Derived world time, sent to clients as `world_state`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldState {
    /// Whole game days since the world was created.
    pub age: i64,
    /// Game seconds elapsed in the current day, in `[0, GAME_DAY_SECONDS)`.
    pub day_time: i64,
}

/// Compute the world state at `now` for a world created at `create_time`.
///
/// A `now` earlier than `create_time` (clock skew) counts as zero elapsed.
pub fn refresh(now: DateTime<Utc>, create_time: DateTime<Utc>) -> WorldState {
    let elapsed_ms = (now - create_time).num_milliseconds().max(0);
    let age = elapsed_ms / REAL_MILLIS_PER_GAME_DAY;
    let into_day_ms = elapsed_ms % REAL_MILLIS_PER_GAME_DAY;
    // i128 keeps the product exact for any representable elapsed time
    let day_time = (into_day_ms as i128 * GAME_DAY_SECONDS as i128
        / REAL_MILLIS_PER_GAME_DAY as i128) as i64;

    WorldState { age, day_time }
}
