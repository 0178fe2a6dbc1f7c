//! Distance-based round scoring and leaderboard ranking.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::player::{Participant, UserId};
use crate::round::{Coordinates, Guess, LeaderboardEntry, RoundScore, Target};

/// Points awarded for a perfect guess.
pub const MAX_POINTS: u32 = 5000;

/// Distance at which the score has decayed to `MAX_POINTS / e`.
pub const DECAY_KM: f64 = 2000.0;

/// Guesses closer than this count as perfect.
pub const PERFECT_RADIUS_KM: f64 = 0.025;

const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Great-circle distance between two points (haversine).
pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// Exponential decay from `MAX_POINTS`. Never increases with distance.
pub fn points_for_distance(distance_km: f64) -> u32 {
    if !distance_km.is_finite() || distance_km < 0.0 {
        return 0;
    }
    if distance_km <= PERFECT_RADIUS_KM {
        return MAX_POINTS;
    }
    let raw = f64::from(MAX_POINTS) * (-distance_km / DECAY_KM).exp();
    (raw.round() as u32).min(MAX_POINTS)
}

/// Score every participant for a closed round.
///
/// Ordering: points descending, then guessers before non-guessers, then
/// earlier submission, then user id. Ranks follow that order, so equal
/// points never share a rank.
pub fn score_round(
    target: &Target,
    guesses: &BTreeMap<UserId, Guess>,
    participants: &[Participant],
) -> Vec<RoundScore> {
    let mut rows: Vec<(RoundScore, Option<u32>)> = participants
        .iter()
        .map(|p| {
            let guess = guesses.get(&p.user_id);
            let distance_km = guess.map(|g| haversine_km(g.coordinates, target.coordinates));
            let points = distance_km.map(points_for_distance).unwrap_or(0);
            (
                RoundScore {
                    user_id: p.user_id,
                    display_name: p.display_name.clone(),
                    points,
                    distance_km,
                    rank: 0,
                },
                guess.map(|g| g.order),
            )
        })
        .collect();

    rows.sort_by(|(a, a_order), (b, b_order)| {
        b.points
            .cmp(&a.points)
            .then_with(|| match (a_order, b_order) {
                (Some(x), Some(y)) => x.cmp(y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| a.user_id.cmp(&b.user_id))
    });

    rows.into_iter()
        .enumerate()
        .map(|(i, (mut score, _))| {
            score.rank = i as u32 + 1;
            score
        })
        .collect()
}

/// Cumulative standings. Equal totals share a rank (1, 1, 3); ties keep
/// lobby join order.
pub fn leaderboard(participants: &[Participant]) -> Vec<LeaderboardEntry> {
    let mut sorted: Vec<&Participant> = participants.iter().collect();
    sorted.sort_by(|a, b| b.cumulative_score.cmp(&a.cumulative_score));

    let mut entries: Vec<LeaderboardEntry> = Vec::with_capacity(sorted.len());
    for (i, p) in sorted.into_iter().enumerate() {
        let rank = match entries.last() {
            Some(prev) if prev.score == p.cumulative_score => prev.rank,
            _ => i as u32 + 1,
        };
        entries.push(LeaderboardEntry {
            user_id: p.user_id,
            display_name: p.display_name.clone(),
            score: p.cumulative_score,
            rank,
        });
    }
    entries
}
