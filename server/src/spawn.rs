//! Spawn point selection
//!
//! Spawns should be safe from the nearest enemy without dropping a player far
//! away from everyone else. The ring of fixed candidates is tried first, then
//! random interior points, then the safest ring point, then the arena centre.

use rand::Rng;
use shared::map::ObstacleMap;
use shared::{TANK_COLLISION_SIZE, TANK_SIZE};

#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// No live player may be closer than this
    pub safe_radius: f32,
    /// Every live player must be closer than this for a ring point to count as "in the action"
    pub action_radius: f32,
    pub random_attempts: usize,
    /// Half-size of the square around the centre that random spawns avoid
    pub center_exclusion: f32,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            safe_radius: 700.0,
            action_radius: 2000.0,
            random_attempts: 100,
            center_exclusion: 400.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Score {
    point: (f32, f32),
    min_dist: f32,
    max_dist: f32,
}

#[derive(Debug, Clone)]
pub struct SpawnSelector {
    candidates: Vec<(f32, f32)>,
    config: SpawnConfig,
}

impl SpawnSelector {
    pub fn new(map: &ObstacleMap, config: SpawnConfig) -> Self {
        Self {
            candidates: map.spawn_ring(),
            config,
        }
    }

    pub fn candidates(&self) -> &[(f32, f32)] {
        &self.candidates
    }

    /// Picks a spawn position given the positions of every live player
    pub fn select<R: Rng>(
        &self,
        map: &ObstacleMap,
        live: &[(f32, f32)],
        rng: &mut R,
    ) -> (f32, f32) {
        let scores: Vec<Score> = self
            .candidates
            .iter()
            .map(|&point| score(point, live))
            .collect();

        let free = |p: (f32, f32)| !map.collides(p.0, p.1, TANK_COLLISION_SIZE);

        let in_action = scores
            .iter()
            .filter(|s| {
                s.min_dist > self.config.safe_radius && s.max_dist < self.config.action_radius
            })
            .filter(|s| free(s.point))
            .min_by(|a, b| a.min_dist.total_cmp(&b.min_dist));
        if let Some(best) = in_action {
            return best.point;
        }

        if let Some(point) = self.random_safe_point(map, live, rng) {
            return point;
        }

        let safest = scores
            .iter()
            .max_by(|a, b| a.min_dist.total_cmp(&b.min_dist));
        match safest {
            Some(s) if free(s.point) => s.point,
            _ => map.center(),
        }
    }

    fn random_safe_point<R: Rng>(
        &self,
        map: &ObstacleMap,
        live: &[(f32, f32)],
        rng: &mut R,
    ) -> Option<(f32, f32)> {
        let margin = TANK_SIZE * 2.0 + map.border;
        if map.width <= 2.0 * margin || map.height <= 2.0 * margin {
            return None;
        }
        let (cx, cy) = map.center();

        for _ in 0..self.config.random_attempts {
            let x = rng.gen_range(margin..map.width - margin);
            let y = rng.gen_range(margin..map.height - margin);

            if (x - cx).abs() < self.config.center_exclusion
                && (y - cy).abs() < self.config.center_exclusion
            {
                continue;
            }
            if map.collides(x, y, TANK_COLLISION_SIZE) {
                continue;
            }
            let safe = live
                .iter()
                .all(|&(px, py)| distance((x, y), (px, py)) >= self.config.safe_radius);
            if safe {
                return Some((x, y));
            }
        }
        None
    }
}

fn score(point: (f32, f32), live: &[(f32, f32)]) -> Score {
    let mut min_dist = f32::INFINITY;
    let mut max_dist = 0.0f32;
    for &other in live {
        let d = distance(point, other);
        min_dist = min_dist.min(d);
        max_dist = max_dist.max(d);
    }
    Score {
        point,
        min_dist,
        max_dist,
    }
}

fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    (a.0 - b.0).hypot(a.1 - b.1)
}
