use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::entity::{Enemy, EnemySnapshot, EntityMode, Player, PlayerInput, PlayerSnapshot};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlayerSpawn {
    pub position: Vec2,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EnemySpawn {
    pub waypoints: [Vec2; 3],
}

/// Start-data snapshot a room hands to every joining client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomData {
    pub players: Vec<PlayerSpawn>,
    pub enemies: Vec<EnemySpawn>,
}

impl RoomData {
    const SPAWN_RADIUS: f32 = 5.0;
    const PATROL_RADIUS: f32 = 12.0;

    /// Deterministic layout for a room: players evenly spaced on a circle,
    /// three enemies on triangular patrol routes seeded by the room id.
    /// Both sides must derive identical layouts from the join reply, so
    /// there is no randomness here.
    pub fn generate(room_id: u32, players_count: u8) -> Self {
        use std::f32::consts::TAU;

        let players = (0..players_count)
            .map(|i| {
                let a = TAU * i as f32 / players_count as f32;
                PlayerSpawn {
                    position: Vec2::new(a.cos(), a.sin()) * Self::SPAWN_RADIUS,
                }
            })
            .collect();

        let enemies = (0..3u32)
            .map(|i| {
                let base = TAU * (room_id.wrapping_add(i) % 12) as f32 / 12.0;
                let waypoints = std::array::from_fn(|k| {
                    let a = base + TAU * k as f32 / 3.0;
                    Vec2::new(a.cos(), a.sin()) * Self::PATROL_RADIUS
                });
                EnemySpawn { waypoints }
            })
            .collect();

        Self { players, enemies }
    }
}

/// One match worth of entities. Ids are slot indices into the order given
/// by `RoomData`; removing a player shifts every id behind it, so callers
/// must treat ids as invalidated on removal.
pub struct Level {
    players: Vec<Player>,
    enemies: Vec<Enemy>,
}

impl Level {
    /// Authoritative level: everything simulated on the server.
    pub fn new_server(data: &RoomData) -> Self {
        Self::build(data, |_| EntityMode::SimulatedOnServer, EntityMode::SimulatedOnServer)
    }

    /// Client level: the local slot predicts, everything else is cloned.
    pub fn new_client(data: &RoomData, local_player: u8) -> Self {
        Self::build(
            data,
            |id| {
                if id == local_player {
                    EntityMode::SimulatedLagless
                } else {
                    EntityMode::Cloned
                }
            },
            EntityMode::Cloned,
        )
    }

    fn build(
        data: &RoomData,
        player_mode: impl Fn(u8) -> EntityMode,
        enemy_mode: EntityMode,
    ) -> Self {
        let players = data
            .players
            .iter()
            .enumerate()
            .map(|(id, spawn)| Player::new(player_mode(id as u8), spawn.position))
            .collect();

        let enemies = data
            .enemies
            .iter()
            .map(|spawn| Enemy::new(enemy_mode, spawn.waypoints))
            .collect();

        Self { players, enemies }
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn enemy_count(&self) -> usize {
        self.enemies.len()
    }

    pub fn player(&self, id: u8) -> Option<&Player> {
        self.players.get(id as usize)
    }

    pub fn player_mut(&mut self, id: u8) -> Option<&mut Player> {
        self.players.get_mut(id as usize)
    }

    pub fn enemy(&self, id: u8) -> Option<&Enemy> {
        self.enemies.get(id as usize)
    }

    pub fn enemy_mut(&mut self, id: u8) -> Option<&mut Enemy> {
        self.enemies.get_mut(id as usize)
    }

    pub fn players(&self) -> impl Iterator<Item = (u8, &Player)> {
        self.players.iter().enumerate().map(|(i, p)| (i as u8, p))
    }

    pub fn enemies(&self) -> impl Iterator<Item = (u8, &Enemy)> {
        self.enemies.iter().enumerate().map(|(i, e)| (i as u8, e))
    }

    /// Advance every entity to `step`, players first.
    pub fn update(&mut self, step: u32) {
        for player in &mut self.players {
            player.advance(step);
        }
        for enemy in &mut self.enemies {
            enemy.advance(step);
        }
    }

    /// Remove a player slot. Ids behind it shift down by one.
    pub fn delete_player(&mut self, id: u8) {
        if (id as usize) < self.players.len() {
            self.players.remove(id as usize);
        }
    }

    pub fn apply_input(&mut self, player_id: u8, input: PlayerInput) {
        if let Some(player) = self.players.get_mut(player_id as usize) {
            player.record_input(input);
        }
    }

    pub fn apply_player_state(&mut self, player_id: u8, snapshot: PlayerSnapshot) {
        if let Some(player) = self.players.get_mut(player_id as usize) {
            player.record_state(snapshot);
        }
    }

    pub fn apply_enemy_state(&mut self, enemy_id: u8, snapshot: EnemySnapshot) {
        if let Some(enemy) = self.enemies.get_mut(enemy_id as usize) {
            enemy.record_state(snapshot);
        }
    }

    /// Enemies whose interpolated position at time `t` lies within `radius`
    /// of `origin` and within `cone_angle` (radians, full width) of
    /// `aim_angle`. Used for authoritative attack-hit resolution.
    pub fn enemies_in_range(
        &self,
        t: f32,
        origin: Vec2,
        aim_angle: f32,
        radius: f32,
        cone_angle: f32,
    ) -> Vec<u8> {
        use std::f32::consts::{PI, TAU};

        let radius_sq = radius * radius;
        let half_cone = cone_angle * 0.5;

        self.enemies
            .iter()
            .enumerate()
            .filter_map(|(id, enemy)| {
                let to_enemy = enemy.position_at_time(t) - origin;
                if to_enemy.length_squared() > radius_sq {
                    return None;
                }

                let mut delta = (to_enemy.y.atan2(to_enemy.x) - aim_angle) % TAU;
                if delta > PI {
                    delta -= TAU;
                } else if delta < -PI {
                    delta += TAU;
                }
                (delta.abs() <= half_cone).then_some(id as u8)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_layout_is_deterministic() {
        let a = RoomData::generate(7, 2);
        let b = RoomData::generate(7, 2);
        assert_eq!(a.players.len(), 2);
        assert_eq!(a.enemies.len(), 3);
        for (x, y) in a.players.iter().zip(&b.players) {
            assert_eq!(x.position, y.position);
        }
    }

    #[test]
    fn client_level_marks_local_player_lagless() {
        let data = RoomData::generate(1, 3);
        let level = Level::new_client(&data, 1);

        assert_eq!(level.player(0).unwrap().mode(), EntityMode::Cloned);
        assert_eq!(level.player(1).unwrap().mode(), EntityMode::SimulatedLagless);
        assert_eq!(level.player(2).unwrap().mode(), EntityMode::Cloned);
        assert_eq!(level.enemy(0).unwrap().mode(), EntityMode::Cloned);
    }

    #[test]
    fn delete_player_shifts_slots() {
        let data = RoomData::generate(1, 3);
        let mut level = Level::new_server(&data);
        let last_spawn = level.player(2).unwrap().current_position();

        level.delete_player(1);

        assert_eq!(level.player_count(), 2);
        assert_eq!(level.player(1).unwrap().current_position(), last_spawn);
    }

    #[test]
    fn enemies_in_range_filters_by_cone() {
        let data = RoomData {
            players: vec![PlayerSpawn {
                position: Vec2::ZERO,
            }],
            enemies: vec![
                EnemySpawn {
                    waypoints: [Vec2::new(2.0, 0.0); 3],
                },
                EnemySpawn {
                    waypoints: [Vec2::new(-2.0, 0.0); 3],
                },
                EnemySpawn {
                    waypoints: [Vec2::new(50.0, 0.0); 3],
                },
            ],
        };
        let level = Level::new_server(&data);

        // Aim along +x, quarter-circle cone, radius 10: only the first.
        let hits = level.enemies_in_range(0.0, Vec2::ZERO, 0.0, 10.0, std::f32::consts::FRAC_PI_2);
        assert_eq!(hits, vec![0]);

        // Aim along -x instead.
        let hits =
            level.enemies_in_range(0.0, Vec2::ZERO, std::f32::consts::PI, 10.0, std::f32::consts::FRAC_PI_2);
        assert_eq!(hits, vec![1]);
    }
}
