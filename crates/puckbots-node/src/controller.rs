//! Controller strategies clients run per robot.
//!
//! The core's only contract with a controller is the sense/command payload
//! shape, so behaviours are plain trait objects chosen by configuration
//! rather than runtime-loaded plugins.

use puckbots_core::{
    PuckAction, RobotCommand, RobotSense, Vec2, normalize_angle, wrap_distance,
};
use serde::{Deserialize, Serialize};

/// Steering limit applied by the shipped strategies.
const MAX_TURN: f32 = 0.35;

/// Per-robot decision logic. One instance drives every robot of a team on
/// one node; per-robot state belongs in the robot's opaque memory.
pub trait Controller: Send {
    fn decide(&mut self, sense: &RobotSense) -> RobotCommand;
}

/// Strategy selector carried in cluster configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ControllerKind {
    /// Constant cruise on a gentle arc; never touches pucks.
    Drift,
    /// Seek the nearest visible puck, carry it home, drop inside the disc.
    #[default]
    Forager,
}

impl ControllerKind {
    #[must_use]
    pub fn build(self, home: Vec2, world_size: f32, cruise: f32, pickup_radius: f32) -> Box<dyn Controller> {
        match self {
            Self::Drift => Box::new(DriftController {
                speed: cruise,
                turn_rate: 0.05,
            }),
            Self::Forager => Box::new(ForagerController {
                home,
                world_size,
                cruise,
                pickup_radius,
            }),
        }
    }
}

/// The trivial strategy: constant speed, constant turn.
#[derive(Debug, Clone, Copy)]
pub struct DriftController {
    pub speed: f32,
    pub turn_rate: f32,
}

impl Controller for DriftController {
    fn decide(&mut self, sense: &RobotSense) -> RobotCommand {
        RobotCommand {
            id: sense.id,
            action: PuckAction::None,
            speed: self.speed,
            turn_rate: self.turn_rate,
            last_x: sense.x,
            last_y: sense.y,
            memory: sense.memory.clone(),
        }
    }
}

/// Greedy forager: steer at the nearest free puck, pick it up in range,
/// then head for the team home and drop inside the capture disc.
#[derive(Debug, Clone, Copy)]
pub struct ForagerController {
    pub home: Vec2,
    pub world_size: f32,
    pub cruise: f32,
    pub pickup_radius: f32,
}

impl Controller for ForagerController {
    fn decide(&mut self, sense: &RobotSense) -> RobotCommand {
        let mut action = PuckAction::None;
        let mut speed = self.cruise;
        // Wander bias keeps robots sweeping when nothing is visible.
        let mut turn_rate = 0.12;

        if sense.has_puck {
            let dx = wrap_distance(self.home.x - sense.x, self.world_size);
            let dy = wrap_distance(self.home.y - sense.y, self.world_size);
            let dist_sq = dx * dx + dy * dy;
            if dist_sq <= self.pickup_radius * self.pickup_radius {
                action = PuckAction::Drop;
                speed = 0.0;
                turn_rate = 0.0;
            } else {
                turn_rate =
                    normalize_angle(dy.atan2(dx) - sense.a).clamp(-MAX_TURN, MAX_TURN);
            }
        } else if let Some(nearest) = sense
            .seen_pucks
            .iter()
            .filter(|puck| !puck.held)
            .min_by(|a, b| a.range.total_cmp(&b.range))
        {
            if nearest.range <= self.pickup_radius {
                action = PuckAction::Pickup;
                speed = 0.0;
                turn_rate = 0.0;
            } else {
                turn_rate = nearest.bearing.clamp(-MAX_TURN, MAX_TURN);
            }
        }

        RobotCommand {
            id: sense.id,
            action,
            speed,
            turn_rate,
            last_x: sense.x,
            last_y: sense.y,
            memory: sense.memory.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use puckbots_core::{ControllerMemory, SeenPuck};

    fn sense(id: u32, has_puck: bool, seen_pucks: Vec<SeenPuck>) -> RobotSense {
        RobotSense {
            id,
            x: 100.0,
            y: 100.0,
            a: 0.0,
            has_puck,
            collided: false,
            last_x: 0.0,
            last_y: 0.0,
            memory: ControllerMemory::default(),
            seen_robots: Vec::new(),
            seen_pucks,
        }
    }

    fn forager() -> ForagerController {
        ForagerController {
            home: Vec2::new(100.0, 100.0),
            world_size: 400.0,
            cruise: 2.0,
            pickup_radius: 4.0,
        }
    }

    #[test]
    fn forager_picks_up_the_nearest_free_puck() {
        let mut controller = forager();
        let command = controller.decide(&sense(
            3,
            false,
            vec![
                SeenPuck {
                    range: 9.0,
                    bearing: 0.4,
                    held: false,
                },
                SeenPuck {
                    range: 3.0,
                    bearing: -0.1,
                    held: false,
                },
                SeenPuck {
                    range: 1.0,
                    bearing: 0.0,
                    held: true,
                },
            ],
        ));
        assert_eq!(command.id, 3);
        assert_eq!(command.action, PuckAction::Pickup, "held pucks are skipped");
        assert_eq!(command.speed, 0.0);
    }

    #[test]
    fn forager_steers_toward_distant_pucks() {
        let mut controller = forager();
        let command = controller.decide(&sense(
            0,
            false,
            vec![SeenPuck {
                range: 20.0,
                bearing: -0.2,
                held: false,
            }],
        ));
        assert_eq!(command.action, PuckAction::None);
        assert!((command.turn_rate + 0.2).abs() < 1e-6);
        assert_eq!(command.speed, 2.0);
    }

    #[test]
    fn forager_drops_over_its_home() {
        let mut controller = forager();
        // Standing on the home centre while carrying.
        let command = controller.decide(&sense(1, true, Vec::new()));
        assert_eq!(command.action, PuckAction::Drop);
    }

    #[test]
    fn drift_controller_is_constant() {
        let mut controller = DriftController {
            speed: 1.0,
            turn_rate: 0.05,
        };
        let command = controller.decide(&sense(2, false, Vec::new()));
        assert_eq!(command.action, PuckAction::None);
        assert_eq!(command.speed, 1.0);
        assert_eq!(command.turn_rate, 0.05);
    }
}
