//! Multi-node turn-loop integration: real nodes exchanging real border
//! messages over in-memory links.

use puckbots_core::{
    BorderLink, BorderMessage, BotId, ControlCommand, HomeSpec, Node, NodeConfig, PuckAction,
    RobotCommand, TeamId, TurnError, Vec2,
};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread;

struct MpscLink {
    tx: Sender<BorderMessage>,
    rx: Receiver<BorderMessage>,
}

impl BorderLink for MpscLink {
    fn send(&mut self, message: BorderMessage) -> Result<(), TurnError> {
        self.tx.send(message).map_err(|_| TurnError::LinkClosed)
    }

    fn recv(&mut self) -> Result<BorderMessage, TurnError> {
        self.rx.recv().map_err(|_| TurnError::LinkClosed)
    }
}

fn cable() -> (MpscLink, MpscLink) {
    let (tx_ab, rx_ab) = channel();
    let (tx_ba, rx_ba) = channel();
    (
        MpscLink {
            tx: tx_ab,
            rx: rx_ba,
        },
        MpscLink {
            tx: tx_ba,
            rx: rx_ab,
        },
    )
}

fn ring_config(index: u32) -> NodeConfig {
    NodeConfig {
        world_size: 400.0,
        min_x: 200.0 * index as f32,
        max_x: 200.0 * (index + 1) as f32,
        node_index: index,
        teams: 2,
        robots_per_team: 6,
        first_serial: index * 6,
        pucks: 8,
        robot_radius: 2.0,
        max_speed: 3.0,
        vision_radius: 20.0,
        fov: std::f32::consts::PI,
        pickup_radius: 5.0,
        puck_lifetime: 4,
        sensor_cells: 8,
        score_report_interval: 2,
        home_radius: 15.0,
        homes: vec![
            HomeSpec {
                team: TeamId(0),
                x: 100.0,
                y: 100.0,
            },
            HomeSpec {
                team: TeamId(1),
                x: 300.0,
                y: 300.0,
            },
        ],
        rng_seed: Some(42),
    }
}

/// Queue a full round of commands so robots keep moving and foraging.
fn drive(node: &mut Node) {
    for team in 0..node.config().teams {
        let sense = node.sense_payload(TeamId(team));
        let robots = sense
            .robots
            .iter()
            .map(|robot| RobotCommand {
                id: robot.id,
                action: PuckAction::Pickup,
                speed: 3.0,
                turn_rate: 0.07 * ((robot.id % 5) as f32 - 2.0),
                last_x: robot.x,
                last_y: robot.y,
                memory: robot.memory.clone(),
            })
            .collect();
        node.queue_command(ControlCommand {
            team: TeamId(team),
            robots,
        });
    }
}

#[test]
fn two_node_ring_conserves_entities() {
    let (n0_left, n1_right) = cable();
    let (n0_right, n1_left) = cable();

    let spawn = |config: NodeConfig, mut left: MpscLink, mut right: MpscLink| {
        thread::spawn(move || -> Result<Node, TurnError> {
            let mut node = Node::new(config).expect("node");
            for _ in 0..40 {
                drive(&mut node);
                node.run_turn(&mut left, &mut right)?;
            }
            Ok(node)
        })
    };
    let handle0 = spawn(ring_config(0), n0_left, n0_right);
    let handle1 = spawn(ring_config(1), n1_left, n1_right);

    let node0 = handle0.join().expect("join 0").expect("turns 0");
    let node1 = handle1.join().expect("join 1").expect("turns 1");

    assert_eq!(node0.robot_count() + node1.robot_count(), 24);
    assert_eq!(node0.puck_count() + node1.puck_count(), 16);

    let mut ids: Vec<BotId> = Vec::new();
    for node in [&node0, &node1] {
        for robot in node.robots() {
            assert!(
                node.config().contains_x(robot.pos.x),
                "robot {} at x={} outside strip [{}, {})",
                robot.bot,
                robot.pos.x,
                node.config().min_x,
                node.config().max_x,
            );
            assert!(!ids.contains(&robot.bot), "{} resident twice", robot.bot);
            ids.push(robot.bot);
        }
        node.assert_coherent();
    }
}

#[test]
fn commanded_robot_hands_off_to_the_left_neighbour() {
    let (n0_left, n1_right) = cable();
    let (n0_right, n1_left) = cable();

    let mut quiet_config = ring_config(0);
    quiet_config.robots_per_team = 0;
    quiet_config.pucks = 0;
    let mut node0 = Node::new(quiet_config).expect("node0");
    let mut peer_config = ring_config(1);
    peer_config.robots_per_team = 0;
    peer_config.pucks = 0;
    let mut node1 = Node::new(peer_config).expect("node1");

    let bot = BotId {
        team: TeamId(0),
        serial: 0,
    };
    node0.place_robot(bot, Vec2::new(1.0, 50.0), std::f32::consts::PI);
    node0.queue_command(ControlCommand {
        team: TeamId(0),
        robots: vec![RobotCommand {
            id: 0,
            action: PuckAction::None,
            speed: 3.0,
            turn_rate: 0.0,
            last_x: 1.0,
            last_y: 50.0,
            memory: Default::default(),
        }],
    });

    let worker = thread::spawn(move || -> Result<Node, TurnError> {
        let mut left = n0_left;
        let mut right = n0_right;
        for _ in 0..2 {
            node0.run_turn(&mut left, &mut right)?;
        }
        Ok(node0)
    });
    let mut left = n1_left;
    let mut right = n1_right;
    for _ in 0..2 {
        node1.run_turn(&mut left, &mut right).expect("node1 turn");
    }
    let node0 = worker.join().expect("join").expect("turns");

    assert_eq!(node0.robot_count(), 0);
    let key = node1.robot_key(bot).expect("robot crossed to node1");
    let robot = node1.robot(key).expect("resident");
    assert!(
        robot.pos.x > 390.0 && robot.pos.x < 400.0,
        "crossed the world seam into the right end of node1's strip",
    );
}

#[test]
fn single_node_self_ring_runs_sequentially() {
    let mut config = ring_config(0);
    config.max_x = 400.0;
    config.robots_per_team = 5;
    config.pucks = 6;
    let mut node = Node::new(config).expect("node");

    // Both links loop back: every send lands in this node's own inbox
    // before the matching blocking receive, so one thread suffices.
    let (mut left, mut right) = cable();
    for _ in 0..10 {
        drive(&mut node);
        node.run_turn(&mut left, &mut right).expect("turn");
    }
    assert_eq!(node.robot_count(), 10);
    assert_eq!(node.puck_count(), 6);
    node.assert_coherent();
}
