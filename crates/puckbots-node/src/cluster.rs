//! In-process cluster harness: N node threads in a ring, one client thread
//! per team per node, and a coordinator on the calling thread.
//!
//! Deployments run one process per strip; this harness wires the same
//! roles over channels so the full protocol can run inside one process.

use crate::controller::{Controller, ControllerKind};
use crate::links::{self, ChannelBorderLink, ClientHandle, ClientToNode, NodeHandle, NodeToClient};
use crate::runner::NodeRunner;
use puckbots_core::{
    ConfigError, ControlCommand, DoneSignal, HomeSpec, Node, NodeConfig, TeamId, TurnBeginSignal,
    TurnError, Vec2,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::thread;
use thiserror::Error;
use tracing::{info, warn};

/// Errors surfaced while assembling or running a cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Turn(#[from] TurnError),
    #[error("node thread panicked")]
    NodePanicked,
}

/// Whole-simulation configuration; per-node configs are derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: u32,
    pub turns: u64,
    pub world_size: f32,
    pub teams: u16,
    pub robots_per_team_per_node: u32,
    pub pucks_per_node: u32,
    pub robot_radius: f32,
    pub max_speed: f32,
    pub vision_radius: f32,
    pub fov: f32,
    pub pickup_radius: f32,
    pub puck_lifetime: u32,
    pub sensor_cells: u32,
    pub score_report_interval: u32,
    pub home_radius: f32,
    pub controller: ControllerKind,
    pub rng_seed: Option<u64>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: 2,
            turns: 300,
            world_size: 1_000.0,
            teams: 2,
            robots_per_team_per_node: 8,
            pucks_per_node: 24,
            robot_radius: 2.0,
            max_speed: 2.5,
            vision_radius: 60.0,
            fov: std::f32::consts::PI,
            pickup_radius: 4.0,
            puck_lifetime: 20,
            sensor_cells: 16,
            score_report_interval: 5,
            home_radius: 20.0,
            controller: ControllerKind::Forager,
            rng_seed: None,
        }
    }
}

impl ClusterConfig {
    /// The global home list, one per team, spread along the diagonal.
    #[must_use]
    pub fn homes(&self) -> Vec<HomeSpec> {
        (0..self.teams)
            .map(|team| {
                let fraction = (f32::from(team) + 0.5) / f32::from(self.teams);
                HomeSpec {
                    team: TeamId(team),
                    x: fraction * self.world_size,
                    y: fraction * self.world_size,
                }
            })
            .collect()
    }

    /// Derive the strip configuration for one node of the ring.
    #[must_use]
    pub fn node_config(&self, index: u32) -> NodeConfig {
        let width = self.world_size / self.nodes as f32;
        let max_x = if index + 1 == self.nodes {
            self.world_size
        } else {
            width * (index + 1) as f32
        };
        NodeConfig {
            world_size: self.world_size,
            min_x: width * index as f32,
            max_x,
            node_index: index,
            teams: self.teams,
            robots_per_team: self.robots_per_team_per_node,
            first_serial: index * self.robots_per_team_per_node,
            pucks: self.pucks_per_node,
            robot_radius: self.robot_radius,
            max_speed: self.max_speed,
            vision_radius: self.vision_radius,
            fov: self.fov,
            pickup_radius: self.pickup_radius,
            puck_lifetime: self.puck_lifetime,
            sensor_cells: self.sensor_cells,
            score_report_interval: self.score_report_interval,
            home_radius: self.home_radius,
            homes: self.homes(),
            rng_seed: self.rng_seed,
        }
    }
}

/// Final cluster state once the coordinator has shut everything down.
pub struct ClusterOutcome {
    pub nodes: Vec<Node>,
    /// Score totals aggregated from every reported delta, sorted by team.
    pub scores: Vec<(TeamId, u32)>,
}

/// Build the ring, spawn node and client threads, and coordinate turns on
/// the calling thread until `config.turns` have completed.
pub fn run_cluster(config: &ClusterConfig) -> Result<ClusterOutcome, ClusterError> {
    if config.nodes == 0 {
        return Err(ConfigError::Invalid("cluster needs at least one node").into());
    }
    if config.turns == 0 {
        return Err(ConfigError::Invalid("cluster needs at least one turn").into());
    }

    let count = config.nodes as usize;
    let mut lefts: Vec<Option<ChannelBorderLink>> = (0..count).map(|_| None).collect();
    let mut rights: Vec<Option<ChannelBorderLink>> = (0..count).map(|_| None).collect();
    for index in 0..count {
        let (left_half, right_half) = links::border_cable();
        lefts[index] = Some(left_half);
        rights[(index + count - 1) % count] = Some(right_half);
    }

    let homes = config.homes();
    let mut node_threads = Vec::with_capacity(count);
    let mut client_threads = Vec::new();
    let mut coordinator_handles: Vec<NodeHandle> = Vec::with_capacity(count);

    for index in 0..count {
        let node = Node::new(config.node_config(index as u32))?;
        let mut ports = Vec::with_capacity(config.teams as usize);
        for team in 0..config.teams {
            let (port, handle) = links::client_cable();
            ports.push(port);
            let client_id = index as u32 * u32::from(config.teams) + u32::from(team);
            let home = homes[team as usize];
            let controller = config.controller.build(
                Vec2::new(home.x, home.y),
                config.world_size,
                config.max_speed,
                config.pickup_radius,
            );
            client_threads.push(thread::spawn(move || {
                run_client(handle, client_id, TeamId(team), controller);
            }));
        }
        let (coordinator_port, node_handle) = links::coordinator_cable();
        coordinator_handles.push(node_handle);
        let left = lefts[index].take().expect("left link wired");
        let right = rights[index].take().expect("right link wired");
        node_threads.push(thread::spawn(move || {
            NodeRunner::new(node, left, right, ports, coordinator_port).run()
        }));
    }

    let mut totals: HashMap<TeamId, u32> = HashMap::new();
    for turn in 1..=config.turns {
        for handle in &coordinator_handles {
            let done = handle
                .rx
                .recv()
                .map_err(|_| ClusterError::Turn(TurnError::LinkClosed))?;
            for (team, delta) in done.scores {
                *totals.entry(team).or_insert(0) += delta;
                info!(turn, node = done.sender, team = team.0, delta, "score delta");
            }
        }
        let signal = if turn == config.turns {
            TurnBeginSignal::Shutdown
        } else {
            TurnBeginSignal::Proceed
        };
        for handle in &coordinator_handles {
            handle
                .tx
                .send(signal)
                .map_err(|_| ClusterError::Turn(TurnError::LinkClosed))?;
        }
    }

    let mut nodes = Vec::with_capacity(count);
    for handle in node_threads {
        nodes.push(handle.join().map_err(|_| ClusterError::NodePanicked)??);
    }
    for handle in client_threads {
        let _ = handle.join();
    }

    let mut scores: Vec<_> = totals.into_iter().collect();
    scores.sort_by_key(|(team, _)| *team);
    Ok(ClusterOutcome { nodes, scores })
}

/// One client connection: register, then answer every turn's sense payload
/// with a command batch and a done signal until shutdown.
fn run_client(handle: ClientHandle, client: u32, team: TeamId, mut controller: Box<dyn Controller>) {
    if handle
        .tx
        .send(ClientToNode::Register { client, team })
        .is_err()
    {
        return;
    }
    loop {
        match handle.rx.recv() {
            Ok(NodeToClient::Begin(TurnBeginSignal::Proceed)) => {}
            Ok(NodeToClient::Begin(TurnBeginSignal::Shutdown)) | Err(_) => return,
            Ok(NodeToClient::Sense(_)) => {
                warn!(client, "sense payload before turn begin; disconnecting");
                return;
            }
        }
        let sense = match handle.rx.recv() {
            Ok(NodeToClient::Sense(sense)) => sense,
            _ => return,
        };
        let robots = sense
            .robots
            .iter()
            .map(|robot| controller.decide(robot))
            .collect();
        if handle
            .tx
            .send(ClientToNode::Command(ControlCommand { team, robots }))
            .is_err()
        {
            return;
        }
        if handle
            .tx
            .send(ClientToNode::Done(DoneSignal {
                sender: client,
                scores: Vec::new(),
            }))
            .is_err()
        {
            return;
        }
    }
}
