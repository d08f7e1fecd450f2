//! Core simulation types for the PuckBots workspace.
//!
//! A node owns one vertical strip `[min_x, max_x)` of a toroidal world on
//! which robots forage for pucks. Each turn runs a fixed pipeline: promote
//! critical-band entrants, apply queued controller commands, score homes,
//! pose-update every robot outside the border bands, reconcile both strip
//! borders with the neighbouring nodes through the handshake exchange, and
//! finally rebuild visibility from the now-consistent grids. All state is
//! owned by the single turn-loop thread; the only shared surface is the
//! serialized messages defined here.

use ordered_float::OrderedFloat;
use puckbots_index::{BucketGrid, CellId, CellOccupant, CollisionGrid, GridSpec, IndexError};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

new_key_type! {
    /// Stable handle for robots backed by a generational slot map.
    pub struct RobotKey;
    /// Stable handle for pucks backed by a generational slot map.
    pub struct PuckKey;
}

const FULL_TURN: f32 = std::f32::consts::TAU;
const HALF_TURN: f32 = std::f32::consts::PI;
const QUARTER_TURN: f32 = std::f32::consts::FRAC_PI_2;

/// Attempts allowed when rejection-sampling a free position.
const PLACEMENT_ATTEMPTS: u32 = 10_000;

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Fold a coordinate delta onto the torus, yielding the shortest signed
/// displacement in `(-size/2, size/2]`.
#[must_use]
pub fn wrap_distance(d: f32, size: f32) -> f32 {
    if d.is_nan() {
        return 0.0;
    }
    let folded = d.rem_euclid(size);
    if folded > size * 0.5 { folded - size } else { folded }
}

/// Wrap a coordinate into `[0, size)`.
#[must_use]
pub fn wrap_position(value: f32, size: f32) -> f32 {
    if size <= 0.0 || value.is_nan() {
        return 0.0;
    }
    let v = value.rem_euclid(size);
    if v >= size { 0.0 } else { v }
}

/// Normalize an angle into `(-π, π]`.
#[must_use]
pub fn normalize_angle(mut angle: f32) -> f32 {
    if angle.is_nan() {
        return 0.0;
    }
    while angle <= -HALF_TURN {
        angle += FULL_TURN;
    }
    while angle > HALF_TURN {
        angle -= FULL_TURN;
    }
    angle
}

/// Bhaskara I sine approximation.
///
/// Continuous, monotonic on each quarter period, exact at axis crossings,
/// absolute error below 2e-3. Pose integration only needs monotonic,
/// continuous behaviour, not trigonometric accuracy.
#[must_use]
pub fn fast_sin(angle: f32) -> f32 {
    let a = normalize_angle(angle);
    let (a, sign) = if a < 0.0 { (-a, -1.0) } else { (a, 1.0) };
    let q = a * (HALF_TURN - a);
    sign * 16.0 * q / (5.0 * HALF_TURN * HALF_TURN - 4.0 * q)
}

/// Cosine companion to [`fast_sin`].
#[must_use]
pub fn fast_cos(angle: f32) -> f32 {
    fast_sin(angle + QUARTER_TURN)
}

/// Axis-aligned 2D position on the torus.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Squared toroidal distance between two positions.
#[must_use]
pub fn toroidal_dist_sq(a: Vec2, b: Vec2, size: f32) -> f32 {
    let dx = wrap_distance(a.x - b.x, size);
    let dy = wrap_distance(a.y - b.y, size);
    dx * dx + dy * dy
}

/// Unwrapped bounding box; corners may fall outside `[0, size)` and are
/// folded back by cell math.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Aabb {
    pub min: Vec2,
    pub max: Vec2,
}

impl Aabb {
    /// Square box of half-extent `radius` around `center`.
    #[must_use]
    pub fn around(center: Vec2, radius: f32) -> Self {
        Self {
            min: Vec2::new(center.x - radius, center.y - radius),
            max: Vec2::new(center.x + radius, center.y + radius),
        }
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Team discriminant shared across every node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct TeamId(pub u16);

/// Globally unique robot identity; serial numbers are unique within a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BotId {
    pub team: TeamId,
    pub serial: u32,
}

impl fmt::Display for BotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}#{}", self.team.0, self.serial)
    }
}

/// Simulation clock (turns completed since boot).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Turn(pub u64);

impl Turn {
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// One of the two strip borders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const BOTH: [Self; 2] = [Self::Left, Self::Right];

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Left => 0,
            Self::Right => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Opaque controller scratch space, passed through unmodified.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ControllerMemory {
    pub ints: Vec<i32>,
    pub doubles: Vec<f64>,
}

/// Another robot as seen by a sensing robot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SeenRobot {
    pub range: f32,
    pub bearing: f32,
}

/// A puck as seen by a sensing robot (wire form, key erased).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SeenPuck {
    pub range: f32,
    pub bearing: f32,
    pub held: bool,
}

/// A puck sighting retained node-side; keys feed next turn's pickup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PuckSighting {
    pub key: PuckKey,
    pub range: f32,
    pub bearing: f32,
    pub held: bool,
}

/// Critical-band membership of one robot.
///
/// Entrants queue until the next turn so each turn's handshake messages
/// reflect a stable established snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BandState {
    #[default]
    Clear,
    Queued(Side),
    Established(Side),
}

/// One foraging robot resident on this node.
#[derive(Debug, Clone)]
pub struct Robot {
    pub bot: BotId,
    pub pos: Vec2,
    pub heading: f32,
    pub speed: f32,
    pub turn_rate: f32,
    /// Controller-owned position hint, echoed back in sense payloads.
    pub last: Vec2,
    pub collided: bool,
    pub held_puck: Option<PuckKey>,
    pub memory: ControllerMemory,
    /// Cached field-of-view box, refreshed on every committed move.
    pub fov_bbox: Aabb,
    pub sensor_cell: CellId,
    pub collision_cell: CellId,
    pub band: BandState,
    pub seen_robots: Vec<SeenRobot>,
    pub seen_pucks: Vec<PuckSighting>,
}

/// One puck. Never destroyed: relocated on scoring, handed off with its
/// carrier when a robot crosses strips.
#[derive(Debug, Clone)]
pub struct Puck {
    pub pos: Vec2,
    pub held: bool,
    pub owner: Option<RobotKey>,
    pub home: Option<usize>,
    pub lifetime: u32,
    pub sensor_cell: CellId,
}

/// One team's home disc. The full home list is global; only homes whose
/// capture disc intersects this strip take part in scoring here.
#[derive(Debug, Clone)]
pub struct Home {
    pub team: TeamId,
    pub pos: Vec2,
    pub radius: f32,
    /// Running total, monotonically non-decreasing.
    pub score: u32,
    /// Portion not yet drained into a coordinator report.
    pub pending: u32,
    pub local: bool,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Errors raised while validating node configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
    #[error(transparent)]
    Grid(#[from] IndexError),
}

/// Placement of one team's home, shared across all nodes at bootstrap.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct HomeSpec {
    pub team: TeamId,
    pub x: f32,
    pub y: f32,
}

/// Static configuration for one strip node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Side length of the toroidal world, shared by every node.
    pub world_size: f32,
    /// Inclusive left edge of the owned strip.
    pub min_x: f32,
    /// Exclusive right edge of the owned strip.
    pub max_x: f32,
    /// Position of this node in the bootstrap ring.
    pub node_index: u32,
    /// Number of teams in the simulation.
    pub teams: u16,
    /// Robots scattered per team at strip initialisation.
    pub robots_per_team: u32,
    /// First serial number this node may assign, per team. Serial
    /// namespaces are carved up by the bootstrap plan so identities stay
    /// globally unique.
    pub first_serial: u32,
    /// Pucks scattered at strip initialisation.
    pub pucks: u32,
    /// Robot body radius; collision cells span one diameter.
    pub robot_radius: f32,
    /// Hard cap applied to commanded linear speed.
    pub max_speed: f32,
    /// Vision range; also the width of each critical band.
    pub vision_radius: f32,
    /// Full field-of-view angle.
    pub fov: f32,
    /// Maximum range at which a visible puck can be picked up.
    pub pickup_radius: f32,
    /// Turns a captured puck rests in a home before scoring.
    pub puck_lifetime: u32,
    /// Sensor grid dimension (cells per axis).
    pub sensor_cells: u32,
    /// Turns between score reports to the coordinator; 0 disables.
    pub score_report_interval: u32,
    /// Capture radius shared by every home.
    pub home_radius: f32,
    /// Global home list from the bootstrap node-list.
    pub homes: Vec<HomeSpec>,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            world_size: 1_000.0,
            min_x: 0.0,
            max_x: 1_000.0,
            node_index: 0,
            teams: 2,
            robots_per_team: 8,
            first_serial: 0,
            pucks: 32,
            robot_radius: 2.0,
            max_speed: 2.5,
            vision_radius: 60.0,
            fov: HALF_TURN,
            pickup_radius: 4.0,
            puck_lifetime: 20,
            sensor_cells: 16,
            score_report_interval: 5,
            home_radius: 20.0,
            homes: vec![
                HomeSpec {
                    team: TeamId(0),
                    x: 250.0,
                    y: 250.0,
                },
                HomeSpec {
                    team: TeamId(1),
                    x: 750.0,
                    y: 750.0,
                },
            ],
            rng_seed: None,
        }
    }
}

impl NodeConfig {
    /// Validate the configuration, including the geometric preconditions
    /// the border protocol depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.world_size > 0.0) || !self.world_size.is_finite() {
            return Err(ConfigError::Invalid("world_size must be positive and finite"));
        }
        if !(0.0..self.max_x).contains(&self.min_x) || self.max_x > self.world_size {
            return Err(ConfigError::Invalid(
                "strip bounds must satisfy 0 <= min_x < max_x <= world_size",
            ));
        }
        if self.strip_width() <= 2.0 * self.vision_radius {
            return Err(ConfigError::Invalid(
                "strip width must exceed twice the vision radius",
            ));
        }
        if !(self.robot_radius > 0.0) {
            return Err(ConfigError::Invalid("robot_radius must be positive"));
        }
        if self.max_speed < 0.0 {
            return Err(ConfigError::Invalid("max_speed must be non-negative"));
        }
        if self.vision_radius <= self.robot_diameter() + 2.0 * self.max_speed {
            return Err(ConfigError::Invalid(
                "vision_radius must exceed one robot diameter plus two steps",
            ));
        }
        if !(self.fov > 0.0) || self.fov > FULL_TURN {
            return Err(ConfigError::Invalid("fov must lie in (0, 2*pi]"));
        }
        if !(self.pickup_radius > 0.0) || self.pickup_radius > self.vision_radius {
            return Err(ConfigError::Invalid(
                "pickup_radius must be positive and within vision range",
            ));
        }
        if self.teams == 0 {
            return Err(ConfigError::Invalid("at least one team is required"));
        }
        if !(self.home_radius > 0.0) {
            return Err(ConfigError::Invalid("home_radius must be positive"));
        }
        if self.homes.iter().any(|home| home.team.0 >= self.teams) {
            return Err(ConfigError::Invalid("home assigned to an unknown team"));
        }
        if self.sensor_cells == 0 {
            return Err(ConfigError::Invalid("sensor_cells must be non-zero"));
        }
        Ok(())
    }

    #[must_use]
    pub fn strip_width(&self) -> f32 {
        self.max_x - self.min_x
    }

    #[must_use]
    pub fn robot_diameter(&self) -> f32 {
        self.robot_radius * 2.0
    }

    #[must_use]
    pub fn contains_x(&self, x: f32) -> bool {
        x >= self.min_x && x < self.max_x
    }

    /// Seed the node RNG, decorrelating nodes that share one config seed.
    fn seeded_rng(&self) -> SmallRng {
        let base = self.rng_seed.unwrap_or_else(rand::random);
        SmallRng::seed_from_u64(
            base ^ u64::from(self.node_index).wrapping_mul(0x9E37_79B9_7F4A_7C15),
        )
    }
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

/// Puck manipulation requested by a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PuckAction {
    #[default]
    None,
    Pickup,
    Drop,
}

/// Per-robot order inside a [`ControlCommand`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RobotCommand {
    pub id: u32,
    pub action: PuckAction,
    pub speed: f32,
    pub turn_rate: f32,
    pub last_x: f32,
    pub last_y: f32,
    pub memory: ControllerMemory,
}

/// One team's orders for a turn, applied at the start of the next step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlCommand {
    pub team: TeamId,
    pub robots: Vec<RobotCommand>,
}

/// Per-robot slice of a [`SenseData`] payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RobotSense {
    pub id: u32,
    pub x: f32,
    pub y: f32,
    pub a: f32,
    pub has_puck: bool,
    pub collided: bool,
    pub last_x: f32,
    pub last_y: f32,
    pub memory: ControllerMemory,
    pub seen_robots: Vec<SeenRobot>,
    pub seen_pucks: Vec<SeenPuck>,
}

/// Everything one team's controller learns about its residents this turn.
///
/// Every resident robot gets an entry even when it saw nothing, so an
/// empty `robots` vector unambiguously means the team has no robots on
/// this node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SenseData {
    pub team: TeamId,
    pub robots: Vec<RobotSense>,
}

/// Full state of a robot crossing between strips.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RobotTransfer {
    pub bot: BotId,
    pub x: f32,
    pub y: f32,
    pub a: f32,
    pub speed: f32,
    pub turn_rate: f32,
    pub has_puck: bool,
    pub last_x: f32,
    pub last_y: f32,
    pub fov_bbox: Aabb,
    pub memory: ControllerMemory,
}

/// Robots handed off to a neighbour in one turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MoveBatch {
    pub robots: Vec<RobotTransfer>,
}

/// Anonymized border occupants; identity is irrelevant to collision, only
/// geometry crosses the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CriticalSectionSnapshot {
    pub shadows: Vec<Vec2>,
}

/// Messages exchanged with a neighbouring node during the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum BorderMessage {
    Request,
    Snapshot(CriticalSectionSnapshot),
    Reply {
        handoff: MoveBatch,
        snapshot: CriticalSectionSnapshot,
    },
    Handoff(MoveBatch),
}

impl BorderMessage {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Snapshot(_) => "snapshot",
            Self::Reply { .. } => "reply",
            Self::Handoff(_) => "handoff",
        }
    }
}

/// Barrier signal, node to coordinator or client to node. Scores ride
/// along on reporting turns.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DoneSignal {
    pub sender: u32,
    pub scores: Vec<(TeamId, u32)>,
}

/// Go-ahead for the next turn, or orderly shutdown. Shutdown is the only
/// cancellation the turn loop honours, checked at the barrier boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnBeginSignal {
    Proceed,
    Shutdown,
}

// ---------------------------------------------------------------------------
// Errors & links
// ---------------------------------------------------------------------------

/// Errors surfaced by the turn pipeline.
///
/// Grid and entity invariant violations are deliberately absent: those are
/// programmer errors and abort with a diagnostic instead of unwinding into
/// recovery code that cannot exist.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("border link closed")]
    LinkClosed,
    #[error("protocol desynchronized: expected {expected}, received {received}")]
    Protocol {
        expected: &'static str,
        received: &'static str,
    },
    #[error("client {client} signalled done twice in one turn")]
    DuplicateDone { client: u32 },
}

fn protocol(expected: &'static str, received: &BorderMessage) -> TurnError {
    TurnError::Protocol {
        expected,
        received: received.kind(),
    }
}

/// Blocking message port to one neighbour node. Transport and framing are
/// the caller's concern; the core only sequences payloads over it.
pub trait BorderLink {
    fn send(&mut self, message: BorderMessage) -> Result<(), TurnError>;
    fn recv(&mut self) -> Result<BorderMessage, TurnError>;
}

/// Rendezvous on per-turn client completion.
///
/// The turn loop must not advance while any expected client's command
/// message is outstanding; this tracks who has reported.
#[derive(Debug)]
pub struct TurnBarrier {
    expected: usize,
    seen: Vec<u32>,
}

impl TurnBarrier {
    #[must_use]
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            seen: Vec::with_capacity(expected),
        }
    }

    pub fn record_done(&mut self, client: u32) -> Result<(), TurnError> {
        if self.seen.contains(&client) {
            return Err(TurnError::DuplicateDone { client });
        }
        self.seen.push(client);
        Ok(())
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.seen.len() >= self.expected
    }

    pub fn reset(&mut self) {
        self.seen.clear();
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct CriticalBand {
    established: Vec<RobotKey>,
    queued: Vec<RobotKey>,
}

#[derive(Debug, Clone, Copy)]
enum Blocker {
    Robot(RobotKey),
    Shadow,
}

/// One strip node: entity arenas, derived grids, band bookkeeping, and the
/// turn pipeline over them.
pub struct Node {
    config: NodeConfig,
    rng: SmallRng,
    turn: Turn,
    robots: SlotMap<RobotKey, Robot>,
    pucks: SlotMap<PuckKey, Puck>,
    homes: Vec<Home>,
    registry: HashMap<BotId, RobotKey>,
    robot_grid: BucketGrid<RobotKey>,
    puck_grid: BucketGrid<PuckKey>,
    collision: CollisionGrid<RobotKey>,
    bands: [CriticalBand; 2],
    shadow_cells: Vec<CellId>,
    pending_commands: Vec<ControlCommand>,
    departures: [Vec<RobotTransfer>; 2],
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("node_index", &self.config.node_index)
            .field("turn", &self.turn)
            .field("robots", &self.robots.len())
            .field("pucks", &self.pucks.len())
            .finish()
    }
}

impl Node {
    /// Build a node and scatter its initial population.
    pub fn new(config: NodeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let sensor_spec = GridSpec::new(config.world_size, config.sensor_cells)?;
        let collision_spec = GridSpec::with_min_cell(config.world_size, config.robot_diameter())?;
        let rng = config.seeded_rng();
        let homes = config
            .homes
            .iter()
            .map(|spec| Home {
                team: spec.team,
                pos: Vec2::new(spec.x, spec.y),
                radius: config.home_radius,
                score: 0,
                pending: 0,
                local: home_is_local(&config, spec.x),
            })
            .collect();
        let mut node = Self {
            rng,
            turn: Turn::zero(),
            robots: SlotMap::with_key(),
            pucks: SlotMap::with_key(),
            homes,
            registry: HashMap::new(),
            robot_grid: BucketGrid::new(sensor_spec),
            puck_grid: BucketGrid::new(sensor_spec),
            collision: CollisionGrid::new(collision_spec),
            bands: [CriticalBand::default(), CriticalBand::default()],
            shadow_cells: Vec::new(),
            pending_commands: Vec::new(),
            departures: [Vec::new(), Vec::new()],
            config,
        };
        node.populate();
        Ok(node)
    }

    fn populate(&mut self) {
        for team in 0..self.config.teams {
            for i in 0..self.config.robots_per_team {
                let bot = BotId {
                    team: TeamId(team),
                    serial: self.config.first_serial + i,
                };
                let pos = self.scatter_robot_position();
                let heading = self.rng.random_range(-HALF_TURN..HALF_TURN);
                self.place_robot(bot, pos, heading);
            }
        }
        for _ in 0..self.config.pucks {
            let pos = self.scatter_puck_position();
            self.place_puck(pos);
        }
    }

    /// Insert a robot at an explicit position, as a bootstrap placement
    /// plan does. The position must be free and inside the strip.
    pub fn place_robot(&mut self, bot: BotId, pos: Vec2, heading: f32) -> RobotKey {
        assert!(
            self.config.contains_x(pos.x),
            "robot {bot} placed at x={} outside strip [{}, {})",
            pos.x,
            self.config.min_x,
            self.config.max_x,
        );
        assert!(!self.registry.contains_key(&bot), "robot {bot} placed twice");
        let ccell = self.collision.spec().cell_of(pos.x, pos.y);
        assert!(
            self.find_blocker(None, pos, ccell).is_none(),
            "robot {bot} placement overlaps an existing occupant",
        );
        let scell = self.robot_grid.spec().cell_of(pos.x, pos.y);
        let key = self.robots.insert(Robot {
            bot,
            pos,
            heading: normalize_angle(heading),
            speed: 0.0,
            turn_rate: 0.0,
            last: pos,
            collided: false,
            held_puck: None,
            memory: ControllerMemory::default(),
            fov_bbox: Aabb::around(pos, self.config.vision_radius),
            sensor_cell: scell,
            collision_cell: ccell,
            band: BandState::Clear,
            seen_robots: Vec::new(),
            seen_pucks: Vec::new(),
        });
        self.registry.insert(bot, key);
        self.robot_grid.insert(scell, key);
        self.collision.insert_local(ccell, key);
        self.reclassify_band(key);
        key
    }

    /// Insert a free puck at an explicit position.
    pub fn place_puck(&mut self, pos: Vec2) -> PuckKey {
        let scell = self.puck_grid.spec().cell_of(pos.x, pos.y);
        let key = self.pucks.insert(Puck {
            pos,
            held: false,
            owner: None,
            home: None,
            lifetime: 0,
            sensor_cell: scell,
        });
        self.puck_grid.insert(scell, key);
        key
    }

    fn scatter_robot_position(&mut self) -> Vec2 {
        let (min_x, max_x, world) = (self.config.min_x, self.config.max_x, self.config.world_size);
        for _ in 0..PLACEMENT_ATTEMPTS {
            let pos = Vec2::new(
                self.rng.random_range(min_x..max_x),
                self.rng.random_range(0.0..world),
            );
            let cell = self.collision.spec().cell_of(pos.x, pos.y);
            if self.find_blocker(None, pos, cell).is_none() {
                return pos;
            }
        }
        panic!("no free collision cell found while scattering robots");
    }

    fn scatter_puck_position(&mut self) -> Vec2 {
        let (min_x, max_x, world) = (self.config.min_x, self.config.max_x, self.config.world_size);
        for _ in 0..PLACEMENT_ATTEMPTS {
            let pos = Vec2::new(
                self.rng.random_range(min_x..max_x),
                self.rng.random_range(0.0..world),
            );
            let clear = self
                .homes
                .iter()
                .filter(|home| home.local)
                .all(|home| toroidal_dist_sq(pos, home.pos, world) > home.radius * home.radius);
            if clear {
                return pos;
            }
        }
        panic!("no puck position outside home discs found");
    }

    // -- accessors ----------------------------------------------------------

    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    #[must_use]
    pub const fn turn(&self) -> Turn {
        self.turn
    }

    #[must_use]
    pub fn robot_count(&self) -> usize {
        self.robots.len()
    }

    #[must_use]
    pub fn puck_count(&self) -> usize {
        self.pucks.len()
    }

    #[must_use]
    pub fn robot_key(&self, bot: BotId) -> Option<RobotKey> {
        self.registry.get(&bot).copied()
    }

    #[must_use]
    pub fn robot(&self, key: RobotKey) -> Option<&Robot> {
        self.robots.get(key)
    }

    /// Iterate over resident robots.
    pub fn robots(&self) -> impl Iterator<Item = &Robot> {
        self.robots.values()
    }

    /// Iterate over resident pucks.
    pub fn pucks(&self) -> impl Iterator<Item = &Puck> {
        self.pucks.values()
    }

    #[must_use]
    pub fn puck(&self, key: PuckKey) -> Option<&Puck> {
        self.pucks.get(key)
    }

    #[must_use]
    pub fn homes(&self) -> &[Home] {
        &self.homes
    }

    /// Running score totals aggregated per team, sorted by team.
    #[must_use]
    pub fn scores(&self) -> Vec<(TeamId, u32)> {
        let mut by_team: HashMap<TeamId, u32> = HashMap::new();
        for home in &self.homes {
            *by_team.entry(home.team).or_insert(0) += home.score;
        }
        let mut totals: Vec<_> = by_team.into_iter().collect();
        totals.sort_by_key(|(team, _)| *team);
        totals
    }

    /// Queue a client command for application at the start of next turn.
    pub fn queue_command(&mut self, command: ControlCommand) {
        self.pending_commands.push(command);
    }

    /// Whether this turn ends a score-reporting interval.
    #[must_use]
    pub fn should_report(&self) -> bool {
        let interval = self.config.score_report_interval;
        interval > 0 && self.turn.0.is_multiple_of(u64::from(interval))
    }

    /// Drain undelivered score deltas, aggregated per team.
    pub fn take_score_report(&mut self) -> Vec<(TeamId, u32)> {
        let mut by_team: HashMap<TeamId, u32> = HashMap::new();
        for home in &mut self.homes {
            if home.pending > 0 {
                *by_team.entry(home.team).or_insert(0) += home.pending;
                home.pending = 0;
            }
        }
        let mut deltas: Vec<_> = by_team.into_iter().collect();
        deltas.sort_by_key(|(team, _)| *team);
        deltas
    }

    // -- turn pipeline ------------------------------------------------------

    /// Execute one full simulation turn against both neighbour links.
    pub fn run_turn<L, R>(&mut self, left: &mut L, right: &mut R) -> Result<(), TurnError>
    where
        L: BorderLink + ?Sized,
        R: BorderLink + ?Sized,
    {
        self.turn = self.turn.next();
        self.promote_queued();
        self.stage_commands();
        self.stage_scoring();
        self.stage_local_step();
        self.stage_border_exchange(left, right)?;
        self.stage_sense();
        Ok(())
    }

    fn promote_queued(&mut self) {
        for side in Side::BOTH {
            let queued = std::mem::take(&mut self.bands[side.index()].queued);
            for key in queued {
                self.robots[key].band = BandState::Established(side);
                self.bands[side.index()].established.push(key);
            }
        }
    }

    fn stage_commands(&mut self) {
        let commands = std::mem::take(&mut self.pending_commands);
        for command in commands {
            for order in command.robots {
                let bot = BotId {
                    team: command.team,
                    serial: order.id,
                };
                // A command can race a hand-off; the robot's new node owns
                // it from the next turn on.
                let Some(&key) = self.registry.get(&bot) else {
                    continue;
                };
                let action = order.action;
                {
                    let max_speed = self.config.max_speed;
                    let robot = &mut self.robots[key];
                    robot.speed = order.speed.clamp(-max_speed, max_speed);
                    robot.turn_rate = normalize_angle(order.turn_rate);
                    robot.last = Vec2::new(order.last_x, order.last_y);
                    robot.memory = order.memory;
                }
                self.apply_puck_action(key, action);
            }
        }
    }

    fn apply_puck_action(&mut self, key: RobotKey, action: PuckAction) {
        match action {
            PuckAction::None => {}
            PuckAction::Pickup => self.try_pickup(key),
            PuckAction::Drop => self.try_drop(key),
        }
    }

    /// One pickup attempt: the nearest puck seen last turn, still free and
    /// within pickup range, becomes held.
    fn try_pickup(&mut self, key: RobotKey) {
        if self.robots[key].held_puck.is_some() {
            return;
        }
        let pickup = self.config.pickup_radius;
        let choice = self.robots[key]
            .seen_pucks
            .iter()
            .filter(|sighting| sighting.range <= pickup)
            .filter(|sighting| {
                self.pucks
                    .get(sighting.key)
                    .is_some_and(|puck| !puck.held)
            })
            .min_by_key(|sighting| OrderedFloat(sighting.range))
            .map(|sighting| sighting.key);
        let Some(puck_key) = choice else {
            return;
        };
        let (robot_pos, robot_cell) = {
            let robot = &self.robots[key];
            (robot.pos, robot.sensor_cell)
        };
        let puck = &mut self.pucks[puck_key];
        puck.held = true;
        puck.owner = Some(key);
        puck.home = None;
        let old_cell = puck.sensor_cell;
        puck.pos = robot_pos;
        puck.sensor_cell = robot_cell;
        self.puck_grid.reindex(old_cell, robot_cell, puck_key);
        self.robots[key].held_puck = Some(puck_key);
    }

    fn try_drop(&mut self, key: RobotKey) {
        let Some(puck_key) = self.robots[key].held_puck.take() else {
            return;
        };
        let robot_pos = self.robots[key].pos;
        let world = self.config.world_size;
        let landing = self.homes.iter().position(|home| {
            home.local && toroidal_dist_sq(robot_pos, home.pos, world) <= home.radius * home.radius
        });
        let lifetime = self.config.puck_lifetime;
        let puck = &mut self.pucks[puck_key];
        puck.held = false;
        puck.owner = None;
        puck.pos = robot_pos;
        match landing {
            Some(home_idx) => {
                puck.home = Some(home_idx);
                puck.lifetime = lifetime;
            }
            None => puck.home = None,
        }
    }

    /// Count down captured pucks; expiry scores the home and relocates the
    /// puck elsewhere in the strip.
    fn stage_scoring(&mut self) {
        let mut scored = Vec::new();
        for (key, puck) in &mut self.pucks {
            if puck.home.is_none() {
                continue;
            }
            debug_assert!(!puck.held, "puck cannot be held and home-owned");
            if puck.lifetime > 0 {
                puck.lifetime -= 1;
            }
            if puck.lifetime == 0 {
                scored.push(key);
            }
        }
        for key in scored {
            let home_idx = self.pucks[key].home.take().expect("scored puck lost its home");
            let home = &mut self.homes[home_idx];
            home.score += 1;
            home.pending += 1;
            let pos = self.scatter_puck_position();
            let new_cell = self.puck_grid.spec().cell_of(pos.x, pos.y);
            let puck = &mut self.pucks[key];
            let old_cell = puck.sensor_cell;
            puck.pos = pos;
            puck.sensor_cell = new_cell;
            self.puck_grid.reindex(old_cell, new_cell, key);
        }
    }

    /// Pose-update every robot outside the critical bands.
    fn stage_local_step(&mut self) {
        for (_, robot) in &mut self.robots {
            robot.collided = false;
        }
        let movers: Vec<RobotKey> = self
            .robots
            .iter()
            .filter(|(_, robot)| robot.band == BandState::Clear)
            .map(|(key, _)| key)
            .collect();
        for key in movers {
            let crossed = self.update_pose(key);
            debug_assert!(
                crossed.is_none(),
                "robot outside the border bands crossed a strip edge",
            );
        }
    }

    /// Integrate one robot's pose, resolving collisions against the grid.
    ///
    /// Returns the side crossed when the committed x leaves the strip; the
    /// caller owns the hand-off. Band membership is only reclassified for
    /// robots that stay.
    fn update_pose(&mut self, key: RobotKey) -> Option<Side> {
        let world = self.config.world_size;
        let (pos, heading, speed, turn_rate) = {
            let robot = &self.robots[key];
            (robot.pos, robot.heading, robot.speed, robot.turn_rate)
        };
        let next_heading = normalize_angle(heading + turn_rate);
        let candidate = Vec2::new(
            wrap_position(pos.x + speed * fast_cos(heading), world),
            wrap_position(pos.y + speed * fast_sin(heading), world),
        );
        let target_cell = self.collision.spec().cell_of(candidate.x, candidate.y);

        if let Some(blocker) = self.find_blocker(Some(key), candidate, target_cell) {
            let robot = &mut self.robots[key];
            robot.heading = normalize_angle(next_heading + HALF_TURN);
            robot.speed = 0.0;
            robot.turn_rate = 0.0;
            robot.collided = true;
            if let Blocker::Robot(other) = blocker {
                let other_robot = &mut self.robots[other];
                other_robot.heading = normalize_angle(other_robot.heading + HALF_TURN);
                other_robot.speed = 0.0;
                other_robot.turn_rate = 0.0;
                other_robot.collided = true;
            }
            return None;
        }

        let vision = self.config.vision_radius;
        let sensor_spec = *self.robot_grid.spec();
        let (old_sensor, old_collision, held) = {
            let robot = &mut self.robots[key];
            let cached = (robot.sensor_cell, robot.collision_cell, robot.held_puck);
            robot.pos = candidate;
            robot.heading = next_heading;
            robot.fov_bbox = Aabb::around(candidate, vision);
            cached
        };
        let new_sensor = sensor_spec.cell_of(candidate.x, candidate.y);
        self.robot_grid.reindex(old_sensor, new_sensor, key);
        self.robots[key].sensor_cell = new_sensor;
        self.collision.reindex_local(old_collision, target_cell, key);
        self.robots[key].collision_cell = target_cell;

        if let Some(puck_key) = held {
            let puck = &mut self.pucks[puck_key];
            let old_cell = puck.sensor_cell;
            puck.pos = candidate;
            puck.sensor_cell = new_sensor;
            self.puck_grid.reindex(old_cell, new_sensor, puck_key);
        }

        if let Some(side) = self.crossing(candidate.x) {
            return Some(side);
        }
        self.reclassify_band(key);
        None
    }

    /// Find whatever blocks a move to `target`: the target cell's occupant,
    /// or any neighbourhood occupant whose footprint overlaps the position.
    fn find_blocker(
        &self,
        mover: Option<RobotKey>,
        target: Vec2,
        target_cell: CellId,
    ) -> Option<Blocker> {
        let world = self.config.world_size;
        let diameter = self.config.robot_diameter();
        let diameter_sq = diameter * diameter;
        if let Some(occupant) = self.collision.occupant(target_cell) {
            match occupant {
                CellOccupant::Local(other) if Some(*other) != mover => {
                    return Some(Blocker::Robot(*other));
                }
                CellOccupant::Foreign { .. } => return Some(Blocker::Shadow),
                CellOccupant::Local(_) => {}
            }
        }
        for (_, occupant) in self.collision.neighborhood(target_cell) {
            let (other_pos, blocker) = match occupant {
                CellOccupant::Local(other) => {
                    if Some(*other) == mover {
                        continue;
                    }
                    (self.robots[*other].pos, Blocker::Robot(*other))
                }
                CellOccupant::Foreign { x, y } => (Vec2::new(*x, *y), Blocker::Shadow),
            };
            if toroidal_dist_sq(target, other_pos, world) < diameter_sq {
                return Some(blocker);
            }
        }
        None
    }

    fn band_side(&self, x: f32) -> Option<Side> {
        let config = &self.config;
        if x - config.min_x < config.vision_radius {
            Some(Side::Left)
        } else if config.max_x - x < config.vision_radius {
            Some(Side::Right)
        } else {
            None
        }
    }

    /// Which side, if any, a committed x coordinate crossed out of.
    fn crossing(&self, x: f32) -> Option<Side> {
        let config = &self.config;
        if config.strip_width() >= config.world_size || config.contains_x(x) {
            return None;
        }
        let to_left = wrap_distance(x - config.min_x, config.world_size).abs();
        let to_right = wrap_distance(x - config.max_x, config.world_size).abs();
        Some(if to_left <= to_right {
            Side::Left
        } else {
            Side::Right
        })
    }

    fn detach_band(&mut self, key: RobotKey) {
        let (side, established) = match self.robots[key].band {
            BandState::Clear => return,
            BandState::Queued(side) => (side, false),
            BandState::Established(side) => (side, true),
        };
        let band = &mut self.bands[side.index()];
        let list = if established {
            &mut band.established
        } else {
            &mut band.queued
        };
        let Some(at) = list.iter().position(|entry| *entry == key) else {
            panic!("critical band bookkeeping desync for {:?}", self.robots[key].bot);
        };
        list.remove(at);
        self.robots[key].band = BandState::Clear;
    }

    fn reclassify_band(&mut self, key: RobotKey) {
        let side = self.band_side(self.robots[key].pos.x);
        match (self.robots[key].band, side) {
            (BandState::Clear, None) => {}
            (BandState::Queued(have) | BandState::Established(have), Some(want))
                if have == want => {}
            (_, None) => self.detach_band(key),
            (_, Some(want)) => {
                self.detach_band(key);
                self.bands[want.index()].queued.push(key);
                self.robots[key].band = BandState::Queued(want);
            }
        }
    }

    // -- border handshake ---------------------------------------------------

    /// The per-turn border exchange. Message order is the protocol's
    /// correctness mechanism; every receive asserts the expected kind.
    fn stage_border_exchange<L, R>(&mut self, left: &mut L, right: &mut R) -> Result<(), TurnError>
    where
        L: BorderLink + ?Sized,
        R: BorderLink + ?Sized,
    {
        left.send(BorderMessage::Request)?;

        match right.recv()? {
            BorderMessage::Request => {}
            other => return Err(protocol("request", &other)),
        }
        right.send(BorderMessage::Snapshot(self.band_snapshot(Side::Right)))?;

        let shadows = match left.recv()? {
            BorderMessage::Snapshot(snapshot) => snapshot,
            other => return Err(protocol("snapshot", &other)),
        };
        self.materialize_shadows(&shadows);
        self.advance_band(Side::Left);
        left.send(BorderMessage::Reply {
            handoff: self.drain_handoff(Side::Left),
            snapshot: self.band_snapshot(Side::Left),
        })?;

        let (inbound, right_shadows) = match right.recv()? {
            BorderMessage::Reply { handoff, snapshot } => (handoff, snapshot),
            other => return Err(protocol("reply", &other)),
        };
        self.ingest_handoff(inbound);
        self.materialize_shadows(&right_shadows);
        self.advance_band(Side::Right);
        right.send(BorderMessage::Handoff(self.drain_handoff(Side::Right)))?;

        let inbound = match left.recv()? {
            BorderMessage::Handoff(batch) => batch,
            other => return Err(protocol("handoff", &other)),
        };
        self.ingest_handoff(inbound);
        self.clear_shadows();
        Ok(())
    }

    /// Snapshot the established occupants of one band, identities erased.
    fn band_snapshot(&self, side: Side) -> CriticalSectionSnapshot {
        CriticalSectionSnapshot {
            shadows: self.bands[side.index()]
                .established
                .iter()
                .map(|&key| self.robots[key].pos)
                .collect(),
        }
    }

    /// Materialize shadow robots into the collision grid. Shadows never
    /// touch the sensor grid and never become real robots.
    fn materialize_shadows(&mut self, snapshot: &CriticalSectionSnapshot) {
        for shadow in &snapshot.shadows {
            let cell = self.collision.spec().cell_of(shadow.x, shadow.y);
            if self.collision.place_foreign(cell, shadow.x, shadow.y) {
                self.shadow_cells.push(cell);
            }
        }
    }

    fn clear_shadows(&mut self) {
        for cell in self.shadow_cells.drain(..) {
            self.collision.clear_foreign(cell);
        }
    }

    /// Pose-update one band's established robots against the collision view
    /// that now includes the neighbour's shadows, handing off crossers.
    fn advance_band(&mut self, side: Side) {
        let keys = self.bands[side.index()].established.clone();
        for key in keys {
            if let Some(crossed) = self.update_pose(key) {
                let transfer = self.depart(key);
                self.departures[crossed.index()].push(transfer);
            }
        }
    }

    /// Remove a crossing robot from every local record, returning its full
    /// state for the outgoing batch. A held puck leaves with it.
    fn depart(&mut self, key: RobotKey) -> RobotTransfer {
        self.detach_band(key);
        let robot = self.robots.remove(key).expect("departing robot missing");
        self.robot_grid.remove(robot.sensor_cell, key);
        self.collision.remove_local(robot.collision_cell, key);
        let registered = self.registry.remove(&robot.bot);
        debug_assert_eq!(registered, Some(key));
        let has_puck = robot.held_puck.is_some();
        if let Some(puck_key) = robot.held_puck {
            let puck = self.pucks.remove(puck_key).expect("held puck missing");
            self.puck_grid.remove(puck.sensor_cell, puck_key);
        }
        RobotTransfer {
            bot: robot.bot,
            x: robot.pos.x,
            y: robot.pos.y,
            a: robot.heading,
            speed: robot.speed,
            turn_rate: robot.turn_rate,
            has_puck,
            last_x: robot.last.x,
            last_y: robot.last.y,
            fov_bbox: robot.fov_bbox,
            memory: robot.memory,
        }
    }

    fn drain_handoff(&mut self, side: Side) -> MoveBatch {
        MoveBatch {
            robots: std::mem::take(&mut self.departures[side.index()]),
        }
    }

    fn ingest_handoff(&mut self, batch: MoveBatch) {
        for transfer in batch.robots {
            self.ingest_transfer(transfer);
        }
    }

    /// Instantiate a hand-off robot as a full resident: indexed in both
    /// grids and queued into the band its arrival position falls in.
    fn ingest_transfer(&mut self, transfer: RobotTransfer) {
        assert!(
            !self.registry.contains_key(&transfer.bot),
            "hand-off for {} which is already resident",
            transfer.bot,
        );
        let pos = Vec2::new(transfer.x, transfer.y);
        let sensor_cell = self.robot_grid.spec().cell_of(pos.x, pos.y);
        let collision_cell = self.collision.spec().cell_of(pos.x, pos.y);
        // The sender's pre-move shadow of this robot can still cover its
        // arrival cell when the crossing stayed within one cell.
        if matches!(
            self.collision.occupant(collision_cell),
            Some(CellOccupant::Foreign { .. })
        ) {
            self.collision.clear_foreign(collision_cell);
            self.shadow_cells.retain(|cell| *cell != collision_cell);
        }
        let key = self.robots.insert(Robot {
            bot: transfer.bot,
            pos,
            heading: transfer.a,
            speed: transfer.speed,
            turn_rate: transfer.turn_rate,
            last: Vec2::new(transfer.last_x, transfer.last_y),
            collided: false,
            held_puck: None,
            memory: transfer.memory,
            fov_bbox: transfer.fov_bbox,
            sensor_cell,
            collision_cell,
            band: BandState::Clear,
            seen_robots: Vec::new(),
            seen_pucks: Vec::new(),
        });
        self.registry.insert(transfer.bot, key);
        self.robot_grid.insert(sensor_cell, key);
        self.collision.insert_local(collision_cell, key);
        if transfer.has_puck {
            let puck_key = self.pucks.insert(Puck {
                pos,
                held: true,
                owner: Some(key),
                home: None,
                lifetime: 0,
                sensor_cell,
            });
            self.puck_grid.insert(sensor_cell, puck_key);
            self.robots[key].held_puck = Some(puck_key);
        }
        self.reclassify_band(key);
        debug_assert!(
            matches!(self.robots[key].band, BandState::Queued(_)),
            "hand-off arrival landed outside a critical band",
        );
    }

    // -- sense --------------------------------------------------------------

    /// Rebuild every robot's seen lists from scratch. Runs after the
    /// handshake, when both grids are border-consistent.
    fn stage_sense(&mut self) {
        let vision = self.config.vision_radius;
        let vision_sq = vision * vision;
        let half_fov = self.config.fov * 0.5;
        let world = self.config.world_size;
        let spec = *self.robot_grid.spec();
        let keys: Vec<RobotKey> = self.robots.keys().collect();
        let robots = &self.robots;
        let pucks = &self.pucks;
        let robot_grid = &self.robot_grid;
        let puck_grid = &self.puck_grid;

        let results: Vec<(Vec<SeenRobot>, Vec<PuckSighting>)> = keys
            .par_iter()
            .map(|&key| {
                let observer = &robots[key];
                let mut seen_robots = Vec::new();
                let mut seen_pucks = Vec::new();
                for cell in cells_in_bbox(&spec, &observer.fov_bbox) {
                    for &other in robot_grid.occupants(cell) {
                        if other == key {
                            continue;
                        }
                        if let Some((range, bearing)) = visibility(
                            observer.pos,
                            observer.heading,
                            robots[other].pos,
                            vision,
                            vision_sq,
                            half_fov,
                            world,
                        ) {
                            seen_robots.push(SeenRobot { range, bearing });
                        }
                    }
                    for &puck_key in puck_grid.occupants(cell) {
                        let puck = &pucks[puck_key];
                        if let Some((range, bearing)) = visibility(
                            observer.pos,
                            observer.heading,
                            puck.pos,
                            vision,
                            vision_sq,
                            half_fov,
                            world,
                        ) {
                            seen_pucks.push(PuckSighting {
                                key: puck_key,
                                range,
                                bearing,
                                held: puck.held,
                            });
                        }
                    }
                }
                (seen_robots, seen_pucks)
            })
            .collect();

        for (key, (seen_robots, seen_pucks)) in keys.into_iter().zip(results) {
            let robot = &mut self.robots[key];
            robot.seen_robots = seen_robots;
            robot.seen_pucks = seen_pucks;
        }
    }

    /// Verify cache coherence between entities and grids, aborting with a
    /// diagnostic on violation. Cheap enough for test harnesses to call
    /// after every turn.
    pub fn assert_coherent(&self) {
        for (key, robot) in &self.robots {
            assert_eq!(
                robot.sensor_cell,
                self.robot_grid.spec().cell_of(robot.pos.x, robot.pos.y),
                "stale sensor cell for {}",
                robot.bot,
            );
            assert_eq!(
                robot.collision_cell,
                self.collision.spec().cell_of(robot.pos.x, robot.pos.y),
                "stale collision cell for {}",
                robot.bot,
            );
            assert!(
                self.robot_grid.occupants(robot.sensor_cell).contains(&key),
                "{} missing from its sensor cell",
                robot.bot,
            );
            assert!(
                matches!(
                    self.collision.occupant(robot.collision_cell),
                    Some(CellOccupant::Local(held)) if *held == key,
                ),
                "{} missing from its collision cell",
                robot.bot,
            );
            if let Some(puck_key) = robot.held_puck {
                let puck = &self.pucks[puck_key];
                assert!(puck.held && puck.owner == Some(key));
                assert_eq!(puck.pos, robot.pos, "held puck strayed from {}", robot.bot);
            }
        }
        for (key, puck) in &self.pucks {
            assert_eq!(
                puck.sensor_cell,
                self.puck_grid.spec().cell_of(puck.pos.x, puck.pos.y),
            );
            assert!(self.puck_grid.occupants(puck.sensor_cell).contains(&key));
            assert!(!(puck.held && puck.home.is_some()));
        }
    }

    /// Assemble the sense payload for one team's controller.
    #[must_use]
    pub fn sense_payload(&self, team: TeamId) -> SenseData {
        let mut robots: Vec<RobotSense> = self
            .robots
            .values()
            .filter(|robot| robot.bot.team == team)
            .map(|robot| RobotSense {
                id: robot.bot.serial,
                x: robot.pos.x,
                y: robot.pos.y,
                a: robot.heading,
                has_puck: robot.held_puck.is_some(),
                collided: robot.collided,
                last_x: robot.last.x,
                last_y: robot.last.y,
                memory: robot.memory.clone(),
                seen_robots: robot.seen_robots.clone(),
                seen_pucks: robot
                    .seen_pucks
                    .iter()
                    .map(|sighting| SeenPuck {
                        range: sighting.range,
                        bearing: sighting.bearing,
                        held: sighting.held,
                    })
                    .collect(),
            })
            .collect();
        robots.sort_by_key(|sense| sense.id);
        SenseData { team, robots }
    }
}

fn home_is_local(config: &NodeConfig, x: f32) -> bool {
    if config.contains_x(x) {
        return true;
    }
    let to_left = wrap_distance(x - config.min_x, config.world_size).abs();
    let to_right = wrap_distance(x - config.max_x, config.world_size).abs();
    to_left.min(to_right) <= config.home_radius
}

/// Sensor cells intersecting an unwrapped bounding box, each visited once.
fn cells_in_bbox(spec: &GridSpec, bbox: &Aabb) -> Vec<CellId> {
    let cell = spec.cell_size();
    let dims = i64::from(spec.dims());
    let col_lo = (bbox.min.x / cell).floor() as i64;
    let col_hi = (bbox.max.x / cell).floor() as i64;
    let row_lo = (bbox.min.y / cell).floor() as i64;
    let row_hi = (bbox.max.y / cell).floor() as i64;
    let col_span = (col_hi - col_lo + 1).min(dims);
    let row_span = (row_hi - row_lo + 1).min(dims);
    let mut cells = Vec::with_capacity((col_span * row_span) as usize);
    for row in row_lo..row_lo + row_span {
        for col in col_lo..col_lo + col_span {
            cells.push(CellId {
                col: spec.wrap_axis(col),
                row: spec.wrap_axis(row),
            });
        }
    }
    cells
}

/// Full visibility test: per-axis cheap reject, squared-range reject, then
/// the bearing check. The square root is taken once, on the accept path.
fn visibility(
    origin: Vec2,
    heading: f32,
    target: Vec2,
    vision: f32,
    vision_sq: f32,
    half_fov: f32,
    world: f32,
) -> Option<(f32, f32)> {
    let dx = wrap_distance(target.x - origin.x, world);
    if dx.abs() > vision {
        return None;
    }
    let dy = wrap_distance(target.y - origin.y, world);
    if dy.abs() > vision {
        return None;
    }
    let dist_sq = dx * dx + dy * dy;
    if dist_sq > vision_sq {
        return None;
    }
    let bearing = normalize_angle(dy.atan2(dx) - heading);
    if bearing.abs() > half_fov {
        return None;
    }
    Some((dist_sq.sqrt(), bearing))
}
