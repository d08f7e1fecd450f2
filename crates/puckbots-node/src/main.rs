use anyhow::{Context, Result};
use puckbots_node::cluster::{ClusterConfig, run_cluster};
use std::fs;
use tracing::info;

fn main() -> Result<()> {
    init_tracing();
    let config = load_config()?;
    info!(
        nodes = config.nodes,
        turns = config.turns,
        teams = config.teams,
        "starting puckbots cluster",
    );
    let outcome = run_cluster(&config)?;
    for node in &outcome.nodes {
        info!(
            node = node.config().node_index,
            robots = node.robot_count(),
            pucks = node.puck_count(),
            "final node population",
        );
    }
    for (team, score) in &outcome.scores {
        info!(team = team.0, score = *score, "final score");
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn load_config() -> Result<ClusterConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let raw =
                fs::read_to_string(&path).with_context(|| format!("reading config {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config {path}"))
        }
        None => Ok(ClusterConfig::default()),
    }
}
