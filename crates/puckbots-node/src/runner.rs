//! The per-node turn loop: a strict barrier cycle around the core.
//!
//! Order per turn: run the core pipeline (local step, border handshake,
//! sense build) -> serve every client its payload -> block until every
//! client's commands and done signal arrived -> report to the coordinator
//! -> block on the go-ahead. Nothing proceeds out of order; a runtime
//! partition stalls the node rather than degrading it.

use crate::links::{ChannelBorderLink, ClientPort, ClientToNode, CoordinatorPort, NodeToClient, RetryPolicy};
use puckbots_core::{DoneSignal, Node, TeamId, TurnBarrier, TurnBeginSignal, TurnError};
use tracing::{debug, info};

struct Registration {
    client: u32,
    team: TeamId,
}

/// Owns one node plus every link it talks over.
pub struct NodeRunner {
    node: Node,
    left: ChannelBorderLink,
    right: ChannelBorderLink,
    clients: Vec<ClientPort>,
    coordinator: CoordinatorPort,
    policy: RetryPolicy,
}

impl NodeRunner {
    #[must_use]
    pub fn new(
        node: Node,
        left: ChannelBorderLink,
        right: ChannelBorderLink,
        clients: Vec<ClientPort>,
        coordinator: CoordinatorPort,
    ) -> Self {
        Self {
            node,
            left,
            right,
            clients,
            coordinator,
            policy: RetryPolicy::default(),
        }
    }

    /// Drive the node until the coordinator orders shutdown, returning the
    /// final node state. Protocol violations and closed links are fatal.
    pub fn run(mut self) -> Result<Node, TurnError> {
        let registrations = self.await_registrations()?;
        let node_index = self.node.config().node_index;
        info!(
            node = node_index,
            clients = registrations.len(),
            robots = self.node.robot_count(),
            "node ready",
        );
        let mut barrier = TurnBarrier::new(self.clients.len());

        loop {
            self.node.run_turn(&mut self.left, &mut self.right)?;

            for (port, registration) in self.clients.iter().zip(&registrations) {
                port.tx
                    .send(NodeToClient::Begin(TurnBeginSignal::Proceed))
                    .map_err(|_| TurnError::LinkClosed)?;
                port.tx
                    .send(NodeToClient::Sense(self.node.sense_payload(registration.team)))
                    .map_err(|_| TurnError::LinkClosed)?;
            }

            barrier.reset();
            for port in &self.clients {
                loop {
                    match port.rx.recv().map_err(|_| TurnError::LinkClosed)? {
                        ClientToNode::Command(command) => self.node.queue_command(command),
                        ClientToNode::Done(done) => {
                            barrier.record_done(done.sender)?;
                            break;
                        }
                        other => {
                            return Err(TurnError::Protocol {
                                expected: "command or done",
                                received: other.kind(),
                            });
                        }
                    }
                }
            }
            debug_assert!(barrier.is_complete());

            let scores = if self.node.should_report() {
                self.node.take_score_report()
            } else {
                Vec::new()
            };
            if !scores.is_empty() {
                debug!(node = node_index, turn = self.node.turn().0, ?scores, "score report");
            }
            self.coordinator
                .tx
                .send(DoneSignal {
                    sender: node_index,
                    scores,
                })
                .map_err(|_| TurnError::LinkClosed)?;

            match self.coordinator.rx.recv().map_err(|_| TurnError::LinkClosed)? {
                TurnBeginSignal::Proceed => {}
                TurnBeginSignal::Shutdown => {
                    for port in &self.clients {
                        let _ = port.tx.send(NodeToClient::Begin(TurnBeginSignal::Shutdown));
                    }
                    info!(node = node_index, turn = self.node.turn().0, "shutdown");
                    return Ok(self.node);
                }
            }
        }
    }

    /// Block until every expected client has registered. Clients launch in
    /// arbitrary order relative to the node, so this polls with backoff.
    fn await_registrations(&self) -> Result<Vec<Registration>, TurnError> {
        let mut registrations = Vec::with_capacity(self.clients.len());
        for port in &self.clients {
            let message = self
                .policy
                .acquire(|| port.rx.try_recv().map_err(|_| TurnError::LinkClosed))?;
            match message {
                ClientToNode::Register { client, team } => {
                    registrations.push(Registration { client, team });
                }
                other => {
                    return Err(TurnError::Protocol {
                        expected: "register",
                        received: other.kind(),
                    });
                }
            }
        }
        Ok(registrations)
    }
}
