//! Channel-backed link implementations and the startup retry policy.
//!
//! Wire framing is out of scope for the core; these buses carry the same
//! payloads an external transport would, over crossfire mpmc channels.

use crossfire::{MRx, MTx, detect_backoff_cfg, mpmc};
use puckbots_core::{
    BorderLink, BorderMessage, ControlCommand, DoneSignal, SenseData, TeamId, TurnBeginSignal,
    TurnError,
};
use std::thread;
use std::time::Duration;

/// Messages in flight per direction never exceed two per turn; a small
/// buffer keeps every send non-blocking and the ring deadlock-free.
const CABLE_DEPTH: usize = 8;

/// Envelope from a node to one of its clients.
#[derive(Debug, Clone)]
pub enum NodeToClient {
    Begin(TurnBeginSignal),
    Sense(SenseData),
}

/// Envelope from a client to its node.
#[derive(Debug, Clone)]
pub enum ClientToNode {
    Register { client: u32, team: TeamId },
    Command(ControlCommand),
    Done(DoneSignal),
}

impl ClientToNode {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Command(_) => "command",
            Self::Done(_) => "done",
        }
    }
}

/// One direction-pair of border channels between two neighbouring nodes.
pub struct ChannelBorderLink {
    tx: MTx<BorderMessage>,
    rx: MRx<BorderMessage>,
}

impl BorderLink for ChannelBorderLink {
    fn send(&mut self, message: BorderMessage) -> Result<(), TurnError> {
        self.tx.send(message).map_err(|_| TurnError::LinkClosed)
    }

    fn recv(&mut self) -> Result<BorderMessage, TurnError> {
        self.rx.recv().map_err(|_| TurnError::LinkClosed)
    }
}

/// Build both halves of one border cable.
#[must_use]
pub fn border_cable() -> (ChannelBorderLink, ChannelBorderLink) {
    detect_backoff_cfg();
    let (tx_ab, rx_ab) = mpmc::bounded_blocking(CABLE_DEPTH);
    let (tx_ba, rx_ba) = mpmc::bounded_blocking(CABLE_DEPTH);
    (
        ChannelBorderLink {
            tx: tx_ab,
            rx: rx_ba,
        },
        ChannelBorderLink {
            tx: tx_ba,
            rx: rx_ab,
        },
    )
}

/// Node-side endpoint of one client connection.
pub struct ClientPort {
    pub tx: MTx<NodeToClient>,
    pub rx: MRx<ClientToNode>,
}

/// Client-side endpoint of its node connection.
pub struct ClientHandle {
    pub tx: MTx<ClientToNode>,
    pub rx: MRx<NodeToClient>,
}

/// Build both halves of one client cable.
#[must_use]
pub fn client_cable() -> (ClientPort, ClientHandle) {
    detect_backoff_cfg();
    let (tx_down, rx_down) = mpmc::bounded_blocking(CABLE_DEPTH);
    let (tx_up, rx_up) = mpmc::bounded_blocking(CABLE_DEPTH);
    (
        ClientPort {
            tx: tx_down,
            rx: rx_up,
        },
        ClientHandle {
            tx: tx_up,
            rx: rx_down,
        },
    )
}

/// Node-side endpoint of the coordinator connection.
pub struct CoordinatorPort {
    pub tx: MTx<DoneSignal>,
    pub rx: MRx<TurnBeginSignal>,
}

/// Coordinator-side endpoint of one node connection.
pub struct NodeHandle {
    pub tx: MTx<TurnBeginSignal>,
    pub rx: MRx<DoneSignal>,
}

/// Build both halves of one coordinator cable.
#[must_use]
pub fn coordinator_cable() -> (CoordinatorPort, NodeHandle) {
    detect_backoff_cfg();
    let (tx_up, rx_up) = mpmc::bounded_blocking(CABLE_DEPTH);
    let (tx_down, rx_down) = mpmc::bounded_blocking(CABLE_DEPTH);
    (
        CoordinatorPort {
            tx: tx_up,
            rx: rx_down,
        },
        NodeHandle {
            tx: tx_down,
            rx: rx_up,
        },
    )
}

/// Named resource-acquisition policy for startup races.
///
/// Peer processes launch in arbitrary order, so acquiring a connection or
/// registration is retried with bounded exponential backoff instead of an
/// inlined sleep loop. Steady-state failures are never retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(200),
            max_attempts: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, sleeping with doubling delay between
    /// attempts. The final error is returned once attempts are exhausted.
    pub fn acquire<T, E>(&self, mut op: impl FnMut() -> Result<T, E>) -> Result<T, E> {
        let mut delay = self.base_delay;
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                    thread::sleep(delay);
                    delay = (delay * 2).min(self.max_delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn border_cable_roundtrips_messages() {
        let (mut a, mut b) = border_cable();
        a.send(BorderMessage::Request).expect("send");
        assert_eq!(b.recv().expect("recv"), BorderMessage::Request);
        b.send(BorderMessage::Handoff(Default::default())).expect("send back");
        assert!(matches!(a.recv().expect("recv"), BorderMessage::Handoff(_)));
    }

    #[test]
    fn retry_policy_succeeds_after_transient_failures() {
        let policy = RetryPolicy {
            base_delay: Duration::from_micros(10),
            max_delay: Duration::from_micros(100),
            max_attempts: 10,
        };
        let mut remaining_failures = 3;
        let value: Result<u32, &str> = policy.acquire(|| {
            if remaining_failures > 0 {
                remaining_failures -= 1;
                Err("not yet")
            } else {
                Ok(7)
            }
        });
        assert_eq!(value, Ok(7));
    }

    #[test]
    fn retry_policy_exhausts_attempts() {
        let policy = RetryPolicy {
            base_delay: Duration::from_micros(10),
            max_delay: Duration::from_micros(50),
            max_attempts: 4,
        };
        let mut calls = 0;
        let value: Result<(), &str> = policy.acquire(|| {
            calls += 1;
            Err("never")
        });
        assert_eq!(value, Err("never"));
        assert_eq!(calls, 4);
    }
}
