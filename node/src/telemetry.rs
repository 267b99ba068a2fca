//! Metric names recorded by the node.
//!
//! Recording is a no-op until a recorder is installed (the binary installs
//! the Prometheus exporter).

use metrics::{counter, describe_counter, describe_gauge, gauge};

pub const DISCOVERY_ROUNDS: &str = "soundmesh_discovery_rounds_total";
pub const HANDSHAKES: &str = "soundmesh_handshakes_total";
pub const FETCHES: &str = "soundmesh_fetch_total";
pub const CONTENT_ADDED: &str = "soundmesh_content_added_total";
pub const KNOWN_PEERS: &str = "soundmesh_known_peers";

pub fn describe_metrics() {
    describe_counter!(DISCOVERY_ROUNDS, "Discovery rounds completed");
    describe_counter!(
        HANDSHAKES,
        "Discover handshakes attempted, labelled by outcome"
    );
    describe_counter!(
        FETCHES,
        "Remote content fetch attempts, labelled by outcome (ok, mismatch, not_found, unreachable)"
    );
    describe_counter!(CONTENT_ADDED, "Content objects added locally");
    describe_gauge!(KNOWN_PEERS, "Peers currently in the peer table");
}

pub(crate) fn handshake(outcome: &'static str) {
    counter!(HANDSHAKES, "outcome" => outcome).increment(1);
}

pub(crate) fn fetch(outcome: &'static str) {
    counter!(FETCHES, "outcome" => outcome).increment(1);
}

pub(crate) fn discovery_round(known_peers: usize) {
    counter!(DISCOVERY_ROUNDS).increment(1);
    gauge!(KNOWN_PEERS).set(known_peers as f64);
}

pub(crate) fn content_added() {
    counter!(CONTENT_ADDED).increment(1);
}
