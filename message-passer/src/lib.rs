//! Multegula message passer
//!
//! A fixed group of named nodes connect into a full TCP mesh and exchange
//! direct and multicast messages.  Multicasts are delivered in causal order
//! using vector clocks:
//!
//! - **Mesh setup**: name order decides who dials whom, so each pair of
//!   nodes gets exactly one connection and every node also holds a loopback
//!   to itself.
//! - **Causal multicast**: the origin stamps a multicast once; every
//!   recipient relays it to the rest of the group, and holds it back until
//!   everything it depends on has been delivered.
//! - **Direct messages**: numbered per destination, delivered on arrival.
//! - **Fault injection**: configured rules drop or delay matching traffic
//!   on the send and receive paths.
//!
//! ## Architecture
//!
//! ```text
//!  application ── send / multicast ──┐        ┌── receive ── application
//!                                    ▼        │
//!  ┌────────────────────────────────────────────────────────────────┐
//!  │  Dispatcher (single task, never waits on the network)          │
//!  │  • CausalEngine: vector clock + holdback queue                 │
//!  │  • SequenceCounters: per-destination numbering                 │
//!  │  • send- and receive-side FaultInjectors                       │
//!  └───────────────┬───────────────────────────────▲────────────────┘
//!                  │ Links: one queue per peer     │ Inbound
//!  ┌───────────────▼──────────────┐  ┌─────────────┴────────────────┐
//!  │  Writer task per connection  │  │  Reader task per connection  │
//!  │  • owns one write half       │  │  • length-prefixed frames    │
//!  │  • flushes on shutdown       │  │  • exits on end of stream    │
//!  └───────────────┬──────────────┘  └─────────────▲────────────────┘
//!                  │      one TCP link per node    │
//!                  └────────── MeshConnector ──────┘
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`]    | `MessagePasserConfig`, cluster file, dev overrides |
//! | [`node`]      | `Node` and the sorted `NodeDirectory` |
//! | [`message`]   | Wire types, bincode ser/de, framing helpers |
//! | [`transport`] | Frame I/O, reader and writer tasks |
//! | [`mesh`]      | Full-mesh connection bootstrap |
//! | [`rules`]     | Drop / delay fault injection |
//! | [`causal`]    | Vector-clock delivery engine |
//! | [`unicast`]   | Per-destination sequence numbers |
//! | [`dispatch`]  | State-owning dispatch task |
//! | [`bootstrap`] | Peer list discovery seam |
//! | [`passer`]    | `MessagePasser` application handle |
//! | [`error`]     | Crate-wide error enum |

pub mod bootstrap;
pub mod causal;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod mesh;
pub mod message;
pub mod node;
pub mod passer;
pub mod rules;
pub mod transport;
pub mod unicast;

pub use {
    bootstrap::{Bootstrap, StaticBootstrap},
    config::{ClusterConfig, FaultRules, MessagePasserConfig},
    dispatch::ClockSnapshot,
    error::{MessagePasserError, Result},
    message::{Message, MULTICAST_DESTINATION},
    node::{Node, NodeDirectory},
    passer::{MessagePasser, MessageSender},
    rules::{Rule, RuleAction, RuleSet},
};
