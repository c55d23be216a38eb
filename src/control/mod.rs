//! # Device Control
//!
//! Everything needed to drive one remote cooling device over a pub/sub broker:
//!
//! ```text
//! control/
//! ├── types.rs      - Identity, endpoint, line, snapshot value types
//! ├── error.rs      - ControlError
//! ├── topics.rs     - Topic derivation per device
//! ├── rate_gate.rs  - Minimum interval between commands
//! ├── session.rs    - DeviceSession: connection lifecycle, reconciliation, commands
//! └── probe.rs      - Broker reachability checks
//! ```
//!
//! The device runs on either its principal or its auxiliary line. A session publishes
//! the line it wants on `remoteled/{device}/desired` (retained) and learns the line the
//! device actually runs from `remoteled/{device}/reported`.

pub mod error;
pub mod probe;
pub mod rate_gate;
pub mod session;
pub mod topics;
pub mod types;

pub use error::ControlError;
pub use probe::{
    probe, probe_all, probe_url, BrokerProbe, ProbeCandidate, ProbeResult, DEFAULT_PROBE_TIMEOUT,
};
pub use session::{ChangeSubscription, DeviceSession, SessionOptions};
pub use topics::DeviceTopics;
pub use types::{
    BrokerEndpoint, CommandRecord, ConnectionState, DeviceIdentity, DeviceLine, SessionSnapshot,
    TransportScheme,
};
