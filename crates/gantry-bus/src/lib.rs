//! gantry-bus — the real-time event/command bus.
//!
//! Multiplexes structured JSON envelopes between the control plane, node
//! agents, and observer clients. Each connected party gets its own channel
//! in the [`BusHub`]; server-scoped events are delivered only to channels
//! that subscribed to that server.
//!
//! The hub is transport-agnostic: WebSocket handlers (in `gantry-api` and
//! `gantry-agent`) move envelopes between sockets and hub channels.
//!
//! This hub assumes a single control-plane instance. Fanning out across
//! instances would need an external broker, which is out of scope.

pub mod envelope;
pub mod error;
pub mod hub;
pub mod policy;

pub use envelope::{
    BackupReport, BackupRequest, CommandPayload, ConsoleLine, DeploySpec, Envelope, ErrorPayload,
    MessageType, ProcessStats, RegistrationPayload, RestoreRequest, StatusUpdate,
};
pub use error::{BusError, BusResult};
pub use hub::{BusHub, ChannelId, Peer};
pub use policy::{AccessPolicy, AllowAll, SharedToken};
