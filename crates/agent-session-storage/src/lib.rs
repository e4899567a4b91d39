//! Embedded relational store for one session: events, execution leases, the
//! command queue, execution records, and a small KV area for metadata,
//! activity tracking, and the interrupt flag. Backed by `rusqlite` in WAL
//! mode, one physical file per session directory.

mod connection;
mod events;
mod executions;
mod kv;
mod leases;
mod migrations;
mod queue;

pub use connection::SessionStore;
