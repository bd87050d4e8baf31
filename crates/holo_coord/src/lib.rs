//! Distributed operation coordination crate.
//!
//! A leader node drives client-submitted operations through one or more rounds
//! of per-member execution (`coord`), ordering every round through an
//! append-only operation log (`oplog`). Each node also tracks which
//! transactions it has observed per sequence slot (`sequence`) so replicas can
//! detect the transactions they are missing. `local` provides an in-process
//! network and node wiring used by tests and the simulator.

mod codec;
pub mod coord;
pub mod local;
pub mod oplog;
pub mod sequence;
