//! Capability abstractions the retriever depends on: [`EngramStore`] and
//! [`VectorIndex`]. Together with [`crate::context::EnvironmentProbe`],
//! these are the only three capabilities the retriever knows about;
//! production wiring composes the SQLite-backed store and the
//! memory-mapped matrices behind them.

mod store;
mod vector;

pub use store::EngramStore;
pub use vector::VectorIndex;
