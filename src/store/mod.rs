//! Datastore clients: the document store (MongoDB) and the timeseries
//! store (PostgreSQL/TimescaleDB via `sqlx`).

pub mod document;
pub mod timeseries;

pub use document::DocumentStore;
pub use timeseries::TimeseriesStore;
