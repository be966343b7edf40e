//! Queue-driven worker processes: Parser Worker (`raw_logs` → `features`)
//! and Detector Worker (`features` → persisted `AnomalyResult`), the two
//! halves of the pipeline protocol.

pub mod detector;
pub mod parser;

pub use detector::DetectorWorker;
pub use parser::{ParserWorker, WorkerCounts};
