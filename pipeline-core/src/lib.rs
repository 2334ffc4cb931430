// We do this pattern (privately use a module, then re-export parts of it) so
// we can refactor the internals without breaking the public API.

mod aggregates;
mod channels;
mod consume;
mod envelope;
mod error;
pub mod metrics_consts;
mod publish;
mod store;
mod timer;
mod worker;

// Envelope & codec
pub use envelope::{decode, encode, encode_envelope, Envelope, Payload};

// Channels
pub use channels::{Channel, DEAD_LETTER_CHANNEL};

// Errors
pub use error::PipelineError;

// Publisher
pub use publish::{Publisher, PublisherConfig};

// Consumer
pub use consume::{Consumer, DeliveryRecord};

// Worker loop
pub use worker::{Handler, HandlerOutcome, StreamWorker, WorkerConfig};

// Store
pub use store::{PersistOutcome, PgStore, Store};

// Aggregates & scoring
pub use aggregates::{
    compute_metrics, AggregationWindow, MetricSet, ScoringStrategy, WeightedScoring, WindowStats,
    DEFAULT_WINDOWS,
};

// Timer
pub use timer::PeriodicTimer;

#[doc(hidden)]
pub mod test_support {
    pub use crate::store::MemoryStore;
}
