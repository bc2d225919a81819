//! Consumes the raw change channels of both sources into the bronze lake.
//!
//! A [`Supervisor`] runs one [`ConsumerTask`] per source. A task reads every partition of its
//! channel from the committed checkpoints onward, normalizes each raw envelope, writes the
//! resulting [`bronze_types::ChangeEvent`] to the lake (or the raw envelope to the dead-letter
//! store) and only then advances the partition checkpoint. Delivery is at-least-once; the
//! create-if-absent lake write makes redelivery invisible downstream.

mod consumer;
mod metrics;
mod state;
mod supervisor;

pub use consumer::{
    CaptureBootstrap, ConsumerConfig, ConsumerDeps, ConsumerError, ConsumerTask, SourcePipeline,
};
pub use state::{ConsumerState, StopReason};
pub use supervisor::{Supervisor, SupervisorHandle};

#[cfg(test)]
mod test_util;
