//! Concurrent staged-pipeline primitives.
//!
//! A bounded ring buffer with one or more producers, consumer groups wired
//! into fan-out/join topologies, and the stage loop that runs on each group.

pub mod barrier;
pub mod clock;
pub mod error;
pub mod ring;
pub mod sequence;
pub mod stage;
pub mod wait;

pub use barrier::Consumer;
pub use clock::{Clock, ManualClock, QuantaClock, SystemClock};
pub use error::{Error, Result};
pub use ring::{
    Access, Claim, GroupId, GroupStats, MultiProducer, Producer, ProducerMode, RingBuffer,
    RingBufferBuilder,
};
pub use sequence::{Sequence, INITIAL_SEQUENCE};
pub use stage::{EventRef, Stage};
pub use wait::WaitStrategy;
