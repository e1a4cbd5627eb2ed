pub mod engine;
pub mod programs;

pub use engine::{SequenceOutcome, SequenceRunner, MIN_STEP_DELAY};
pub use programs::{
    run_maf_sampling, run_sequence_two, AxisPresets, InitStrategy, SequenceIo, MAF_SAMPLING,
    SEQUENCE_TWO,
};
