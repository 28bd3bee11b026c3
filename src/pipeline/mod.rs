//! Host-side data objects and the machinery that moves them.

pub mod block;
pub mod input;
pub mod output;
pub mod pool;
pub mod runner;
pub mod stats;
pub mod subband_proc;
pub mod synthetic;

pub use block::BlockId;
pub use input::{InputData, InputSamples};
pub use output::{BeamFormedData, CorrelatedData, OutputData};
pub use pool::{AcquirePolicy, BestEffortQueue, Pool, PoolError};
pub use runner::{run, InputSource, OutputSink, RunSummary, RunnerConfig};
pub use stats::{ProcStats, StatsReport};
pub use subband_proc::{DelayUploadCache, ProcState, SubbandProc};
pub use synthetic::SyntheticSource;
