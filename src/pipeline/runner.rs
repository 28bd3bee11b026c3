//! Threaded driver around one `SubbandProc`.
//!
//! Three parties share two pools:
//!
//! - a producer thread acquires free `InputData`, fills it from an
//!   `InputSource` and submits it;
//! - the calling thread processes each filled input into a free
//!   `OutputData`, then offers deliverable outputs to a best-effort queue;
//! - a writer thread drains that queue into an `OutputSink`.
//!
//! Outputs the writer cannot keep up with are dropped with a warning and
//! counted, never waited for: the device side must keep its cadence.

use std::thread;

use anyhow::{anyhow, Context};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::device::DeviceQueue;
use crate::error::PipelineError;
use crate::pipeline::input::InputData;
use crate::pipeline::output::OutputData;
use crate::pipeline::pool::{AcquirePolicy, BestEffortQueue, Pool, PoolError};
use crate::pipeline::subband_proc::SubbandProc;

/// Upstream producer of filled input blocks.
pub trait InputSource: Send {
    /// Fill `input` with the next block; `Ok(false)` at end of stream.
    fn fill(&mut self, input: &mut InputData) -> anyhow::Result<bool>;
}

/// Downstream consumer of deliverable outputs.
pub trait OutputSink: Send {
    fn write(&mut self, output: &OutputData) -> anyhow::Result<()>;
}

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub input_pool_size: usize,
    pub output_pool_size: usize,

    /// Outputs buffered ahead of the writer before dropping.
    pub output_queue_depth: usize,

    /// Behaviour when no free output is available for a block.
    pub output_policy: AcquirePolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            input_pool_size: 3,
            output_pool_size: 5,
            output_queue_depth: 3,
            output_policy: AcquirePolicy::Block,
        }
    }
}

impl RunnerConfig {
    /// Outputs must cover one in process, the queue, and one being written.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.input_pool_size < 2 {
            return Err(PipelineError::InvalidConfig(format!(
                "input pool of {} cannot overlap filling and processing",
                self.input_pool_size
            )));
        }
        if self.output_queue_depth == 0 {
            return Err(PipelineError::InvalidConfig(
                "output queue depth must be positive".into(),
            ));
        }
        let needed = self.output_queue_depth + 2;
        if self.output_pool_size < needed {
            return Err(PipelineError::InvalidConfig(format!(
                "output pool of {} is below the {} a queue depth of {} needs",
                self.output_pool_size, needed, self.output_queue_depth
            )));
        }
        Ok(())
    }
}

/// What happened to the blocks of one run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub blocks: u64,

    /// Outputs handed to the writer.
    pub emitted: u64,

    /// Deliverable outputs dropped because the writer fell behind.
    pub dropped: u64,

    /// Blocks skipped unprocessed because no output object was free. They
    /// never reach the integrator or the filter history, so the
    /// integrations they belong to come out short.
    pub starved: u64,

    /// Blocks that only advanced an integration.
    pub non_final: u64,
}

/// Drive `proc` until `source` is exhausted.
pub fn run<Q, S, W>(
    proc: &mut SubbandProc<Q>,
    mut source: S,
    mut sink: W,
    config: &RunnerConfig,
) -> anyhow::Result<RunSummary>
where
    Q: DeviceQueue,
    S: InputSource,
    W: OutputSink,
{
    config.validate()?;
    let settings = proc.settings().clone();
    let inputs = Pool::with_capacity("input", config.input_pool_size, || InputData::new(&settings));
    let outputs = Pool::with_capacity("output", config.output_pool_size, || {
        OutputData::new(&settings)
    });
    let queue = BestEffortQueue::new(config.output_queue_depth);

    thread::scope(|s| {
        let producer = s.spawn(|| -> anyhow::Result<u64> {
            let mut produced = 0;
            loop {
                let mut input = match inputs.acquire(AcquirePolicy::Block) {
                    Ok(input) => input,
                    Err(PoolError::Closed(_)) => return Ok(produced),
                    Err(e) => return Err(e.into()),
                };
                let filled = source.fill(&mut input).context("input source failed");
                match filled {
                    Ok(true) => {
                        inputs.submit(input)?;
                        produced += 1;
                    }
                    Ok(false) => {
                        inputs.release(input)?;
                        inputs.finish()?;
                        return Ok(produced);
                    }
                    Err(e) => {
                        let _ = inputs.finish();
                        return Err(e);
                    }
                }
            }
        });

        let writer = s.spawn(|| -> anyhow::Result<u64> {
            let mut written = 0;
            while let Some(output) = queue.pop() {
                if let Err(e) = sink.write(&output) {
                    // Unblock the processing loop before bailing out.
                    outputs.close();
                    inputs.close();
                    return Err(e.context("output sink failed"));
                }
                outputs.release(output)?;
                written += 1;
            }
            Ok(written)
        });

        let processed = process_loop(proc, &inputs, &outputs, &queue, config.output_policy);
        queue.finish();
        if processed.is_err() {
            inputs.close();
            outputs.close();
        }

        let produced = producer
            .join()
            .map_err(|_| anyhow!("producer thread panicked"))?;
        let written = writer
            .join()
            .map_err(|_| anyhow!("writer thread panicked"))?;

        // A failed writer or producer closes the pools, which the processing
        // loop then reports as `Closed`; surface the root cause first.
        let written = written?;
        let produced = produced?;
        let summary = processed?;
        info!(
            "run complete: {} produced, {} processed, {} written, {} dropped, {} starved, {} non-final",
            produced,
            summary.blocks,
            written,
            summary.dropped,
            summary.starved,
            summary.non_final
        );
        Ok(summary)
    })
}

fn process_loop<Q: DeviceQueue>(
    proc: &mut SubbandProc<Q>,
    inputs: &Pool<InputData>,
    outputs: &Pool<OutputData>,
    queue: &BestEffortQueue<OutputData>,
    policy: AcquirePolicy,
) -> anyhow::Result<RunSummary> {
    let mut summary = RunSummary::default();
    while let Some(input) = inputs.next_filled()? {
        let mut output = match outputs.acquire(policy) {
            Ok(output) => output,
            Err(PoolError::Exhausted(_)) => {
                warn!(
                    "{}: no free output, skipping block; its integration will be short",
                    input.block
                );
                summary.blocks += 1;
                summary.starved += 1;
                inputs.release(input)?;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        proc.process_subband(&input, &mut output)
            .with_context(|| format!("processing {}", input.block))?;
        let block = input.block;
        inputs.release(input)?;
        summary.blocks += 1;

        if !proc.postprocess_subband(&mut output)? {
            debug!("{}: nothing to deliver yet", block);
            summary.non_final += 1;
            outputs.release(output)?;
            continue;
        }
        match queue.try_push(output) {
            Ok(()) => summary.emitted += 1,
            Err(output) => {
                warn!("{}: writer behind, dropping output", block);
                summary.dropped += 1;
                outputs.release(output)?;
            }
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::host::HostQueue;
    use crate::parset::presets;
    use crate::pipeline::block::BlockId;
    use crate::pipeline::synthetic::SyntheticSource;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<BlockId>>>);

    impl OutputSink for Collect {
        fn write(&mut self, output: &OutputData) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(output.block);
            Ok(())
        }
    }

    struct Slow(Duration);

    impl OutputSink for Slow {
        fn write(&mut self, _output: &OutputData) -> anyhow::Result<()> {
            thread::sleep(self.0);
            Ok(())
        }
    }

    struct Failing;

    impl OutputSink for Failing {
        fn write(&mut self, _output: &OutputData) -> anyhow::Result<()> {
            Err(anyhow!("disk full"))
        }
    }

    #[test]
    fn test_validate_pool_sizing() {
        assert!(RunnerConfig::default().validate().is_ok());
        let small = RunnerConfig {
            output_pool_size: 4,
            output_queue_depth: 3,
            ..Default::default()
        };
        assert!(small.validate().is_err());
        let single = RunnerConfig {
            input_pool_size: 1,
            ..Default::default()
        };
        assert!(single.validate().is_err());
    }

    #[test]
    fn test_every_block_delivered_in_order() {
        let settings = presets::correlator(3, 16);
        let mut proc = SubbandProc::new(settings.clone(), HostQueue::new()).unwrap();
        let source = SyntheticSource::new(&settings, vec![0], 6, 3).unwrap();
        let sink = Collect::default();

        let summary = run(&mut proc, source, sink.clone(), &RunnerConfig::default()).unwrap();
        assert_eq!(summary.blocks, 6);
        assert_eq!(summary.emitted, 6);
        assert_eq!(summary.dropped, 0);
        let seen: Vec<u64> = sink.0.lock().unwrap().iter().map(|b| b.block).collect();
        assert_eq!(seen, (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn test_non_final_integrations_are_not_written() {
        let mut settings = presets::correlator(3, 16);
        settings.correlator.nr_blocks_per_integration = 2;
        let mut proc = SubbandProc::new(settings.clone(), HostQueue::new()).unwrap();
        let source = SyntheticSource::new(&settings, vec![0], 6, 3).unwrap();
        let sink = Collect::default();

        let summary = run(&mut proc, source, sink.clone(), &RunnerConfig::default()).unwrap();
        assert_eq!(summary.non_final, 3);
        assert_eq!(summary.emitted, 3);
        assert_eq!(sink.0.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_slow_writer_drops_instead_of_blocking() {
        let settings = presets::correlator(2, 16);
        let mut proc = SubbandProc::new(settings.clone(), HostQueue::new()).unwrap();
        let source = SyntheticSource::new(&settings, vec![0], 20, 3).unwrap();
        let config = RunnerConfig {
            output_queue_depth: 1,
            output_pool_size: 3,
            output_policy: AcquirePolicy::Fail,
            ..Default::default()
        };

        let summary = run(&mut proc, source, Slow(Duration::from_millis(20)), &config).unwrap();
        assert_eq!(summary.blocks, 20);
        assert_eq!(summary.emitted + summary.dropped + summary.starved, 20);
        assert!(summary.dropped > 0);
    }

    #[test]
    fn test_blocks_without_free_output_counted_as_starved() {
        let settings = presets::correlator(2, 16);
        let mut proc = SubbandProc::new(settings.clone(), HostQueue::new()).unwrap();
        let mut source = SyntheticSource::new(&settings, vec![0], 3, 5).unwrap();

        let inputs = Pool::with_capacity("input", 3, || InputData::new(&settings));
        for _ in 0..3 {
            let mut input = inputs.acquire(AcquirePolicy::Fail).unwrap();
            assert!(source.fill_block(&mut input));
            inputs.submit(input).unwrap();
        }
        inputs.finish().unwrap();

        // nothing drains the queue, so the single output is never returned
        let outputs = Pool::with_capacity("output", 1, || OutputData::new(&settings));
        let queue = BestEffortQueue::new(4);
        let summary =
            process_loop(&mut proc, &inputs, &outputs, &queue, AcquirePolicy::Fail).unwrap();

        assert_eq!(summary.blocks, 3);
        assert_eq!(summary.emitted, 1);
        assert_eq!(summary.starved, 2);
        assert_eq!(summary.dropped, 0);
        assert_eq!(proc.stats().blocks, 1);
        assert_eq!(inputs.nr_free(), 3);
    }

    #[test]
    fn test_sink_failure_ends_the_run() {
        let settings = presets::correlator(2, 16);
        let mut proc = SubbandProc::new(settings.clone(), HostQueue::new()).unwrap();
        let source = SyntheticSource::new(&settings, vec![0], 50, 3).unwrap();

        let err = run(&mut proc, source, Failing, &RunnerConfig::default()).unwrap_err();
        assert!(format!("{:#}", err).contains("disk full"));
    }
}
