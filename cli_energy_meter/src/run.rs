use std::{
    io::Write,
    time::{Duration, Instant},
};

use anyhow::Context;
use jetson_energy::EnergySampler;
use log::info;

use crate::workload::Workload;

pub struct RunConfig {
    pub runs: usize,
    pub iterations: usize,
    pub concurrency: usize,
    pub workload: Workload,
}

/// The result of one measured run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run: usize,
    /// Number of units of work
    pub units: usize,
    pub duration: Duration,
    /// Number of samples taken by the sampler
    pub ticks: u64,
    /// Energy of the whole run, in milliJoules
    pub energy: f64,
}

impl RunReport {
    pub fn energy_per_unit(&self) -> f64 {
        if self.units == 0 {
            0.0
        } else {
            self.energy / self.units as f64
        }
    }
}

/// Runs the measurements one after the other, writes one csv line per run.
///
/// The sampler must have been started.
pub async fn run<W: Write>(writer: &mut W, sampler: &EnergySampler, config: &RunConfig) -> anyhow::Result<Vec<RunReport>> {
    anyhow::ensure!(
        config.runs > 0 && config.iterations > 0 && config.concurrency > 0,
        "nothing to measure: {} runs of {} bursts of {} units",
        config.runs,
        config.iterations,
        config.concurrency
    );
    writeln!(writer, "run;units;duration_ms;ticks;energy_mj;energy_per_unit_mj")?;

    let mut reports = Vec::with_capacity(config.runs);
    for run in 0..config.runs {
        let report = measure_run(run, sampler, config).await?;
        writeln!(
            writer,
            "{};{};{};{};{};{}",
            report.run,
            report.units,
            report.duration.as_millis(),
            report.ticks,
            report.energy,
            report.energy_per_unit()
        )?;
        reports.push(report);
    }
    writer.flush()?;

    let best = reports.iter().map(RunReport::energy_per_unit).reduce(f64::min);
    if let Some(best) = best {
        info!("{} runs, lowest energy per unit: {best} mJ", reports.len());
    }
    Ok(reports)
}

async fn measure_run(run: usize, sampler: &EnergySampler, config: &RunConfig) -> anyhow::Result<RunReport> {
    sampler.start_measuring().context("start measuring")?;
    let start = Instant::now();

    for _ in 0..config.iterations {
        config
            .workload
            .burst(config.concurrency)
            .await
            .with_context(|| format!("run {run} failed"))?;
    }

    let duration = start.elapsed();
    sampler.stop_measuring().context("stop measuring")?;
    let energy = sampler
        .total_energy()
        .with_context(|| format!("the energy of run {run} is invalid"))?;

    let report = RunReport {
        run,
        units: config.iterations * config.concurrency,
        duration,
        ticks: sampler.ticks(),
        energy,
    };
    info!(
        "run {run}: {} units in {:?}, {} samples, {energy} mJ",
        report.units, report.duration, report.ticks
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use jetson_energy::{
        ChannelKind, DeviceProfile, EnergySampler, Formula, Rail, SamplingMode, SequenceChannel, SimulatedSource,
    };

    use super::{run, RunConfig};
    use crate::workload::Workload;

    fn simulated_sampler(current: SequenceChannel) -> anyhow::Result<EnergySampler> {
        let source = SimulatedSource::new().with(Rail::Gpu, ChannelKind::Current, current);
        let mode = SamplingMode::new(Rail::Gpu, Formula::CurrentOnly);
        let sampler = EnergySampler::with_source(DeviceProfile::Orin2, Duration::from_millis(1), mode, &source)?;
        Ok(sampler)
    }

    #[tokio::test]
    async fn test_runs_write_csv() -> anyhow::Result<()> {
        let sampler = simulated_sampler(SequenceChannel::constant(500.0))?;
        sampler.start()?;

        let config = RunConfig {
            runs: 2,
            iterations: 3,
            concurrency: 2,
            workload: Workload::Sleep(Duration::from_millis(5)),
        };
        let mut out = Vec::new();
        let reports = run(&mut out, &sampler, &config).await?;
        sampler.finish()?;

        assert_eq!(reports.len(), 2);
        for (i, r) in reports.iter().enumerate() {
            assert_eq!(r.run, i);
            assert_eq!(r.units, 6);
            assert!(r.duration >= Duration::from_millis(15));
            assert!((r.energy - r.ticks as f64 * 0.002 * 500.0).abs() < 1e-9);
            assert!((r.energy_per_unit() - r.energy / 6.0).abs() < 1e-12);
        }

        let csv = String::from_utf8(out)?;
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "run;units;duration_ms;ticks;energy_mj;energy_per_unit_mj");
        assert!(lines[1].starts_with("0;6;"));
        assert!(lines[2].starts_with("1;6;"));
        Ok(())
    }

    #[tokio::test]
    async fn test_reject_empty_runs() -> anyhow::Result<()> {
        let sampler = simulated_sampler(SequenceChannel::constant(500.0))?;
        sampler.start()?;

        let config = RunConfig {
            runs: 1,
            iterations: 0,
            concurrency: 1,
            workload: Workload::Sleep(Duration::from_millis(1)),
        };
        let mut out = Vec::new();
        assert!(run(&mut out, &sampler, &config).await.is_err());
        assert!(out.is_empty());
        sampler.finish()?;
        Ok(())
    }

    #[tokio::test]
    async fn test_sampling_failure_aborts_the_run() -> anyhow::Result<()> {
        let sampler = simulated_sampler(SequenceChannel::failing_after(2, 500.0))?;
        sampler.start()?;

        let config = RunConfig {
            runs: 1,
            iterations: 5,
            concurrency: 1,
            workload: Workload::Sleep(Duration::from_millis(10)),
        };
        let mut out = Vec::new();
        let result = run(&mut out, &sampler, &config).await;
        assert!(result.is_err());

        // only the header: no energy is reported for the failed run
        assert_eq!(String::from_utf8(out)?.lines().count(), 1);
        assert!(sampler.finish().is_err());
        Ok(())
    }
}
