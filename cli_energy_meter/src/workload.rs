use std::{
    hint::black_box,
    process::Stdio,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use futures::future::try_join_all;
use log::debug;
use tokio::process::Command;

use crate::cli::WorkloadType;

/// A unit of work, repeated during a measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Workload {
    Sleep(Duration),
    Spin(Duration),
    Command { program: String, args: Vec<String> },
}

impl Workload {
    pub fn new(kind: WorkloadType, work: Duration, command: &[String]) -> anyhow::Result<Workload> {
        match kind {
            WorkloadType::Sleep => Ok(Workload::Sleep(work)),
            WorkloadType::Spin => Ok(Workload::Spin(work)),
            WorkloadType::Command => {
                let (program, args) = command
                    .split_first()
                    .context("the command workload requires --command <PROGRAM> [ARGS]...")?;
                Ok(Workload::Command {
                    program: program.clone(),
                    args: args.to_vec(),
                })
            }
        }
    }

    /// Runs `concurrency` units of work at the same time and waits for all of them.
    pub async fn burst(&self, concurrency: usize) -> anyhow::Result<()> {
        try_join_all((0..concurrency).map(|_| self.unit())).await?;
        Ok(())
    }

    async fn unit(&self) -> anyhow::Result<()> {
        match self {
            Workload::Sleep(d) => tokio::time::sleep(*d).await,
            Workload::Spin(d) => {
                let d = *d;
                tokio::task::spawn_blocking(move || spin(d)).await?;
            }
            Workload::Command { program, args } => {
                let status = Command::new(program)
                    .args(args)
                    .stdout(Stdio::null())
                    .status()
                    .await
                    .with_context(|| format!("failed to launch {program}"))?;
                debug!("{program} exited with {status}");
                if !status.success() {
                    return Err(anyhow!("{program} failed: {status}"));
                }
            }
        }
        Ok(())
    }
}

/// Keeps a core busy for `duration`.
fn spin(duration: Duration) -> u64 {
    let start = Instant::now();
    let mut acc: u64 = 0;
    while start.elapsed() < duration {
        for i in 0..1000u64 {
            acc = black_box(acc.wrapping_mul(31).wrapping_add(i));
        }
    }
    acc
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{spin, Workload};
    use crate::cli::WorkloadType;

    #[test]
    fn test_new_command_workload() -> anyhow::Result<()> {
        let cmd = vec![String::from("sysbench"), String::from("cpu"), String::from("run")];
        let w = Workload::new(WorkloadType::Command, Duration::ZERO, &cmd)?;
        assert_eq!(
            w,
            Workload::Command {
                program: String::from("sysbench"),
                args: vec![String::from("cpu"), String::from("run")]
            }
        );
        assert!(Workload::new(WorkloadType::Command, Duration::ZERO, &[]).is_err());
        Ok(())
    }

    #[test]
    fn test_spin() {
        let start = Instant::now();
        spin(Duration::from_millis(10));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_sleep_burst_is_concurrent() -> anyhow::Result<()> {
        let w = Workload::Sleep(Duration::from_millis(50));
        let start = Instant::now();
        w.burst(8).await?;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(8 * 50), "{elapsed:?}");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_status() -> anyhow::Result<()> {
        let ok = Workload::Command {
            program: String::from("true"),
            args: vec![],
        };
        ok.burst(2).await?;

        let failing = Workload::Command {
            program: String::from("false"),
            args: vec![],
        };
        assert!(failing.burst(1).await.is_err());
        Ok(())
    }
}
