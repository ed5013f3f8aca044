use std::{fmt::Display, path::PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use jetson_energy::{DeviceProfile, Formula, Rail};

#[derive(Parser)]
#[command(author, version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Only show the sensor channels of a device, then exit.
    Info {
        /// The board to inspect.
        #[arg(short, long, value_enum)]
        profile: DeviceProfile,

        /// Root of the sysfs, change it to use a copy of the sensor files.
        #[arg(long, default_value = "/")]
        sysfs_root: PathBuf,
    },

    /// Measure the energy consumed by bursts of work.
    Run {
        /// The board to measure.
        #[arg(short, long, value_enum)]
        profile: DeviceProfile,

        /// The power rail to sample.
        #[arg(short, long, visible_alias = "mode", default_value = "GPU")]
        rail: Rail,

        /// How to compute the energy of a sample.
        #[arg(short, long, value_enum, default_value_t = Formula::CurrentVoltage)]
        formula: Formula,

        /// Sampling period, in milliseconds.
        #[arg(long, default_value_t = 2)]
        period_ms: u64,

        /// Number of bursts per run.
        #[arg(short, long, default_value_t = 100, value_parser = clap::value_parser!(u64).range(1..))]
        iterations: u64,

        /// Number of concurrent units of work in a burst.
        #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
        concurrency: u64,

        /// Number of measured runs.
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
        runs: u64,

        /// What a unit of work does.
        #[arg(short, long, value_enum, default_value_t = WorkloadType::Sleep)]
        workload: WorkloadType,

        /// Duration of a unit of work, for the sleep and spin workloads.
        #[arg(long, default_value_t = 10)]
        work_ms: u64,

        /// Program and arguments to launch for each unit of work, for the command workload.
        #[arg(long, num_args = 1.., allow_hyphen_values = true)]
        command: Vec<String>,

        /// Where to write the results of each run.
        #[arg(short, long, value_enum, default_value_t = OutputType::Stdout)]
        output: OutputType,

        /// Sets the output file, if output if set to file.
        #[arg(long)]
        output_file: Option<String>,

        /// Root of the sysfs, change it to use a copy of the sensor files.
        #[arg(long, default_value = "/")]
        sysfs_root: PathBuf,

        /// Give up waiting for the sampling thread after this many milliseconds.
        #[arg(long)]
        join_timeout_ms: Option<u64>,
    },
}

#[derive(Clone, ValueEnum, Debug, PartialEq, Eq, Copy)]
pub enum OutputType {
    None,
    Stdout,
    File,
}

impl Display for OutputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        (self as &dyn std::fmt::Debug).fmt(f)
    }
}

#[derive(Clone, ValueEnum, Debug, PartialEq, Eq, Copy)]
pub enum WorkloadType {
    /// Asynchronous sleep, the cheapest possible unit of work.
    Sleep,
    /// Busy loop on a blocking thread.
    Spin,
    /// External process, for instance an inference client.
    Command,
}

impl Display for WorkloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            WorkloadType::Sleep => "sleep",
            WorkloadType::Spin => "spin",
            WorkloadType::Command => "command",
        };
        f.write_str(str)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use jetson_energy::{DeviceProfile, Formula, Rail};

    use super::{Cli, Commands, OutputType, WorkloadType};

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "cli_energy_meter",
            "run",
            "--profile",
            "orin2",
            "--mode",
            "pom_5v_cpu",
            "--formula",
            "current-only",
            "-c",
            "4",
            "--workload",
            "command",
            "--command",
            "curl",
            "-s",
            "localhost:8000",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                profile,
                rail,
                formula,
                period_ms,
                concurrency,
                workload,
                command,
                output,
                ..
            } => {
                assert_eq!(profile, DeviceProfile::Orin2);
                assert_eq!(rail, Rail::Cpu);
                assert_eq!(formula, Formula::CurrentOnly);
                assert_eq!(period_ms, 2);
                assert_eq!(concurrency, 4);
                assert_eq!(workload, WorkloadType::Command);
                assert_eq!(command, vec!["curl", "-s", "localhost:8000"]);
                assert_eq!(output, OutputType::Stdout);
            }
            Commands::Info { .. } => panic!("expected the run command"),
        }
    }

    #[test]
    fn test_reject_bad_values() {
        assert!(Cli::try_parse_from(["cli_energy_meter", "info", "--profile", "bogus"]).is_err());
        assert!(Cli::try_parse_from(["cli_energy_meter", "run", "-p", "nano", "--rail", "DLA"]).is_err());
    }

    #[test]
    fn test_reject_empty_runs() {
        for arg in ["--iterations", "--concurrency", "--runs"] {
            let parsed = Cli::try_parse_from(["cli_energy_meter", "run", "-p", "orin", arg, "0"]);
            assert!(parsed.is_err(), "{arg} 0 was accepted");
        }
        assert!(Cli::try_parse_from(["cli_energy_meter", "run", "-p", "orin", "--runs", "-1"]).is_err());
        assert!(Cli::try_parse_from(["cli_energy_meter", "run", "-p", "orin", "--runs", "1"]).is_ok());
    }
}
