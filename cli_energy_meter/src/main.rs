use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use jetson_energy::{ChannelSource, DeviceProfile, EnergySampler, SamplingMode, SensorRegistry, SysfsSource};
use log::{info, warn};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use cli::{Cli, Commands, OutputType};
use run::RunConfig;
use workload::Workload;

mod cli;
mod run;
mod workload;

const WRITER_BUFFER_CAPACITY: usize = 8192;

#[tokio::main(worker_threads = 4)]
async fn main() -> Result<(), anyhow::Error> {
    // initialize logger
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    // parse CLI arguments
    let cli = Cli::parse();

    // run the command
    match cli.command {
        Commands::Info { profile, sysfs_root } => {
            print_channels(profile, &sysfs_root);
        }
        Commands::Run {
            profile,
            rail,
            formula,
            period_ms,
            iterations,
            concurrency,
            runs,
            workload,
            work_ms,
            command,
            output,
            output_file,
            sysfs_root,
            join_timeout_ms,
        } => {
            let workload = Workload::new(workload, Duration::from_millis(work_ms), &command)?;
            let config = RunConfig {
                runs: runs.try_into()?,
                iterations: iterations.try_into()?,
                concurrency: concurrency.try_into()?,
                workload,
            };

            // create the sampler first: an unsupported board or a missing sensor stops everything
            let mode = SamplingMode::new(rail, formula);
            let source = SysfsSource::with_root(&sysfs_root);
            let sampler = EnergySampler::with_source(profile, Duration::from_millis(period_ms), mode, &source)
                .context("failed to create the energy sampler")?;
            sampler.start()?;

            // prepare the output, if any
            let mut writer: Box<dyn Write + Send> = match output {
                OutputType::None => Box::new(std::io::sink()),
                OutputType::Stdout => Box::new(BufWriter::with_capacity(WRITER_BUFFER_CAPACITY, std::io::stdout())),
                OutputType::File => {
                    let filename = if let Some(f) = output_file {
                        f
                    } else {
                        // create the csv file
                        let now = OffsetDateTime::now_utc().format(&Rfc3339)?;
                        format!("energy-{now}.csv")
                    };
                    let file = File::create(&filename).with_context(|| format!("create {filename}"))?;
                    info!("writing results to {filename}");
                    Box::new(BufWriter::with_capacity(WRITER_BUFFER_CAPACITY, file))
                }
            };

            let result = run::run(&mut writer, &sampler, &config).await;

            // always stop the sampling thread, even if the run failed
            let finished = match join_timeout_ms {
                Some(ms) => sampler.finish_timeout(Duration::from_millis(ms)),
                None => sampler.finish(),
            };
            result?;
            finished?;
        }
    }

    Ok(())
}

fn print_channels(profile: DeviceProfile, sysfs_root: &Path) {
    let registry = SensorRegistry::new(profile);
    let source = SysfsSource::with_root(sysfs_root);

    println!("\nRails of {profile}: {}", mkstring(&registry.rails().collect::<Vec<_>>(), ", "));
    println!("\nSensor channels:");
    for spec in registry.channel_specs() {
        match source.open(&spec) {
            Ok(_) => println!("- {spec}"),
            Err(e) => {
                println!("- {spec} \t(unavailable)");
                warn!("{}: {e:#}", spec.name);
            }
        }
    }
}

/// Takes a slice of elements that can be converted to strings, converts them and joins them all.
fn mkstring<A: ToString>(elems: &[A], sep: &str) -> String {
    elems.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(sep)
}
