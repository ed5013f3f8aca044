use std::{
    fmt::Display,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    panic::{self, AssertUnwindSafe},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use clap::ValueEnum;
use log::{debug, error, info};

use crate::{
    channel::{ChannelSource, SensorChannel, SysfsSource},
    registry::SensorRegistry,
    DeviceProfile, Rail, SamplerError,
};

/// Energy per mA of current, for the single-channel formula.
/// It bakes in a nominal voltage and the 2ms sampling period of the benchmarks.
pub const SCALE_CONSTANT: f64 = 0.002;

/// How the energy of one tick is computed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Formula {
    /// `SCALE_CONSTANT * current`, reads one channel.
    CurrentOnly,
    /// `period * current * voltage / 1000`, in milliJoules, reads two channels.
    CurrentVoltage,
}

impl Formula {
    /// The energy of one [`Formula::CurrentOnly`] tick, from a current in mA.
    pub fn current_only(current_ma: f64) -> f64 {
        SCALE_CONSTANT * current_ma
    }

    /// The energy of one [`Formula::CurrentVoltage`] tick in mJ, from a current in mA and a voltage in mV.
    pub fn current_voltage(period: Duration, current_ma: f64, voltage_mv: f64) -> f64 {
        period.as_secs_f64() * current_ma * voltage_mv / 1000.0
    }
}

impl Display for Formula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Formula::CurrentOnly => f.write_str("current-only"),
            Formula::CurrentVoltage => f.write_str("current-voltage"),
        }
    }
}

impl FromStr for Formula {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "current" | "current-only" => Ok(Formula::CurrentOnly),
            "power" | "current-voltage" => Ok(Formula::CurrentVoltage),
            _ => Err(s.to_owned()),
        }
    }
}

/// Which rail to sample, and how.
///
/// Parsed from `RAIL` or `RAIL:FORMULA`, for instance `GPU` or `cpu:current-only`.
/// The formula defaults to [`Formula::CurrentVoltage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SamplingMode {
    pub rail: Rail,
    pub formula: Formula,
}

impl SamplingMode {
    pub fn new(rail: Rail, formula: Formula) -> SamplingMode {
        SamplingMode { rail, formula }
    }
}

impl Display for SamplingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.rail, self.formula)
    }
}

impl FromStr for SamplingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rail, formula) = match s.split_once(':') {
            Some((rail, formula)) => (rail, formula.parse()?),
            None => (s, Formula::CurrentVoltage),
        };
        Ok(SamplingMode::new(rail.parse()?, formula))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplerState {
    /// The loop waits for the first measurement.
    Idle,
    Measuring,
    /// The loop waits for the next measurement.
    Stopped,
    /// The loop has been asked to exit, or has died on an error. There is no way back.
    Terminated,
}

/// The channels read on each tick.
enum Probes {
    Current(Box<dyn SensorChannel>),
    CurrentVoltage {
        current: Box<dyn SensorChannel>,
        voltage: Box<dyn SensorChannel>,
    },
}

impl Probes {
    fn new(formula: Formula, channels: Vec<Box<dyn SensorChannel>>) -> Probes {
        // the registry returns the current channel first
        let mut channels = channels.into_iter();
        match (formula, channels.next(), channels.next()) {
            (Formula::CurrentOnly, Some(current), None) => Probes::Current(current),
            (Formula::CurrentVoltage, Some(current), Some(voltage)) => Probes::CurrentVoltage { current, voltage },
            _ => unreachable!("the registry resolves one channel per operand of the formula"),
        }
    }
}

fn read_channel(channel: &mut dyn SensorChannel) -> Result<f64, SamplerError> {
    channel.read().map_err(|e| SamplerError::SampleRead {
        channel: channel.name().to_owned(),
        reason: format!("{e:#}"),
    })
}

fn rewind_channel(channel: &mut dyn SensorChannel) -> Result<(), SamplerError> {
    channel.rewind().map_err(|e| SamplerError::SampleRead {
        channel: channel.name().to_owned(),
        reason: format!("rewind failed: {e:#}"),
    })
}

/// Reads the channels once and computes the energy of the tick.
struct Ticker {
    probes: Probes,
    period: Duration,
}

impl Ticker {
    fn tick(&mut self) -> Result<f64, SamplerError> {
        let increment = match &mut self.probes {
            Probes::Current(current) => {
                let i = read_channel(current.as_mut())?;
                rewind_channel(current.as_mut())?;
                debug!("tick: {i} mA");
                Formula::current_only(i)
            }
            Probes::CurrentVoltage { current, voltage } => {
                let i = read_channel(current.as_mut())?;
                let v = read_channel(voltage.as_mut())?;
                rewind_channel(current.as_mut())?;
                rewind_channel(voltage.as_mut())?;
                debug!("tick: {i} mA, {v} mV");
                Formula::current_voltage(self.period, i, v)
            }
        };
        Ok(increment)
    }
}

/// State shared between the sampler and its background loop.
struct Shared {
    state: Mutex<SamplerState>,
    /// Wakes the loop up when the state changes.
    wakeup: Condvar,
    /// The bits of an `f64`. Only written with the state lock held, read without it.
    total_energy: AtomicU64,
    /// Ticks accumulated since the last reset.
    ticks: AtomicU64,
    /// The error that killed the loop, if any.
    fault: Mutex<Option<SamplerError>>,
}

impl Shared {
    fn new() -> Shared {
        Shared {
            state: Mutex::new(SamplerState::Idle),
            wakeup: Condvar::new(),
            total_energy: AtomicU64::new(0f64.to_bits()),
            ticks: AtomicU64::new(0),
            fault: Mutex::new(None),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SamplerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fault(&self) -> Option<SamplerError> {
        self.fault.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn check_fault(&self) -> Result<(), SamplerError> {
        match self.fault() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Records the error that killed the loop and moves to `Terminated`.
    /// The fault is stored first: whoever sees `Terminated` also sees the fault.
    fn abort(&self, err: SamplerError) {
        *self.fault.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
        *self.lock_state() = SamplerState::Terminated;
        self.wakeup.notify_all();
    }

    fn total_energy(&self) -> f64 {
        f64::from_bits(self.total_energy.load(Ordering::Acquire))
    }

    /// Blocks while there is nothing to measure, returns `Measuring` or `Terminated`.
    fn wait_for_work(&self) -> SamplerState {
        let guard = self.lock_state();
        let guard = self
            .wakeup
            .wait_while(guard, |s| matches!(s, SamplerState::Idle | SamplerState::Stopped))
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }

    /// Adds the energy of a tick, unless the measurement has been stopped in the meantime.
    fn commit(&self, increment: f64) {
        let state = self.lock_state();
        if *state == SamplerState::Measuring {
            let total = self.total_energy() + increment;
            self.total_energy.store(total.to_bits(), Ordering::Release);
            self.ticks.fetch_add(1, Ordering::AcqRel);
        }
    }
}

fn sampling_loop(shared: &Shared, mut ticker: Ticker) {
    let period = ticker.period;
    loop {
        if shared.wait_for_work() == SamplerState::Terminated {
            break;
        }

        let tick_start = Instant::now();
        match ticker.tick() {
            Ok(increment) => shared.commit(increment),
            Err(err) => {
                error!("sampling loop stopped: {err}");
                shared.abort(err);
                break;
            }
        }

        // best effort: a slow tick delays the next one, there is no catch-up
        thread::sleep(period.saturating_sub(tick_start.elapsed()));
    }
    debug!("sampling loop exited");
}

struct Worker {
    handle: JoinHandle<()>,
    /// Disconnected when the loop thread exits.
    exited: Receiver<()>,
}

/// Samples the power of a rail in the background and integrates it into an energy total.
///
/// ## Usage
///
/// ```no_run
/// use std::time::Duration;
/// use jetson_energy::{DeviceProfile, EnergySampler, Formula, Rail, SamplingMode};
///
/// let mode = SamplingMode::new(Rail::Gpu, Formula::CurrentVoltage);
/// let sampler = EnergySampler::new(DeviceProfile::Orin2, Duration::from_millis(2), mode)?;
/// sampler.start()?;
///
/// sampler.start_measuring()?;
/// // ... run the workload ...
/// sampler.stop_measuring()?;
/// println!("{} mJ", sampler.total_energy()?);
///
/// sampler.finish()?;
/// # Ok::<(), jetson_energy::SamplerError>(())
/// ```
///
/// All the methods take `&self`: the total can be read from another thread while the workload runs.
pub struct EnergySampler {
    shared: Arc<Shared>,
    mode: SamplingMode,
    started: AtomicBool,
    /// Moved to the loop thread by `start`.
    ticker: Mutex<Option<Ticker>>,
    worker: Mutex<Option<Worker>>,
}

impl EnergySampler {
    /// Creates a sampler that reads the sysfs of the board.
    pub fn new(profile: DeviceProfile, period: Duration, mode: SamplingMode) -> Result<EnergySampler, SamplerError> {
        EnergySampler::with_source(profile, period, mode, &SysfsSource::new())
    }

    /// Creates a sampler whose channels are opened by `source`.
    pub fn with_source(
        profile: DeviceProfile,
        period: Duration,
        mode: SamplingMode,
        source: &dyn ChannelSource,
    ) -> Result<EnergySampler, SamplerError> {
        if period.is_zero() {
            return Err(SamplerError::InvalidPeriod);
        }
        let registry = SensorRegistry::new(profile);
        let specs = registry.resolve(&mode)?;
        let channels = specs
            .iter()
            .map(|spec| registry.open(spec, source))
            .collect::<Result<Vec<_>, _>>()?;

        info!("energy sampler ready on {profile}, mode {mode}, period {period:?}");
        let ticker = Ticker {
            probes: Probes::new(mode.formula, channels),
            period,
        };
        Ok(EnergySampler {
            shared: Arc::new(Shared::new()),
            mode,
            started: AtomicBool::new(false),
            ticker: Mutex::new(Some(ticker)),
            worker: Mutex::new(None),
        })
    }

    /// Creates a sampler from names, as given on a command line: `("orin2", 2, "GPU")`.
    pub fn from_names(
        profile: &str,
        period_ms: u64,
        mode: &str,
        source: &dyn ChannelSource,
    ) -> Result<EnergySampler, SamplerError> {
        let registry = SensorRegistry::from_name(profile)?;
        let mode = registry.mode(mode)?;
        EnergySampler::with_source(registry.profile(), Duration::from_millis(period_ms), mode, source)
    }

    pub fn mode(&self) -> SamplingMode {
        self.mode
    }

    pub fn state(&self) -> SamplerState {
        *self.shared.lock_state()
    }

    /// Launches the background loop. It stays idle until [`start_measuring`](Self::start_measuring).
    pub fn start(&self) -> Result<(), SamplerError> {
        self.shared.check_fault()?;
        let state = self.state();
        if state == SamplerState::Terminated {
            return Err(SamplerError::Terminated);
        }
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SamplerError::InvalidState {
                operation: "start",
                state,
            })?;

        let (exit_tx, exit_rx) = mpsc::channel::<()>();
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(String::from("energy-sampler"))
            .spawn(move || {
                let _exit = exit_tx; // dropped when the loop returns or panics
                if panic::catch_unwind(AssertUnwindSafe(|| sampling_loop(&shared, ticker))).is_err() {
                    error!("sampling loop panicked");
                    shared.abort(SamplerError::Panicked);
                }
            })
            .map_err(|e| SamplerError::Spawn(e.to_string()))?;

        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(Worker {
            handle,
            exited: exit_rx,
        });
        self.started.store(true, Ordering::Release);
        info!("sampling loop started");
        Ok(())
    }

    /// Resets the total to zero and starts accumulating.
    ///
    /// A tick that is in progress when this is called counts for the new measurement.
    pub fn start_measuring(&self) -> Result<(), SamplerError> {
        self.shared.check_fault()?;
        let mut state = self.shared.lock_state();
        if *state == SamplerState::Terminated {
            return Err(SamplerError::Terminated);
        }
        if !self.started.load(Ordering::Acquire) {
            return Err(SamplerError::InvalidState {
                operation: "start measuring",
                state: *state,
            });
        }
        self.shared.total_energy.store(0f64.to_bits(), Ordering::Release);
        self.shared.ticks.store(0, Ordering::Release);
        *state = SamplerState::Measuring;
        self.shared.wakeup.notify_all();
        debug!("measuring");
        Ok(())
    }

    /// Stops accumulating. The total does not change after this returns.
    pub fn stop_measuring(&self) -> Result<(), SamplerError> {
        self.shared.check_fault()?;
        let mut state = self.shared.lock_state();
        match *state {
            SamplerState::Measuring => {
                *state = SamplerState::Stopped;
                debug!("measurement stopped");
                Ok(())
            }
            SamplerState::Stopped => Ok(()),
            SamplerState::Idle => Err(SamplerError::InvalidState {
                operation: "stop measuring",
                state: SamplerState::Idle,
            }),
            SamplerState::Terminated => Err(SamplerError::Terminated),
        }
    }

    /// The energy accumulated since the last call to [`start_measuring`](Self::start_measuring).
    ///
    /// Fails if the sampling loop has died: its total would be wrong.
    pub fn total_energy(&self) -> Result<f64, SamplerError> {
        self.shared.check_fault()?;
        Ok(self.shared.total_energy())
    }

    /// The number of ticks accumulated since the last call to [`start_measuring`](Self::start_measuring).
    pub fn ticks(&self) -> u64 {
        self.shared.ticks.load(Ordering::Acquire)
    }

    /// Stops the loop and waits for it to exit.
    pub fn finish(&self) -> Result<(), SamplerError> {
        self.terminate(None)
    }

    /// Like [`finish`](Self::finish), but gives up waiting after `timeout`.
    pub fn finish_timeout(&self, timeout: Duration) -> Result<(), SamplerError> {
        self.terminate(Some(timeout))
    }

    fn terminate(&self, timeout: Option<Duration>) -> Result<(), SamplerError> {
        let already_terminated = {
            let mut state = self.shared.lock_state();
            let previous = std::mem::replace(&mut *state, SamplerState::Terminated);
            self.shared.wakeup.notify_all();
            previous == SamplerState::Terminated
        };
        // a loop that was never started still owns the channels
        drop(self.ticker.lock().unwrap_or_else(PoisonError::into_inner).take());

        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if already_terminated && worker.is_none() {
            // finished before, or the loop died and has been joined already
            self.shared.check_fault()?;
            return Err(SamplerError::Terminated);
        }
        if let Some(Worker { handle, exited }) = worker {
            if let Some(timeout) = timeout {
                match exited.recv_timeout(timeout) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => (),
                    Err(RecvTimeoutError::Timeout) => return Err(SamplerError::JoinTimeout(timeout)),
                }
            }
            handle.join().map_err(|_| SamplerError::Panicked)?;
            info!("sampling loop finished");
        }
        self.shared.check_fault()
    }
}

impl Drop for EnergySampler {
    fn drop(&mut self) {
        // ignore the result: finish may already have been called
        let _ = self.terminate(None);
    }
}
