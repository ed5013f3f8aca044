// The INA3221 drivers expose each measurement as a small text file in sysfs,
// like the powercap `energy_uj` files: open it once, then read + rewind on every tick.

use std::{
    collections::HashMap,
    fs::File,
    io::{Read, Seek},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, Context};

use crate::{registry::ChannelSpec, ChannelKind, Rail};

/// A re-readable numeric sensor source.
///
/// Reading consumes the value at the current position of the source.
/// To get a fresh value, the channel must be rewound before the next read,
/// exactly like a sysfs attribute that has been read to its end.
pub trait SensorChannel: Send {
    /// The name of the channel, for instance `GPU:current`.
    fn name(&self) -> &str;

    /// Reads the value of the channel, in mA (current) or mV (voltage).
    fn read(&mut self) -> anyhow::Result<f64>;

    /// Repositions the source so that the next [`read`](SensorChannel::read) returns a fresh value.
    fn rewind(&mut self) -> anyhow::Result<()>;
}

/// Opens the channels described by the registry.
pub trait ChannelSource {
    fn open(&self, spec: &ChannelSpec) -> anyhow::Result<Box<dyn SensorChannel>>;
}

/// Opens channels as files of the sysfs.
#[derive(Debug, Clone)]
pub struct SysfsSource {
    /// Prepended to every locator, `/` on a real board.
    root: PathBuf,
}

impl SysfsSource {
    pub fn new() -> SysfsSource {
        SysfsSource::with_root("/")
    }

    /// Uses another directory as the root of the sysfs, for instance a fake tree in tests.
    pub fn with_root(root: impl AsRef<Path>) -> SysfsSource {
        SysfsSource {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn path_of(&self, spec: &ChannelSpec) -> PathBuf {
        self.root.join(spec.locator.trim_start_matches('/'))
    }
}

impl Default for SysfsSource {
    fn default() -> Self {
        SysfsSource::new()
    }
}

impl ChannelSource for SysfsSource {
    fn open(&self, spec: &ChannelSpec) -> anyhow::Result<Box<dyn SensorChannel>> {
        let path = self.path_of(spec);
        let channel = SysfsChannel::open(&spec.name, &path)?;
        Ok(Box::new(channel))
    }
}

/// A channel backed by a persistent handle on a sysfs file.
pub struct SysfsChannel {
    name: String,
    file: File,
    /// Reused on every read, the content is never longer than a few bytes.
    buf: Vec<u8>,
}

impl SysfsChannel {
    pub fn open(name: &str, path: &Path) -> anyhow::Result<SysfsChannel> {
        let file = File::open(path).with_context(|| format!("open {}", path.to_string_lossy()))?;
        Ok(SysfsChannel {
            name: name.to_owned(),
            file,
            buf: Vec::with_capacity(16),
        })
    }
}

impl SensorChannel for SysfsChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self) -> anyhow::Result<f64> {
        self.buf.clear();
        self.file.read_to_end(&mut self.buf)?;

        let content = std::str::from_utf8(&self.buf)?;
        let value: f64 = content
            .trim()
            .parse()
            .with_context(|| format!("failed to parse {}: '{content}'", self.name))?;
        Ok(value)
    }

    fn rewind(&mut self) -> anyhow::Result<()> {
        self.file.rewind()?;
        Ok(())
    }
}

type Generator = Box<dyn FnMut() -> anyhow::Result<f64> + Send>;

/// An in-memory channel that produces its values from a generator.
///
/// It behaves like a sysfs file: a second read without a rewind fails.
pub struct SequenceChannel {
    name: String,
    generator: Generator,
    /// `false` once the value has been read, until the next rewind
    positioned: bool,
    reads: Arc<AtomicUsize>,
}

impl SequenceChannel {
    pub fn from_fn<F>(generator: F) -> SequenceChannel
    where
        F: FnMut() -> anyhow::Result<f64> + Send + 'static,
    {
        SequenceChannel {
            name: String::from("simulated"),
            generator: Box::new(generator),
            positioned: true,
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Always returns the same value.
    pub fn constant(value: f64) -> SequenceChannel {
        SequenceChannel::from_fn(move || Ok(value))
    }

    /// Returns the values one after the other, then starts again from the first one.
    pub fn cycle(values: Vec<f64>) -> SequenceChannel {
        assert!(!values.is_empty(), "cannot cycle over an empty sequence");
        let mut i = 0;
        SequenceChannel::from_fn(move || {
            let v = values[i % values.len()];
            i += 1;
            Ok(v)
        })
    }

    /// Returns `value` for `n` reads, then fails.
    pub fn failing_after(n: usize, value: f64) -> SequenceChannel {
        let mut remaining = n;
        SequenceChannel::from_fn(move || {
            if remaining == 0 {
                Err(anyhow!("sensor went away"))
            } else {
                remaining -= 1;
                Ok(value)
            }
        })
    }

    pub fn with_name(mut self, name: &str) -> SequenceChannel {
        self.name = name.to_owned();
        self
    }

    /// Shared counter of the successful reads, still usable after the channel has been moved.
    pub fn read_counter(&self) -> Arc<AtomicUsize> {
        self.reads.clone()
    }
}

impl SensorChannel for SequenceChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self) -> anyhow::Result<f64> {
        if !self.positioned {
            return Err(anyhow!("{}: nothing left to read, rewind first", self.name));
        }
        let value = (self.generator)()?;
        self.positioned = false;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    fn rewind(&mut self) -> anyhow::Result<()> {
        self.positioned = true;
        Ok(())
    }
}

/// Serves [`SequenceChannel`]s instead of real sensors.
///
/// Each channel can be opened once, the sampler owns it afterwards.
#[derive(Default)]
pub struct SimulatedSource {
    channels: Mutex<HashMap<String, SequenceChannel>>,
}

impl SimulatedSource {
    pub fn new() -> SimulatedSource {
        SimulatedSource::default()
    }

    pub fn with(self, rail: Rail, kind: ChannelKind, channel: SequenceChannel) -> SimulatedSource {
        let name = ChannelSpec::channel_name(rail, kind);
        // the lock cannot be poisoned, nobody else has access to it yet
        if let Ok(mut channels) = self.channels.lock() {
            channels.insert(name, channel);
        }
        self
    }

    /// The number of channels that have not been opened yet.
    pub fn remaining(&self) -> usize {
        self.channels.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl ChannelSource for SimulatedSource {
    fn open(&self, spec: &ChannelSpec) -> anyhow::Result<Box<dyn SensorChannel>> {
        let mut channels = self.channels.lock().map_err(|_| anyhow!("poisoned lock"))?;
        let channel = channels
            .remove(&spec.name)
            .with_context(|| format!("no simulated channel {}", spec.name))?;
        Ok(Box::new(channel.with_name(&spec.name)))
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, io::Write, sync::atomic::Ordering};

    use super::{SensorChannel, SequenceChannel, SysfsChannel};

    #[test]
    fn test_sysfs_read_and_rewind() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("curr1_input");
        fs::write(&path, "512\n")?;

        let mut channel = SysfsChannel::open("GPU:current", &path)?;
        assert_eq!(channel.read()?, 512.0);

        // the value changes, a rewind is required to see it
        let mut f = fs::File::create(&path)?;
        writeln!(f, "1024")?;
        drop(f);
        channel.rewind()?;
        assert_eq!(channel.read()?, 1024.0);

        // without rewind, we are at the end of the file
        assert!(channel.read().is_err());
        Ok(())
    }

    #[test]
    fn test_sysfs_not_a_number() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("in1_input");
        fs::write(&path, "n/a\n")?;

        let mut channel = SysfsChannel::open("GPU:voltage", &path)?;
        let err = channel.read().unwrap_err();
        assert!(format!("{err:#}").contains("GPU:voltage"), "{err:#}");
        Ok(())
    }

    #[test]
    fn test_sysfs_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SysfsChannel::open("CPU:current", &dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_sequence_requires_rewind() -> anyhow::Result<()> {
        let mut channel = SequenceChannel::cycle(vec![1.0, 2.0]);
        let reads = channel.read_counter();
        assert_eq!(channel.read()?, 1.0);
        assert!(channel.read().is_err());
        channel.rewind()?;
        assert_eq!(channel.read()?, 2.0);
        channel.rewind()?;
        assert_eq!(channel.read()?, 1.0);
        assert_eq!(reads.load(Ordering::Relaxed), 3);
        Ok(())
    }

    #[test]
    fn test_sequence_failing_after() -> anyhow::Result<()> {
        let mut channel = SequenceChannel::failing_after(1, 7.0);
        assert_eq!(channel.read()?, 7.0);
        channel.rewind()?;
        assert!(channel.read().is_err());
        Ok(())
    }
}
