// Sensor layout of the Jetson boards.
// Each board carries one or two INA3221 monitors with three rails each.
// See the "Software Power Monitoring" section of the Jetson developer guide.

use std::fmt::Display;

use enum_map::{enum_map, EnumMap};
use log::debug;

use crate::{
    channel::{ChannelSource, SensorChannel},
    sampler::{Formula, SamplingMode},
    ChannelKind, DeviceProfile, Rail, SamplerError,
};

const INA3221_HWMON_PATH: &str = "/sys/bus/i2c/drivers/ina3221";
const INA3221X_IIO_PATH: &str = "/sys/bus/i2c/drivers/ina3221x";

/// How a driver exposes the channels of a monitor.
#[derive(Debug, Clone, Copy)]
enum Layout {
    /// `ina3221` hwmon driver: `currN_input` (mA) and `inN_input` (mV), N starts at 1
    Hwmon,
    /// `ina3221x` iio driver: `in_currentN_input` and `in_voltageN_input`, N starts at 0
    Iio,
}

/// Where to find one rail: the device directory (relative to the driver) and the index of the channel.
#[derive(Debug, Clone, Copy)]
struct RailLocation {
    device: &'static str,
    index: u8,
}

const fn at(device: &'static str, index: u8) -> Option<RailLocation> {
    Some(RailLocation { device, index })
}

fn layout_of(profile: DeviceProfile) -> Layout {
    match profile {
        DeviceProfile::Nano => Layout::Iio,
        DeviceProfile::Orin | DeviceProfile::Orin2 | DeviceProfile::Xavier => Layout::Hwmon,
    }
}

fn rails_of(profile: DeviceProfile) -> EnumMap<Rail, Option<RailLocation>> {
    match profile {
        DeviceProfile::Orin => enum_map! {
            Rail::Gpu => at("1-0040/hwmon/hwmon0", 1),
            Rail::Cpu => at("1-0040/hwmon/hwmon0", 2),
            Rail::Soc => at("1-0040/hwmon/hwmon0", 3),
            Rail::Cv => at("1-0041/hwmon/hwmon1", 1),
            Rail::Vddrq => at("1-0041/hwmon/hwmon1", 2),
            Rail::Sys5v => at("1-0041/hwmon/hwmon1", 3),
            Rail::In => None,
        },
        DeviceProfile::Orin2 => enum_map! {
            Rail::Gpu => at("1-0040/hwmon/hwmon1", 1),
            Rail::Cpu => at("1-0040/hwmon/hwmon1", 2),
            Rail::Soc => at("1-0040/hwmon/hwmon1", 3),
            Rail::Cv => at("1-0041/hwmon/hwmon2", 1),
            Rail::Vddrq => at("1-0041/hwmon/hwmon2", 2),
            Rail::Sys5v => at("1-0041/hwmon/hwmon2", 3),
            Rail::In => None,
        },
        DeviceProfile::Xavier => enum_map! {
            Rail::Gpu => at("1-0040/hwmon/hwmon3", 1),
            Rail::Cpu => at("1-0040/hwmon/hwmon3", 2),
            Rail::Soc => at("1-0040/hwmon/hwmon3", 3),
            Rail::Cv => at("1-0041/hwmon/hwmon4", 1),
            Rail::Vddrq => at("1-0041/hwmon/hwmon4", 2),
            Rail::Sys5v => at("1-0041/hwmon/hwmon4", 3),
            Rail::In => None,
        },
        DeviceProfile::Nano => enum_map! {
            Rail::In => at("6-0040/iio:device0", 0),
            Rail::Gpu => at("6-0040/iio:device0", 1),
            Rail::Cpu => at("6-0040/iio:device0", 2),
            _ => None,
        },
    }
}

fn locator(layout: Layout, loc: RailLocation, kind: ChannelKind) -> String {
    let RailLocation { device, index } = loc;
    match (layout, kind) {
        (Layout::Hwmon, ChannelKind::Current) => format!("{INA3221_HWMON_PATH}/{device}/curr{index}_input"),
        (Layout::Hwmon, ChannelKind::Voltage) => format!("{INA3221_HWMON_PATH}/{device}/in{index}_input"),
        (Layout::Iio, ChannelKind::Current) => format!("{INA3221X_IIO_PATH}/{device}/in_current{index}_input"),
        (Layout::Iio, ChannelKind::Voltage) => format!("{INA3221X_IIO_PATH}/{device}/in_voltage{index}_input"),
    }
}

/// The static description of a sensor channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    /// The name of the channel, for instance `GPU:current`
    pub name: String,
    pub rail: Rail,
    pub kind: ChannelKind,
    /// Absolute sysfs path of the channel, for instance
    /// `/sys/bus/i2c/drivers/ina3221/1-0040/hwmon/hwmon1/curr1_input`.
    pub locator: String,
}

impl ChannelSpec {
    pub fn channel_name(rail: Rail, kind: ChannelKind) -> String {
        format!("{rail}:{kind}")
    }
}

impl Display for ChannelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} \t: {}", self.name, self.locator)
    }
}

/// The sensor channels of a device profile.
#[derive(Debug, Clone)]
pub struct SensorRegistry {
    profile: DeviceProfile,
    layout: Layout,
    rails: EnumMap<Rail, Option<RailLocation>>,
}

impl SensorRegistry {
    pub fn new(profile: DeviceProfile) -> SensorRegistry {
        SensorRegistry {
            profile,
            layout: layout_of(profile),
            rails: rails_of(profile),
        }
    }

    /// Looks up a profile by its name, fails with [`SamplerError::UnsupportedDevice`] if it is unknown.
    pub fn from_name(profile: &str) -> Result<SensorRegistry, SamplerError> {
        Ok(SensorRegistry::new(profile.parse()?))
    }

    pub fn profile(&self) -> DeviceProfile {
        self.profile
    }

    /// The rails that the profile provides.
    pub fn rails(&self) -> impl Iterator<Item = Rail> + '_ {
        self.rails.iter().filter_map(|(rail, loc)| loc.map(|_| rail))
    }

    pub fn has_rail(&self, rail: Rail) -> bool {
        self.rails[rail].is_some()
    }

    fn spec(&self, rail: Rail, kind: ChannelKind) -> Option<ChannelSpec> {
        self.rails[rail].map(|loc| ChannelSpec {
            name: ChannelSpec::channel_name(rail, kind),
            rail,
            kind,
            locator: locator(self.layout, loc, kind),
        })
    }

    /// Lists all the channels of the profile, current and voltage of each rail.
    pub fn channel_specs(&self) -> Vec<ChannelSpec> {
        self.rails()
            .flat_map(|rail| [ChannelKind::Current, ChannelKind::Voltage].map(|kind| self.spec(rail, kind)))
            .flatten()
            .collect()
    }

    /// Parses a mode, like `GPU` or `cpu:current-only`, and checks that the profile supports it.
    pub fn mode(&self, mode: &str) -> Result<SamplingMode, SamplerError> {
        let unsupported = || SamplerError::UnsupportedMode {
            profile: self.profile,
            mode: mode.to_owned(),
        };
        let parsed: SamplingMode = mode.parse().map_err(|_| unsupported())?;
        self.resolve(&parsed).map_err(|_| unsupported())?;
        Ok(parsed)
    }

    /// Returns the channels that the mode needs: the current channel of the rail first,
    /// then its voltage channel if the formula uses it.
    pub fn resolve(&self, mode: &SamplingMode) -> Result<Vec<ChannelSpec>, SamplerError> {
        let unsupported = || SamplerError::UnsupportedMode {
            profile: self.profile,
            mode: mode.to_string(),
        };
        let current = self.spec(mode.rail, ChannelKind::Current).ok_or_else(unsupported)?;
        match mode.formula {
            Formula::CurrentOnly => Ok(vec![current]),
            Formula::CurrentVoltage => {
                let voltage = self.spec(mode.rail, ChannelKind::Voltage).ok_or_else(unsupported)?;
                Ok(vec![current, voltage])
            }
        }
    }

    /// Opens a channel. A failure here is fatal, there is no retry.
    pub fn open(&self, spec: &ChannelSpec, source: &dyn ChannelSource) -> Result<Box<dyn SensorChannel>, SamplerError> {
        debug!("opening channel {spec}");
        source.open(spec).map_err(|e| SamplerError::ChannelUnavailable {
            channel: spec.name.clone(),
            locator: spec.locator.clone(),
            reason: format!("{e:#}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::SensorRegistry;
    use crate::{
        sampler::{Formula, SamplingMode},
        ChannelKind, DeviceProfile, Rail, SamplerError,
    };

    #[test]
    fn test_orin2_gpu_channels() -> anyhow::Result<()> {
        let registry = SensorRegistry::new(DeviceProfile::Orin2);
        let specs = registry.resolve(&SamplingMode::new(Rail::Gpu, Formula::CurrentVoltage))?;
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "GPU:current");
        assert_eq!(
            specs[0].locator,
            "/sys/bus/i2c/drivers/ina3221/1-0040/hwmon/hwmon1/curr1_input"
        );
        assert_eq!(specs[1].kind, ChannelKind::Voltage);
        assert_eq!(specs[1].locator, "/sys/bus/i2c/drivers/ina3221/1-0040/hwmon/hwmon1/in1_input");
        Ok(())
    }

    #[test]
    fn test_nano_layout() -> anyhow::Result<()> {
        let registry = SensorRegistry::new(DeviceProfile::Nano);
        let rails: Vec<Rail> = registry.rails().collect();
        assert_eq!(rails, vec![Rail::Gpu, Rail::Cpu, Rail::In]);
        assert_eq!(registry.channel_specs().len(), 6);

        let specs = registry.resolve(&SamplingMode::new(Rail::Cpu, Formula::CurrentOnly))?;
        assert_eq!(
            specs[0].locator,
            "/sys/bus/i2c/drivers/ina3221x/6-0040/iio:device0/in_current2_input"
        );
        Ok(())
    }

    #[test]
    fn test_every_profile_has_gpu_and_cpu() {
        for profile in DeviceProfile::ALL {
            let registry = SensorRegistry::new(profile);
            assert!(registry.has_rail(Rail::Gpu), "{profile}");
            assert!(registry.has_rail(Rail::Cpu), "{profile}");
        }
    }

    #[test]
    fn test_unsupported_mode() {
        let registry = SensorRegistry::new(DeviceProfile::Nano);
        assert_eq!(
            registry.mode("SOC"),
            Err(SamplerError::UnsupportedMode {
                profile: DeviceProfile::Nano,
                mode: String::from("SOC")
            })
        );
        assert!(matches!(registry.mode("teapot"), Err(SamplerError::UnsupportedMode { .. })));
        assert_eq!(
            registry.mode("POM_5V_GPU"),
            Ok(SamplingMode::new(Rail::Gpu, Formula::CurrentVoltage))
        );
    }

    #[test]
    fn test_unknown_profile() {
        assert!(matches!(
            SensorRegistry::from_name("bogus"),
            Err(SamplerError::UnsupportedDevice(_))
        ));
    }
}
