use std::{fmt::Display, str::FromStr};

use clap::ValueEnum;
use enum_map::Enum;

pub mod channel;
pub mod error;
pub mod registry;
pub mod sampler;

pub use channel::{ChannelSource, SensorChannel, SequenceChannel, SimulatedSource, SysfsSource};
pub use error::SamplerError;
pub use registry::{ChannelSpec, SensorRegistry};
pub use sampler::{EnergySampler, Formula, SamplerState, SamplingMode, SCALE_CONSTANT};

/// A Jetson board, which determines the layout of its INA3221 power monitors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum)]
pub enum DeviceProfile {
    /// AGX Orin, monitors exposed as hwmon0/hwmon1
    Orin,
    /// AGX Orin with a different hwmon numbering (hwmon1/hwmon2)
    Orin2,
    /// Jetson Nano, iio driver `ina3221x`
    Nano,
    /// AGX Xavier
    Xavier,
}

impl DeviceProfile {
    pub const ALL: [DeviceProfile; 4] = [
        DeviceProfile::Orin,
        DeviceProfile::Orin2,
        DeviceProfile::Nano,
        DeviceProfile::Xavier,
    ];
}

impl Display for DeviceProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            DeviceProfile::Orin => "orin",
            DeviceProfile::Orin2 => "orin2",
            DeviceProfile::Nano => "nano",
            DeviceProfile::Xavier => "xavier",
        };
        f.write_str(str)
    }
}

impl FromStr for DeviceProfile {
    type Err = SamplerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "orin" => Ok(DeviceProfile::Orin),
            "orin2" => Ok(DeviceProfile::Orin2),
            "nano" => Ok(DeviceProfile::Nano),
            "xavier" => Ok(DeviceProfile::Xavier),
            _ => Err(SamplerError::UnsupportedDevice(s.to_owned())),
        }
    }
}

/// A power rail of the board. Each rail has a current and a voltage channel.
#[derive(Enum, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Rail {
    /// GPU
    Gpu,
    /// CPU
    Cpu,
    /// SoC - GPU - CPU (rest of the SoC components)
    Soc,
    /// Computer vision modules + deep learning accelerators
    Cv,
    /// Memory
    Vddrq,
    /// Other components of the board (eMMC, video, audio, etc)
    Sys5v,
    /// Whole board input
    In,
}

impl Rail {
    pub const ALL: [Rail; 7] = [
        Rail::Gpu,
        Rail::Cpu,
        Rail::Soc,
        Rail::Cv,
        Rail::Vddrq,
        Rail::Sys5v,
        Rail::In,
    ];
}

impl Display for Rail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            Rail::Gpu => "GPU",
            Rail::Cpu => "CPU",
            Rail::Soc => "SOC",
            Rail::Cv => "CV",
            Rail::Vddrq => "VDDRQ",
            Rail::Sys5v => "SYS5V",
            Rail::In => "IN",
        };
        f.write_str(str)
    }
}

impl FromStr for Rail {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // the nano names its rails after the power domains, accept both
        match s.to_ascii_uppercase().as_str() {
            "GPU" | "POM_5V_GPU" => Ok(Rail::Gpu),
            "CPU" | "POM_5V_CPU" => Ok(Rail::Cpu),
            "SOC" => Ok(Rail::Soc),
            "CV" => Ok(Rail::Cv),
            "VDDRQ" => Ok(Rail::Vddrq),
            "SYS5V" => Ok(Rail::Sys5v),
            "IN" | "POM_5V_IN" => Ok(Rail::In),
            _ => Err(s.to_owned()),
        }
    }
}

/// What a channel measures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// milliAmperes
    Current,
    /// milliVolts
    Voltage,
}

impl Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Current => f.write_str("current"),
            ChannelKind::Voltage => f.write_str("voltage"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{DeviceProfile, Rail, SamplerError};

    #[test]
    fn test_parse_profile() -> anyhow::Result<()> {
        assert_eq!("orin".parse::<DeviceProfile>()?, DeviceProfile::Orin);
        assert_eq!("Orin2".parse::<DeviceProfile>()?, DeviceProfile::Orin2);
        assert_eq!("NANO".parse::<DeviceProfile>()?, DeviceProfile::Nano);
        for p in DeviceProfile::ALL {
            assert_eq!(p.to_string().parse::<DeviceProfile>()?, p);
        }

        match "bogus".parse::<DeviceProfile>() {
            Err(SamplerError::UnsupportedDevice(name)) => assert_eq!(name, "bogus"),
            other => panic!("unexpected result {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_parse_rail() {
        assert_eq!("gpu".parse::<Rail>(), Ok(Rail::Gpu));
        assert_eq!("POM_5V_CPU".parse::<Rail>(), Ok(Rail::Cpu));
        assert_eq!("pom_5v_in".parse::<Rail>(), Ok(Rail::In));
        for r in Rail::ALL {
            assert_eq!(r.to_string().parse::<Rail>(), Ok(r));
        }
        assert_eq!("DLA".parse::<Rail>(), Err(String::from("DLA")));
    }
}
