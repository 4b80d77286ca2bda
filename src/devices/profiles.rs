use serde::{Deserialize, Serialize};

use super::register::RegisterSpec;
use crate::utils::error::DecodeError;

pub const KM_N1_FLK_V1: &str = "km-n1-flk-v1";
pub const KM_N1_FLK_V2: &str = "km-n1-flk-v2";

/// Register map for one meter model / firmware revision.
///
/// Register maps observed in the field disagree on power address and scale,
/// so each one is kept as its own named profile rather than patched in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    pub voltage: RegisterSpec,
    pub current: RegisterSpec,
    pub active_power: RegisterSpec,
    pub energy: RegisterSpec,
}

impl DeviceProfile {
    /// V in volts, I in amperes, P in kilowatts, E in kilowatt-hours.
    pub fn km_n1_flk_v2() -> Self {
        Self {
            name: KM_N1_FLK_V2.to_string(),
            voltage: RegisterSpec::unsigned(0x0000, 0.1),
            current: RegisterSpec::unsigned(0x0006, 0.001),
            active_power: RegisterSpec::signed(0x000C, 0.001),
            energy: RegisterSpec::unsigned(0x0200, 0.001),
        }
    }

    /// Earlier map: unsigned power at 0x0010 in 0.1 W steps.
    pub fn km_n1_flk_v1() -> Self {
        Self {
            name: KM_N1_FLK_V1.to_string(),
            voltage: RegisterSpec::unsigned(0x0000, 0.1),
            current: RegisterSpec::unsigned(0x0006, 0.001),
            active_power: RegisterSpec::unsigned(0x0010, 0.0001),
            energy: RegisterSpec::unsigned(0x0200, 0.001),
        }
    }

    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            KM_N1_FLK_V2 => Some(Self::km_n1_flk_v2()),
            KM_N1_FLK_V1 => Some(Self::km_n1_flk_v1()),
            _ => None,
        }
    }

    pub fn builtin_names() -> &'static [&'static str] {
        &[KM_N1_FLK_V2, KM_N1_FLK_V1]
    }

    /// Fields in read order.
    pub fn fields(&self) -> [(&'static str, &RegisterSpec); 4] {
        [
            ("voltage", &self.voltage),
            ("current", &self.current),
            ("active_power", &self.active_power),
            ("energy", &self.energy),
        ]
    }

    pub fn validate(&self) -> Result<(), DecodeError> {
        for (_, spec) in self.fields() {
            spec.validate()?;
        }
        Ok(())
    }
}
