pub mod power_meter;
pub mod profiles;
pub mod register;

pub use power_meter::{MeterClient, PowerMeter};
pub use profiles::DeviceProfile;
pub use register::{RegisterSpec, WordOrder};
