use chrono::NaiveDateTime;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use super::profiles::DeviceProfile;
use super::register::RegisterSpec;
use crate::modbus::client::ModbusClientTrait;
use crate::storage::models::{truncate_to_second, Reading};
use crate::utils::error::{ModbusError, ReadError, ReadFailure};

/// Operation command register of the KM-N1 family.
pub const OPERATION_COMMAND_REGISTER: u16 = 0xFFFF;
/// Operation command that clears the integrated kWh counter.
pub const CLEAR_ENERGY_COMMAND: u16 = 0x0300;

/// Per-device configuration record consumed by [`MeterClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct PowerMeter {
    pub device_id: String,
    pub address: u8,
    pub profile: DeviceProfile,
    /// Reversed CT wiring: report |current| and |power|.
    pub normalize_polarity: bool,
}

#[derive(Debug, Clone)]
pub struct RawField {
    pub name: &'static str,
    pub spec: RegisterSpec,
    pub words: Vec<u16>,
}

/// Issues the register reads for one meter and assembles a [`Reading`].
/// Stateless apart from the shared transport handle.
#[derive(Clone)]
pub struct MeterClient {
    transport: Arc<dyn ModbusClientTrait>,
}

impl MeterClient {
    pub fn new(transport: Arc<dyn ModbusClientTrait>) -> Self {
        Self { transport }
    }

    async fn read_field(
        &self,
        meter: &PowerMeter,
        name: &'static str,
        spec: &RegisterSpec,
    ) -> Result<Vec<u16>, ReadError> {
        self.transport
            .read_holding_registers(meter.address, spec.address, spec.count)
            .await
            .map_err(|e| read_error(meter, name, e.into()))
    }

    /// All-or-nothing: the first failing field aborts the whole read.
    pub async fn read(&self, meter: &PowerMeter, captured_at: NaiveDateTime) -> Result<Reading, ReadError> {
        let mut values = [0.0f64; 4];
        for (slot, (name, spec)) in values.iter_mut().zip(meter.profile.fields()) {
            let words = self.read_field(meter, name, spec).await?;
            *slot = spec
                .decode(&words)
                .map_err(|e| read_error(meter, name, e.into()))?;
        }
        let [voltage, mut current, mut active_power, accumulated_energy] = values;

        if meter.normalize_polarity {
            current = current.abs();
            active_power = active_power.abs();
        }

        debug!(
            "📊 {} | {:.1}V | {:.3}A | {:.4}kW | {:.3}kWh",
            meter.device_id, voltage, current, active_power, accumulated_energy
        );

        Ok(Reading {
            device_id: meter.device_id.clone(),
            timestamp: truncate_to_second(captured_at),
            voltage,
            current,
            active_power,
            accumulated_energy,
        })
    }

    /// Undecoded words per field, for diagnosing a register map.
    pub async fn read_raw(&self, meter: &PowerMeter) -> Result<Vec<RawField>, ReadError> {
        let mut fields = Vec::with_capacity(4);
        for (name, spec) in meter.profile.fields() {
            let words = self.read_field(meter, name, spec).await?;
            fields.push(RawField {
                name,
                spec: spec.clone(),
                words,
            });
        }
        Ok(fields)
    }

    /// Zeroes the meter's accumulated energy counter.
    pub async fn reset_energy(&self, meter: &PowerMeter) -> Result<(), ModbusError> {
        info!("♻️  Resetting energy counter of {} (slave {})", meter.device_id, meter.address);
        self.transport
            .write_single_register(meter.address, OPERATION_COMMAND_REGISTER, CLEAR_ENERGY_COMMAND)
            .await
    }

    /// Resets each meter in turn with `pause` between them for the EEPROM
    /// write. One failure does not stop the rest.
    pub async fn reset_energy_all(
        &self,
        meters: &[PowerMeter],
        pause: Duration,
    ) -> Vec<(String, Result<(), ModbusError>)> {
        let mut results = Vec::with_capacity(meters.len());
        for (index, meter) in meters.iter().enumerate() {
            if index > 0 && !pause.is_zero() {
                sleep(pause).await;
            }
            let result = self.reset_energy(meter).await;
            if let Err(e) = &result {
                warn!("⚠️  {} rejected the energy reset: {}", meter.device_id, e);
            }
            results.push((meter.device_id.clone(), result));
        }
        results
    }
}

fn read_error(meter: &PowerMeter, field: &'static str, cause: ReadFailure) -> ReadError {
    ReadError {
        device_address: meter.address,
        device_id: meter.device_id.clone(),
        field,
        cause,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    /// Scripted register bank per slave with switchable outages.
    #[derive(Default)]
    pub(crate) struct FakeBus {
        pub registers: Mutex<HashMap<(u8, u16), Vec<u16>>>,
        pub offline: Mutex<HashSet<u8>>,
        pub failing_registers: Mutex<HashSet<(u8, u16)>>,
        pub requests: AtomicUsize,
        /// Added to every round trip, like a real line at 9600 baud.
        pub latency: Mutex<Duration>,
        /// (slave, register, sent at) for every read, in order.
        pub read_log: Mutex<Vec<(u8, u16, Instant)>>,
        /// (slave, register, value) for every accepted write.
        pub writes: Mutex<Vec<(u8, u16, u16)>>,
    }

    impl FakeBus {
        pub(crate) fn set(&self, slave: u8, address: u16, words: Vec<u16>) {
            self.registers.lock().unwrap().insert((slave, address), words);
        }

        pub(crate) fn set_offline(&self, slave: u8, offline: bool) {
            let mut set = self.offline.lock().unwrap();
            if offline {
                set.insert(slave);
            } else {
                set.remove(&slave);
            }
        }

        pub(crate) fn set_latency(&self, latency: Duration) {
            *self.latency.lock().unwrap() = latency;
        }

        async fn round_trip(&self) {
            let latency = *self.latency.lock().unwrap();
            if !latency.is_zero() {
                sleep(latency).await;
            }
        }

        /// Loads the v2 profile registers for a healthy meter.
        pub(crate) fn load_meter(&self, slave: u8, deci_volts: u32, milli_amps: u32, watts: i32, watt_hours: u32) {
            let split = |v: u32| vec![(v >> 16) as u16, v as u16];
            self.set(slave, 0x0000, split(deci_volts));
            self.set(slave, 0x0006, split(milli_amps));
            self.set(slave, 0x000C, split(watts as u32));
            self.set(slave, 0x0200, split(watt_hours));
        }
    }

    #[async_trait]
    impl ModbusClientTrait for FakeBus {
        async fn read_holding_registers(
            &self,
            slave_id: u8,
            start_addr: u16,
            count: u16,
        ) -> Result<Vec<u16>, ModbusError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.read_log.lock().unwrap().push((slave_id, start_addr, Instant::now()));
            self.round_trip().await;
            if self.offline.lock().unwrap().contains(&slave_id) {
                return Err(ModbusError::Timeout);
            }
            if self.failing_registers.lock().unwrap().contains(&(slave_id, start_addr)) {
                return Err(ModbusError::CrcError);
            }
            let words = self
                .registers
                .lock()
                .unwrap()
                .get(&(slave_id, start_addr))
                .cloned()
                .ok_or(ModbusError::Exception(0x02))?;
            Ok(words.into_iter().take(count as usize).collect())
        }

        async fn write_single_register(&self, slave_id: u8, address: u16, value: u16) -> Result<(), ModbusError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.round_trip().await;
            if self.offline.lock().unwrap().contains(&slave_id) {
                return Err(ModbusError::Timeout);
            }
            self.writes.lock().unwrap().push((slave_id, address, value));
            if address == OPERATION_COMMAND_REGISTER && value == CLEAR_ENERGY_COMMAND {
                if let Some(words) = self.registers.lock().unwrap().get_mut(&(slave_id, 0x0200)) {
                    words.iter_mut().for_each(|w| *w = 0);
                }
            }
            Ok(())
        }
    }

    pub(crate) fn meter(device_id: &str, address: u8, normalize_polarity: bool) -> PowerMeter {
        PowerMeter {
            device_id: device_id.to_string(),
            address,
            profile: DeviceProfile::km_n1_flk_v2(),
            normalize_polarity,
        }
    }

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(8, 30, 0).unwrap()
    }

    #[tokio::test]
    async fn test_read_assembles_reading() {
        let bus = Arc::new(FakeBus::default());
        bus.load_meter(1, 2305, 12_345, 2_500, 1_234_567);
        let client = MeterClient::new(bus.clone());

        let reading = client.read(&meter("unit01", 1, false), at()).await.unwrap();
        assert_eq!(reading.device_id, "unit01");
        assert_eq!(reading.timestamp, at());
        assert!((reading.voltage - 230.5).abs() < 1e-9);
        assert!((reading.current - 12.345).abs() < 1e-9);
        assert!((reading.active_power - 2.5).abs() < 1e-9);
        assert!((reading.accumulated_energy - 1234.567).abs() < 1e-9);
        assert_eq!(bus.requests.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_polarity_normalization_is_per_device() {
        let bus = Arc::new(FakeBus::default());
        bus.load_meter(2, 2300, 5_000, -1_200, 10_000);
        let client = MeterClient::new(bus);

        let raw = client.read(&meter("unit02", 2, false), at()).await.unwrap();
        assert!((raw.active_power + 1.2).abs() < 1e-9);

        let fixed = client.read(&meter("unit02", 2, true), at()).await.unwrap();
        assert!((fixed.active_power - 1.2).abs() < 1e-9);
        assert!(fixed.current >= 0.0);
    }

    #[tokio::test]
    async fn test_field_failure_aborts_whole_read() {
        let bus = Arc::new(FakeBus::default());
        bus.load_meter(1, 2305, 1_000, 100, 100);
        bus.failing_registers.lock().unwrap().insert((1, 0x0006));
        let client = MeterClient::new(bus.clone());

        let err = client.read(&meter("unit01", 1, false), at()).await.unwrap_err();
        assert_eq!(err.device_address, 1);
        assert_eq!(err.field, "current");
        assert!(matches!(err.cause, ReadFailure::Transport(ModbusError::CrcError)));
        // voltage succeeded, current failed, nothing after it was attempted
        assert_eq!(bus.requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_short_response_is_decode_failure() {
        let bus = Arc::new(FakeBus::default());
        bus.load_meter(1, 2305, 1_000, 100, 100);
        bus.set(1, 0x0200, vec![0x0001]);
        let client = MeterClient::new(bus);

        let err = client.read(&meter("unit01", 1, false), at()).await.unwrap_err();
        assert_eq!(err.field, "energy");
        assert!(matches!(err.cause, ReadFailure::Decode(_)));
    }

    #[tokio::test]
    async fn test_read_raw_returns_words_per_field() {
        let bus = Arc::new(FakeBus::default());
        bus.load_meter(1, 2305, 1_000, 100, 70_000);
        let client = MeterClient::new(bus);

        let fields = client.read_raw(&meter("unit01", 1, false)).await.unwrap();
        let names: Vec<_> = fields.iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["voltage", "current", "active_power", "energy"]);
        assert_eq!(fields[3].words, vec![0x0001, 0x1170]);
    }

    #[tokio::test]
    async fn test_reset_energy_sends_clear_command() {
        let bus = Arc::new(FakeBus::default());
        bus.load_meter(1, 2305, 1_000, 100, 70_000);
        let client = MeterClient::new(bus.clone());
        let unit = meter("unit01", 1, false);

        client.reset_energy(&unit).await.unwrap();
        assert_eq!(*bus.writes.lock().unwrap(), vec![(1, 0xFFFF, 0x0300)]);

        let reading = client.read(&unit, at()).await.unwrap();
        assert_eq!(reading.accumulated_energy, 0.0);
    }

    #[tokio::test]
    async fn test_reset_energy_all_pauses_and_continues_past_failures() {
        let bus = Arc::new(FakeBus::default());
        bus.set_offline(1, true);
        let client = MeterClient::new(bus.clone());
        let meters = vec![meter("unit01", 1, false), meter("unit02", 2, false)];

        let started = Instant::now();
        let results = client.reset_energy_all(&meters, Duration::from_millis(40)).await;
        assert!(started.elapsed() >= Duration::from_millis(40));

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "unit01");
        assert!(matches!(results[0].1, Err(ModbusError::Timeout)));
        assert!(results[1].1.is_ok());
        assert_eq!(*bus.writes.lock().unwrap(), vec![(2, 0xFFFF, 0x0300)]);
    }
}
