use chrono::Local;
use serde_json::Value;

use crate::devices::power_meter::RawField;
use crate::storage::models::{AggregatedBucket, DailySummary, DatabaseStats, Reading, TIMESTAMP_FORMAT};

/// Renders query results for the CLI.
pub trait DataFormatter: Send + Sync {
    fn format_header(&self) -> String;
    fn format_readings(&self, readings: &[Reading]) -> String;
    fn format_buckets(&self, device_id: &str, buckets: &[AggregatedBucket]) -> String;
    fn format_summaries(&self, summaries: &[DailySummary]) -> String;
    fn format_stats(&self, stats: &DatabaseStats) -> String;

    fn format_reading(&self, reading: &Reading) -> String {
        self.format_readings(std::slice::from_ref(reading))
    }
}

pub fn formatter_for(name: &str) -> Option<Box<dyn DataFormatter>> {
    match name.to_ascii_lowercase().as_str() {
        "console" => Some(Box::new(ConsoleFormatter)),
        "json" => Some(Box::new(JsonFormatter)),
        "csv" => Some(Box::new(CsvFormatter)),
        _ => None,
    }
}

pub struct ConsoleFormatter;

impl DataFormatter for ConsoleFormatter {
    fn format_header(&self) -> String {
        format!("⚡ Power Monitor - {}\n", Local::now().format(TIMESTAMP_FORMAT))
    }

    fn format_readings(&self, readings: &[Reading]) -> String {
        if readings.is_empty() {
            return "📭 No readings\n".to_string();
        }
        let mut output = String::new();
        for r in readings {
            output.push_str(&format!(
                "🔹 {} @ {} | {:>6.1} V | {:>7.3} A | {:>8.4} kW | {:>10.3} kWh\n",
                r.device_id,
                r.timestamp.format(TIMESTAMP_FORMAT),
                r.voltage,
                r.current,
                r.active_power,
                r.accumulated_energy
            ));
        }
        output
    }

    fn format_buckets(&self, device_id: &str, buckets: &[AggregatedBucket]) -> String {
        let mut output = format!("📈 {} ({} buckets)\n", device_id, buckets.len());
        output.push_str(&"═".repeat(60));
        output.push('\n');
        for b in buckets {
            output.push_str(&format!(
                "{} | {:>6.1} V | {:>7.3} A | {:>10.3} kWh\n",
                b.bucket_start.format(TIMESTAMP_FORMAT),
                b.avg_voltage,
                b.avg_current,
                b.energy_at_bucket_end
            ));
        }
        output
    }

    fn format_summaries(&self, summaries: &[DailySummary]) -> String {
        let mut output = String::from("📅 Daily summary\n");
        for s in summaries {
            output.push_str(&format!(
                "{} {} | avg {:.2} A | used {:.3} kWh | total {:.3} kWh\n",
                s.date, s.device_id, s.avg_current, s.energy_used, s.energy_total
            ));
        }
        output
    }

    fn format_stats(&self, stats: &DatabaseStats) -> String {
        let mut output = format!("🗄️  {} readings\n", stats.total_readings);
        for d in &stats.devices {
            output.push_str(&format!("  {}: {}\n", d.device_id, d.readings));
        }
        if let (Some(first), Some(last)) = (stats.earliest, stats.latest) {
            output.push_str(&format!(
                "  span: {} .. {}\n",
                first.format(TIMESTAMP_FORMAT),
                last.format(TIMESTAMP_FORMAT)
            ));
        }
        output
    }
}

pub struct JsonFormatter;

impl JsonFormatter {
    fn render(value: Value) -> String {
        serde_json::to_string_pretty(&value).unwrap_or_default()
    }
}

impl DataFormatter for JsonFormatter {
    fn format_header(&self) -> String {
        String::new()
    }

    fn format_readings(&self, readings: &[Reading]) -> String {
        Self::render(serde_json::json!({ "count": readings.len(), "readings": readings }))
    }

    fn format_buckets(&self, device_id: &str, buckets: &[AggregatedBucket]) -> String {
        Self::render(serde_json::json!({ "device_id": device_id, "buckets": buckets }))
    }

    fn format_summaries(&self, summaries: &[DailySummary]) -> String {
        Self::render(serde_json::json!({ "summaries": summaries }))
    }

    fn format_stats(&self, stats: &DatabaseStats) -> String {
        Self::render(serde_json::to_value(stats).unwrap_or(Value::Null))
    }
}

pub struct CsvFormatter;

impl DataFormatter for CsvFormatter {
    fn format_header(&self) -> String {
        String::new()
    }

    fn format_readings(&self, readings: &[Reading]) -> String {
        let mut csv = String::from("device_id,timestamp,voltage,current,power_kw,energy_kwh\n");
        for r in readings {
            csv.push_str(&format!(
                "{},{},{},{},{},{}\n",
                r.device_id,
                r.timestamp.format(TIMESTAMP_FORMAT),
                r.voltage,
                r.current,
                r.active_power,
                r.accumulated_energy
            ));
        }
        csv
    }

    fn format_buckets(&self, device_id: &str, buckets: &[AggregatedBucket]) -> String {
        let mut csv = String::from("device_id,bucket_start,avg_voltage,avg_current,energy_kwh\n");
        for b in buckets {
            csv.push_str(&format!(
                "{},{},{},{},{}\n",
                device_id,
                b.bucket_start.format(TIMESTAMP_FORMAT),
                b.avg_voltage,
                b.avg_current,
                b.energy_at_bucket_end
            ));
        }
        csv
    }

    fn format_summaries(&self, summaries: &[DailySummary]) -> String {
        let mut csv = String::from("date,device_id,avg_current,energy_used_kwh,energy_total_kwh\n");
        for s in summaries {
            csv.push_str(&format!(
                "{},{},{},{},{}\n",
                s.date, s.device_id, s.avg_current, s.energy_used, s.energy_total
            ));
        }
        csv
    }

    fn format_stats(&self, stats: &DatabaseStats) -> String {
        let mut csv = String::from("device_id,readings\n");
        for d in &stats.devices {
            csv.push_str(&format!("{},{}\n", d.device_id, d.readings));
        }
        csv
    }
}

/// Raw register dump for checking a profile against a live meter.
pub struct HexFormatter;

impl HexFormatter {
    pub fn format_raw_fields(&self, device_id: &str, address: u8, fields: &[RawField]) -> String {
        let mut output = format!("🔍 {} (slave {}) raw registers\n", device_id, address);
        output.push_str(&"─".repeat(60));
        output.push('\n');
        for field in fields {
            let hex: Vec<String> = field.words.iter().map(|w| format!("{:04X}", w)).collect();
            let decoded = field
                .spec
                .decode(&field.words)
                .map(|v| format!("{}", v))
                .unwrap_or_else(|e| e.to_string());
            output.push_str(&format!(
                "{:<13} @0x{:04X} [{}] -> {}\n",
                field.name,
                field.spec.address,
                hex.join(" "),
                decoded
            ));
        }
        output
    }
}
