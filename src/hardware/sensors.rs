/// Reading snapshot sources
///
/// Decoding of the physical buses (I2C gas sensors, analog pH/level, RS-485
/// Modbus) lives outside this crate; the scheduler only needs a snapshot.
use rand::Rng;
use serde_json::json;

use crate::error::SensorError;
use crate::models::SensorValues;

/// `capture_reading()`: one snapshot of every sensor. May block.
pub trait SensorSource: Send + Sync {
    fn capture(&self) -> Result<SensorValues, SensorError>;
}

/// Plausible bioreactor values with a little noise, for bench and demo runs.
#[derive(Debug, Default)]
pub struct SimulatedSensors;

impl SensorSource for SimulatedSensors {
    fn capture(&self) -> Result<SensorValues, SensorError> {
        let mut rng = rand::thread_rng();
        let mut values = SensorValues::new();
        values.insert("co2_ppm".into(), json!(rng.gen_range(800.0..1600.0_f64).round()));
        values.insert("ch4_percent".into(), json!(round2(rng.gen_range(50.0..65.0))));
        values.insert("ph".into(), json!(round2(rng.gen_range(6.8..7.4))));
        values.insert(
            "pressure".into(),
            json!({
                "inlet_kpa": round2(rng.gen_range(101.0..103.0)),
                "headspace_kpa": round2(rng.gen_range(100.5..102.0)),
                "outlet_kpa": round2(rng.gen_range(100.0..101.5)),
            }),
        );
        values.insert("level_cm".into(), json!(round2(rng.gen_range(40.0..45.0))));
        values.insert(
            "modbus".into(),
            json!({
                "temperature_c": round2(rng.gen_range(35.0..38.0)),
                "conductivity_ms": round2(rng.gen_range(8.0..12.0)),
            }),
        );
        Ok(values)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
