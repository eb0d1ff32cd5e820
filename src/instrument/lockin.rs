//! Lock-in amplifier data types.
//!
//! The data server answers polls with a nested dictionary keyed by device, node and
//! channel. [`Burst::from_payload`] is the single place where that loosely-typed shape is
//! turned into a checked [`Burst`]; everything downstream only sees typed samples.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::LockInSettings;
use crate::error::{AppResult, DaqError};

/// Handle returned by a successful lock-in connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInSession {
    pub device: String,
}

impl LockInSession {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }

    /// Streaming node of demodulator `channel` (1-based).
    pub fn sample_path(&self, channel: u8) -> String {
        sample_path(&self.device, channel)
    }
}

/// `/{device}/demods/{channel - 1}/sample`
pub fn sample_path(device: &str, channel: u8) -> String {
    format!("/{}/demods/{}/sample", device, channel.saturating_sub(1))
}

/// One node/value pair sent to the data server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSetting {
    pub path: String,
    pub value: f64,
}

impl NodeSetting {
    fn new(path: String, value: impl Into<f64>) -> Self {
        Self {
            path,
            value: value.into(),
        }
    }
}

/// Demodulator and input settings applied before each band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInParameters {
    pub channel: u8,
    /// Input carrying the chopper reference, 0-based.
    pub reference_input: u8,
    pub diff: bool,
    pub imp50: bool,
    pub imp50_reference: bool,
    pub ac: bool,
    pub input_range: f64,
    pub lowpass_order: u8,
    pub rate: f64,
    pub time_constant_s: f64,
    /// Transimpedance amplifier gain in V/A.
    pub amplification: f64,
}

impl LockInParameters {
    pub fn from_settings(settings: &LockInSettings, amplification: f64) -> Self {
        Self {
            channel: settings.channel,
            reference_input: 1,
            diff: settings.diff,
            imp50: settings.imp50,
            imp50_reference: settings.imp50_reference,
            ac: settings.ac,
            input_range: settings.input_range,
            lowpass_order: settings.lowpass_order,
            rate: settings.rate,
            time_constant_s: settings.time_constant_s,
            amplification,
        }
    }

    /// Full node list for `device`, in the order the server must receive it.
    ///
    /// All demodulator triggers and both signal outputs are disabled first, then the
    /// measurement channel and the external reference PLL are configured.
    pub fn node_settings(&self, device: &str) -> Vec<NodeSetting> {
        let c = self.channel.saturating_sub(1);
        let flag = |b: bool| if b { 1.0 } else { 0.0 };

        let mut nodes: Vec<NodeSetting> = (0..6)
            .map(|demod| NodeSetting::new(format!("/{device}/demods/{demod}/trigger"), 0))
            .collect();
        nodes.extend((0..2).map(|out| {
            NodeSetting::new(format!("/{device}/sigouts/{out}/enables/*"), 0)
        }));

        nodes.extend([
            NodeSetting::new(format!("/{device}/sigins/{c}/diff"), flag(self.diff)),
            NodeSetting::new(format!("/{device}/sigins/{c}/imp50"), flag(self.imp50)),
            NodeSetting::new(format!("/{device}/sigins/{c}/ac"), flag(self.ac)),
            NodeSetting::new(format!("/{device}/sigins/{c}/range"), self.input_range),
            NodeSetting::new(format!("/{device}/demods/{c}/order"), self.lowpass_order),
            NodeSetting::new(
                format!("/{device}/demods/{c}/timeconstant"),
                self.time_constant_s,
            ),
            NodeSetting::new(format!("/{device}/demods/{c}/rate"), self.rate),
            NodeSetting::new(format!("/{device}/demods/{c}/oscselect"), c),
            NodeSetting::new(format!("/{device}/demods/{c}/harmonic"), 1),
            NodeSetting::new(format!("/{device}/demods/{c}/phaseshift"), 0),
            NodeSetting::new(
                format!("/{device}/zctrls/{c}/tamp/0/currentgain"),
                self.amplification,
            ),
            NodeSetting::new(format!("/{device}/demods/{c}/adcselect"), c),
            NodeSetting::new(
                format!("/{device}/sigins/{}/imp50", self.reference_input),
                flag(self.imp50_reference),
            ),
            NodeSetting::new(format!("/{device}/plls/{c}/enable"), 1),
            NodeSetting::new(format!("/{device}/plls/{c}/adcselect"), 1),
        ]);
        nodes
    }
}

/// Raw demodulator samples collected at one wavelength.
#[derive(Debug, Clone, PartialEq)]
pub struct Burst {
    x: Vec<f64>,
    y: Vec<f64>,
    frequency: Vec<f64>,
    phase: Vec<f64>,
    dataloss: bool,
}

impl Burst {
    /// All sample vectors must have the same length.
    pub fn new(
        x: Vec<f64>,
        y: Vec<f64>,
        frequency: Vec<f64>,
        phase: Vec<f64>,
        dataloss: bool,
    ) -> AppResult<Self> {
        let n = x.len();
        if y.len() != n || frequency.len() != n || phase.len() != n {
            return Err(DaqError::BurstParse(format!(
                "sample vectors differ in length (x={}, y={}, frequency={}, phase={})",
                n,
                y.len(),
                frequency.len(),
                phase.len()
            )));
        }
        Ok(Self {
            x,
            y,
            frequency,
            phase,
            dataloss,
        })
    }

    /// Extracts the samples of demodulator `channel_index` (0-based) for `device`.
    ///
    /// Returns `Ok(None)` when the payload has no samples for the device.
    pub fn from_payload(payload: &Value, device: &str, channel_index: u8) -> AppResult<Option<Self>> {
        let Some(device_node) = payload.get(device) else {
            return Ok(None);
        };

        let sample = device_node
            .get("demods")
            .and_then(|demods| demods.get(channel_index.to_string()))
            .and_then(|demod| demod.get("sample"))
            .ok_or_else(|| {
                DaqError::BurstParse(format!(
                    "no demods/{channel_index}/sample node for {device}"
                ))
            })?;

        let raw: RawSample = serde_json::from_value(sample.clone())
            .map_err(|e| DaqError::BurstParse(format!("{device}: {e}")))?;
        let dataloss = raw.time.dataloss.is_set();

        if raw.x.is_empty() && !dataloss {
            return Ok(None);
        }
        Self::new(raw.x, raw.y, raw.frequency, raw.phase, dataloss).map(Some)
    }

    pub fn x(&self) -> &[f64] {
        &self.x
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }

    pub fn frequency(&self) -> &[f64] {
        &self.frequency
    }

    pub fn phase(&self) -> &[f64] {
        &self.phase
    }

    pub fn dataloss(&self) -> bool {
        self.dataloss
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Per-sample `sqrt(x² + y²)`.
    pub fn magnitudes(&self) -> impl Iterator<Item = f64> + '_ {
        self.x.iter().zip(&self.y).map(|(x, y)| x.hypot(*y))
    }
}

#[derive(Debug, Deserialize)]
struct RawSample {
    x: Vec<f64>,
    y: Vec<f64>,
    frequency: Vec<f64>,
    phase: Vec<f64>,
    #[serde(default)]
    time: RawTime,
}

#[derive(Debug, Default, Deserialize)]
struct RawTime {
    #[serde(default)]
    dataloss: Flag,
}

/// The server reports flags as booleans or integers depending on the API level.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Int(i64),
}

impl Default for Flag {
    fn default() -> Self {
        Flag::Bool(false)
    }
}

impl Flag {
    fn is_set(&self) -> bool {
        match self {
            Flag::Bool(b) => *b,
            Flag::Int(i) => *i != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_nested_payload() {
        let payload = json!({
            "dev2000": {"demods": {"0": {"sample": {
                "x": [3.0, 0.0], "y": [4.0, 1.0],
                "frequency": [390.0, 391.0], "phase": [0.1, 0.2],
                "time": {"dataloss": 0}
            }}}}
        });
        let burst = Burst::from_payload(&payload, "dev2000", 0).unwrap().unwrap();
        assert_eq!(burst.len(), 2);
        assert!(!burst.dataloss());
        assert_eq!(burst.magnitudes().collect::<Vec<_>>(), vec![5.0, 1.0]);
    }

    #[test]
    fn missing_device_means_no_data() {
        let payload = json!({"dev838": {}});
        assert!(Burst::from_payload(&payload, "dev2000", 0).unwrap().is_none());
    }

    #[test]
    fn mismatched_lengths_fail_fast() {
        let payload = json!({
            "dev2000": {"demods": {"0": {"sample": {
                "x": [1.0, 2.0], "y": [1.0],
                "frequency": [1.0, 1.0], "phase": [0.0, 0.0]
            }}}}
        });
        let err = Burst::from_payload(&payload, "dev2000", 0).unwrap_err();
        assert!(matches!(err, DaqError::BurstParse(_)));
    }

    #[test]
    fn wrong_value_type_is_a_parse_error() {
        let payload = json!({
            "dev2000": {"demods": {"0": {"sample": {"x": "nope"}}}}
        });
        assert!(matches!(
            Burst::from_payload(&payload, "dev2000", 0),
            Err(DaqError::BurstParse(_))
        ));
    }

    #[test]
    fn node_settings_start_by_disabling_outputs() {
        let params = LockInParameters::from_settings(&LockInSettings::default(), 1e6);
        let nodes = params.node_settings("dev2000");

        assert_eq!(nodes.len(), 8 + 15);
        assert!(nodes[..8].iter().all(|n| n.value == 0.0));
        assert_eq!(nodes[0].path, "/dev2000/demods/0/trigger");
        assert_eq!(nodes[7].path, "/dev2000/sigouts/1/enables/*");

        let gain = nodes
            .iter()
            .find(|n| n.path == "/dev2000/zctrls/0/tamp/0/currentgain")
            .unwrap();
        assert_eq!(gain.value, 1e6);
        assert_eq!(nodes.last().unwrap().path, "/dev2000/plls/0/adcselect");
        assert!(nodes
            .iter()
            .any(|n| n.path == "/dev2000/sigins/1/imp50" && n.value == 1.0));
    }

    #[test]
    fn sample_path_is_zero_based() {
        assert_eq!(sample_path("dev2000", 1), "/dev2000/demods/0/sample");
    }
}
