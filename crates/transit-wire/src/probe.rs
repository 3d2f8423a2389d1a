use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{Error, Result};

/// Reserved payload value that tells the receiver to drop its window.
pub const SENTINEL: i64 = 0;

/// Resolution of the Unix timestamps carried in probe payloads.
///
/// Emitter and sampler must agree on the unit; it is a configuration
/// contract, nothing on the wire says which one was used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TimeUnit {
    #[default]
    #[serde(rename = "us", alias = "micros", alias = "microseconds")]
    Micros,
    #[serde(rename = "ns", alias = "nanos", alias = "nanoseconds")]
    Nanos,
}

impl TimeUnit {
    pub fn per_milli(self) -> i64 {
        match self {
            TimeUnit::Micros => 1_000,
            TimeUnit::Nanos => 1_000_000,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeUnit::Micros => "us",
            TimeUnit::Nanos => "ns",
        }
    }

    // Wall-clock reading in this unit. Clocks before the epoch read as zero.
    pub fn now(self) -> i64 {
        self.from_system_time(SystemTime::now())
    }

    pub fn from_system_time(self, time: SystemTime) -> i64 {
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        self.from_duration(since_epoch)
    }

    /// Converts a duration into a count of this unit, saturating at `i64::MAX`.
    pub fn from_duration(self, duration: Duration) -> i64 {
        let value = match self {
            TimeUnit::Micros => duration.as_micros(),
            TimeUnit::Nanos => duration.as_nanos(),
        };
        i64::try_from(value).unwrap_or(i64::MAX)
    }

    pub fn to_millis(self, delta: i64) -> f64 {
        delta as f64 / self.per_milli() as f64
    }

    /// Guesses the unit a present-day Unix timestamp was written in.
    ///
    /// Microsecond timestamps currently have 16 digits and nanosecond
    /// timestamps 19, so the ranges below stay unambiguous for centuries.
    pub fn infer(value: i64) -> Option<TimeUnit> {
        match value {
            100_000_000_000_000..100_000_000_000_000_000 => Some(TimeUnit::Micros),
            100_000_000_000_000_000.. => Some(TimeUnit::Nanos),
            _ => None,
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeUnit {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "us" | "µs" | "micros" | "microseconds" => Ok(TimeUnit::Micros),
            "ns" | "nanos" | "nanoseconds" => Ok(TimeUnit::Nanos),
            _ => Err(Error::UnknownTimeUnit(input.to_string())),
        }
    }
}

/// Decoded probe payload: either the clearing sentinel or a send timestamp.
///
/// On the wire a probe is the ASCII decimal form of one integer.
///
/// ```
/// use transit_wire::ProbePayload;
///
/// let probe = ProbePayload::timestamp(1_700_000_000_000_000);
/// assert_eq!(probe.encode().as_ref(), b"1700000000000000");
/// assert_eq!(ProbePayload::decode(b"0").expect("decode"), ProbePayload::Clear);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePayload {
    Clear,
    Timestamp(i64),
}

impl ProbePayload {
    // A zero timestamp is indistinguishable from the sentinel on the wire.
    pub fn timestamp(value: i64) -> Self {
        if value == SENTINEL {
            ProbePayload::Clear
        } else {
            ProbePayload::Timestamp(value)
        }
    }

    pub fn value(&self) -> i64 {
        match self {
            ProbePayload::Clear => SENTINEL,
            ProbePayload::Timestamp(value) => *value,
        }
    }

    pub fn is_clear(&self) -> bool {
        matches!(self, ProbePayload::Clear)
    }

    pub fn encode(&self) -> Bytes {
        Bytes::from(self.value().to_string())
    }

    pub fn decode(input: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(input)
            .map_err(|_| Error::MalformedPayload(String::from_utf8_lossy(input).into_owned()))?;
        let value = text
            .parse::<i64>()
            .map_err(|_| Error::MalformedPayload(text.to_string()))?;
        Ok(Self::timestamp(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_zero_is_clear() {
        assert_eq!(ProbePayload::decode(b"0").expect("decode"), ProbePayload::Clear);
        assert_eq!(ProbePayload::decode(b"-0").expect("decode"), ProbePayload::Clear);
    }

    #[test]
    fn decode_timestamp() {
        let probe = ProbePayload::decode(b"1700000000123456").expect("decode");
        assert_eq!(probe, ProbePayload::Timestamp(1_700_000_000_123_456));
        assert!(!probe.is_clear());
    }

    #[test]
    fn decode_rejects_garbage() {
        let inputs: [&[u8]; 6] = [b"not-a-number", b"", b" 12", b"12\n", b"1.5", &[0xff, 0xfe]];
        for input in inputs {
            let err = ProbePayload::decode(input).expect_err("malformed");
            assert!(matches!(err, Error::MalformedPayload(_)), "{input:?}");
        }
    }

    #[test]
    fn clear_encodes_as_zero() {
        assert_eq!(ProbePayload::Clear.encode().as_ref(), b"0");
        assert_eq!(ProbePayload::timestamp(0), ProbePayload::Clear);
    }

    #[test]
    fn time_unit_parses_aliases() {
        assert_eq!("us".parse::<TimeUnit>().expect("us"), TimeUnit::Micros);
        assert_eq!("Micros".parse::<TimeUnit>().expect("micros"), TimeUnit::Micros);
        assert_eq!("ns".parse::<TimeUnit>().expect("ns"), TimeUnit::Nanos);
        assert!("ms".parse::<TimeUnit>().is_err());
    }

    #[test]
    fn time_unit_conversions() {
        let period = Duration::from_millis(5);
        assert_eq!(TimeUnit::Micros.from_duration(period), 5_000);
        assert_eq!(TimeUnit::Nanos.from_duration(period), 5_000_000);
        assert_eq!(TimeUnit::Micros.to_millis(2_500), 2.5);
        assert_eq!(TimeUnit::Nanos.to_millis(2_500_000), 2.5);
        assert_eq!(TimeUnit::Nanos.from_duration(Duration::MAX), i64::MAX);
    }

    #[test]
    fn infer_distinguishes_units() {
        assert_eq!(TimeUnit::infer(1_700_000_000_000_000), Some(TimeUnit::Micros));
        assert_eq!(
            TimeUnit::infer(1_700_000_000_000_000_000),
            Some(TimeUnit::Nanos)
        );
        assert_eq!(TimeUnit::infer(1_700_000_000), None);
        assert_eq!(TimeUnit::infer(-5), None);
    }

    #[test]
    fn now_is_after_2020() {
        assert!(TimeUnit::Micros.now() > 1_577_836_800_000_000);
        assert_eq!(TimeUnit::infer(TimeUnit::Nanos.now()), Some(TimeUnit::Nanos));
    }
}
