use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// A point in time with nanosecond precision, always normalized so that
/// `0 <= nanos < 1_000_000_000`.
///
/// Field order matters: the derived ordering compares seconds first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        let total = i64::from(nanos);
        Self {
            seconds: seconds + total.div_euclid(NANOS_PER_SECOND),
            nanos: total.rem_euclid(NANOS_PER_SECOND) as i32,
        }
    }

    pub fn now() -> Self {
        let now = chrono::Utc::now();
        Self::new(now.timestamp(), now.timestamp_subsec_nanos() as i32)
    }

    pub fn from_millis(millis: i64) -> Self {
        Self::new(millis.div_euclid(1_000), (millis.rem_euclid(1_000) * 1_000_000) as i32)
    }

    pub fn from_micros(micros: i64) -> Self {
        Self::new(micros.div_euclid(1_000_000), (micros.rem_euclid(1_000_000) * 1_000) as i32)
    }

    /// Microseconds since the epoch; sub-microsecond precision is truncated.
    pub fn to_micros(&self) -> i64 {
        self.seconds * 1_000_000 + i64::from(self.nanos) / 1_000
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp(seconds={}, nanos={})", self.seconds, self.nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_overflowing_nanoseconds() {
        let timestamp = Timestamp::new(1, 1_500_000_000);
        assert_eq!(timestamp, Timestamp::new(2, 500_000_000));
        assert_eq!(Timestamp::new(0, -1), Timestamp::new(-1, 999_999_999));
    }

    #[test]
    fn orders_seconds_before_nanos() {
        assert!(Timestamp::new(1, 999_999_999) < Timestamp::new(2, 0));
        assert!(Timestamp::new(2, 1) > Timestamp::new(2, 0));
    }

    #[test]
    fn converts_between_units() {
        let timestamp = Timestamp::from_micros(1_500_001);
        assert_eq!(timestamp, Timestamp::new(1, 500_001_000));
        assert_eq!(timestamp.to_micros(), 1_500_001);
        assert_eq!(Timestamp::from_millis(2_250), Timestamp::new(2, 250_000_000));
        assert_eq!(Timestamp::from_micros(-1), Timestamp::new(-1, 999_999_000));
    }
}
