//! # Metric Data Codec
//!
//! Every counter row stores its state in one fixed 20-byte value:
//!
//! ```text
//! ┌──────────────────┬───────────────────────┬───────────────────────┐
//! │ event minutes    │ cumulative amount     │ delta amount          │
//! │ u32 big-endian   │ i64 big-endian × 10⁶  │ i64 big-endian × 10⁶  │
//! └──────────────────┴───────────────────────┴───────────────────────┘
//!   bytes 0..4         bytes 4..12             bytes 12..20
//! ```
//!
//! The timestamp prefix comes first so that byte-wise ordering of the
//! whole value matches chronological ordering of the buckets. `MAX(data)`
//! and `MIN(data)` over a series therefore return the latest and earliest
//! rows, and range predicates can compare raw bytes against the bounds
//! produced by [`MetricData::lower_bound`] and [`MetricData::upper_bound`].

use std::fmt;

/// Size of an encoded value in bytes.
pub const DATA_LEN: usize = 20;

/// Amounts are stored as fixed-point integers with six fractional digits.
pub const AMOUNT_SCALE: i64 = 1_000_000;

const MILLIS_PER_MINUTE: i64 = 60_000;
const PREFIX_LEN: usize = 4;
const CUMULATIVE_AT: usize = 4;
const DELTA_AT: usize = 12;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("metric data must be {DATA_LEN} bytes, got {0}")]
    InvalidLength(usize),

    #[error("timestamp {0} is outside the encodable range")]
    TimestampOutOfRange(i64),

    #[error("amount {0} is not finite or exceeds the fixed-point range")]
    AmountOutOfRange(f64),

    #[error("amount arithmetic overflowed")]
    Overflow,
}

/// Which of the two amounts to read from an encoded value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AmountPosition {
    Cumulative,
    Delta,
}

impl AmountPosition {
    fn offset(self) -> usize {
        match self {
            AmountPosition::Cumulative => CUMULATIVE_AT,
            AmountPosition::Delta => DELTA_AT,
        }
    }
}

/// Convert a floating amount to fixed-point micros.
///
/// The product is truncated toward zero. A product that lies within a few
/// ulps of an integer is first snapped to it, because values such as `4.35`
/// have no exact binary representation and would otherwise lose a micro.
pub fn to_micros(amount: f64) -> Result<i64, CodecError> {
    if !amount.is_finite() {
        return Err(CodecError::AmountOutOfRange(amount));
    }
    let scaled = amount * AMOUNT_SCALE as f64;
    let nearest = scaled.round();
    let value = if (scaled - nearest).abs() <= nearest.abs() * 4.0 * f64::EPSILON {
        nearest
    } else {
        scaled.trunc()
    };
    if value < i64::MIN as f64 || value >= i64::MAX as f64 {
        return Err(CodecError::AmountOutOfRange(amount));
    }
    Ok(value as i64)
}

/// Convert fixed-point micros back to a floating amount.
#[inline]
pub fn from_micros(micros: i64) -> f64 {
    micros as f64 / AMOUNT_SCALE as f64
}

/// Minute index of a Unix-millisecond timestamp.
pub fn event_minutes(event_millis: i64) -> Result<u32, CodecError> {
    if event_millis < 0 {
        return Err(CodecError::TimestampOutOfRange(event_millis));
    }
    u32::try_from(event_millis / MILLIS_PER_MINUTE)
        .map_err(|_| CodecError::TimestampOutOfRange(event_millis))
}

/// The 4-byte bucket prefix for a timestamp.
pub fn bucket_prefix(event_millis: i64) -> Result<[u8; 4], CodecError> {
    Ok(event_minutes(event_millis)?.to_be_bytes())
}

/// One decoded counter row value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricData {
    bytes: [u8; DATA_LEN],
}

impl MetricData {
    /// Encode from floating amounts.
    pub fn encode(event_millis: i64, cumulative: f64, delta: f64) -> Result<Self, CodecError> {
        Self::from_micros(event_millis, to_micros(cumulative)?, to_micros(delta)?)
    }

    /// Encode from fixed-point amounts.
    pub fn from_micros(event_millis: i64, cumulative: i64, delta: i64) -> Result<Self, CodecError> {
        let mut bytes = [0u8; DATA_LEN];
        bytes[..PREFIX_LEN].copy_from_slice(&bucket_prefix(event_millis)?);
        bytes[CUMULATIVE_AT..DELTA_AT].copy_from_slice(&cumulative.to_be_bytes());
        bytes[DELTA_AT..].copy_from_slice(&delta.to_be_bytes());
        Ok(Self { bytes })
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, CodecError> {
        let bytes: [u8; DATA_LEN] = raw
            .try_into()
            .map_err(|_| CodecError::InvalidLength(raw.len()))?;
        Ok(Self { bytes })
    }

    /// Smallest possible value whose bucket is `event_millis`.
    pub fn lower_bound(event_millis: i64) -> Result<[u8; DATA_LEN], CodecError> {
        let mut bytes = [0u8; DATA_LEN];
        bytes[..PREFIX_LEN].copy_from_slice(&bucket_prefix(event_millis)?);
        Ok(bytes)
    }

    /// Largest possible value whose bucket is `event_millis`.
    pub fn upper_bound(event_millis: i64) -> Result<[u8; DATA_LEN], CodecError> {
        let mut bytes = [0xFFu8; DATA_LEN];
        bytes[..PREFIX_LEN].copy_from_slice(&bucket_prefix(event_millis)?);
        Ok(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; DATA_LEN] {
        &self.bytes
    }

    #[inline]
    pub fn event_minutes(&self) -> u32 {
        let mut prefix = [0u8; PREFIX_LEN];
        prefix.copy_from_slice(&self.bytes[..PREFIX_LEN]);
        u32::from_be_bytes(prefix)
    }

    /// Bucket timestamp in Unix milliseconds.
    #[inline]
    pub fn event_millis(&self) -> i64 {
        self.event_minutes() as i64 * MILLIS_PER_MINUTE
    }

    #[inline]
    pub fn micros(&self, position: AmountPosition) -> i64 {
        let at = position.offset();
        let mut amount = [0u8; 8];
        amount.copy_from_slice(&self.bytes[at..at + 8]);
        i64::from_be_bytes(amount)
    }

    #[inline]
    pub fn cumulative_micros(&self) -> i64 {
        self.micros(AmountPosition::Cumulative)
    }

    #[inline]
    pub fn delta_micros(&self) -> i64 {
        self.micros(AmountPosition::Delta)
    }

    pub fn cumulative(&self) -> f64 {
        from_micros(self.cumulative_micros())
    }

    pub fn delta(&self) -> f64 {
        from_micros(self.delta_micros())
    }

    /// A copy with both amounts shifted, keeping the bucket.
    pub fn with_added(&self, cumulative: i64, delta: i64) -> Result<Self, CodecError> {
        let cumulative = self
            .cumulative_micros()
            .checked_add(cumulative)
            .ok_or(CodecError::Overflow)?;
        let delta = self
            .delta_micros()
            .checked_add(delta)
            .ok_or(CodecError::Overflow)?;
        Self::from_micros(self.event_millis(), cumulative, delta)
    }
}

impl fmt::Debug for MetricData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricData")
            .field("event_millis", &self.event_millis())
            .field("cumulative", &self.cumulative())
            .field("delta", &self.delta())
            .finish()
    }
}
