//! 64-bit tagged term identifiers.
//!
//! The top 4 bits carry the term kind, the low 60 bits the payload: a
//! dictionary sequence number for IRIs, blank nodes and literals, or the value
//! itself for inline-encodable `xsd:integer`, `xsd:decimal` and `xsd:dateTime`
//! literals. Inline kinds decode without any dictionary access, and equal
//! values always produce equal ids.

use oxsdatatypes::{DayTimeDuration, DateTime, Decimal, Integer};
use std::str::FromStr;
use std::sync::OnceLock;

const KIND_SHIFT: u32 = 60;
const PAYLOAD_BITS: u32 = 60;
const PAYLOAD_MASK: u64 = (1 << PAYLOAD_BITS) - 1;

/// Inline integer range: [-2^59, 2^59).
const INLINE_INTEGER_MIN: i64 = -(1 << 59);
const INLINE_INTEGER_MAX: i64 = (1 << 59) - 1;

/// Inline decimal packing: 1 sign bit, 4 scale bits, 55 magnitude bits.
const DECIMAL_SIGN_BIT: u64 = 1 << 59;
const DECIMAL_SCALE_SHIFT: u32 = 55;
const DECIMAL_SCALE_MAX: u32 = 15;
const DECIMAL_MANTISSA_MAX: i128 = (1 << 55) - 1;
const DECIMAL_MANTISSA_MASK: u64 = (1 << 55) - 1;

/// `xsd:decimal` values are scaled by 10^18 inside [`Decimal`].
const DECIMAL_INNER_SCALE: u32 = 18;
/// 10^15: converts a 10^18-scaled seconds count into whole milliseconds.
const SECONDS_SCALE_TO_MILLIS: i128 = 1_000_000_000_000_000;

/// The kind tag of a [`TermId`].
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
#[repr(u8)]
pub enum TermIdKind {
    Iri = 1,
    BlankNode = 2,
    Literal = 3,
    InlineInteger = 4,
    InlineDecimal = 5,
    InlineDateTime = 6,
}

impl TermIdKind {
    fn from_tag(tag: u64) -> Option<Self> {
        Some(match tag {
            1 => Self::Iri,
            2 => Self::BlankNode,
            3 => Self::Literal,
            4 => Self::InlineInteger,
            5 => Self::InlineDecimal,
            6 => Self::InlineDateTime,
            _ => return None,
        })
    }

    /// Kinds whose payload is a dictionary sequence number.
    pub fn is_sequence(self) -> bool {
        matches!(self, Self::Iri | Self::BlankNode | Self::Literal)
    }
}

/// A 64-bit tagged identifier of an RDF term.
#[derive(Eq, PartialEq, Ord, PartialOrd, Debug, Clone, Copy, Hash)]
pub struct TermId(u64);

impl TermId {
    pub fn from_sequence(kind: TermIdKind, sequence: u64) -> Self {
        debug_assert!(kind.is_sequence());
        debug_assert!(sequence <= PAYLOAD_MASK);
        Self(u64::from(kind as u8) << KIND_SHIFT | (sequence & PAYLOAD_MASK))
    }

    pub fn kind(self) -> Option<TermIdKind> {
        TermIdKind::from_tag(self.0 >> KIND_SHIFT)
    }

    /// The low 60 bits, a sequence number for dictionary-allocated kinds.
    pub fn sequence(self) -> u64 {
        self.0 & PAYLOAD_MASK
    }

    pub fn is_inline(self) -> bool {
        self.kind().is_some_and(|kind| !kind.is_sequence())
    }

    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    /// Inlines an `xsd:integer` value if it fits the 60-bit payload.
    pub fn from_integer(value: Integer) -> Option<Self> {
        let value = i64::from_be_bytes(value.to_be_bytes());
        if !(INLINE_INTEGER_MIN..=INLINE_INTEGER_MAX).contains(&value) {
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        let payload = (value as u64) & PAYLOAD_MASK;
        Some(Self(
            u64::from(TermIdKind::InlineInteger as u8) << KIND_SHIFT | payload,
        ))
    }

    /// The integer payload of an inline integer id, sign-extended from 60 bits.
    pub fn as_integer(self) -> Option<Integer> {
        if self.kind()? != TermIdKind::InlineInteger {
            return None;
        }
        #[allow(clippy::cast_possible_wrap)]
        let value = ((self.0 << 4) as i64) >> 4;
        Some(Integer::from(value))
    }

    /// Inlines an `xsd:decimal` whose trailing-zero-stripped mantissa fits 55
    /// bits with a scale of at most 15 digits.
    ///
    /// The mantissa is always stripped before packing so the representation is
    /// canonical: `1.50` and `1.5` produce the same id.
    pub fn from_decimal(value: Decimal) -> Option<Self> {
        let mut unscaled = i128::from_be_bytes(value.to_be_bytes());
        let mut scale = DECIMAL_INNER_SCALE;
        while scale > 0 && unscaled % 10 == 0 {
            unscaled /= 10;
            scale -= 1;
        }
        if scale > DECIMAL_SCALE_MAX {
            return None;
        }
        let negative = unscaled < 0;
        let magnitude = unscaled.unsigned_abs();
        if magnitude > DECIMAL_MANTISSA_MAX.unsigned_abs() {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        let mut payload = magnitude as u64;
        payload |= u64::from(scale) << DECIMAL_SCALE_SHIFT;
        if negative {
            payload |= DECIMAL_SIGN_BIT;
        }
        Some(Self(
            u64::from(TermIdKind::InlineDecimal as u8) << KIND_SHIFT | payload,
        ))
    }

    pub fn as_decimal(self) -> Option<Decimal> {
        if self.kind()? != TermIdKind::InlineDecimal {
            return None;
        }
        let payload = self.0 & PAYLOAD_MASK;
        let scale = (payload >> DECIMAL_SCALE_SHIFT) & 0xF;
        let mut mantissa = i128::from(payload & DECIMAL_MANTISSA_MASK);
        if payload & DECIMAL_SIGN_BIT != 0 {
            mantissa = -mantissa;
        }
        #[allow(clippy::cast_possible_truncation)]
        Decimal::new(mantissa, scale as u32).ok()
    }

    /// Inlines a timezoned `xsd:dateTime` with at most millisecond precision
    /// in `[1970-01-01, 1970 + 2^60 ms)`, normalized to UTC.
    ///
    /// Untimezoned values have no fixed instant and sub-millisecond values do
    /// not fit the payload; both stay in the dictionary.
    pub fn from_date_time(value: DateTime) -> Option<Self> {
        value.timezone_offset()?;
        let since_epoch = value.checked_sub(unix_epoch())?;
        let seconds_scaled = i128::from_be_bytes(since_epoch.as_seconds().to_be_bytes());
        if seconds_scaled % SECONDS_SCALE_TO_MILLIS != 0 {
            return None;
        }
        let millis = seconds_scaled / SECONDS_SCALE_TO_MILLIS;
        if millis < 0 || millis > i128::from(PAYLOAD_MASK) {
            return None;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Some(Self(
            u64::from(TermIdKind::InlineDateTime as u8) << KIND_SHIFT | millis as u64,
        ))
    }

    /// The UTC instant of an inline dateTime id.
    pub fn as_date_time(self) -> Option<DateTime> {
        if self.kind()? != TermIdKind::InlineDateTime {
            return None;
        }
        let millis = i128::from(self.0 & PAYLOAD_MASK);
        let seconds = Decimal::new(millis, 3).ok()?;
        unix_epoch().checked_add_day_time_duration(DayTimeDuration::new(seconds))
    }
}

fn unix_epoch() -> DateTime {
    static EPOCH: OnceLock<DateTime> = OnceLock::new();
    *EPOCH.get_or_init(|| {
        DateTime::from_str("1970-01-01T00:00:00Z").expect("the Unix epoch is a valid xsd:dateTime")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_round_trip_at_bounds() {
        for value in [0_i64, 1, -1, 42, INLINE_INTEGER_MIN, INLINE_INTEGER_MAX] {
            let id = TermId::from_integer(Integer::from(value)).unwrap();
            assert_eq!(id.kind(), Some(TermIdKind::InlineInteger));
            assert_eq!(id.as_integer(), Some(Integer::from(value)));
        }
    }

    #[test]
    fn integer_out_of_range_is_not_inlined() {
        assert!(TermId::from_integer(Integer::from(INLINE_INTEGER_MAX + 1)).is_none());
        assert!(TermId::from_integer(Integer::from(INLINE_INTEGER_MIN - 1)).is_none());
    }

    #[test]
    fn decimal_round_trip() {
        for lexical in ["0", "1.5", "-1.5", "123456.789", "-0.000000000000001"] {
            let value = Decimal::from_str(lexical).unwrap();
            let id = TermId::from_decimal(value).unwrap();
            assert_eq!(id.kind(), Some(TermIdKind::InlineDecimal));
            assert_eq!(id.as_decimal(), Some(value));
        }
    }

    #[test]
    fn decimal_packing_is_canonical() {
        let a = TermId::from_decimal(Decimal::from_str("1.50").unwrap()).unwrap();
        let b = TermId::from_decimal(Decimal::from_str("1.5").unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn decimal_out_of_packing_is_not_inlined() {
        // 16 significant fraction digits exceed the 4-bit scale
        assert!(TermId::from_decimal(Decimal::from_str("0.1234567890123456").unwrap()).is_none());
    }

    #[test]
    fn date_time_round_trip_normalizes_to_utc() {
        let id = TermId::from_date_time(DateTime::from_str("2024-06-01T10:30:00.250Z").unwrap())
            .unwrap();
        assert_eq!(id.kind(), Some(TermIdKind::InlineDateTime));
        assert_eq!(
            id.as_date_time(),
            Some(DateTime::from_str("2024-06-01T10:30:00.25Z").unwrap())
        );

        // The same instant written with an offset maps to the same id
        let offset =
            TermId::from_date_time(DateTime::from_str("2024-06-01T12:30:00.250+02:00").unwrap())
                .unwrap();
        assert_eq!(id, offset);
    }

    #[test]
    fn date_time_not_inlined_without_timezone_or_before_epoch() {
        assert!(
            TermId::from_date_time(DateTime::from_str("2024-06-01T10:30:00").unwrap()).is_none()
        );
        assert!(
            TermId::from_date_time(DateTime::from_str("1969-12-31T23:59:59Z").unwrap()).is_none()
        );
        assert!(TermId::from_date_time(
            DateTime::from_str("2024-06-01T10:30:00.0001Z").unwrap()
        )
        .is_none());
    }

    #[test]
    fn sequence_ids_keep_kind_and_payload() {
        let id = TermId::from_sequence(TermIdKind::Literal, 12345);
        assert_eq!(id.kind(), Some(TermIdKind::Literal));
        assert_eq!(id.sequence(), 12345);
        assert!(!id.is_inline());
        assert_eq!(TermId::from_be_bytes(id.to_be_bytes()), id);
    }
}
