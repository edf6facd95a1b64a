//! Timestamps and exact quantities shared by every record
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

// chrono orders `DateTime<Tz>` for any zone, but the zone types themselves
// are not `Ord`, so a derive would never apply.
impl<T: TimeZone + Eq> PartialOrd for TimeStamp<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: TimeZone + Eq> Ord for TimeStamp<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Self)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl fmt::Display for TimeStamp<Utc> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// An exact kilogram quantity. Splits are computed on decimals so repeated
/// partial sales never drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Kg(Decimal);

/// A monetary amount, either a price per kilogram or an order total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Money(Decimal);

impl Kg {
    pub const ZERO: Kg = Kg(Decimal::ZERO);

    pub fn new(value: Decimal) -> Self {
        Self(value)
    }
    pub fn value(&self) -> Decimal {
        self.0
    }
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }
    /// `None` when the result would go below zero.
    pub fn checked_sub(self, other: Kg) -> Option<Kg> {
        let rest = self.0.checked_sub(other.0)?;
        (rest >= Decimal::ZERO).then_some(Kg(rest))
    }
    pub fn checked_add(self, other: Kg) -> Option<Kg> {
        self.0.checked_add(other.0).map(Kg)
    }
}

impl Money {
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }
    pub fn value(&self) -> Decimal {
        self.0
    }
    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }
    /// Price-per-kg times quantity. `None` on decimal overflow.
    pub fn times(self, quantity: Kg) -> Option<Money> {
        self.0.checked_mul(quantity.0).map(Money)
    }
}

impl From<u32> for Kg {
    fn from(value: u32) -> Self {
        Kg(Decimal::from(value))
    }
}

impl From<Decimal> for Kg {
    fn from(value: Decimal) -> Self {
        Kg(value)
    }
}

impl From<u32> for Money {
    fn from(value: u32) -> Self {
        Money(Decimal::from(value))
    }
}

impl From<Decimal> for Money {
    fn from(value: Decimal) -> Self {
        Money(value)
    }
}

impl FromStr for Kg {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s).map(Kg)
    }
}

impl FromStr for Money {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s).map(Money)
    }
}

impl fmt::Display for Kg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}kg", self.0.normalize())
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

// Decimals travel as their 16 byte serialized form.
fn encode_decimal<W: minicbor::encode::Write>(
    value: &Decimal,
    e: &mut minicbor::Encoder<W>,
) -> Result<(), minicbor::encode::Error<W::Error>> {
    e.bytes(&value.serialize())?.ok()
}

fn decode_decimal(d: &mut minicbor::Decoder<'_>) -> Result<Decimal, minicbor::decode::Error> {
    let raw: [u8; 16] = d
        .bytes()?
        .try_into()
        .map_err(|_| minicbor::decode::Error::message("decimal must be 16 bytes"))?;

    Ok(Decimal::deserialize(raw))
}

impl<C> minicbor::Encode<C> for Kg {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        encode_decimal(&self.0, e)
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Kg {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        decode_decimal(d).map(Kg)
    }
}

impl<C> minicbor::Encode<C> for Money {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        encode_decimal(&self.0, e)
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Money {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        decode_decimal(d).map(Money)
    }
}
