//! UDF/ECMA-167 timestamps (ECMA-167 §1.7.3): a type/timezone word, a
//! civil-calendar date/time, and a hundredths/microseconds tail giving
//! sub-second precision. Mirrors the raw/info split other on-disk date
//! fields in this workspace use, but UDF's richer layout is decoded eagerly
//! into `chrono` types rather than left packed.

use hadris_common::types::{
    endian::{Endian, LittleEndian},
    number::{U16, U32},
};

/// Raw on-disk `timestamp` (ECMA-167 §1.7.3), 12 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct UdfTimestamp {
    type_and_timezone: U16<LittleEndian>,
    year: U16<LittleEndian>,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
    centiseconds: u8,
    hundreds_of_microseconds: u8,
    microseconds: u8,
}

/// Timezone offset carried in a timestamp's low 12 bits, in 15-minute
/// increments from UTC, or "not specified".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timezone {
    Offset(i16),
    NotSpecified,
}

const TYPE_SHIFT: u16 = 12;
const TZ_MASK: u16 = 0x0FFF;
const TZ_NOT_SPECIFIED: u16 = 0x1000 & TZ_MASK;

impl UdfTimestamp {
    /// `timestamp.Type` is always 1 ("Local time") for volumes this crate
    /// writes.
    const LOCAL_TIME_TYPE: u16 = 1;

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        year: i16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        centiseconds: u8,
        timezone: Timezone,
    ) -> Self {
        let tz_bits = match timezone {
            Timezone::NotSpecified => TZ_NOT_SPECIFIED,
            Timezone::Offset(minutes_from_utc) => (minutes_from_utc as u16) & TZ_MASK,
        };
        Self {
            type_and_timezone: U16::new((Self::LOCAL_TIME_TYPE << TYPE_SHIFT) | tz_bits),
            year: U16::new(year as u16),
            month,
            day,
            hour,
            minute,
            second,
            centiseconds,
            hundreds_of_microseconds: 0,
            microseconds: 0,
        }
    }

    pub fn timezone(&self) -> Timezone {
        let raw = self.type_and_timezone.get() & TZ_MASK;
        if raw == TZ_NOT_SPECIFIED {
            Timezone::NotSpecified
        } else {
            // Sign-extend the 12-bit two's complement field.
            let signed = ((raw << 4) as i16) >> 4;
            Timezone::Offset(signed)
        }
    }

    pub fn year(&self) -> i16 {
        self.year.get() as i16
    }

    pub fn month(&self) -> u8 {
        self.month
    }

    pub fn day(&self) -> u8 {
        self.day
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    pub fn second(&self) -> u8 {
        self.second
    }

    /// Sub-second precision in microseconds, reassembled from the
    /// centiseconds/hundreds-of-microseconds/microseconds trio.
    pub fn subsecond_micros(&self) -> u32 {
        self.centiseconds as u32 * 10_000
            + self.hundreds_of_microseconds as u32 * 100
            + self.microseconds as u32
    }

    #[cfg(feature = "std")]
    pub fn to_chrono(&self) -> Option<chrono::NaiveDateTime> {
        use chrono::{NaiveDate, NaiveTime};
        let date = NaiveDate::from_ymd_opt(self.year() as i32, self.month() as u32, self.day() as u32)?;
        let time = NaiveTime::from_hms_micro_opt(
            self.hour() as u32,
            self.minute() as u32,
            self.second() as u32,
            self.subsecond_micros(),
        )?;
        Some(date.and_time(time))
    }

    #[cfg(feature = "std")]
    pub fn from_chrono(dt: &chrono::NaiveDateTime, timezone: Timezone) -> Self {
        use chrono::{Datelike, Timelike};
        let micros = dt.and_utc().timestamp_subsec_micros();
        Self::new(
            dt.year() as i16,
            dt.month() as u8,
            dt.day() as u8,
            dt.hour() as u8,
            dt.minute() as u8,
            dt.second() as u8,
            (micros / 10_000) as u8,
            timezone,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_timezone_round_trips() {
        let ts = UdfTimestamp::new(2024, 3, 14, 9, 26, 53, 58, Timezone::Offset(-300));
        assert_eq!(ts.timezone(), Timezone::Offset(-300));
        assert_eq!(ts.year(), 2024);
        assert_eq!(ts.month(), 3);
    }

    #[test]
    fn not_specified_timezone_round_trips() {
        let ts = UdfTimestamp::new(2000, 1, 1, 0, 0, 0, 0, Timezone::NotSpecified);
        assert_eq!(ts.timezone(), Timezone::NotSpecified);
    }

    #[cfg(feature = "std")]
    #[test]
    fn chrono_round_trip_preserves_date_and_time() {
        let ts = UdfTimestamp::new(2023, 11, 2, 15, 4, 5, 0, Timezone::Offset(0));
        let dt = ts.to_chrono().unwrap();
        let back = UdfTimestamp::from_chrono(&dt, Timezone::Offset(0));
        assert_eq!(ts.year(), back.year());
        assert_eq!(ts.hour(), back.hour());
    }
}
