//! Calendar months, the partition key for all stored data.

use std::{
    fmt,
    ops::{Add, Sub},
    str::FromStr,
};

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, Utc};
use snafu::prelude::*;

const SHORT_MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

const MAX_YEAR: i32 = 9999;
const MAX_ORDINAL: i64 = MAX_YEAR as i64 * 12 + 11;

/// Errors from parsing or combining months.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum MonthError {
    /// The text is neither `Mmm-yyyy` nor `yyyy-mm`.
    #[snafu(display("invalid month-in-year string \"{input}\""))]
    Malformed {
        /// The rejected text.
        input: String,
    },

    /// The month or year component is outside its range.
    #[snafu(display("month-in-year \"{input}\" is out of range"))]
    OutOfRange {
        /// The rejected text.
        input: String,
    },

    /// A period's start month comes after its stop month.
    #[snafu(display("{start} comes after {stop}"))]
    Reversed {
        /// First month of the requested period.
        start: MonthInYear,
        /// Last month of the requested period.
        stop: MonthInYear,
    },
}

/// A specific month in a specific year.
///
/// Ordered chronologically. The year is always within `0..=9999`; arithmetic
/// that would leave that range saturates at its ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonthInYear {
    year: i32,
    month: u32,
}

/// Length of a calendar period that evenly divides a year.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    /// Two months.
    Bimester = 2,
    /// Three months.
    Quarter = 3,
    /// Four months.
    Tertile = 4,
    /// Six months.
    Half = 6,
}

impl MonthInYear {
    /// Create a month from its year and 1-based month number.
    pub fn new(year: i32, month: u32) -> Result<Self, MonthError> {
        if !(0..=MAX_YEAR).contains(&year) || !(1..=12).contains(&month) {
            return OutOfRangeSnafu {
                input: format!("{year:04}-{month:02}"),
            }
            .fail();
        }
        Ok(Self { year, month })
    }

    /// The month containing the given instant.
    pub fn of(instant: DateTime<Utc>) -> Self {
        Self::from_ordinal(i64::from(instant.year()) * 12 + i64::from(instant.month0()))
    }

    /// Parse `Mmm-yyyy` using the English three-letter month abbreviation,
    /// matched case-insensitively (`Dec-2020`, `dec-2020`).
    pub fn parse_mmm_yyyy(input: &str) -> Result<Self, MonthError> {
        let malformed = || MalformedSnafu { input }.build();

        let (name, year) = input.split_once('-').ok_or_else(malformed)?;
        if name.len() != 3 || year.len() != 4 {
            return Err(malformed());
        }
        let name = name.to_ascii_lowercase();
        let month = SHORT_MONTHS
            .iter()
            .position(|m| *m == name)
            .ok_or_else(malformed)?;
        let year = parse_digits(year).ok_or_else(malformed)?;

        Self::new(year, month as u32 + 1).map_err(|_| OutOfRangeSnafu { input }.build())
    }

    /// Parse `yyyy-mm` (`2020-04`).
    pub fn parse_yyyy_mm(input: &str) -> Result<Self, MonthError> {
        if !Self::is_yyyy_mm(input) {
            return MalformedSnafu { input }.fail();
        }
        let year = parse_digits(&input[..4]).ok_or_else(|| MalformedSnafu { input }.build())?;
        let month = parse_digits(&input[5..]).ok_or_else(|| MalformedSnafu { input }.build())?;

        Self::new(year, month as u32).map_err(|_| OutOfRangeSnafu { input }.build())
    }

    /// True if `input` has the shape `yyyy-mm`. Does not check the ranges.
    pub fn is_yyyy_mm(input: &str) -> bool {
        let bytes = input.as_bytes();
        bytes.len() == 7
            && bytes[4] == b'-'
            && bytes[..4].iter().all(u8::is_ascii_digit)
            && bytes[5..].iter().all(u8::is_ascii_digit)
    }

    /// The year.
    pub fn year(self) -> i32 {
        self.year
    }

    /// The 1-based month number.
    pub fn month(self) -> u32 {
        self.month
    }

    /// Months since January of year 0. Used as a dense bucket id.
    pub fn index(self) -> u32 {
        // Year and month are bounded, so this always fits.
        (self.year as u32) * 12 + (self.month - 1)
    }

    /// Inverse of [`MonthInYear::index`].
    pub fn from_index(index: u32) -> Self {
        Self::from_ordinal(i64::from(index))
    }

    fn ordinal(self) -> i64 {
        i64::from(self.year) * 12 + i64::from(self.month - 1)
    }

    fn from_ordinal(ordinal: i64) -> Self {
        let ordinal = ordinal.clamp(0, MAX_ORDINAL);
        Self {
            year: (ordinal / 12) as i32,
            month: (ordinal % 12) as u32 + 1,
        }
    }

    /// The following month.
    pub fn next(self) -> Self {
        self + 1
    }

    /// The preceding month.
    pub fn previous(self) -> Self {
        self - 1
    }

    /// Number of days in this month.
    pub fn days(self) -> u32 {
        let this = self.first_day();
        let next = self.next().first_day();
        if next <= this {
            // Only the saturated last month lands here.
            return 31;
        }
        (next - this).num_days() as u32
    }

    fn first_day(self) -> NaiveDate {
        // Valid by construction.
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or_default()
    }

    /// First instant of the month, in UTC.
    pub fn start(self) -> DateTime<Utc> {
        self.first_day().and_time(chrono::NaiveTime::MIN).and_utc()
    }

    /// Last representable instant of the month, in UTC.
    pub fn stop(self) -> DateTime<Utc> {
        self.next().start() - TimeDelta::nanoseconds(1)
    }

    /// First month of the period containing this month. With `next` set and
    /// this month not already opening a period, the first month of the
    /// following period instead.
    pub fn start_of_period(self, period: Period, next: bool) -> Self {
        let months = period as i64;
        let overage = i64::from(self.month - 1) % months;
        if overage == 0 {
            return self;
        }
        let shift = if next { months - overage } else { -overage };
        Self::from_ordinal(self.ordinal() + shift)
    }
}

fn parse_digits(text: &str) -> Option<i32> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

/// First and last instants of the months `start..=stop`.
pub fn monthly_period(
    start: MonthInYear,
    stop: MonthInYear,
) -> Result<(DateTime<Utc>, DateTime<Utc>), MonthError> {
    ensure!(start <= stop, ReversedSnafu { start, stop });
    Ok((start.start(), stop.stop()))
}

impl fmt::Display for MonthInYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for MonthInYear {
    type Err = MonthError;

    /// Accepts both `yyyy-mm` and `Mmm-yyyy`.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.len() {
            7 => Self::parse_yyyy_mm(input),
            8 => Self::parse_mmm_yyyy(input),
            _ => MalformedSnafu { input }.fail(),
        }
    }
}

impl Add<i32> for MonthInYear {
    type Output = MonthInYear;

    fn add(self, months: i32) -> MonthInYear {
        Self::from_ordinal(self.ordinal() + i64::from(months))
    }
}

impl Sub<i32> for MonthInYear {
    type Output = MonthInYear;

    fn sub(self, months: i32) -> MonthInYear {
        Self::from_ordinal(self.ordinal() - i64::from(months))
    }
}

/// Number of months from `other` to `self`.
impl Sub<MonthInYear> for MonthInYear {
    type Output = i32;

    fn sub(self, other: MonthInYear) -> i32 {
        (self.ordinal() - other.ordinal()) as i32
    }
}
