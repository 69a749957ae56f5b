//! Filtering and counting over a master table.
//!
//! An [`Analysis`] holds a table plus a list of row filters that is only
//! evaluated when a result is requested. Results are either a number of
//! requests or a [`Tally`] of counts per key.
//!
//! ```no_run
//! # use analog_core::analysis::Analysis;
//! # fn page_views(table: arrow::record_batch::RecordBatch) -> Result<(), Box<dyn std::error::Error>> {
//! let views = Analysis::new(table).successful().get().markup().humans().monthly_requests()?;
//! for (month, count) in views.iter() {
//!     println!("{month}  {count}");
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;

use arrow::{
    array::{Array, ArrayRef, AsArray, BooleanArray},
    compute::{cast, filter_record_batch},
    datatypes::{DataType, TimestampNanosecondType},
    record_batch::RecordBatch,
};
use chrono::{DateTime, Utc};
use snafu::prelude::*;

use crate::{
    label::{Categorical, ContentType, HttpMethod, StatusClass},
    month::MonthInYear,
    schema::{AssembleSnafu, CastSnafu, MissingColumnsSnafu, SchemaResult, TypeMismatchSnafu},
};

/// Requests per month of `table`, read from its `timestamp` column.
pub fn requests_per_month(table: &RecordBatch) -> SchemaResult<BTreeMap<MonthInYear, u64>> {
    let mut counts = BTreeMap::new();
    let timestamps = timestamp_column(table)?;
    for nanos in timestamps.iter().flatten() {
        let month = MonthInYear::of(DateTime::<Utc>::from_timestamp_nanos(nanos));
        *counts.entry(month).or_insert(0) += 1;
    }
    Ok(counts)
}

fn column<'a>(table: &'a RecordBatch, name: &str) -> SchemaResult<&'a ArrayRef> {
    table.column_by_name(name).context(MissingColumnsSnafu {
        columns: vec![name.to_string()],
    })
}

fn timestamp_column(
    table: &RecordBatch,
) -> SchemaResult<&arrow::array::PrimitiveArray<TimestampNanosecondType>> {
    let array = column(table, "timestamp")?;
    array
        .as_primitive_opt::<TimestampNanosecondType>()
        .with_context(|| TypeMismatchSnafu {
            column: "timestamp",
            expected: DataType::Timestamp(arrow::datatypes::TimeUnit::Nanosecond, Some("UTC".into())),
            actual: array.data_type().clone(),
        })
}

fn bool_column<'a>(table: &'a RecordBatch, name: &str) -> SchemaResult<&'a BooleanArray> {
    let array = column(table, name)?;
    array.as_boolean_opt().with_context(|| TypeMismatchSnafu {
        column: name,
        expected: DataType::Boolean,
        actual: array.data_type().clone(),
    })
}

/// One row predicate.
#[derive(Debug, Clone, PartialEq)]
enum Filter {
    Label {
        column: &'static str,
        label: &'static str,
    },
    Humans,
    Bots,
    Range {
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    },
}

impl Filter {
    fn label<T: Categorical>(column: &'static str, value: T) -> Self {
        Filter::Label {
            column,
            label: value.as_str(),
        }
    }

    fn mask(&self, table: &RecordBatch) -> SchemaResult<Vec<bool>> {
        match self {
            Filter::Label { column: name, label } => {
                let text = cast(column(table, name)?, &DataType::Utf8)
                    .context(CastSnafu { column: *name })?;
                let text = text.as_string::<i32>();
                Ok(text.iter().map(|v| v == Some(*label)).collect())
            }
            Filter::Humans | Filter::Bots => {
                let is_bot = bool_column(table, "is_bot")?;
                let is_bot2 = bool_column(table, "is_bot2")?;
                let wants_bots = matches!(self, Filter::Bots);
                Ok((0..table.num_rows())
                    .map(|i| {
                        let bot = (is_bot.is_valid(i) && is_bot.value(i))
                            || (is_bot2.is_valid(i) && is_bot2.value(i));
                        bot == wants_bots
                    })
                    .collect())
            }
            Filter::Range { start, stop } => {
                let start = start.timestamp_nanos_opt().unwrap_or(i64::MIN);
                let stop = stop.timestamp_nanos_opt().unwrap_or(i64::MAX);
                Ok(timestamp_column(table)?
                    .iter()
                    .map(|ts| ts.is_some_and(|ts| start <= ts && ts <= stop))
                    .collect())
            }
        }
    }
}

/// A table with a pending selection of rows.
#[derive(Debug, Clone)]
pub struct Analysis {
    table: RecordBatch,
    filters: Vec<Filter>,
}

impl Analysis {
    /// Start with all rows of `table`.
    pub fn new(table: RecordBatch) -> Self {
        Self {
            table,
            filters: Vec::new(),
        }
    }

    fn with(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Only requests with a 2xx status.
    pub fn successful(self) -> Self {
        self.status(StatusClass::Successful)
    }

    /// Only requests whose status falls into `class`.
    pub fn status(self, class: StatusClass) -> Self {
        self.with(Filter::label("status_class", class))
    }

    /// Only GET requests.
    pub fn get(self) -> Self {
        self.method(HttpMethod::Get)
    }

    /// Only POST requests.
    pub fn post(self) -> Self {
        self.method(HttpMethod::Post)
    }

    /// Only requests using `method`.
    pub fn method(self, method: HttpMethod) -> Self {
        self.with(Filter::label("method", method))
    }

    /// Only requests for pages.
    pub fn markup(self) -> Self {
        self.content_type(ContentType::Markup)
    }

    /// Only requests for resources of `content_type`.
    pub fn content_type(self, content_type: ContentType) -> Self {
        self.with(Filter::label("content_type", content_type))
    }

    /// Only requests that neither bot signal flags.
    pub fn humans(self) -> Self {
        self.with(Filter::Humans)
    }

    /// Only requests that either bot signal flags.
    pub fn bots(self) -> Self {
        self.with(Filter::Bots)
    }

    /// Only requests made between `start` and `stop`, both inclusive.
    pub fn range(self, start: DateTime<Utc>, stop: DateTime<Utc>) -> Self {
        self.with(Filter::Range { start, stop })
    }

    /// Only requests made during the months `begin..=end`.
    pub fn months(self, begin: MonthInYear, end: MonthInYear) -> Self {
        self.range(begin.start(), end.stop())
    }

    /// Evaluate the filters and return the selected rows.
    pub fn selected(&self) -> SchemaResult<RecordBatch> {
        if self.filters.is_empty() {
            return Ok(self.table.clone());
        }
        let mut keep = vec![true; self.table.num_rows()];
        for filter in &self.filters {
            for (row, hit) in keep.iter_mut().zip(filter.mask(&self.table)?) {
                *row &= hit;
            }
        }
        filter_record_batch(&self.table, &BooleanArray::from(keep)).context(AssembleSnafu)
    }

    /// Number of selected requests.
    pub fn requests(&self) -> SchemaResult<u64> {
        Ok(self.selected()?.num_rows() as u64)
    }

    /// Selected requests per month.
    pub fn monthly_requests(&self) -> SchemaResult<Tally<MonthInYear>> {
        Ok(Tally::from(requests_per_month(&self.selected()?)?))
    }

    /// Selected requests per distinct non-null value of `column`.
    pub fn value_counts(&self, name: &str) -> SchemaResult<Tally<String>> {
        let selected = self.selected()?;
        let text = cast(column(&selected, name)?, &DataType::Utf8)
            .context(CastSnafu { column: name })?;
        let mut counts = BTreeMap::new();
        for value in text.as_string::<i32>().iter().flatten() {
            *counts.entry(value.to_string()).or_insert(0) += 1;
        }
        Ok(Tally::from(counts))
    }

    /// Append the number of selected requests to `counts`.
    pub fn count_rows(self, counts: &mut RowCounts) -> SchemaResult<Self> {
        counts.push(self.requests()?);
        Ok(self)
    }
}

/// Counts keyed by month or by label, in key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tally<K: Ord> {
    counts: BTreeMap<K, u64>,
}

impl<K: Ord> From<BTreeMap<K, u64>> for Tally<K> {
    fn from(counts: BTreeMap<K, u64>) -> Self {
        Self { counts }
    }
}

impl<K: Ord> Tally<K> {
    /// Count for `key`; zero if absent.
    pub fn get(&self, key: &K) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Keys and counts in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, u64)> {
        self.counts.iter().map(|(k, v)| (k, *v))
    }

    /// Entries sorted by descending count, ties in key order.
    pub fn most_common(&self) -> Vec<(&K, u64)> {
        let mut entries: Vec<_> = self.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries
    }

    /// Sum of all counts.
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// True if nothing was counted.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Row counts collected along a chain of filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowCounts {
    counts: Vec<u64>,
}

impl RowCounts {
    /// Empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one count.
    pub fn push(&mut self, count: u64) {
        self.counts.push(count);
    }

    /// Counts in the order they were taken.
    pub fn as_slice(&self) -> &[u64] {
        &self.counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        enrich::tests::record,
        label::StatusClass,
        record::{AgentInfo, EnrichedRecord},
        schema::to_record_batch,
    };
    use chrono::TimeZone;

    fn at(mut record: EnrichedRecord, month: u32) -> EnrichedRecord {
        record.log.timestamp = Utc.with_ymd_and_hms(2023, month, 15, 12, 0, 0).unwrap();
        record
    }

    fn table() -> RecordBatch {
        let human = || record("1.1.1.1", Some("Mozilla/5.0"));
        let mut crawler = record("2.2.2.2", Some("Googlebot"));
        crawler.agent = Some(AgentInfo {
            is_bot: true,
            ..AgentInfo::default()
        });
        let mut listed = record("3.3.3.3", Some("LinkedInBot"));
        listed.is_bot2 = true;
        let mut missing = human();
        missing.log.status = 404;
        missing.log.status_class = StatusClass::ClientError;
        let mut image = human();
        image.log.path = "/logo.png".into();
        image.log.content_type = ContentType::Image;
        let mut posted = human();
        posted.log.method = HttpMethod::Post;

        let mut records = vec![
            at(human(), 1),
            at(human(), 1),
            at(human(), 2),
            at(crawler, 1),
            at(listed, 2),
            at(missing, 2),
            at(image, 2),
            at(posted, 2),
        ];
        for r in &mut records {
            if r.agent.is_none() {
                r.agent = Some(AgentInfo::default());
            }
        }
        to_record_batch(&records).expect("records convert")
    }

    #[test]
    fn filters_compose() -> SchemaResult<()> {
        let all = Analysis::new(table());
        assert_eq!(all.requests()?, 8);
        assert_eq!(all.clone().bots().requests()?, 2);
        assert_eq!(all.clone().humans().requests()?, 6);
        assert_eq!(all.clone().post().requests()?, 1);
        assert_eq!(all.clone().status(StatusClass::ClientError).requests()?, 1);

        let views = all.successful().get().markup().humans();
        assert_eq!(views.requests()?, 3);
        let monthly = views.monthly_requests()?;
        let jan = MonthInYear::new(2023, 1).expect("valid");
        let feb = MonthInYear::new(2023, 2).expect("valid");
        assert_eq!(monthly.get(&jan), 2);
        assert_eq!(monthly.get(&feb), 1);
        assert_eq!(monthly.total(), 3);
        Ok(())
    }

    #[test]
    fn range_and_value_counts() -> SchemaResult<()> {
        let feb = MonthInYear::new(2023, 2).expect("valid");
        let february = Analysis::new(table()).months(feb, feb);
        assert_eq!(february.requests()?, 5);

        let types = february.value_counts("content_type")?;
        assert_eq!(types.get(&"MARKUP".to_string()), 4);
        assert_eq!(types.get(&"IMAGE".to_string()), 1);
        assert_eq!(types.most_common()[0].0, "MARKUP");
        assert_eq!(types.len(), 2);
        Ok(())
    }

    #[test]
    fn count_rows_uses_explicit_accumulator() -> SchemaResult<()> {
        let mut counts = RowCounts::new();
        Analysis::new(table())
            .count_rows(&mut counts)?
            .humans()
            .count_rows(&mut counts)?
            .markup()
            .count_rows(&mut counts)?;
        assert_eq!(counts.as_slice(), &[8, 6, 5]);
        Ok(())
    }

    #[test]
    fn unknown_columns_are_errors() {
        let err = Analysis::new(table())
            .value_counts("no_such_column")
            .expect_err("unknown column");
        assert!(err.to_string().contains("no_such_column"));
    }
}
