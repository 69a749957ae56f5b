//! Columnar encoding of enriched records.

use std::sync::Arc;

use arrow::{
    array::{
        ArrayRef, BooleanBuilder, Float64Builder, Int16Builder, Int32Builder, StringBuilder,
        TimestampNanosecondBuilder,
    },
    error::ArrowError,
    record_batch::RecordBatch,
};

use crate::{
    label::{Categorical, ContentType, HttpMethod, HttpProtocol, HttpScheme, StatusClass},
    record::{AgentInfo, EnrichedRecord},
};

use super::{categorical_array, log_schema};

fn text<'a>(
    records: &'a [EnrichedRecord],
    value: impl Fn(&'a EnrichedRecord) -> Option<&'a str>,
) -> ArrayRef {
    let mut builder = StringBuilder::new();
    for record in records {
        builder.append_option(value(record));
    }
    Arc::new(builder.finish())
}

fn agent_text(
    records: &[EnrichedRecord],
    value: impl Fn(&AgentInfo) -> &str,
) -> ArrayRef {
    let mut builder = StringBuilder::new();
    for record in records {
        builder.append_option(record.agent.as_ref().map(|a| value(a)));
    }
    Arc::new(builder.finish())
}

fn categorical<T: Categorical>(
    records: &[EnrichedRecord],
    value: impl Fn(&EnrichedRecord) -> Option<T>,
) -> Result<ArrayRef, ArrowError> {
    let codes = records
        .iter()
        .map(|r| value(r).and_then(|v| i8::try_from(v.code()).ok()))
        .collect();
    categorical_array(T::LABELS, codes)
}

fn float(records: &[EnrichedRecord], value: impl Fn(&EnrichedRecord) -> Option<f64>) -> ArrayRef {
    let mut builder = Float64Builder::with_capacity(records.len());
    for record in records {
        builder.append_option(value(record));
    }
    Arc::new(builder.finish())
}

fn flag(records: &[EnrichedRecord], value: impl Fn(&EnrichedRecord) -> bool) -> ArrayRef {
    let mut builder = BooleanBuilder::with_capacity(records.len());
    for record in records {
        builder.append_value(value(record));
    }
    Arc::new(builder.finish())
}

fn timestamps(records: &[EnrichedRecord]) -> Result<ArrayRef, ArrowError> {
    let mut builder = TimestampNanosecondBuilder::with_capacity(records.len()).with_timezone("UTC");
    for record in records {
        let nanos = record.log.timestamp.timestamp_nanos_opt().ok_or_else(|| {
            ArrowError::InvalidArgumentError(format!(
                "timestamp {} is outside the nanosecond range",
                record.log.timestamp
            ))
        })?;
        builder.append_value(nanos);
    }
    Ok(Arc::new(builder.finish()))
}

/// Encode `records` as one table with the canonical schema, in record order.
pub fn to_record_batch(records: &[EnrichedRecord]) -> Result<RecordBatch, ArrowError> {
    let mut status = Int16Builder::with_capacity(records.len());
    let mut size = Int32Builder::with_capacity(records.len());
    for record in records {
        status.append_value(record.log.status);
        size.append_value(record.log.size);
    }

    let columns: Vec<ArrayRef> = vec![
        text(records, |r| Some(r.log.client_address.as_str())),
        timestamps(records)?,
        categorical::<HttpMethod>(records, |r| Some(r.log.method))?,
        text(records, |r| Some(r.log.path.as_str())),
        text(records, |r| r.log.query.as_deref()),
        text(records, |r| r.log.fragment.as_deref()),
        categorical::<HttpProtocol>(records, |r| Some(r.log.protocol))?,
        Arc::new(status.finish()),
        Arc::new(size.finish()),
        text(records, |r| r.log.referrer.as_deref()),
        text(records, |r| r.log.user_agent.as_deref()),
        text(records, |r| r.log.server_name.as_deref()),
        text(records, |r| r.log.server_address.as_deref()),
        categorical::<ContentType>(records, |r| Some(r.log.content_type))?,
        text(records, |r| Some(r.log.cool_path.as_str())),
        categorical::<HttpScheme>(records, |r| r.log.referrer_scheme)?,
        text(records, |r| r.log.referrer_host.as_deref()),
        text(records, |r| r.log.referrer_path.as_deref()),
        text(records, |r| r.log.referrer_query.as_deref()),
        text(records, |r| r.log.referrer_fragment.as_deref()),
        categorical::<StatusClass>(records, |r| Some(r.log.status_class))?,
        text(records, |r| r.client_name.as_deref()),
        float(records, |r| r.location.latitude),
        float(records, |r| r.location.longitude),
        text(records, |r| r.location.city.as_deref()),
        text(records, |r| r.location.country.as_deref()),
        agent_text(records, |a| a.agent_family.as_str()),
        agent_text(records, |a| a.agent_version.as_str()),
        agent_text(records, |a| a.os_family.as_str()),
        agent_text(records, |a| a.os_version.as_str()),
        agent_text(records, |a| a.device_family.as_str()),
        agent_text(records, |a| a.device_brand.as_str()),
        agent_text(records, |a| a.device_model.as_str()),
        flag(records, EnrichedRecord::is_bot),
        flag(records, |r| r.is_bot2),
    ];

    RecordBatch::try_new(log_schema(), columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{enrich::tests::record, schema::validate};
    use arrow::array::{Array, AsArray};

    #[test]
    fn encodes_every_record_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let mut first = record("1.1.1.1", Some("LinkedInBot"));
        first.client_name = Some("one.one.one.one".into());
        first.agent = Some(AgentInfo {
            agent_family: "Chrome".into(),
            is_bot: true,
            ..AgentInfo::default()
        });
        let second = record("2.2.2.2", None);

        let batch = to_record_batch(&[first, second])?;
        validate(&batch)?;
        assert_eq!(batch.num_rows(), 2);

        let names = batch
            .column_by_name("client_name")
            .and_then(|c| c.as_string_opt::<i32>())
            .ok_or("client_name")?;
        assert_eq!(names.value(0), "one.one.one.one");
        assert!(names.is_null(1));

        let is_bot = batch
            .column_by_name("is_bot")
            .and_then(|c| c.as_boolean_opt())
            .ok_or("is_bot")?;
        assert!(is_bot.value(0));
        assert!(!is_bot.value(1));

        let family = batch.column_by_name("agent_family").ok_or("agent_family")?;
        assert!(family.is_null(1));
        Ok(())
    }

    #[test]
    fn empty_input_gives_empty_table() -> Result<(), Box<dyn std::error::Error>> {
        let batch = to_record_batch(&[])?;
        assert_eq!(batch.num_rows(), 0);
        validate(&batch)?;
        Ok(())
    }
}
