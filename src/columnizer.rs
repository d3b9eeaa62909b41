//! Splitting log lines into columns and extracting their timestamps.
//!
//! Column-restricted filters test only a subset of the columns a columnizer
//! produces; time synchronization uses the timestamp a columnizer derives.

use std::sync::Arc;

use chrono::NaiveDateTime;

/// Accepted layouts for the leading timestamp of a line
const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Length of `YYYY-MM-DD HH:MM:SS`
const TIMESTAMP_MIN_LEN: usize = 19;

/// Splits a line into columns and derives its timestamp
pub trait Columnizer: Send + Sync {
    /// Name used to find the columnizer again when a view is restored
    fn name(&self) -> &str;

    /// Split a line into its columns
    fn split<'a>(&self, line: &'a str) -> Vec<&'a str>;

    /// Timestamp of the line, if it carries one
    fn timestamp(&self, line: &str) -> Option<NaiveDateTime>;
}

/// Treats the whole line as one column without a timestamp
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainColumnizer;

impl Columnizer for PlainColumnizer {
    fn name(&self) -> &str {
        "plain"
    }

    fn split<'a>(&self, line: &'a str) -> Vec<&'a str> {
        vec![line]
    }

    fn timestamp(&self, _line: &str) -> Option<NaiveDateTime> {
        None
    }
}

/// Splits on a single delimiter character (CSV-ish, tab-separated, ...)
#[derive(Clone, Debug)]
pub struct DelimitedColumnizer {
    delimiter: char,
    name: String,
}

impl DelimitedColumnizer {
    pub fn new(delimiter: char) -> Self {
        let name = match delimiter {
            '\t' => "tab".to_string(),
            ',' => "csv".to_string(),
            other => format!("delimited:{}", other),
        };
        Self { delimiter, name }
    }
}

impl Columnizer for DelimitedColumnizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn split<'a>(&self, line: &'a str) -> Vec<&'a str> {
        line.split(self.delimiter).collect()
    }

    fn timestamp(&self, _line: &str) -> Option<NaiveDateTime> {
        None
    }
}

/// Lines starting with `YYYY-MM-DD HH:MM:SS[.fff]`.
///
/// Columns are date, time and the remaining message. Lines that do not start
/// with a timestamp become a single message column.
#[derive(Clone, Copy, Debug, Default)]
pub struct TimestampColumnizer;

impl TimestampColumnizer {
    /// Byte length of the leading timestamp, if present
    fn timestamp_prefix(line: &str) -> Option<(usize, NaiveDateTime)> {
        if line.len() < TIMESTAMP_MIN_LEN || !line.is_char_boundary(TIMESTAMP_MIN_LEN) {
            return None;
        }
        // Extend over fractional seconds
        let bytes = line.as_bytes();
        let mut end = TIMESTAMP_MIN_LEN;
        if bytes.get(end) == Some(&b'.') || bytes.get(end) == Some(&b',') {
            end += 1;
            while bytes.get(end).is_some_and(|b| b.is_ascii_digit()) {
                end += 1;
            }
        }
        let candidate = line[..end].replace(',', ".");
        TIMESTAMP_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(&candidate, fmt).ok())
            .map(|ts| (end, ts))
    }
}

impl Columnizer for TimestampColumnizer {
    fn name(&self) -> &str {
        "timestamp"
    }

    fn split<'a>(&self, line: &'a str) -> Vec<&'a str> {
        match Self::timestamp_prefix(line) {
            Some((end, _)) => {
                let date = &line[..10];
                let time = &line[11..end];
                let rest = line[end..].trim_start();
                vec![date, time, rest]
            }
            None => vec![line],
        }
    }

    fn timestamp(&self, line: &str) -> Option<NaiveDateTime> {
        Self::timestamp_prefix(line).map(|(_, ts)| ts)
    }
}

/// Find a built-in columnizer by the name it reports
pub fn columnizer_by_name(name: &str) -> Option<Arc<dyn Columnizer>> {
    match name {
        "plain" => Some(Arc::new(PlainColumnizer)),
        "timestamp" => Some(Arc::new(TimestampColumnizer)),
        "tab" => Some(Arc::new(DelimitedColumnizer::new('\t'))),
        "csv" => Some(Arc::new(DelimitedColumnizer::new(','))),
        _ => {
            let delimiter = name.strip_prefix("delimited:")?;
            let mut chars = delimiter.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Some(Arc::new(DelimitedColumnizer::new(c))),
                _ => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_plain_is_single_column() {
        assert_eq!(PlainColumnizer.split("a b c"), vec!["a b c"]);
        assert!(PlainColumnizer.timestamp("2024-01-01 00:00:00").is_none());
    }

    #[test]
    fn test_delimited_split() {
        let csv = DelimitedColumnizer::new(',');
        assert_eq!(csv.split("a,b,,c"), vec!["a", "b", "", "c"]);
        assert_eq!(csv.name(), "csv");
    }

    #[test]
    fn test_timestamp_columns() {
        let line = "2024-03-05 12:30:45.123 ERROR something broke";
        let cols = TimestampColumnizer.split(line);
        assert_eq!(cols, vec!["2024-03-05", "12:30:45.123", "ERROR something broke"]);

        let expected = NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_milli_opt(12, 30, 45, 123)
            .unwrap();
        assert_eq!(TimestampColumnizer.timestamp(line), Some(expected));
    }

    #[test]
    fn test_timestamp_with_comma_millis_and_t_separator() {
        let a = TimestampColumnizer.timestamp("2024-03-05 12:30:45,500 x");
        let b = TimestampColumnizer.timestamp("2024-03-05T12:30:45.500 x");
        assert!(a.is_some());
        assert_eq!(a, b);
    }

    #[test]
    fn test_line_without_timestamp() {
        assert!(TimestampColumnizer.timestamp("    at com.example.Foo").is_none());
        assert_eq!(TimestampColumnizer.split("short"), vec!["short"]);
    }

    #[test]
    fn test_lookup_by_name() {
        assert_eq!(columnizer_by_name("timestamp").unwrap().name(), "timestamp");
        assert_eq!(columnizer_by_name("delimited:|").unwrap().name(), "delimited:|");
        assert!(columnizer_by_name("delimited:ab").is_none());
        assert!(columnizer_by_name("nope").is_none());
    }
}
