//! Source descriptors: what to watch and where its lines go.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::format::{Item, Numeric, StrftimeItems};
use chrono::{DateTime, Local, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a [`Collector`]'s path turns into a file name.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Style {
    /// The path is used literally.
    File,
    /// The path is a `strftime` template naming one file per local day.
    Date,
    /// Anything else found in the configuration. Never started.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for Style {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Style::File => "File",
            Style::Date => "Date",
            Style::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollectorError {
    #[error("collector for {0} has an unrecognized style")]
    UnknownStyle(String),
    #[error("collector path {0} is not a valid date pattern")]
    MalformedPattern(String),
    #[error("collector path {0} has no day token such as %d or %F")]
    MissingDateToken(String),
}

/// Describes one file to watch and the topic its lines are sent to.
///
/// Collectors are plain values: two are equal iff style, path and topic are
/// equal.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Collector {
    pub style: Style,
    pub path: String,
    pub topic: String,
}

/// A collector's file name for a given moment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Resolved {
    pub file: PathBuf,
    /// Time left until the name changes, for `Date` collectors.
    pub cycle: Option<Duration>,
}

impl Collector {
    pub fn new(style: Style, path: impl Into<String>, topic: impl Into<String>) -> Self {
        Collector {
            style,
            path: path.into(),
            topic: topic.into(),
        }
    }

    pub fn file(path: impl Into<String>, topic: impl Into<String>) -> Self {
        Collector::new(Style::File, path, topic)
    }

    pub fn date(path: impl Into<String>, topic: impl Into<String>) -> Self {
        Collector::new(Style::Date, path, topic)
    }

    /// Parses a configuration value: a JSON array of collectors.
    pub fn parse_list(bytes: &[u8]) -> serde_json::Result<Vec<Collector>> {
        serde_json::from_slice(bytes)
    }

    /// Works out which file to follow at `now`.
    pub fn resolve(&self, now: DateTime<Local>) -> Result<Resolved, CollectorError> {
        match self.style {
            Style::File => Ok(Resolved {
                file: PathBuf::from(&self.path),
                cycle: None,
            }),
            Style::Date => {
                let items = date_items(&self.path)?;
                let file = now.format_with_items(items.into_iter()).to_string();

                Ok(Resolved {
                    file: PathBuf::from(file),
                    cycle: Some(until_midnight(now)),
                })
            }
            Style::Unknown => Err(CollectorError::UnknownStyle(self.path.clone())),
        }
    }
}

impl fmt::Display for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} -> {}", self.style, self.path, self.topic)
    }
}

/// Parses a date template, requiring at least one token that changes every
/// day.
fn date_items(pattern: &str) -> Result<Vec<Item<'_>>, CollectorError> {
    let items: Vec<Item<'_>> = StrftimeItems::new(pattern).collect();

    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(CollectorError::MalformedPattern(pattern.to_string()));
    }

    // Composite specifiers (%F, %D, %x) are expanded by the parser, so they
    // show up here as their numeric parts.
    let has_day = items
        .iter()
        .any(|item| matches!(item, Item::Numeric(Numeric::Day | Numeric::Ordinal, _)));

    if !has_day {
        return Err(CollectorError::MissingDateToken(pattern.to_string()));
    }

    Ok(items)
}

/// Time from `now` to the next local midnight. Falls back to 24 hours around
/// DST gaps where midnight does not exist.
fn until_midnight(now: DateTime<Local>) -> Duration {
    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    now.date_naive()
        .succ_opt()
        .map(|tomorrow| tomorrow.and_time(NaiveTime::MIN))
        .and_then(|midnight| midnight.and_local_timezone(Local).earliest())
        .and_then(|midnight| (midnight - now).to_std().ok())
        .unwrap_or(DAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, h, min, 0).single().unwrap()
    }

    #[test]
    fn test_equality_is_by_value() {
        let a = Collector::file("/var/log/a.log", "a");
        assert_eq!(a, Collector::file("/var/log/a.log", "a"));
        assert_ne!(a, Collector::file("/var/log/a.log", "b"));
        assert_ne!(a, Collector::date("/var/log/a.log", "a"));
    }

    #[test]
    fn test_parse_list() {
        let raw = br#"[
            {"style": "File", "path": "/var/log/a.log", "topic": "a"},
            {"style": "Date", "path": "/var/log/b-%Y-%m-%d.log", "topic": "b"},
            {"style": "Weekly", "path": "/var/log/c.log", "topic": "c"}
        ]"#;

        let list = Collector::parse_list(raw).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0], Collector::file("/var/log/a.log", "a"));
        assert_eq!(list[1].style, Style::Date);
        assert_eq!(list[2].style, Style::Unknown);
    }

    #[test]
    fn test_serializes_like_the_config_store() {
        let json = serde_json::to_string(&Collector::file("/a.log", "t")).unwrap();
        assert_eq!(json, r#"{"style":"File","path":"/a.log","topic":"t"}"#);
    }

    #[test]
    fn test_file_resolves_literally() {
        let resolved = Collector::file("/var/log/%d.log", "t")
            .resolve(at(2024, 3, 9, 12, 0))
            .unwrap();
        assert_eq!(resolved.file, PathBuf::from("/var/log/%d.log"));
        assert_eq!(resolved.cycle, None);
    }

    #[test]
    fn test_date_resolves_to_today() {
        let resolved = Collector::date("/var/log/app-%Y-%m-%d.log", "t")
            .resolve(at(2024, 3, 9, 18, 0))
            .unwrap();
        assert_eq!(resolved.file, PathBuf::from("/var/log/app-2024-03-09.log"));
        assert_eq!(resolved.cycle, Some(Duration::from_secs(6 * 60 * 60)));
    }

    #[test]
    fn test_date_accepts_composite_day_tokens() {
        let resolved = Collector::date("/var/log/app-%F.log", "t")
            .resolve(at(2024, 3, 9, 23, 30))
            .unwrap();
        assert_eq!(resolved.file, PathBuf::from("/var/log/app-2024-03-09.log"));
        assert_eq!(resolved.cycle, Some(Duration::from_secs(30 * 60)));
    }

    #[test]
    fn test_date_without_token_is_rejected() {
        let err = Collector::date("/var/log/app.log", "t")
            .resolve(Local::now())
            .unwrap_err();
        assert_eq!(
            err,
            CollectorError::MissingDateToken("/var/log/app.log".to_string())
        );

        let err = Collector::date("/var/log/app-%Y-%m.log", "t")
            .resolve(Local::now())
            .unwrap_err();
        assert!(matches!(err, CollectorError::MissingDateToken(_)));
    }

    #[test]
    fn test_malformed_pattern_is_rejected() {
        let err = Collector::date("/var/log/app-%Q-%d.log", "t")
            .resolve(Local::now())
            .unwrap_err();
        assert!(matches!(err, CollectorError::MalformedPattern(_)));
    }

    #[test]
    fn test_unknown_style_is_rejected() {
        let collector = Collector::new(Style::Unknown, "/var/log/a.log", "t");
        assert_eq!(
            collector.resolve(Local::now()).unwrap_err(),
            CollectorError::UnknownStyle("/var/log/a.log".to_string())
        );
    }
}
