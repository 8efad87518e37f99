//! Core domain model for RASFF alert ingestion: periods, canonical records
//! and classification pairs.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const CRATE_NAME: &str = "rasff-core";

/// Label used for both halves of a classification pair when a term is unknown.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// One weekly bulletin slot: ISO week-year plus ISO week number.
///
/// Always holds a week that exists in its year (1..=52 or 1..=53).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    year: i32,
    week: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeriodError {
    #[error("week {week} does not exist in ISO year {year}")]
    InvalidWeek { year: i32, week: u32 },
    #[error("cannot parse period {0:?}; expected YYYY-Www or YYYY-ww")]
    Unparseable(String),
}

impl Period {
    pub fn new(year: i32, week: u32) -> Result<Self, PeriodError> {
        if week == 0 || NaiveDate::from_isoywd_opt(year, week, Weekday::Mon).is_none() {
            return Err(PeriodError::InvalidWeek { year, week });
        }
        Ok(Self { year, week })
    }

    /// Week 1 exists in every ISO year.
    pub const fn first_week(year: i32) -> Self {
        Self { year, week: 1 }
    }

    /// The ISO week containing `date`. Early-January dates can belong to the
    /// previous ISO year and late-December dates to the next one.
    pub fn containing(date: NaiveDate) -> Self {
        let iso = date.iso_week();
        Self {
            year: iso.year(),
            week: iso.week(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn week(&self) -> u32 {
        self.week
    }

    /// Last two digits of the year, as used in bulletin URLs.
    pub fn short_year(&self) -> u32 {
        self.year.rem_euclid(100) as u32
    }

    pub fn monday(&self) -> NaiveDate {
        NaiveDate::from_isoywd_opt(self.year, self.week, Weekday::Mon)
            .expect("period always holds a valid ISO week")
    }

    pub fn next(&self) -> Self {
        Self::containing(self.monday() + Duration::weeks(1))
    }

    /// 52 or 53, depending on whether December 28th falls in week 53.
    pub fn weeks_in_year(year: i32) -> u32 {
        NaiveDate::from_ymd_opt(year, 12, 28)
            .map(|d| d.iso_week().week())
            .unwrap_or(52)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-W{:02}", self.year, self.week)
    }
}

impl FromStr for Period {
    type Err = PeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let unparseable = || PeriodError::Unparseable(s.to_string());
        let (year, week) = trimmed
            .split_once(['-', 'W', 'w'])
            .ok_or_else(unparseable)?;
        let week = week.trim_start_matches(['W', 'w']);
        let year: i32 = year.parse().map_err(|_| unparseable())?;
        let week: u32 = week.parse().map_err(|_| unparseable())?;
        Self::new(year, week)
    }
}

impl Serialize for Period {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// `(specific, group)` labels derived from a raw taxonomy term.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassificationPair {
    pub specific: String,
    pub group: String,
}

impl ClassificationPair {
    pub fn new(specific: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            specific: specific.into(),
            group: group.into(),
        }
    }

    pub fn unknown() -> Self {
        Self::new(UNKNOWN_LABEL, UNKNOWN_LABEL)
    }

    pub fn is_unknown(&self) -> bool {
        self.specific == UNKNOWN_LABEL && self.group == UNKNOWN_LABEL
    }
}

impl Default for ClassificationPair {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Canonical columns that are filled from source files. The derived columns
/// (classification pairs, year, week) are never read from a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalColumn {
    DateOfCase,
    Reference,
    NotificationFrom,
    CountryOrigin,
    Product,
    ProductCategory,
    HazardSubstance,
    HazardCategory,
}

impl CanonicalColumn {
    pub const ALL: [CanonicalColumn; 8] = [
        CanonicalColumn::DateOfCase,
        CanonicalColumn::Reference,
        CanonicalColumn::NotificationFrom,
        CanonicalColumn::CountryOrigin,
        CanonicalColumn::Product,
        CanonicalColumn::ProductCategory,
        CanonicalColumn::HazardSubstance,
        CanonicalColumn::HazardCategory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalColumn::DateOfCase => "date_of_case",
            CanonicalColumn::Reference => "reference",
            CanonicalColumn::NotificationFrom => "notification_from",
            CanonicalColumn::CountryOrigin => "country_origin",
            CanonicalColumn::Product => "product",
            CanonicalColumn::ProductCategory => "product_category",
            CanonicalColumn::HazardSubstance => "hazard_substance",
            CanonicalColumn::HazardCategory => "hazard_category",
        }
    }
}

impl fmt::Display for CanonicalColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanonicalColumn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown canonical column {s:?}"))
    }
}

/// Canonical alert row. Every column is always present; absent source data
/// is `None` and unclassified terms carry [`UNKNOWN_LABEL`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub date_of_case: Option<NaiveDate>,
    pub reference: Option<String>,
    pub notification_from: Option<String>,
    pub country_origin: Option<String>,
    pub product: Option<String>,
    pub product_category: Option<String>,
    pub hazard_substance: Option<String>,
    pub hazard_category: Option<String>,
    pub prodcat: String,
    pub groupprod: String,
    pub hazcat: String,
    pub grouphaz: String,
    pub year: Option<i32>,
    pub week: Option<u32>,
}

impl AlertRecord {
    /// Column names in persisted order.
    pub const COLUMNS: [&'static str; 14] = [
        "date_of_case",
        "reference",
        "notification_from",
        "country_origin",
        "product",
        "product_category",
        "hazard_substance",
        "hazard_category",
        "prodcat",
        "groupprod",
        "hazcat",
        "grouphaz",
        "year",
        "week",
    ];

    pub fn empty() -> Self {
        Self {
            date_of_case: None,
            reference: None,
            notification_from: None,
            country_origin: None,
            product: None,
            product_category: None,
            hazard_substance: None,
            hazard_category: None,
            prodcat: UNKNOWN_LABEL.to_string(),
            groupprod: UNKNOWN_LABEL.to_string(),
            hazcat: UNKNOWN_LABEL.to_string(),
            grouphaz: UNKNOWN_LABEL.to_string(),
            year: None,
            week: None,
        }
    }

    /// Sets the case date and re-derives `year`/`week` from it.
    pub fn set_date_of_case(&mut self, date: Option<NaiveDate>) {
        self.date_of_case = date;
        let period = date.map(Period::containing);
        self.year = period.map(|p| p.year());
        self.week = period.map(|p| p.week());
    }

    pub fn period(&self) -> Option<Period> {
        match (self.year, self.week) {
            (Some(year), Some(week)) => Period::new(year, week).ok(),
            _ => None,
        }
    }

    pub fn text(&self, column: CanonicalColumn) -> Option<&str> {
        match column {
            CanonicalColumn::DateOfCase => None,
            CanonicalColumn::Reference => self.reference.as_deref(),
            CanonicalColumn::NotificationFrom => self.notification_from.as_deref(),
            CanonicalColumn::CountryOrigin => self.country_origin.as_deref(),
            CanonicalColumn::Product => self.product.as_deref(),
            CanonicalColumn::ProductCategory => self.product_category.as_deref(),
            CanonicalColumn::HazardSubstance => self.hazard_substance.as_deref(),
            CanonicalColumn::HazardCategory => self.hazard_category.as_deref(),
        }
    }

    /// Writes a free-text column. Ignored for `DateOfCase`, which goes
    /// through [`AlertRecord::set_date_of_case`].
    pub fn set_text(&mut self, column: CanonicalColumn, value: Option<String>) {
        let slot = match column {
            CanonicalColumn::DateOfCase => return,
            CanonicalColumn::Reference => &mut self.reference,
            CanonicalColumn::NotificationFrom => &mut self.notification_from,
            CanonicalColumn::CountryOrigin => &mut self.country_origin,
            CanonicalColumn::Product => &mut self.product,
            CanonicalColumn::ProductCategory => &mut self.product_category,
            CanonicalColumn::HazardSubstance => &mut self.hazard_substance,
            CanonicalColumn::HazardCategory => &mut self.hazard_category,
        };
        *slot = value;
    }

    pub fn product_classification(&self) -> ClassificationPair {
        ClassificationPair::new(self.prodcat.clone(), self.groupprod.clone())
    }

    pub fn set_product_classification(&mut self, pair: ClassificationPair) {
        self.prodcat = pair.specific;
        self.groupprod = pair.group;
    }

    pub fn hazard_classification(&self) -> ClassificationPair {
        ClassificationPair::new(self.hazcat.clone(), self.grouphaz.clone())
    }

    pub fn set_hazard_classification(&mut self, pair: ClassificationPair) {
        self.hazcat = pair.specific;
        self.grouphaz = pair.group;
    }
}

impl Default for AlertRecord {
    fn default() -> Self {
        Self::empty()
    }
}
