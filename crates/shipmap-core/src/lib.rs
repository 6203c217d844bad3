//! Core domain model, error taxonomy and parsing rules for the store shipment map.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "shipmap-core";

/// Accepted shipment date layouts, tried in order. chrono accepts single-digit
/// month/day for `%m`/`%d`, which covers `2024/3/5` and `3/5/2024`.
pub const SHIPMENT_DATE_FORMATS: &[&str] = &["%Y/%m/%d", "%Y-%m-%d", "%m/%d/%Y"];

/// chrono's `%Y` also takes 1-3 digit years, so the year field is checked separately.
fn has_four_digit_year(input: &str, format: &str) -> bool {
    let separator = if format.contains('-') { '-' } else { '/' };
    let parts: Vec<&str> = input.split(separator).collect();
    let year = if format.starts_with("%Y") {
        parts.first()
    } else {
        parts.last()
    };
    year.is_some_and(|y| y.len() == 4 && y.bytes().all(|b| b.is_ascii_digit()))
}

/// Error taxonomy shared by every stage of a sync run.
///
/// Only [`SyncError::Configuration`] and [`SyncError::Persistence`] abort a run;
/// the others are caught and logged at the item boundary.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("fetch failed for {target}: {message}")]
    Fetch { target: String, message: String },
    #[error("lookup failed for {query}: {message}")]
    Lookup { query: String, message: String },
    #[error("unparseable shipment date {0:?}")]
    Parse(String),
    #[error("persistence error: {0}")]
    Persistence(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl SyncError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn fetch(target: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Fetch {
            target: target.into(),
            message: message.to_string(),
        }
    }

    pub fn lookup(query: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Lookup {
            query: query.into(),
            message: message.to_string(),
        }
    }

    pub fn persistence(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Persistence(Box::new(err))
    }

    /// Whether this error ends the whole run rather than a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Persistence(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductCategory {
    Okra,
    SpongeGourd,
}

impl ProductCategory {
    pub const ALL: [ProductCategory; 2] = [ProductCategory::Okra, ProductCategory::SpongeGourd];

    /// Label persisted in `shipments.product_type` and returned by the map API:
    /// the spreadsheet's own tab name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductCategory::Okra => "秋葵",
            ProductCategory::SpongeGourd => "產銷絲瓜",
        }
    }

    /// Resolve a spreadsheet tab label (either the sheet's own name or the persisted label).
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "秋葵" | "okra" => Some(ProductCategory::Okra),
            "產銷絲瓜" | "sponge_gourd" => Some(ProductCategory::SpongeGourd),
            _ => None,
        }
    }
}

impl fmt::Display for ProductCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geocode result for a store. Held as a whole so a store is never partially geocoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub place_id: String,
    pub formatted_address: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentRecord {
    pub date: String,
    pub quantity: String,
}

impl ShipmentRecord {
    pub fn new(date: impl Into<String>, quantity: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            quantity: quantity.into(),
        }
    }

    pub fn is_shipment(&self) -> bool {
        is_shipment_quantity(&self.quantity)
    }
}

/// Empty and literal zero quantities mean "no shipment".
pub fn is_shipment_quantity(quantity: &str) -> bool {
    let q = quantity.trim();
    !q.is_empty() && q != "0"
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Store {
    pub name: String,
    pub location: Option<GeoLocation>,
    pub shipments: BTreeMap<ProductCategory, Vec<ShipmentRecord>>,
}

impl Store {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: None,
            shipments: BTreeMap::new(),
        }
    }

    pub fn push_shipment(&mut self, category: ProductCategory, record: ShipmentRecord) {
        self.shipments.entry(category).or_default().push(record);
    }

    pub fn shipments_for(&self, category: ProductCategory) -> &[ShipmentRecord] {
        self.shipments
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn shipment_count(&self) -> usize {
        self.shipments.values().map(Vec::len).sum()
    }
}

/// Freshly read stores keyed by their scraped name.
pub type StoreMap = BTreeMap<String, Store>;

/// Snapshot of persisted stores that already carry a usable geocode, keyed by store name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExistingLocationIndex {
    entries: HashMap<String, GeoLocation>,
}

impl ExistingLocationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries with an empty place id or non-finite coordinates are not indexable.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, GeoLocation)>) -> Self {
        let entries = entries
            .into_iter()
            .filter(|(_, loc)| {
                !loc.place_id.trim().is_empty() && loc.latitude.is_finite() && loc.longitude.is_finite()
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, store_name: &str) -> Option<&GeoLocation> {
        self.entries.get(store_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn parse_shipment_date(raw: &str) -> Result<NaiveDate, SyncError> {
    let trimmed = raw.trim();
    SHIPMENT_DATE_FORMATS
        .iter()
        .filter(|fmt| has_four_digit_year(trimmed, fmt))
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
        .ok_or_else(|| SyncError::Parse(raw.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Reuse stored geocodes, look up only stores not seen before.
    Incremental,
    /// Look up every store again.
    Full,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Incremental => "incremental",
            SyncMode::Full => "full",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "incremental" | "daily" => Ok(SyncMode::Incremental),
            "full" | "monthly" => Ok(SyncMode::Full),
            other => Err(SyncError::configuration(format!("unknown sync mode {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Running,
    Success,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Running => "running",
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SyncStatus::Running),
            "success" => Ok(SyncStatus::Success),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(format!("unknown sync status {other:?}")),
        }
    }
}

/// One execution of the sync pipeline, as recorded in `sync_runs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub mode: SyncMode,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub message: String,
}

/// One row of the "recent shipments" read projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentShipment {
    pub store_name: String,
    pub formatted_address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub product_type: String,
    pub shipment_date: NaiveDate,
    pub quantity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreMapEntry {
    pub store_name: String,
    pub address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub shipments: Vec<StoreMapShipment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreMapShipment {
    pub product_type: String,
    pub date: String,
    pub quantity: String,
}

/// Group projection rows by store, dropping any "no shipment" row that slipped through.
pub fn group_recent_shipments(rows: Vec<RecentShipment>) -> Vec<StoreMapEntry> {
    let mut grouped: BTreeMap<String, StoreMapEntry> = BTreeMap::new();
    for row in rows {
        if !is_shipment_quantity(&row.quantity) {
            continue;
        }
        let entry = grouped
            .entry(row.store_name.clone())
            .or_insert_with(|| StoreMapEntry {
                store_name: row.store_name.clone(),
                address: row.formatted_address.clone().unwrap_or_default(),
                latitude: row.latitude,
                longitude: row.longitude,
                shipments: Vec::new(),
            });
        entry.shipments.push(StoreMapShipment {
            product_type: row.product_type,
            date: row.shipment_date.format("%Y-%m-%d").to_string(),
            quantity: row.quantity,
        });
    }
    grouped.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(store: &str, date: (i32, u32, u32), qty: &str) -> RecentShipment {
        RecentShipment {
            store_name: store.to_string(),
            formatted_address: Some(format!("{store} address")),
            latitude: Some(25.0),
            longitude: Some(121.5),
            product_type: ProductCategory::Okra.as_str().to_string(),
            shipment_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            quantity: qty.to_string(),
        }
    }

    #[test]
    fn accepted_date_formats_agree() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        for raw in ["2024/03/05", "2024-03-05", "03/05/2024", "2024/3/5", "3/5/2024", " 2024/03/05 "] {
            assert_eq!(parse_shipment_date(raw).unwrap(), expected, "format {raw}");
        }
    }

    #[test]
    fn unparseable_dates_are_parse_errors() {
        for raw in [
            "not-a-date",
            "",
            "2024/13/01",
            "05.03.2024",
            "1/2/24",
            "24/1/2",
            "10/11/12",
            "024-01-02",
            "3/5/02024",
        ] {
            let err = parse_shipment_date(raw).unwrap_err();
            assert!(matches!(err, SyncError::Parse(_)), "{raw}");
            assert!(!err.is_fatal());
        }
    }

    #[test]
    fn empty_and_zero_quantities_are_not_shipments() {
        assert!(!ShipmentRecord::new("2024/01/01", "").is_shipment());
        assert!(!ShipmentRecord::new("2024/01/01", "0").is_shipment());
        assert!(!ShipmentRecord::new("2024/01/01", " 0 ").is_shipment());
        assert!(ShipmentRecord::new("2024/01/01", "5").is_shipment());
        assert!(ShipmentRecord::new("2024/01/01", "10").is_shipment());
    }

    #[test]
    fn category_labels_resolve() {
        assert_eq!(ProductCategory::from_label("秋葵"), Some(ProductCategory::Okra));
        assert_eq!(ProductCategory::from_label(" okra "), Some(ProductCategory::Okra));
        assert_eq!(ProductCategory::from_label("產銷絲瓜"), Some(ProductCategory::SpongeGourd));
        assert_eq!(ProductCategory::from_label("banana"), None);
        for category in ProductCategory::ALL {
            assert_eq!(ProductCategory::from_label(category.as_str()), Some(category));
        }
        assert_eq!(ProductCategory::SpongeGourd.as_str(), "產銷絲瓜");
    }

    #[test]
    fn sync_mode_parses_aliases() {
        assert_eq!("daily".parse::<SyncMode>().unwrap(), SyncMode::Incremental);
        assert_eq!("FULL".parse::<SyncMode>().unwrap(), SyncMode::Full);
        assert!("weekly".parse::<SyncMode>().unwrap_err().is_fatal());
    }

    #[test]
    fn grouping_drops_non_shipments_and_groups_by_store() {
        let grouped = group_recent_shipments(vec![
            row("StoreB", (2024, 1, 2), "3"),
            row("StoreA", (2024, 1, 2), "0"),
            row("StoreA", (2024, 1, 1), "5"),
            row("StoreB", (2024, 1, 1), ""),
        ]);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].store_name, "StoreA");
        assert_eq!(grouped[0].shipments.len(), 1);
        assert_eq!(grouped[0].shipments[0].date, "2024-01-01");
        assert_eq!(grouped[0].shipments[0].quantity, "5");
        assert_eq!(grouped[1].shipments.len(), 1);

        let json = serde_json::to_value(&grouped[0]).unwrap();
        assert_eq!(json["storeName"], "StoreA");
        assert_eq!(json["shipments"][0]["productType"], "秋葵");
    }

    #[test]
    fn location_index_rejects_incomplete_geocodes() {
        let good = GeoLocation {
            place_id: "pid-a".into(),
            formatted_address: "addr".into(),
            latitude: 25.0,
            longitude: 121.0,
        };
        let blank_id = GeoLocation {
            place_id: "  ".into(),
            ..good.clone()
        };
        let nan = GeoLocation {
            latitude: f64::NAN,
            ..good.clone()
        };
        let index = ExistingLocationIndex::from_entries(vec![
            ("StoreA".to_string(), good.clone()),
            ("StoreB".to_string(), blank_id),
            ("StoreC".to_string(), nan),
        ]);
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("StoreA"), Some(&good));
        assert!(index.get("StoreB").is_none());
        assert!(index.get("storea").is_none());
    }

    #[test]
    fn grouping_drops_stores_with_only_empty_rows() {
        let grouped = group_recent_shipments(vec![row("StoreC", (2024, 1, 1), "")]);
        assert!(grouped.is_empty());
    }
}
