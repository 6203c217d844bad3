//! Source adapters: the spreadsheet reader and the places text-search client.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shipmap_core::{GeoLocation, ProductCategory, ShipmentRecord, Store, StoreMap, SyncError};
use shipmap_storage::HttpFetcher;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "shipmap-adapters";

pub const DEFAULT_SHEETS_BASE_URL: &str = "https://docs.google.com/spreadsheets";
pub const PLACES_SEARCH_TEXT_URL: &str = "https://places.googleapis.com/v1/places:searchText";
pub const PLACES_FIELD_MASK: &str =
    "places.displayName,places.id,places.formattedAddress,places.location";

#[async_trait]
pub trait SheetSource: Send + Sync {
    /// Read every configured tab and merge the rows into one store map.
    ///
    /// A tab that cannot be fetched or parsed is logged and omitted; only a
    /// misconfigured source fails the whole call.
    async fn load_stores(&self) -> Result<StoreMap, SyncError>;
}

#[async_trait]
pub trait PlaceLookup: Send + Sync {
    async fn search_text(&self, query: &str) -> Result<Vec<PlaceCandidate>, SyncError>;
}

/// Raw sheet settings as they come from the environment or `sheets.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetsConfig {
    pub sheet_id: String,
    pub gids: Vec<String>,
    pub category_labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetTab {
    pub gid: String,
    pub category: ProductCategory,
}

impl SheetsConfig {
    pub fn validate(&self) -> Result<Vec<SheetTab>, SyncError> {
        if self.sheet_id.trim().is_empty() {
            return Err(SyncError::configuration("GOOGLE_SHEET_ID is not set"));
        }
        if self.gids.is_empty() || self.category_labels.is_empty() {
            return Err(SyncError::configuration(
                "GOOGLE_SHEET_GIDS or GOOGLE_SHEET_NAMES is not set",
            ));
        }
        if self.gids.len() != self.category_labels.len() {
            return Err(SyncError::configuration(format!(
                "{} sheet gids but {} category labels",
                self.gids.len(),
                self.category_labels.len()
            )));
        }

        self.gids
            .iter()
            .zip(&self.category_labels)
            .map(|(gid, label)| {
                let category = ProductCategory::from_label(label).ok_or_else(|| {
                    SyncError::configuration(format!("unknown category label {:?}", label.trim()))
                })?;
                Ok(SheetTab {
                    gid: gid.trim().to_string(),
                    category,
                })
            })
            .collect()
    }
}

pub fn export_url(base_url: &str, sheet_id: &str, gid: &str) -> String {
    format!(
        "{}/d/{}/export?format=csv&gid={}",
        base_url.trim_end_matches('/'),
        sheet_id,
        gid
    )
}

/// Decode a CSV export into trimmed cells, tolerating ragged rows.
pub fn read_csv_records(bytes: &[u8]) -> Result<Vec<Vec<String>>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let mut records = Vec::new();
    for record in reader.records() {
        let record = record?;
        records.push(record.iter().map(|cell| cell.trim().to_string()).collect());
    }
    Ok(records)
}

/// Pivot one cross table (dates across, stores down) into `stores`.
///
/// Row 0 holds the dates from column 1 on; each later row is a store name
/// followed by quantities aligned with those dates. Returns the number of
/// store rows read.
pub fn parse_cross_table(
    category: ProductCategory,
    records: &[Vec<String>],
    stores: &mut StoreMap,
) -> usize {
    let Some((header, rows)) = records.split_first() else {
        return 0;
    };

    let mut read = 0usize;
    for row in rows {
        let Some(name) = row.first().map(|cell| cell.trim()) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }

        let store = stores
            .entry(name.to_string())
            .or_insert_with(|| Store::new(name));
        for (date, quantity) in header.iter().zip(row.iter()).skip(1) {
            if date.trim().is_empty() {
                continue;
            }
            store.push_shipment(category, ShipmentRecord::new(date.trim(), quantity.trim()));
        }
        read += 1;
    }
    read
}

pub struct GoogleSheetsSource {
    http: Arc<HttpFetcher>,
    config: SheetsConfig,
    base_url: String,
}

impl GoogleSheetsSource {
    pub fn new(http: Arc<HttpFetcher>, config: SheetsConfig) -> Self {
        Self {
            http,
            config,
            base_url: DEFAULT_SHEETS_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn fetch_tab(&self, tab: &SheetTab) -> Result<Vec<Vec<String>>, SyncError> {
        let url = export_url(&self.base_url, &self.config.sheet_id, &tab.gid);
        let target = format!("{} (gid {})", tab.category, tab.gid);
        let response = self
            .http
            .get_bytes(&url)
            .await
            .map_err(|err| SyncError::fetch(&target, err))?;
        read_csv_records(&response.body).map_err(|err| SyncError::fetch(&target, err))
    }
}

#[async_trait]
impl SheetSource for GoogleSheetsSource {
    async fn load_stores(&self) -> Result<StoreMap, SyncError> {
        let tabs = self.config.validate()?;
        let mut stores = StoreMap::new();

        for tab in &tabs {
            match self.fetch_tab(tab).await {
                Ok(records) => {
                    if records.len() < 2 {
                        debug!(category = %tab.category, gid = %tab.gid, "sheet has no store rows");
                        continue;
                    }
                    let rows = parse_cross_table(tab.category, &records, &mut stores);
                    info!(category = %tab.category, gid = %tab.gid, rows, "sheet loaded");
                }
                Err(err) => {
                    warn!(category = %tab.category, gid = %tab.gid, error = %err, "sheet omitted");
                }
            }
        }

        Ok(stores)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceCandidate {
    pub id: String,
    pub display_name: Option<String>,
    pub formatted_address: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl PlaceCandidate {
    pub fn into_location(self) -> GeoLocation {
        GeoLocation {
            place_id: self.id,
            formatted_address: self.formatted_address,
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchTextResponse {
    #[serde(default)]
    places: Vec<WirePlace>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePlace {
    #[serde(default)]
    id: String,
    #[serde(default)]
    formatted_address: String,
    display_name: Option<WireDisplayName>,
    location: Option<WireLatLng>,
}

#[derive(Debug, Deserialize)]
struct WireDisplayName {
    text: String,
}

#[derive(Debug, Deserialize)]
struct WireLatLng {
    latitude: f64,
    longitude: f64,
}

/// Decode a `places:searchText` body, dropping places without an id or a location.
pub fn parse_search_text_response(body: &[u8]) -> Result<Vec<PlaceCandidate>, serde_json::Error> {
    let response: SearchTextResponse = serde_json::from_slice(body)?;
    Ok(response
        .places
        .into_iter()
        .filter_map(|place| {
            let location = place.location?;
            if place.id.is_empty() {
                return None;
            }
            Some(PlaceCandidate {
                id: place.id,
                display_name: place.display_name.map(|d| d.text),
                formatted_address: place.formatted_address,
                latitude: location.latitude,
                longitude: location.longitude,
            })
        })
        .collect())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchTextRequest<'a> {
    text_query: &'a str,
}

pub struct GooglePlacesClient {
    http: Arc<HttpFetcher>,
    api_key: String,
    endpoint: String,
}

impl GooglePlacesClient {
    pub fn new(http: Arc<HttpFetcher>, api_key: impl Into<String>) -> Self {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            warn!("GOOGLE_PLACES_API_KEY is not set; every place lookup will fail");
        }
        Self {
            http,
            api_key,
            endpoint: PLACES_SEARCH_TEXT_URL.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl PlaceLookup for GooglePlacesClient {
    async fn search_text(&self, query: &str) -> Result<Vec<PlaceCandidate>, SyncError> {
        if self.api_key.trim().is_empty() {
            return Err(SyncError::lookup(query, "GOOGLE_PLACES_API_KEY not set"));
        }

        let response = self
            .http
            .post_json(
                &self.endpoint,
                &[
                    ("X-Goog-Api-Key", self.api_key.as_str()),
                    ("X-Goog-FieldMask", PLACES_FIELD_MASK),
                ],
                &SearchTextRequest { text_query: query },
            )
            .await
            .map_err(|err| SyncError::lookup(query, err))?;

        let candidates =
            parse_search_text_response(&response.body).map_err(|err| SyncError::lookup(query, err))?;
        if candidates.is_empty() {
            return Err(SyncError::lookup(query, "no places found"));
        }
        Ok(candidates)
    }
}
