//! Google Sheets fetch client.
//!
//! Async reqwest client for the three calls the screener needs: a
//! service-account token grant, resolving a spreadsheet by title (Drive
//! search) or URL, and reading every row of the first worksheet.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ServiceAccountKey;
use crate::error::{FetchCause, Result, ScreenerError};
use crate::loader::{TableSource, records_to_table};
use crate::table::Table;

lazy_static! {
    static ref SPREADSHEET_URL_REGEX: Regex =
        Regex::new(r"/spreadsheets/d/([a-zA-Z0-9\-_]+)").unwrap();
    static ref PLAIN_TITLE_REGEX: Regex = Regex::new(r"^[A-Za-z0-9_]+$").unwrap();
}

pub const SCOPES: &str =
    "https://www.googleapis.com/auth/spreadsheets.readonly https://www.googleapis.com/auth/drive.readonly";
const SPREADSHEET_MIME: &str = "application/vnd.google-apps.spreadsheet";
const JWT_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Base URLs of the Google APIs; overridable for tests.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub drive_base: String,
    pub sheets_base: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Endpoints {
            drive_base: "https://www.googleapis.com/drive/v3".to_string(),
            sheets_base: "https://sheets.googleapis.com/v4".to_string(),
        }
    }
}

/// How the client authorizes its requests.
#[derive(Debug, Clone)]
pub enum SheetsAuth {
    /// Mint an access token from a service-account key
    ServiceAccount(ServiceAccountKey),
    /// Use an already-issued bearer token
    Bearer(String),
}

/// Opened spreadsheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpreadsheetHandle {
    pub id: String,
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
    #[serde(default)]
    index: u32,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

/// Google Sheets API client (async).
#[derive(Clone)]
pub struct SheetsClient {
    http: reqwest::Client,
    auth: SheetsAuth,
    endpoints: Endpoints,
}

impl SheetsClient {
    pub fn new(auth: SheetsAuth) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("screener/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ScreenerError::Configuration(format!("cannot build HTTP client: {}", e)))?;
        Ok(SheetsClient {
            http,
            auth,
            endpoints: Endpoints::default(),
        })
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Obtain a bearer token for the configured credentials.
    pub async fn access_token(&self, source_name: &str) -> Result<String> {
        let key = match &self.auth {
            SheetsAuth::Bearer(token) => return Ok(token.clone()),
            SheetsAuth::ServiceAccount(key) => key,
        };

        let assertion = sign_assertion(key, chrono::Utc::now().timestamp())?;
        let resp = self
            .http
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_GRANT_TYPE), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| transport_error(source_name, e))?;
        let resp = check_status(source_name, resp).await?;
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| transport_error(source_name, e))?;
        debug!("obtained access token for {}", key.client_email);
        Ok(token.access_token)
    }

    /// Resolve a spreadsheet by URL or by exact title.
    pub async fn open(&self, token: &str, name_or_url: &str) -> Result<SpreadsheetHandle> {
        if let Some(id) = spreadsheet_id_from_url(name_or_url) {
            return Ok(SpreadsheetHandle { id });
        }

        let query = format!(
            "mimeType='{}' and name = '{}' and trashed = false",
            SPREADSHEET_MIME,
            name_or_url.replace('\\', "\\\\").replace('\'', "\\'")
        );
        let resp = self
            .http
            .get(format!("{}/files", self.endpoints.drive_base))
            .bearer_auth(token)
            .query(&[
                ("q", query.as_str()),
                ("fields", "files(id,name)"),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ])
            .send()
            .await
            .map_err(|e| transport_error(name_or_url, e))?;
        let resp = check_status(name_or_url, resp).await?;
        let list: FileList = resp
            .json()
            .await
            .map_err(|e| transport_error(name_or_url, e))?;

        list.files
            .into_iter()
            .next()
            .map(|f| SpreadsheetHandle { id: f.id })
            .ok_or_else(|| {
                ScreenerError::source_unavailable(
                    name_or_url,
                    FetchCause::NotFound(format!(
                        "no spreadsheet named '{}' is shared with the service account",
                        name_or_url
                    )),
                )
            })
    }

    /// Read every row of the first worksheet; the first row is the header.
    pub async fn read_all_records(
        &self,
        token: &str,
        handle: &SpreadsheetHandle,
    ) -> Result<Vec<Vec<String>>> {
        let source = handle.id.as_str();
        let resp = self
            .http
            .get(format!(
                "{}/spreadsheets/{}",
                self.endpoints.sheets_base,
                urlencoding::encode(&handle.id)
            ))
            .bearer_auth(token)
            .query(&[("fields", "sheets.properties(title,index)")])
            .send()
            .await
            .map_err(|e| transport_error(source, e))?;
        let resp = check_status(source, resp).await?;
        let meta: SpreadsheetMeta = resp.json().await.map_err(|e| transport_error(source, e))?;

        let first = meta
            .sheets
            .into_iter()
            .map(|s| s.properties)
            .min_by_key(|p| p.index)
            .ok_or_else(|| {
                ScreenerError::source_unavailable(
                    source,
                    FetchCause::Malformed("spreadsheet has no worksheets".into()),
                )
            })?;

        let resp = self
            .http
            .get(format!(
                "{}/spreadsheets/{}/values/{}",
                self.endpoints.sheets_base,
                urlencoding::encode(&handle.id),
                urlencoding::encode(&worksheet_range(&first.title))
            ))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| transport_error(source, e))?;
        let resp = check_status(source, resp).await?;
        let range: ValueRange = resp.json().await.map_err(|e| transport_error(source, e))?;

        Ok(range
            .values
            .into_iter()
            .map(|row| row.into_iter().map(value_to_string).collect())
            .collect())
    }
}

#[async_trait]
impl TableSource for SheetsClient {
    async fn fetch_table(&self, source_name: &str) -> Result<Table> {
        let token = self.access_token(source_name).await?;
        let handle = self.open(&token, source_name).await?;
        let values = self.read_all_records(&token, &handle).await?;
        let table = records_to_table(values)
            .map_err(|cause| ScreenerError::source_unavailable(source_name, cause))?;
        info!(
            "fetched '{}': {} rows x {} columns",
            source_name,
            table.row_count(),
            table.column_count()
        );
        Ok(table)
    }
}

/// Build the RS256-signed JWT used in the service-account token grant.
pub fn sign_assertion(key: &ServiceAccountKey, now: i64) -> Result<String> {
    let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(|e| {
        ScreenerError::Configuration(format!(
            "gcp_service_account.private_key is not a valid RSA PEM key: {}",
            e
        ))
    })?;

    let mut header = Header::new(Algorithm::RS256);
    header.kid = key.private_key_id.clone();
    let claims = Claims {
        iss: &key.client_email,
        scope: SCOPES,
        aud: &key.token_uri,
        iat: now,
        exp: now + ASSERTION_LIFETIME_SECS,
    };

    encode(&header, &claims, &encoding_key)
        .map_err(|e| ScreenerError::Configuration(format!("cannot sign token request: {}", e)))
}

/// Extract the spreadsheet id from a `docs.google.com/spreadsheets/d/<id>` URL.
pub fn spreadsheet_id_from_url(url: &str) -> Option<String> {
    if !url.contains("://") {
        return None;
    }
    SPREADSHEET_URL_REGEX
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn worksheet_range(title: &str) -> String {
    if PLAIN_TITLE_REGEX.is_match(title) {
        title.to_string()
    } else {
        format!("'{}'", title.replace('\'', "''"))
    }
}

fn value_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

async fn check_status(source_name: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let detail = error_message(&body).unwrap_or_else(|| status.to_string());
    warn!("request for '{}' failed: HTTP {}: {}", source_name, status.as_u16(), detail);

    let cause = match status.as_u16() {
        401 | 403 => FetchCause::PermissionDenied(detail),
        404 => FetchCause::NotFound(detail),
        code => FetchCause::Http(code, detail),
    };
    Err(ScreenerError::source_unavailable(source_name, cause))
}

/// Pull `error.message` (or an OAuth `error_description`) out of an error body.
fn error_message(body: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(body).ok()?;
    json["error"]["message"]
        .as_str()
        .or_else(|| json["error_description"].as_str())
        .map(str::to_string)
}

fn transport_error(source_name: &str, e: reqwest::Error) -> ScreenerError {
    let cause = if e.is_decode() {
        FetchCause::Malformed(e.to_string())
    } else {
        FetchCause::Network(e.to_string())
    };
    ScreenerError::source_unavailable(source_name, cause)
}
