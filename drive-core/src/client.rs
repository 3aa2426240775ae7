use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com";
const FILE_FIELDS: &str = "id,name,mimeType,size,shortcutDetails";
const LIST_FIELDS: &str = "nextPageToken,files(id,name,mimeType,size,shortcutDetails)";

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
pub const SHORTCUT_MIME_TYPE: &str = "application/vnd.google-apps.shortcut";

const RATE_LIMIT_REASONS: &[&str] = &[
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "sharingRateLimitExceeded",
];
const QUOTA_REASONS: &[&str] = &[
    "storageQuotaExceeded",
    "quotaExceeded",
    "dailyLimitExceeded",
    "teamDriveFileLimitExceeded",
];

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<Duration>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    NotFound,
    Quota,
    Permanent,
}

/// Immutable credential handed to every request. A refreshed token means a
/// new context (and a new client via [`DriveClient::with_auth`]).
#[derive(Clone, PartialEq, Eq)]
pub struct AuthContext {
    access_token: Arc<str>,
}

impl AuthContext {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: Arc::from(access_token.into()),
        }
    }

    fn header_value(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    auth: AuthContext,
}

impl DriveClient {
    pub fn new(auth: AuthContext) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, auth)
    }

    pub fn with_base_url(base_url: &str, auth: AuthContext) -> Result<Self, DriveError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            auth,
        })
    }

    /// Same connection pool and endpoint, different credentials.
    pub fn with_auth(&self, auth: AuthContext) -> Self {
        Self {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            auth,
        }
    }

    pub async fn list_page(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<ListPage, DriveError> {
        let mut url = self.endpoint("/drive/v3/files")?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("q", &parents_query(folder_id))
                .append_pair("pageSize", &page_size.clamp(1, 1000).to_string())
                .append_pair("fields", LIST_FIELDS)
                .append_pair("supportsAllDrives", "true")
                .append_pair("includeItemsFromAllDrives", "true");
            if let Some(token) = page_token.filter(|t| !t.is_empty()) {
                query.append_pair("pageToken", token);
            }
        }
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth.header_value())
            .send()
            .await?;
        let mut page: ListPage = Self::handle_response(response).await?;
        if page.next_page_token.as_deref() == Some("") {
            page.next_page_token = None;
        }
        Ok(page)
    }

    pub async fn get_file(&self, id: &str) -> Result<DriveFile, DriveError> {
        let mut url = self.file_endpoint(id, None)?;
        url.query_pairs_mut()
            .append_pair("fields", FILE_FIELDS)
            .append_pair("supportsAllDrives", "true");
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth.header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn create_folder(&self, parent_id: &str, name: &str) -> Result<DriveFile, DriveError> {
        let mut url = self.endpoint("/drive/v3/files")?;
        url.query_pairs_mut()
            .append_pair("fields", FILE_FIELDS)
            .append_pair("supportsAllDrives", "true");
        let body = NewFile {
            name: Some(name),
            mime_type: Some(FOLDER_MIME_TYPE),
            parents: [parent_id],
        };
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth.header_value())
            .json(&body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn copy_file(
        &self,
        file_id: &str,
        dest_parent_id: &str,
    ) -> Result<DriveFile, DriveError> {
        let mut url = self.file_endpoint(file_id, Some("copy"))?;
        url.query_pairs_mut()
            .append_pair("fields", FILE_FIELDS)
            .append_pair("supportsAllDrives", "true");
        let body = NewFile {
            name: None,
            mime_type: None,
            parents: [dest_parent_id],
        };
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth.header_value())
            .json(&body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, DriveError> {
        Ok(self.base_url.join(path)?)
    }

    fn file_endpoint(&self, id: &str, action: Option<&str>) -> Result<Url, DriveError> {
        let mut url = self.endpoint("/drive/v3/files")?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| DriveError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?;
            segments.push(id);
            if let Some(action) = action {
                segments.push(action);
            }
        }
        Ok(url)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.unwrap_or_default();
            Err(DriveError::Api {
                status,
                body,
                retry_after,
            })
        }
    }
}

impl DriveError {
    pub fn api(status: StatusCode, body: impl Into<String>) -> Self {
        DriveError::Api {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn classification(&self) -> ApiErrorClass {
        match self {
            DriveError::Api { status, body, .. } => classify_api_error(*status, body),
            DriveError::Request(err) if err.is_decode() || err.is_builder() => {
                ApiErrorClass::Permanent
            }
            DriveError::Request(_) => ApiErrorClass::Transient,
            DriveError::Url(_) => ApiErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            ApiErrorClass::RateLimit | ApiErrorClass::Transient
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DriveError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_error(status: StatusCode, body: &str) -> ApiErrorClass {
    if status == StatusCode::UNAUTHORIZED {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status == StatusCode::FORBIDDEN {
        // Drive reports throttling and exhausted quota as 403 with a reason.
        if RATE_LIMIT_REASONS.iter().any(|reason| body.contains(reason)) {
            ApiErrorClass::RateLimit
        } else if QUOTA_REASONS.iter().any(|reason| body.contains(reason)) {
            ApiErrorClass::Quota
        } else {
            ApiErrorClass::Auth
        }
    } else if status == StatusCode::NOT_FOUND {
        ApiErrorClass::NotFound
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO))
}

fn parents_query(folder_id: &str) -> String {
    format!(
        "'{}' in parents and trashed = false",
        folder_id.replace('\\', "\\\\").replace('\'', "\\'")
    )
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default, deserialize_with = "deserialize_size")]
    pub size: Option<u64>,
    #[serde(default)]
    pub shortcut_details: Option<ShortcutDetails>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShortcutDetails {
    pub target_id: String,
    #[serde(default)]
    pub target_mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKind {
    Folder,
    File,
    Shortcut {
        target_id: String,
        target_mime_type: Option<String>,
    },
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    pub fn kind(&self) -> FileKind {
        if self.is_folder() {
            return FileKind::Folder;
        }
        match (&self.shortcut_details, self.mime_type == SHORTCUT_MIME_TYPE) {
            (Some(details), _) => FileKind::Shortcut {
                target_id: details.target_id.clone(),
                target_mime_type: details.target_mime_type.clone(),
            },
            // A shortcut listed without details still has to be resolved by id.
            (None, true) => FileKind::Shortcut {
                target_id: self.id.clone(),
                target_mime_type: None,
            },
            (None, false) => FileKind::File,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPage {
    #[serde(default)]
    pub files: Vec<DriveFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NewFile<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mime_type: Option<&'a str>,
    parents: [&'a str; 1],
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawSize {
        Number(u64),
        Text(String),
    }

    match Option::<RawSize>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawSize::Number(value)) => Ok(Some(value)),
        Some(RawSize::Text(value)) => value
            .parse::<u64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_is_split_by_reason() {
        let throttled = DriveError::api(
            StatusCode::FORBIDDEN,
            r#"{"error":{"errors":[{"reason":"userRateLimitExceeded"}]}}"#,
        );
        let quota = DriveError::api(
            StatusCode::FORBIDDEN,
            r#"{"error":{"errors":[{"reason":"storageQuotaExceeded"}]}}"#,
        );
        let denied = DriveError::api(StatusCode::FORBIDDEN, "insufficientFilePermissions");

        assert_eq!(throttled.classification(), ApiErrorClass::RateLimit);
        assert!(throttled.is_retryable());
        assert_eq!(quota.classification(), ApiErrorClass::Quota);
        assert!(!quota.is_retryable());
        assert_eq!(denied.classification(), ApiErrorClass::Auth);
    }

    #[test]
    fn status_classes() {
        assert_eq!(
            DriveError::api(StatusCode::UNAUTHORIZED, "").classification(),
            ApiErrorClass::Auth
        );
        assert_eq!(
            DriveError::api(StatusCode::NOT_FOUND, "").classification(),
            ApiErrorClass::NotFound
        );
        assert_eq!(
            DriveError::api(StatusCode::TOO_MANY_REQUESTS, "").classification(),
            ApiErrorClass::RateLimit
        );
        assert_eq!(
            DriveError::api(StatusCode::BAD_GATEWAY, "").classification(),
            ApiErrorClass::Transient
        );
        assert_eq!(
            DriveError::api(StatusCode::BAD_REQUEST, "").classification(),
            ApiErrorClass::Permanent
        );
    }

    #[test]
    fn retry_after_accepts_seconds() {
        assert_eq!(parse_retry_after("12"), Some(Duration::from_secs(12)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn size_is_parsed_from_string_or_number() {
        let file: DriveFile = serde_json::from_str(
            r#"{"id":"a","name":"a.bin","mimeType":"application/octet-stream","size":"42"}"#,
        )
        .unwrap();
        assert_eq!(file.size, Some(42));
        let file: DriveFile =
            serde_json::from_str(r#"{"id":"b","name":"b.bin","mimeType":"x","size":7}"#).unwrap();
        assert_eq!(file.size, Some(7));
    }

    #[test]
    fn kind_distinguishes_shortcuts() {
        let shortcut = DriveFile {
            id: "s1".into(),
            name: "link".into(),
            mime_type: SHORTCUT_MIME_TYPE.into(),
            size: None,
            shortcut_details: Some(ShortcutDetails {
                target_id: "f1".into(),
                target_mime_type: Some(FOLDER_MIME_TYPE.into()),
            }),
        };
        assert_eq!(
            shortcut.kind(),
            FileKind::Shortcut {
                target_id: "f1".into(),
                target_mime_type: Some(FOLDER_MIME_TYPE.into()),
            }
        );
        assert!(!shortcut.is_folder());
    }

    #[test]
    fn parents_query_escapes_quotes() {
        assert_eq!(
            parents_query("a'b"),
            "'a\\'b' in parents and trashed = false"
        );
    }

    #[test]
    fn auth_context_debug_hides_token() {
        let auth = AuthContext::bearer("secret-token");
        assert!(!format!("{auth:?}").contains("secret-token"));
    }
}
