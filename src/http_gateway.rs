//! HTTP gateway for a Memos-style v1 REST API.
//!
//! Lists memos page by page and reads the server version. Response bodies
//! are converted into the crate's `RemoteNote` representation here so the
//! rest of the core never sees wire types.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::error::{MemoError, MemoResult};
use crate::gateway::{RemoteGateway, RemotePage};
use crate::models::{RemoteAttachment, RemoteLocation, RemoteNote, Visibility};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMemosResponse {
    #[serde(default)]
    memos: Vec<ApiMemo>,
    #[serde(default)]
    next_page_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiMemo {
    name: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    content: String,
    create_time: DateTime<Utc>,
    update_time: Option<DateTime<Utc>>,
    display_time: Option<DateTime<Utc>>,
    #[serde(default)]
    visibility: String,
    #[serde(default)]
    pinned: bool,
    #[serde(default, alias = "resources")]
    attachments: Vec<ApiAttachment>,
    location: Option<ApiLocation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiAttachment {
    name: String,
    create_time: DateTime<Utc>,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    external_link: String,
    #[serde(default, rename = "type")]
    mime_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiLocation {
    #[serde(default)]
    placeholder: String,
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Deserialize)]
struct WorkspaceProfile {
    #[serde(default)]
    version: String,
}

/// Strip a resource prefix such as `memos/` from a resource name
fn resource_id(name: &str) -> String {
    name.rsplit('/').next().unwrap_or(name).to_string()
}

impl ApiAttachment {
    fn into_remote(self, base_url: &str) -> RemoteAttachment {
        let uri = if self.external_link.is_empty() {
            format!("{}/file/{}/{}", base_url, self.name, self.filename)
        } else {
            self.external_link
        };
        RemoteAttachment {
            remote_id: resource_id(&self.name),
            created_at: self.create_time,
            filename: self.filename,
            uri,
            mime_type: self.mime_type,
        }
    }
}

impl ApiMemo {
    fn into_remote(self, base_url: &str) -> RemoteNote {
        let location = self.location.map(|l| RemoteLocation {
            label: l.placeholder,
            latitude: l.latitude,
            longitude: l.longitude,
            zoom: None,
        });

        RemoteNote {
            remote_id: resource_id(&self.name),
            content: self.content,
            created_at: self.display_time.unwrap_or(self.create_time),
            updated_at: self.update_time,
            visibility: Visibility::from_str(&self.visibility).unwrap_or_default(),
            pinned: self.pinned,
            archived: self.state == "ARCHIVED",
            location,
            attachments: self
                .attachments
                .into_iter()
                .map(|a| a.into_remote(base_url))
                .collect(),
        }
    }
}

/// `RemoteGateway` backed by HTTP calls with a bearer token
pub struct HttpGateway {
    client: Client,
    base_url: String,
    access_token: String,
}

impl HttpGateway {
    pub fn new(base_url: &str, access_token: &str) -> MemoResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| MemoError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> MemoResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(MemoError::AccessTokenInvalid);
        }
        if !status.is_success() {
            return Err(MemoError::Network(format!("GET {} failed: HTTP {}", path, status)));
        }

        Ok(response.json::<T>().await?)
    }

    fn parse_list(&self, body: ListMemosResponse) -> RemotePage {
        RemotePage {
            notes: body
                .memos
                .into_iter()
                .map(|m| m.into_remote(&self.base_url))
                .collect(),
            next_page_token: Some(body.next_page_token).filter(|t| !t.is_empty()),
        }
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn list_notes_page(
        &self,
        page_size: usize,
        page_token: Option<&str>,
        filter: Option<&str>,
        order_by: &str,
    ) -> MemoResult<RemotePage> {
        let mut query = vec![
            ("pageSize", page_size.to_string()),
            ("orderBy", order_by.to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        if let Some(filter) = filter {
            query.push(("filter", filter.to_string()));
        }

        tracing::debug!(page_size, has_token = page_token.is_some(), "listing remote memos");
        let body: ListMemosResponse = self.get_json("/api/v1/memos", &query).await?;
        Ok(self.parse_list(body))
    }

    async fn server_version(&self) -> MemoResult<String> {
        let profile: WorkspaceProfile = self.get_json("/api/v1/workspace/profile", &[]).await?;
        if profile.version.is_empty() {
            return Err(MemoError::network("server did not report a version"));
        }
        Ok(profile.version)
    }
}
