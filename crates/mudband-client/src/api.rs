// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, ETAG, IF_NONE_MATCH};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};

use mudband_types::api::{
    AnonymousBandRequest, AnonymousBandResponse, ConfRequest, ConfResponse, EnrollRequest,
    EnrollResponse, EnrollmentTokenCreateResponse, EnrollmentTokenResponse, StatusReply,
    WebCliResponse,
};

use crate::error::ErrorKind;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    ServerError { status: u16, body: String },

    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Request(_) => ErrorKind::Transport,
            Self::ServerError { .. } | Self::Decode(_) => ErrorKind::ServerRejected,
        }
    }
}

/// Result of a conditional configuration fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfReply {
    /// HTTP 304; the cached copy is current.
    NotModified,
    /// A body was served, with the entity tag from the `Etag` header.
    Fetched {
        etag: Option<String>,
        response: ConfResponse,
    },
}

/// Client for the mud.band control plane.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(api_host: &str) -> Result<Self, ApiError> {
        let http = Client::builder()
            .user_agent(concat!("mudband/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: api_host.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    #[tracing::instrument(skip(self, request), fields(api_host = %self.base_url, device = %request.name))]
    pub async fn enroll(&self, request: &EnrollRequest) -> Result<EnrollResponse, ApiError> {
        let resp = self
            .http
            .post(self.url("/api/band/enroll"))
            .json(request)
            .send()
            .await?;
        decode(resp).await
    }

    #[tracing::instrument(skip(self, jwt), fields(api_host = %self.base_url))]
    pub async fn unenroll(&self, jwt: &str) -> Result<StatusReply, ApiError> {
        let resp = self
            .http
            .get(self.url("/api/band/unenroll"))
            .header(AUTHORIZATION, jwt)
            .send()
            .await?;
        decode(resp).await
    }

    /// `POST /api/band/conf`, sending `If-None-Match` when an entity tag is known.
    #[tracing::instrument(
        skip(self, jwt, etag, request),
        fields(api_host = %self.base_url, fetch_type = %request.fetch_type, cached = etag.is_some())
    )]
    pub async fn fetch_conf(
        &self,
        jwt: &str,
        etag: Option<&str>,
        request: &ConfRequest,
    ) -> Result<ConfReply, ApiError> {
        let mut builder = self
            .http
            .post(self.url("/api/band/conf"))
            .header(AUTHORIZATION, jwt)
            .json(request);
        if let Some(etag) = etag {
            builder = builder.header(IF_NONE_MATCH, etag);
        }

        let resp = builder.send().await?;
        if resp.status() == StatusCode::NOT_MODIFIED {
            debug!("configuration not modified");
            return Ok(ConfReply::NotModified);
        }

        let etag = resp
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .and_then(normalize_etag);
        let response: ConfResponse = decode(resp).await?;
        info!(
            status = response.status,
            has_conf = response.conf.is_some(),
            etag = etag.as_deref().unwrap_or("-"),
            "fetched configuration"
        );
        Ok(ConfReply::Fetched { etag, response })
    }

    #[tracing::instrument(skip(self, jwt), fields(api_host = %self.base_url))]
    pub async fn webcli_signin(&self, jwt: &str) -> Result<WebCliResponse, ApiError> {
        let resp = self
            .http
            .get(self.url("/webcli/signin"))
            .header(AUTHORIZATION, jwt)
            .send()
            .await?;
        decode(resp).await
    }

    #[tracing::instrument(skip(self, request), fields(api_host = %self.base_url, band = %request.name))]
    pub async fn create_anonymous_band(
        &self,
        request: &AnonymousBandRequest,
    ) -> Result<AnonymousBandResponse, ApiError> {
        let resp = self
            .http
            .post(self.url("/api/band/anonymous/create"))
            .json(request)
            .send()
            .await?;
        decode(resp).await
    }

    #[tracing::instrument(skip(self, admin_jwt), fields(api_host = %self.base_url))]
    pub async fn create_enrollment_token(
        &self,
        admin_jwt: &str,
    ) -> Result<EnrollmentTokenCreateResponse, ApiError> {
        let resp = self
            .http
            .get(self.url("/api/band/anonymous/enrollment/token/create"))
            .header(AUTHORIZATION, admin_jwt)
            .send()
            .await?;
        decode(resp).await
    }

    #[tracing::instrument(skip(self, admin_jwt), fields(api_host = %self.base_url))]
    pub async fn enrollment_token(
        &self,
        admin_jwt: &str,
    ) -> Result<EnrollmentTokenResponse, ApiError> {
        let resp = self
            .http
            .get(self.url("/api/band/anonymous/enrollment/token"))
            .header(AUTHORIZATION, admin_jwt)
            .send()
            .await?;
        decode(resp).await
    }
}

/// Reads a JSON envelope. Error statuses still yield the envelope when the body
/// carries one, so the in-body `status` and `msg` decide the outcome.
async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ApiError> {
    let status = resp.status();
    let body = resp.text().await?;
    debug!(status = status.as_u16(), len = body.len(), "received API response");

    if status.is_success() {
        return Ok(serde_json::from_str(&body)?);
    }

    match serde_json::from_str(&body) {
        Ok(envelope) => {
            debug!(status = status.as_u16(), "error status with envelope body");
            Ok(envelope)
        }
        Err(_) => {
            warn!(status = status.as_u16(), body = %body, "API returned unexpected status");
            Err(ApiError::ServerError {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Strips a weak validator prefix; an empty tag counts as none.
pub fn normalize_etag(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let tag = raw
        .strip_prefix("W/")
        .or_else(|| raw.strip_prefix("w/"))
        .unwrap_or(raw);
    (!tag.is_empty()).then(|| tag.to_string())
}
