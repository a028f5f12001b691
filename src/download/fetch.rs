// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Network fetch primitive.
//!
//! A [`Fetcher`] opens a connection to a section URL, optionally starting at a
//! byte offset, and hands back the reported body length plus a byte stream.
//! Dropping the [`Connection`] disconnects.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use reqwest::header::RANGE;
use reqwest::StatusCode;

use crate::error::FetchError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// An open response body.
pub struct Connection {
    /// Length of the body that will be sent (the remaining bytes for a ranged
    /// request), if the server reported one.
    pub reported_length: Option<u64>,
    /// True when the body starts at the requested offset (HTTP 206). A
    /// ranged open answered with the whole file leaves this false.
    pub partial: bool,
    pub body: BoxStream<'static, Result<Bytes, FetchError>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("reported_length", &self.reported_length)
            .field("partial", &self.partial)
            .finish_non_exhaustive()
    }
}

/// Opens connections to section URLs.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Open `url`, requesting bytes from `range_start` onwards when given.
    async fn open(&self, url: &str, range_start: Option<u64>) -> Result<Connection, FetchError>;
}

/// [`Fetcher`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("lectern/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Connect {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn open(&self, url: &str, range_start: Option<u64>) -> Result<Connection, FetchError> {
        let mut request = self.client.get(url);
        if let Some(start) = range_start {
            request = request.header(RANGE, format!("bytes={}-", start));
        }

        let response = request.send().await.map_err(|e| FetchError::Connect {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !(status.is_success() || status == StatusCode::PARTIAL_CONTENT) {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let partial = status == StatusCode::PARTIAL_CONTENT;
        if range_start.is_some() && !partial {
            tracing::debug!(url, status = status.as_u16(), "Server ignored range request");
        }

        let reported_length = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| FetchError::Stream(e.to_string())))
            .boxed();

        Ok(Connection {
            reported_length,
            partial,
            body,
        })
    }
}
