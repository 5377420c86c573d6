//! HTTP transport over reqwest.
//!
//! Requests are unsigned; the requester only selects which transport handle
//! is used.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::TryStreamExt;
use reqwest::{Client, Response, header};
use tracing::debug;
use url::Url;

use crate::application::federation::{
    MediaStream, Transport, TransportController, TransportError,
};

use super::error::InfraError;

const ACTIVITY_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";
const JRD_ACCEPT: &str = "application/jrd+json, application/json";

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub user_agent: String,
    pub request_timeout: Duration,
    pub max_document_bytes: u64,
}

pub struct HttpTransport {
    client: Client,
    requester: String,
    max_document_bytes: u64,
}

impl HttpTransport {
    pub fn requester(&self) -> &str {
        &self.requester
    }

    async fn send(&self, uri: &Url, accept: &str) -> Result<Response, TransportError> {
        debug!(uri = %uri, requester = %self.requester, "dereferencing");
        let response = self
            .client
            .get(uri.clone())
            .header(header::ACCEPT, accept)
            .send()
            .await
            .map_err(|err| request_error(uri, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                uri: uri.to_string(),
            });
        }
        Ok(response)
    }

    fn check_length(&self, length: Option<u64>) -> Result<(), TransportError> {
        match length {
            Some(length) if length > self.max_document_bytes => Err(TransportError::Body {
                message: format!(
                    "document of {length} bytes exceeds {} byte limit",
                    self.max_document_bytes
                ),
            }),
            _ => Ok(()),
        }
    }
}

fn request_error(uri: &Url, err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout {
            uri: uri.to_string(),
        }
    } else {
        TransportError::Network {
            message: err.to_string(),
        }
    }
}

/// WebFinger documents use a JRD media type rather than ActivityStreams.
fn accept_for(uri: &Url) -> &'static str {
    if uri.path().starts_with("/.well-known/") {
        JRD_ACCEPT
    } else {
        ACTIVITY_ACCEPT
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn dereference(&self, uri: &Url) -> Result<Bytes, TransportError> {
        let response = self.send(uri, accept_for(uri)).await?;
        self.check_length(response.content_length())?;
        let body = response
            .bytes()
            .await
            .map_err(|err| request_error(uri, err))?;
        self.check_length(Some(body.len() as u64))?;
        Ok(body)
    }

    async fn dereference_media(&self, uri: &Url) -> Result<MediaStream, TransportError> {
        let response = self.send(uri, "*/*").await?;
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let length = response.content_length();
        let target = uri.clone();
        let body = response
            .bytes_stream()
            .map_err(move |err| request_error(&target, err));

        Ok(MediaStream {
            content_type,
            length,
            body: Box::pin(body),
        })
    }
}

/// Hands out one shared transport per requester.
pub struct HttpTransportController {
    client: Client,
    max_document_bytes: u64,
    transports: DashMap<String, Arc<HttpTransport>>,
}

impl HttpTransportController {
    pub fn new(settings: &HttpSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| InfraError::http_client(err.to_string()))?;
        Ok(Self {
            client,
            max_document_bytes: settings.max_document_bytes,
            transports: DashMap::new(),
        })
    }
}

impl TransportController for HttpTransportController {
    fn transport_for(&self, requester: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let transport: Arc<dyn Transport> = self
            .transports
            .entry(requester.to_string())
            .or_insert_with(|| {
                Arc::new(HttpTransport {
                    client: self.client.clone(),
                    requester: requester.to_string(),
                    max_document_bytes: self.max_document_bytes,
                })
            })
            .clone();
        Ok(transport)
    }
}
