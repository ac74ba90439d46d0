use async_trait::async_trait;
use channel_proto::{
    encode_maps, error_codes, BackChannelMode, ConnectRequest, ConnectResponse, Map, SessionId,
    SessionStatus, PROTOCOL_VERSION, TERMINATE_QUERY_TYPE,
};
use futures_util::StreamExt;
use reqwest::{header::CONTENT_TYPE, Client, Response};
use serde::Deserialize;
use tracing::{debug, trace};
use url::Url;

use super::{ByteStream, ChannelTransport};
use crate::TransportError;

/// [`ChannelTransport`] over reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self, TransportError> {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Result<Self, TransportError> {
        // Paths are joined relative to the base, so it must end in a slash.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url =
            Url::parse(&normalized).map_err(|err| TransportError::Url(format!("{base_url}: {err}")))?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| TransportError::Url(format!("invalid channel path '{path}': {err}")))
    }

    async fn check(response: Response) -> Result<Response, TransportError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let body: ErrorBody = serde_json::from_str(&text).unwrap_or(ErrorBody {
            error: None,
            message: Some(text.clone()),
        });
        if body.error.as_deref() == Some(error_codes::UNKNOWN_SESSION) {
            return Err(TransportError::UnknownSession);
        }
        Err(TransportError::Status {
            status: status.as_u16(),
            message: body
                .message
                .or(body.error)
                .unwrap_or_else(|| "unknown error".into()),
        })
    }
}

#[async_trait]
impl ChannelTransport for HttpTransport {
    async fn handshake(
        &self,
        forward_path: &str,
        request: &ConnectRequest,
    ) -> Result<ConnectResponse, TransportError> {
        let url = self.url(forward_path)?;
        debug!(%url, client_version = %request.client_version, "handshake");
        let response = self.client.post(url).json(request).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn post_maps(
        &self,
        forward_path: &str,
        session: SessionId,
        ofs: u64,
        maps: &[Map],
    ) -> Result<SessionStatus, TransportError> {
        let url = self.url(forward_path)?;
        let body = encode_maps(ofs, maps).map_err(|err| TransportError::Body(err.to_string()))?;
        trace!(%session, ofs, count = maps.len(), "posting maps");
        let response = self
            .client
            .post(url)
            .query(&[("sid", session.to_string())])
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn open_back_channel(
        &self,
        back_path: &str,
        session: SessionId,
        since: Option<u64>,
        mode: BackChannelMode,
    ) -> Result<ByteStream, TransportError> {
        let url = self.url(back_path)?;
        let mut query = vec![("sid", session.to_string())];
        if let Some(since) = since {
            query.push(("since", since.to_string()));
        }
        if mode == BackChannelMode::Poll {
            query.push(("mode", mode.as_str().to_string()));
        }
        debug!(%session, ?since, mode = mode.as_str(), "opening back channel");
        let response = self.client.get(url).query(&query).send().await?;
        let response = Self::check(response).await?;
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| TransportError::Body(err.to_string())));
        Ok(Box::pin(stream))
    }

    async fn terminate(&self, forward_path: &str, session: SessionId) -> Result<(), TransportError> {
        let url = self.url(forward_path)?;
        let response = self
            .client
            .post(url)
            .query(&[("sid", session.to_string()), ("type", TERMINATE_QUERY_TYPE.to_string())])
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn network_test(&self, test_path: &str) -> Result<ByteStream, TransportError> {
        let url = self.url(test_path)?;
        debug!(%url, "network test");
        let response = self
            .client
            .get(url)
            .query(&[("ver", PROTOCOL_VERSION.to_string())])
            .send()
            .await?;
        let stream = Self::check(response)
            .await?
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| TransportError::Body(err.to_string())));
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn joins_paths_under_the_base() {
        let transport = HttpTransport::new("http://localhost:8080/app").expect("transport");
        assert_eq!(
            transport.url("channel/bind").expect("url").as_str(),
            "http://localhost:8080/app/channel/bind"
        );
        assert_eq!(
            transport.url("/channel/test").expect("url").as_str(),
            "http://localhost:8080/app/channel/test"
        );
    }

    #[test_timeout::timeout]
    fn rejects_garbage_base_url() {
        assert!(matches!(
            HttpTransport::new("not a url"),
            Err(TransportError::Url(_))
        ));
    }
}
