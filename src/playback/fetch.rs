use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

pub const AUDIO_ACCEPT: &str = "audio/mpeg, audio/*";
const APP_USER_AGENT: &str = concat!("voicechat/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaybackError {
    #[error("cannot reach the server; check that it is running")]
    Network(String),
    #[error("access to the audio file was denied; please wait a moment and retry")]
    Forbidden,
    #[error("server error: {status} - {body}")]
    Status { status: u16, body: String },
    #[error("audio data is empty; could not get audio from the server, please try again")]
    Empty,
    #[error("invalid audio data; please try again")]
    Decode(String),
    #[error("audio output is suspended")]
    Suspended,
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait AudioFetcher: Send + Sync {
    /// Loads the source as-is, the way a media element would.
    async fn fetch_direct(&self, url: &str) -> Result<Vec<u8>, PlaybackError>;
    /// Loads the source through the backend's audio proxy.
    async fn fetch_proxied(&self, url: &str) -> Result<Vec<u8>, PlaybackError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    proxy_endpoint: Url,
}

impl HttpFetcher {
    /// `proxy_base` is the backend origin, e.g. `http://localhost:8000`.
    pub fn new(proxy_base: &str) -> Result<Self, String> {
        let endpoint = format!("{}/proxy/audio", proxy_base.trim_end_matches('/'));
        let proxy_endpoint =
            Url::parse(&endpoint).map_err(|e| format!("invalid proxy url '{}': {}", endpoint, e))?;
        // No cookie store: requests never carry credentials.
        let client = reqwest::Client::builder()
            .user_agent(APP_USER_AGENT)
            .build()
            .map_err(|e| format!("http client error: {}", e))?;
        Ok(Self {
            client,
            proxy_endpoint,
        })
    }

    pub fn proxy_url(&self, source: &str) -> Url {
        let mut url = self.proxy_endpoint.clone();
        url.query_pairs_mut().append_pair("url", source);
        url
    }

    async fn get_audio(&self, url: &str) -> Result<Vec<u8>, PlaybackError> {
        log::info!("[playback] fetching {}", url);
        let response = self
            .client
            .get(url)
            .header(ACCEPT, AUDIO_ACCEPT)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::error!("[playback] server error: {} {}", status.as_u16(), body);
            if status == StatusCode::FORBIDDEN {
                return Err(PlaybackError::Forbidden);
            }
            return Err(PlaybackError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await.map_err(classify)?;
        if bytes.is_empty() {
            return Err(PlaybackError::Empty);
        }
        Ok(bytes.to_vec())
    }
}

fn classify(err: reqwest::Error) -> PlaybackError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        PlaybackError::Network(err.to_string())
    } else {
        PlaybackError::Other(err.to_string())
    }
}

#[async_trait]
impl AudioFetcher for HttpFetcher {
    async fn fetch_direct(&self, url: &str) -> Result<Vec<u8>, PlaybackError> {
        self.get_audio(url).await
    }

    async fn fetch_proxied(&self, url: &str) -> Result<Vec<u8>, PlaybackError> {
        let proxied = self.proxy_url(url);
        self.get_audio(proxied.as_str()).await
    }
}
