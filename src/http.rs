//! REST client for the Discord API.
//!
//! All outbound HTTP calls go through [`DiscordHttpClient`] so that auth
//! headers, rate-limit back-off, and error handling live in one place. The
//! bridge only ever creates messages, so the surface is intentionally small.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Error;
use crate::types::{CreateMessage, Message, RateLimitInfo};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const BASE_URL: &str = "https://discord.com/api/v10";
const USER_AGENT: &str = "chatlink (https://github.com/chatlink/chatlink, 0.1)";

// ---------------------------------------------------------------------------
// Rate-limit tracker (per-bucket)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct BucketState {
    remaining: u32,
    resets_at: Instant,
}

#[derive(Debug, Default)]
struct RateLimiter {
    /// Route-key → bucket id mapping.
    route_buckets: HashMap<String, String>,
    /// Bucket id → state.
    buckets: HashMap<String, BucketState>,
    /// Global rate-limit: if set, no requests may go out until this instant.
    global_until: Option<Instant>,
}

impl RateLimiter {
    /// How long to wait before sending a request on `route_key`, or `None`
    /// if it can go out immediately.
    fn delay_for(&self, route_key: &str) -> Option<Duration> {
        let now = Instant::now();

        if let Some(until) = self.global_until {
            if until > now {
                return Some(until - now);
            }
        }

        let bucket_id = self.route_buckets.get(route_key)?;
        let state = self.buckets.get(bucket_id)?;
        if state.remaining == 0 && state.resets_at > now {
            return Some(state.resets_at - now);
        }
        None
    }

    /// Update internal state from response headers.
    fn update(&mut self, route_key: &str, info: &RateLimitInfo) {
        if info.is_global {
            if let Some(reset_after) = info.reset_after {
                self.global_until = Some(Instant::now() + Duration::from_secs_f64(reset_after));
            }
        }

        if let Some(ref bucket) = info.bucket {
            self.route_buckets
                .insert(route_key.to_string(), bucket.clone());

            let resets_at = match info.reset_after {
                Some(reset_after) => Instant::now() + Duration::from_secs_f64(reset_after),
                None => Instant::now() + Duration::from_secs(1),
            };

            self.buckets.insert(
                bucket.clone(),
                BucketState {
                    remaining: info.remaining.unwrap_or(1),
                    resets_at,
                },
            );
        }
    }
}

fn parse_rate_limit_headers(headers: &reqwest::header::HeaderMap) -> RateLimitInfo {
    let header_str =
        |name: &str| -> Option<&str> { headers.get(name).and_then(|v| v.to_str().ok()) };

    RateLimitInfo {
        remaining: header_str("x-ratelimit-remaining").and_then(|s| s.parse().ok()),
        reset_after: header_str("x-ratelimit-reset-after").and_then(|s| s.parse().ok()),
        bucket: header_str("x-ratelimit-bucket").map(str::to_string),
        is_global: header_str("x-ratelimit-global") == Some("true"),
    }
}

// ---------------------------------------------------------------------------
// DiscordHttpClient
// ---------------------------------------------------------------------------

/// A thin, rate-limit-aware client for the Discord REST API.
///
/// Cheap to clone (internals are behind `Arc`).
#[derive(Clone)]
pub struct DiscordHttpClient {
    token: String,
    client: reqwest::Client,
    limiter: Arc<Mutex<RateLimiter>>,
}

impl DiscordHttpClient {
    /// Create a new client with the given bot token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            client: reqwest::Client::new(),
            limiter: Arc::new(Mutex::new(RateLimiter::default())),
        }
    }

    /// Send a plain text message to a channel.
    pub async fn send_message(&self, channel_id: &str, content: &str) -> Result<Message, Error> {
        self.create_message(channel_id, &CreateMessage::new(content))
            .await
    }

    /// `POST /channels/{id}/messages`.
    pub async fn create_message(
        &self,
        channel_id: &str,
        msg: &CreateMessage,
    ) -> Result<Message, Error> {
        let path = format!("channels/{}/messages", channel_id);
        let route_key = format!("POST /channels/{}/messages", channel_id);
        let body = serde_json::to_value(msg).map_err(|e| Error::Send(e.to_string()))?;
        self.request_json(&path, &route_key, &body).await
    }

    /// POST `body` to `{BASE_URL}/{path}` and deserialise the JSON response.
    ///
    /// `route_key` identifies the per-route rate-limit bucket. Retries on
    /// 429 with the server-provided delay, up to a small cap.
    async fn request_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        route_key: &str,
        body: &serde_json::Value,
    ) -> Result<T, Error> {
        let max_retries = 5;
        for attempt in 0..=max_retries {
            // Pre-request: wait if the rate limiter says so.
            let delay = {
                let limiter = self.limiter.lock().await;
                limiter.delay_for(route_key)
            };
            if let Some(delay) = delay {
                let delay = delay.min(Duration::from_secs(60));
                debug!(
                    route = route_key,
                    delay_ms = delay.as_millis() as u64,
                    "rate-limit pre-emptive backoff"
                );
                tokio::time::sleep(delay).await;
            }

            let url = format!("{}/{}", BASE_URL, path);
            let resp = self
                .client
                .post(&url)
                .header("authorization", format!("Bot {}", self.token))
                .header("user-agent", USER_AGENT)
                .json(body)
                .send()
                .await
                .map_err(|e| Error::Send(e.to_string()))?;

            let status = resp.status();
            let rl_info = parse_rate_limit_headers(resp.headers());

            {
                let mut limiter = self.limiter.lock().await;
                limiter.update(route_key, &rl_info);
            }

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                let retry_after = rl_info.reset_after.unwrap_or(1.0);
                let delay = Duration::from_secs_f64(retry_after.min(60.0));
                warn!(
                    route = route_key,
                    attempt,
                    retry_after_s = retry_after,
                    global = rl_info.is_global,
                    "rate-limited by Discord, backing off"
                );
                if rl_info.is_global {
                    let mut limiter = self.limiter.lock().await;
                    limiter.global_until = Some(Instant::now() + delay);
                }
                if attempt < max_retries {
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            let bytes = resp.bytes().await.map_err(|e| Error::Send(e.to_string()))?;

            if status.is_success() {
                return serde_json::from_slice(&bytes).map_err(|e| {
                    let raw = String::from_utf8_lossy(&bytes);
                    Error::Send(format!("{}: {}", e, &raw[..raw.len().min(200)]))
                });
            }

            let body_str = String::from_utf8_lossy(&bytes).to_string();
            return Err(Error::Send(format!(
                "Discord API error {} on {}: {}",
                status.as_u16(),
                route_key,
                body_str
            )));
        }

        Err(Error::Send(format!(
            "rate-limited after max retries on {}",
            route_key
        )))
    }
}

// ---------------------------------------------------------------------------
// Shared client holder
// ---------------------------------------------------------------------------

/// Handle to the current REST client, swapped when credentials change.
///
/// The delivery task outlives individual sessions; it reads the client
/// through this holder so a token change takes effect without recreating
/// the outbound queue.
#[derive(Clone)]
pub struct SharedHttp(Arc<std::sync::RwLock<DiscordHttpClient>>);

impl SharedHttp {
    pub fn new(client: DiscordHttpClient) -> Self {
        Self(Arc::new(std::sync::RwLock::new(client)))
    }

    pub fn get(&self) -> DiscordHttpClient {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn store(&self, client: DiscordHttpClient) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = client;
    }
}

impl std::fmt::Debug for DiscordHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordHttpClient")
            .field("token", &"<redacted>")
            .finish()
    }
}
