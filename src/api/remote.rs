//! Purpose: Provide an HTTP client for the pollflag v1 endpoints.
//! Exports: `RemoteClient`.
//! Role: Blocking client mirroring local notifier operations against `pollflag serve`.
//! Invariants: Success bodies are `{status: "success", data}`; errors decode back into `Error`.
//! Invariants: Remote waits use whole seconds; transport failures are `Io` errors.
#![allow(clippy::result_large_err)]

use crate::core::channel::validate_channel;
use crate::core::error::{Error, ErrorKind};
use crate::core::notifier::{WaitOptions, WaitOutcome};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

type ApiResult<T> = Result<T, Error>;

#[derive(Clone)]
pub struct RemoteClient {
    inner: Arc<RemoteClientInner>,
}

struct RemoteClientInner {
    base_url: Url,
    token: Option<String>,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct SuccessEnvelope<T> {
    status: String,
    data: T,
}

#[derive(Deserialize)]
struct NewOrdersData {
    has_new_orders: bool,
}

#[derive(Deserialize)]
struct WaitData {
    signaled: bool,
}

#[derive(Deserialize)]
struct PendingData {
    pending: bool,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: RemoteError,
}

#[derive(Deserialize)]
struct RemoteError {
    kind: String,
    message: Option<String>,
    hint: Option<String>,
    channel: Option<String>,
}

#[derive(Serialize)]
struct OrderCreatedRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    order_id: Option<u64>,
}

impl RemoteClient {
    pub fn new(base_url: impl Into<String>) -> ApiResult<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let agent = ureq::AgentBuilder::new().build();
        Ok(Self {
            inner: Arc::new(RemoteClientInner {
                base_url,
                token: None,
                agent,
            }),
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.token = Some(token.into());
        } else {
            self.inner = Arc::new(RemoteClientInner {
                base_url: self.inner.base_url.clone(),
                token: Some(token.into()),
                agent: self.inner.agent.clone(),
            });
        }
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    /// Long-polls the new-order endpoint with the server's default timing.
    pub fn check_new_orders(&self) -> ApiResult<bool> {
        let url = build_url(
            &self.inner.base_url,
            &["v1", "check-new-orders-for-notification"],
        )?;
        let data: NewOrdersData = self.request_json::<(), _>("GET", &url, None)?;
        Ok(data.has_new_orders)
    }

    pub fn wait(&self, channel: &str, options: WaitOptions) -> ApiResult<WaitOutcome> {
        validate_channel(channel)?;
        options.validate()?;
        let timeout_secs = options.timeout.as_secs();
        let interval_secs = options.interval.as_secs();
        if timeout_secs == 0
            || interval_secs == 0
            || options.timeout.subsec_nanos() != 0
            || options.interval.subsec_nanos() != 0
        {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("remote waits use whole seconds")
                .with_hint("Use whole-second timeout and interval values of at least one second.")
                .with_channel(channel));
        }
        let mut url = build_url(&self.inner.base_url, &["v1", "channels", channel, "wait"])?;
        url.query_pairs_mut()
            .append_pair("timeout_secs", &timeout_secs.to_string())
            .append_pair("interval_secs", &interval_secs.to_string());
        let data: WaitData = self
            .request_json::<(), _>("GET", &url, None)
            .map_err(|err| err.with_channel(channel))?;
        Ok(if data.signaled {
            WaitOutcome::Signaled
        } else {
            WaitOutcome::TimedOut
        })
    }

    pub fn signal(&self, channel: &str) -> ApiResult<()> {
        validate_channel(channel)?;
        let url = build_url(&self.inner.base_url, &["v1", "channels", channel, "signal"])?;
        let _data: serde_json::Value = self
            .request_json("POST", &url, Some(&serde_json::json!({})))
            .map_err(|err| err.with_channel(channel))?;
        Ok(())
    }

    /// Reports a newly created order, the event source for the new-order channel.
    pub fn order_created(&self, order_id: Option<u64>) -> ApiResult<()> {
        let url = build_url(&self.inner.base_url, &["v1", "orders", "created"])?;
        let payload = OrderCreatedRequest { order_id };
        let _data: serde_json::Value = self.request_json("POST", &url, Some(&payload))?;
        Ok(())
    }

    pub fn pending(&self, channel: &str) -> ApiResult<bool> {
        validate_channel(channel)?;
        let url = build_url(&self.inner.base_url, &["v1", "channels", channel])?;
        let data: PendingData = self
            .request_json::<(), _>("GET", &url, None)
            .map_err(|err| err.with_channel(channel))?;
        Ok(data.pending)
    }

    pub fn clear(&self, channel: &str) -> ApiResult<()> {
        validate_channel(channel)?;
        let url = build_url(&self.inner.base_url, &["v1", "channels", channel])?;
        let _data: serde_json::Value = self
            .request_json::<(), _>("DELETE", &url, None)
            .map_err(|err| err.with_channel(channel))?;
        Ok(())
    }

    fn request_json<T, R>(&self, method: &str, url: &Url, body: Option<&T>) -> ApiResult<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let request = self.request(method, url).set("Accept", "application/json");
        let response = match body {
            None => request.call(),
            Some(body) => {
                let payload = serde_json::to_string(body).map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to encode request json")
                        .with_source(err)
                })?;
                request
                    .set("Content-Type", "application/json")
                    .send_string(&payload)
            }
        };

        match response {
            Ok(resp) => read_success_response(resp),
            Err(ureq::Error::Status(code, resp)) => Err(parse_error_response(code, resp)),
            Err(ureq::Error::Transport(err)) => Err(Error::new(ErrorKind::Io)
                .with_message("request failed")
                .with_source(err)),
        }
    }

    fn request(&self, method: &str, url: &Url) -> ureq::Request {
        let mut request = self.inner.agent.request(method, url.as_str());
        if let Some(token) = &self.inner.token {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }
        request
    }
}

fn normalize_base_url(raw: String) -> ApiResult<Url> {
    let mut url = Url::parse(&raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid remote base url")
            .with_source(err)
    })?;
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("remote base url must use http or https scheme"));
    }
    if url.path() != "/" && !url.path().is_empty() {
        return Err(
            Error::new(ErrorKind::Usage).with_message("remote base url must not include a path")
        );
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn build_url(base_url: &Url, segments: &[&str]) -> ApiResult<Url> {
    let mut url = base_url.clone();
    {
        let mut path = url.path_segments_mut().map_err(|_| {
            Error::new(ErrorKind::Usage).with_message("remote base url cannot be a base")
        })?;
        path.clear();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}

fn read_success_response<R>(response: ureq::Response) -> ApiResult<R>
where
    R: DeserializeOwned,
{
    let body = response.into_string().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read response body")
            .with_source(err)
    })?;
    decode_success(&body)
}

fn decode_success<R>(body: &str) -> ApiResult<R>
where
    R: DeserializeOwned,
{
    let envelope: SuccessEnvelope<R> = serde_json::from_str(body).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to decode response json")
            .with_source(err)
    })?;
    if envelope.status != "success" {
        return Err(Error::new(ErrorKind::Internal)
            .with_message(format!("unexpected response status {:?}", envelope.status)));
    }
    Ok(envelope.data)
}

fn parse_error_response(status: u16, response: ureq::Response) -> Error {
    let body = response.into_string().unwrap_or_default();
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&body) {
        return error_from_remote(envelope.error);
    }
    let kind = error_kind_from_status(status);
    Error::new(kind).with_message(format!("remote error status {status}"))
}

fn error_from_remote(remote: RemoteError) -> Error {
    let kind = parse_error_kind(&remote.kind);
    let mut err = Error::new(kind);
    if let Some(message) = remote.message {
        err = err.with_message(message);
    }
    if let Some(hint) = remote.hint {
        err = err.with_hint(hint);
    }
    if let Some(channel) = remote.channel {
        err = err.with_channel(channel);
    }
    err
}

fn parse_error_kind(kind: &str) -> ErrorKind {
    match kind {
        "Usage" => ErrorKind::Usage,
        "Busy" => ErrorKind::Busy,
        "Permission" => ErrorKind::Permission,
        "Corrupt" => ErrorKind::Corrupt,
        "Io" => ErrorKind::Io,
        _ => ErrorKind::Internal,
    }
}

fn error_kind_from_status(status: u16) -> ErrorKind {
    match status {
        400 | 404 | 405 => ErrorKind::Usage,
        401 | 403 => ErrorKind::Permission,
        423 | 429 | 503 => ErrorKind::Busy,
        _ => ErrorKind::Internal,
    }
}
