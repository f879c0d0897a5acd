//! Client for the lucida.to conversion relay.
//!
//! The service fronts a handful of streaming platforms behind a small JSON
//! API. A `POST /api/load` opens a conversion job and hands back a `handoff`
//! id plus the name of the sibling server that owns the job. The job is then
//! polled at `/api/fetch/request/<handoff>` until it completes, and the
//! payload is streamed from the `/download` sub-path. The endpoints expect
//! browser-like headers, and the load body travels as
//! `text/plain;charset=UTF-8` even though it is JSON.

use crate::error::{Result, RipError};
use futures_util::StreamExt;
use reqwest::header::{
    CONTENT_DISPOSITION, CONTENT_TYPE, HeaderMap, HeaderValue, ORIGIN, REFERER, USER_AGENT,
};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use url::Url;

/// Token baked into the service's own web client; `LUCIDA_TOKEN` overrides it.
pub const DEFAULT_TOKEN: &str = "g-dQ7ptFr5_PIBqGmYk0mpMJkhI";

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36";
const SUBMIT_CONTENT_TYPE: &str = "text/plain;charset=UTF-8";
const STREAM_API_PATH: &str = "/api/fetch/stream/v2";
const TOKEN_VALIDITY_SECS: u64 = 30 * 24 * 60 * 60;

/// Artist and title of the track being fetched. Both fields are non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackMetadata {
    pub artist: String,
    pub title: String,
}

/// An accepted conversion job: the handoff id plus the server that owns it.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub handoff: String,
    pub server: Url,
}

/// One decoded poll response. Unknown fields are kept in `extra` so the
/// record re-serializes with everything the service sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StatusRecord {
    /// Artist/title carried by this record, when both are usable.
    pub fn track_metadata(&self) -> Option<TrackMetadata> {
        match (self.artist.as_deref(), self.title.as_deref()) {
            (Some(artist), Some(title)) if !artist.is_empty() && !title.is_empty() => {
                Some(TrackMetadata {
                    artist: artist.to_string(),
                    title: title.to_string(),
                })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct SubmitRequest {
    url: String,
    metadata: bool,
    compat: bool,
    private: bool,
    handoff: bool,
    account: AccountSpec,
    upload: UploadSpec,
    downscale: &'static str,
    token: TokenSpec,
}

#[derive(Debug, Serialize)]
struct AccountSpec {
    #[serde(rename = "type")]
    kind: &'static str,
    id: &'static str,
}

#[derive(Debug, Serialize)]
struct UploadSpec {
    enabled: bool,
    service: &'static str,
}

#[derive(Debug, Serialize)]
struct TokenSpec {
    primary: String,
    expiry: u64,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    handoff: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// One client per run, bound to the track it is fetching.
pub struct LucidaClient {
    http: reqwest::Client,
    endpoint: Url,
    page: Url,
    origin: HeaderValue,
    page_referer: HeaderValue,
    root_referer: HeaderValue,
    token: String,
}

impl LucidaClient {
    pub fn new(endpoint: &Url, track_url: &str, token: impl Into<String>) -> Result<Self> {
        let root = join(endpoint, "/")?;
        let mut page = root.clone();
        page.query_pairs_mut()
            .append_pair("url", track_url)
            .append_pair("country", "auto");

        let origin = header_value(&endpoint.origin().ascii_serialization())?;
        let page_referer = header_value(page.as_str())?;
        let root_referer = header_value(root.as_str())?;

        Ok(Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.clone(),
            page,
            origin,
            page_referer,
            root_referer,
            token: token.into(),
        })
    }

    /// Scrapes artist/title from the service's web page for the track.
    ///
    /// Best effort: any failure degrades the eventual filename, so this
    /// only warns and returns `None`.
    pub async fn track_page_metadata(&self) -> Option<TrackMetadata> {
        let request = self
            .http
            .get(self.page.clone())
            .header(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(%err, "could not fetch the track page");
                return None;
            }
        };
        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "track page fetch failed");
            return None;
        }
        let html = match response.text().await {
            Ok(html) => html,
            Err(err) => {
                tracing::warn!(%err, "could not read the track page");
                return None;
            }
        };

        let meta = parse_track_page(&html);
        match &meta {
            Some(meta) => {
                tracing::debug!(artist = %meta.artist, title = %meta.title, "parsed track page")
            }
            None => tracing::warn!("no artist/title found on the track page"),
        }
        meta
    }

    /// Asks the service to open a conversion job for the track.
    pub async fn submit_job(&self, track_id: &str) -> Result<JobHandle> {
        let url = self.load_url()?;
        let payload = self.submit_request(track_id);
        let body = serde_json::to_string(&payload)
            .map_err(|err| RipError::Service(format!("could not encode the load request: {err}")))?;

        let mut headers = self.service_headers(&self.page_referer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(SUBMIT_CONTENT_TYPE));

        tracing::debug!(%url, track_id, "requesting a conversion job");
        let response = self.http.post(url).headers(headers).body(body).send().await?;
        if !response.status().is_success() {
            return Err(RipError::Service(format!(
                "load endpoint answered HTTP {}",
                response.status()
            )));
        }

        let answer: SubmitResponse = response.json().await?;
        if !answer.success {
            return Err(RipError::Service(
                answer
                    .message
                    .unwrap_or_else(|| "the service did not accept the track".to_string()),
            ));
        }
        let handoff = answer
            .handoff
            .filter(|handoff| !handoff.is_empty())
            .ok_or_else(|| {
                RipError::Service("the service accepted the job but sent no handoff id".to_string())
            })?;
        let server = match answer.name.as_deref() {
            Some(name) if !name.is_empty() => self.server_base(name)?,
            _ => self.endpoint.clone(),
        };

        Ok(JobHandle { handoff, server })
    }

    /// One status poll. `Ok(None)` means the endpoint answered non-200 and
    /// the caller should poll again.
    pub async fn job_status(&self, job: &JobHandle) -> Result<Option<StatusRecord>> {
        let url = join(&job.server, &format!("/api/fetch/request/{}", job.handoff))?;
        let headers = self.service_headers(&self.root_referer);
        let response = self.http.get(url).headers(headers).send().await?;
        if !response.status().is_success() {
            tracing::debug!(status = %response.status(), "status endpoint answered non-200");
            return Ok(None);
        }
        Ok(Some(response.json::<StatusRecord>().await?))
    }

    /// Default payload location for a finished job.
    pub fn download_url(&self, job: &JobHandle) -> Result<Url> {
        join(
            &job.server,
            &format!("/api/fetch/request/{}/download", job.handoff),
        )
    }

    /// Opens the payload stream and checks the response status; the body is
    /// consumed later by [`save_response`].
    pub async fn start_download(&self, url: Url) -> Result<reqwest::Response> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(REFERER, self.root_referer.clone());

        tracing::debug!(%url, "fetching the audio payload");
        let response = self.http.get(url).headers(headers).send().await?;
        if !response.status().is_success() {
            return Err(RipError::Service(format!(
                "download endpoint answered HTTP {}",
                response.status()
            )));
        }
        Ok(response)
    }

    fn load_url(&self) -> Result<Url> {
        let mut url = join(&self.endpoint, "/api/load")?;
        url.query_pairs_mut().append_pair("url", STREAM_API_PATH);
        Ok(url)
    }

    fn submit_request(&self, track_id: &str) -> SubmitRequest {
        SubmitRequest {
            url: format!("http://www.tidal.com/track/{track_id}"),
            metadata: true,
            compat: false,
            private: true,
            handoff: true,
            account: AccountSpec {
                kind: "country",
                id: "auto",
            },
            upload: UploadSpec {
                enabled: false,
                service: "pixeldrain",
            },
            downscale: "original",
            token: TokenSpec {
                primary: self.token.clone(),
                expiry: token_expiry(),
            },
        }
    }

    /// Jobs live on a named sibling of the endpoint host, e.g. `katze` on
    /// `lucida.to` is `katze.lucida.to`.
    fn server_base(&self, name: &str) -> Result<Url> {
        let host = self
            .endpoint
            .host_str()
            .ok_or_else(|| RipError::Service("endpoint URL has no host".to_string()))?;
        let subdomain = format!("{name}.{host}");
        let mut server = self.endpoint.clone();
        server.set_host(Some(&subdomain)).map_err(|err| {
            RipError::Service(format!("bad handoff server {subdomain}: {err}"))
        })?;
        Ok(server)
    }

    fn service_headers(&self, referer: &HeaderValue) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(ORIGIN, self.origin.clone());
        headers.insert(REFERER, referer.clone());
        headers
    }
}

/// Streams a response body into `dest`, going through a `.part` sibling so
/// an interrupted transfer never leaves a file under the final name.
pub async fn save_response(response: reqwest::Response, dest: &Path) -> Result<u64> {
    let mut part = dest.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);

    match write_stream(response, &part).await {
        Ok(written) => {
            fs::rename(&part, dest).map_err(|source| {
                let _ = fs::remove_file(&part);
                RipError::Write {
                    path: dest.to_path_buf(),
                    source,
                }
            })?;
            Ok(written)
        }
        Err(err) => {
            let _ = fs::remove_file(&part);
            Err(err)
        }
    }
}

async fn write_stream(response: reqwest::Response, part: &Path) -> Result<u64> {
    let mut file = File::create(part).map_err(|source| RipError::Write {
        path: part.to_path_buf(),
        source,
    })?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).map_err(|source| RipError::Write {
            path: part.to_path_buf(),
            source,
        })?;
        written += chunk.len() as u64;
    }
    Ok(written)
}

/// File extension advertised by the download response, if any. Only plain
/// alphanumeric extensions are accepted.
pub fn attachment_extension(response: &reqwest::Response) -> Option<String> {
    let disposition = response.headers().get(CONTENT_DISPOSITION)?.to_str().ok()?;
    extension_from_disposition(disposition)
}

fn extension_from_disposition(disposition: &str) -> Option<String> {
    let raw = disposition.split("filename=").nth(1)?;
    let name = raw.split(';').next()?.trim().trim_matches('"');
    let ext = Path::new(name).extension()?.to_str()?;
    let usable = !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric());
    usable.then(|| ext.to_ascii_lowercase())
}

fn token_expiry() -> u64 {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs());
    now + TOKEN_VALIDITY_SECS
}

fn join(base: &Url, path: &str) -> Result<Url> {
    base.join(path)
        .map_err(|err| RipError::Service(format!("bad service URL {path}: {err}")))
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|err| RipError::Service(format!("unusable header value {value}: {err}")))
}

/// Pulls "Title by Artist" out of the page title or the og:title meta tag.
fn parse_track_page(html: &str) -> Option<TrackMetadata> {
    let title_tag = slice_between(html, "<title>", "</title>").map(str::trim);
    let from_title = title_tag
        .and_then(|inner| inner.strip_suffix("| lucida"))
        .map(str::trim_end);
    let from_og = slice_between(
        html,
        "<meta property=\"og:title\" content=\"Download ",
        " on Lucida for free\"",
    );

    let candidate = from_title.or(from_og).or(title_tag)?;
    split_title_by(candidate)
}

fn split_title_by(text: &str) -> Option<TrackMetadata> {
    let (title, rest) = text.split_once(" by ")?;
    let artist = match rest.find(" |") {
        Some(cut) => &rest[..cut],
        None => rest,
    };

    let title = unescape_html(title.trim());
    let artist = unescape_html(artist.trim());
    if title.is_empty() || artist.is_empty() {
        return None;
    }
    Some(TrackMetadata { artist, title })
}

fn slice_between<'a>(haystack: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = haystack.find(start)? + start.len();
    let len = haystack[from..].find(end)?;
    Some(&haystack[from..from + len])
}

/// Decodes the entities that show up in scraped titles; anything unknown is
/// left as written.
fn unescape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        // entity payloads are short; "#x10FFFF" is the longest we accept
        match rest[1..].find(';').map(|i| i + 1) {
            Some(semi) if semi <= 9 => match decode_entity(&rest[1..semi]) {
                Some(decoded) => {
                    out.push(decoded);
                    rest = &rest[semi + 1..];
                }
                None => {
                    out.push('&');
                    rest = &rest[1..];
                }
            },
            _ => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let code = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X"))
            {
                u32::from_str_radix(hex, 16).ok()?
            } else if let Some(dec) = name.strip_prefix('#') {
                dec.parse().ok()?
            } else {
                return None;
            };
            char::from_u32(code)
        }
    }
}
