//! Pipeline orchestration: submit the job, poll it, download the payload.

use crate::api::{self, JobHandle, LucidaClient, StatusRecord, TrackMetadata};
use crate::error::{Result, RipError};
use crate::events::{self, Event};
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use unicode_normalization::UnicodeNormalization;
use url::Url;

const DEFAULT_EXTENSION: &str = "flac";
const MAX_STEM_CHARS: usize = 150;

/// Everything one invocation needs.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub track_url: String,
    pub output_dir: PathBuf,
    pub endpoint: Url,
    pub token: String,
    pub poll: PollPolicy,
}

/// Poll loop limits. The loop stops at whichever budget runs out first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub budget: Duration,
    pub max_polls: u32,
}

impl PollPolicy {
    pub const DEFAULT_INTERVAL_SECS: u64 = 2;
    pub const DEFAULT_BUDGET_SECS: u64 = 300;
    pub const DEFAULT_MAX_POLLS: u32 = 150;

    fn exhausted(&self, elapsed: Duration, polls: u32) -> bool {
        elapsed >= self.budget || polls >= self.max_polls
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(Self::DEFAULT_INTERVAL_SECS),
            budget: Duration::from_secs(Self::DEFAULT_BUDGET_SECS),
            max_polls: Self::DEFAULT_MAX_POLLS,
        }
    }
}

/// Job lifecycle as reported by the service. Anything that is not an
/// explicit terminal tag counts as still pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Metadata,
    Completed,
    Failed,
}

impl JobState {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "completed" => JobState::Completed,
            "error" => JobState::Failed,
            "metadata" => JobState::Metadata,
            _ => JobState::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Success,
    Fail,
}

/// The final stdout line: what happened, and where the file is.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub tidal_url: String,
    pub status: ReportStatus,
    pub message: String,
    pub file_path: Option<PathBuf>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == ReportStatus::Success
    }
}

/// Runs the whole pipeline and folds the outcome into a [`RunReport`].
/// Progress events are printed along the way; the report itself is left to
/// the caller so it stays the last line on stdout.
pub async fn run(opts: &RunOptions) -> RunReport {
    match execute(opts).await {
        Ok(path) => RunReport {
            tidal_url: opts.track_url.clone(),
            status: ReportStatus::Success,
            message: "Track downloaded successfully".to_string(),
            file_path: Some(path),
        },
        Err(err) => {
            tracing::error!(%err, "pipeline aborted");
            RunReport {
                tidal_url: opts.track_url.clone(),
                status: ReportStatus::Fail,
                message: err.to_string(),
                file_path: None,
            }
        }
    }
}

async fn execute(opts: &RunOptions) -> Result<PathBuf> {
    let track_id = parse_track_id(&opts.track_url)?;
    std::fs::create_dir_all(&opts.output_dir).map_err(|source| RipError::Write {
        path: opts.output_dir.clone(),
        source,
    })?;

    let client = LucidaClient::new(&opts.endpoint, &opts.track_url, &opts.token)?;

    let mut meta = client.track_page_metadata().await;
    events::emit(&Event::track_info(
        meta.as_ref().map(|m| m.artist.as_str()),
        meta.as_ref().map(|m| m.title.as_str()),
    ));

    let job = client.submit_job(&track_id).await?;
    tracing::info!(handoff = %job.handoff, server = %job.server, "conversion job accepted");
    events::emit(&Event::download_initiated(&job.handoff));

    let done = poll_until_terminal(&client, &job, &opts.poll, &mut meta).await?;

    let result_url = match done.url.as_deref() {
        Some(explicit) => job.server.join(explicit).map_err(|err| {
            RipError::Service(format!("bad result URL {explicit}: {err}"))
        })?,
        None => client.download_url(&job)?,
    };
    let response = client.start_download(result_url).await?;

    let ext =
        api::attachment_extension(&response).unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
    let file_name = build_filename(meta.as_ref(), &track_id, &ext);
    let dest = opts.output_dir.join(&file_name);
    events::emit(&Event::downloading(&file_name, &dest));

    let bytes = api::save_response(response, &dest).await?;
    tracing::info!(bytes, path = %dest.display(), "download finished");
    Ok(dest)
}

/// Polls until the job reaches a terminal state, re-emitting every decoded
/// record and folding any artist/title it carries into `meta`.
async fn poll_until_terminal(
    client: &LucidaClient,
    job: &JobHandle,
    policy: &PollPolicy,
    meta: &mut Option<TrackMetadata>,
) -> Result<StatusRecord> {
    let started = Instant::now();
    let mut polls: u32 = 0;

    loop {
        if policy.exhausted(started.elapsed(), polls) {
            return Err(RipError::PollTimeout {
                polls,
                elapsed: started.elapsed(),
            });
        }
        tokio::time::sleep(policy.interval).await;

        polls += 1;
        let Some(record) = client.job_status(job).await? else {
            continue;
        };
        events::emit(&record);
        if let Some(update) = record.track_metadata() {
            *meta = Some(update);
        }

        match JobState::from_tag(&record.status) {
            JobState::Completed => return Ok(record),
            JobState::Failed => {
                let message = record
                    .message
                    .clone()
                    .unwrap_or_else(|| "the service reported an error".to_string());
                return Err(RipError::JobFailed(message));
            }
            JobState::Pending | JobState::Metadata => {}
        }
    }
}

/// Extracts the numeric track id from a `https://listen.tidal.com/track/...`
/// URL. Digits are taken from the front of the id segment, so trailing junk
/// after the number is tolerated.
pub fn parse_track_id(input: &str) -> Result<String> {
    let invalid = || RipError::InvalidUrl(input.to_string());

    let url = Url::parse(input).map_err(|_| invalid())?;
    if url.scheme() != "https" || url.host_str() != Some("listen.tidal.com") {
        return Err(invalid());
    }

    let mut segments = url.path_segments().ok_or_else(|| invalid())?;
    if segments.next() != Some("track") {
        return Err(invalid());
    }
    let id: String = segments
        .next()
        .unwrap_or("")
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    if id.is_empty() {
        return Err(invalid());
    }
    Ok(id)
}

/// `<Artist> - <Title>.<ext>` with the stem NFC-normalized and unsafe
/// characters removed, or a track-id fallback when no metadata was obtained.
pub fn build_filename(meta: Option<&TrackMetadata>, track_id: &str, ext: &str) -> String {
    match meta {
        Some(meta) => {
            let stem = sanitize_stem(&format!("{} - {}", meta.artist, meta.title));
            format!("{stem}.{ext}")
        }
        None => format!("tidal_track_{track_id}.{ext}"),
    }
}

fn sanitize_stem(stem: &str) -> String {
    stem.nfc()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .take(MAX_STEM_CHARS)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_track_id_accepts_plain_track_urls() {
        let id = parse_track_id("https://listen.tidal.com/track/276414001").unwrap();
        assert_eq!(id, "276414001");
    }

    #[test]
    fn parse_track_id_ignores_query_and_extra_segments() {
        assert_eq!(
            parse_track_id("https://listen.tidal.com/track/276414001?u=abc").unwrap(),
            "276414001"
        );
        assert_eq!(
            parse_track_id("https://listen.tidal.com/track/99/anything").unwrap(),
            "99"
        );
        assert_eq!(
            parse_track_id("https://listen.tidal.com/track/99abc").unwrap(),
            "99"
        );
    }

    #[test]
    fn parse_track_id_rejects_other_urls() {
        let rejected = [
            "https://listen.tidal.com/album/276414001",
            "https://listen.tidal.com/track/",
            "https://listen.tidal.com/track/abc",
            "https://www.tidal.com/track/276414001",
            "http://listen.tidal.com/track/276414001",
            "not a url",
        ];
        for input in rejected {
            let err = parse_track_id(input).unwrap_err();
            assert!(
                matches!(err, RipError::InvalidUrl(_)),
                "{input} should be invalid"
            );
        }
    }

    #[test]
    fn job_state_maps_service_tags() {
        assert_eq!(JobState::from_tag("completed"), JobState::Completed);
        assert_eq!(JobState::from_tag("error"), JobState::Failed);
        assert_eq!(JobState::from_tag("metadata"), JobState::Metadata);
        assert_eq!(JobState::from_tag("pending"), JobState::Pending);
        assert_eq!(JobState::from_tag("ripping"), JobState::Pending);
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Metadata.is_terminal());
    }

    #[test]
    fn poll_policy_defaults_match_the_service_cadence() {
        let policy = PollPolicy::default();
        assert_eq!(policy.interval, Duration::from_secs(2));
        assert_eq!(policy.budget, Duration::from_secs(300));
        assert_eq!(policy.max_polls, 150);
    }

    #[test]
    fn poll_policy_exhausts_on_either_budget() {
        let policy = PollPolicy {
            interval: Duration::from_millis(10),
            budget: Duration::from_secs(1),
            max_polls: 3,
        };
        assert!(!policy.exhausted(Duration::from_millis(500), 2));
        assert!(policy.exhausted(Duration::from_secs(1), 0));
        assert!(policy.exhausted(Duration::ZERO, 3));
    }

    fn meta(artist: &str, title: &str) -> TrackMetadata {
        TrackMetadata {
            artist: artist.to_string(),
            title: title.to_string(),
        }
    }

    #[test]
    fn filename_joins_artist_and_title() {
        let name = build_filename(Some(&meta("Kelela", "Rewind")), "1", "flac");
        assert_eq!(name, "Kelela - Rewind.flac");
    }

    #[test]
    fn filename_strips_unsafe_characters() {
        let name = build_filename(
            Some(&meta("AC/DC", "Back: In? <Black>*\"|\\")),
            "1",
            "flac",
        );
        assert_eq!(name, "ACDC - Back In Black.flac");
    }

    #[test]
    fn filename_truncates_the_stem_to_150_chars() {
        let name = build_filename(Some(&meta(&"a".repeat(100), &"é".repeat(100))), "1", "flac");
        let stem = name.strip_suffix(".flac").unwrap();
        assert_eq!(stem.chars().count(), 150);
    }

    #[test]
    fn filename_is_deterministic() {
        let input = meta("Sigur Rós", "Svefn-g-englar");
        assert_eq!(
            build_filename(Some(&input), "1", "flac"),
            build_filename(Some(&input), "1", "flac")
        );
    }

    #[test]
    fn filename_normalizes_decomposed_characters() {
        let decomposed = build_filename(Some(&meta("Beyonce\u{301}", "Halo")), "1", "flac");
        assert_eq!(decomposed, "Beyoncé - Halo.flac");
        assert_eq!(
            decomposed,
            build_filename(Some(&meta("Beyoncé", "Halo")), "1", "flac")
        );
    }

    #[test]
    fn filename_falls_back_to_the_track_id() {
        assert_eq!(build_filename(None, "276414001", "flac"), "tidal_track_276414001.flac");
        assert_eq!(build_filename(None, "9", "mp3"), "tidal_track_9.mp3");
    }
}
