//! Per-record content download and parsing.

use drev_core::{join_remote, CandidateFolder, Metrics, ScoresPresent};
use drev_storage::{RemoteEntry, RemoteSession, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

pub const DEFAULT_TRANSCRIPT_FILE: &str = "dialog.txt";
pub const DEFAULT_METRICS_FILE: &str = "metadata.json";

/// Selects one file inside a record folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileMatch {
    Exact(String),
    /// First file in listing order with this extension.
    Extension(String),
}

impl FileMatch {
    fn needs_listing(&self) -> bool {
        matches!(self, FileMatch::Extension(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AudioLocator {
    #[default]
    None,
    /// `<root>/<date folder>/<leaf>.<extension>` in a parallel audio tree.
    SiblingTree { root: String, extension: String },
    /// First file inside the record folder with one of `extensions`.
    InFolder { extensions: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentLayout {
    #[serde(default = "default_transcript")]
    pub transcript: FileMatch,
    #[serde(default = "default_metrics")]
    pub metrics: FileMatch,
    #[serde(default)]
    pub audio: AudioLocator,
}

fn default_transcript() -> FileMatch {
    FileMatch::Exact(DEFAULT_TRANSCRIPT_FILE.to_string())
}

fn default_metrics() -> FileMatch {
    FileMatch::Exact(DEFAULT_METRICS_FILE.to_string())
}

impl Default for ContentLayout {
    fn default() -> Self {
        Self {
            transcript: default_transcript(),
            metrics: default_metrics(),
            audio: AudioLocator::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentOutcome<T> {
    Present(T),
    Missing,
    Unreadable(String),
    Malformed(String),
}

impl<T> ContentOutcome<T> {
    pub fn is_present(&self) -> bool {
        matches!(self, ContentOutcome::Present(_))
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, ContentOutcome::Missing)
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, ContentOutcome::Malformed(_))
    }

    pub fn present(&self) -> Option<&T> {
        match self {
            ContentOutcome::Present(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedMetrics {
    pub metrics: Metrics,
    pub summary: String,
    pub present: ScoresPresent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedContent {
    pub transcript: ContentOutcome<String>,
    pub metrics: ContentOutcome<ParsedMetrics>,
    pub audio_reference: Option<String>,
}

impl FetchedContent {
    pub fn transcript_text(&self) -> String {
        self.transcript.present().cloned().unwrap_or_default()
    }

    pub fn metrics_or_default(&self) -> Metrics {
        self.metrics
            .present()
            .map(|parsed| parsed.metrics.clone())
            .unwrap_or_default()
    }

    pub fn summary(&self) -> String {
        self.metrics
            .present()
            .map(|parsed| parsed.summary.clone())
            .unwrap_or_default()
    }
}

pub struct ContentFetcher {
    layout: ContentLayout,
}

impl ContentFetcher {
    pub fn new(layout: ContentLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &ContentLayout {
        &self.layout
    }

    /// Downloads and parses the transcript and metrics of one record folder.
    ///
    /// Missing or broken files become typed outcomes; only a failure of the
    /// session itself is returned as an error.
    pub async fn fetch(
        &self,
        session: &mut dyn RemoteSession,
        candidate: &CandidateFolder,
    ) -> Result<FetchedContent, TransportError> {
        let folder = candidate.remote_path();
        let needs_listing = self.layout.transcript.needs_listing()
            || self.layout.metrics.needs_listing()
            || matches!(self.layout.audio, AudioLocator::InFolder { .. });

        let listing: Result<Vec<RemoteEntry>, String> = if needs_listing {
            match session.list(&folder).await {
                Ok(entries) => Ok(entries.into_iter().filter(RemoteEntry::is_file).collect()),
                Err(err) if err.is_session_failure() => return Err(err),
                Err(err) => Err(err.to_string()),
            }
        } else {
            Ok(Vec::new())
        };

        let transcript = self
            .download(session, &folder, &self.layout.transcript, &listing)
            .await?;
        let transcript = match transcript {
            ContentOutcome::Present(bytes) => {
                ContentOutcome::Present(String::from_utf8_lossy(&bytes).into_owned())
            }
            ContentOutcome::Missing => ContentOutcome::Missing,
            ContentOutcome::Unreadable(msg) => ContentOutcome::Unreadable(msg),
            ContentOutcome::Malformed(msg) => ContentOutcome::Malformed(msg),
        };

        let metrics = self
            .download(session, &folder, &self.layout.metrics, &listing)
            .await?;
        let metrics = match metrics {
            ContentOutcome::Present(bytes) => match parse_metrics(&bytes) {
                Ok(parsed) => ContentOutcome::Present(parsed),
                Err(msg) => ContentOutcome::Malformed(msg),
            },
            ContentOutcome::Missing => ContentOutcome::Missing,
            ContentOutcome::Unreadable(msg) => ContentOutcome::Unreadable(msg),
            ContentOutcome::Malformed(msg) => ContentOutcome::Malformed(msg),
        };

        let audio_reference = match &self.layout.audio {
            AudioLocator::None => None,
            AudioLocator::SiblingTree { root, extension } => Some(join_remote(
                root,
                &format!(
                    "{}/{}.{}",
                    candidate.date_folder.trim_matches('/'),
                    candidate.leaf.trim(),
                    extension.trim_start_matches('.')
                ),
            )),
            AudioLocator::InFolder { extensions } => listing.as_ref().ok().and_then(|files| {
                files
                    .iter()
                    .find(|f| extensions.iter().any(|ext| has_extension(&f.name, ext)))
                    .map(|f| join_remote(&folder, &f.name))
            }),
        };

        Ok(FetchedContent {
            transcript,
            metrics,
            audio_reference,
        })
    }

    async fn download(
        &self,
        session: &mut dyn RemoteSession,
        folder: &str,
        file: &FileMatch,
        listing: &Result<Vec<RemoteEntry>, String>,
    ) -> Result<ContentOutcome<Vec<u8>>, TransportError> {
        let name = match file {
            FileMatch::Exact(name) => name.clone(),
            FileMatch::Extension(ext) => match listing {
                Err(msg) => return Ok(ContentOutcome::Unreadable(msg.clone())),
                Ok(files) => match files.iter().find(|f| has_extension(&f.name, ext)) {
                    Some(found) => found.name.clone(),
                    None => return Ok(ContentOutcome::Missing),
                },
            },
        };

        let path = join_remote(folder, &name);
        match session.download(&path).await {
            Ok(bytes) => Ok(ContentOutcome::Present(bytes)),
            Err(err) if err.is_not_found() => {
                debug!(path = %path, "content file missing");
                Ok(ContentOutcome::Missing)
            }
            Err(err) if err.is_session_failure() => Err(err),
            Err(err) => Ok(ContentOutcome::Unreadable(err.to_string())),
        }
    }
}

fn has_extension(name: &str, ext: &str) -> bool {
    let ext = ext.trim_start_matches('.');
    name.rsplit_once('.')
        .is_some_and(|(stem, found)| !stem.is_empty() && found.eq_ignore_ascii_case(ext))
}

/// First usable value of `names`, nested `metrics.<name>` before top-level
/// `<name>`. Values `conv` rejects fall through to the next candidate.
fn lookup_with<T>(
    doc: &JsonValue,
    names: &[&str],
    conv: fn(&JsonValue) -> Option<T>,
) -> Option<T> {
    let scopes = [doc.get("metrics"), Some(doc)];
    scopes
        .into_iter()
        .flatten()
        .find_map(|scope| names.iter().find_map(|name| scope.get(*name).and_then(conv)))
}

fn as_number(value: &JsonValue) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn as_flag(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => n.as_f64().map(|v| v != 0.0),
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parses a metrics payload; absent fields take their defaults.
pub fn parse_metrics(bytes: &[u8]) -> Result<ParsedMetrics, String> {
    let doc: JsonValue = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    if !doc.is_object() {
        return Err("metrics payload is not a JSON object".to_string());
    }

    let defaults = Metrics::default();
    let politeness = lookup_with(&doc, &["politeness"], as_number);
    let friendliness = lookup_with(&doc, &["friendliness"], as_number);
    let rudeness = lookup_with(&doc, &["rudeness"], as_number);
    let manipulativeness = lookup_with(&doc, &["manipulativeness"], as_number);
    let present = ScoresPresent {
        politeness: politeness.is_some(),
        friendliness: friendliness.is_some(),
        rudeness: rudeness.is_some(),
        manipulativeness: manipulativeness.is_some(),
    };

    let metrics = Metrics {
        politeness: politeness.unwrap_or(defaults.politeness),
        friendliness: friendliness.unwrap_or(defaults.friendliness),
        rudeness: rudeness.unwrap_or(defaults.rudeness),
        manipulativeness: manipulativeness.unwrap_or(defaults.manipulativeness),
        said_hello: lookup_with(&doc, &["said_hello", "saidHello"], as_flag)
            .unwrap_or(defaults.said_hello),
        duration_secs: lookup_with(&doc, &["duration"], as_number),
        quality: lookup_with(&doc, &["quality"], as_text),
        sale_occurred: lookup_with(&doc, &["sale_occurred"], as_flag),
    };
    let summary = lookup_with(&doc, &["summary"], as_text).unwrap_or_default();

    Ok(ParsedMetrics {
        metrics,
        summary,
        present,
    })
}
