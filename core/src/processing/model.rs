//! Processing run records and artifacts.

use std::fmt;
use std::str::FromStr;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::packet::LeagueId;
use crate::packet::PacketNameError;

pub type RunId = String;

/// Which leagues a run drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunScope {
    All,
    League(LeagueId),
}

impl RunScope {
    pub fn includes(&self, league: &LeagueId) -> bool {
        match self {
            RunScope::All => true,
            RunScope::League(only) => only == league,
        }
    }
}

impl fmt::Display for RunScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunScope::All => f.write_str("all"),
            RunScope::League(league) => write!(f, "{league}"),
        }
    }
}

impl FromStr for RunScope {
    type Err = PacketNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            Ok(RunScope::All)
        } else {
            s.parse().map(RunScope::League)
        }
    }
}

impl Serialize for RunScope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RunScope {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Score,
    Routes,
    Bbsinfo,
}

impl ArtifactKind {
    /// Classify an engine output file by name. Score screens are ANSI files;
    /// the route and BBS reports have fixed names.
    pub fn classify(filename: &str) -> Option<Self> {
        let lower = filename.to_ascii_lowercase();
        if lower == "routes.lst" {
            Some(ArtifactKind::Routes)
        } else if lower == "bbsinfo.lst" {
            Some(ArtifactKind::Bbsinfo)
        } else if lower.ends_with(".ans") && lower.len() > ".ans".len() {
            Some(ArtifactKind::Score)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Score => "score",
            ArtifactKind::Routes => "routes",
            ArtifactKind::Bbsinfo => "bbsinfo",
        }
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "score" => Ok(ArtifactKind::Score),
            "routes" => Ok(ArtifactKind::Routes),
            "bbsinfo" => Ok(ArtifactKind::Bbsinfo),
            other => Err(format!("unknown artifact kind {other:?}")),
        }
    }
}

/// A parsed engine output file awaiting commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingArtifact {
    pub league: LeagueId,
    pub filename: String,
    pub kind: ArtifactKind,
    pub content: Vec<u8>,
    pub rendered: Option<String>,
}

impl ProcessingArtifact {
    pub fn new(league: LeagueId, filename: String, kind: ArtifactKind, content: Vec<u8>) -> Self {
        let rendered = Some(render_text(&content));
        Self {
            league,
            filename,
            kind,
            content,
            rendered,
        }
    }
}

/// Strip ANSI escapes and collapse runs of blank lines into one.
pub fn render_text(content: &[u8]) -> String {
    let stripped = strip_ansi_escapes::strip(content);
    let text = String::from_utf8_lossy(&stripped);
    let mut out = String::with_capacity(text.len());
    let mut previous_blank = false;
    for line in text.lines() {
        let line = line.trim_end();
        let blank = line.is_empty();
        if blank && previous_blank {
            continue;
        }
        out.push_str(line);
        out.push('\n');
        previous_blank = blank;
    }
    out.trim_matches('\n').to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub league: LeagueId,
    pub filename: String,
    pub kind: ArtifactKind,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendered: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingRun {
    pub id: RunId,
    pub scope: RunScope,
    pub status: RunStatus,
    pub triggered_by: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logs: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Filenames of inbound packets this run consumed.
    #[serde(default)]
    pub consumed_packets: Vec<String>,
    /// Filenames of outbound packets this run deposited.
    #[serde(default)]
    pub produced_packets: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactSummary>,
}
