use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::Display;

/// Lifecycle state of a single deployed instance.
#[derive(Clone, Copy, Debug, Deserialize, Display, Serialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum State {
    Initializing,
    Running,
    Stopped,
    Failed,
}

impl State {
    /// Stopped and failed instances never serve again; a new instance id is
    /// needed to bring the model back up.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Stopped | State::Failed)
    }
}

/// The half of a model bundle an instance serves.
///
/// The two halves differ only in which bundle subtree they run from, which
/// entrypoint they fall back to, and whether they are handed the URL of a
/// running inference API.
#[derive(Clone, Copy, Debug, Deserialize, Display, Serialize, Eq, PartialEq, Hash)]
pub enum Kind {
    #[serde(rename = "web_app")]
    #[strum(serialize = "web_app")]
    Web,
    #[serde(rename = "inference_app")]
    #[strum(serialize = "inference_app")]
    Inference,
}

impl Kind {
    /// Directory name of this half inside bundles, source trees and sandbox
    /// directory names. Doubles as the key in the descriptor requirements
    /// split.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Kind::Web => "web_app",
            Kind::Inference => "inference_app",
        }
    }

    /// Entrypoint used when the app ships no `app.py`.
    pub fn fallback_entry(&self) -> &'static str {
        match self {
            Kind::Web => "web.py",
            Kind::Inference => "inference.py",
        }
    }

    /// Only web halves are told where a running inference API lives.
    pub fn wants_inference_url(&self) -> bool {
        matches!(self, Kind::Web)
    }

    pub fn all() -> [Kind; 2] {
        [Kind::Web, Kind::Inference]
    }
}

#[derive(thiserror::Error, Debug)]
#[error("unknown app type: {0}")]
pub struct UnknownKind(String);

impl FromStr for Kind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web_app" => Ok(Kind::Web),
            "inference_app" => Ok(Kind::Inference),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}
