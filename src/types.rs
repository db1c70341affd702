//! Core identifier types shared across the workflow engine.

use serde::{Deserialize, Serialize};

/// Identifies a stage in the workflow graph.
///
/// `Start` and `End` are virtual endpoints used only for topology; they are
/// never registered with an executable stage. `Custom` allows embedders to
/// splice their own stages into a graph without extending this enum.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageKind {
    Start,
    Routing,
    SimpleExtract,
    ParallelExtract,
    Decide,
    Execute,
    Respond,
    End,
    Custom(String),
}

impl StageKind {
    /// Stable string encoding used in persisted checkpoints and metadata.
    ///
    /// Unknown encodings round-trip through [`StageKind::decode`] as
    /// `Custom(encoded)`, keeping old checkpoints loadable.
    pub fn encode(&self) -> String {
        match self {
            StageKind::Start => "Start".into(),
            StageKind::Routing => "Routing".into(),
            StageKind::SimpleExtract => "SimpleExtract".into(),
            StageKind::ParallelExtract => "ParallelExtract".into(),
            StageKind::Decide => "Decide".into(),
            StageKind::Execute => "Execute".into(),
            StageKind::Respond => "Respond".into(),
            StageKind::End => "End".into(),
            StageKind::Custom(name) => format!("Custom:{name}"),
        }
    }

    pub fn decode(s: &str) -> Self {
        match s {
            "Start" => StageKind::Start,
            "Routing" => StageKind::Routing,
            "SimpleExtract" => StageKind::SimpleExtract,
            "ParallelExtract" => StageKind::ParallelExtract,
            "Decide" => StageKind::Decide,
            "Execute" => StageKind::Execute,
            "Respond" => StageKind::Respond,
            "End" => StageKind::End,
            other => match other.strip_prefix("Custom:") {
                Some(name) => StageKind::Custom(name.to_string()),
                None => StageKind::Custom(other.to_string()),
            },
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Which processing path an invocation takes after routing analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutePath {
    /// Cheap pipeline: rules-only extraction, sequential tool execution.
    Simple,
    /// Rich pipeline: concurrent extraction methods, grouped tool execution.
    Parallel,
}

impl RoutePath {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutePath::Simple => "simple",
            RoutePath::Parallel => "parallel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "simple" => Some(RoutePath::Simple),
            "parallel" => Some(RoutePath::Parallel),
            _ => None,
        }
    }
}

impl std::fmt::Display for RoutePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_kind_encode_decode_roundtrip() {
        let kinds = [
            StageKind::Start,
            StageKind::Routing,
            StageKind::SimpleExtract,
            StageKind::ParallelExtract,
            StageKind::Decide,
            StageKind::Execute,
            StageKind::Respond,
            StageKind::End,
            StageKind::Custom("audit".into()),
        ];
        for kind in kinds {
            assert_eq!(StageKind::decode(&kind.encode()), kind);
        }
    }

    #[test]
    fn unknown_encoding_becomes_custom() {
        assert_eq!(
            StageKind::decode("SomethingNew"),
            StageKind::Custom("SomethingNew".into())
        );
    }

    #[test]
    fn route_path_strings() {
        assert_eq!(RoutePath::Simple.as_str(), "simple");
        assert_eq!(RoutePath::parse("parallel"), Some(RoutePath::Parallel));
        assert_eq!(RoutePath::parse("fast"), None);
    }
}
