//! Extraction, calibration and aggregation of GPS tracks embedded in action-camera videos.

use std::path::PathBuf;

use chrono::{DateTime, FixedOffset, SecondsFormat};
use serde::{Serialize, Serializer};
use thiserror::Error;

pub mod calibrate;
pub mod dataset;
pub mod distance;
pub mod extract;
pub mod gpx;

pub use calibrate::{calibrate, Calibrated, CalibrationEvent};
pub use dataset::{
    build_dataset, discover_videos, load_boundaries, write_dataset, Boundary, Dataset,
    DatasetPoint, VideoFailure,
};
pub use distance::{haversine_km, haversine_km_with_radius, track_length};
pub use extract::{extract_track, random_token, CommandExtractor, ExtractedFiles, Extractor};
pub use gpx::{parse_gpx, read_track, video_identifier};

/// Mean Earth radius used by the haversine formula.
pub const EARTH_RADIUS_KM: f64 = 6371.0;
/// Segments longer than this are treated as GPS glitches (100 mm).
pub const CALIBRATION_THRESHOLD_KM: f64 = 0.0001;
/// Directory name that anchors the per-point video identifier.
pub const VIDEO_ANCHOR: &str = "road-data";
pub const DEFAULT_EXTRACTOR: &str = "gopro2gpx";
pub const DEFAULT_OUTPUT: &str = "goprodata.json";
pub const DEFAULT_BOUNDARY_DIR: &str = "boundaries";

#[derive(Error, Debug)]
pub enum TrackError {
    #[error("not a recognized camera video file: {0}")]
    ExtractionFailed(String),
    #[error("malformed GPX track: {0}")]
    MalformedTrack(String),
    #[error("GPX track contains no points")]
    EmptyTrack,
    #[error("failed to parse track of {}: {source}", video.display())]
    TrackParseFailed {
        video: PathBuf,
        #[source]
        source: Box<TrackError>,
    },
    #[error("video path {} has no '{anchor}' component", path.display())]
    MissingAnchor { path: PathBuf, anchor: String },
    #[error("invalid boundary file {}: {reason}", path.display())]
    BoundaryLoad { path: PathBuf, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// What the calibration pass does with the final point of a track.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrailingPoint {
    /// Never evaluated as a segment start, so never emitted. Matches the historical datasets.
    Drop,
    /// Emitted unless the preceding segment flagged it as a glitch.
    Keep,
}

impl Default for TrailingPoint {
    fn default() -> Self {
        TrailingPoint::Drop
    }
}

/// How the aggregator reacts when a single video fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// The first failure aborts the whole run and nothing is written.
    Abort,
    /// Failed videos are logged, recorded in `Dataset::errors` and left out.
    Skip,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::Abort
    }
}

#[derive(Clone, Debug)]
pub struct Params {
    pub earth_radius_km: f64,
    pub calibration_threshold_km: f64,
    pub trailing_point: TrailingPoint,
    pub video_anchor: String,
    pub temp_dir: PathBuf,
    pub failure_policy: FailurePolicy,
    pub parallel: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            earth_radius_km: EARTH_RADIUS_KM,
            calibration_threshold_km: CALIBRATION_THRESHOLD_KM,
            trailing_point: TrailingPoint::default(),
            video_anchor: VIDEO_ANCHOR.to_string(),
            temp_dir: std::env::temp_dir(),
            failure_policy: FailurePolicy::default(),
            parallel: false,
        }
    }
}

/// One GPS sample, serialized with the short keys the map front end reads.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackPoint {
    #[serde(rename = "lat")]
    pub latitude: f64,
    #[serde(rename = "lng")]
    pub longitude: f64,
    #[serde(rename = "ele")]
    pub elevation: f64,
    #[serde(rename = "time", serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<FixedOffset>,
    /// Seconds since the track's start time.
    #[serde(rename = "duration")]
    pub elapsed_s: f64,
    pub speed: f64,
    /// Video path from the anchor directory onward, `/`-separated.
    pub video: String,
}

fn serialize_timestamp<S: Serializer>(
    ts: &DateTime<FixedOffset>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

#[derive(Clone, Debug)]
pub struct Track {
    pub start_time: DateTime<FixedOffset>,
    pub points: Vec<TrackPoint>,
    /// Elapsed time of the last parsed point, taken before calibration drops anything.
    pub total_duration_s: f64,
}

impl Track {
    /// Great-circle length of the current point sequence.
    pub fn length_km(&self, params: &Params) -> f64 {
        track_length(&self.points, params.earth_radius_km)
    }
}
