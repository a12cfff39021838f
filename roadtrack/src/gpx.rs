//! GPX 1.1 reader for the tracks written by the extraction utility.
//!
//! Only the first `<trk>/<trkseg>` is read. Every `<trkpt>` must carry `lat`/`lon`, `<ele>`,
//! `<time>` and a Garmin `TrackPointExtension` `<speed>`; a point missing any of them fails the
//! whole parse.

use std::fs;
use std::path::{Component, Path};

use chrono::{DateTime, FixedOffset};
use roxmltree::{Document, Node};

use crate::{Track, TrackError, TrackPoint};

const GPX_NS: &str = "http://www.topografix.com/GPX/1/1";
const TPX_V2_NS: &str = "http://www.garmin.com/xmlschemas/TrackPointExtension/v2";
const TPX_V1_NS: &str = "http://www.garmin.com/xmlschemas/TrackPointExtension/v1";

/// Read and parse a GPX file produced for `video`.
pub fn read_track(gpx_path: &Path, video: &str) -> Result<Track, TrackError> {
    let text = fs::read_to_string(gpx_path)?;
    parse_gpx(&text, video)
}

pub fn parse_gpx(input: &str, video: &str) -> Result<Track, TrackError> {
    let doc = Document::parse(input).map_err(|e| TrackError::MalformedTrack(e.to_string()))?;
    let root = doc.root_element();

    let start_text = child(root, "metadata")
        .and_then(|metadata| child(metadata, "time"))
        .and_then(|time| time.text())
        .ok_or_else(|| malformed("missing <metadata><time>"))?;
    let start_time = parse_time(start_text)?;

    let segment = child(root, "trk")
        .and_then(|trk| child(trk, "trkseg"))
        .ok_or_else(|| malformed("missing <trk><trkseg>"))?;

    let mut points = Vec::new();
    for (idx, trkpt) in segment
        .children()
        .filter(|n| n.has_tag_name((GPX_NS, "trkpt")))
        .enumerate()
    {
        points.push(parse_point(trkpt, idx, start_time, video)?);
    }

    let total_duration_s = points.last().ok_or(TrackError::EmptyTrack)?.elapsed_s;
    Ok(Track {
        start_time,
        points,
        total_duration_s,
    })
}

fn parse_point(
    trkpt: Node,
    idx: usize,
    start_time: DateTime<FixedOffset>,
    video: &str,
) -> Result<TrackPoint, TrackError> {
    let latitude = parse_number(trkpt.attribute("lat"), "lat", idx)?;
    let longitude = parse_number(trkpt.attribute("lon"), "lon", idx)?;
    let elevation = parse_number(child_text(trkpt, "ele"), "ele", idx)?;
    let time_text = child_text(trkpt, "time")
        .ok_or_else(|| malformed(format!("trkpt {} missing <time>", idx)))?;
    let timestamp = parse_time(time_text)?;
    let speed = child(trkpt, "extensions")
        .and_then(|ext| {
            ext.descendants().find(|n| {
                n.has_tag_name((TPX_V2_NS, "speed")) || n.has_tag_name((TPX_V1_NS, "speed"))
            })
        })
        .and_then(|n| n.text());
    let speed = parse_number(speed, "speed", idx)?;

    Ok(TrackPoint {
        latitude,
        longitude,
        elevation,
        timestamp,
        elapsed_s: seconds_between(start_time, timestamp),
        speed,
        video: video.to_string(),
    })
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|n| n.has_tag_name((GPX_NS, name)))
}

fn child_text<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    child(node, name).and_then(|n| n.text())
}

fn parse_number(text: Option<&str>, field: &str, idx: usize) -> Result<f64, TrackError> {
    let text = text.ok_or_else(|| malformed(format!("trkpt {} missing {}", idx, field)))?;
    text.trim()
        .parse()
        .map_err(|_| malformed(format!("trkpt {} has invalid {} '{}'", idx, field, text)))
}

fn parse_time(text: &str) -> Result<DateTime<FixedOffset>, TrackError> {
    DateTime::parse_from_rfc3339(text.trim())
        .map_err(|e| malformed(format!("invalid timestamp '{}': {}", text, e)))
}

fn seconds_between(start: DateTime<FixedOffset>, end: DateTime<FixedOffset>) -> f64 {
    let delta = end - start;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1000.0,
    }
}

fn malformed(reason: impl Into<String>) -> TrackError {
    TrackError::MalformedTrack(reason.into())
}

/// Components of `path` from the `anchor` directory onward, joined with `/`.
pub fn video_identifier(path: &Path, anchor: &str) -> Result<String, TrackError> {
    let parts: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    let start = parts
        .iter()
        .position(|part| part == anchor)
        .ok_or_else(|| TrackError::MissingAnchor {
            path: path.to_path_buf(),
            anchor: anchor.to_string(),
        })?;
    Ok(parts[start..].join("/"))
}
