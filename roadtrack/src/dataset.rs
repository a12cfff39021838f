use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::extract::{extract_track, Extractor};
use crate::{FailurePolicy, Params, Track, TrackError, TrackPoint};

#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum DatasetPoint {
    Track(TrackPoint),
    /// Copied verbatim from a boundary file's `coordinates`.
    Boundary(JsonValue),
}

#[derive(Clone, Debug, Serialize)]
pub struct VideoFailure {
    pub video: String,
    pub error: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Dataset {
    /// Sum of every track's nominal duration in seconds.
    pub duration: f64,
    /// Sum of every calibrated track's length in kilometres.
    pub length: f64,
    pub points: Vec<DatasetPoint>,
    /// Only populated under [`FailurePolicy::Skip`].
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<VideoFailure>,
}

impl Dataset {
    pub fn add_track(&mut self, track: Track, params: &Params) {
        self.length += track.length_km(params);
        self.duration += track.total_duration_s;
        self.points
            .extend(track.points.into_iter().map(DatasetPoint::Track));
    }

    pub fn add_boundary(&mut self, boundary: Boundary) {
        self.points
            .extend(boundary.coordinates.into_iter().map(DatasetPoint::Boundary));
    }

    fn merge_outcome(
        &mut self,
        video: &Path,
        outcome: Result<Track, TrackError>,
        params: &Params,
    ) -> Result<(), TrackError> {
        match outcome {
            Ok(track) => self.add_track(track, params),
            Err(err) => match params.failure_policy {
                FailurePolicy::Abort => return Err(err),
                FailurePolicy::Skip => {
                    warn!("Skipping {}: {}", video.display(), err);
                    self.errors.push(VideoFailure {
                        video: video.display().to_string(),
                        error: err.to_string(),
                    });
                }
            },
        }
        Ok(())
    }
}

/// An externally authored overlay whose coordinates are appended to the dataset.
#[derive(Clone, Debug)]
pub struct Boundary {
    pub path: PathBuf,
    pub coordinates: Vec<JsonValue>,
}

impl Boundary {
    pub fn from_json(path: &Path, text: &str) -> Result<Self, TrackError> {
        let invalid = |reason: String| TrackError::BoundaryLoad {
            path: path.to_path_buf(),
            reason,
        };
        let json: JsonValue =
            serde_json::from_str(text).map_err(|e| invalid(format!("not valid JSON: {}", e)))?;
        let object = json
            .as_object()
            .ok_or_else(|| invalid("expected a JSON object".to_string()))?;
        let coordinates = object
            .get("coordinates")
            .ok_or_else(|| invalid("missing 'coordinates'".to_string()))?
            .as_array()
            .ok_or_else(|| invalid("'coordinates' must be an array".to_string()))?;
        Ok(Self {
            path: path.to_path_buf(),
            coordinates: coordinates.clone(),
        })
    }
}

/// All `.mp4` files (any case) under `root`, in file-name order.
pub fn discover_videos(root: &Path) -> Result<Vec<PathBuf>, TrackError> {
    let mut videos = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| TrackError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".mp4") {
            videos.push(entry.into_path());
        }
    }
    Ok(videos)
}

/// Every `.json` file directly inside `dir`, in file-name order. A missing directory has none.
pub fn load_boundaries(dir: &Path) -> Result<Vec<Boundary>, TrackError> {
    if !dir.is_dir() {
        info!("No boundary directory at {}", dir.display());
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));
        if is_json && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut boundaries = Vec::with_capacity(paths.len());
    for path in paths {
        let text = fs::read_to_string(&path).map_err(|e| TrackError::BoundaryLoad {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        boundaries.push(Boundary::from_json(&path, &text)?);
    }
    Ok(boundaries)
}

/// Run every video through [`extract_track`] and merge the results, boundaries last.
pub fn build_dataset<E: Extractor + Sync + ?Sized>(
    videos: &[PathBuf],
    boundaries: Vec<Boundary>,
    extractor: &E,
    params: &Params,
) -> Result<Dataset, TrackError> {
    let total = videos.len();
    let process = |idx: usize, video: &Path| {
        info!("[{}/{}] {}", idx + 1, total, video.display());
        extract_track(video, extractor, params)
    };

    let mut dataset = Dataset::default();
    if params.parallel {
        let outcomes: Vec<Result<Track, TrackError>> = videos
            .par_iter()
            .enumerate()
            .map(|(idx, video)| process(idx, video))
            .collect();
        for (video, outcome) in videos.iter().zip(outcomes) {
            dataset.merge_outcome(video, outcome, params)?;
        }
    } else {
        for (idx, video) in videos.iter().enumerate() {
            let outcome = process(idx, video);
            dataset.merge_outcome(video, outcome, params)?;
        }
    }

    let boundary_count = boundaries.len();
    for boundary in boundaries {
        dataset.add_boundary(boundary);
    }

    info!(
        "Dataset: {} videos ({} skipped), {} boundaries, {} points, {:.3} km, {:.1} s",
        total,
        dataset.errors.len(),
        boundary_count,
        dataset.points.len(),
        dataset.length,
        dataset.duration
    );
    Ok(dataset)
}

/// Serialize fully before touching `path`, so a failure leaves no partial file.
pub fn write_dataset(dataset: &Dataset, path: &Path) -> Result<(), TrackError> {
    let text = serde_json::to_string(dataset)?;
    fs::write(path, text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::point;
    use serde_json::json;

    #[test]
    fn test_discovers_mp4_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let day = dir.path().join("road-data").join("240601");
        fs::create_dir_all(day.join("nested")).unwrap();
        for name in ["b.MP4", "a.mp4", "notes.txt", "clip.Mp4.json", "nested/c.mP4"] {
            fs::write(day.join(name), b"").unwrap();
        }
        let found: Vec<String> = discover_videos(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.strip_prefix(&day).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(found, vec!["a.mp4", "b.MP4", "nested/c.mP4"]);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_videos(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn test_boundary_requires_coordinates() {
        let path = Path::new("zone.json");
        let ok = Boundary::from_json(path, r#"{"name": "zone", "coordinates": [{"lat": 1}]}"#)
            .unwrap();
        assert_eq!(ok.coordinates, vec![json!({"lat": 1})]);

        for bad in [r#"{"name": "zone"}"#, "[1, 2]", "{not json", r#"{"coordinates": 3}"#] {
            assert!(matches!(
                Boundary::from_json(path, bad),
                Err(TrackError::BoundaryLoad { .. })
            ));
        }
    }

    #[test]
    fn test_boundaries_load_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.json"), r#"{"coordinates": [{"id": "b0"}]}"#).unwrap();
        fs::write(
            dir.path().join("a.json"),
            r#"{"coordinates": [{"id": "a0"}, {"id": "a1"}]}"#,
        )
        .unwrap();
        fs::write(dir.path().join("readme.md"), "ignored").unwrap();

        let boundaries = load_boundaries(dir.path()).unwrap();
        assert_eq!(boundaries.len(), 2);
        assert!(boundaries[0].path.ends_with("a.json"));
        assert_eq!(boundaries[0].coordinates.len(), 2);

        assert!(load_boundaries(&dir.path().join("absent")).unwrap().is_empty());
    }

    #[test]
    fn test_serialized_shape() {
        let mut dataset = Dataset::default();
        dataset.add_track(
            Track {
                start_time: crate::fixtures::start(),
                points: vec![point(0.0, 0.0, 0.0), point(0.0, 1.0, 4.0)],
                total_duration_s: 4.0,
            },
            &Params::default(),
        );
        dataset.add_boundary(Boundary {
            path: PathBuf::from("zone.json"),
            coordinates: vec![json!({"lat": 1.5, "lng": 2.5})],
        });

        let value = serde_json::to_value(&dataset).unwrap();
        assert_eq!(value["duration"], 4.0);
        assert!((value["length"].as_f64().unwrap() - 111.19).abs() < 0.5);
        let points = value["points"].as_array().unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[1]["duration"], 4.0);
        assert_eq!(points[2], json!({"lat": 1.5, "lng": 2.5}));
        assert!(value.get("errors").is_none());
    }
}
