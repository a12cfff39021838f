//! Per-video pipeline: run the extraction utility, parse its GPX, calibrate.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{info, warn};

use crate::calibrate::calibrate;
use crate::gpx::{read_track, video_identifier};
use crate::{Params, Track, TrackError, DEFAULT_EXTRACTOR};

/// Files written by an [`Extractor`] for one video.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractedFiles {
    pub gpx: PathBuf,
    pub kml: PathBuf,
}

impl ExtractedFiles {
    pub fn for_base(output_base: &Path) -> Self {
        Self {
            gpx: with_suffix(output_base, "gpx"),
            kml: with_suffix(output_base, "kml"),
        }
    }
}

fn with_suffix(base: &Path, ext: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

/// Turns a video into `<output_base>.gpx` (and a `<output_base>.kml` side artifact).
pub trait Extractor {
    fn extract(&self, video: &Path, output_base: &Path) -> Result<ExtractedFiles, TrackError>;
}

/// Runs an external program as `<program> [args...] <video> <output_base>`.
#[derive(Clone, Debug)]
pub struct CommandExtractor {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// `None` waits for the child indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for CommandExtractor {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_EXTRACTOR),
            args: vec!["-s".to_string()],
            timeout: None,
        }
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);

impl CommandExtractor {
    fn wait(&self, child: &mut Child) -> Result<ExitStatus, TrackError> {
        let Some(timeout) = self.timeout else {
            return Ok(child.wait()?);
        };
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(TrackError::ExtractionFailed(format!(
                    "{} timed out after {:.1} s",
                    self.program.display(),
                    timeout.as_secs_f64()
                )));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Extractor for CommandExtractor {
    fn extract(&self, video: &Path, output_base: &Path) -> Result<ExtractedFiles, TrackError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(video)
            .arg(output_base)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| {
                TrackError::ExtractionFailed(format!(
                    "failed to run {}: {}",
                    self.program.display(),
                    e
                ))
            })?;
        let status = self.wait(&mut child)?;
        if !status.success() {
            return Err(TrackError::ExtractionFailed(format!(
                "{} exited with {} for {}",
                self.program.display(),
                status,
                video.display()
            )));
        }

        let files = ExtractedFiles::for_base(output_base);
        if !files.gpx.is_file() {
            return Err(TrackError::ExtractionFailed(format!(
                "{} produced no usable output for {}",
                self.program.display(),
                video.display()
            )));
        }
        Ok(files)
    }
}

/// Removes the extraction artifacts when dropped, on every exit path.
struct TempArtifacts {
    files: ExtractedFiles,
}

impl Drop for TempArtifacts {
    fn drop(&mut self) {
        for path in [&self.files.gpx, &self.files.kml] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!("failed to remove {}: {}", path.display(), err),
            }
        }
    }
}

/// 128 random bits, hex encoded.
pub fn random_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Extract, parse and calibrate the track of one video.
///
/// Temporary artifacts live under `params.temp_dir`, named by a fresh random token, and are
/// deleted before this returns whether or not it succeeded.
pub fn extract_track<E: Extractor + ?Sized>(
    video: &Path,
    extractor: &E,
    params: &Params,
) -> Result<Track, TrackError> {
    let token = random_token();
    info!("{} {}", token, video.display());

    let output_base = params.temp_dir.join(&token);
    let artifacts = TempArtifacts {
        files: ExtractedFiles::for_base(&output_base),
    };

    let files = extractor.extract(video, &output_base)?;
    let parse_failed = |source: TrackError| TrackError::TrackParseFailed {
        video: video.to_path_buf(),
        source: Box::new(source),
    };
    let video_id = video_identifier(video, &params.video_anchor).map_err(parse_failed)?;
    let mut track = read_track(&files.gpx, &video_id).map_err(parse_failed)?;

    let raw_count = track.points.len();
    let calibrated = calibrate(&track.points, params);
    track.points = calibrated.points;
    info!(
        "{}: {} points, {} after calibration ({} events), {:.1} s",
        token,
        raw_count,
        track.points.len(),
        calibrated.events.len(),
        track.total_duration_s
    );

    drop(artifacts);
    Ok(track)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpx::tests::{document, trkpt};
    use std::cell::RefCell;

    struct Recording {
        xml: Option<String>,
        seen: RefCell<Vec<ExtractedFiles>>,
    }

    impl Extractor for Recording {
        fn extract(&self, _video: &Path, output_base: &Path) -> Result<ExtractedFiles, TrackError> {
            let files = ExtractedFiles::for_base(output_base);
            fs::write(&files.kml, "<kml/>")?;
            self.seen.borrow_mut().push(files.clone());
            match &self.xml {
                Some(xml) => {
                    fs::write(&files.gpx, xml)?;
                    Ok(files)
                }
                None => Err(TrackError::ExtractionFailed("stub".into())),
            }
        }
    }

    fn params(dir: &Path) -> Params {
        Params {
            temp_dir: dir.to_path_buf(),
            ..Params::default()
        }
    }

    const VIDEO: &str = "/mnt/road-data/240601/GX010001.MP4";

    #[test]
    fn test_token_is_128_bit_hex() {
        let a = random_token();
        let b = random_token();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_output_paths() {
        let files = ExtractedFiles::for_base(Path::new("/tmp/abc"));
        assert_eq!(files.gpx, PathBuf::from("/tmp/abc.gpx"));
        assert_eq!(files.kml, PathBuf::from("/tmp/abc.kml"));
    }

    #[test]
    fn test_success_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let xml = document(
            "2024-06-01T09:00:00Z",
            &[
                trkpt(37.0, 127.0, "2024-06-01T09:00:00Z"),
                trkpt(37.0, 127.0, "2024-06-01T09:00:01Z"),
                trkpt(37.0, 127.0, "2024-06-01T09:00:02Z"),
            ],
        );
        let stub = Recording {
            xml: Some(xml),
            seen: RefCell::new(Vec::new()),
        };
        let track = extract_track(Path::new(VIDEO), &stub, &params(dir.path())).unwrap();
        assert_eq!(track.points.len(), 2);
        assert_eq!(track.total_duration_s, 2.0);
        assert_eq!(track.points[0].video, "road-data/240601/GX010001.MP4");

        let seen = stub.seen.borrow();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].gpx.starts_with(dir.path()));
        assert!(!seen[0].gpx.exists());
        assert!(!seen[0].kml.exists());
    }

    #[test]
    fn test_extraction_failure_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Recording {
            xml: None,
            seen: RefCell::new(Vec::new()),
        };
        let err = extract_track(Path::new(VIDEO), &stub, &params(dir.path())).unwrap_err();
        assert!(matches!(err, TrackError::ExtractionFailed(_)));
        assert!(!stub.seen.borrow()[0].kml.exists());
    }

    #[test]
    fn test_parse_failure_is_wrapped_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Recording {
            xml: Some(document("2024-06-01T09:00:00Z", &[])),
            seen: RefCell::new(Vec::new()),
        };
        let err = extract_track(Path::new(VIDEO), &stub, &params(dir.path())).unwrap_err();
        match err {
            TrackError::TrackParseFailed { video, source } => {
                assert_eq!(video, PathBuf::from(VIDEO));
                assert!(matches!(*source, TrackError::EmptyTrack));
            }
            other => panic!("expected TrackParseFailed, got {:?}", other),
        }
        let seen = stub.seen.borrow();
        assert!(!seen[0].gpx.exists());
        assert!(!seen[0].kml.exists());
    }

    #[test]
    fn test_missing_anchor_is_a_parse_failure() {
        let dir = tempfile::tempdir().unwrap();
        let xml = document(
            "2024-06-01T09:00:00Z",
            &[trkpt(37.0, 127.0, "2024-06-01T09:00:00Z")],
        );
        let stub = Recording {
            xml: Some(xml),
            seen: RefCell::new(Vec::new()),
        };
        let err =
            extract_track(Path::new("/videos/a.mp4"), &stub, &params(dir.path())).unwrap_err();
        match err {
            TrackError::TrackParseFailed { source, .. } => {
                assert!(matches!(*source, TrackError::MissingAnchor { .. }))
            }
            other => panic!("expected TrackParseFailed, got {:?}", other),
        }
        assert!(!stub.seen.borrow()[0].gpx.exists());
    }

    #[test]
    fn test_missing_program() {
        let extractor = CommandExtractor {
            program: PathBuf::from("/nonexistent/roadtrack-extractor"),
            ..CommandExtractor::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let err = extractor
            .extract(Path::new(VIDEO), &dir.path().join("out"))
            .unwrap_err();
        assert!(matches!(err, TrackError::ExtractionFailed(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit() {
        let extractor = CommandExtractor {
            program: PathBuf::from("false"),
            args: Vec::new(),
            timeout: None,
        };
        let dir = tempfile::tempdir().unwrap();
        let err = extractor
            .extract(Path::new(VIDEO), &dir.path().join("out"))
            .unwrap_err();
        assert!(matches!(err, TrackError::ExtractionFailed(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_success_without_output() {
        let extractor = CommandExtractor {
            program: PathBuf::from("true"),
            args: Vec::new(),
            timeout: Some(Duration::from_secs(10)),
        };
        let dir = tempfile::tempdir().unwrap();
        let err = extractor
            .extract(Path::new(VIDEO), &dir.path().join("out"))
            .unwrap_err();
        match err {
            TrackError::ExtractionFailed(reason) => assert!(reason.contains("no usable output")),
            other => panic!("expected ExtractionFailed, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_child() {
        // `sh -c 'sleep 5' <video> <base>`: the trailing arguments become $0 and $1.
        let extractor = CommandExtractor {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), "sleep 5".to_string()],
            timeout: Some(Duration::from_millis(200)),
        };
        let dir = tempfile::tempdir().unwrap();
        let started = Instant::now();
        let err = extractor
            .extract(Path::new(VIDEO), &dir.path().join("out"))
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(4));
        match err {
            TrackError::ExtractionFailed(reason) => assert!(reason.contains("timed out")),
            other => panic!("expected ExtractionFailed, got {:?}", other),
        }
    }
}
