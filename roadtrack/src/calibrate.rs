//! Single-pass removal of GPS glitch points.
//!
//! A segment longer than the threshold marks the point that *ends* it as a glitch; that point is
//! dropped when the pass reaches it and is never used as a segment start. The point that starts
//! the long segment is kept.

use tracing::debug;

use crate::distance::segment_km;
use crate::{Params, TrackPoint, TrailingPoint};

#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationEvent {
    /// Index (in the input sequence) of the segment start.
    pub index: usize,
    pub distance_km: f64,
    pub elapsed_s: f64,
}

#[derive(Clone, Debug)]
pub struct Calibrated {
    pub points: Vec<TrackPoint>,
    pub events: Vec<CalibrationEvent>,
}

pub fn calibrate(points: &[TrackPoint], params: &Params) -> Calibrated {
    let mut kept = Vec::with_capacity(points.len());
    let mut events = Vec::new();
    let mut skip: Option<usize> = None;

    for i in 0..points.len().saturating_sub(1) {
        if skip == Some(i) {
            continue;
        }
        let distance_km = segment_km(params.earth_radius_km, &points[i], &points[i + 1]);
        if distance_km > params.calibration_threshold_km {
            skip = Some(i + 1);
            debug!(
                "calibrate: {}, {:.6} km, {:.3} s",
                i, distance_km, points[i].elapsed_s
            );
            events.push(CalibrationEvent {
                index: i,
                distance_km,
                elapsed_s: points[i].elapsed_s,
            });
        }
        kept.push(points[i].clone());
    }

    if params.trailing_point == TrailingPoint::Keep {
        if let Some(last) = points.last() {
            if skip != Some(points.len() - 1) {
                kept.push(last.clone());
            }
        }
    }

    Calibrated {
        points: kept,
        events,
    }
}
