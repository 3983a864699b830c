//! Coordinate frames and distances.
//!
//! Receiver positions arrive either in a local planar frame (metres) or as
//! geodetic (latitude, longitude) pairs. The solver always works in metres,
//! so geodetic inputs are projected onto a local tangent plane first.

use crate::models::Point;
use serde::{Deserialize, Serialize};

/// Mean Earth radius in metres (IUGG).
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// The frame receiver positions and estimates are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CoordinateFrame {
    /// Local planar frame, `x`/`y` in metres.
    #[default]
    Planar,
    /// Geodetic frame, `x` is latitude and `y` is longitude, in degrees.
    Geodetic,
}

impl CoordinateFrame {
    /// Distance in metres between two points expressed in this frame.
    pub fn distance(&self, a: Point, b: Point) -> f64 {
        match self {
            CoordinateFrame::Planar => a.distance_to(b),
            CoordinateFrame::Geodetic => haversine(a, b),
        }
    }
}

/// Great-circle distance between two (lat, lon) points in metres.
pub fn haversine(a: Point, b: Point) -> f64 {
    let (lat1, lat2) = (a.x.to_radians(), b.x.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.y - a.y).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Equirectangular projection around a fixed origin.
///
/// Accurate to well under a metre over the few-kilometre extents a receiver
/// network covers, which is far below RSSI ranging error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalFrame {
    origin: Point,
    cos_lat: f64,
}

impl LocalFrame {
    /// Build a tangent plane centred on the centroid of `points`.
    pub fn around(points: &[Point]) -> Self {
        let n = points.len().max(1) as f64;
        let (sx, sy) = points
            .iter()
            .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
        let origin = Point::new(sx / n, sy / n);
        Self {
            origin,
            cos_lat: origin.x.to_radians().cos(),
        }
    }

    /// (lat, lon) degrees to (east, north) metres.
    pub fn project(&self, p: Point) -> Point {
        let north = (p.x - self.origin.x).to_radians() * EARTH_RADIUS_M;
        let east = (p.y - self.origin.y).to_radians() * EARTH_RADIUS_M * self.cos_lat;
        Point::new(east, north)
    }

    /// (east, north) metres back to (lat, lon) degrees.
    pub fn unproject(&self, p: Point) -> Point {
        let lat = self.origin.x + (p.y / EARTH_RADIUS_M).to_degrees();
        let lon = self.origin.y + (p.x / (EARTH_RADIUS_M * self.cos_lat)).to_degrees();
        Point::new(lat, lon)
    }
}
