use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::wildcard_match;

const EARTH_RADIUS_M: f64 = 6_371_000.0;
const FDSN_TEXT_HEADER: &str = "#Network | Station | Latitude | Longitude | Elevation | SiteName | StartTime | EndTime";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub network: String,
    pub station: String,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
    pub site_name: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

//=====================================================================
// Station metadata, exchanged in the FDSN station text format
//     #Network | Station | Latitude | Longitude | Elevation | SiteName | StartTime | EndTime
//=====================================================================
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory ( pub Vec<Station> );

impl Deref for Inventory {
    type Target = Vec<Station>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Inventory {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

fn parse_time(field: &str) -> Result<Option<DateTime<Utc>>> {
    if field.is_empty() {
        return Ok(None);
    }
    if let Ok(time) = DateTime::parse_from_rfc3339(field) {
        return Ok(Some(time.with_timezone(&Utc)));
    }
    let naive = NaiveDateTime::parse_from_str(field, "%Y-%m-%dT%H:%M:%S%.f")
        .with_context(|| format!("Invalid time '{}'", field))?;
    Ok(Some(naive.and_utc()))
}

fn format_time(time: &Option<DateTime<Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string()).unwrap_or_default()
}

impl Inventory {
    pub fn from_fdsn_text(text: &str) -> Result<Self> {
        let mut stations = Vec::new();
        for (line_number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split('|').map(str::trim).collect();
            if fields.len() < 8 {
                bail!("Line {} of station text has {} fields, expected 8", line_number + 1, fields.len());
            }
            let number = |i: usize| -> Result<f64> {
                fast_float::parse::<f64, _>(fields[i])
                    .map_err(|_| anyhow::anyhow!("Invalid number '{}' on line {}", fields[i], line_number + 1))
            };
            stations.push(Station {
                network: fields[0].to_string(),
                station: fields[1].to_string(),
                latitude: number(2)?,
                longitude: number(3)?,
                elevation: number(4)?,
                site_name: fields[5].to_string(),
                start: parse_time(fields[6])?,
                end: parse_time(fields[7])?,
            });
        }
        Ok(Self(stations))
    }

    pub fn to_fdsn_text(&self) -> String {
        let mut text = String::from(FDSN_TEXT_HEADER);
        text.push('\n');
        for sta in self.iter() {
            text.push_str(&format!(
                "{}|{}|{}|{}|{}|{}|{}|{}\n",
                sta.network, sta.station, sta.latitude, sta.longitude, sta.elevation,
                sta.site_name, format_time(&sta.start), format_time(&sta.end)
            ));
        }
        text
    }

    pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read inventory {}", path.display()))?;
        Self::from_fdsn_text(&text).with_context(|| format!("Failed to parse inventory {}", path.display()))
    }

    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_fdsn_text())
            .with_context(|| format!("Failed to write inventory {}", path.display()))
    }

    /// Stations matching the codes, `*` and `?` act as wildcards.
    pub fn select(&self, network: &str, station: &str) -> Inventory {
        Inventory(
            self.iter()
                .filter(|sta| wildcard_match(network, &sta.network) && wildcard_match(station, &sta.station))
                .cloned()
                .collect(),
        )
    }

    /// Add stations not yet present (same codes and start time).
    pub fn merge(&mut self, other: Inventory) {
        for sta in other.0 {
            let known = self.iter().any(|s| s.network == sta.network && s.station == sta.station && s.start == sta.start);
            if !known {
                self.push(sta);
            }
        }
        self.sort_by(|a, b| (&a.network, &a.station, a.start).cmp(&(&b.network, &b.station, b.start)));
    }

    pub fn get_station(&self, network: &str, station: &str) -> Option<&Station> {
        self.iter().find(|sta| sta.network == network && sta.station == station)
    }
}

/// Azimuth and back azimuth in degrees and distance in metres between two
/// points on a spherical earth.
pub fn calc_az_baz_dist(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> (f64, f64, f64) {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dlambda = (lon2 - lon1).to_radians();

    let a = ((phi2 - phi1) / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    let dist = 2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt());

    let bearing = |p1: f64, p2: f64, dl: f64| {
        let theta = (dl.sin() * p2.cos()).atan2(p1.cos() * p2.sin() - p1.sin() * p2.cos() * dl.cos());
        theta.to_degrees().rem_euclid(360.0)
    };
    (bearing(phi1, phi2, dlambda), bearing(phi2, phi1, -dlambda), dist)
}
