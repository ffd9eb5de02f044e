//! Configuration file parsing (§6).
//!
//! Two file formats, both line-oriented with `#` comments, neither of them
//! TOML: the main configuration (anchors, tags, reference points, upstream
//! server addresses) and the locmod configuration (engine type plus free-form
//! parameter groups for each pipeline stage).

use std::collections::HashMap;
use std::path::Path;

use crate::error::ConfigError;
use lat_types::Anchor;

/// Parsed contents of the main configuration file.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub location_server_hostname: String,
    pub location_server_port: u16,
    pub lat_server_hostname: String,
    pub lat_server_port: u16,
    pub infield_device_port: u16,

    pub anchors: HashMap<u32, Anchor>,
    pub tag_ids: Vec<u32>,
    pub reference_points: HashMap<String, (f64, f64)>,

    pub min_x: Option<f64>,
    pub max_x: Option<f64>,
    pub min_y: Option<f64>,
    pub max_y: Option<f64>,

    /// The raw file contents, stashed so it can be written verbatim into the
    /// `configuration` table (§4.7).
    pub text: String,
}

pub const DEFAULT_IFD_PORT: u16 = 9393;

impl Config {
    fn strip_comment(line: &str) -> &str {
        match line.find('#') {
            Some(idx) => line[..idx].trim(),
            None => line.trim(),
        }
    }

    /// Load and parse the main configuration file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError {
            path: path.display().to_string(),
            line: 0,
            message: e.to_string(),
        })?;

        let mut config = Config {
            infield_device_port: DEFAULT_IFD_PORT,
            text: text.clone(),
            ..Default::default()
        };

        for (idx, raw_line) in text.lines().enumerate() {
            let linenum = idx + 1;
            let meat = Self::strip_comment(raw_line);
            if meat.is_empty() {
                continue;
            }

            let err = |message: String| ConfigError {
                path: path.display().to_string(),
                line: linenum,
                message,
            };

            let (label, value) = meat
                .split_once(':')
                .ok_or_else(|| err(format!("expected 'Label: value', got {:?}", meat)))?;
            let label = label.trim().to_lowercase();
            let value = value.trim();

            match label.as_str() {
                "anchor" => {
                    let (id_str, loc_str) = value
                        .split_once(';')
                        .ok_or_else(|| err("anchor directive needs 'id; x,y'".into()))?;
                    let id: u32 = id_str
                        .trim()
                        .parse()
                        .map_err(|_| err(format!("bad anchor id: {}", id_str)))?;
                    let (x, y) = parse_point(loc_str).map_err(|m| err(m))?;
                    config.anchors.insert(id, Anchor::new(id, x, y));
                }
                "tag" => {
                    let tag_id: u32 = value
                        .trim()
                        .parse()
                        .map_err(|_| err(format!("bad tag id: {}", value)))?;
                    if !config.tag_ids.contains(&tag_id) {
                        config.tag_ids.push(tag_id);
                    }
                }
                "reference" => {
                    let (name, loc_str) = value
                        .split_once(';')
                        .ok_or_else(|| err("reference directive needs 'name; x,y'".into()))?;
                    let (x, y) = parse_point(loc_str).map_err(|m| err(m))?;
                    config
                        .reference_points
                        .insert(name.trim().to_string(), (x, y));
                }
                "locationserver" => {
                    let (host, port) = parse_host_port(value).map_err(|m| err(m))?;
                    config.location_server_hostname = host;
                    config.location_server_port = port;
                }
                "latserver" => {
                    let (host, port) = parse_host_port(value).map_err(|m| err(m))?;
                    config.lat_server_hostname = host;
                    config.lat_server_port = port;
                }
                "min_x" => config.min_x = Some(parse_f64(value).map_err(|m| err(m))?),
                "max_x" => config.max_x = Some(parse_f64(value).map_err(|m| err(m))?),
                "min_y" => config.min_y = Some(parse_f64(value).map_err(|m| err(m))?),
                "max_y" => config.max_y = Some(parse_f64(value).map_err(|m| err(m))?),
                other => {
                    tracing::error!("unrecognised configuration label on line {linenum}: {other}");
                }
            }
        }

        Ok(config)
    }
}

fn parse_f64(s: &str) -> Result<f64, String> {
    s.trim()
        .parse()
        .map_err(|_| format!("not a number: {:?}", s))
}

fn parse_point(s: &str) -> Result<(f64, f64), String> {
    let (x_str, y_str) = s
        .split_once(',')
        .ok_or_else(|| format!("expected 'x,y', got {:?}", s))?;
    Ok((parse_f64(x_str)?, parse_f64(y_str)?))
}

fn parse_host_port(s: &str) -> Result<(String, u16), String> {
    let (host, port_str) = s
        .split_once(',')
        .ok_or_else(|| format!("expected 'host, port', got {:?}", s))?;
    let port: u16 = port_str
        .trim()
        .parse()
        .map_err(|_| format!("bad port: {:?}", port_str))?;
    Ok((host.trim().to_string(), port))
}

/// Which location engine algorithm a locmod configuration selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineType {
    LocationEnginePdf,
    LocationEngineMatch,
    ParticleFilter,
}

impl EngineType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "LocationEnginePDF" => Some(Self::LocationEnginePdf),
            "LocationEngineMatch" => Some(Self::LocationEngineMatch),
            "ParticleFilter" => Some(Self::ParticleFilter),
            // LeDLL is the proprietary native-library engine, excluded from
            // the core (§9); a configuration naming it fails to parse.
            _ => None,
        }
    }
}

/// Parsed contents of the locmod configuration file: an engine selection
/// plus free-form key/value parameter groups for each pipeline stage.
#[derive(Debug, Clone, Default)]
pub struct LocmodConfig {
    pub engine_type: Option<EngineType>,
    pub particle_filter: HashMap<String, String>,
    pub distance_filter: HashMap<String, String>,
    pub location_engine: HashMap<String, String>,
    pub position_filter: HashMap<String, String>,
    pub text: String,
}

impl LocmodConfig {
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError {
            path: path.display().to_string(),
            line: 0,
            message: e.to_string(),
        })?;
        Self::parse_text(&text, &path.display().to_string())
    }

    /// Parse already-loaded locmod configuration text, e.g. the `locmod_text`
    /// column of a stored configuration row being reproduced by a replay run.
    pub fn load_text(text: &str) -> Result<Self, ConfigError> {
        Self::parse_text(text, "<stored configuration>")
    }

    fn parse_text(text: &str, source: &str) -> Result<Self, ConfigError> {
        let mut config = LocmodConfig {
            text: text.to_string(),
            ..Default::default()
        };
        let mut current: Option<String> = None;

        for (idx, raw_line) in text.lines().enumerate() {
            let linenum = idx + 1;
            let meat = Config::strip_comment(raw_line);
            if meat.is_empty() {
                continue;
            }

            let err = |message: String| ConfigError {
                path: source.to_string(),
                line: linenum,
                message,
            };

            let (label, value) = meat
                .split_once(':')
                .ok_or_else(|| err(format!("expected 'Label: value', got {:?}", meat)))?;
            let label = label.trim().to_lowercase();
            let value = value.trim().to_string();

            match label.as_str() {
                "particlefilter" | "distancefilter" | "locationengine" | "positionfilter" => {
                    current = Some(label);
                }
                "enginetype" => {
                    config.engine_type = Some(
                        EngineType::parse(&value)
                            .ok_or_else(|| err(format!("unknown EngineType: {}", value)))?,
                    );
                    current = None;
                }
                other => match current.as_deref() {
                    Some("particlefilter") => {
                        config.particle_filter.insert(other.to_string(), value);
                    }
                    Some("distancefilter") => {
                        config.distance_filter.insert(other.to_string(), value);
                    }
                    Some("locationengine") => {
                        config.location_engine.insert(other.to_string(), value);
                    }
                    Some("positionfilter") => {
                        config.position_filter.insert(other.to_string(), value);
                    }
                    _ => {
                        return Err(err(format!(
                            "setting for unrecognised label ({}: {}) outside a parameter group",
                            other, value
                        )));
                    }
                },
            }
        }

        Ok(config)
    }
}
