use clap::Parser;
use line_cluster_lib::{Category, Config, Region};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
/// Line Cluster Probe - Load an entity feed, point a camera at it and print what would be drawn
pub struct Settings {
    /// JSON file with the full entity feed (array of entity records)
    #[clap(short, long, value_name = "FILE")]
    pub entities: PathBuf,

    /// JSON file with engine configuration; missing fields keep their defaults
    #[clap(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Free-text search applied after the debounce delay
    #[clap(short, long, default_value = "")]
    pub search: String,

    /// Category filter: all, favorites or status:<name>
    #[clap(long, default_value = "all", value_parser = parse_category)]
    pub category: Category,

    /// Camera region as lat,lng,lat_delta,lng_delta
    #[clap(short, long, value_parser = parse_region, conflicts_with = "camera")]
    pub region: Option<Region>,

    /// JSON file with a camera-idle event
    #[clap(long, value_name = "FILE")]
    pub camera: Option<PathBuf>,

    /// Entity id to open as a deep link once the map is mounted
    #[clap(long, value_name = "ID")]
    pub deep_link: Option<String>,

    /// Entity id of a leaf to tap
    #[clap(long, value_name = "ID", conflicts_with = "tap_cluster")]
    pub tap_leaf: Option<String>,

    /// Position in the printed feature list of a cluster to tap
    #[clap(long, value_name = "POSITION")]
    pub tap_cluster: Option<usize>,

    /// Cluster merge radius in pixels
    #[clap(long)]
    pub radius: Option<f64>,

    /// Highest zoom that still clusters
    #[clap(long)]
    pub max_zoom: Option<u8>,

    /// Highest zoom a cluster tap may fly to
    #[clap(long)]
    pub hard_zoom_cap: Option<f64>,

    /// Screen width in pixels used to resolve camera commands
    #[clap(long, default_value = "390")]
    pub screen_width: f64,

    /// Screen height in pixels used to resolve camera commands
    #[clap(long, default_value = "844")]
    pub screen_height: f64,

    /// Tile size in pixels used to resolve camera commands
    #[clap(long, default_value = "512")]
    pub tile_size: f64,

    /// Pretty-print the JSON report
    #[clap(long, default_value = "false")]
    pub pretty: bool,
}

impl Settings {
    /// Apply the command-line overrides on top of a loaded configuration
    pub fn apply_overrides(&self, mut config: Config) -> Config {
        if let Some(radius) = self.radius {
            config.cluster.radius = radius;
        }
        if let Some(max_zoom) = self.max_zoom {
            config.cluster.max_zoom = max_zoom;
        }
        if let Some(cap) = self.hard_zoom_cap {
            config.hard_zoom_cap = cap;
        }
        config
    }
}

fn parse_category(value: &str) -> Result<Category, String> {
    let lower = value.trim().to_lowercase();
    match lower.as_str() {
        "all" => Ok(Category::All),
        "favorites" | "favourites" => Ok(Category::Favorites),
        _ => match lower.strip_prefix("status:") {
            Some(status) if !status.is_empty() => Ok(Category::Status(status.to_string())),
            _ => Err(format!(
                "unknown category '{value}', expected all, favorites or status:<name>"
            )),
        },
    }
}

fn parse_region(value: &str) -> Result<Region, String> {
    let parts: Vec<f64> = value
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("invalid region '{value}': {e}"))?;
    match parts.as_slice() {
        [lat, lng, lat_delta, lng_delta] => Ok(Region::new(*lat, *lng, *lat_delta, *lng_delta)),
        _ => Err(format!(
            "invalid region '{value}', expected lat,lng,lat_delta,lng_delta"
        )),
    }
}
