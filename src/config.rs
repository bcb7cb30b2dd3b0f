use serde::Deserialize;
use std::{env, path::PathBuf, time::Duration};
use tracing::{info, warn};

/// Runtime configuration read once at startup.
///
/// Every knob comes from the environment (optionally seeded from `.env`) with
/// a sane default, so the service boots with nothing configured.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub request_max_bytes: usize,
    pub queue_capacity: usize,
    pub log_max_lines: usize,
    pub pipeline: PipelineSettings,
    pub poll: PollSettings,
    pub sheet: Option<SheetSettings>,
    pub branding_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub page_timeout: Duration,
    pub connect_timeout: Duration,
    pub image_timeout: Duration,
    pub image_max_bytes: usize,
    pub code_prefixes: Vec<String>,
    pub denylist: Vec<String>,
    pub cdn_pattern: String,
    pub upload_endpoint: String,
    pub upload_url_prefix: String,
    pub vertical_enabled: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    pub item_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct SheetSettings {
    pub api_base: String,
    pub spreadsheet_id: String,
    pub sheet_name: String,
    pub auth: SheetAuth,
    pub link_column: String,
    pub image_column: String,
    pub vertical_column: String,
}

/// How the Sheets client obtains its bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SheetAuth {
    /// Path to a service account JSON key; tokens are minted and refreshed.
    ServiceAccount(PathBuf),
    /// A pre-issued access token, used as is until it expires.
    Token(String),
}

const DEFAULT_CREDENTIALS_PATH: &str = "credentials.json";

pub const DEFAULT_CODE_PREFIXES: &[&str] = &["NATBRA"];

/// Product photos on the Natura storefront CDN, as they appear in page
/// markup and in JSON state blobs.
pub const DEFAULT_CDN_PATTERN: &str = r#"(?i)(?:https?:)?//[a-z0-9.\-]*natura\.com(?:\.br)?/on/demandware\.static/[^\s"'<>()\\]+?\.(?:jpe?g|png|webp)"#;

pub const DEFAULT_DENYLIST: &[&str] = &[
    "logo",
    "banner",
    "sprite",
    "favicon",
    // Icon assets only; a bare "icon" would also drop "silicone" or "iconic".
    "/icons/",
    "/icon.",
    "/icon-",
    "/icon_",
    "_icon.",
    "-icon.",
    "placeholder",
    "background",
    "/bg-",
    "frontend-assets",
];

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            port: parse_env("PORT").unwrap_or(8000),
            request_max_bytes: parse_env::<usize>("REQUEST_MAX_BYTES")
                .filter(|v| *v > 0)
                .unwrap_or(256 * 1024),
            queue_capacity: parse_env::<usize>("QUEUE_CAPACITY")
                .filter(|v| *v > 0)
                .unwrap_or(64),
            log_max_lines: parse_env::<usize>("LOG_MAX_LINES")
                .filter(|v| *v > 0)
                .unwrap_or(1000),
            pipeline: PipelineSettings::from_env(),
            poll: PollSettings {
                interval: Duration::from_secs(
                    parse_env::<u64>("POLL_INTERVAL_SECS")
                        .filter(|v| *v > 0)
                        .unwrap_or(300),
                ),
                item_delay: Duration::from_millis(parse_env("ITEM_DELAY_MS").unwrap_or(2000)),
            },
            sheet: SheetSettings::from_env(),
            branding_file: env::var("BRANDING_FILE").ok().map(PathBuf::from),
        }
    }
}

impl PipelineSettings {
    pub fn from_env() -> Self {
        Self {
            page_timeout: Duration::from_secs(parse_env("HTTP_TIMEOUT_SECS").unwrap_or(15)),
            connect_timeout: Duration::from_secs(
                parse_env("HTTP_CONNECT_TIMEOUT_SECS").unwrap_or(5),
            ),
            image_timeout: Duration::from_secs(parse_env("IMAGE_TIMEOUT_SECS").unwrap_or(10)),
            image_max_bytes: parse_env::<usize>("IMAGE_MAX_BYTES")
                .filter(|v| *v > 0)
                .unwrap_or(15 * 1024 * 1024),
            code_prefixes: parse_list("PRODUCT_CODE_PREFIXES")
                .unwrap_or_else(|| to_owned_list(DEFAULT_CODE_PREFIXES)),
            denylist: parse_list("IMAGE_DENYLIST")
                .unwrap_or_else(|| to_owned_list(DEFAULT_DENYLIST)),
            cdn_pattern: env::var("CDN_IMAGE_PATTERN")
                .unwrap_or_else(|_| DEFAULT_CDN_PATTERN.to_string()),
            upload_endpoint: env::var("UPLOAD_ENDPOINT")
                .unwrap_or_else(|_| "https://catbox.moe/user/api.php".to_string()),
            upload_url_prefix: env::var("UPLOAD_URL_PREFIX")
                .unwrap_or_else(|_| "https://files.catbox.moe/".to_string()),
            vertical_enabled: parse_env_bool("VERTICAL_ENABLED").unwrap_or(true),
            dry_run: parse_env_bool("DRY_RUN").unwrap_or(false),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            page_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
            image_timeout: Duration::from_secs(10),
            image_max_bytes: 15 * 1024 * 1024,
            code_prefixes: to_owned_list(DEFAULT_CODE_PREFIXES),
            denylist: to_owned_list(DEFAULT_DENYLIST),
            cdn_pattern: DEFAULT_CDN_PATTERN.to_string(),
            upload_endpoint: "https://catbox.moe/user/api.php".to_string(),
            upload_url_prefix: "https://files.catbox.moe/".to_string(),
            vertical_enabled: true,
            dry_run: false,
        }
    }
}

impl SheetSettings {
    fn from_env() -> Option<Self> {
        let spreadsheet_id = env::var("GOOGLE_SHEETS_SPREADSHEET_ID").ok()?;
        let auth = SheetAuth::from_env()?;
        Some(Self {
            api_base: env::var("GOOGLE_SHEETS_API_BASE")
                .unwrap_or_else(|_| "https://sheets.googleapis.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            spreadsheet_id,
            sheet_name: env::var("GOOGLE_SHEETS_SHEET_NAME").unwrap_or_else(|_| "Sheet1".into()),
            auth,
            link_column: env::var("SHEET_LINK_COLUMN").unwrap_or_else(|_| "Link".into()),
            image_column: env::var("SHEET_IMAGE_COLUMN").unwrap_or_else(|_| "Imagem".into()),
            vertical_column: env::var("SHEET_VERTICAL_COLUMN")
                .unwrap_or_else(|_| "Imagem Vertical".into()),
        })
    }
}

impl SheetAuth {
    /// `GOOGLE_CREDENTIALS_PATH` wins, then `GOOGLE_SHEETS_TOKEN`, then a
    /// `credentials.json` in the working directory.
    fn from_env() -> Option<Self> {
        Self::resolve(
            env::var("GOOGLE_CREDENTIALS_PATH").ok(),
            env::var("GOOGLE_SHEETS_TOKEN").ok(),
        )
    }

    fn resolve(credentials_path: Option<String>, token: Option<String>) -> Option<Self> {
        if let Some(path) = credentials_path.filter(|p| !p.trim().is_empty()) {
            return Some(Self::ServiceAccount(PathBuf::from(path.trim())));
        }
        if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
            return Some(Self::Token(token.trim().to_string()));
        }
        let fallback = PathBuf::from(DEFAULT_CREDENTIALS_PATH);
        fallback.is_file().then_some(Self::ServiceAccount(fallback))
    }
}

/// Caption and font configuration for the square artifact.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Branding {
    pub font_path: Option<PathBuf>,
    pub upper: CaptionSpec,
    pub lower: CaptionSpec,
    pub fill: [u8; 3],
    pub outline: [u8; 3],
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptionSpec {
    pub text: String,
    pub size: f32,
    pub outline_radius: i32,
}

impl Default for Branding {
    fn default() -> Self {
        Self {
            font_path: None,
            upper: CaptionSpec {
                text: "SORTEIO".to_string(),
                size: 44.0,
                outline_radius: 4,
            },
            lower: CaptionSpec {
                text: "PARTICIPE!".to_string(),
                size: 52.0,
                outline_radius: 6,
            },
            fill: [139, 0, 0],
            outline: [255, 255, 255],
        }
    }
}

impl Branding {
    /// Loads the YAML branding file, falling back to defaults when the file
    /// is missing or malformed.
    pub fn load(path: Option<&PathBuf>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_yaml::from_str::<Branding>(&raw) {
                Ok(branding) => {
                    info!(target = "sorteio.config", path = %path.display(), "loaded branding file");
                    branding
                }
                Err(err) => {
                    warn!(target = "sorteio.config", path = %path.display(), error = %err, "invalid branding file; using defaults");
                    Self::default()
                }
            },
            Err(err) => {
                warn!(target = "sorteio.config", path = %path.display(), error = %err, "branding file unreadable; using defaults");
                Self::default()
            }
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn parse_env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().map(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn parse_list(key: &str) -> Option<Vec<String>> {
    let raw = env::var(key).ok()?;
    let items: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    (!items.is_empty()).then_some(items)
}

fn to_owned_list(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}
