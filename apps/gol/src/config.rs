use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "gol.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub listen: String,
    pub broker_url: String,
    pub worker_urls: Vec<String>,
    pub image_name: String,
    pub turns: u64,
    pub threads: usize,
    pub task_timeout_ms: u64,
    pub status_interval_ms: u64,
    pub images_dir: PathBuf,
    pub out_dir: PathBuf,
    pub max_body_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8030".into(),
            broker_url: "http://127.0.0.1:8030".into(),
            worker_urls: Vec::new(),
            image_name: "16x16".into(),
            turns: 100,
            threads: 4,
            task_timeout_ms: 10_000,
            status_interval_ms: 2_000,
            images_dir: "images".into(),
            out_dir: "out".into(),
            max_body_bytes: worker::DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileSettings {
    listen: Option<String>,
    broker_url: Option<String>,
    worker_urls: Option<Vec<String>>,
    image_name: Option<String>,
    turns: Option<u64>,
    threads: Option<usize>,
    task_timeout_ms: Option<u64>,
    status_interval_ms: Option<u64>,
    images_dir: Option<PathBuf>,
    out_dir: Option<PathBuf>,
    max_body_bytes: Option<usize>,
}

/// Defaults, then the config file, then the environment. An explicitly named
/// config file must exist; the default one is optional.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();

    let (path, required) = match path {
        Some(path) => (path, true),
        None => (Path::new(DEFAULT_CONFIG_PATH), false),
    };
    match fs::read_to_string(path) {
        Ok(raw) => apply_file(&mut settings, &raw)
            .with_context(|| format!("invalid config file '{}'", path.display()))?,
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("cannot read config file '{}'", path.display()))
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok())?;
    Ok(settings)
}

fn apply_file(settings: &mut Settings, raw: &str) -> Result<()> {
    let file: FileSettings = toml::from_str(raw)?;
    if let Some(v) = file.listen {
        settings.listen = v;
    }
    if let Some(v) = file.broker_url {
        settings.broker_url = v;
    }
    if let Some(v) = file.worker_urls {
        settings.worker_urls = v.iter().map(String::as_str).map(normalize_worker_url).collect();
    }
    if let Some(v) = file.image_name {
        settings.image_name = v;
    }
    if let Some(v) = file.turns {
        settings.turns = v;
    }
    if let Some(v) = file.threads {
        settings.threads = v;
    }
    if let Some(v) = file.task_timeout_ms {
        settings.task_timeout_ms = v;
    }
    if let Some(v) = file.status_interval_ms {
        settings.status_interval_ms = v;
    }
    if let Some(v) = file.images_dir {
        settings.images_dir = v;
    }
    if let Some(v) = file.out_dir {
        settings.out_dir = v;
    }
    if let Some(v) = file.max_body_bytes {
        settings.max_body_bytes = v;
    }
    Ok(())
}

/// Each setting reads `GOL_<NAME>`, then `APP__<NAME>`; the later one wins.
fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
    let var = |name: &str| {
        lookup(&format!("APP__{name}")).or_else(|| lookup(&format!("GOL_{name}")))
    };

    if let Some(v) = var("LISTEN") {
        settings.listen = v;
    }
    if let Some(v) = var("BROKER_URL") {
        settings.broker_url = v;
    }
    if let Some(v) = var("WORKER_URLS") {
        settings.worker_urls = parse_worker_list(&v);
    }
    if let Some(v) = var("IMAGE_NAME") {
        settings.image_name = v;
    }
    if let Some(v) = var("TURNS") {
        settings.turns = parse_var("TURNS", &v)?;
    }
    if let Some(v) = var("THREADS") {
        settings.threads = parse_var("THREADS", &v)?;
    }
    if let Some(v) = var("TASK_TIMEOUT_MS") {
        settings.task_timeout_ms = parse_var("TASK_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = var("STATUS_INTERVAL_MS") {
        settings.status_interval_ms = parse_var("STATUS_INTERVAL_MS", &v)?;
    }
    if let Some(v) = var("IMAGES_DIR") {
        settings.images_dir = v.into();
    }
    if let Some(v) = var("OUT_DIR") {
        settings.out_dir = v.into();
    }
    if let Some(v) = var("MAX_BODY_BYTES") {
        settings.max_body_bytes = parse_var("MAX_BODY_BYTES", &v)?;
    }
    Ok(())
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("invalid value '{raw}' for {name}"))
}

/// Comma separated worker addresses, normalised to base URLs.
pub fn parse_worker_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(normalize_worker_url)
        .collect()
}

pub fn normalize_worker_url(raw: &str) -> String {
    let raw = raw.trim().trim_end_matches('/');
    if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    }
}

pub fn listen_addr(settings: &Settings, port: Option<u16>) -> Result<SocketAddr> {
    let mut addr: SocketAddr = settings
        .listen
        .parse()
        .with_context(|| format!("invalid listen address '{}'", settings.listen))?;
    if let Some(port) = port {
        addr.set_port(port);
    }
    Ok(addr)
}

pub fn require_workers(settings: &Settings) -> Result<&[String]> {
    if settings.worker_urls.is_empty() {
        bail!("no worker urls configured; pass --workers or set GOL_WORKER_URLS");
    }
    Ok(&settings.worker_urls)
}
