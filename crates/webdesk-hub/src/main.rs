use clap::Parser;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use url::Url;
use webdesk_hub::{
    ApiMetricsSource, ApiTokenValidator, HubConfig, MetricsSource, TokenValidator,
    DEFAULT_HUB_ADDR,
};

const DEFAULT_API_URL: &str = "http://127.0.0.1:8000/";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    api_url: String,
    service_token: String,
    debug: bool,
    metrics_interval: Duration,
    write_timeout: Duration,
    request_timeout: Duration,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "webdesk-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    api_url: String,
    #[arg(long, default_value = "")]
    service_token: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 2000)]
    metrics_interval_ms: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 5)]
    request_timeout: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);

    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    let api_url = match Url::parse(&config.api_url) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_api_url", error = %err, api_url = %config.api_url);
            return;
        }
    };

    let validator: Arc<dyn TokenValidator> =
        match ApiTokenValidator::new(&api_url, config.request_timeout) {
            Ok(value) => Arc::new(value),
            Err(err) => {
                error!(event = "hub_error", error = %err);
                return;
            }
        };
    let metrics: Arc<dyn MetricsSource> =
        match ApiMetricsSource::new(&api_url, &config.service_token, config.request_timeout) {
            Ok(value) => Arc::new(value),
            Err(err) => {
                error!(event = "hub_error", error = %err);
                return;
            }
        };
    if config.service_token.is_empty() {
        warn!(event = "service_token_missing");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    let hub_config = HubConfig {
        addr,
        metrics_interval: config.metrics_interval,
        write_timeout: config.write_timeout,
        ..HubConfig::default()
    };
    if let Err(err) = webdesk_hub::run(hub_config, validator, metrics, shutdown_rx).await {
        error!(event = "hub_error", error = %err);
    }
    info!(event = "hub_stop");
}

fn load_config() -> Config {
    let args = Args::parse();
    let debug = args.debug || env_true("WEBDESK_HUB_DEBUG");
    Config {
        addr: resolve_addr(&args.addr),
        api_url: resolve_api_url(&args.api_url),
        service_token: resolve_service_token(&args.service_token),
        debug,
        metrics_interval: Duration::from_millis(args.metrics_interval_ms),
        write_timeout: Duration::from_secs(args.write_timeout),
        request_timeout: Duration::from_secs(args.request_timeout),
        log_dir: resolve_log_dir(&args.log_dir),
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Some(level) = env_value("WEBDESK_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Mirrors every log line to stdout and, when configured, a log file.
struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("webdesk-hub.log"))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_true(key: &str) -> bool {
    env_value(key)
        .map(|value| matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn resolve_flag(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    env_value(env_key).unwrap_or_else(|| default.to_string())
}

fn resolve_addr(addr_flag: &str) -> String {
    resolve_flag(addr_flag, "WEBDESK_HUB_ADDR", DEFAULT_HUB_ADDR)
}

fn resolve_api_url(api_url_flag: &str) -> String {
    resolve_flag(api_url_flag, "WEBDESK_API_URL", DEFAULT_API_URL)
}

fn resolve_service_token(token_flag: &str) -> String {
    resolve_flag(token_flag, "WEBDESK_SERVICE_TOKEN", "")
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    resolve_flag(log_dir_flag, "WEBDESK_LOG_DIR", "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_win_over_defaults() {
        assert_eq!(resolve_flag("0.0.0.0:9000", "WEBDESK_TEST_UNSET_KEY", "x"), "0.0.0.0:9000");
        assert_eq!(resolve_flag("  ", "WEBDESK_TEST_UNSET_KEY", "fallback"), "fallback");
    }

    #[test]
    fn args_parse_with_defaults() {
        let args = Args::parse_from(["webdesk-hub", "--addr", "127.0.0.1:9100"]);
        assert_eq!(args.addr, "127.0.0.1:9100");
        assert_eq!(args.metrics_interval_ms, 2000);
        assert!(!args.debug);
    }
}
