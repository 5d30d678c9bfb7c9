//! Tracing subscriber setup.
//!
//! Two outputs, each with its own writer:
//! - the error log receives every diagnostic event except access events
//! - the access log receives only events with target [`ACCESS_LOG_TARGET`]
//!
//! A destination of "-" means the standard stream (stderr for the error log,
//! stdout for the access log); anything else is a file opened for appending.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::filter::{filter_fn, Directive};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LoggingConfig, LOG_TO_STD_STREAM};
use crate::middleware::ACCESS_LOG_TARGET;

type Subscriber = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<Subscriber> + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to open log file {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid log filter: {0}")]
    Filter(String),
    #[error("Failed to install subscriber: {0}")]
    Init(String),
}

/// Pick the log filter with priority: command line > RUST_LOG > configuration.
pub fn resolve_filter(cli: Option<String>, config: &LoggingConfig) -> String {
    cli.or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| config.default_filter())
}

/// Whether a destination refers to the standard stream
fn is_std_stream(destination: &str) -> bool {
    destination == LOG_TO_STD_STREAM
}

fn file_writer(path: &str) -> Result<BoxMakeWriter, LoggingError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LoggingError::Open {
            path: path.to_string(),
            source,
        })?;
    Ok(BoxMakeWriter::new(Mutex::new(file)))
}

fn error_writer(destination: &str) -> Result<BoxMakeWriter, LoggingError> {
    if is_std_stream(destination) {
        Ok(BoxMakeWriter::new(std::io::stderr))
    } else {
        file_writer(destination)
    }
}

fn access_writer(destination: &str) -> Result<BoxMakeWriter, LoggingError> {
    if is_std_stream(destination) {
        Ok(BoxMakeWriter::new(std::io::stdout))
    } else {
        file_writer(destination)
    }
}

fn output_layer(writer: BoxMakeWriter, json: bool, ansi: bool) -> BoxedLayer {
    if json {
        tracing_subscriber::fmt::layer::<Subscriber>()
            .json()
            .with_writer(writer)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer::<Subscriber>()
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed()
    }
}

/// Build the filter, always letting access events through when the access log is on.
fn build_filter(filter: &str, access_enabled: bool) -> Result<EnvFilter, LoggingError> {
    let env_filter = EnvFilter::try_new(filter).map_err(|e| LoggingError::Filter(e.to_string()))?;
    if !access_enabled {
        return Ok(env_filter);
    }
    let directive = format!("{ACCESS_LOG_TARGET}=info")
        .parse::<Directive>()
        .map_err(|e| LoggingError::Filter(e.to_string()))?;
    Ok(env_filter.add_directive(directive))
}

/// Install the global subscriber.
pub fn init(config: &LoggingConfig, filter: &str) -> Result<(), LoggingError> {
    let json = config.is_json();
    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(2);

    let errorlog = error_writer(&config.errorlog)?;
    layers.push(
        output_layer(errorlog, json, is_std_stream(&config.errorlog))
            .with_filter(filter_fn(|meta| meta.target() != ACCESS_LOG_TARGET))
            .boxed(),
    );

    if let Some(destination) = &config.accesslog {
        let accesslog = access_writer(destination)?;
        layers.push(
            output_layer(accesslog, json, false)
                .with_filter(filter_fn(|meta| meta.target() == ACCESS_LOG_TARGET))
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(build_filter(filter, config.accesslog.is_some())?)
        .with(layers)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_filter_wins() {
        let config = LoggingConfig::default();
        let filter = resolve_filter(Some("storefront=trace".to_string()), &config);
        assert_eq!(filter, "storefront=trace");
    }

    #[test]
    fn test_filter_rejects_garbage() {
        assert!(matches!(
            build_filter("storefront=notalevel", false),
            Err(LoggingError::Filter(_))
        ));
    }

    #[test]
    fn test_filter_with_access_directive() {
        let filter = build_filter("storefront=error", true).unwrap();
        assert!(filter.to_string().contains(ACCESS_LOG_TARGET));
    }

    #[test]
    fn test_file_destination_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let path = path.to_str().unwrap();

        assert!(access_writer(path).is_ok());
        assert!(std::path::Path::new(path).exists());
    }

    #[test]
    fn test_unwritable_destination_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("error.log");
        assert!(matches!(
            error_writer(path.to_str().unwrap()),
            Err(LoggingError::Open { .. })
        ));
    }
}
