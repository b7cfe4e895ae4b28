//! access-log-exporter - exports nginx response status counts as cumulative metrics.
//!
//! Tails the configured JSON access log, counts responses per status code on each polling
//! period, and pushes the running totals to Cloud Monitoring or a local directory.

use access_log_exporter::config::Config;
use access_log_exporter::{logging, runner};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use tracing::{error, info};

const CONFIG_ENV: &str = "ACCESS_LOG_EXPORTER_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {config_path}"))?;
    logging::init_tracing(&config.logging)?;

    if let Some(addr) = config.metrics_listen_addr() {
        tokio::spawn(start_metrics_server(addr));
    }

    if let Err(err) = runner::run(&config).await {
        error!(error = %format!("{err:#}"), "access-log-exporter stopped with error");
        return Err(err);
    }
    Ok(())
}

/// Serves the default Prometheus registry at GET /metrics until Ctrl+C.
async fn start_metrics_server(addr: SocketAddr) {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::Encoder;
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr = %addr, error = %err, "failed to bind metrics server");
            return;
        }
    };

    info!(addr = %addr, "metrics server listening on /metrics");

    let shutdown_signal = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    tokio::pin!(shutdown_signal);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_signal => {
                info!("metrics server shutting down");
                break;
            }
            accept_result = listener.accept() => {
                let (stream, _) = match accept_result {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to accept metrics connection");
                        continue;
                    }
                };

                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                        let mut response = Response::new(Full::new(Bytes::new()));
                        if req.uri().path() != "/metrics" {
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            *response.body_mut() = Full::new(Bytes::from("Not Found"));
                            return Ok::<_, Infallible>(response);
                        }

                        let encoder = prometheus::TextEncoder::new();
                        let mut buffer = Vec::new();
                        match encoder.encode(&prometheus::gather(), &mut buffer) {
                            Ok(()) => {
                                if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                                    response.headers_mut().insert(CONTENT_TYPE, value);
                                }
                                *response.body_mut() = Full::new(Bytes::from(buffer));
                            }
                            Err(err) => {
                                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                                *response.body_mut() = Full::new(Bytes::from(err.to_string()));
                            }
                        }
                        Ok::<_, Infallible>(response)
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        tracing::debug!(error = %err, "error serving metrics connection");
                    }
                });
            }
        }
    }
}
