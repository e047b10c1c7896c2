use std::time::Duration;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use tokio::sync::watch;
use tracing::*;

pub use apim_operator::{self, telemetry, OperatorConfig, State};

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// Address of the metrics and health endpoints
    #[arg(long, env = "LISTEN_ADDRESS", default_value = "0.0.0.0:8080")]
    listen: String,

    /// Ingresses of this class get their TLS secrets published to the pem registries
    #[arg(long, env = "INGRESS_CLASS", default_value = "apim-gateway")]
    ingress_class: String,

    #[arg(long, env = "APIM_TIMEOUT_SECS", default_value_t = 5)]
    apim_timeout_secs: u64,

    #[arg(long, env = "RETRY_BASE_SECS", default_value_t = 1)]
    retry_base_secs: u64,

    #[arg(long, env = "RETRY_MAX_SECS", default_value_t = 300)]
    retry_max_secs: u64,

    /// Interval between drift checks of a synchronized ApiDefinition
    #[arg(long, env = "RESYNC_SECS", default_value_t = 600)]
    resync_secs: u64,

    #[arg(long, env = "RECONCILE_CONCURRENCY", default_value_t = 4)]
    concurrency: u16,
}

impl Arguments {
    fn config(&self) -> OperatorConfig {
        OperatorConfig {
            ingress_class: self.ingress_class.clone(),
            apim_timeout: Duration::from_secs(self.apim_timeout_secs),
            retry_base: Duration::from_secs(self.retry_base_secs),
            retry_max: Duration::from_secs(self.retry_max_secs),
            resync: Duration::from_secs(self.resync_secs),
            concurrency: self.concurrency,
        }
    }
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(e) => {
            warn!("failed to encode metrics: {e}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

/// Flip `shutdown` once the process is asked to stop, so in-flight management API calls
/// are cancelled
async fn forward_shutdown(shutdown: watch::Sender<bool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                warn!("could not listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = tokio::signal::ctrl_c().await;

    info!("Shutting down");
    let _ = shutdown.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let args: Arguments = Arguments::parse();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(forward_shutdown(shutdown_tx));

    // Initiatilize Kubernetes controller state
    let state = State::new(args.config(), shutdown_rx);
    let controller = apim_operator::run(state.clone());
    tokio::pin!(controller);

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(&args.listen)?
    .shutdown_timeout(5)
    .run();

    tokio::pin!(server);

    // Both runtimes implements graceful shutdown, so poll until both are done
    tokio::join!(controller, server).1?;
    Ok(())
}
