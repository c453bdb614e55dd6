//! Kite demo runtime - main entry point.
//!
//! Boots a small set of services on the worker pool, drives a few requests
//! through them and shuts down. With `--serve` it keeps running until
//! Ctrl-C, then performs the coordinated stop.

use clap::Parser;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

use kite::{
    BootDefinition, Config, Kite, Module, Request, Router, ServiceDefinition, TimerDefinition,
};

#[derive(Debug, Parser)]
#[command(name = "kite", about = "In-process actor-style service runtime demo")]
struct Args {
    /// Number of workers (defaults to available parallelism).
    #[arg(short, long, env = "KITE_WORKERS")]
    workers: Option<usize>,

    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of echo instances to address.
    #[arg(short, long, default_value_t = 4)]
    instances: usize,

    /// Keep running until Ctrl-C.
    #[arg(long)]
    serve: bool,
}

fn demo_module() -> Module {
    let echo = ServiceDefinition::new()
        .auto_create(true)
        .handler("hello", |cx, event| async move {
            let worker = cx.kernel().worker_index();
            Ok(json!({ "echo": event.body().clone(), "worker": worker }))
        });

    let clock = ServiceDefinition::new()
        .depends("echo")
        .timer(
            "tick",
            TimerDefinition::interval(Duration::from_secs(5), |cx| async move {
                cx.broad_event("tick", vec![json!(chrono::Utc::now().to_rfc3339())]);
                Ok(())
            }),
        );

    Module::new("demo").service("echo", echo).service("clock", clock)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    }
    .apply_env()?;

    // Initialize observability
    kite::observability::init_tracing_with(&config.observability);

    let mut kite = Kite::with_config(config);
    kite.regist(demo_module())?
        .boot(BootDefinition::new().service("clock/main"))?;
    kite.start(args.workers).await?;

    for i in 0..args.instances {
        let router = Router::new("echo", i.to_string());
        let response = kite
            .fetch(Request::fetch(router.clone(), "handlers/hello").body(Value::from(i)))
            .await;
        tracing::info!(
            "demo_fetch: target={} status={} body={:?}",
            router,
            response.status,
            response.body.as_json()
        );
    }

    for info in kite.list_services().await? {
        tracing::info!("live_service: router={} worker={}", info.router, info.worker);
    }

    if args.serve {
        tracing::info!("serving; press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
    }

    kite.stop().await?;
    Ok(())
}
