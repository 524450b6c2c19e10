use artspark::client::{HttpRelayTransport, JobObserver, JobOutcome, JobPoller};
use artspark::jobs::Provider;
use artspark::logging::{init_tracing, setup_panic_hook};
use artspark::main_helper::{
    build_http_client, Args, Command, GenerateArgs, ServeArgs, UpstreamSettings,
};
use artspark::server::router;
use artspark::{AppState, JobResult};
use clap::Parser;
use colored::*;
use std::sync::Arc;
use std::time::Duration;

/// Prints job progress for the `generate` subcommand.
struct ConsoleObserver {
    last_percent: Option<u8>,
}

impl JobObserver for ConsoleObserver {
    fn on_progress(&mut self, percent: u8) {
        if self.last_percent == Some(percent) {
            return;
        }
        self.last_percent = Some(percent);
        eprintln!("{} {}%", "progress".cyan(), percent);
    }

    fn on_success(&mut self, result: JobResult) {
        println!("{} {}", "done".green().bold(), result.image_url);
        for extra in result.results.iter().skip(1) {
            println!("     {}", extra.url);
        }
    }

    fn on_error(&mut self, message: String) {
        eprintln!("{} {}", "failed".red().bold(), message);
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let guard = match init_tracing(&args.log_dir, args.log_json) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e.inner);
            std::process::exit(1);
        }
    };
    setup_panic_hook();

    let code = match args.command {
        Command::Serve(serve_args) => serve(serve_args).await,
        Command::Generate(generate_args) => generate(generate_args).await,
    };
    drop(guard);
    std::process::exit(code);
}

async fn serve(args: ServeArgs) -> i32 {
    for provider in [Provider::Grsai, Provider::Replicate] {
        if let Err(e) = UpstreamSettings::from_env(&args, provider) {
            tracing::warn!("{} (requests will be rejected until it is set)", e.inner);
        }
    }

    let state = match AppState::new(args) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            tracing::error!("{}", e.inner);
            return 1;
        }
    };

    let addr = format!("{}:{}", state.args.host, state.args.port);
    let app = router(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            return 1;
        }
    };

    tracing::info!("Artspark relay listening on {}", addr);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutting down");
    };

    match axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("Server error: {}", e);
            1
        }
    }
}

async fn generate(args: GenerateArgs) -> i32 {
    let request = match args.to_request() {
        Ok(request) => request,
        Err(e) => {
            eprintln!("{} {}", "invalid request:".red().bold(), e.inner);
            return 2;
        }
    };

    let client = match build_http_client(Duration::from_secs(10)) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e.inner);
            return 1;
        }
    };

    let transport = HttpRelayTransport::new(client, args.relay_url.clone());
    let poller = JobPoller::new(transport, args.poller_config());
    let mut observer = ConsoleObserver { last_percent: None };

    eprintln!(
        "{} {} via {}",
        "submitting".bold(),
        request.kind,
        args.relay_url
    );
    let report = poller.run(&request, &mut observer).await;
    tracing::info!("Job finished after {} attempt(s)", report.attempts);

    match report.outcome {
        JobOutcome::Succeeded(_) => 0,
        JobOutcome::Failed(_) => 1,
    }
}
