use adjutant::cli;

#[tokio::main]
async fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,teloxide=warn".parse().expect("default filter parses"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let code = cli::run().await;
    std::process::exit(code);
}
