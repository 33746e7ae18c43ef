use clap::Parser;

/// "Bourse" exchange server.
#[derive(Debug, Parser)]
#[command(name = "bourse")]
struct Args {
    /// Port on which the server should listen.
    #[arg(short = 'p', long = "port", env = bourse::config::LISTEN_PORT)]
    port: u16,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    let args = Args::parse();

    let body = async {
        tracing_subscriber::fmt::fmt()
            .with_file(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();

        let config = bourse::Config::from_port(args.port);
        bourse::start_server(config, bourse::signal::from_host_os())
            .await
            .map_err(|err| Box::new(err) as Box<_>)
    };

    return tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed building the Runtime")
        .block_on(body);
}
