//! # ModelGraph
//!
//! The command line binary for the modelgraph object layer.
//!
//! ## Usage
//!
//! ```bash
//! # Check a specification
//! modelgraph --spec specs/resource_transmission.xml validate
//!
//! # One command against a redb store
//! modelgraph -S specs/resource_transmission.xml -B redb exec create Unit name=kg
//!
//! # Interactive session
//! modelgraph -S specs/resource_transmission.xml repl
//! ```

use clap::Parser;
use modelgraph::LogFormat;
use modelgraph::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

fn main() {
    let cli = cli::Cli::parse();

    let config = match cli.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    // Initialize tracing; MODELGRAPH_LOG_FORMAT=json or --log-format json for machine-parseable output.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "modelgraph=info,modelgraph_core=info".into());

    match config.log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli, &config) {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Print the startup banner.
fn print_banner() {
    println!(
        r#"
  modelgraph v{}
  objects over a property graph
"#,
        env!("CARGO_PKG_VERSION")
    );
}
