use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use subprobe::config::Config;
use subprobe::subscription::{self, Node, SubscriptionFetcher};
use subprobe::tester::{report, TestOrchestrator};

#[derive(Parser)]
#[command(
    name = "subprobe",
    version,
    about = "Subprobe - subscription node reachability and throughput tester"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch and parse subscription sources into a node list
    Parse {
        /// File with one subscription URL per line (# comments)
        urls_file: String,
        /// Output file path
        #[arg(short, long, default_value = "data/cache/parsed_nodes.json")]
        output: String,
    },

    /// Test nodes from a parsed node list
    Test {
        /// Node list JSON file
        nodes_file: String,
        /// Output file path
        #[arg(short, long, default_value = "data/results/test_results.json")]
        output: String,
        /// Limit the number of tested nodes
        #[arg(short = 'n', long)]
        max_nodes: Option<usize>,
    },

    /// Full pipeline: parse subscriptions, then test the nodes
    Run {
        /// File with one subscription URL per line (# comments)
        urls_file: String,
        /// Limit the number of tested nodes
        #[arg(short = 'n', long)]
        max_nodes: Option<usize>,
        /// Where to store the parsed node list
        #[arg(long, default_value = "data/cache/parsed_nodes.json")]
        nodes_output: String,
        /// Where to store the test results
        #[arg(long, default_value = "data/results/test_results.json")]
        results_output: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = subprobe::config::load_config(&cli.config);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let outcome = tokio::select! {
        outcome = dispatch(cli.command, config) => outcome,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            std::process::exit(1);
        }
    };

    if let Err(e) = outcome {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

async fn dispatch(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Parse { urls_file, output } => {
            cmd_parse(&config, &urls_file, &output).await?;
            Ok(())
        }
        Commands::Test {
            nodes_file,
            output,
            max_nodes,
        } => cmd_test(config, &nodes_file, &output, max_nodes).await,
        Commands::Run {
            urls_file,
            max_nodes,
            nodes_output,
            results_output,
        } => {
            cmd_parse(&config, &urls_file, &nodes_output).await?;
            cmd_test(config, &nodes_output, &results_output, max_nodes).await
        }
    }
}

async fn cmd_parse(config: &Config, urls_file: &str, output: &str) -> Result<()> {
    // a single URL can be given in place of a URL list file
    let urls = if urls_file.starts_with("http://") || urls_file.starts_with("https://") {
        vec![urls_file.to_string()]
    } else {
        subscription::read_urls_file(urls_file)?
    };
    if urls.is_empty() {
        anyhow::bail!("no subscription URLs in '{}'", urls_file);
    }
    println!("parsing {} subscription sources...", urls.len());

    let fetcher = SubscriptionFetcher::new(config, PathBuf::from("cache"))?;
    let nodes = fetcher.parse_many(&urls).await;
    if nodes.is_empty() {
        anyhow::bail!("no valid nodes parsed from any subscription");
    }

    subscription::write_nodes(output, &nodes)?;
    println!("parsed {} nodes, saved to '{}'", nodes.len(), output);
    Ok(())
}

async fn cmd_test(
    mut config: Config,
    nodes_file: &str,
    output: &str,
    max_nodes: Option<usize>,
) -> Result<()> {
    if let Some(n) = max_nodes {
        config.test.max_nodes = n;
    }

    let content = std::fs::read_to_string(nodes_file)?;
    let nodes: Vec<Node> = serde_json::from_str(&content)?;
    let total = nodes.len();
    let valid: Vec<Node> = nodes.into_iter().filter(Node::is_valid).collect();
    if valid.len() < total {
        info!(dropped = total - valid.len(), "filtered invalid nodes");
    }
    println!("testing {} nodes...", valid.len());

    let orchestrator = TestOrchestrator::new(config);
    let results = orchestrator.run(valid).await;

    report::write_results(output, &results)?;
    report::print_summary(&results, 5);
    println!("results saved to '{}'", output);

    // results are emitted either way, but a run where no node ever got a
    // working proxy endpoint counts as failed
    let pool_unusable = !results.is_empty()
        && results.iter().all(|r| {
            r.error
                .as_deref()
                .is_some_and(|e| e.starts_with("proxy acquire failed"))
        });
    if pool_unusable {
        anyhow::bail!("proxy pool unusable: every node failed to acquire an endpoint");
    }
    Ok(())
}
