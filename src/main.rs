use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use lesson_gateway::{
    init_tracing, load_secrets_file, AppConfig, Catalog, CatalogBuilder, ExecutionEngine, Gateway,
    LessonRegistry, MetricsEstimator, ModelListCache, PriceTable, ProviderTable, RemoteModelSource,
    Result, ScriptLoader,
};

#[derive(Parser)]
#[command(name = "lesson-gateway")]
#[command(about = "Discover lesson agents and stream their runs over HTTP")]
#[command(version)]
struct Cli {
    /// TOML configuration file; defaults apply when it does not exist
    #[arg(long, short, default_value = "gateway.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP, SSE and WebSocket API
    Serve {
        #[arg(long, help = "Override the configured bind host")]
        host: Option<String>,
        #[arg(long, help = "Override the configured port")]
        port: Option<u16>,
    },
    /// Build the static catalog and print tool and category distributions
    Catalog {
        #[arg(long, help = "Write the catalog here instead of the configured path")]
        output: Option<PathBuf>,
        /// Directories to scan, relative to the lessons root
        dirs: Vec<PathBuf>,
    },
    /// Print the lesson registry
    Lessons,
}

fn main() {
    dotenv::dotenv().ok();
    if let Some(home) = std::env::var_os("HOME") {
        load_secrets_file(PathBuf::from(home).join(".bash_secrets"));
    }

    let cli = Cli::parse();
    let cfg = match AppConfig::from_env_or_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {err}");
            process::exit(2);
        }
    };
    init_tracing(&cfg.log);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("error: failed to start runtime: {err}");
            process::exit(1);
        }
    };
    if let Err(err) = runtime.block_on(run(cli.command, cfg)) {
        tracing::error!(error = %err, "gateway exited with an error");
        process::exit(1);
    }
}

async fn run(command: Commands, mut cfg: AppConfig) -> Result<()> {
    let builder = CatalogBuilder::from_config(&cfg.lessons);
    match command {
        Commands::Catalog { output, dirs } => {
            let dirs = if dirs.is_empty() {
                cfg.lessons.catalog_dirs.clone()
            } else {
                dirs
            };
            let report = builder.build(&dirs);
            let output = output.unwrap_or_else(|| cfg.lessons.resolve(&cfg.lessons.catalog_path));
            report.write_json(&output)?;
            println!("Catalog: {} agents -> {}", report.entries.len(), output.display());
            if !report.errors.is_empty() {
                println!("Skipped {} files with errors", report.errors.len());
            }
            println!("\nTools:");
            for (tool, count) in report.tool_counts() {
                println!("  {tool:<12} {count}");
            }
            println!("\nCategories:");
            for (category, count) in report.category_counts() {
                println!("  {category:<24} {count}");
            }
            Ok(())
        }
        Commands::Lessons => {
            let registry = build_registry(&cfg, &builder);
            for module in registry.modules() {
                println!("{} ({})", module.title, module.id);
                for lesson in &module.lessons {
                    let readme = if lesson.has_readme { "" } else { "  [no README]" };
                    println!("  {:<40} {}{readme}", lesson.key, lesson.title);
                }
            }
            Ok(())
        }
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                cfg.server.host = host;
            }
            if let Some(port) = port {
                cfg.server.port = port;
            }
            let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
                .parse()
                .map_err(|err| lesson_gateway::GatewayError::configuration(
                    format!("invalid bind address: {err}"),
                    "Check server.host and server.port",
                ))?;

            let registry = Arc::new(build_registry(&cfg, &builder));
            let catalog = Arc::new(Catalog::load_or_empty(cfg.lessons.resolve(&cfg.lessons.catalog_path)));
            let prices = PriceTable::load_or_empty(cfg.lessons.resolve(&cfg.lessons.pricing_path));
            let estimator = MetricsEstimator::with_default_tokenizer(prices);
            let engine = ExecutionEngine::new(registry, catalog, estimator, &cfg.runner);

            let table = ProviderTable::from_config(&cfg.models);
            let source = RemoteModelSource::new(table, &cfg.models)?;
            let models = Arc::new(ModelListCache::new(Arc::new(source)));

            Gateway::new(engine, models, cfg.security.clone()).serve(addr).await
        }
    }
}

fn build_registry(cfg: &AppConfig, builder: &CatalogBuilder) -> LessonRegistry {
    let loader = Arc::new(ScriptLoader::new(cfg.runner.clone(), &cfg.lessons.root));
    let resolver = Arc::new(ProviderTable::from_config(&cfg.models));
    LessonRegistry::scan(builder, loader, resolver)
}
