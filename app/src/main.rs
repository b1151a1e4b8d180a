//! laminar entrypoint.
//! - tracing initialization (env + config overrides)
//! - config load, listener bootstrap
//! - optional admin API server (`--ea`)

mod admin;
mod bootstrap;
mod cli;
mod logging;

use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    // Derive logging overrides from the config before initializing.
    if let Ok(conf) = lm_config::load_file(&args.config) {
        if let Some(app) = &conf.app {
            if !app.log_level.is_empty() {
                std::env::set_var("LM_LOG_LEVEL", &app.log_level);
            }
            if matches!(app.log_format.as_str(), "json" | "compact") {
                std::env::set_var("LM_LOG_FORMAT", &app.log_format);
            }
        }
    }
    logging::init_logging()?;

    match args.command {
        cli::Commands::Check => {
            match lm_config::load_file(&args.config) {
                Ok(conf) => {
                    println!(
                        "ok: {} listen, {} dial, {} route rules",
                        conf.listen.len(),
                        conf.dial.len(),
                        conf.route.len()
                    );
                    Ok(())
                }
                Err(e) => {
                    eprintln!("config error: {e:#}");
                    std::process::exit(1);
                }
            }
        }
        cli::Commands::Run => {
            let conf = lm_config::load_file(&args.config)?;
            let runtime = bootstrap::start(&conf).await?;

            if args.enable_admin {
                if let Some(app) = &conf.app {
                    if !app.admin_pass.is_empty() {
                        let prefix = args.admin_path_prefix.clone();
                        let pass = app.admin_pass.clone();
                        tokio::spawn(async move {
                            if let Err(e) = admin::run_admin_server(&prefix, &pass).await {
                                tracing::error!(error = %e, "admin server failed");
                            }
                        });
                    } else {
                        tracing::warn!("--ea given but app.admin_pass is empty, admin server not started");
                    }
                } else {
                    tracing::warn!("--ea given but config has no [app] table");
                }
            }

            info!(listeners = runtime.handles.len(), "laminar started");
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            runtime.shutdown().await;
            Ok(())
        }
    }
}
