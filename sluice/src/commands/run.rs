use anyhow::Result;
use futures::StreamExt;
use sluice_api::ApiServer;
use sluice_core::Services;
use tracing::*;

#[cfg(target_os = "linux")]
use sd_notify::NotifyState;

use crate::config::load_config;

pub(crate) async fn command(cli: &crate::Cli) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    info!(%version, "Sluice");

    let config = load_config(&cli.config)?;
    let services = Services::new(config.clone()).await?;

    let mut server_futures = futures::stream::FuturesUnordered::new();

    if config.store.http.enable {
        server_futures.push(ApiServer::new(&services).run(config.store.http.listen));
    }

    let reaper = services.start_reaper();

    if console::user_attended() {
        info!("--------------------------------------------");
        info!("Sluice is now running.");
        for class in &config.store.resource_classes {
            info!("Resource class {:<12} limit {}", class.name, class.limit);
        }
        if config.store.http.enable {
            info!("Accepting API requests on http://{}/api", config.store.http.listen);
        }
        info!("--------------------------------------------");
    }

    #[cfg(target_os = "linux")]
    if let Ok(true) = sd_notify::booted() {
        use std::time::Duration;
        tokio::spawn(async {
            if let Err(error) = async {
                sd_notify::notify(false, &[NotifyState::Ready])?;
                loop {
                    sd_notify::notify(false, &[NotifyState::Watchdog])?;
                    tokio::time::sleep(Duration::from_secs(15)).await;
                }
                #[allow(unreachable_code)]
                Ok::<(), anyhow::Error>(())
            }
            .await
            {
                error!(?error, "Failed to communicate with systemd");
            }
        });
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                break;
            }
            result = server_futures.next(), if !server_futures.is_empty() => {
                if let Some(Err(error)) = result {
                    error!(?error, "API server error");
                    std::process::exit(1);
                }
            }
        }
    }

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    info!("Exiting");
    Ok(())
}
