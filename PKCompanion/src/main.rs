mod logs;

use std::sync::Arc;

use pkccompanion::kodi::KodiClient;
use pkccompanion::pms::PlexServerClient;
use pkccompanion::{CompanionConfigExt, CompanionService};
use pkcconfig::get_config;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_control = logs::init_logging();

    let config = get_config();
    let settings = config.get_companion_settings()?;
    info!(
        config_dir = config.directory(),
        log_level = %log_control.level(),
        client = settings.identity.identifier.as_str(),
        "PKCompanion starting"
    );
    if !settings.enabled {
        info!("Companion disabled in configuration, nothing to do");
        return Ok(());
    }

    let kodi = Arc::new(KodiClient::new(&settings.kodi));
    let mut server = PlexServerClient::new(
        settings.identity.clone(),
        settings.server_token.clone(),
        settings.server_timeout,
    );
    if let Some(url) = &settings.server_url {
        server = server.with_base_url(url.as_str());
    }
    let server = Arc::new(server);

    let discovered = server.clone();
    let service = Arc::new(
        CompanionService::new(settings, server, kodi.clone(), kodi)?.on_server_list(
            move |servers| {
                if let Some(first) = servers.first() {
                    discovered.use_discovered(first);
                }
            },
        ),
    );
    let handle = service.handle();

    let worker = tokio::task::spawn_blocking(move || service.run());

    info!("Press Ctrl+C to stop...");
    tokio::signal::ctrl_c().await?;
    info!("Stop requested");
    // shutdown messages are always shown
    if log_control.level() < LevelFilter::INFO {
        log_control.set_level(LevelFilter::INFO);
    }
    handle.stop();
    worker.await?;

    info!("PKCompanion stopped");
    Ok(())
}
