pub mod app;
pub mod auth;
pub mod bootstrap;
pub mod client_session;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod locks;
pub mod registry;
pub mod relaunch;
pub mod shell;
pub mod signals;
pub mod window;

#[cfg(feature = "tauri-host")]
mod commands;
#[cfg(feature = "tauri-host")]
pub mod host;

#[cfg(test)]
mod test_support;

pub use coordinator::{Coordinator, CoordinatorParts};
pub use error::{CoordinatorError, CoordinatorResult};

#[cfg(feature = "tauri-host")]
pub use tauri_app::run;

#[cfg(feature = "tauri-host")]
mod tauri_app {
    use std::sync::Arc;

    use tauri::{AppHandle, Manager};
    use tracing::{error, info, warn};

    use crate::app::{APP_NAME, APP_VERSION};
    use crate::auth::HttpAuthProvider;
    use crate::bootstrap::{AssetResolver, Bootstrap, DevServerAssets, StaticAssets};
    use crate::client_session::ClientSession;
    use crate::commands;
    use crate::config::ClientConfig;
    use crate::coordinator::{Coordinator, CoordinatorParts};
    use crate::host::{TauriOpener, TauriWindowHost};
    use crate::relaunch::{ProcessRelauncher, RelaunchSnapshot};
    use crate::shell::ExternalOpener;
    use crate::signals::SignalBus;

    const DEV_SERVER_PORT: u16 = 4000;

    fn build_coordinator(handle: &AppHandle, config: ClientConfig, args: Vec<String>) -> anyhow::Result<Arc<Coordinator>> {
        let bus = SignalBus::new();
        let opener: Arc<dyn ExternalOpener> = Arc::new(TauriOpener::new(handle.clone()));
        let auth_provider = Arc::new(HttpAuthProvider::new(config.auth.clone(), opener.clone())?);
        let host = Arc::new(TauriWindowHost::new(
            handle.clone(),
            bus.clone(),
            (config.lab.default_width, config.lab.default_height),
        ));

        // Settings are a convenience; the shell still runs without them.
        let client_session = match ClientSession::open(
            &config.paths().client_sessions(),
            &config.main_app,
            config.supported_locales.clone(),
        ) {
            Ok(session) => Some(Arc::new(session)),
            Err(e) => {
                warn!("Client session unavailable: {}", e);
                None
            }
        };

        Ok(Coordinator::new(
            config,
            CoordinatorParts {
                bus,
                host,
                auth_provider,
                relauncher: Arc::new(ProcessRelauncher::current()?),
                opener,
                client_session,
                args,
            },
        ))
    }

    fn asset_resolver(handle: &AppHandle) -> anyhow::Result<Arc<dyn AssetResolver>> {
        if cfg!(debug_assertions) {
            return Ok(Arc::new(DevServerAssets::new(DEV_SERVER_PORT)));
        }
        let index = handle.path().resource_dir()?.join("dist").join("index.html");
        Ok(Arc::new(StaticAssets::new(index)))
    }

    #[cfg_attr(mobile, tauri::mobile_entry_point)]
    pub fn run() {
        let config = ClientConfig::load();
        let level = config.log_level.parse().unwrap_or(tracing::Level::INFO);
        tracing_subscriber::fmt().with_max_level(level).init();
        info!("Starting {} {}", APP_NAME, APP_VERSION);

        let args: Vec<String> = std::env::args().skip(1).collect();
        let snapshot = RelaunchSnapshot::from_args(&args);
        if let Some(reason) = &snapshot.reason {
            info!("Relaunched ({}), {} desktop(s) to restore", reason, snapshot.desktops.len());
        }

        tauri::Builder::default()
            .plugin(tauri_plugin_shell::init())
            .setup(move |app| {
                let handle = app.handle().clone();
                let coordinator = build_coordinator(&handle, config, args)?;
                app.manage(coordinator.clone());

                let boot = Bootstrap::new(coordinator, asset_resolver(&handle)?, None, snapshot);
                tauri::async_runtime::spawn(async move {
                    match boot.run().await {
                        Ok(outcome) => info!("Session ended after {:?}", outcome),
                        Err(e) => error!("Boot failed: {}", e),
                    }
                    handle.exit(0);
                });
                Ok(())
            })
            .invoke_handler(tauri::generate_handler![
                commands::open_session,
                commands::close_session,
                commands::change_locale,
                commands::get_locale,
                commands::login,
                commands::logout,
                commands::open_external,
                commands::save_window_bounds,
                commands::get_client_settings,
                commands::set_view_columns_order,
                commands::set_view_column_width,
                commands::set_view_column_sorting,
            ])
            .run(tauri::generate_context!())
            .expect("error while running tauri application");
    }
}
