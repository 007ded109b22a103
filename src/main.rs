use padlink::app::{GuiEvent, GuiObserver, StatusApp};
use padlink::config::ServerConfig;
use padlink::registry::Registry;
use padlink::{prefix, transport, virtual_controller};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::load();
    let prefix = prefix::load_or_generate(&prefix::prefix_path())?;
    let stop = CancellationToken::new();
    let (events_tx, events_rx) = crossbeam_channel::unbounded();

    let registry = Arc::new(Registry::new(
        virtual_controller::factory_for(config.backend),
        config.default_mode,
    ));
    if config.show_window {
        registry.add_observer(Arc::new(GuiObserver::new(events_tx.clone())));
    }

    let links = prefix::share_links(&config.host, config.port, &prefix);
    for link in &links {
        log::info!("Client link: {}", link);
    }
    let _ = events_tx.send(GuiEvent::Links(links));

    let server = {
        let config = config.clone();
        let registry = Arc::clone(&registry);
        let stop = stop.clone();
        std::thread::Builder::new()
            .name("server".to_string())
            .spawn(move || run_server(config, prefix, registry, stop, events_tx))?
    };

    if config.show_window {
        let native_options = eframe::NativeOptions {
            viewport: egui::ViewportBuilder::default()
                .with_inner_size([420.0, 520.0])
                .with_min_inner_size([320.0, 240.0])
                .with_title("Padlink"),
            ..Default::default()
        };
        let gui_stop = stop.clone();
        if let Err(e) = eframe::run_native(
            "Padlink",
            native_options,
            Box::new(move |cc| Ok(Box::new(StatusApp::new(cc, events_rx, gui_stop)))),
        ) {
            log::error!("Status window failed: {}", e);
        }
        stop.cancel();
    } else {
        drop(events_rx);
    }

    server
        .join()
        .map_err(|_| anyhow::anyhow!("Server thread panicked"))?
}

fn run_server(
    config: ServerConfig,
    prefix: String,
    registry: Arc<Registry>,
    stop: CancellationToken,
    events: crossbeam_channel::Sender<GuiEvent>,
) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let listener = match transport::bind(&config.host, config.port).await {
            Ok(listener) => listener,
            Err(e) => {
                let _ = events.send(GuiEvent::ServerFailed(e.to_string()));
                return Err(anyhow::Error::from(e));
            }
        };

        let router = transport::router(
            Arc::clone(&registry),
            &prefix,
            config.web_root.clone(),
            Duration::from_secs(config.heartbeat_secs),
        );

        let stop_signal = async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => log::info!("Interrupted"),
                    Err(e) => {
                        log::warn!("Cannot listen for Ctrl-C: {}", e);
                        stop.cancelled().await;
                    }
                },
            }
        };

        let result = transport::serve(listener, router, registry, stop_signal).await;
        let event = match &result {
            Ok(()) => GuiEvent::ServerStopped,
            Err(e) => GuiEvent::ServerFailed(e.to_string()),
        };
        let _ = events.send(event);
        result.map_err(anyhow::Error::from)
    })
}
