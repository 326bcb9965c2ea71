mod audio;
mod connection;
mod console;
mod diagnostics;
mod history;
mod hotkey;
mod notifier;
mod playback;
mod protocol;
mod provider;
mod recording;
mod session;
mod settings;
mod state;

use connection::ws::WsTransport;
use connection::ConnectionManager;
use notifier::{ErrorBanner, Notifier};
use playback::{HttpFetcher, PlaybackController, RodioOutput};
use provider::openai::OpenAiProvider;
use provider::session::RealtimeSpeechCapture;
use provider::ProviderSettings;
use recording::CaptureConfig;
use session::{SessionController, SessionParts};
use state::AppEvent;
use std::sync::Arc;
use tokio::sync::mpsc;

const RECENT_HISTORY: usize = 6;

fn main() {
    if let Some(path) = diagnostics::init_logging() {
        log::info!("[voicechat] logging to {}", path.display());
    }
    diagnostics::install_panic_hook();

    if let Err(e) = run() {
        log::error!("[voicechat] {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let settings = settings::load();
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| format!("Failed to create tokio runtime: {}", e))?;
    let (event_tx, event_rx) = mpsc::unbounded_channel::<AppEvent>();

    let history = if settings.history_enabled {
        match history::History::open_default() {
            Ok(h) => {
                let mut recent = h.recent(RECENT_HISTORY);
                recent.reverse();
                for entry in recent {
                    println!("{:>9}: {}", entry.speaker.as_str(), entry.text);
                }
                Some(h)
            }
            Err(e) => {
                log::warn!("[voicechat] history disabled: {}", e);
                None
            }
        }
    } else {
        None
    };
    let notifier: Arc<dyn Notifier> = Arc::new(console::ConsoleNotifier::new(history));
    let errors = ErrorBanner::new(notifier, settings.error_display());

    let manager = ConnectionManager::new(
        settings.ws_url(),
        Arc::new(WsTransport),
        settings.retry_policy(),
        event_tx.clone(),
    );
    let connection = Arc::new(manager.handle());

    let output = Arc::new(RodioOutput::spawn()?);
    let fetcher = Arc::new(HttpFetcher::new(&settings.proxy_base_url())?);
    let playback = Arc::new(PlaybackController::new(fetcher, output, errors.clone()));
    let playback_status = playback.subscribe();

    if settings.api_key.is_empty() {
        log::warn!(
            "[voicechat] {} is not set; speech capture will not start",
            settings::ENV_API_KEY
        );
    }
    let capture = Arc::new(RealtimeSpeechCapture::new(
        Arc::new(OpenAiProvider),
        ProviderSettings {
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            transcription_model: settings.transcription_model.clone(),
            locale: settings.locale.clone(),
        },
        settings.mic_device().map(str::to_string),
    ));

    let controller = SessionController::new(SessionParts {
        errors,
        connection,
        capture,
        player: playback,
        events: event_tx.clone(),
        capture_config: CaptureConfig {
            language: settings.locale.clone(),
            ..CaptureConfig::default()
        },
        voice_actor_id: settings.voice_actor_id.clone(),
    });

    match hotkey::start_listener(&settings.hotkey, event_tx.clone()) {
        Ok(()) => log::info!("[voicechat] hold {} to talk", settings.hotkey),
        Err(e) => log::warn!("[voicechat] hotkey disabled: {}", e),
    }
    console::spawn_command_reader(event_tx, settings.clone())?;
    println!("{}", console::HELP);

    runtime.block_on(async move {
        let mut status = playback_status;
        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                log::debug!("[playback] status {:?}", *status.borrow());
            }
        });
        let connection_task = tokio::spawn(manager.run());
        controller.run(event_rx).await;
        connection_task.abort();
    });
    log::info!("[voicechat] bye");
    Ok(())
}
