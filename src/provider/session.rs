use super::{ConnectionConfig, ProviderEvent, ProviderSettings, SttProvider};
use crate::audio::MicCapture;
use crate::recording::{CaptureConfig, CaptureReporter, SpeechCapture};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, Request};
use tokio_tungstenite::{connect_async, tungstenite};

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    tungstenite::Message,
>;

const AUDIO_BUFFER_CHUNKS: usize = 64;

fn build_ws_request(config: &ConnectionConfig) -> Result<Request<()>, String> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| format!("Failed to build request: {}", e))?;
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| format!("Invalid header name '{}': {}", name, e))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| format!("Invalid header value for '{}': {}", name, e))?;
        request.headers_mut().insert(name, value);
    }
    Ok(request)
}

async fn send_json(ws_tx: &mut WsSink, msg: &Value) -> Result<(), String> {
    ws_tx
        .send(tungstenite::Message::Text(msg.to_string().into()))
        .await
        .map_err(|e| format!("websocket send failed: {}", e))
}

struct ActiveCapture {
    session: u64,
    mic: MicCapture,
}

/// Speech capture backed by a streaming transcription provider. Each
/// `start` opens the microphone and a provider socket; the first final
/// transcript completes the utterance.
pub struct RealtimeSpeechCapture {
    provider: Arc<dyn SttProvider>,
    settings: ProviderSettings,
    mic_device: Option<String>,
    active: Arc<Mutex<Option<ActiveCapture>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RealtimeSpeechCapture {
    pub fn new(
        provider: Arc<dyn SttProvider>,
        settings: ProviderSettings,
        mic_device: Option<String>,
    ) -> Self {
        Self {
            provider,
            settings,
            mic_device,
            active: Arc::new(Mutex::new(None)),
        }
    }
}

/// Drops the microphone of `session` if it is still the active one.
fn release(active: &Mutex<Option<ActiveCapture>>, session: u64) {
    let mut slot = lock(active);
    if slot.as_ref().map(|a| a.session) == Some(session) {
        *slot = None;
    }
}

impl SpeechCapture for RealtimeSpeechCapture {
    fn start(&self, config: &CaptureConfig, reporter: CaptureReporter) -> Result<(), String> {
        if self.settings.api_key.is_empty() {
            return Err("No transcription API key configured (set OPENAI_API_KEY)".into());
        }
        let settings = ProviderSettings {
            locale: config.language.clone(),
            ..self.settings.clone()
        };
        let conn = self.provider.connection_config(&settings);
        let request = build_ws_request(&conn)?;

        let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(AUDIO_BUFFER_CHUNKS);
        let mic = MicCapture::start(self.mic_device.as_deref(), audio_tx, conn.sample_rate)?;
        let session = reporter.session();
        *lock(&self.active) = Some(ActiveCapture { session, mic });

        let provider = self.provider.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            if let Err(e) = run_transcription(provider.as_ref(), &conn, request, audio_rx, &reporter).await {
                log::error!("[capture] {}", e);
            }
            release(&active, session);
            reporter.ended();
        });
        Ok(())
    }

    fn stop(&self) {
        if let Some(active) = lock(&self.active).as_mut() {
            log::info!("[capture] stopping microphone (session {})", active.session);
            active.mic.stop();
        }
    }
}

/// Streams audio until the microphone stops, then commits and waits up to
/// `final_wait_ms` for the transcript. Returns once a final transcript was
/// reported, the socket closed, or the wait ran out.
async fn run_transcription(
    provider: &dyn SttProvider,
    config: &ConnectionConfig,
    request: Request<()>,
    mut audio_rx: mpsc::Receiver<Vec<u8>>,
    reporter: &CaptureReporter,
) -> Result<(), String> {
    let name = provider.name();
    log::info!("[capture] {} connecting: {}", name, config.url);
    let (ws_stream, _) = connect_async(request)
        .await
        .map_err(|e| format!("{} connect failed: {}", name, e))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    if let Some(init) = &config.init_message {
        send_json(&mut ws_tx, init).await?;
    }

    let final_wait = Duration::from_millis(config.final_wait_ms);
    let deadline = tokio::time::sleep(final_wait);
    tokio::pin!(deadline);
    let mut audio_open = true;
    let mut bytes_sent: usize = 0;

    loop {
        tokio::select! {
            chunk = audio_rx.recv(), if audio_open => match chunk {
                Some(pcm) => {
                    bytes_sent += pcm.len();
                    let msg = json!({
                        "type": config.append_type,
                        "audio": BASE64.encode(&pcm),
                    });
                    send_json(&mut ws_tx, &msg).await?;
                }
                None => {
                    audio_open = false;
                    log::info!("[capture] {} audio ended after {} bytes; committing", name, bytes_sent);
                    send_json(&mut ws_tx, &config.commit_message).await?;
                    deadline.as_mut().reset(tokio::time::Instant::now() + final_wait);
                }
            },
            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(tungstenite::Message::Text(t))) => t,
                    Some(Ok(tungstenite::Message::Close(_))) | None => {
                        log::info!("[capture] {} socket closed", name);
                        return Ok(());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(format!("{} websocket error: {}", name, e)),
                };

                let mut transcript = None;
                for event in provider.parse_event(&text) {
                    match event {
                        ProviderEvent::TranscriptFinal(t) => {
                            if transcript.is_none() {
                                transcript = Some(t);
                            }
                        }
                        ProviderEvent::TranscriptDelta(delta) => {
                            log::debug!("[capture] {} delta: {}", name, delta);
                        }
                        ProviderEvent::SendControl(msg) => {
                            let _ = send_json(&mut ws_tx, &msg).await;
                        }
                        ProviderEvent::Error(e) => {
                            let _ = ws_tx.close().await;
                            return Err(format!("{} error: {}", name, e));
                        }
                        ProviderEvent::Status(s) => log::debug!("[capture] {} {}", name, s),
                        ProviderEvent::Ignore => {}
                    }
                }
                if let Some(t) = transcript {
                    log::info!("[capture] {} final: \"{}\"", name, t);
                    reporter.transcript(t);
                    let _ = ws_tx.close().await;
                    return Ok(());
                }
            }
            _ = &mut deadline, if !audio_open => {
                log::info!(
                    "[capture] {} no transcript within {}ms of commit",
                    name,
                    final_wait.as_millis()
                );
                break;
            }
        }
    }

    let _ = ws_tx.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::openai::OpenAiProvider;
    use crate::recording::CaptureEventKind;
    use crate::state::AppEvent;
    use tokio::net::TcpListener;

    fn local_config(addr: std::net::SocketAddr, final_wait_ms: u64) -> ConnectionConfig {
        ConnectionConfig {
            url: format!("ws://{}", addr),
            headers: vec![("Authorization".into(), "Bearer test".into())],
            init_message: Some(json!({ "type": "session.update" })),
            append_type: "input_audio_buffer.append".into(),
            commit_message: json!({ "type": "input_audio_buffer.commit" }),
            final_wait_ms,
            sample_rate: 24000,
        }
    }

    /// Accepts one client, answers a commit with `reply` (if any) and
    /// returns every text frame the client sent.
    async fn fake_provider(reply: Option<Value>) -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<Value>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut received = Vec::new();
            while let Some(Ok(msg)) = ws.next().await {
                let tungstenite::Message::Text(text) = msg else {
                    continue;
                };
                let value: Value = serde_json::from_str(&text).unwrap();
                let is_commit = value["type"] == "input_audio_buffer.commit";
                received.push(value);
                if is_commit {
                    if let Some(reply) = &reply {
                        let frame = tungstenite::Message::Text(reply.to_string().into());
                        if ws.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
            }
            received
        });
        (addr, server)
    }

    #[tokio::test]
    async fn streams_audio_commits_and_reports_final() {
        let (addr, server) = fake_provider(Some(json!({
            "type": "conversation.item.input_audio_transcription.completed",
            "item_id": "item_1",
            "transcript": "hello there",
        })))
        .await;
        let config = local_config(addr, 2000);
        let request = build_ws_request(&config).unwrap();
        assert_eq!(request.headers()["authorization"], "Bearer test");

        let (audio_tx, audio_rx) = mpsc::channel(8);
        audio_tx.send(vec![1, 2, 3, 4]).await.unwrap();
        drop(audio_tx);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let reporter = CaptureReporter::new(5, events_tx);

        run_transcription(&OpenAiProvider, &config, request, audio_rx, &reporter)
            .await
            .unwrap();

        match events_rx.try_recv() {
            Ok(AppEvent::Capture(event)) => {
                assert_eq!(event.session, 5);
                assert_eq!(event.kind, CaptureEventKind::Transcript("hello there".into()));
            }
            other => panic!("unexpected {:?}", other),
        }

        let received = server.await.unwrap();
        let kinds: Vec<&str> = received.iter().filter_map(|v| v["type"].as_str()).collect();
        assert_eq!(
            kinds,
            vec![
                "session.update",
                "input_audio_buffer.append",
                "input_audio_buffer.commit",
                "conversation.item.delete",
            ]
        );
        assert_eq!(received[1]["audio"], "AQIDBA==");
    }

    #[tokio::test]
    async fn gives_up_waiting_for_final_after_commit() {
        let (addr, _server) = fake_provider(None).await;
        let config = local_config(addr, 50);
        let request = build_ws_request(&config).unwrap();

        let (audio_tx, audio_rx) = mpsc::channel(8);
        drop(audio_tx);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let reporter = CaptureReporter::new(1, events_tx);

        tokio::time::timeout(
            Duration::from_secs(5),
            run_transcription(&OpenAiProvider, &config, request, audio_rx, &reporter),
        )
        .await
        .expect("transcription did not give up")
        .unwrap();
        assert!(events_rx.try_recv().is_err());
    }

    #[test]
    fn missing_api_key_refuses_to_start() {
        let capture = RealtimeSpeechCapture::new(
            Arc::new(OpenAiProvider),
            ProviderSettings {
                api_key: String::new(),
                model: "m".into(),
                transcription_model: "t".into(),
                locale: "ja-JP".into(),
            },
            None,
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = capture
            .start(&CaptureConfig::default(), CaptureReporter::new(1, tx))
            .unwrap_err();
        assert!(err.contains("OPENAI_API_KEY"));
    }
}
