use std::time::{Duration, SystemTime};

use futures_util::StreamExt;
use ops_protocol::HubMessage;
use ops_tracker::EventBus;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::http::API_TOKEN_HEADER;

const RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StreamStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Websocket feed from the Pulse hub into the progress bus.
pub(crate) struct PushStream {
    url: String,
    api_token: Option<String>,
    bus: EventBus,
}

impl PushStream {
    pub(crate) fn new(url: String, api_token: Option<String>, bus: EventBus) -> Self {
        Self {
            url,
            api_token,
            bus,
        }
    }

    fn client_request(&self) -> anyhow::Result<Request> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(token) = self.api_token.as_deref() {
            request
                .headers_mut()
                .insert(API_TOKEN_HEADER, HeaderValue::from_str(token)?);
        }
        Ok(request)
    }

    /// Spawns the reconnect loop. The returned channel reports connection state.
    pub(crate) fn spawn(
        self,
        token: CancellationToken,
    ) -> anyhow::Result<watch::Receiver<StreamStatus>> {
        self.client_request()?;
        let (status_tx, status_rx) = watch::channel(StreamStatus::Connecting);
        tokio::spawn(async move {
            self.run(status_tx, token).await;
        });
        Ok(status_rx)
    }

    async fn run(self, status: watch::Sender<StreamStatus>, token: CancellationToken) {
        loop {
            status.send_replace(StreamStatus::Connecting);
            let request = match self.client_request() {
                Ok(request) => request,
                Err(err) => {
                    warn!(error = %err, "invalid push stream request");
                    break;
                }
            };
            let connected = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                connected = tokio_tungstenite::connect_async(request) => connected,
            };
            match connected {
                Ok((mut stream, _)) => {
                    info!(url = %self.url, "push stream connected");
                    status.send_replace(StreamStatus::Connected);
                    loop {
                        let message = tokio::select! {
                            biased;
                            _ = token.cancelled() => {
                                let _ = stream.close(None).await;
                                status.send_replace(StreamStatus::Disconnected);
                                return;
                            }
                            message = stream.next() => message,
                        };
                        match message {
                            Some(Ok(Message::Text(text))) => {
                                dispatch(&text, &self.bus);
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                warn!(error = %err, "push stream error");
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(url = %self.url, error = %err, "push stream connect failed");
                }
            }
            status.send_replace(StreamStatus::Disconnected);
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
        status.send_replace(StreamStatus::Disconnected);
        debug!("push stream stopped");
    }
}

/// Decodes one hub message and publishes its progress events. Returns how
/// many events were published.
pub(crate) fn dispatch(text: &str, bus: &EventBus) -> usize {
    let message = match HubMessage::decode(text) {
        Ok(message) => message,
        Err(err) => {
            debug!(error = %err, "ignoring undecodable hub message");
            return 0;
        }
    };
    if !message.is_progress_channel() {
        return 0;
    }
    match message.progress_events(SystemTime::now()) {
        Ok(events) => {
            let count = events.len();
            for event in events {
                bus.publish(event);
            }
            count
        }
        Err(err) => {
            warn!(channel = %message.kind, error = %err, "dropping invalid progress payload");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ops_protocol::{ProgressKind, ScopeKey};

    #[tokio::test]
    async fn dispatch_publishes_valid_progress() {
        let bus = EventBus::new(8);
        let mut events = bus.subscribe();
        let text = r#"{"type":"ai_discovery_progress","data":{"resource_id":"vm:pve1:101","status":"completed","error":"scan aborted"}}"#;
        assert_eq!(dispatch(text, &bus), 1);
        let event = events.recv().await.expect("event");
        assert_eq!(event.scope, "vm:pve1:101".parse::<ScopeKey>().expect("scope"));
        assert_eq!(
            event.kind,
            ProgressKind::Failed {
                reason: Some("scan aborted".to_string())
            }
        );
    }

    #[tokio::test]
    async fn dispatch_drops_invalid_and_foreign_messages() {
        let bus = EventBus::new(8);
        let _events = bus.subscribe();
        assert_eq!(dispatch("not json", &bus), 0);
        assert_eq!(dispatch(r#"{"type":"alert_fired","data":{}}"#, &bus), 0);
        let bad_percent = r#"{"type":"operation_progress","data":{"resource_id":"vm:pve1:101","status":"in_progress","percent_complete":250}}"#;
        assert_eq!(dispatch(bad_percent, &bus), 0);
    }

    #[test]
    fn request_carries_api_token() {
        let stream = PushStream::new(
            "ws://127.0.0.1:7655/ws".to_string(),
            Some("secret".to_string()),
            EventBus::new(1),
        );
        let request = stream.client_request().expect("request");
        assert_eq!(
            request.headers().get(API_TOKEN_HEADER).and_then(|value| value.to_str().ok()),
            Some("secret")
        );
    }
}
