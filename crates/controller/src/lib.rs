//! Client side of the broker API: starts runs, sends control commands and
//! follows the broker's event stream.

use anyhow::{anyhow, bail, Context, Result};
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    error::{ApiError, ApiException},
    protocol::{
        BrokerEvent, ControlAck, ControlKind, ControlRequest, StartRequest, StartResponse,
        StatusReport,
    },
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

const EVENT_BUFFER: usize = 256;

pub struct BrokerClient {
    http: Client,
    broker_url: Url,
}

impl BrokerClient {
    pub fn new(broker_url: &str) -> Result<Self> {
        let mut url = Url::parse(broker_url)
            .with_context(|| format!("invalid broker url: {broker_url}"))?;
        match url.scheme() {
            "http" | "https" => {}
            other => bail!("broker url must use http or https, got {other}"),
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            broker_url: url,
        })
    }

    pub fn broker_url(&self) -> &Url {
        &self.broker_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.broker_url
            .join(path)
            .with_context(|| format!("cannot build {path} url from {}", self.broker_url))
    }

    fn events_url(&self) -> Result<Url> {
        let mut url = self.endpoint("events")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot derive websocket url from {url}"))?;
        Ok(url)
    }

    pub async fn ping(&self) -> Result<()> {
        self.http
            .get(self.endpoint("healthz")?)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Starts a run and waits for it to finish. A run that started and then
    /// failed comes back as `Ok` with `success == false`.
    pub async fn start_game(&self, req: &StartRequest) -> Result<StartResponse> {
        let response = self
            .http
            .post(self.endpoint("start")?)
            .json(req)
            .send()
            .await
            .with_context(|| format!("cannot reach broker at {}", self.broker_url))?;
        read_json(response).await
    }

    pub async fn control(&self, kind: ControlKind) -> Result<ControlAck> {
        let response = self
            .http
            .post(self.endpoint("control")?)
            .json(&ControlRequest { kind })
            .send()
            .await
            .with_context(|| format!("cannot reach broker at {}", self.broker_url))?;
        read_json(response).await
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let response = self.http.get(self.endpoint("status")?).send().await?;
        read_json(response).await
    }

    pub async fn subscribe_events(&self) -> Result<EventStream> {
        let url = self.events_url()?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (_, mut ws_reader) = ws_stream.split();

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<BrokerEvent>(&text) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(%err, "controller: undecodable broker event"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(%err, "controller: event stream closed");
                        break;
                    }
                }
            }
        });
        Ok(EventStream { rx, reader })
    }
}

/// Broker events in arrival order. Dropping the stream closes the socket.
pub struct EventStream {
    rx: mpsc::Receiver<BrokerEvent>,
    reader: JoinHandle<()>,
}

impl EventStream {
    pub async fn next(&mut self) -> Option<BrokerEvent> {
        self.rx.recv().await
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Decodes a success body, or turns an `ApiError` body into an
/// [`ApiException`] the caller can downcast.
async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(error) => Err(ApiException::from(error).into()),
        Err(_) => Err(anyhow!("broker answered {status}: {body}")),
    }
}
