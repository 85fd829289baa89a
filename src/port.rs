// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Front-end ports.
//!
//! [`EventPump`] is the single task that drains every event feed into an
//! [`EventSink`]. [`LinePort`] speaks newline-delimited JSON over any async
//! reader/writer pair:
//!
//! ```text
//! -> {"id":1,"method":"connectToDevice","args":{"device_id":"AA:BB:CC:DD:EE:FF"}}
//! <- {"id":1,"ok":null}
//! <- {"event":"connection-updates","data":{"device_id":"AA:BB:CC:DD:EE:FF","state":"connecting"}}
//! ```

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::codec::{Codec, JsonCodec};
use crate::command::{Command, CommandPort, Dispatcher, Event, EventChannel};
use crate::session::SessionManager;

/// Receives encoded events. An error means the observer is gone.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn publish(&self, channel: EventChannel, payload: Vec<u8>) -> Result<()>;
}

/// Forwards all session feeds to one sink, one event at a time.
pub struct EventPump {
    handle: JoinHandle<()>,
}

impl EventPump {
    /// Attach to the session's feeds and start forwarding.
    pub fn start<C: Codec>(session: Arc<SessionManager>, codec: C, sink: Arc<dyn EventSink>) -> Self {
        let feeds = session.feeds();
        let events = stream::select_all([
            feeds.connections.subscribe().map(Event::Connection).boxed(),
            feeds.characteristics.subscribe().map(Event::Characteristic).boxed(),
            feeds.status.subscribe().map(Event::Status).boxed(),
            feeds.scan.subscribe().map(Event::Scan).boxed(),
        ]);
        let handle = tokio::spawn(pump(events, session, codec, sink));
        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

async fn pump<C: Codec>(
    mut events: stream::SelectAll<BoxStream<'static, Event>>,
    session: Arc<SessionManager>,
    codec: C,
    sink: Arc<dyn EventSink>,
) {
    let mut detached: HashSet<EventChannel> = HashSet::new();

    while let Some(event) = events.next().await {
        let channel = event.channel();
        if detached.contains(&channel) {
            continue;
        }

        let payload = match codec.encode_event(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode {} event: {:#}", channel.name(), e);
                continue;
            }
        };

        if let Err(e) = sink.publish(channel, payload).await {
            warn!("Observer of {} went away: {:#}", channel.name(), e);
            detached.insert(channel);
            match channel {
                EventChannel::ConnectionUpdates => session.connection_observer_lost().await,
                EventChannel::CharacteristicNotifications => {
                    session.characteristic_observer_lost().await
                }
                EventChannel::RadioStatus | EventChannel::ScanResults => {}
            }
        }
    }
    debug!("Event pump finished");
}

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Outgoing {
    Reply { id: Value, ok: Value },
    Error { id: Value, error: ErrorBody },
    Event { event: &'static str, data: Value },
}

/// Serializes whole lines onto a shared writer.
struct LineWriter<W> {
    inner: Arc<AsyncMutex<W>>,
}

impl<W> Clone for LineWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> LineWriter<W> {
    fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(AsyncMutex::new(writer)),
        }
    }

    async fn send(&self, message: &Outgoing) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let mut writer = self.inner.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> EventSink for LineWriter<W> {
    async fn publish(&self, channel: EventChannel, payload: Vec<u8>) -> Result<()> {
        let data = serde_json::from_slice(&payload)?;
        self.send(&Outgoing::Event {
            event: channel.name(),
            data,
        })
        .await
    }
}

/// Newline-delimited JSON command port.
///
/// Commands that only change session state are applied in arrival order.
/// Single-shot radio operations run concurrently and reply when done.
pub struct LinePort {
    dispatcher: Arc<Dispatcher<JsonCodec>>,
}

impl LinePort {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(session, JsonCodec)),
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        self.dispatcher.session()
    }

    /// Serve requests from `reader` until it is exhausted.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer = LineWriter::new(writer);
        let pump = EventPump::start(
            self.dispatcher.session().clone(),
            JsonCodec,
            Arc::new(writer.clone()),
        );
        let mut in_flight = JoinSet::new();
        let mut lines = reader.lines();

        info!("Line port ready");
        let outcome = loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e.into()),
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            debug!("Received: {}", line);

            let request: Request = match serde_json::from_str(line) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Malformed request: {}", e);
                    let reply = Outgoing::Error {
                        id: Value::Null,
                        error: ErrorBody {
                            code: "invalid_arguments",
                            message: format!("Malformed request: {}", e),
                        },
                    };
                    if let Err(e) = writer.send(&reply).await {
                        break Err(e);
                    }
                    continue;
                }
            };

            if Command::is_single_shot(&request.method) {
                let dispatcher = self.dispatcher.clone();
                let writer = writer.clone();
                in_flight.spawn(async move { respond(&dispatcher, &writer, request).await });
            } else if let Err(e) = respond(&self.dispatcher, &writer, request).await {
                break Err(e);
            }
        };

        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok(Err(e)) => warn!("Failed to send reply: {:#}", e),
                Err(e) => warn!("Request task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        pump.stop();
        info!("Line port closed");
        outcome
    }
}

async fn respond<W>(dispatcher: &Dispatcher<JsonCodec>, writer: &LineWriter<W>, request: Request) -> Result<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let args = serde_json::to_vec(&request.args)?;
    let reply = match dispatcher.execute(&request.method, &args).await {
        Ok(bytes) => Outgoing::Reply {
            id: request.id,
            ok: serde_json::from_slice(&bytes)?,
        },
        Err(e) => {
            debug!("{} failed: {}", request.method, e);
            Outgoing::Error {
                id: request.id,
                error: ErrorBody {
                    code: e.code(),
                    message: e.to_string(),
                },
            }
        }
    };
    writer.send(&reply).await
}
