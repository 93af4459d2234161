//! Per-channel sessions: greeting, heartbeat and echo.
//!
//! Echo replies go out in arrival order from the session task. Inbound
//! delivery is queued by the engine, so a slow send never blocks it, and
//! every send gives way to cancellation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rtc_engine::{ChannelEvent, ChannelState, DataChannel};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics;

pub const DEFAULT_GREETING: &str = "Connected to sdp-bridge server!";

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub greeting: String,
    pub heartbeat_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            greeting: DEFAULT_GREETING.to_string(),
            heartbeat_interval: Duration::from_secs(1),
        }
    }
}

pub fn echo_response(text: &str) -> String {
    format!("Server received: '{text}'")
}

/// `Server Time: Mon, 02 Jan 2006 15:04:05 GMT`
pub fn status_message(now: DateTime<Utc>) -> String {
    format!("Server Time: {}", now.format("%a, %d %b %Y %H:%M:%S GMT"))
}

/// Owns one data channel from open to close: greets once, runs the
/// heartbeat and echoes every inbound message.
pub struct ChannelSession {
    label: String,
    id: u16,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ChannelSession {
    pub fn spawn(
        channel: Arc<dyn DataChannel>,
        config: ChannelConfig,
        token: CancellationToken,
    ) -> Self {
        let label = channel.label().to_string();
        let id = channel.id();
        let task = tokio::spawn(run_session(channel, config, token.clone()));
        Self {
            label,
            id,
            token,
            task,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub async fn join(self) {
        if let Err(err) = self.task.await {
            warn!(label = %self.label, id = self.id, error = %err, "channel session task failed");
        }
    }
}

async fn run_session(
    channel: Arc<dyn DataChannel>,
    config: ChannelConfig,
    token: CancellationToken,
) {
    let label = channel.label().to_string();
    let id = channel.id();
    let Some(mut events) = channel.events() else {
        warn!(label = %label, id, "data channel events already claimed");
        return;
    };

    let mut heartbeat: Option<Heartbeat> = None;
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Some(ChannelEvent::Open) => {
                if heartbeat.is_some() {
                    debug!(label = %label, id, "duplicate open ignored");
                    continue;
                }
                info!(label = %label, id, "data channel open");
                metrics::CHANNELS_OPENED.inc();
                send_best_effort(
                    channel.as_ref(),
                    config.greeting.clone(),
                    "greeting",
                    &token,
                )
                .await;
                heartbeat = Some(Heartbeat::spawn(
                    channel.clone(),
                    config.heartbeat_interval,
                    token.child_token(),
                ));
            }
            Some(ChannelEvent::Message(message)) => {
                let text = message.as_text();
                info!(label = %label, id, message = %text, "message from client");
                send_best_effort(channel.as_ref(), echo_response(&text), "echo", &token).await;
            }
            Some(ChannelEvent::Closed) | None => break,
        }
    }

    if let Some(heartbeat) = heartbeat {
        heartbeat.stop();
        heartbeat.join().await;
    }
    info!(label = %label, id, "data channel session finished");
}

/// Sends unless the channel already reports not-open. Failures are logged
/// and counted, never propagated. A send still pending when `token` is
/// cancelled is abandoned.
async fn send_best_effort(
    channel: &dyn DataChannel,
    text: String,
    kind: &'static str,
    token: &CancellationToken,
) -> bool {
    let state = channel.ready_state();
    if state != ChannelState::Open {
        debug!(
            label = %channel.label(),
            id = channel.id(),
            ?state,
            kind,
            "skipping send on non-open channel"
        );
        return false;
    }
    let sent = tokio::select! {
        _ = token.cancelled() => {
            debug!(
                label = %channel.label(),
                id = channel.id(),
                kind,
                "send abandoned on cancellation"
            );
            return false;
        }
        sent = channel.send_text(text) => sent,
    };
    match sent {
        Ok(_) => {
            metrics::CHANNEL_MESSAGES_SENT.with_label_values(&[kind]).inc();
            true
        }
        Err(err) => {
            warn!(
                label = %channel.label(),
                id = channel.id(),
                kind,
                error = %err,
                "data channel send failed"
            );
            metrics::CHANNEL_SEND_FAILURES.with_label_values(&[kind]).inc();
            false
        }
    }
}

/// Periodic status sender. Checks the channel state before every send and
/// exits on the first tick that finds it not open, or on cancellation.
pub struct Heartbeat {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Heartbeat {
    pub fn spawn(channel: Arc<dyn DataChannel>, period: Duration, token: CancellationToken) -> Self {
        let task = tokio::spawn(run_heartbeat(channel, period, token.clone()));
        Self { token, task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub async fn join(self) {
        if let Err(err) = self.task.await {
            warn!(error = %err, "heartbeat task failed");
        }
    }
}

async fn run_heartbeat(channel: Arc<dyn DataChannel>, period: Duration, token: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if channel.ready_state() != ChannelState::Open {
            debug!(label = %channel.label(), id = channel.id(), "channel not open; heartbeat stopping");
            break;
        }
        send_best_effort(
            channel.as_ref(),
            status_message(Utc::now()),
            "heartbeat",
            &token,
        )
        .await;
    }
}
