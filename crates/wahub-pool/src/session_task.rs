//! The per-session owner task.
//!
//! One task per live session consumes protocol events strictly in order,
//! mutates the session's record, and drives reconnects. Everything
//! time-based in the lifecycle lives here as a deadline the select loop
//! races against: the attach deadline, the QR pairing window, the
//! stable-open proxy release, the import grace, and the import stall
//! warning.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use wahub_core::{ConnectionPhase, ConnectionStatus};
use wahub_events::{EventMetadata, HubEvent};
use wahub_protocol::{BatchKind, DisconnectCode, EventStream, MessageBatch, ProtocolEvent};
use wahub_state::StateDelta;

use crate::pool::ConnectionPool;
use crate::record::{DetachIntent, SessionCommand, SessionHandle};

/// Why the socket stopped being driven.
enum CloseCause {
    /// The protocol reported a close.
    Code(DisconnectCode, String),
    /// The driver dropped the event stream without a close event.
    StreamEnded,
    /// No pairing within the QR window.
    QrTimeout,
    /// Neither QR nor open within the attach deadline.
    AttachTimeout,
    /// A reconnect was requested from outside the task.
    Requested {
        /// Rotate the egress IP first.
        rotate: bool,
    },
}

/// What the close router decided.
enum CloseAction {
    /// Reconnect after `delay`.
    Reconnect {
        delay: std::time::Duration,
        rotate: bool,
    },
    /// The session is finished; the task exits.
    Stop,
}

struct Deadlines {
    connect: Option<Instant>,
    qr: Option<Instant>,
    stable: Option<Instant>,
    grace: Option<Instant>,
    sync: Option<Instant>,
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn after(duration: std::time::Duration) -> Instant {
    Instant::now().checked_add(duration).unwrap_or_else(Instant::now)
}

/// Run one session to completion.
pub(crate) async fn run(
    pool: Arc<ConnectionPool>,
    handle: Arc<SessionHandle>,
    mut events: EventStream,
    mut commands: mpsc::Receiver<SessionCommand>,
) {
    let key = handle.record.read().await.key.clone();
    loop {
        let cause = match drive_socket(&pool, &handle, &mut events, &mut commands).await {
            Ok(cause) => cause,
            Err(intent) => {
                pool.finalize(&handle, intent).await;
                return;
            }
        };

        let CloseAction::Reconnect {
            mut delay,
            mut rotate,
        } = route_close(&pool, &handle, cause).await
        else {
            return;
        };

        // Keep trying replacement sockets until one sticks or the attempt
        // cap routes the session to failed; a fresh stream re-enters the
        // event loop above.
        loop {
            if !delay.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = handle.cancel.cancelled() => {
                        pool.finalize(&handle, pool.take_intent(&handle).await).await;
                        return;
                    }
                }
            }
            if rotate {
                pool.rotate_proxy(&handle).await;
            }
            match pool.reconnect_socket(&handle).await {
                Ok(new_events) => {
                    events = new_events;
                    break;
                }
                Err(e) => {
                    warn!(session = %key, error = %e, "Reconnect failed");
                    // Feed the failure back through the close router so
                    // the backoff and attempt cap apply uniformly.
                    match route_close(
                        &pool,
                        &handle,
                        CloseCause::Code(DisconnectCode::Other(0), e.to_string()),
                    )
                    .await
                    {
                        CloseAction::Stop => return,
                        CloseAction::Reconnect {
                            delay: next_delay,
                            rotate: next_rotate,
                        } => {
                            delay = next_delay;
                            rotate = next_rotate;
                        }
                    }
                }
            }
        }
    }
}

/// Consume events until the socket closes, a command arrives, the task is
/// cancelled (`Err(intent)`), or a deadline fires.
async fn drive_socket(
    pool: &Arc<ConnectionPool>,
    handle: &Arc<SessionHandle>,
    events: &mut EventStream,
    commands: &mut mpsc::Receiver<SessionCommand>,
) -> Result<CloseCause, DetachIntent> {
    let timings = pool.config.timings.clone();
    let mut deadlines = Deadlines {
        connect: Some(after(timings.attach_deadline)),
        qr: None,
        stable: None,
        grace: None,
        sync: None,
    };
    // A session resuming an already-open socket (post-restart) keeps its
    // proxy-release schedule.
    {
        let record = handle.record.read().await;
        if record.is_open() {
            deadlines.connect = None;
        }
    }

    loop {
        tokio::select! {
            () = handle.cancel.cancelled() => {
                return Err(pool.take_intent(handle).await);
            }
            command = commands.recv() => {
                if let Some(SessionCommand::Reconnect { rotate }) = command {
                    return Ok(CloseCause::Requested { rotate });
                }
            }
            event = events.recv() => {
                match event {
                    None => return Ok(CloseCause::StreamEnded),
                    Some(ProtocolEvent::Closed { code, message }) => {
                        return Ok(CloseCause::Code(code, message));
                    }
                    Some(event) => {
                        handle_event(pool, handle, event, &mut deadlines).await;
                    }
                }
            }
            () = until(deadlines.connect) => return Ok(CloseCause::AttachTimeout),
            () = until(deadlines.qr) => return Ok(CloseCause::QrTimeout),
            () = until(deadlines.stable) => {
                deadlines.stable = None;
                pool.release_proxy_after_stable_open(handle).await;
            }
            () = until(deadlines.grace) => {
                deadlines.grace = None;
                deadlines.sync = None;
                finish_import(pool, handle).await;
            }
            () = until(deadlines.sync) => {
                deadlines.sync = None;
                let record = handle.record.read().await;
                warn!(session = %record.key,
                    "No history batches within the sync window; staying in importing_messages");
            }
        }
    }
}

async fn handle_event(
    pool: &Arc<ConnectionPool>,
    handle: &Arc<SessionHandle>,
    event: ProtocolEvent,
    deadlines: &mut Deadlines,
) {
    match event {
        ProtocolEvent::CredentialsChanged(blob) => {
            let key = handle.record.read().await.key.clone();
            if let Err(e) = pool.blobs.save(&key, &blob).await {
                warn!(session = %key, error = %e, "Failed to persist credential blob");
            }
        }
        ProtocolEvent::QrCode(qr) => on_qr(pool, handle, qr, deadlines).await,
        ProtocolEvent::Opened => on_opened(pool, handle, deadlines).await,
        ProtocolEvent::Messages(batch) => on_messages(pool, handle, batch, deadlines).await,
        ProtocolEvent::ContactsUpsert(count) => {
            let (key, contacts, messages) = {
                let mut record = handle.record.write().await;
                record.sync_contacts = record.sync_contacts.saturating_add(count);
                (record.key.clone(), record.sync_contacts, record.sync_messages)
            };
            if let Err(e) = pool
                .state
                .update_sync_progress(&key, contacts, messages, false)
                .await
            {
                warn!(session = %key, error = %e, "Failed to persist sync progress");
            }
            pool.bus.publish(HubEvent::SyncProgress {
                metadata: EventMetadata::new("pool"),
                key,
                contacts,
                messages,
            });
        }
        ProtocolEvent::MessageStatus(update) => {
            let key = handle.record.read().await.key.clone();
            pool.bus.publish(HubEvent::MessageStatusUpdate {
                metadata: EventMetadata::new("pool"),
                key,
                update,
            });
        }
        ProtocolEvent::Presence(presence) => {
            let key = handle.record.read().await.key.clone();
            if let Some(typing) = presence.get("typing").and_then(serde_json::Value::as_bool) {
                let chat = presence
                    .get("chat")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                pool.bus.publish(HubEvent::TypingIndicator {
                    metadata: EventMetadata::new("pool"),
                    key,
                    chat,
                    typing,
                });
            } else {
                pool.bus.publish(HubEvent::PresenceUpdate {
                    metadata: EventMetadata::new("pool"),
                    key,
                    presence,
                });
            }
        }
        ProtocolEvent::ChatUpdate(update) => {
            let key = handle.record.read().await.key.clone();
            pool.bus.publish(HubEvent::ChatUpdated {
                metadata: EventMetadata::new("pool"),
                key,
                update,
            });
        }
        ProtocolEvent::ContactUpdate(update) => {
            let key = handle.record.read().await.key.clone();
            pool.bus.publish(HubEvent::ContactUpdated {
                metadata: EventMetadata::new("pool"),
                key,
                update,
            });
        }
        ProtocolEvent::Closed { .. } => {
            // Routed by the caller.
        }
    }
}

async fn on_qr(
    pool: &Arc<ConnectionPool>,
    handle: &Arc<SessionHandle>,
    qr: String,
    deadlines: &mut Deadlines,
) {
    let key = {
        let mut record = handle.record.write().await;
        record.phase = ConnectionPhase::QrPending;
        record.qr = Some(qr.clone());
        record.key.clone()
    };
    deadlines.connect = None;
    deadlines.qr = Some(after(pool.config.timings.qr_timeout));

    let delta = StateDelta {
        status: Some(ConnectionStatus::QrPending),
        qr: Some(qr.clone()),
        ..StateDelta::default()
    };
    if let Err(e) = pool.state.update(&key, delta).await {
        warn!(session = %key, error = %e, "Failed to project qr_pending");
    }
    pool.bus.publish(HubEvent::QrGenerated {
        metadata: EventMetadata::new("pool"),
        key: key.clone(),
        qr,
    });
    info!(session = %key, "QR generated, pairing window open");
}

async fn on_opened(
    pool: &Arc<ConnectionPool>,
    handle: &Arc<SessionHandle>,
    deadlines: &mut Deadlines,
) {
    let (key, first_time, needs_stable_timer, contacts, messages) = {
        let mut record = handle.record.write().await;
        record.connected_once = true;
        record.opened_at = Some(Utc::now());
        record.reconnect_attempts = 0;
        record.qr = None;
        let first_time = !record.sync_completed;
        record.phase = if first_time {
            ConnectionPhase::ImportingMessages
        } else {
            ConnectionPhase::Connected
        };
        let needs_stable_timer = pool.config.use_proxy && !record.proxy_released;
        (
            record.key.clone(),
            first_time,
            needs_stable_timer,
            record.sync_contacts,
            record.sync_messages,
        )
    };
    deadlines.connect = None;
    deadlines.qr = None;
    if needs_stable_timer {
        deadlines.stable = Some(after(pool.config.timings.stable_open));
    }

    if first_time {
        deadlines.sync = Some(after(pool.config.timings.sync_timeout));
        if let Err(e) = pool
            .state
            .update(&key, StateDelta::status(ConnectionStatus::ImportingMessages))
            .await
        {
            warn!(session = %key, error = %e, "Failed to project importing_messages");
        }
        if let Err(e) = pool
            .state
            .update_sync_progress(&key, contacts, messages, false)
            .await
        {
            warn!(session = %key, error = %e, "Failed to persist sync start");
        }
        pool.bus.publish(HubEvent::SyncStarted {
            metadata: EventMetadata::new("pool"),
            key: key.clone(),
        });
        info!(session = %key, "Socket open, starting initial history import");
    } else {
        if let Err(e) = pool.state.mark_connected(&key).await {
            warn!(session = %key, error = %e, "Failed to project connected");
        }
        info!(session = %key, "Socket open, session connected");
    }
}

async fn on_messages(
    pool: &Arc<ConnectionPool>,
    handle: &Arc<SessionHandle>,
    batch: MessageBatch,
    deadlines: &mut Deadlines,
) {
    // Any message older than the cutoff is history regardless of how the
    // batch was delivered, so resync replays don't masquerade as realtime.
    let cutoff = Utc::now()
        .checked_sub_signed(chrono::Duration::hours(1))
        .unwrap_or_else(Utc::now);
    let is_latest = batch.is_latest == Some(true);

    let mut history = 0_u64;
    let mut realtime = Vec::new();
    for message in batch.messages {
        if batch.kind == BatchKind::Append || message.timestamp < cutoff {
            history = history.saturating_add(1);
        } else {
            realtime.push(message);
        }
    }

    let (key, contacts, messages) = {
        let mut record = handle.record.write().await;
        record.sync_messages = record.sync_messages.saturating_add(history);
        record.message_count = record.message_count.saturating_add(realtime.len() as u64);
        (record.key.clone(), record.sync_contacts, record.sync_messages)
    };

    if history > 0 {
        if let Err(e) = pool
            .state
            .update_sync_progress(&key, contacts, messages, false)
            .await
        {
            warn!(session = %key, error = %e, "Failed to persist sync progress");
        }
        pool.bus.publish(HubEvent::SyncProgress {
            metadata: EventMetadata::new("pool"),
            key: key.clone(),
            contacts,
            messages,
        });
    }

    for message in realtime {
        if message.from_me {
            // Outbound we initiated was already published at send time;
            // everything else is a manual send from the phone.
            if pool.take_sent_by_api(&message.id) {
                continue;
            }
            pool.bus.publish(HubEvent::MessageSent {
                metadata: EventMetadata::new("pool"),
                key: key.clone(),
                to: message.chat.clone(),
                message_id: message.id.clone(),
            });
        } else {
            let payload = serde_json::json!({
                "id": message.id,
                "chat": message.chat,
                "sender": message.sender,
                "timestamp": message.timestamp.to_rfc3339(),
                "content": message.content,
            });
            pool.bus.publish(HubEvent::MessageReceived {
                metadata: EventMetadata::new("pool"),
                key: key.clone(),
                message: payload,
            });
        }
    }

    if is_latest {
        debug!(session = %key, "Final history batch observed, starting grace");
        deadlines.grace = Some(after(pool.config.timings.sync_grace));
    }
}

/// Close the import: flip the sync gate, project `connected`, publish the
/// terminal sync events.
async fn finish_import(pool: &Arc<ConnectionPool>, handle: &Arc<SessionHandle>) {
    let (key, contacts, messages, already_done) = {
        let mut record = handle.record.write().await;
        let already_done = record.sync_completed;
        record.sync_completed = true;
        record.phase = ConnectionPhase::Connected;
        (
            record.key.clone(),
            record.sync_contacts,
            record.sync_messages,
            already_done,
        )
    };
    if already_done {
        return;
    }

    if let Err(e) = pool
        .state
        .update_sync_progress(&key, contacts, messages, true)
        .await
    {
        warn!(session = %key, error = %e, "Failed to persist sync completion");
    }
    let delta = StateDelta {
        status: Some(ConnectionStatus::Connected),
        sync_completed: Some(true),
        ..StateDelta::default()
    };
    if let Err(e) = pool.state.update(&key, delta).await {
        warn!(session = %key, error = %e, "Failed to project connected after import");
    }

    let metadata = || EventMetadata::new("pool");
    pool.bus.publish(HubEvent::ContactsSynced {
        metadata: metadata(),
        key: key.clone(),
        count: contacts,
    });
    pool.bus.publish(HubEvent::MessagesSynced {
        metadata: metadata(),
        key: key.clone(),
        count: messages,
    });
    pool.bus.publish(HubEvent::HistorySynced {
        metadata: metadata(),
        key: key.clone(),
        contacts,
        messages,
    });
    info!(session = %key, contacts, messages, "Initial history import complete");
}

/// Route a close cause to reconnect, teardown, or failure.
async fn route_close(
    pool: &Arc<ConnectionPool>,
    handle: &Arc<SessionHandle>,
    cause: CloseCause,
) -> CloseAction {
    let key = handle.record.read().await.key.clone();
    match cause {
        CloseCause::QrTimeout => {
            info!(session = %key, "QR pairing window expired, tearing down");
            pool.finalize(
                handle,
                DetachIntent::Preserve {
                    reason: "qr pairing timed out".to_string(),
                },
            )
            .await;
            CloseAction::Stop
        }
        CloseCause::AttachTimeout => {
            warn!(session = %key, "Attach deadline expired before open");
            pool.finalize(
                handle,
                DetachIntent::Preserve {
                    reason: "timed out waiting for connection".to_string(),
                },
            )
            .await;
            CloseAction::Stop
        }
        CloseCause::Requested { rotate } => {
            pool.close_socket(handle).await;
            let attempts = {
                let mut record = handle.record.write().await;
                record.phase = ConnectionPhase::Connecting;
                record.reconnect_attempts = record.reconnect_attempts.saturating_add(1);
                record.reconnect_attempts
            };
            if attempts > pool.config.max_reconnect_attempts {
                pool.fail_session(handle, "reconnect attempts exhausted").await;
                return CloseAction::Stop;
            }
            CloseAction::Reconnect {
                delay: std::time::Duration::ZERO,
                rotate,
            }
        }
        CloseCause::Code(DisconnectCode::RestartRequired, _) => {
            info!(session = %key, "Protocol requested restart (post-pairing)");
            {
                let mut record = handle.record.write().await;
                record.handshake_completed = true;
                record.phase = ConnectionPhase::Restarting;
                // The mandated restart is not a failure; the attempt
                // counter starts clean.
                record.reconnect_attempts = 0;
            }
            let delta = StateDelta {
                status: Some(ConnectionStatus::Restarting),
                handshake_completed: Some(true),
                ..StateDelta::default()
            };
            if let Err(e) = pool.state.update(&key, delta).await {
                warn!(session = %key, error = %e, "Failed to project restarting");
            }
            CloseAction::Reconnect {
                delay: std::time::Duration::ZERO,
                rotate: false,
            }
        }
        CloseCause::Code(DisconnectCode::LoggedOut, _) => {
            info!(session = %key, "User logged out; destroying credentials");
            pool.finalize(handle, DetachIntent::Logout).await;
            CloseAction::Stop
        }
        CloseCause::Code(DisconnectCode::ConnectionReplaced, _) => {
            let connected_once = handle.record.read().await.connected_once;
            if connected_once {
                info!(session = %key, "Replaced by another client; not reconnecting");
                pool.finalize(
                    handle,
                    DetachIntent::Preserve {
                        reason: "connection replaced by another client".to_string(),
                    },
                )
                .await;
                CloseAction::Stop
            } else {
                // Replacement before ever opening is ambiguous; wait it
                // out and try once.
                let attempts = {
                    let mut record = handle.record.write().await;
                    record.phase = ConnectionPhase::Connecting;
                    record.reconnect_attempts = record.reconnect_attempts.saturating_add(1);
                    record.reconnect_attempts
                };
                if attempts > pool.config.max_reconnect_attempts {
                    pool.fail_session(handle, "reconnect attempts exhausted").await;
                    return CloseAction::Stop;
                }
                CloseAction::Reconnect {
                    delay: pool.config.timings.replaced_wait,
                    rotate: false,
                }
            }
        }
        CloseCause::Code(DisconnectCode::Other(code), message) => {
            route_abnormal_close(pool, handle, &key, code, &message).await
        }
        CloseCause::StreamEnded => {
            route_abnormal_close(pool, handle, &key, 0, "event stream ended").await
        }
    }
}

async fn route_abnormal_close(
    pool: &Arc<ConnectionPool>,
    handle: &Arc<SessionHandle>,
    key: &wahub_core::SessionKey,
    code: u16,
    message: &str,
) -> CloseAction {
    if !pool.config.auto_reconnect {
        pool.finalize(
            handle,
            DetachIntent::Preserve {
                reason: format!("connection closed ({code}): {message}"),
            },
        )
        .await;
        return CloseAction::Stop;
    }

    let attempts = {
        let mut record = handle.record.write().await;
        record.phase = ConnectionPhase::Connecting;
        record.reconnect_attempts = record.reconnect_attempts.saturating_add(1);
        record.reconnect_attempts
    };
    if attempts > pool.config.max_reconnect_attempts {
        pool.fail_session(handle, "reconnect attempts exhausted").await;
        return CloseAction::Stop;
    }

    let exp = 2_u32.saturating_pow(attempts.saturating_sub(1));
    let delay = pool.config.reconnect_delay.saturating_mul(exp);
    warn!(session = %key, code, message, attempt = attempts, delay_secs = delay.as_secs(),
        "Connection closed, scheduling reconnect");
    let delta = StateDelta::status(ConnectionStatus::Connecting);
    if let Err(e) = pool.state.update(key, delta).await {
        warn!(session = %key, error = %e, "Failed to project connecting");
    }
    CloseAction::Reconnect {
        delay,
        rotate: false,
    }
}
