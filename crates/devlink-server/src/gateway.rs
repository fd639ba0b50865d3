//! Session stream gateway
//!
//! One subscription per consumer. Frames go out on an `mpsc` channel so the
//! same loop serves the WebSocket endpoint and tests. The subscription:
//!
//! - sends the current `status`, and the current `qr` while pending
//! - forwards every session event as it is published
//! - re-reads the store every poll interval to catch changes made by other
//!   processes
//! - sends `ping` every heartbeat interval
//! - stops when a terminal frame has been sent or the consumer goes away,
//!   closing any live connection it opened itself

use crate::service::{apply_provider_event, LinkService, LiveAttachment};
use devlink_auth::{Session, SessionEvent, SessionId};
use devlink_core::{Config, Result, SessionStatus, StreamFrame};
use devlink_provider::{ProviderEvent, CONNECTING_PAYLOAD};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Runs stream subscriptions
#[derive(Clone)]
pub struct StreamGateway {
    service: Arc<LinkService>,
    poll_interval: Duration,
    heartbeat_interval: Duration,
}

impl StreamGateway {
    pub fn new(service: Arc<LinkService>, config: &Config) -> Self {
        Self {
            service,
            poll_interval: config.poll_interval(),
            heartbeat_interval: config.heartbeat_interval(),
        }
    }

    /// Serve one subscription until the session ends or `frames` is closed
    pub async fn run(&self, id: SessionId, frames: mpsc::Sender<StreamFrame>) -> Result<()> {
        let controller = self.service.controller().clone();
        let (session, mut events) = controller.watch(&id).await?;
        info!("Stream subscribed to session {}", id);

        for frame in initial_frames(&session) {
            let terminal = frame.is_terminal();
            if frames.send(frame).await.is_err() || terminal {
                return Ok(());
            }
        }

        let mut attachment = self.service.attach_live(&session);
        let expires_at = session.expires_at;

        let mut poll = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let frames_out: Vec<StreamFrame> = tokio::select! {
                _ = frames.closed() => {
                    info!("Stream for session {} closed by subscriber", id);
                    break;
                }
                event = events.recv() => match event {
                    Ok(event) => vec![frame_for(event, expires_at)],
                    Err(RecvError::Lagged(missed)) => {
                        debug!("Stream for session {} lagged by {} event(s)", id, missed);
                        initial_frames(&controller.status(&id).await?)
                    }
                    Err(RecvError::Closed) => {
                        // Channel is only closed after a terminal event
                        let current = controller.status(&id).await?;
                        terminal_frame(&current).into_iter().collect()
                    }
                },
                event = next_provider_event(&mut attachment) => {
                    match event {
                        Some(event) => {
                            if apply_provider_event(&controller, &id, event).await {
                                close_attachment(&mut attachment).await;
                            }
                        }
                        None => close_attachment(&mut attachment).await,
                    }
                    Vec::new()
                }
                _ = poll.tick() => {
                    let current = controller.status(&id).await?;
                    terminal_frame(&current).into_iter().collect()
                }
                _ = heartbeat.tick() => vec![StreamFrame::Ping { timestamp: unix_millis() }],
            };

            let mut finished = false;
            for frame in frames_out {
                finished = frame.is_terminal();
                if frames.send(frame).await.is_err() || finished {
                    finished = true;
                    break;
                }
            }
            if finished {
                break;
            }
        }

        close_attachment(&mut attachment).await;
        debug!("Stream for session {} finished", id);
        Ok(())
    }
}

/// Frames describing a session as it stands
fn initial_frames(session: &Session) -> Vec<StreamFrame> {
    let mut frames = vec![StreamFrame::Status {
        status: session.status,
        expires_at: session.expires_at,
    }];
    if session.status == SessionStatus::Pending && session.qr_payload != CONNECTING_PAYLOAD {
        frames.push(StreamFrame::Qr {
            payload: session.qr_payload.clone(),
        });
    }
    frames.extend(terminal_frame(session));
    frames
}

fn terminal_frame(session: &Session) -> Option<StreamFrame> {
    match session.status {
        SessionStatus::Completed => Some(StreamFrame::Linked {
            credential: session.linked_credential.clone().unwrap_or_default(),
            device_info: session.device_info.clone(),
        }),
        SessionStatus::Expired | SessionStatus::Cancelled => Some(StreamFrame::End {
            status: session.status,
        }),
        SessionStatus::Pending | SessionStatus::Scanned => None,
    }
}

fn frame_for(event: SessionEvent, expires_at: chrono::DateTime<chrono::Utc>) -> StreamFrame {
    match event {
        SessionEvent::Status(status) => StreamFrame::Status { status, expires_at },
        SessionEvent::QrRotated(payload) => StreamFrame::Qr { payload },
        SessionEvent::Linked {
            credential,
            device_info,
        } => StreamFrame::Linked {
            credential,
            device_info,
        },
        SessionEvent::Ended(status) => StreamFrame::End { status },
        SessionEvent::ProviderClosed(reason) => StreamFrame::ProviderClosed { reason },
    }
}

async fn next_provider_event(attachment: &mut Option<LiveAttachment>) -> Option<ProviderEvent> {
    match attachment {
        Some(attachment) => attachment.next_event().await,
        None => std::future::pending().await,
    }
}

async fn close_attachment(attachment: &mut Option<LiveAttachment>) {
    if let Some(attachment) = attachment.take() {
        attachment.close().await;
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
