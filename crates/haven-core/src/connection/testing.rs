//! Scripted in-memory connector for driving the connection layer in tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

use super::manager::ConnectionEvent;
use super::transport::{Connector, InboundFrame, OutboundFrame, Socket};
use crate::errors::HavenError;

enum Outcome {
    Ready(Result<Socket, HavenError>),
    /// The connect never completes.
    Hang,
}

#[derive(Default)]
struct Script {
    outcomes: VecDeque<Outcome>,
    attempts: Vec<(Instant, Url)>,
}

#[derive(Clone, Default)]
pub(crate) struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
}

impl ScriptedConnector {
    /// Queue a successful connect and return the far end of that socket.
    pub(crate) fn push_ok(&self) -> RemoteEnd {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.script
            .lock()
            .unwrap()
            .outcomes
            .push_back(Outcome::Ready(Ok(Socket::new(out_tx, in_rx))));
        RemoteEnd {
            outbound: Some(out_rx),
            inbound: in_tx,
            backlog: Vec::new(),
        }
    }

    pub(crate) fn push_err(&self, err: HavenError) {
        self.script.lock().unwrap().outcomes.push_back(Outcome::Ready(Err(err)));
    }

    /// Queue a connect that never finishes.
    pub(crate) fn push_hang(&self) {
        self.script.lock().unwrap().outcomes.push_back(Outcome::Hang);
    }

    pub(crate) fn attempts(&self) -> Vec<Instant> {
        self.script.lock().unwrap().attempts.iter().map(|(at, _)| *at).collect()
    }

    pub(crate) fn urls(&self) -> Vec<Url> {
        self.script.lock().unwrap().attempts.iter().map(|(_, url)| url.clone()).collect()
    }
}

impl Connector for ScriptedConnector {
    async fn connect(&self, url: &Url) -> Result<Socket, HavenError> {
        let outcome = {
            let mut script = self.script.lock().unwrap();
            script.attempts.push((Instant::now(), url.clone()));
            script.outcomes.pop_front()
        };
        match outcome {
            Some(Outcome::Ready(result)) => result,
            Some(Outcome::Hang) => std::future::pending().await,
            None => Err(HavenError::Transport("no scripted outcome".into())),
        }
    }
}

/// The server side of a scripted socket.
pub(crate) struct RemoteEnd {
    outbound: Option<mpsc::UnboundedReceiver<OutboundFrame>>,
    inbound: mpsc::UnboundedSender<InboundFrame>,
    /// Frames already read by `answer_pings`, kept for `drain`.
    backlog: Vec<OutboundFrame>,
}

impl RemoteEnd {
    pub(crate) fn deliver(&self, raw: &str) {
        let _ = self.inbound.send(InboundFrame::Text(raw.to_string()));
    }

    pub(crate) fn close(&self, code: u16, reason: &str) {
        let _ = self.inbound.send(InboundFrame::Closed {
            code,
            reason: reason.to_string(),
        });
    }

    /// Stop reading, so every further write from the client fails.
    pub(crate) fn sever(&mut self) {
        self.outbound = None;
    }

    /// Everything the client has written so far.
    pub(crate) fn drain(&mut self) -> Vec<OutboundFrame> {
        self.pull();
        std::mem::take(&mut self.backlog)
    }

    /// Answer every ping written since the last call.
    pub(crate) fn answer_pings(&mut self) {
        let before = self.backlog.len();
        self.pull();
        for frame in &self.backlog[before..] {
            if *frame == OutboundFrame::Ping {
                let _ = self.inbound.send(InboundFrame::Pong);
            }
        }
    }

    fn pull(&mut self) {
        if let Some(rx) = self.outbound.as_mut() {
            while let Ok(frame) = rx.try_recv() {
                self.backlog.push(frame);
            }
        }
    }

    /// Text frames written so far, keep-alives skipped.
    pub(crate) fn texts(&mut self) -> Vec<String> {
        self.drain()
            .into_iter()
            .filter_map(|f| match f {
                OutboundFrame::Text(t) => Some(t),
                _ => None,
            })
            .collect()
    }
}

/// Wait for the first event matching `pred`, failing instead of hanging.
pub(crate) async fn wait_for(
    events: &mut mpsc::Receiver<ConnectionEvent>,
    pred: impl Fn(&ConnectionEvent) -> bool,
) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            let event = events.recv().await.expect("connection driver stopped");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for connection event")
}

/// Behave like a healthy server for `total`: answer pings as they arrive.
pub(crate) async fn keep_alive(remote: &mut RemoteEnd, total: Duration) {
    let step = Duration::from_secs(1);
    let mut elapsed = Duration::ZERO;
    while elapsed < total {
        tokio::time::sleep(step).await;
        remote.answer_pings();
        elapsed += step;
    }
}
