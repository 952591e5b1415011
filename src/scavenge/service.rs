//! Scavenge Service
//!
//! Owns at most one running scavenge. Requests reach the service task over
//! a channel; finished scavenges are published on a watch channel.

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{ScavengeReport, Scavenger};
use crate::error::{Error, Result};

enum Command {
    Start {
        response: oneshot::Sender<Result<Uuid>>,
    },
    Stop {
        response: oneshot::Sender<Option<Uuid>>,
    },
}

struct ServiceInner {
    scavenger: Scavenger,
    running: Option<(Uuid, CancellationToken)>,
    done_tx: mpsc::Sender<ScavengeReport>,
    last_tx: watch::Sender<Option<ScavengeReport>>,
}

/// Handle to the scavenge service task
#[derive(Clone)]
pub struct ScavengeService {
    sender: mpsc::Sender<Command>,
    last: watch::Receiver<Option<ScavengeReport>>,
}

impl ScavengeService {
    /// Spawn the service task on the current runtime
    pub fn spawn(scavenger: Scavenger) -> Self {
        let (sender, receiver) = mpsc::channel(16);
        let (done_tx, done_rx) = mpsc::channel(1);
        let (last_tx, last) = watch::channel(None);

        let inner = ServiceInner {
            scavenger,
            running: None,
            done_tx,
            last_tx,
        };
        tokio::spawn(Self::service_task(inner, receiver, done_rx));

        Self { sender, last }
    }

    /// Start a scavenge. Fails if one is already running.
    pub async fn start_scavenge(&self) -> Result<Uuid> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::Start { response: tx })
            .await
            .map_err(|_| Error::Internal("scavenge service terminated".into()))?;
        rx.await
            .map_err(|_| Error::Internal("scavenge request dropped".into()))?
    }

    /// Cancel the running scavenge, returning its id
    pub async fn stop_scavenge(&self) -> Result<Option<Uuid>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::Stop { response: tx })
            .await
            .map_err(|_| Error::Internal("scavenge service terminated".into()))?;
        rx.await
            .map_err(|_| Error::Internal("scavenge request dropped".into()))
    }

    /// Report of the most recently finished scavenge
    pub fn last_report(&self) -> Option<ScavengeReport> {
        self.last.borrow().clone()
    }

    /// Watch finished scavenges
    pub fn subscribe(&self) -> watch::Receiver<Option<ScavengeReport>> {
        self.last.clone()
    }

    async fn service_task(
        mut inner: ServiceInner,
        mut commands: mpsc::Receiver<Command>,
        mut done: mpsc::Receiver<ScavengeReport>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start { response }) => {
                        let _ = response.send(inner.start());
                    }
                    Some(Command::Stop { response }) => {
                        let stopped = inner.running.as_ref().map(|(id, token)| {
                            token.cancel();
                            *id
                        });
                        if let Some(id) = stopped {
                            tracing::info!("Stopping scavenge {}", id);
                        }
                        let _ = response.send(stopped);
                    }
                    None => {
                        if let Some((_, token)) = inner.running.take() {
                            token.cancel();
                        }
                        break;
                    }
                },
                Some(report) = done.recv() => {
                    inner.running = None;
                    let _ = inner.last_tx.send(Some(report));
                }
            }
        }
    }
}

impl ServiceInner {
    fn start(&mut self) -> Result<Uuid> {
        if let Some((id, _)) = &self.running {
            return Err(Error::InvalidOperation(format!(
                "scavenge {} is already running",
                id
            )));
        }

        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        let scavenger = self.scavenger.clone();
        let done_tx = self.done_tx.clone();
        let cancel = token.clone();
        tokio::spawn(async move {
            let report = scavenger.scavenge_as(id, cancel).await;
            let _ = done_tx.send(report).await;
        });

        self.running = Some((id, token));
        Ok(id)
    }
}
