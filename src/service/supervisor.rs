//! Process supervision and the shutdown state machine.
//!
//! ## Shutdown
//!
//! ```text
//! Running ──(main exit | power-off signal)──► ShuttingDown
//! ShuttingDown ──(all services drained)─────► Stopped
//! ShuttingDown ──(timeout)──────────────────► KilledOnTimeout
//! ```
//!
//! Both triggers may race; only the first drives the shutdown
//! sequence. The timeout is armed before any stop signal is sent, so
//! every service gets an identical deadline. A second power-off during
//! shutdown neither re-arms nor shortens the timeout.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};

use crate::constants;
use crate::errors::{PreinitError, PreinitResult};
use crate::service::{Service, ServiceRegistry};

/// States of the supervisor lifecycle. `Stopped` and
/// `KilledOnTimeout` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Running,
    ShuttingDown,
    Stopped,
    KilledOnTimeout,
}

pub struct Supervisor {
    main: Arc<dyn Service>,
    services: Vec<Arc<dyn Service>>,
    registry: ServiceRegistry,
    services_dir: PathBuf,
    timeout: Duration,
}

impl Supervisor {
    pub fn new(
        main: Arc<dyn Service>,
        registry: ServiceRegistry,
        services_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            main,
            services: Vec::new(),
            registry,
            services_dir: services_dir.into(),
            timeout,
        }
    }

    /// Discover configured services and start them in listing order,
    /// then start the main workload. An optional service's start
    /// failure is logged and startup continues; any other failure
    /// aborts startup, leaving already-started services running.
    pub async fn start(&mut self) -> PreinitResult<()> {
        self.discover().await?;

        for service in &self.services {
            if let Err(err) = service.start().await {
                if service.optional() {
                    tracing::warn!(
                        service = service.name(),
                        error = %err,
                        "optional service failed to start"
                    );
                    continue;
                }
                return Err(err);
            }
        }

        self.main.start().await
    }

    async fn discover(&mut self) -> PreinitResult<()> {
        let mut entries = tokio::fs::read_dir(&self.services_dir).await.map_err(
            |source| PreinitError::ReadDir {
                path: self.services_dir.clone(),
                source,
            },
        )?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| PreinitError::ReadDir {
                path: self.services_dir.clone(),
                source,
            })?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();

        for name in names {
            match self.registry.create(&name) {
                Some(service) => self.services.push(service),
                None => tracing::warn!(service = %name, "unknown service, skipping"),
            }
        }
        Ok(())
    }

    /// Block until a terminal state is reached.
    pub async fn wait(&mut self) -> PreinitResult<SupervisorState> {
        let mut poweroff = signal(SignalKind::from_raw(constants::SIGPWRBTN))?;
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            while poweroff.recv().await.is_some() {
                if tx.send(()).await.is_err() {
                    break;
                }
            }
        });
        Ok(self.wait_with_poweroff(rx).await)
    }

    /// State machine driver with an injected power-off source.
    ///
    /// Single consumer: triggers funnel into this loop, so the
    /// Running → ShuttingDown transition happens at most once.
    pub(crate) async fn wait_with_poweroff(
        &mut self,
        mut poweroff: mpsc::Receiver<()>,
    ) -> SupervisorState {
        let (exit_tx, mut exit_rx) = oneshot::channel();
        let main = Arc::clone(&self.main);
        tokio::spawn(async move {
            if let Err(err) = main.wait().await {
                tracing::warn!(process = main.name(), error = %err, "main process exited with error");
            }
            let _ = exit_tx.send(());
        });

        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
        let mut state = SupervisorState::Running;
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = &mut exit_rx, if state == SupervisorState::Running => {
                    tracing::info!("main process exited, shutting down services");
                    state = SupervisorState::ShuttingDown;
                    deadline = Some(Instant::now() + self.timeout);
                    self.shutdown(false, done_tx.clone());
                }
                Some(()) = poweroff.recv() => {
                    if state == SupervisorState::Running {
                        tracing::info!("got poweroff signal, shutting down all processes");
                        state = SupervisorState::ShuttingDown;
                        deadline = Some(Instant::now() + self.timeout);
                        self.shutdown(true, done_tx.clone());
                    } else {
                        tracing::debug!("poweroff signal during shutdown, ignoring");
                    }
                }
                Some(()) = done_rx.recv(), if state == SupervisorState::ShuttingDown => {
                    tracing::info!("all processes have exited");
                    state = SupervisorState::Stopped;
                    break;
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    tracing::warn!("timeout waiting for graceful shutdown");
                    for service in &self.services {
                        service.kill();
                    }
                    self.main.kill();
                    state = SupervisorState::KilledOnTimeout;
                    break;
                }
            }
        }
        state
    }

    /// Send graceful stop to every service (and the main process when
    /// the power-off signal is the trigger), then drain their exits in
    /// the background. The deadline is already armed.
    fn shutdown(&self, stop_main: bool, done: mpsc::Sender<()>) {
        for service in &self.services {
            service.stop();
        }
        if stop_main {
            self.main.stop();
        }

        let services = self.services.clone();
        tokio::spawn(async move {
            for service in services {
                if let Err(err) = service.wait().await {
                    tracing::warn!(
                        service = service.name(),
                        error = %err,
                        "process exited with error"
                    );
                }
            }
            let _ = done.send(()).await;
        });
    }
}
