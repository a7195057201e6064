// ABOUTME: Tokio event loop that feeds external completions into the cooperative scheduler
// ABOUTME: Owns every workspace with its collaborators, heartbeats and reconnect backoff

use crate::platform::slack::{SlackHttp, SocketTransport};
use crate::view::TerminalRenderer;
use anyhow::Result;
use serde_json::Value;
use slackline_core::{
    Collaborators, Config, ConnectionState, DeferredResult, ErrorReporter, MessageView, Renderer,
    Scheduler, StreamHandle, StreamTransport, Timer, Workspace,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Upper bound for the delay between automatic connection retries.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

// =============================================================================
// Events
// =============================================================================

/// Something finished outside the scheduler and must be delivered into it.
#[derive(Debug)]
pub enum HostEvent {
    Http {
        request: DeferredResult<Value>,
        outcome: slackline_core::Result<Value>,
    },
    StreamOpened {
        workspace: String,
        request: DeferredResult<StreamHandle>,
        outcome: slackline_core::Result<StreamHandle>,
    },
    Frame {
        workspace: String,
        stream: StreamHandle,
        text: String,
    },
    StreamClosed {
        workspace: String,
        stream: StreamHandle,
    },
    TimerFired {
        timer: DeferredResult<()>,
    },
    /// Heartbeat interval elapsed for a workspace.
    Tick {
        workspace: String,
    },
}

pub type HostSender = mpsc::UnboundedSender<HostEvent>;

/// Complete `request` unless it was cancelled in the meantime.
fn complete<T>(request: &DeferredResult<T>, outcome: slackline_core::Result<T>) {
    if request.is_done() {
        tracing::trace!(request = %request.id(), "Dropping completion for finished request");
        return;
    }
    if let Err(e) = request.set_result(outcome) {
        tracing::warn!(request = %request.id(), error = %e, "Failed to complete request");
    }
}

// =============================================================================
// Collaborators owned by the host
// =============================================================================

/// Timers backed by `tokio::time`; must be used inside a `LocalSet`.
pub struct TokioTimer {
    events: HostSender,
}

impl TokioTimer {
    pub fn new(events: HostSender) -> Self {
        Self { events }
    }
}

impl Timer for TokioTimer {
    fn sleep(&self, duration: Duration) -> DeferredResult<()> {
        if duration.is_zero() {
            return DeferredResult::resolved(());
        }
        let timer = DeferredResult::new();
        let fired = timer.clone();
        let events = self.events.clone();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(duration).await;
            let _ = events.send(HostEvent::TimerFired { timer: fired });
        });
        timer
    }

    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// Sends orphaned failures and protocol errors to the log.
#[derive(Debug, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, message: &str, data: Option<&Value>) {
        match data {
            Some(data) => tracing::error!(data = %data, "{message}"),
            None => tracing::error!("{message}"),
        }
    }
}

// =============================================================================
// Reconnect backoff
// =============================================================================

/// Doubling delay between automatic connect attempts while disconnected.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    current: Duration,
    retry_at: Option<Instant>,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            current: base,
            retry_at: None,
        }
    }

    pub fn reset(&mut self) {
        self.current = self.base;
        self.retry_at = None;
    }

    /// Whether an attempt is due at `now`. The first call only arms the timer.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.retry_at {
            None => {
                self.retry_at = Some(now + self.current);
                false
            }
            Some(at) if now >= at => {
                self.current = (self.current * 2).min(MAX_RETRY_DELAY);
                self.retry_at = Some(now + self.current);
                true
            }
            Some(_) => false,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

// =============================================================================
// Host
// =============================================================================

struct WorkspaceHost {
    workspace: Workspace,
    transport: Rc<dyn StreamTransport>,
    ping_interval: Duration,
    backoff: RefCell<Backoff>,
}

/// Runs every configured workspace on one thread.
pub struct Host {
    scheduler: Scheduler,
    timer: Rc<dyn Timer>,
    workspaces: HashMap<String, WorkspaceHost>,
    sender: HostSender,
    events: mpsc::UnboundedReceiver<HostEvent>,
}

impl Host {
    pub fn new(config: &Config, view: Rc<dyn MessageView>) -> Result<Self> {
        let (sender, events) = mpsc::unbounded_channel();
        let reporter: Rc<dyn ErrorReporter> = Rc::new(LogReporter);
        let scheduler = Scheduler::new(Rc::clone(&reporter));
        let renderer: Rc<dyn Renderer> = Rc::new(TerminalRenderer::default());
        let timer: Rc<dyn Timer> = Rc::new(TokioTimer::new(sender.clone()));

        let mut workspaces = HashMap::new();
        for workspace_config in &config.workspaces {
            let http = Rc::new(SlackHttp::new(workspace_config, &config.http, sender.clone())?);
            let transport: Rc<dyn StreamTransport> =
                Rc::new(SocketTransport::new(&workspace_config.name, sender.clone()));
            let collaborators = Collaborators {
                http,
                transport: Rc::clone(&transport),
                timer: Rc::clone(&timer),
                reporter: Rc::clone(&reporter),
                renderer: Rc::clone(&renderer),
                view: Rc::clone(&view),
            };
            let workspace = Workspace::new(
                workspace_config.clone(),
                config.history.clone(),
                scheduler.clone(),
                collaborators,
            );
            let ping_interval = workspace_config.ping_interval();
            workspaces.insert(
                workspace_config.name.clone(),
                WorkspaceHost {
                    workspace,
                    transport,
                    ping_interval,
                    backoff: RefCell::new(Backoff::new(ping_interval)),
                },
            );
        }
        tracing::info!(workspaces = workspaces.len(), "Host initialized");

        Ok(Self {
            scheduler,
            timer,
            workspaces,
            sender,
            events,
        })
    }

    pub fn sender(&self) -> HostSender {
        self.sender.clone()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn timer(&self) -> Rc<dyn Timer> {
        Rc::clone(&self.timer)
    }

    pub fn workspace(&self, name: &str) -> Option<&Workspace> {
        self.workspaces.get(name).map(|host| &host.workspace)
    }

    pub async fn next_event(&mut self) -> Option<HostEvent> {
        self.events.recv().await
    }

    /// Connect every workspace and process events until `shutdown` resolves.
    /// Must be awaited inside a `tokio::task::LocalSet`.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        for (name, host) in &self.workspaces {
            host.workspace.connect();
            self.spawn_ticker(name, host.ping_interval);
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                () = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break;
                }
            }
        }

        for host in self.workspaces.values() {
            host.workspace.disconnect();
        }
        self.scheduler.shutdown();
        Ok(())
    }

    fn spawn_ticker(&self, workspace: &str, period: Duration) {
        let events = self.sender.clone();
        let workspace = workspace.to_string();
        tokio::task::spawn_local(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let tick = HostEvent::Tick {
                    workspace: workspace.clone(),
                };
                if events.send(tick).is_err() {
                    break;
                }
            }
        });
    }

    /// Deliver one external event and drive whatever it unblocks.
    pub fn handle(&self, event: HostEvent) {
        match event {
            HostEvent::Http { request, outcome } => {
                self.scheduler.deliver(|| complete(&request, outcome));
            }
            HostEvent::StreamOpened {
                workspace,
                request,
                outcome,
            } => {
                if request.is_done() {
                    // The connect attempt was cancelled while the socket opened.
                    if let (Ok(stream), Some(host)) = (&outcome, self.workspaces.get(&workspace)) {
                        tracing::debug!(workspace = %workspace, stream = %stream, "Closing stream of abandoned connect");
                        host.transport.close(*stream);
                    }
                    return;
                }
                self.scheduler.deliver(|| complete(&request, outcome));
            }
            HostEvent::Frame {
                workspace,
                stream,
                text,
            } => {
                let Some(host) = self.workspaces.get(&workspace) else {
                    return;
                };
                if host.workspace.stream() != Some(stream) {
                    tracing::debug!(workspace = %workspace, stream = %stream, "Dropping frame from stale stream");
                    return;
                }
                host.workspace.receive_frame(&text);
            }
            HostEvent::StreamClosed { workspace, stream } => {
                if let Some(host) = self.workspaces.get(&workspace) {
                    host.workspace.stream_closed(stream);
                }
            }
            HostEvent::TimerFired { timer } => {
                self.scheduler.deliver(|| complete(&timer, Ok(())));
            }
            HostEvent::Tick { workspace } => {
                if let Some(host) = self.workspaces.get(&workspace) {
                    self.tick(host);
                }
            }
        }
    }

    fn tick(&self, host: &WorkspaceHost) {
        let workspace = &host.workspace;
        match workspace.state() {
            ConnectionState::Connected => {
                host.backoff.borrow_mut().reset();
                if let Err(e) = workspace.ping() {
                    tracing::warn!(workspace = %workspace.name(), error = %e, "Heartbeat failed, reconnecting");
                    workspace.reconnect();
                }
            }
            ConnectionState::Connecting => {
                // Stream attached but no completed handshake yet.
                if workspace.stream().is_some() {
                    if let Err(e) = workspace.ping() {
                        tracing::warn!(workspace = %workspace.name(), error = %e, "Heartbeat failed during handshake, reconnecting");
                        workspace.reconnect();
                    }
                }
            }
            ConnectionState::Disconnected => {
                let due = host.backoff.borrow_mut().poll(self.timer.now());
                if due {
                    tracing::info!(
                        workspace = %workspace.name(),
                        next_retry_secs = host.backoff.borrow().current().as_secs(),
                        "Retrying connection"
                    );
                    workspace.connect();
                }
            }
        }
    }
}
