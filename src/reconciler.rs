use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    error::Result,
    protocol::{decode_payload, Command, StatusSignal},
    state::{ConnectionState, Notifier, SharedState},
    transport::Transport,
    types::{Connection, ControlParameters, Notice, SessionConfig},
    COMMAND_CHAR_UUID, SERVICE_UUID, STATUS_CHAR_UUID,
};

/// Input to the running-state reducer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    /// The peripheral accepted a command written by the user
    UserToggle(Command),
    /// A notification carried a shutdown or completion keyword
    NotificationTerminal,
    /// A poll read the halted pattern while running
    PollTerminal,
    /// The connection ended
    ConnectionLost,
}

/// Next running state for an event
///
/// Terminal signals from either channel only ever move the state to `false`,
/// so a second report of the same stop is a no-op whichever channel sends it.
/// Only an accepted user command can set it to `true`.
#[must_use]
pub const fn reduce(running: bool, event: &RunEvent) -> bool {
    match *event {
        RunEvent::UserToggle(command) => command.leaves_running(),
        RunEvent::PollTerminal if !running => running,
        RunEvent::NotificationTerminal | RunEvent::PollTerminal | RunEvent::ConnectionLost => false,
    }
}

struct ObservationChannels {
    connection: Connection,
    notifications: Option<JoinHandle<()>>,
    polling: JoinHandle<()>,
}

struct ReconcilerInner {
    transport: Arc<dyn Transport>,
    state: SharedState,
    notifier: Notifier,
    poll_interval: Duration,
    running: watch::Sender<bool>,
    // Bumped on every accepted command so in-flight polls can tell they are stale
    command_epoch: AtomicU64,
    command_lock: Mutex<()>,
    channels: Mutex<Option<ObservationChannels>>,
}

impl ReconcilerInner {
    fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    fn apply(&self, event: RunEvent) -> bool {
        if matches!(event, RunEvent::UserToggle(_)) {
            self.command_epoch.fetch_add(1, Ordering::SeqCst);
        }

        let changed = self.running.send_if_modified(|running| {
            let next = reduce(*running, &event);
            if next == *running {
                return false;
            }
            *running = next;
            true
        });

        if changed {
            info!(running = self.is_running(), ?event, "running state changed");
        } else {
            debug!(?event, "running state unchanged");
        }
        changed
    }
}

/// Drives the peripheral and fuses its two status channels into one flag
///
/// Commands go out on the command characteristic. Status comes back by
/// notification and by a periodic read; both channels feed [`reduce`].
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<ReconcilerInner>,
}

impl Reconciler {
    /// Create a reconciler; call [`Reconciler::spawn_supervisor`] to follow the connection
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        state: SharedState,
        notifier: Notifier,
        config: &SessionConfig,
    ) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            inner: Arc::new(ReconcilerInner {
                transport,
                state,
                notifier,
                poll_interval: config.poll_interval(),
                running,
                command_epoch: AtomicU64::new(0),
                command_lock: Mutex::new(()),
                channels: Mutex::new(None),
            }),
        }
    }

    /// Whether the peripheral is believed to be running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// Observe the running flag
    #[must_use]
    pub fn subscribe_running(&self) -> watch::Receiver<bool> {
        self.inner.running.subscribe()
    }

    /// Feed an event to the reducer; returns whether the flag changed
    pub fn apply(&self, event: RunEvent) -> bool {
        self.inner.apply(event)
    }

    /// Start or stop the peripheral depending on the running flag
    ///
    /// Sends `LIGAR` with `params` when stopped and `DESLIGAR,0,0,0` when
    /// running. The flag follows only once the write succeeds. Returns `None`
    /// without writing when no powered connection exists.
    ///
    /// # Errors
    ///
    /// Returns the transport's write error; the flag is left untouched.
    pub async fn toggle(&self, params: ControlParameters) -> Result<Option<Command>> {
        let _guard = self.inner.command_lock.lock().await;

        let snapshot = self.inner.state.snapshot();
        let Some(connection) = snapshot
            .active_peripheral
            .filter(|_| snapshot.power.is_powered_on())
        else {
            debug!("toggle ignored: no powered connection");
            return Ok(None);
        };

        let command = if self.is_running() {
            Command::Stop
        } else {
            Command::Start(params)
        };

        info!(peripheral = %connection.id(), command = %command, "sending command");
        if let Err(e) = self
            .inner
            .transport
            .write(&connection, SERVICE_UUID, COMMAND_CHAR_UUID, &command.to_bytes())
            .await
        {
            error!(command = %command, error = %e, "command write failed");
            self.inner
                .notifier
                .publish(Notice::CommandFailed(e.to_string()));
            return Err(e);
        }

        if self.inner.state.active_connection().as_ref() != Some(&connection) {
            warn!(command = %command, "link dropped while the command was in flight");
            return Ok(None);
        }

        self.inner.apply(RunEvent::UserToggle(command));
        Ok(Some(command))
    }

    /// Start both status channels for a connection
    ///
    /// Idempotent per connection. Observation of a previous connection is
    /// closed first.
    ///
    /// # Errors
    ///
    /// Returns the subscribe error; polling keeps running regardless.
    pub async fn attach(&self, connection: Connection) -> Result<()> {
        let mut channels = self.inner.channels.lock().await;
        if channels
            .as_ref()
            .is_some_and(|current| current.connection == connection)
        {
            return Ok(());
        }
        if let Some(previous) = channels.take() {
            self.close(previous).await;
        }

        info!(peripheral = %connection.id(), "observing peripheral status");
        let polling = tokio::spawn(poll_status(
            Arc::downgrade(&self.inner),
            connection.clone(),
            self.inner.poll_interval,
        ));

        let subscription = self
            .inner
            .transport
            .subscribe(&connection, SERVICE_UUID, STATUS_CHAR_UUID)
            .await;
        let (notifications, outcome) = match subscription {
            Ok(stream) => (
                Some(tokio::spawn(watch_notifications(
                    Arc::downgrade(&self.inner),
                    stream,
                ))),
                Ok(()),
            ),
            Err(e) => {
                warn!(error = %e, "status notifications unavailable, relying on polling");
                (None, Err(e))
            }
        };

        *channels = Some(ObservationChannels {
            connection,
            notifications,
            polling,
        });
        outcome
    }

    /// Stop both status channels; safe to call repeatedly
    pub async fn detach(&self) {
        let previous = self.inner.channels.lock().await.take();
        if let Some(previous) = previous {
            self.close(previous).await;
        }
    }

    /// Connection currently observed by the status channels
    pub async fn observed_connection(&self) -> Option<Connection> {
        self.inner
            .channels
            .lock()
            .await
            .as_ref()
            .map(|channels| channels.connection.clone())
    }

    async fn close(&self, channels: ObservationChannels) {
        info!(peripheral = %channels.connection.id(), "closing status channels");
        channels.polling.abort();
        if let Some(notifications) = channels.notifications {
            notifications.abort();
            if let Err(e) = self
                .inner
                .transport
                .unsubscribe(&channels.connection, SERVICE_UUID, STATUS_CHAR_UUID)
                .await
            {
                debug!(error = %e, "unsubscribe after link loss");
            }
        }
    }

    async fn sync(&self, snapshot: ConnectionState) {
        match snapshot.active_peripheral {
            Some(connection) if snapshot.power.is_powered_on() => {
                if let Err(e) = self.attach(connection).await {
                    warn!(error = %e, "status observation incomplete");
                }
            }
            active => {
                self.detach().await;
                if active.is_none() {
                    self.inner.apply(RunEvent::ConnectionLost);
                }
            }
        }
    }

    /// Follow the shared connection state, opening and closing the status
    /// channels as the connection comes and goes
    #[must_use]
    pub fn spawn_supervisor(&self) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        let mut changes = self.inner.state.subscribe();

        tokio::spawn(async move {
            loop {
                let snapshot = changes.borrow_and_update().clone();
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                Self { inner }.sync(snapshot).await;

                if changes.changed().await.is_err() {
                    break;
                }
            }
            debug!("reconciler supervisor stopped");
        })
    }
}

async fn watch_notifications(inner: Weak<ReconcilerInner>, mut stream: BoxStream<'static, Bytes>) {
    while let Some(payload) = stream.next().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };

        let text = decode_payload(&payload);
        debug!(%text, "status notification");
        if StatusSignal::classify(&text).is_terminal_notification() {
            inner.apply(RunEvent::NotificationTerminal);
        }
    }
    debug!("status notification stream ended");
}

async fn poll_status(inner: Weak<ReconcilerInner>, connection: Connection, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };

        let snapshot = inner.state.snapshot();
        if !snapshot.can_command() || snapshot.active_peripheral.as_ref() != Some(&connection) {
            continue;
        }

        let epoch = inner.command_epoch.load(Ordering::SeqCst);
        let was_running = inner.is_running();
        match inner
            .transport
            .read(&connection, SERVICE_UUID, STATUS_CHAR_UUID)
            .await
        {
            Ok(payload) => {
                let text = decode_payload(&payload);
                debug!(%text, "status poll");
                let stale = inner.command_epoch.load(Ordering::SeqCst) != epoch;
                if was_running && !stale && StatusSignal::classify(&text).is_halted() {
                    inner.apply(RunEvent::PollTerminal);
                }
            }
            Err(e) => debug!(error = %e, "status poll failed, retrying next tick"),
        }
    }
}
