//! Session lifecycle, readiness signals and cancellation.
//!
//! A [`Session`] coordinates every device managed over one transport. It
//! holds:
//!
//! - the [`Bus`] (shared transport plus path table),
//! - one readiness signal and one connection task per device address,
//! - the current in-flight operation of every registration.
//!
//! # Lifecycle
//!
//! ```text
//! Inactive --start()--> Active --stop()--> Stopped
//!     \_____________________stop()_______/
//! ```
//!
//! Connection tasks can only be registered while inactive and are spawned
//! by [`Session::start`]. Operations can only be submitted while active.
//! [`Session::stop`] cancels every in-flight operation and every connection
//! task; a stopped session cannot be restarted. A connection task that
//! fails with anything other than cancellation stops the session.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sensorbus_core::{BleTransport, Session, register_device};
//! use sensorbus_core::capability::PollCharacteristic;
//! use sensorbus_types::{decode, uuids::BATTERY_LEVEL};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BleTransport::new().await?);
//!     let session = Session::new(transport);
//!
//!     let battery = register_device(
//!         "A0:E6:F8:00:11:22",
//!         PollCharacteristic::new(BATTERY_LEVEL),
//!         decode::u8,
//!     );
//!     session.connect(&battery)?;
//!     session.start()?;
//!
//!     println!("battery: {}%", session.read(&battery).await?);
//!     session.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sensorbus_types::DeviceAddress;

use crate::bus::Bus;
use crate::config::{ConnectionOptions, SessionConfig};
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, SessionEvent};
use crate::manager::ConnectionManager;
use crate::registration::{DeviceRegistration, DeviceSpec, RegistrationId};
use crate::transport::Transport;

/// Cancellation reason used by [`Session::stop`].
pub const SESSION_STOPPED: &str = "session stopped";

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not started yet.
    Inactive,
    /// Started; operations are accepted.
    Active,
    /// Stopped for good.
    Stopped,
}

/// Cooperative cancellation handle carrying the reason of the first cancel.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl Cancellation {
    /// Create an uncancelled handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel with a reason. Later reasons are ignored.
    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.reason.set(reason.into());
        self.token.cancel();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// The reason of the first cancel.
    pub fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }

    /// The error an operation observing this cancellation returns.
    pub fn error(&self) -> Error {
        Error::cancelled(self.reason().unwrap_or("cancelled"))
    }
}

/// A connection task, started with the cancellation that stops it.
pub type ConnectionTask = Box<dyn FnOnce(Cancellation) -> BoxFuture<'static, Result<()>> + Send>;

struct ConnectionSlot {
    ready: watch::Sender<bool>,
    cancel: Cancellation,
    pending: Option<ConnectionTask>,
    handle: Option<JoinHandle<()>>,
    devices: Vec<Arc<DeviceSpec>>,
}

impl ConnectionSlot {
    fn new(task: ConnectionTask) -> Self {
        Self {
            ready: watch::channel(false).0,
            cancel: Cancellation::new(),
            pending: Some(task),
            handle: None,
            devices: Vec::new(),
        }
    }
}

struct InFlight {
    address: DeviceAddress,
    cancel: Cancellation,
}

#[derive(Default)]
struct Tables {
    operations: HashMap<RegistrationId, InFlight>,
    connections: HashMap<DeviceAddress, ConnectionSlot>,
}

struct Inner {
    bus: Arc<Bus>,
    options: ConnectionOptions,
    events: EventDispatcher,
    state: watch::Sender<SessionState>,
    shutdown: CancellationToken,
    failure: OnceLock<String>,
    tables: Mutex<Tables>,
}

/// Handle to a session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

/// Non-owning session handle held by tasks the session itself owns.
#[derive(Clone)]
pub struct WeakSession {
    inner: Weak<Inner>,
}

impl WeakSession {
    /// Get the session back if it still exists.
    pub fn upgrade(&self) -> Option<Session> {
        self.inner.upgrade().map(|inner| Session { inner })
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("bus", &self.inner.bus)
            .finish_non_exhaustive()
    }
}

async fn until_true(mut rx: watch::Receiver<bool>) -> bool {
    loop {
        if *rx.borrow_and_update() {
            return true;
        }
        if rx.changed().await.is_err() {
            return false;
        }
    }
}

impl Session {
    /// Create a session with default timeouts and connection options.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, SessionConfig::default(), ConnectionOptions::default())
    }

    /// Create a session with explicit timeouts and default connection options.
    pub fn with_config(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus: Arc::new(Bus::new(transport, config)),
                options,
                events: EventDispatcher::default(),
                state: watch::channel(SessionState::Inactive).0,
                shutdown: CancellationToken::new(),
                failure: OnceLock::new(),
                tables: Mutex::new(Tables::default()),
            }),
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.inner
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Non-owning handle.
    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The bus adapter.
    pub fn bus(&self) -> &Arc<Bus> {
        &self.inner.bus
    }

    /// Session events.
    pub fn events(&self) -> &EventDispatcher {
        &self.inner.events
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Whether the session accepts operations.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// The error that stopped the session, if a connection task failed.
    pub fn failure(&self) -> Option<&str> {
        self.inner.failure.get().map(String::as_str)
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        match self.state() {
            SessionState::Active => Ok(()),
            SessionState::Inactive => Err(Error::illegal_state("session is not started")),
            SessionState::Stopped => Err(Error::illegal_state("session is stopped")),
        }
    }

    fn ensure_inactive(&self) -> Result<()> {
        match self.state() {
            SessionState::Inactive => Ok(()),
            SessionState::Active => Err(Error::illegal_state(
                "connection tasks can only be registered before the session starts",
            )),
            SessionState::Stopped => Err(Error::illegal_state("session is stopped")),
        }
    }

    fn insert_slot<'a>(
        tables: &'a mut Tables,
        address: &DeviceAddress,
        task: ConnectionTask,
    ) -> Result<&'a mut ConnectionSlot> {
        if tables.connections.contains_key(address) {
            return Err(Error::illegal_state(format!(
                "connection task for {address} is already registered"
            )));
        }
        Ok(tables
            .connections
            .entry(address.clone())
            .or_insert_with(|| ConnectionSlot::new(task)))
    }

    /// Register the connection task of an address.
    ///
    /// Only legal before [`start`](Self::start). The readiness signal of the
    /// address starts as not-ready.
    pub fn register_connection_task<F>(&self, address: impl Into<DeviceAddress>, task: F) -> Result<()>
    where
        F: FnOnce(Cancellation) -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        let address = address.into();
        let mut tables = self.tables();
        self.ensure_inactive()?;
        Self::insert_slot(&mut tables, &address, Box::new(task))?;
        debug!(address = %address, "connection task registered");
        Ok(())
    }

    /// Manage a device with the session's default connection options.
    ///
    /// Registrations sharing an address share one connection manager.
    pub fn connect<T>(&self, registration: &DeviceRegistration<T>) -> Result<()> {
        self.connect_with(registration, self.inner.options.clone())
    }

    /// Manage a device with explicit connection options.
    ///
    /// The options of the first registration of an address win.
    pub fn connect_with<T>(
        &self,
        registration: &DeviceRegistration<T>,
        options: ConnectionOptions,
    ) -> Result<()> {
        options.validate()?;
        let spec = Arc::clone(registration.spec());
        let address = spec.address().clone();

        let mut tables = self.tables();
        self.ensure_inactive()?;

        let slot = match tables.connections.get_mut(&address) {
            Some(slot) => slot,
            None => {
                let manager = ConnectionManager::new(address.clone(), options);
                let weak = self.downgrade();
                let task: ConnectionTask = Box::new(move |cancel| match weak.upgrade() {
                    Some(session) => manager.run(session, cancel).boxed(),
                    None => async { Ok(()) }.boxed(),
                });
                Self::insert_slot(&mut tables, &address, task)?
            }
        };
        if !slot.devices.iter().any(|d| d.id() == spec.id()) {
            debug!(address = %address, device = %spec, "device registered");
            slot.devices.push(spec);
        }
        Ok(())
    }

    pub(crate) fn devices_of(&self, address: &DeviceAddress) -> Vec<Arc<DeviceSpec>> {
        self.tables()
            .connections
            .get(address)
            .map(|slot| slot.devices.clone())
            .unwrap_or_default()
    }

    /// Addresses with a registered connection task.
    pub fn addresses(&self) -> Vec<DeviceAddress> {
        let mut addresses: Vec<_> = self.tables().connections.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Activate the session and spawn the connection tasks.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let pending: Vec<(DeviceAddress, ConnectionTask, Cancellation)> = {
            let mut tables = self.tables();
            match self.state() {
                SessionState::Inactive => {}
                SessionState::Active => return Err(Error::illegal_state("session already started")),
                SessionState::Stopped => {
                    return Err(Error::illegal_state("session is stopped and cannot be restarted"));
                }
            }
            self.inner.state.send_replace(SessionState::Active);

            tables
                .connections
                .iter_mut()
                .filter_map(|(address, slot)| {
                    slot.pending
                        .take()
                        .map(|task| (address.clone(), task, slot.cancel.clone()))
                })
                .collect()
        };

        // Tasks are built without the table lock held; they may call back
        // into the session.
        let devices = pending.len();
        for (address, task, cancel) in pending {
            let future = task(cancel);
            let handle = tokio::spawn(supervise(self.downgrade(), address.clone(), future));
            if let Some(slot) = self.tables().connections.get_mut(&address) {
                slot.handle = Some(handle);
            }
        }
        info!(devices, "session started");
        Ok(())
    }

    /// Flip an address to ready.
    pub fn mark_connected(&self, address: &DeviceAddress) -> Result<()> {
        self.ensure_active()?;
        let tables = self.tables();
        let slot = tables
            .connections
            .get(address)
            .ok_or_else(|| Error::UnmanagedDevice(address.clone()))?;
        slot.ready.send_replace(true);
        debug!(address = %address, "marked connected");
        Ok(())
    }

    /// Flip an address to not-ready. Allowed in any state.
    pub fn mark_disconnected(&self, address: &DeviceAddress) {
        if let Some(slot) = self.tables().connections.get(address)
            && slot.ready.send_replace(false)
        {
            debug!(address = %address, "marked disconnected");
        }
    }

    /// Whether an address is currently ready.
    pub fn is_connected(&self, address: &DeviceAddress) -> bool {
        self.tables()
            .connections
            .get(address)
            .is_some_and(|slot| *slot.ready.borrow())
    }

    /// Wait until an address is ready.
    ///
    /// Fails immediately with [`Error::UnmanagedDevice`] if the address has
    /// no connection task, and with [`Error::Cancelled`] if the session
    /// stops while waiting.
    pub async fn wait_connected(&self, address: &DeviceAddress) -> Result<()> {
        let ready = self
            .tables()
            .connections
            .get(address)
            .map(|slot| slot.ready.subscribe())
            .ok_or_else(|| Error::UnmanagedDevice(address.clone()))?;

        tokio::select! {
            biased;
            () = self.inner.shutdown.cancelled() => Err(Error::cancelled(SESSION_STOPPED)),
            ok = until_true(ready) => {
                if ok { Ok(()) } else { Err(Error::cancelled(SESSION_STOPPED)) }
            }
        }
    }

    /// Run an operation for a registration as a cancellable task.
    ///
    /// The task becomes the registration's recorded in-flight operation,
    /// replacing the previous record without cancelling it. Callers await
    /// one operation before submitting the next one for the same
    /// registration.
    pub fn submit_operation<T, F>(&self, spec: &DeviceSpec, operation: F) -> Result<OperationHandle<T>>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let mut tables = self.tables();
        self.ensure_active()?;

        let cancel = Cancellation::new();
        let guard = cancel.clone();
        // A replaced record no longer reaches `stop`, so watch the session too.
        let shutdown = self.inner.shutdown.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                () = guard.cancelled() => Err(guard.error()),
                () = shutdown.cancelled() => {
                    guard.cancel(SESSION_STOPPED);
                    Err(guard.error())
                }
                result = operation => result,
            }
        });

        tables.operations.insert(
            spec.id(),
            InFlight {
                address: spec.address().clone(),
                cancel: cancel.clone(),
            },
        );
        Ok(OperationHandle { handle, cancel })
    }

    /// Number of registrations with a recorded operation.
    pub fn in_flight_count(&self) -> usize {
        self.tables().operations.len()
    }

    /// Cancel every recorded operation of an address.
    pub fn cancel_device_operations(&self, address: &DeviceAddress, reason: &str) {
        let mut cancelled = Vec::new();
        self.tables().operations.retain(|_, op| {
            if &op.address == address {
                cancelled.push(op.cancel.clone());
                false
            } else {
                true
            }
        });
        if !cancelled.is_empty() {
            debug!(address = %address, count = cancelled.len(), reason, "cancelling device operations");
        }
        for cancel in cancelled {
            cancel.cancel(reason);
        }
    }

    /// Stop the session. Idempotent.
    ///
    /// Cancels every in-flight operation and every connection task. The
    /// connection tasks run their cleanup afterwards; use
    /// [`shutdown`](Self::shutdown) to wait for it.
    pub fn stop(&self) {
        self.stop_with_reason(SESSION_STOPPED);
    }

    fn stop_with_reason(&self, reason: &str) {
        let cancels: Vec<Cancellation> = {
            let mut guard = self.tables();
            let tables = &mut *guard;
            if self.state() == SessionState::Stopped {
                return;
            }
            self.inner.state.send_replace(SessionState::Stopped);

            let operations = tables.operations.drain().map(|(_, op)| op.cancel);
            let connections: Vec<Cancellation> = tables
                .connections
                .values_mut()
                .map(|slot| {
                    slot.pending = None;
                    slot.cancel.clone()
                })
                .collect();
            operations.chain(connections).collect()
        };

        self.inner.shutdown.cancel();
        for cancel in cancels {
            cancel.cancel(reason);
        }
        info!(reason, "session stopped");
        self.inner.events.send(SessionEvent::SessionStopped {
            reason: reason.to_string(),
        });
    }

    fn fail(&self, address: &DeviceAddress, err: Error) {
        error!(address = %address, error = %err, "connection task failed, stopping session");
        let message = format!("connection task for {address} failed: {err}");
        let _ = self.inner.failure.set(message.clone());
        self.inner.events.send(SessionEvent::ConnectionFailed {
            address: address.clone(),
            error: err.to_string(),
        });
        self.stop_with_reason(&message);
    }

    /// Wait until the session is stopped.
    pub async fn wait(&self) {
        let mut rx = self.inner.state.subscribe();
        loop {
            if *rx.borrow_and_update() == SessionState::Stopped {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop the session and wait for every connection task to finish its
    /// cleanup.
    pub async fn shutdown(&self) {
        self.stop();
        let handles: Vec<(DeviceAddress, JoinHandle<()>)> = self
            .tables()
            .connections
            .iter_mut()
            .filter_map(|(address, slot)| slot.handle.take().map(|h| (address.clone(), h)))
            .collect();
        for (address, handle) in handles {
            if let Err(e) = handle.await {
                warn!(address = %address, error = %e, "connection task did not finish cleanly");
            }
        }
    }
}

async fn supervise(session: WeakSession, address: DeviceAddress, task: BoxFuture<'static, Result<()>>) {
    let result = match AssertUnwindSafe(task).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(Error::Internal("connection task panicked".to_string())),
    };
    let Some(session) = session.upgrade() else {
        return;
    };
    match result {
        Ok(()) => debug!(address = %address, "connection task finished"),
        Err(e) if e.is_cancelled() => debug!(address = %address, "connection task cancelled"),
        Err(e) if !session.is_active() => {
            debug!(address = %address, error = %e, "connection task failed after stop");
        }
        Err(e) => session.fail(&address, e),
    }
}

/// Handle of a submitted operation. Await it for the result.
///
/// Dropping the handle does not cancel the operation.
#[derive(Debug)]
pub struct OperationHandle<T> {
    handle: JoinHandle<Result<T>>,
    cancel: Cancellation,
}

impl<T> OperationHandle<T> {
    /// Cancel the operation.
    pub fn cancel(&self, reason: &str) {
        self.cancel.cancel(reason);
    }

    /// Whether the operation task has finished.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> Future for OperationHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.handle).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) if e.is_cancelled() => Poll::Ready(Err(this.cancel.error())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(Error::Internal(format!(
                "operation task failed: {e}"
            )))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::PollCharacteristic;
    use crate::mock::MockTransport;
    use crate::registration::register_device;
    use sensorbus_types::{decode, uuids::BATTERY_LEVEL};
    use std::time::Duration;

    fn session() -> Session {
        Session::new(Arc::new(MockTransport::new()))
    }

    fn addr(s: &str) -> DeviceAddress {
        DeviceAddress::new(s)
    }

    fn idle_task(cancel: Cancellation) -> BoxFuture<'static, Result<()>> {
        async move {
            cancel.cancelled().await;
            Ok(())
        }
        .boxed()
    }

    #[tokio::test]
    async fn test_start_twice_is_illegal() {
        let session = session();
        assert_eq!(session.state(), SessionState::Inactive);
        session.start().unwrap();
        assert!(session.is_active());
        assert!(matches!(session.start(), Err(Error::IllegalState(_))));
    }

    #[tokio::test]
    async fn test_register_after_start_is_illegal() {
        let session = session();
        session.register_connection_task(addr("aa:aa:aa:aa:aa:01"), idle_task).unwrap();
        assert!(matches!(
            session.register_connection_task(addr("aa:aa:aa:aa:aa:01"), idle_task),
            Err(Error::IllegalState(_))
        ));

        session.start().unwrap();
        assert!(matches!(
            session.register_connection_task(addr("aa:aa:aa:aa:aa:02"), idle_task),
            Err(Error::IllegalState(_))
        ));
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_connected_unmanaged_fails_without_suspending() {
        let session = session();
        session.start().unwrap();
        let result = session
            .wait_connected(&addr("aa:aa:aa:aa:aa:09"))
            .now_or_never()
            .expect("must not suspend");
        assert!(matches!(result, Err(Error::UnmanagedDevice(a)) if a == addr("aa:aa:aa:aa:aa:09")));
    }

    #[tokio::test]
    async fn test_wait_connected_follows_readiness() {
        let session = session();
        let a = addr("aa:aa:aa:aa:aa:01");
        session.register_connection_task(a.clone(), idle_task).unwrap();
        session.start().unwrap();
        assert!(!session.is_connected(&a));

        let waiter = {
            let session = session.clone();
            let a = a.clone();
            tokio::spawn(async move { session.wait_connected(&a).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        session.mark_connected(&a).unwrap();
        waiter.await.unwrap().unwrap();
        assert!(session.is_connected(&a));

        session.mark_disconnected(&a);
        assert!(!session.is_connected(&a));
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_connected_cancelled_by_stop() {
        let session = session();
        let a = addr("aa:aa:aa:aa:aa:01");
        session.register_connection_task(a.clone(), idle_task).unwrap();
        session.start().unwrap();

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.wait_connected(&a).await })
        };
        tokio::task::yield_now().await;
        session.stop();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_mark_connected_requires_active() {
        let session = session();
        let a = addr("aa:aa:aa:aa:aa:01");
        session.register_connection_task(a.clone(), idle_task).unwrap();
        assert!(matches!(session.mark_connected(&a), Err(Error::IllegalState(_))));
        // disconnect is always allowed
        session.mark_disconnected(&a);
    }

    #[tokio::test]
    async fn test_submit_requires_active() {
        let session = session();
        let reg = register_device("aa:aa:aa:aa:aa:01", PollCharacteristic::new(BATTERY_LEVEL), decode::u8);
        let result = session.submit_operation(reg.spec(), async { Ok(1) });
        assert!(matches!(result, Err(Error::IllegalState(_))));
    }

    #[tokio::test]
    async fn test_submit_then_stop_observes_cancellation() {
        let session = session();
        let reg = register_device("aa:aa:aa:aa:aa:01", PollCharacteristic::new(BATTERY_LEVEL), decode::u8);
        session.start().unwrap();

        let handle = session
            .submit_operation(reg.spec(), async { Ok::<_, Error>(42) })
            .unwrap();
        session.stop();

        match handle.await {
            Err(Error::Cancelled { reason }) => assert_eq!(reason, SESSION_STOPPED),
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn test_one_in_flight_entry_per_registration() {
        let session = session();
        let a = register_device("aa:aa:aa:aa:aa:01", PollCharacteristic::new(BATTERY_LEVEL), decode::u8);
        let b = register_device("aa:aa:aa:aa:aa:01", PollCharacteristic::new(BATTERY_LEVEL), decode::u8);
        session.start().unwrap();

        for i in 0..3 {
            let value = session.submit_operation(a.spec(), async move { Ok(i) }).unwrap().await;
            assert_eq!(value.unwrap(), i);
            assert_eq!(session.in_flight_count(), 1);
        }
        session.submit_operation(b.spec(), async { Ok(()) }).unwrap().await.unwrap();
        assert_eq!(session.in_flight_count(), 2);
        session.stop();
        assert_eq!(session.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_device_operations_is_scoped_to_address() {
        let session = session();
        let a = register_device("aa:aa:aa:aa:aa:01", PollCharacteristic::new(BATTERY_LEVEL), decode::u8);
        let b = register_device("aa:aa:aa:aa:aa:02", PollCharacteristic::new(BATTERY_LEVEL), decode::u8);
        session.start().unwrap();

        let pending_a = session
            .submit_operation(a.spec(), futures::future::pending::<Result<()>>())
            .unwrap();
        let slow_b = session
            .submit_operation(b.spec(), async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(7)
            })
            .unwrap();

        session.cancel_device_operations(a.address(), "device disconnected");
        match pending_a.await {
            Err(Error::Cancelled { reason }) => assert_eq!(reason, "device disconnected"),
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(slow_b.await.unwrap(), 7);
        assert!(session.is_active());
    }

    #[tokio::test]
    async fn test_failing_connection_task_stops_session() {
        let session = session();
        let mut events = session.events().subscribe();
        let bad = addr("aa:aa:aa:aa:aa:01");
        let good = register_device("aa:aa:aa:aa:aa:02", PollCharacteristic::new(BATTERY_LEVEL), decode::u8);

        session
            .register_connection_task(bad.clone(), |_cancel| {
                async {
                    tokio::task::yield_now().await;
                    Err(Error::Internal("adapter vanished".into()))
                }
                .boxed()
            })
            .unwrap();
        session.register_connection_task(good.address().clone(), idle_task).unwrap();
        session.start().unwrap();

        let pending = session
            .submit_operation(good.spec(), futures::future::pending::<Result<()>>())
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), session.wait()).await.unwrap();
        assert!(!session.is_active());
        assert!(pending.await.unwrap_err().is_cancelled());
        assert!(session.failure().unwrap().contains("adapter vanished"));

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::ConnectionFailed { ref address, .. } if *address == bad) {
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_cancelled_connection_task_does_not_escalate() {
        let session = session();
        let a = addr("aa:aa:aa:aa:aa:01");
        session
            .register_connection_task(a.clone(), |cancel| {
                async move {
                    cancel.cancelled().await;
                    Err(cancel.error())
                }
                .boxed()
            })
            .unwrap();
        session.start().unwrap();
        session.shutdown().await;
        assert_eq!(session.failure(), None);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_final() {
        let session = session();
        let mut events = session.events().subscribe();
        session.start().unwrap();
        session.stop();
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(matches!(session.start(), Err(Error::IllegalState(_))));

        assert!(matches!(events.try_recv(), Ok(SessionEvent::SessionStopped { .. })));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let session = session();
        session.register_connection_task(addr("aa:aa:aa:aa:aa:01"), idle_task).unwrap();
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(matches!(session.start(), Err(Error::IllegalState(_))));
        session.wait().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_replaced_operation() {
        let session = session();
        let reg = register_device("aa:aa:aa:aa:aa:01", PollCharacteristic::new(BATTERY_LEVEL), decode::u8);
        session.start().unwrap();

        let first = session
            .submit_operation(reg.spec(), futures::future::pending::<Result<()>>())
            .unwrap();
        session.submit_operation(reg.spec(), async { Ok(()) }).unwrap().await.unwrap();
        assert_eq!(session.in_flight_count(), 1);

        session.stop();
        let result = tokio::time::timeout(Duration::from_secs(1), first)
            .await
            .expect("replaced operation still running after stop");
        match result {
            Err(Error::Cancelled { reason }) => assert_eq!(reason, SESSION_STOPPED),
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_task_may_use_session_when_started() {
        let session = session();
        let a = addr("aa:aa:aa:aa:aa:01");
        let weak = session.downgrade();
        session
            .register_connection_task(a.clone(), move |cancel| {
                let known = weak.upgrade().map(|s| s.addresses()).unwrap_or_default();
                async move {
                    assert_eq!(known.len(), 1);
                    cancel.cancelled().await;
                    Ok(())
                }
                .boxed()
            })
            .unwrap();

        session.start().unwrap();
        assert!(session.is_active());
        session.shutdown().await;
        assert_eq!(session.failure(), None);
    }

    #[test]
    fn test_cancellation_keeps_first_reason() {
        let cancel = Cancellation::new();
        assert!(!cancel.is_cancelled());
        cancel.cancel("device disconnected");
        cancel.cancel(SESSION_STOPPED);
        assert!(cancel.is_cancelled());
        assert_eq!(cancel.reason(), Some("device disconnected"));
        assert!(cancel.error().is_cancelled());
    }
}
