//! Per-address connection managers.
//!
//! The session runs one [`ConnectionManager`] per device address as its
//! connection task. The manager connects, resolves characteristic paths and
//! flips the address to ready. On an unexpected disconnect it flips the
//! address back, cancels the address's in-flight operations and, if the
//! options ask for it, reconnects.
//!
//! Connection attempts that fail with a recoverable error are retried per
//! the [`BackoffPolicy`](crate::config::BackoffPolicy). Anything else ends
//! the task with an error, which stops the whole session.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use sensorbus_types::DeviceAddress;

use crate::bus::Bus;
use crate::config::ConnectionOptions;
use crate::dispatch::{disable_device, enable_device};
use crate::error::{Result, TransportResult};
use crate::events::SessionEvent;
use crate::session::{Cancellation, Session};

/// Cancellation reason for operations of a device that dropped its link.
pub const DEVICE_DISCONNECTED: &str = "device disconnected";

/// Connection task of one device address.
#[derive(Debug)]
pub struct ConnectionManager {
    address: DeviceAddress,
    options: ConnectionOptions,
    connected: AtomicBool,
}

impl ConnectionManager {
    /// Create a manager for an address.
    pub fn new(address: DeviceAddress, options: ConnectionOptions) -> Self {
        Self {
            address,
            options,
            connected: AtomicBool::new(false),
        }
    }

    /// The managed address.
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Run until cancelled, or until the device disconnects without
    /// reconnection, then disconnect and clean up.
    #[tracing::instrument(level = "info", skip_all, fields(address = %self.address))]
    pub async fn run(self, session: Session, cancel: Cancellation) -> Result<()> {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(reason = cancel.reason().unwrap_or_default(), "connection task cancelled");
                Ok(())
            }
            result = self.drive(&session) => result,
        };
        self.cleanup(&session).await;
        result
    }

    async fn drive(&self, session: &Session) -> Result<()> {
        let bus = session.bus();
        loop {
            let characteristics = self.establish(session).await?;

            if self.options.enable_on_connect {
                for spec in session.devices_of(&self.address) {
                    if let Err(e) = enable_device(bus, &spec).await {
                        warn!(device = %spec, error = %e, "failed to enable device on connect");
                    }
                }
            }

            session.mark_connected(&self.address)?;
            info!(characteristics, "device ready");
            session.events().send(SessionEvent::Connected {
                address: self.address.clone(),
                characteristics,
            });

            bus.wait_disconnected(&self.address).await;
            self.connected.store(false, Ordering::SeqCst);
            warn!("device disconnected");

            session.mark_disconnected(&self.address);
            session.cancel_device_operations(&self.address, DEVICE_DISCONNECTED);
            bus.forget(&self.address);
            session.events().send(SessionEvent::Disconnected {
                address: self.address.clone(),
            });

            if !self.options.reconnect {
                return Ok(());
            }
            info!("reconnecting");
            session.events().send(SessionEvent::ReconnectStarted {
                address: self.address.clone(),
            });
        }
    }

    async fn establish(&self, session: &Session) -> Result<usize> {
        let backoff = &self.options.backoff;
        let mut attempt = 0u32;
        loop {
            match self.try_establish(session.bus()).await {
                Ok(count) => return Ok(count),
                Err(e) if e.is_recoverable() && backoff.allows_retry(attempt) => {
                    let delay = backoff.delay_for_attempt(attempt);
                    attempt += 1;
                    warn!(attempt, error = %e, ?delay, "connection attempt failed, retrying");
                    session.events().send(SessionEvent::ConnectRetry {
                        address: self.address.clone(),
                        attempt,
                        error: e.to_string(),
                    });
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn try_establish(&self, bus: &Bus) -> TransportResult<usize> {
        debug!("connecting");
        bus.connect(&self.address).await?;
        self.connected.store(true, Ordering::SeqCst);

        match bus.resolve(&self.address).await {
            Ok(count) => Ok(count),
            Err(e) => {
                if let Err(disconnect_err) = bus.disconnect(&self.address).await {
                    debug!(error = %disconnect_err, "disconnect after failed discovery failed");
                }
                self.connected.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn cleanup(&self, session: &Session) {
        session.mark_disconnected(&self.address);
        let bus = session.bus();

        if self.connected.swap(false, Ordering::SeqCst) {
            if self.options.enable_on_connect {
                for spec in session.devices_of(&self.address) {
                    disable_device(bus, &spec).await;
                }
            }
            match bus.disconnect(&self.address).await {
                Ok(()) => info!("disconnected"),
                Err(e) => warn!(error = %e, "disconnect failed"),
            }
            session.events().send(SessionEvent::Disconnected {
                address: self.address.clone(),
            });
        }
        bus.forget(&self.address);
    }
}
