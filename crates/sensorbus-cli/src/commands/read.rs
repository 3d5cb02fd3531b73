//! Read command implementation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::future::join_all;
use tracing::{debug, info, warn};

use sensorbus_core::{BleTransport, DeviceRegistration, EventReceiver, Session, SessionEvent, Transport};

use crate::cli::ReadArgs;
use crate::config::Config;
use crate::format::{ReadingLine, Value};

/// A configured device and its registration.
struct Device {
    label: String,
    registration: DeviceRegistration<Value>,
}

pub async fn cmd_read(args: ReadArgs) -> Result<()> {
    let config = Config::load_validated(&args.config)?;
    let transport = BleTransport::new()
        .await
        .context("Failed to open the Bluetooth adapter")?;
    read_with_transport(Arc::new(transport), &config, &args).await
}

/// Run a `read` over any transport until the readings are done or Ctrl-C.
pub async fn read_with_transport(
    transport: Arc<dyn Transport>,
    config: &Config,
    args: &ReadArgs,
) -> Result<()> {
    let ctrl_c = async { tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C") };
    read_until(transport, config, args, ctrl_c).await
}

/// Run a `read` until the readings are done or `interrupt` resolves.
///
/// Devices this command enabled are disabled again before the session
/// shuts down, whichever way the readings end.
async fn read_until(
    transport: Arc<dyn Transport>,
    config: &Config,
    args: &ReadArgs,
    interrupt: impl Future<Output = Result<()>>,
) -> Result<()> {
    let session = Session::with_config(
        transport,
        config.session.session_config(),
        config.session.connection_options(),
    );
    let devices = register_devices(&session, config)?;
    let enable = !config.session.enable_on_connect;

    let events = tokio::spawn(log_events(session.events().subscribe()));
    session.start()?;
    info!("Session started with {} device(s)", devices.len());

    let (outcome, interrupted) = tokio::select! {
        biased;
        signal = interrupt => (signal.map(|()| info!("Interrupted, shutting down")), true),
        result = read_all(&session, &devices, args, enable) => (result, false),
    };
    if interrupted && enable {
        join_all(devices.iter().map(|device| session.disable(&device.registration))).await;
    }

    session.shutdown().await;
    if let Err(e) = events.await {
        debug!("event logger ended abnormally: {e}");
    }

    if let Some(reason) = session.failure() {
        bail!("Session failed: {reason}");
    }
    outcome
}

fn register_devices(session: &Session, config: &Config) -> Result<Vec<Device>> {
    let mut devices = Vec::with_capacity(config.devices.len());
    for (i, entry) in config.devices.iter().enumerate() {
        let capability = entry.capability(&format!("devices[{i}]"))?;
        let decode = entry.decode;
        let mut builder = DeviceRegistration::builder(entry.address.as_str(), capability, move |data: &[u8]| {
            decode.decode(data)
        })
        .name(entry.label());
        if let Some(seconds) = entry.interval {
            builder = builder.interval(seconds);
        }
        let registration = builder.build();

        session
            .connect(&registration)
            .with_context(|| format!("Failed to register {}", entry.label()))?;
        devices.push(Device {
            label: entry.label().to_string(),
            registration,
        });
    }
    Ok(devices)
}

async fn read_all(session: &Session, devices: &[Device], args: &ReadArgs, enable: bool) -> Result<()> {
    let results = join_all(devices.iter().map(|device| read_device(session, device, args, enable))).await;
    let succeeded = results.into_iter().filter(|ok| *ok).count();
    if succeeded == 0 && session.is_active() {
        bail!("No device produced a reading");
    }
    Ok(())
}

/// Read one device `args.count` times. Returns whether any read succeeded.
async fn read_device(session: &Session, device: &Device, args: &ReadArgs, enable: bool) -> bool {
    let registration = &device.registration;
    let address = registration.address().as_str();
    let print = |value: Option<&Value>, error: Option<String>| {
        let line = ReadingLine {
            device: &device.label,
            address,
            value,
            error,
        };
        println!("{}", line.render(args.json));
    };

    if enable && let Err(e) = session.enable(registration).await {
        warn!(device = %device.label, "enable failed: {e}");
        print(None, Some(e.to_string()));
        return false;
    }

    let mut done = 0;
    let mut succeeded = false;
    while args.wants_more(done) {
        match session.read(registration).await {
            Ok(value) => {
                print(Some(&value), None);
                succeeded = true;
            }
            Err(e) if e.is_cancelled() && !session.is_active() => break,
            Err(e) => print(None, Some(e.to_string())),
        }
        done += 1;
        if !registration.capability().is_notifying() && args.wants_more(done) {
            tokio::time::sleep(Duration::from_secs(args.pause)).await;
        }
    }

    if enable {
        session.disable(registration).await;
    }
    succeeded
}

async fn log_events(mut events: EventReceiver) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Connected {
                address,
                characteristics,
            }) => info!("{address} connected ({characteristics} characteristics)"),
            Ok(SessionEvent::Disconnected { address }) => info!("{address} disconnected"),
            Ok(SessionEvent::ConnectRetry {
                address,
                attempt,
                error,
            }) => warn!("{address} connect attempt {attempt} failed: {error}"),
            Ok(SessionEvent::ConnectionFailed { address, error }) => {
                warn!("{address} connection failed: {error}")
            }
            Ok(SessionEvent::SessionStopped { reason }) => {
                debug!("session stopped: {reason}");
                break;
            }
            Ok(event) => debug!(?event, "session event"),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                debug!("event logger lagged by {n} events")
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}
