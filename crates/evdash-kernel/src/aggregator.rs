//! [`StateAggregator`] – owner of the canonical vehicle state.
//!
//! Once per tick the aggregator polls every registered source, merges the
//! readings into a fresh [`VehicleSnapshot`] and publishes it on the
//! [`SnapshotBus`]. The previous snapshot is never touched; readers holding
//! it keep a complete, consistent value.
//!
//! Commands reach the aggregator over an mpsc channel
//! ([`AggregatorHandle::apply`]). Settings changes are applied on the tick
//! task itself, so they always land between two snapshots, never during one.
//! Hardware commands go to a worker task that applies them in order under
//! the registry's per-source lock and poll timeout; a slow device never
//! delays the next tick.
//!
//! # Degraded readings
//!
//! A degraded reading leaves every field owned by that source at its previous
//! value. A source that stays degraded longer than `stale_after_ticks` is
//! listed in the snapshot's `stale_sources`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use evdash_hal::{Ack, SourceRegistry};
use evdash_middleware::{SnapshotBus, SnapshotPublisher, snapshot_channel};
use evdash_types::{
    Command, CommandTarget, EvError, Reading, VehicleSettings, VehicleSnapshot,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::watchdog::Watchdog;

/// Cabin offset used when no dedicated cabin sensor reports.
const CABIN_OFFSET_C: f64 = 3.0;

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Tick period.
    pub interval: Duration,
    /// Ticks without a good reading before a source is listed as stale.
    pub stale_after_ticks: u64,
    /// Queued command capacity.
    pub request_capacity: usize,
    /// Snapshots buffered on the bus for slow subscribers.
    pub bus_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            stale_after_ticks: 5,
            request_capacity: 64,
            bus_capacity: evdash_middleware::DEFAULT_CAPACITY,
        }
    }
}

/// How an accepted command took effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Settings change staged; visible from the next snapshot on.
    Staged,
    /// Executed by the owning hardware source.
    Source(Ack),
}

struct ApplyRequest {
    command: Command,
    reply: oneshot::Sender<Result<ApplyOutcome, EvError>>,
}

/// Cheap, cloneable handle for submitting commands to the aggregator.
#[derive(Clone, Debug)]
pub struct AggregatorHandle {
    tx: mpsc::Sender<ApplyRequest>,
}

impl AggregatorHandle {
    /// Apply a validated command and wait for the result.
    ///
    /// # Errors
    ///
    /// - [`EvError::Channel`] if the aggregator has stopped.
    /// - Whatever the owning source returned for hardware commands.
    pub async fn apply(&self, command: Command) -> Result<ApplyOutcome, EvError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ApplyRequest { command, reply })
            .await
            .map_err(|_| EvError::Channel("aggregator stopped".to_string()))?;
        rx.await
            .map_err(|_| EvError::Channel("aggregator dropped the request".to_string()))?
    }
}

pub struct StateAggregator {
    registry: Arc<SourceRegistry>,
    publisher: SnapshotPublisher,
    working: VehicleSnapshot,
    watchdog: Watchdog,
    requests: mpsc::Receiver<ApplyRequest>,
    config: AggregatorConfig,
}

impl StateAggregator {
    /// Build an aggregator over `registry`.
    ///
    /// The bus is seeded with a baseline snapshot (`seq` 0) carrying
    /// `settings`, so readers have a complete value before the first tick.
    pub fn new(
        registry: SourceRegistry,
        settings: VehicleSettings,
        config: AggregatorConfig,
    ) -> (Self, AggregatorHandle, SnapshotBus) {
        Self::resume(registry, VehicleSnapshot::baseline(settings), config)
    }

    /// Build an aggregator that continues from `last`.
    ///
    /// The bus is seeded with `last` and the first tick publishes
    /// `last.seq + 1`. Fields of sources that never report keep the values
    /// carried by `last`.
    pub fn resume(
        registry: SourceRegistry,
        last: VehicleSnapshot,
        config: AggregatorConfig,
    ) -> (Self, AggregatorHandle, SnapshotBus) {
        let working = last;
        let (publisher, bus) = snapshot_channel(working.clone(), config.bus_capacity);
        let (tx, requests) = mpsc::channel(config.request_capacity.max(1));

        let mut watchdog = Watchdog::new();
        for (id, _, _) in registry.describe() {
            watchdog.register(&id, working.seq, config.stale_after_ticks);
        }

        let aggregator = Self {
            registry: Arc::new(registry),
            publisher,
            working,
            watchdog,
            requests,
            config,
        };
        (aggregator, AggregatorHandle { tx }, bus)
    }

    /// The state the next snapshot will be built from.
    pub fn working(&self) -> &VehicleSnapshot {
        &self.working
    }

    /// Poll, merge and publish one snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`EvError::Channel`] if the snapshot could not be published;
    /// the tick loop treats that as fatal.
    pub async fn tick(&mut self) -> Result<Arc<VehicleSnapshot>, EvError> {
        let seq = self.working.seq + 1;
        for polled in self.registry.poll_all().await {
            match polled.reading {
                Reading::Degraded { reason } => {
                    debug!(source = %polled.id, %reason, seq, "retaining previous values");
                }
                reading => {
                    self.watchdog.heartbeat(&polled.id, seq);
                    merge(&mut self.working, reading);
                }
            }
        }

        self.working.seq = seq;
        self.working.timestamp = Utc::now();
        let stale = self.watchdog.stale(seq);
        if !stale.is_empty() && stale != self.working.stale_sources {
            warn!(sources = ?stale, seq, "sources stale");
        }
        self.working.stale_sources = stale;

        self.publisher.publish(self.working.clone())
    }

    /// Apply one command to the working state or its owning source.
    ///
    /// # Errors
    ///
    /// Propagates the source's error for hardware commands, and
    /// [`EvError::Rejected`] for a settings value that does not fit.
    pub async fn apply(&mut self, command: &Command) -> Result<ApplyOutcome, EvError> {
        match command.target() {
            CommandTarget::Settings => {
                apply_setting(&mut self.working.settings, command)?;
                Ok(ApplyOutcome::Staged)
            }
            CommandTarget::Source(kind) => {
                self.registry.apply(kind, command).await.map(ApplyOutcome::Source)
            }
        }
    }

    /// Answer a queued request. Hardware commands are handed to the
    /// hardware worker so the tick loop keeps running while a device writes.
    fn handle(&mut self, request: ApplyRequest, hardware: &mpsc::UnboundedSender<ApplyRequest>) {
        match request.command.target() {
            CommandTarget::Settings => {
                let result = apply_setting(&mut self.working.settings, &request.command)
                    .map(|()| ApplyOutcome::Staged);
                answer(request.command.action(), result, request.reply);
            }
            CommandTarget::Source(_) => {
                if let Err(mpsc::error::SendError(request)) = hardware.send(request) {
                    let result = Err(EvError::Channel("hardware worker stopped".to_string()));
                    answer(request.command.action(), result, request.reply);
                }
            }
        }
    }

    /// Run the tick loop until `cancel` fires.
    ///
    /// On cancellation the request channel is closed, every command still
    /// queued is applied, and every hardware write already accepted is
    /// finished before returning.
    ///
    /// # Errors
    ///
    /// Returns the error that made a tick fail; the loop does not continue
    /// after one.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), EvError> {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            sources = self.registry.len(),
            "aggregator started"
        );
        let (hardware, queue) = mpsc::unbounded_channel();
        let worker = tokio::spawn(hardware_worker(Arc::clone(&self.registry), queue));

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "tick failed; stopping aggregator");
                        break Err(e);
                    }
                }
                Some(request) = self.requests.recv() => self.handle(request, &hardware),
            }
        };

        self.requests.close();
        let mut drained = 0usize;
        while let Some(request) = self.requests.recv().await {
            self.handle(request, &hardware);
            drained += 1;
        }
        drop(hardware);
        if let Err(e) = worker.await {
            warn!(error = %e, "hardware worker failed");
        }
        info!(drained, last_seq = self.working.seq, "aggregator stopped");
        result
    }
}

/// Applies hardware commands one at a time, in arrival order.
async fn hardware_worker(
    registry: Arc<SourceRegistry>,
    mut queue: mpsc::UnboundedReceiver<ApplyRequest>,
) {
    while let Some(ApplyRequest { command, reply }) = queue.recv().await {
        let result = match command.target() {
            CommandTarget::Source(kind) => registry
                .apply(kind, &command)
                .await
                .map(ApplyOutcome::Source),
            CommandTarget::Settings => Err(EvError::Rejected(format!(
                "{} is not a hardware command",
                command.action()
            ))),
        };
        answer(command.action(), result, reply);
    }
}

fn answer(
    action: &'static str,
    result: Result<ApplyOutcome, EvError>,
    reply: oneshot::Sender<Result<ApplyOutcome, EvError>>,
) {
    match &result {
        Ok(outcome) => info!(action, ?outcome, "command applied"),
        Err(e) => warn!(action, error = %e, "command failed"),
    }
    if reply.send(result).is_err() {
        debug!(action, "requester went away before the reply");
    }
}

fn merge(state: &mut VehicleSnapshot, reading: Reading) {
    match reading {
        Reading::Climate(sample) => {
            state.ambient_temp = sample.ambient_temp;
            state.humidity = sample.humidity;
            state.cabin_temp = sample
                .cabin_temp
                .unwrap_or(((sample.ambient_temp - CABIN_OFFSET_C) * 10.0).round() / 10.0);
        }
        Reading::VehicleBus(frame) => {
            state.speed = frame.speed;
            state.range_km = frame.range_km;
            state.wheel_speed = frame.wheel_speed;
            state.efficiency_score = frame.efficiency_score;
            state.battery_soc = frame.battery_soc;
            state.battery_voltage = frame.battery_voltage;
            state.battery_current = frame.battery_current;
            state.battery_soh = frame.battery_soh;
            state.battery_cells = frame.battery_cells;
            state.motor_rpm = frame.motor_rpm;
            state.motor_temp = frame.motor_temp;
            state.power_kw = frame.power_kw;
            state.tire_pressure = frame.tire_pressure;
            state.connectivity.can_bus = frame.can_online;
            state.connectivity.wifi = frame.wifi;
        }
        Reading::Gps(fix) => state.gps = fix,
        Reading::Media(media) => {
            state.connectivity.bluetooth = media.connected;
            state.media = media;
        }
        Reading::Parking(parking) => state.parking = parking,
        Reading::Degraded { .. } => {}
    }
}

fn apply_setting(settings: &mut VehicleSettings, command: &Command) -> Result<(), EvError> {
    match command {
        Command::SetChargeLimit { value } => settings.charge_limit = percent(command, *value)?,
        Command::SetRegenLevel { value } => settings.regen_level = *value,
        Command::SetDriveMode { value } => settings.drive_mode = *value,
        Command::SetBrightness { value } => settings.brightness = percent(command, *value)?,
        Command::SetTheme { value } => settings.light_theme = *value,
        Command::TogglePredictions { value } => settings.predictions_on = *value,
        Command::SetTwinMode { value } => settings.twin_mode = *value,
        _ => {}
    }
    Ok(())
}

fn percent(command: &Command, value: i64) -> Result<u8, EvError> {
    u8::try_from(value)
        .map_err(|_| EvError::Rejected(format!("{} value {value} out of range", command.action())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use evdash_hal::{HardwareSource, MediaController, MediaDevice, SimRegistry};
    use evdash_types::{ClimateSample, DriveMode, GpsUpdate, SourceKind};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Climate source whose health is switched from the test.
    struct Flaky {
        healthy: Arc<AtomicBool>,
    }

    impl HardwareSource for Flaky {
        fn id(&self) -> &str {
            "flaky_climate"
        }
        fn kind(&self) -> SourceKind {
            SourceKind::Climate
        }
        fn is_synthetic(&self) -> bool {
            false
        }
        fn poll(&mut self) -> Reading {
            if self.healthy.load(Ordering::SeqCst) {
                Reading::Climate(ClimateSample {
                    ambient_temp: 31.0,
                    humidity: 44.0,
                    cabin_temp: None,
                })
            } else {
                Reading::Degraded {
                    reason: "checksum".to_string(),
                }
            }
        }
    }

    fn config() -> AggregatorConfig {
        AggregatorConfig {
            interval: Duration::from_millis(20),
            stale_after_ticks: 2,
            ..AggregatorConfig::default()
        }
    }

    #[tokio::test]
    async fn ticks_are_sequenced_from_one() {
        let (mut agg, _handle, bus) =
            StateAggregator::new(SimRegistry::full().build(), VehicleSettings::default(), config());
        assert_eq!(bus.latest().seq, 0);
        assert_eq!(agg.tick().await.unwrap().seq, 1);
        assert_eq!(agg.tick().await.unwrap().seq, 2);
        assert_eq!(bus.latest().seq, 2);
    }

    #[tokio::test]
    async fn degraded_source_retains_previous_values() {
        let healthy = Arc::new(AtomicBool::new(true));
        let registry = SimRegistry::builder()
            .with_source(Box::new(Flaky {
                healthy: Arc::clone(&healthy),
            }))
            .with_gnss()
            .build();
        let (mut agg, _handle, _bus) =
            StateAggregator::new(registry, VehicleSettings::default(), config());

        let first = agg.tick().await.unwrap();
        assert_eq!(first.ambient_temp, 31.0);
        assert_eq!(first.cabin_temp, 28.0);

        healthy.store(false, Ordering::SeqCst);
        let second = agg.tick().await.unwrap();
        assert_eq!(second.ambient_temp, first.ambient_temp);
        assert_eq!(second.humidity, first.humidity);
        assert_ne!(second.gps.latitude, 0.0);
        // The earlier snapshot is untouched.
        assert_eq!(first.seq, 1);
    }

    #[tokio::test]
    async fn silent_source_becomes_stale_then_recovers() {
        let healthy = Arc::new(AtomicBool::new(false));
        let registry = SimRegistry::builder()
            .with_source(Box::new(Flaky {
                healthy: Arc::clone(&healthy),
            }))
            .build();
        let (mut agg, _handle, _bus) =
            StateAggregator::new(registry, VehicleSettings::default(), config());

        assert!(agg.tick().await.unwrap().stale_sources.is_empty());
        agg.tick().await.unwrap();
        let third = agg.tick().await.unwrap();
        assert_eq!(third.stale_sources, vec!["flaky_climate".to_string()]);

        healthy.store(true, Ordering::SeqCst);
        assert!(agg.tick().await.unwrap().stale_sources.is_empty());
    }

    #[tokio::test]
    async fn settings_are_staged_for_next_snapshot() {
        let (mut agg, _handle, bus) =
            StateAggregator::new(SimRegistry::full().build(), VehicleSettings::default(), config());
        agg.tick().await.unwrap();

        let outcome = agg.apply(&Command::SetChargeLimit { value: 90 }).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Staged);
        assert_eq!(bus.latest().settings.charge_limit, 80);

        let next = agg.tick().await.unwrap();
        assert_eq!(next.settings.charge_limit, 90);
    }

    #[tokio::test]
    async fn injected_gps_appears_in_next_snapshot() {
        let (mut agg, _handle, _bus) =
            StateAggregator::new(SimRegistry::full().build(), VehicleSettings::default(), config());
        agg.tick().await.unwrap();
        agg.apply(&Command::UpdateGps(GpsUpdate {
            latitude: 12.9,
            longitude: 77.5,
            altitude: None,
            speed: None,
            heading: None,
            accuracy: None,
        }))
        .await
        .unwrap();
        let next = agg.tick().await.unwrap();
        assert_eq!(next.gps.latitude, 12.9);
        assert_eq!(next.gps.longitude, 77.5);
    }

    #[tokio::test]
    async fn media_state_feeds_bluetooth_flag() {
        let (mut agg, _handle, _bus) =
            StateAggregator::new(SimRegistry::full().build(), VehicleSettings::default(), config());
        assert!(!agg.tick().await.unwrap().connectivity.bluetooth);
        agg.apply(&Command::ConnectBluetooth {
            device_address: "AA:BB:CC:DD:EE:FF".to_string(),
        })
        .await
        .unwrap();
        let next = agg.tick().await.unwrap();
        assert!(next.connectivity.bluetooth);
        assert!(next.media.connected);
    }

    #[tokio::test]
    async fn run_answers_requests_and_drains_on_shutdown() {
        let (agg, handle, bus) =
            StateAggregator::new(SimRegistry::full().build(), VehicleSettings::default(), config());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(agg.run(cancel.clone()));

        let outcome = handle
            .apply(Command::SetDriveMode {
                value: DriveMode::Sport,
            })
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Staged);

        let mut rx = bus.subscribe();
        let snapshot = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.settings.drive_mode, DriveMode::Sport);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let err = handle.apply(Command::PlayMusic).await.unwrap_err();
        assert!(matches!(err, EvError::Channel(_)));
    }

    #[tokio::test]
    async fn hardware_command_without_source_fails() {
        let (mut agg, _handle, _bus) = StateAggregator::new(
            SimRegistry::builder().with_climate().build(),
            VehicleSettings::default(),
            config(),
        );
        assert!(matches!(
            agg.apply(&Command::PlayMusic).await,
            Err(EvError::HardwareFault { .. })
        ));
    }

    #[tokio::test]
    async fn unvalidated_setting_outside_a_byte_is_rejected() {
        let (mut agg, _handle, _bus) =
            StateAggregator::new(SimRegistry::full().build(), VehicleSettings::default(), config());
        assert!(matches!(
            agg.apply(&Command::SetBrightness { value: 300 }).await,
            Err(EvError::Rejected(_))
        ));
        assert_eq!(agg.working().settings.brightness, 60);
    }

    /// Head unit that takes far longer than the poll timeout to answer.
    struct StuckHeadUnit;

    impl MediaDevice for StuckHeadUnit {
        fn write(&mut self, _command: &Command) -> Result<(), EvError> {
            std::thread::sleep(Duration::from_millis(600));
            Ok(())
        }
    }

    #[tokio::test]
    async fn slow_device_write_does_not_stall_ticks() {
        let registry = SimRegistry::builder()
            .with_poll_timeout(Duration::from_millis(100))
            .with_source(Box::new(MediaController::with_device(Box::new(StuckHeadUnit))))
            .with_climate()
            .build();
        let (agg, handle, bus) = StateAggregator::new(
            registry,
            VehicleSettings::default(),
            AggregatorConfig {
                interval: Duration::from_millis(20),
                ..AggregatorConfig::default()
            },
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(agg.run(cancel.clone()));
        let mut rx = bus.subscribe();
        rx.recv().await.unwrap();

        let command = tokio::spawn(async move { handle.apply(Command::PlayMusic).await });

        let mut last = tokio::time::Instant::now();
        let mut largest = Duration::ZERO;
        for _ in 0..15 {
            tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            largest = largest.max(last.elapsed());
            last = tokio::time::Instant::now();
        }
        assert!(largest < Duration::from_millis(200), "tick gap {largest:?}");

        let err = command.await.unwrap().unwrap_err();
        match err {
            EvError::HardwareFault { details, .. } => assert!(details.contains("exceeded")),
            other => panic!("expected timeout, got {other:?}"),
        }
        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn back_to_back_media_commands_both_apply() {
        let (agg, handle, _bus) =
            StateAggregator::new(SimRegistry::full().build(), VehicleSettings::default(), config());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(agg.run(cancel.clone()));

        let (play, next) = tokio::join!(
            handle.apply(Command::PlayMusic),
            handle.apply(Command::NextTrack)
        );
        assert_eq!(play.unwrap(), ApplyOutcome::Source(Ack::Mirrored));
        assert_eq!(next.unwrap(), ApplyOutcome::Source(Ack::Mirrored));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn resume_continues_sequence_and_values() {
        let (mut agg, _handle, _bus) =
            StateAggregator::new(SimRegistry::full().build(), VehicleSettings::default(), config());
        let mut last = (*agg.tick().await.unwrap()).clone();
        last.seq = 41;
        last.battery_soc = 55.5;
        last.settings.charge_limit = 70;

        let (mut resumed, _handle, bus) = StateAggregator::resume(
            SimRegistry::builder().with_climate().build(),
            last,
            config(),
        );
        assert_eq!(bus.latest().seq, 41);
        let next = resumed.tick().await.unwrap();
        assert_eq!(next.seq, 42);
        assert_eq!(next.battery_soc, 55.5);
        assert_eq!(next.settings.charge_limit, 70);
    }
}
