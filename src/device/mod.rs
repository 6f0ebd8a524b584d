//! Device handle: connection lifecycle and the public device API.
//!
//! A [`Device`] owns the configuration mirror, callback registry and
//! request coordinator for one instrument. `connect` starts the I/O and
//! dispatcher threads; blocking operations layer request/reply exchanges on
//! top of them through the coordinator.

use crossbeam_channel::Sender;
use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::{ReceiverStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::{Coordinator, ReplyClassifier};
use crate::dispatch::{DispatchTargets, Dispatcher};
use crate::error::{Result, SdkError};
use crate::io::{
    IoThreadConfig, Outbound, OutboundSender, TransportLayer, UdpTransport, handoff,
    outbound_queue, spawn_io_thread,
};
use crate::mirror::{
    ChannelType, ConfigMirror, DeviceConfig, MonitorState, RunLevel, ainp_opts, spk_opts,
    transport,
};
use crate::packet::{
    ChannelInfo, ChannelScope, Command, Comment, DecoderFn, DecoderTable, Hoop, MAX_HOOPS,
    MAX_UNITS, PacketBody, PacketHeader, PacketKey, TypedPacket, types,
};
use crate::params::Params;
use crate::registry::{CallbackHandle, CallbackRegistry, PacketVariant};
use crate::stats::{DeviceEvent, PipelineStats, StatsSnapshot};


/// Capacity of the diagnostic event channel
const EVENT_CAPACITY: usize = 1024;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Disconnected,
    /// Threads running, startup handshake in progress
    Connecting,
    Connected,
    Disconnecting,
}

/// A change to one channel's configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSetting {
    Label(String),
    /// Sampling group 0..=6; 0 disables continuous sampling
    SampleGroup(u32),
    AutoThreshold(bool),
    LineNoiseCancellation(bool),
    DcOffset(bool),
    /// Enabling also resets sorting to manual hoops
    SpikeExtraction(bool),
    SpikeThreshold(i32),
    SpikeFilter(u32),
    Hoops(Vec<HoopSetting>),
    /// Stop sampling, spike extraction and every analog input option
    Disabled,
    /// Replace the whole record
    Full(ChannelInfo),
}

/// A change to one channel's spike processing.
#[derive(Debug, Clone, PartialEq)]
pub enum SpikeSetting {
    Extraction(bool),
    AutoThreshold(bool),
    Threshold(i32),
    Filter(u32),
    Hoops(Vec<HoopSetting>),
}

impl From<SpikeSetting> for ChannelSetting {
    fn from(setting: SpikeSetting) -> Self {
        match setting {
            SpikeSetting::Extraction(enable) => ChannelSetting::SpikeExtraction(enable),
            SpikeSetting::AutoThreshold(enable) => ChannelSetting::AutoThreshold(enable),
            SpikeSetting::Threshold(level) => ChannelSetting::SpikeThreshold(level),
            SpikeSetting::Filter(filter) => ChannelSetting::SpikeFilter(filter),
            SpikeSetting::Hoops(hoops) => ChannelSetting::Hoops(hoops),
        }
    }
}

/// One hoop of one sorting unit; `unit` and `hoop` are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoopSetting {
    pub unit: usize,
    pub hoop: usize,
    pub value: Hoop,
}

/// Threads and queues of one connection.
struct Session {
    io: JoinHandle<()>,
    dispatch: JoinHandle<()>,
    cancel: CancellationToken,
    stop: Sender<()>,
    outbound: OutboundSender,
    local_addr: SocketAddr,
}

/// Handle to one instrument.
pub struct Device {
    params: Params,
    mirror: Arc<ConfigMirror>,
    registry: Arc<CallbackRegistry>,
    coordinator: Arc<Coordinator>,
    stats: Arc<PipelineStats>,
    events: broadcast::Sender<DeviceEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
    decoders: Mutex<DecoderTable>,
    transport_layer: Mutex<Option<TransportLayer>>,
    session: Mutex<Option<Session>>,
}

impl Device {
    pub fn new(params: Params) -> Self {
        let stats = Arc::new(PipelineStats::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            params,
            mirror: Arc::new(ConfigMirror::new()),
            registry: Arc::new(CallbackRegistry::new()),
            coordinator: Arc::new(Coordinator::new(stats.clone())),
            stats,
            events,
            state: Arc::new(state),
            decoders: Mutex::new(DecoderTable::default()),
            transport_layer: Mutex::new(None),
            session: Mutex::new(None),
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    // Lifecycle

    /// Bind the socket, start the pipeline and run the startup handshake.
    ///
    /// With `startup` the instrument is brought to RUNNING (hard reset and
    /// reset as needed) and the configuration is loaded. Without it the run
    /// level is only queried. Returns the run level the instrument reported.
    /// On failure the pipeline is torn down again.
    pub fn connect(&self, startup: bool) -> Result<RunLevel> {
        let outbound = {
            let mut session = self.session.lock();
            let state = self.state();
            if state != ConnectionState::Disconnected {
                return Err(SdkError::state("connect", state));
            }
            if let Some(stale) = session.take() {
                debug!("Cleaning up session left by a socket fault");
                self.teardown(stale);
            }

            self.state.send_replace(ConnectionState::Connecting);
            match self.open() {
                Ok(opened) => {
                    let outbound = opened.outbound.clone();
                    info!(
                        local = %opened.local_addr,
                        remote = %self.params.remote(),
                        "Device pipeline started"
                    );
                    *session = Some(opened);
                    outbound
                }
                Err(e) => {
                    self.state.send_replace(ConnectionState::Disconnected);
                    return Err(e);
                }
            }
        };

        let handshake = if startup {
            self.startup_sequence(&outbound)
        } else {
            self.query_run_level(&outbound)
        };

        let run_level = match handshake {
            Ok(run_level) => run_level,
            Err(e) => {
                error!(error = %e, "Device did not complete the startup handshake");
                self.disconnect();
                return Err(e);
            }
        };

        let promoted = self.state.send_if_modified(|state| {
            let connecting = *state == ConnectionState::Connecting;
            if connecting {
                *state = ConnectionState::Connected;
            }
            connecting
        });
        if !promoted {
            // A socket fault or a concurrent disconnect won the race
            self.disconnect();
            return Err(SdkError::Disconnected);
        }

        info!(?run_level, "Device connected");
        Ok(run_level)
    }

    fn open(&self) -> Result<Session> {
        let params = &self.params;
        let socket = UdpTransport::bind(params.local(), params.recv_buf_size)?;
        let local_addr = socket.local_addr().map_err(|e| SdkError::socket("local_addr", e))?;

        let (handoff_tx, handoff_rx) = handoff(params.queue_capacity, self.stats.clone());
        let (outbound_tx, outbound_rx) = outbound_queue();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let cancel = CancellationToken::new();

        let dispatcher = Dispatcher::new(DispatchTargets {
            decoders: Arc::new(self.decoders.lock().clone()),
            mirror: self.mirror.clone(),
            registry: self.registry.clone(),
            coordinator: self.coordinator.clone(),
            stats: self.stats.clone(),
            events: self.events.clone(),
        });
        let dispatch = dispatcher
            .spawn(handoff_rx, stop_rx)
            .map_err(|e| SdkError::socket("spawn dispatcher", e))?;

        let config = IoThreadConfig {
            remote: params.remote(),
            handoff: handoff_tx,
            outbound: outbound_rx,
            stats: self.stats.clone(),
            events: self.events.clone(),
            max_datagram_size: params.max_datagram_size,
            cancel: cancel.clone(),
            layer: self.transport_layer.lock().clone(),
        };
        let io = match spawn_io_thread(socket, config, self.fault_handler()) {
            Ok(io) => io,
            Err(e) => {
                let _ = stop_tx.send(());
                let _ = dispatch.join();
                return Err(SdkError::socket("spawn io thread", e));
            }
        };

        Ok(Session { io, dispatch, cancel, stop: stop_tx, outbound: outbound_tx, local_addr })
    }

    /// Runs on the I/O thread when the ingestion loop ends.
    fn fault_handler(&self) -> impl FnOnce(Result<()>) + Send + 'static {
        let state = self.state.clone();
        let coordinator = self.coordinator.clone();
        let events = self.events.clone();
        move |result| {
            let Err(e) = result else {
                return;
            };
            error!(error = %e, "Socket fault, leaving connected state");
            let _ = events.send(DeviceEvent::SocketFault { reason: e.to_string() });
            state.send_if_modified(|state| {
                let live =
                    matches!(*state, ConnectionState::Connecting | ConnectionState::Connected);
                if live {
                    *state = ConnectionState::Disconnected;
                }
                live
            });
            coordinator.fail_all();
        }
    }

    /// Stop both threads, fail pending requests and clear the mirror.
    ///
    /// Packets still queued for the dispatcher are discarded. Does nothing
    /// when not connected.
    pub fn disconnect(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };
        self.state.send_replace(ConnectionState::Disconnecting);
        self.teardown(session);
        self.state.send_replace(ConnectionState::Disconnected);
        info!(stats = ?self.stats.snapshot(), "Device disconnected");
    }

    fn teardown(&self, session: Session) {
        let Session { io, dispatch, cancel, stop, outbound, local_addr } = session;
        debug!(local = %local_addr, "Stopping device pipeline");

        cancel.cancel();
        let _ = stop.send(());
        drop(outbound);
        self.coordinator.fail_all();

        if io.join().is_err() {
            warn!("I/O thread panicked");
        }
        if dispatch.thread().id() == thread::current().id() {
            // Called from a callback; the dispatcher exits once this returns
            warn!("disconnect called from a callback, not joining the dispatcher");
        } else if dispatch.join().is_err() {
            warn!("Dispatcher thread panicked");
        }

        self.coordinator.fail_all();
        self.mirror.clear();
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Stream of connection states, starting with the current one.
    pub fn state_updates(&self) -> WatchStream<ConnectionState> {
        WatchStream::new(self.state.subscribe())
    }

    /// Local socket address while a session is open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.session.lock().as_ref().map(|s| s.local_addr)
    }

    /// Outbound queue of the current session, if connected.
    fn connected(&self, operation: &str) -> Result<OutboundSender> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(SdkError::state(operation, state));
        }
        let session = self.session.lock();
        let session = session.as_ref().ok_or_else(|| SdkError::state(operation, state))?;
        Ok(session.outbound.clone())
    }

    fn request(
        &self,
        outbound: &OutboundSender,
        command: &Command,
        classifier: ReplyClassifier,
        key: Option<u32>,
        timeout: Duration,
    ) -> Result<TypedPacket> {
        self.coordinator.send_and_wait(
            outbound,
            command,
            self.mirror.device_time(),
            classifier,
            key,
            timeout,
        )
    }

    // Run level

    /// Bring the instrument to RUNNING and load its configuration.
    ///
    /// Later steps still run when an earlier one fails; if no run level is
    /// known at the end, the last step's error is returned.
    fn startup_sequence(&self, outbound: &OutboundSender) -> Result<RunLevel> {
        let run_level = self.request_run_level(outbound, RunLevel::Running)?;
        let mut last_error = None;

        if run_level != RunLevel::Running {
            // Cold boot; the instrument answers a hard reset with STANDBY
            info!(?run_level, "Instrument not running, issuing hard reset");
            if let Err(e) = self.request_run_level(outbound, RunLevel::HardReset) {
                warn!(error = %e, "No STANDBY report after hard reset");
                last_error = Some(e);
            }
        }

        if let Err(e) = self.refresh_config(outbound) {
            warn!(error = %e, "Configuration refresh during startup incomplete");
            last_error = Some(e);
        }

        if self.cached_run_level() != Some(RunLevel::Running) {
            info!("Instrument not running after configuration, issuing reset");
            if let Err(e) = self.request_run_level(outbound, RunLevel::Reset) {
                warn!(error = %e, "No RUNNING report after reset");
                last_error = Some(e);
            }
        }

        // Only a concurrent teardown clears the level the first step cached
        self.cached_run_level().ok_or_else(|| last_error.unwrap_or(SdkError::Disconnected))
    }

    fn query_run_level(&self, outbound: &OutboundSender) -> Result<RunLevel> {
        self.request_run_level(outbound, RunLevel::Running)
    }

    /// Send a run-level change and wait for the report it produces.
    ///
    /// A hard reset completes on a STANDBY report and a reset on a RUNNING
    /// report; any other level completes on the next run-level report.
    fn request_run_level(
        &self,
        outbound: &OutboundSender,
        run_level: RunLevel,
    ) -> Result<RunLevel> {
        let (key, timeout) = match run_level {
            RunLevel::HardReset => (Some(RunLevel::Standby), self.params.reply_timeout()),
            RunLevel::Reset => (Some(RunLevel::Running), self.params.config_timeout()),
            _ => (None, self.params.reply_timeout()),
        };
        debug!(?run_level, ?key, "Setting run level");
        let reply = self.request(
            outbound,
            &Command::set_run_level(run_level),
            ReplyClassifier::RunLevel,
            key.map(RunLevel::as_raw),
            timeout,
        )?;
        Ok(self.cached_run_level().unwrap_or_else(|| reply_run_level(&reply)))
    }

    fn cached_run_level(&self) -> Option<RunLevel> {
        self.mirror.read(|config| config.run_level)
    }

    /// Request a run-level change and return the level the instrument
    /// reports afterwards.
    pub fn set_runlevel(&self, run_level: RunLevel) -> Result<RunLevel> {
        let outbound = self.connected("set_runlevel")?;
        self.request_run_level(&outbound, run_level)
    }

    /// Last reported run level, or a fresh report with `force_refresh`.
    ///
    /// The refresh re-requests RUNNING, which the instrument answers with its
    /// current level.
    pub fn get_runlevel(&self, force_refresh: bool) -> Result<Option<RunLevel>> {
        if force_refresh {
            let outbound = self.connected("get_runlevel")?;
            return self.query_run_level(&outbound).map(Some);
        }
        Ok(self.cached_run_level())
    }

    /// Hard reset: returns once the instrument reports STANDBY.
    pub fn reset(&self) -> Result<RunLevel> {
        self.set_runlevel(RunLevel::HardReset)
    }

    // Transport

    /// Set or clear [`transport`] flags and return the reported flags.
    pub fn set_transport(&self, flags: u16, enable: bool) -> Result<u16> {
        let outbound = self.connected("set_transport")?;
        let current = self.mirror.read(|config| config.transport);
        let transport = if enable { current | flags } else { current & !flags };
        debug!(flags, enable, transport, "Setting transport");
        self.request(
            &outbound,
            &Command::SetTransport { transport },
            ReplyClassifier::Transport,
            None,
            self.params.reply_timeout(),
        )?;
        Ok(self.mirror.read(|config| config.transport))
    }

    pub fn get_transport(&self, force_refresh: bool) -> Result<u16> {
        if force_refresh {
            return self.set_transport(transport::CHECK, true);
        }
        Ok(self.mirror.read(|config| config.transport))
    }

    // Configuration

    /// Current configuration.
    ///
    /// Without `force_refresh` this is a snapshot of the mirror and never
    /// touches the network. With it, a full configuration dump is requested
    /// and the call returns once the dump has been received and every
    /// announced channel reported. The previous records stay visible until
    /// the dump completes and are kept if it never does.
    pub fn get_config(&self, force_refresh: bool) -> Result<DeviceConfig> {
        if force_refresh {
            let outbound = self.connected("get_config")?;
            self.refresh_config(&outbound)?;
        }
        Ok(self.mirror.snapshot())
    }

    fn refresh_config(&self, outbound: &OutboundSender) -> Result<()> {
        let previous = self.mirror.last_dump().map_or(0, |dump| dump.sequence);
        let reply = self.request(
            outbound,
            &Command::RequestConfigAll,
            ReplyClassifier::ConfigDump,
            None,
            self.params.config_timeout(),
        );

        // A dump committed by the dispatcher is authoritative even when the
        // closing report was lost
        let (received, expected) = match self.mirror.last_dump() {
            Some(dump) if dump.sequence > previous => (dump.received, dump.expected),
            _ => {
                reply?;
                self.mirror
                    .read(|config| (config.channel_infos.len(), config.proc_chans as usize))
            }
        };
        if expected == 0 || received != expected {
            return Err(SdkError::IncompleteConfig { received, expected });
        }
        debug!(channels = received, "Configuration refreshed");
        Ok(())
    }

    /// Apply `setting` to channel `chan` and return the confirmed record.
    ///
    /// Blocks until the instrument echoes every write. Fails with
    /// [`SdkError::UnknownChannel`] if the channel has not been reported.
    pub fn set_channel_config(&self, chan: u32, setting: ChannelSetting) -> Result<ChannelInfo> {
        let outbound = self.connected("set_channel_config")?;
        let mut info = self
            .mirror
            .read(|config| config.channel_infos.get(&chan).cloned())
            .ok_or(SdkError::UnknownChannel { channel: chan })?;

        let scope = match setting {
            ChannelSetting::Label(label) => {
                info.label = label;
                ChannelScope::Label
            }
            ChannelSetting::SampleGroup(group) => {
                if group == 0 || group == 6 {
                    // Raw stream follows group 6 membership
                    set_flag(&mut info.ainp_opts, ainp_opts::REFELEC_RAWSTREAM, group != 0);
                    info = self.write_channel(&outbound, ChannelScope::AnalogInput, info)?;
                }
                info.smp_group = group;
                info.smp_filter = 0;
                ChannelScope::Sampling
            }
            ChannelSetting::AutoThreshold(enable) => {
                set_flag(&mut info.spk_opts, spk_opts::THRAUTO, enable);
                ChannelScope::AutoThreshold
            }
            ChannelSetting::LineNoiseCancellation(enable) => {
                set_flag(&mut info.ainp_opts, ainp_opts::LNC_MASK, enable);
                ChannelScope::AnalogInput
            }
            ChannelSetting::DcOffset(enable) => {
                set_flag(&mut info.ainp_opts, ainp_opts::REFELEC_OFFSETCORRECT, enable);
                ChannelScope::AnalogInput
            }
            ChannelSetting::SpikeExtraction(enable) => {
                set_flag(&mut info.spk_opts, spk_opts::EXTRACT, enable);
                if enable {
                    info.spk_opts = (info.spk_opts & !spk_opts::ALLSORT) | spk_opts::HOOPSORT;
                }
                ChannelScope::Spike
            }
            ChannelSetting::SpikeThreshold(level) => {
                info.spk_thr_level = level;
                ChannelScope::SpikeThreshold
            }
            ChannelSetting::SpikeFilter(filter) => {
                info.spk_filter = filter;
                ChannelScope::Spike
            }
            ChannelSetting::Hoops(hoops) => {
                for setting in hoops {
                    let slot = hoop_slot(&mut info, setting.unit, setting.hoop)?;
                    *slot = setting.value;
                }
                ChannelScope::Hoops
            }
            ChannelSetting::Disabled => {
                set_flag(&mut info.spk_opts, spk_opts::EXTRACT | spk_opts::THRAUTO, false);
                set_flag(
                    &mut info.ainp_opts,
                    ainp_opts::LNC_MASK
                        | ainp_opts::REFELEC_MASK
                        | ainp_opts::REFELEC_RAWSTREAM
                        | ainp_opts::REFELEC_OFFSETCORRECT,
                    false,
                );
                info.smp_group = 0;
                info.smp_filter = 0;
                ChannelScope::Full
            }
            ChannelSetting::Full(full) => {
                info = ChannelInfo { chan, ..full };
                ChannelScope::Full
            }
        };
        self.write_channel(&outbound, scope, info)
    }

    fn write_channel(
        &self,
        outbound: &OutboundSender,
        scope: ChannelScope,
        info: ChannelInfo,
    ) -> Result<ChannelInfo> {
        let chan = info.chan;
        debug!(chan, ?scope, "Writing channel configuration");
        self.request(
            outbound,
            &Command::SetChannel { scope, info },
            ReplyClassifier::Channel(scope.reply_type()),
            Some(chan),
            self.params.reply_timeout(),
        )?;
        self.mirror
            .read(|config| config.channel_infos.get(&chan).cloned())
            .ok_or(SdkError::UnknownChannel { channel: chan })
    }

    /// Apply a spike processing change to channel `chan`.
    pub fn set_channel_spk_config(&self, chan: u32, setting: SpikeSetting) -> Result<ChannelInfo> {
        self.set_channel_config(chan, setting.into())
    }

    /// Turn off sampling, spike extraction and analog input processing.
    pub fn set_channel_disable(&self, chan: u32) -> Result<ChannelInfo> {
        self.set_channel_config(chan, ChannelSetting::Disabled)
    }

    /// Apply `setting` to every channel of `channel_type`, in channel order.
    ///
    /// Stops at the first failed write; channels before it keep the change.
    pub fn set_all_channels_config(
        &self,
        channel_type: ChannelType,
        setting: ChannelSetting,
    ) -> Result<Vec<ChannelInfo>> {
        self.connected("set_all_channels_config")?;
        let channels = self.mirror.read(|config| config.channels_of(channel_type));
        debug!(?channel_type, count = channels.len(), "Configuring channels by type");
        channels.into_iter().map(|chan| self.set_channel_config(chan, setting.clone())).collect()
    }

    pub fn set_all_channels_spk_config(
        &self,
        channel_type: ChannelType,
        setting: SpikeSetting,
    ) -> Result<Vec<ChannelInfo>> {
        self.set_all_channels_config(channel_type, setting.into())
    }

    pub fn set_all_channels_disable(&self, channel_type: ChannelType) -> Result<Vec<ChannelInfo>> {
        self.set_all_channels_config(channel_type, ChannelSetting::Disabled)
    }

    // Comments

    /// Annotate the recording. The instrument echoes the comment to every
    /// client; this does not wait for the echo.
    ///
    /// `time_started` defaults to the current device time.
    pub fn send_comment(&self, text: &str, time_started: Option<u64>) -> Result<()> {
        let comment = Comment {
            charset: 0,
            time_started: time_started.unwrap_or_else(|| u64::from(self.mirror.device_time())),
            rgba: 0,
            text: text.to_string(),
        };
        debug!(time_started = comment.time_started, "Sending comment");
        self.send_command(Command::Comment(comment))
    }

    /// Invoke `callback` for every comment the instrument reports.
    pub fn register_comment_callback<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&PacketHeader, &Comment) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.register_typed(PacketKey::Config(types::COMMENTREP), callback)
    }

    /// Queue a command without waiting for a reply.
    pub fn send_command(&self, command: Command) -> Result<()> {
        let outbound = self.connected("send_command")?;
        let time = self.mirror.device_time();
        outbound.send(Outbound::Command { command, time }).map_err(|_| SdkError::Disconnected)
    }

    // Subscriptions

    /// Invoke `callback` on the dispatcher thread for every packet routed to
    /// `key`. Callbacks for one key run in registration order.
    pub fn register_callback<F>(&self, key: PacketKey, callback: F) -> CallbackHandle
    where
        F: Fn(&TypedPacket) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.register(key, callback)
    }

    /// Like [`Device::register_callback`] but only for packets decoded as `T`.
    pub fn register_typed<T, F>(&self, key: PacketKey, callback: F) -> CallbackHandle
    where
        T: PacketVariant,
        F: Fn(&PacketHeader, &T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.register_typed(key, callback)
    }

    /// Returns `false` if the handle was already unregistered.
    pub fn unregister_callback(&self, handle: CallbackHandle) -> bool {
        self.registry.unregister(handle)
    }

    /// Stream of packets routed to `key`, buffered up to `capacity`.
    ///
    /// Packets arriving while the buffer is full are dropped and counted as
    /// `subscriber_drops`. Dropping the stream unregisters it.
    pub fn subscribe(&self, key: PacketKey, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stats = self.stats.clone();
        let handle = self.registry.register(key, move |packet: &TypedPacket| {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(packet.clone()) {
                PipelineStats::incr(&stats.subscriber_drops);
            }
            Ok(())
        });
        Subscription { inner: ReceiverStream::new(rx), handle, registry: self.registry.clone() }
    }

    /// Add or replace the decoder for a configuration packet type.
    ///
    /// Takes effect on the next `connect`; fails while connected.
    pub fn register_decoder(
        &self,
        packet_type: u16,
        decoder: DecoderFn,
    ) -> Result<Option<DecoderFn>> {
        let state = self.state();
        if state != ConnectionState::Disconnected {
            return Err(SdkError::state("register_decoder", state));
        }
        Ok(self.decoders.lock().register(packet_type, decoder))
    }

    /// Wrap the transport of future sessions, or remove the wrapper.
    ///
    /// Takes effect on the next `connect`; fails while connected.
    pub fn set_transport_layer(&self, layer: Option<TransportLayer>) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Disconnected {
            return Err(SdkError::state("set_transport_layer", state));
        }
        *self.transport_layer.lock() = layer;
        Ok(())
    }

    // Observability

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Diagnostic events published from now on.
    pub fn events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Link-health state from the last protocol monitor packet.
    pub fn get_monitor_state(&self) -> MonitorState {
        self.mirror.monitor_state()
    }

    pub fn pending_requests(&self) -> usize {
        self.coordinator.pending_count()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("remote", &self.params.remote())
            .field("state", &self.state())
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

fn set_flag(word: &mut u32, flag: u32, enable: bool) {
    if enable {
        *word |= flag;
    } else {
        *word &= !flag;
    }
}

fn hoop_slot(info: &mut ChannelInfo, unit: usize, hoop: usize) -> Result<&mut Hoop> {
    if !(1..=MAX_UNITS).contains(&unit) || !(1..=MAX_HOOPS).contains(&hoop) {
        return Err(SdkError::config(format!(
            "hoop {hoop} of unit {unit} is outside 1..={MAX_HOOPS} of 1..={MAX_UNITS}"
        )));
    }
    Ok(&mut info.spk_hoops[unit - 1][hoop - 1])
}

fn reply_run_level(reply: &TypedPacket) -> RunLevel {
    match &reply.body {
        PacketBody::SysInfo(info) => info.run_level,
        _ => RunLevel::Other(0),
    }
}

/// Packet stream returned by [`Device::subscribe`].
pub struct Subscription {
    inner: ReceiverStream<TypedPacket>,
    handle: CallbackHandle,
    registry: Arc<CallbackRegistry>,
}

impl Subscription {
    pub fn handle(&self) -> CallbackHandle {
        self.handle
    }
}

impl Stream for Subscription {
    type Item = TypedPacket;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unregister(self.handle);
    }
}
