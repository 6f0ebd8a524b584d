//! Client for the instrument's binary UDP acquisition protocol.
//!
//! `cbsdk` receives the instrument's datagram stream, slices it into
//! packets, keeps an in-process mirror of the device configuration and
//! dispatches decoded packets to registered callbacks. Configuration
//! operations are blocking request/reply exchanges layered on the same
//! pipeline.
//!
//! # Architecture
//!
//! ```text
//! wire ─► I/O thread (receive) ─► handoff queue ─► dispatcher thread
//!                                                   ├─► config mirror
//!                                                   ├─► pending requests
//!                                                   └─► callbacks
//! API call ─► outbound queue ─► I/O thread (send) ─► wire
//! ```
//!
//! The I/O thread runs a single-threaded tokio runtime with one receive
//! and one send activity. The dispatcher runs on its own thread so a slow
//! callback can only fill the bounded handoff queue; once it is full the
//! newest packets are dropped and counted.
//!
//! # Example
//!
//! ```rust,no_run
//! use cbsdk::{ChannelSetting, PacketKey, SdkError};
//!
//! fn main() -> Result<(), SdkError> {
//!     let params = cbsdk::create_params()?.build()?;
//!     let device = cbsdk::get_device(params);
//!     let run_level = cbsdk::connect(&device, true)?;
//!     println!("instrument is {:?}", run_level);
//!
//!     let handle = cbsdk::register_callback(&device, PacketKey::Group(5), |packet| {
//!         println!("{} samples at t={}", packet.header.dlen / 2, packet.header.time);
//!         Ok(())
//!     });
//!
//!     let config = cbsdk::get_config(&device, false)?;
//!     println!("{} channels", config.channel_infos.len());
//!     cbsdk::set_channel_config(&device, 1, ChannelSetting::SampleGroup(5))?;
//!
//!     cbsdk::unregister_callback(&device, handle);
//!     cbsdk::disconnect(&device);
//!     Ok(())
//! }
//! ```

// Core types and error handling
mod error;
pub mod mirror;
pub mod packet;
pub mod params;
pub mod stats;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;

// Pipeline
pub mod coordinator;
pub mod device;
pub mod dispatch;
pub mod io;
pub mod registry;

pub use coordinator::{Coordinator, ReplyClassifier};
pub use device::{
    ChannelSetting, ConnectionState, Device, HoopSetting, SpikeSetting, Subscription,
};
pub use error::*;
pub use io::TransportLayer;
pub use mirror::{ChannelType, ConfigMirror, DeviceConfig, DumpSummary, MonitorState, RunLevel};
pub use packet::{
    ChannelInfo, Command, Comment, DecoderFn, Hoop, PacketBody, PacketHeader, PacketKey,
    TypedPacket,
};
pub use params::{Params, ParamsBuilder, create_params};
pub use registry::{CallbackHandle, PacketVariant};
pub use stats::{DeviceEvent, StatsSnapshot};

/// Create a device handle. Nothing touches the network until [`connect`].
pub fn get_device(params: Params) -> Device {
    Device::new(params)
}

/// See [`Device::connect`].
pub fn connect(device: &Device, startup_sequence: bool) -> Result<RunLevel> {
    device.connect(startup_sequence)
}

pub fn disconnect(device: &Device) {
    device.disconnect()
}

/// See [`Device::get_config`].
pub fn get_config(device: &Device, force_refresh: bool) -> Result<DeviceConfig> {
    device.get_config(force_refresh)
}

/// See [`Device::set_channel_config`].
pub fn set_channel_config(
    device: &Device,
    channel: u32,
    setting: ChannelSetting,
) -> Result<ChannelInfo> {
    device.set_channel_config(channel, setting)
}

pub fn register_callback<F>(device: &Device, key: PacketKey, callback: F) -> CallbackHandle
where
    F: Fn(&TypedPacket) -> anyhow::Result<()> + Send + Sync + 'static,
{
    device.register_callback(key, callback)
}

pub fn unregister_callback(device: &Device, handle: CallbackHandle) -> bool {
    device.unregister_callback(handle)
}

/// See [`Device::set_all_channels_config`].
pub fn set_all_channels_config(
    device: &Device,
    channel_type: ChannelType,
    setting: ChannelSetting,
) -> Result<Vec<ChannelInfo>> {
    device.set_all_channels_config(channel_type, setting)
}

/// See [`Device::send_comment`].
pub fn send_comment(device: &Device, text: &str, time_started: Option<u64>) -> Result<()> {
    device.send_comment(text, time_started)
}

pub fn get_monitor_state(device: &Device) -> MonitorState {
    device.get_monitor_state()
}
