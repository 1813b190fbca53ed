//! MAVLink vehicle link over UDP.
//!
//! [`MavlinkVehicle`] speaks MAVLink 2 (common dialect) to a single autopilot
//! as a ground station. In server mode it binds the configured address and
//! talks to whichever peer last sent it a datagram; in client mode it sends
//! to the configured address from an ephemeral port.
//!
//! The first HEARTBEAT from a non-GCS system identifies the vehicle. After
//! that, telemetry messages from that system are decoded into the
//! [`TelemetryFeed`] and COMMAND_ACKs resolve outstanding commands.
//!
//! Commands that expect an acknowledgement are retransmitted with
//! exponential backoff until an ACK arrives or the command timeout expires.
//! COMMAND_ACK carries no request identifier, so a request that is dropped
//! before its ACK arrives leaves a marker behind: the next ACK for that
//! command is treated as stale, and the next request of the same command
//! relies on a retransmission for its own answer.
//!
//! Body-velocity set-points switch the autopilot into offboard mode and are
//! then re-sent at 10 Hz until another motion command takes over.

use crate::backoff::ExponentialBackoff;
use crate::config::{LinkConfig, LinkMode};
use crate::error::{DriverError, LinkError};
use crate::link::{BodyVelocity, TelemetryFeed, TelemetryStreams, VehicleLink};
use crate::telemetry::{Attitude, Frd, Imu, LandedState, Position, VelocityNed};
use anyhow::Context;
use bytes::{BufMut, BytesMut};
use mavlink::common::{
    MavAutopilot, MavCmd, MavFrame, MavLandedState, MavMessage, MavModeFlag, MavResult, MavState,
    MavType, PositionTargetTypemask, SerialControlDev, SerialControlFlag, ATTITUDE_DATA,
    COMMAND_ACK_DATA, COMMAND_INT_DATA, COMMAND_LONG_DATA, EXTENDED_SYS_STATE_DATA,
    GLOBAL_POSITION_INT_DATA, HEARTBEAT_DATA, HIGHRES_IMU_DATA, SERIAL_CONTROL_DATA,
    SET_POSITION_TARGET_LOCAL_NED_DATA,
};
use mavlink::peek_reader::PeekReader;
use mavlink::{MavHeader, MessageData};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::Cursor;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
/// PX4 leaves offboard mode when set-points arrive slower than 2 Hz.
const OFFBOARD_SETPOINT_INTERVAL: Duration = Duration::from_millis(100);
/// PX4_CUSTOM_MAIN_MODE_OFFBOARD
const PX4_CUSTOM_MAIN_MODE_OFFBOARD: f32 = 6.0;
const RETRANSMIT_MIN: Duration = Duration::from_millis(250);
const RETRANSMIT_MAX: Duration = Duration::from_secs(1);
const MAX_DATAGRAM: usize = 65535;
/// Payload capacity of one SERIAL_CONTROL message.
const SERIAL_CONTROL_CHUNK: usize = 70;
/// MAV_DO_REPOSITION_FLAGS_CHANGE_MODE
const REPOSITION_CHANGE_MODE: f32 = 1.0;

/// System and component id of the autopilot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VehicleId {
    pub system_id: u8,
    pub component_id: u8,
}

/// Waiter for one outstanding command, keyed by command id.
struct PendingAck {
    ticket: u64,
    /// `None` once the request was dropped without an answer.
    waiter: Option<oneshot::Sender<MavResult>>,
    /// An earlier request of this command may still be answered.
    stale: bool,
}

/// Marks the pending entry abandoned when a request ends without its ACK.
struct AckTicket<'a> {
    pending: &'a Mutex<HashMap<u32, PendingAck>>,
    key: u32,
    ticket: u64,
}

impl Drop for AckTicket<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.pending.lock().get_mut(&self.key) {
            if entry.ticket == self.ticket {
                entry.waiter = None;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct OffboardSetpoint {
    velocity: BodyVelocity,
    engaged: bool,
}

pub struct MavlinkVehicle {
    socket: UdpSocket,
    peer: RwLock<Option<SocketAddr>>,
    learn_peer: bool,
    vehicle: RwLock<Option<VehicleId>>,
    expected_system_id: Option<u8>,
    gcs_system_id: u8,
    gcs_component_id: u8,
    sequence: AtomicU8,
    pending: Mutex<HashMap<u32, PendingAck>>,
    next_ticket: AtomicU64,
    offboard: Mutex<Option<OffboardSetpoint>>,
    feed: TelemetryFeed,
    last_position: Mutex<Option<Position>>,
    takeoff_altitude: Mutex<Option<f32>>,
    command_timeout: Duration,
    stream_rate_hz: f32,
    connected: watch::Sender<bool>,
}

impl MavlinkVehicle {
    /// Binds the UDP socket described by `config`.
    ///
    /// Telemetry streams buffer up to `feed_capacity` values each.
    ///
    /// # Errors
    ///
    /// A client address that does not resolve is a configuration error; a
    /// failed bind is a network error.
    pub async fn bind(config: &LinkConfig, feed_capacity: usize) -> crate::error::Result<Self> {
        let (bind_addr, peer) = match config.mode {
            LinkMode::Server => (config.address.clone(), None),
            LinkMode::Client => {
                let target = config
                    .address
                    .to_socket_addrs()
                    .ok()
                    .and_then(|mut addrs| addrs.next())
                    .ok_or_else(|| {
                        DriverError::config(format!(
                            "Could not resolve vehicle address {}",
                            config.address
                        ))
                    })?;
                ("0.0.0.0:0".to_string(), Some(target))
            }
        };

        let socket = UdpSocket::bind(&bind_addr)
            .await
            .map_err(|e| DriverError::network(bind_addr.clone(), e))?;
        info!(
            "MAVLink link on {} ({:?} mode)",
            socket.local_addr().map(|a| a.to_string()).unwrap_or(bind_addr),
            config.mode
        );

        let (connected, _) = watch::channel(false);
        Ok(Self {
            socket,
            learn_peer: peer.is_none(),
            peer: RwLock::new(peer),
            vehicle: RwLock::new(None),
            expected_system_id: config.system_id,
            gcs_system_id: config.gcs_system_id,
            gcs_component_id: config.gcs_component_id,
            sequence: AtomicU8::new(0),
            pending: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(0),
            offboard: Mutex::new(None),
            feed: TelemetryFeed::new(feed_capacity),
            last_position: Mutex::new(None),
            takeoff_altitude: Mutex::new(None),
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            stream_rate_hz: config.stream_rate_hz,
            connected,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The autopilot, once identified.
    pub fn vehicle(&self) -> Option<VehicleId> {
        *self.vehicle.read()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Flips to `true` once the vehicle has been identified.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Waits until a vehicle heartbeat has been seen. Returns `false` on
    /// timeout.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.connected.subscribe();
        let connected = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|c| *c)).await,
            Ok(Ok(_))
        );
        connected
    }

    /// Receive loop plus the 1 Hz GCS heartbeat and the offboard set-point
    /// stream.
    ///
    /// Runs until `token` is cancelled or the socket fails.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut setpoint = tokio::time::interval(OFFBOARD_SETPOINT_INTERVAL);
        setpoint.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = heartbeat.tick() => self.send_heartbeat().await,
                _ = setpoint.tick() => self.refresh_setpoint().await,
                res = self.socket.recv_from(&mut buf) => {
                    let (len, addr) = res.context("UDP receive failed")?;
                    self.note_peer(addr);
                    for (header, msg) in parse_datagram(&buf[..len]) {
                        if self.handle_message(&header, &msg) {
                            let this = self.clone();
                            tokio::spawn(async move { this.request_streams().await });
                        }
                    }
                }
            }
        }
    }

    fn note_peer(&self, addr: SocketAddr) {
        if !self.learn_peer {
            return;
        }
        let mut peer = self.peer.write();
        if *peer != Some(addr) {
            debug!("MAVLink peer is now {}", addr);
            *peer = Some(addr);
        }
    }

    /// Applies one decoded message. Returns `true` when it identified the
    /// vehicle for the first time.
    pub(crate) fn handle_message(&self, header: &MavHeader, msg: &MavMessage) -> bool {
        let mut identified = false;
        if let MavMessage::HEARTBEAT(hb) = msg {
            if hb.mavtype == MavType::MAV_TYPE_GCS
                || hb.autopilot == MavAutopilot::MAV_AUTOPILOT_INVALID
            {
                return false;
            }
            identified = self.identify(header);
        }

        let Some(vehicle) = self.vehicle() else {
            return identified;
        };
        if header.system_id != vehicle.system_id {
            return identified;
        }

        match msg {
            MavMessage::HEARTBEAT(hb) if header.component_id == vehicle.component_id => {
                self.feed.publish_armed(is_armed(hb));
                self.feed.publish_health(is_healthy(hb));
            }
            MavMessage::GLOBAL_POSITION_INT(p) => {
                let (position, velocity) = decode_global_position(p);
                *self.last_position.lock() = Some(position);
                self.feed.publish_position(position);
                self.feed.publish_velocity(velocity);
            }
            MavMessage::HIGHRES_IMU(imu) => self.feed.publish_imu(decode_imu(imu)),
            MavMessage::ATTITUDE(att) => self.feed.publish_attitude(decode_attitude(att)),
            MavMessage::EXTENDED_SYS_STATE(state) => {
                self.feed.publish_landed(decode_landed_state(state));
            }
            MavMessage::COMMAND_ACK(ack) => self.resolve_ack(ack),
            MavMessage::SERIAL_CONTROL(reply) => {
                if let Some(text) = shell_reply_text(reply) {
                    for line in text.lines().filter(|l| !l.trim().is_empty()) {
                        debug!("shell: {}", line);
                    }
                }
            }
            _ => {}
        }
        identified
    }

    fn identify(&self, header: &MavHeader) -> bool {
        if let Some(expected) = self.expected_system_id {
            if header.system_id != expected {
                trace!("Ignoring heartbeat from system {}", header.system_id);
                return false;
            }
        }
        let mut vehicle = self.vehicle.write();
        if vehicle.is_some() {
            return false;
        }
        *vehicle = Some(VehicleId {
            system_id: header.system_id,
            component_id: header.component_id,
        });
        info!(
            "Vehicle discovered: system {} component {}",
            header.system_id, header.component_id
        );
        self.connected.send_replace(true);
        true
    }

    /// Only called for messages from the identified vehicle.
    fn resolve_ack(&self, ack: &COMMAND_ACK_DATA) {
        if ack.result == MavResult::MAV_RESULT_IN_PROGRESS {
            trace!("{:?} in progress", ack.command);
            return;
        }
        let key = ack.command as u32;
        let mut pending = self.pending.lock();
        let Some(entry) = pending.get_mut(&key) else {
            debug!("Unsolicited COMMAND_ACK for {:?}: {:?}", ack.command, ack.result);
            return;
        };
        if entry.waiter.is_none() {
            pending.remove(&key);
            debug!("Late COMMAND_ACK for abandoned {:?}: {:?}", ack.command, ack.result);
            return;
        }
        if entry.stale {
            entry.stale = false;
            debug!("Dropped COMMAND_ACK for {:?} that may answer an earlier request", ack.command);
            return;
        }
        if let Some(tx) = pending.remove(&key).and_then(|e| e.waiter) {
            let _ = tx.send(ack.result);
        }
    }

    fn next_header(&self) -> MavHeader {
        MavHeader {
            system_id: self.gcs_system_id,
            component_id: self.gcs_component_id,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        }
    }

    async fn send(&self, msg: &MavMessage) -> Result<(), LinkError> {
        let peer = (*self.peer.read()).ok_or(LinkError::NotConnected)?;
        let mut writer = BytesMut::with_capacity(280).writer();
        mavlink::write_v2_msg(&mut writer, self.next_header(), msg)
            .map_err(|e| LinkError::Io(format!("{e:?}")))?;
        self.socket
            .send_to(&writer.into_inner(), peer)
            .await
            .map_err(|e| LinkError::Io(e.to_string()))?;
        Ok(())
    }

    async fn send_heartbeat(&self) {
        let msg = MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_GCS,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: MavModeFlag::empty(),
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        });
        match self.send(&msg).await {
            Ok(()) => {}
            Err(LinkError::NotConnected) => trace!("No peer for heartbeat yet"),
            Err(e) => debug!("Heartbeat send failed: {}", e),
        }
    }

    /// Asks the autopilot for the telemetry the aggregator needs. ACKs are
    /// not awaited.
    async fn request_streams(&self) {
        let Some(target) = self.vehicle() else {
            return;
        };
        if self.stream_rate_hz <= 0.0 {
            return;
        }
        let interval_us = 1_000_000.0 / self.stream_rate_hz;
        for id in [
            GLOBAL_POSITION_INT_DATA::ID,
            HIGHRES_IMU_DATA::ID,
            ATTITUDE_DATA::ID,
            EXTENDED_SYS_STATE_DATA::ID,
        ] {
            let msg = command_long(
                target,
                MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL,
                0,
                [id as f32, interval_us, 0.0, 0.0, 0.0, 0.0, 0.0],
            );
            if let Err(e) = self.send(&msg).await {
                warn!("Failed to request message {} stream: {}", id, e);
            }
        }
    }

    /// Sends a command and waits for its COMMAND_ACK, retransmitting with
    /// backoff until `command_timeout` elapses.
    async fn send_command<F>(&self, name: &'static str, command: MavCmd, build: F) -> Result<(), LinkError>
    where
        F: Fn(VehicleId, u8) -> MavMessage,
    {
        let target = self.vehicle().ok_or(LinkError::NotConnected)?;
        let key = command as u32;
        let (tx, mut rx) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        {
            let mut pending = self.pending.lock();
            let stale = match pending.get(&key) {
                Some(previous) => {
                    if previous.waiter.is_some() {
                        debug!("{} superseded an outstanding {:?}", name, command);
                    }
                    true
                }
                None => false,
            };
            pending.insert(
                key,
                PendingAck {
                    ticket,
                    waiter: Some(tx),
                    stale,
                },
            );
        }
        let _ticket = AckTicket {
            pending: &self.pending,
            key,
            ticket,
        };

        let deadline = Instant::now() + self.command_timeout;
        let mut backoff = ExponentialBackoff::new(RETRANSMIT_MIN, RETRANSMIT_MAX, 2.0);
        let mut attempt: u8 = 0;

        loop {
            self.send(&build(target, attempt)).await?;

            let wait = backoff
                .next_backoff()
                .min(deadline.saturating_duration_since(Instant::now()));
            match tokio::time::timeout(wait, &mut rx).await {
                Ok(Ok(MavResult::MAV_RESULT_ACCEPTED)) => {
                    debug!("{} accepted", name);
                    return Ok(());
                }
                Ok(Ok(result)) => {
                    warn!("{} rejected: {:?}", name, result);
                    return Err(LinkError::Rejected {
                        command: name,
                        code: result as u32,
                    });
                }
                Ok(Err(_)) => {
                    return Err(LinkError::Io(format!("{} superseded by a newer request", name)));
                }
                Err(_) if Instant::now() >= deadline => {
                    warn!("{} not acknowledged after {} attempts", name, attempt as u32 + 1);
                    return Err(LinkError::Timeout { command: name });
                }
                Err(_) => {
                    attempt = attempt.saturating_add(1);
                    debug!("Retransmitting {} (attempt {})", name, attempt as u32 + 1);
                }
            }
        }
    }

    async fn send_command_long(
        &self,
        name: &'static str,
        command: MavCmd,
        params: [f32; 7],
    ) -> Result<(), LinkError> {
        self.send_command(name, command, move |target, confirmation| {
            command_long(target, command, confirmation, params)
        })
        .await
    }

    /// Re-sends the current offboard set-point, if any.
    async fn refresh_setpoint(&self) {
        let current = *self.offboard.lock();
        let Some(setpoint) = current else {
            return;
        };
        let Some(target) = self.vehicle() else {
            return;
        };
        if let Err(e) = self.send(&body_velocity_setpoint(target, setpoint.velocity)).await {
            debug!("Offboard set-point send failed: {}", e);
        }
    }

    /// Stops the set-point stream ahead of a command that changes mode.
    fn leave_offboard(&self) {
        if self.offboard.lock().take().is_some() {
            info!("Offboard set-point stream stopped");
        }
    }

    pub fn is_offboard(&self) -> bool {
        self.offboard.lock().is_some_and(|s| s.engaged)
    }
}

impl VehicleLink for MavlinkVehicle {
    fn telemetry(&self) -> TelemetryStreams {
        self.feed.subscribe()
    }

    async fn arm(&self) -> Result<(), LinkError> {
        self.send_command_long(
            "arm",
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
        .await
    }

    async fn disarm(&self) -> Result<(), LinkError> {
        self.leave_offboard();
        self.send_command_long(
            "disarm",
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
        .await
    }

    async fn set_takeoff_altitude(&self, altitude_m: f32) -> Result<(), LinkError> {
        *self.takeoff_altitude.lock() = Some(altitude_m);
        Ok(())
    }

    async fn takeoff(&self) -> Result<(), LinkError> {
        self.leave_offboard();
        // NAV_TAKEOFF wants an MSL altitude; NaN lets the autopilot pick.
        let altitude_msl = match (*self.takeoff_altitude.lock(), *self.last_position.lock()) {
            (Some(agl), Some(pos)) => agl + pos.terrain_offset_m(),
            _ => f32::NAN,
        };
        self.send_command_long(
            "takeoff",
            MavCmd::MAV_CMD_NAV_TAKEOFF,
            [0.0, 0.0, 0.0, f32::NAN, f32::NAN, f32::NAN, altitude_msl],
        )
        .await
    }

    async fn land(&self) -> Result<(), LinkError> {
        self.leave_offboard();
        self.send_command_long(
            "land",
            MavCmd::MAV_CMD_NAV_LAND,
            [0.0, 0.0, 0.0, f32::NAN, f32::NAN, f32::NAN, f32::NAN],
        )
        .await
    }

    async fn goto_location(
        &self,
        latitude_deg: f64,
        longitude_deg: f64,
        altitude_msl_m: f32,
        approach_speed_m_s: f32,
    ) -> Result<(), LinkError> {
        self.leave_offboard();
        let x = degrees_to_e7(latitude_deg);
        let y = degrees_to_e7(longitude_deg);
        self.send_command("goto", MavCmd::MAV_CMD_DO_REPOSITION, move |target, _| {
            MavMessage::COMMAND_INT(COMMAND_INT_DATA {
                param1: approach_speed_m_s,
                param2: REPOSITION_CHANGE_MODE,
                param3: 0.0,
                param4: f32::NAN,
                x,
                y,
                z: altitude_msl_m,
                command: MavCmd::MAV_CMD_DO_REPOSITION,
                target_system: target.system_id,
                target_component: target.component_id,
                frame: MavFrame::MAV_FRAME_GLOBAL,
                current: 0,
                autocontinue: 0,
            })
        })
        .await
    }

    /// Sends the set-point and, on first use, switches to offboard mode.
    ///
    /// The mode switch follows the first set-point because PX4 refuses
    /// offboard mode without one. The run loop keeps re-sending the latest
    /// set-point until a goto, takeoff, land or disarm.
    async fn set_body_velocity(&self, velocity: BodyVelocity) -> Result<(), LinkError> {
        let target = self.vehicle().ok_or(LinkError::NotConnected)?;
        let engaged = {
            let mut offboard = self.offboard.lock();
            let engaged = offboard.is_some_and(|s| s.engaged);
            *offboard = Some(OffboardSetpoint { velocity, engaged });
            engaged
        };

        let result = async {
            self.send(&body_velocity_setpoint(target, velocity)).await?;
            if engaged {
                return Ok(());
            }
            info!("Switching to offboard mode");
            self.send_command_long(
                "offboard",
                MavCmd::MAV_CMD_DO_SET_MODE,
                [
                    MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() as f32,
                    PX4_CUSTOM_MAIN_MODE_OFFBOARD,
                    0.0,
                    0.0,
                    0.0,
                    0.0,
                    0.0,
                ],
            )
            .await
        }
        .await;

        let mut offboard = self.offboard.lock();
        match result {
            Ok(()) => {
                if let Some(setpoint) = offboard.as_mut() {
                    setpoint.engaged = true;
                }
                Ok(())
            }
            Err(e) => {
                if !engaged {
                    *offboard = None;
                }
                Err(e)
            }
        }
    }

    async fn send_shell(&self, command: &str) -> Result<(), LinkError> {
        let target = self.vehicle().ok_or(LinkError::NotConnected)?;
        let mut line = command.as_bytes().to_vec();
        line.push(b'\n');
        for chunk in line.chunks(SERIAL_CONTROL_CHUNK) {
            self.send(&shell_chunk(target, chunk)).await?;
        }
        debug!("Sent shell command: {}", command);
        Ok(())
    }
}

fn parse_datagram(data: &[u8]) -> Vec<(MavHeader, MavMessage)> {
    let mut reader = PeekReader::new(Cursor::new(data));
    let mut messages = Vec::new();
    while let Ok(frame) = mavlink::read_v2_msg::<MavMessage, _>(&mut reader) {
        messages.push(frame);
    }
    messages
}

fn command_long(target: VehicleId, command: MavCmd, confirmation: u8, p: [f32; 7]) -> MavMessage {
    MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
        target_system: target.system_id,
        target_component: target.component_id,
        command,
        confirmation,
        param1: p[0],
        param2: p[1],
        param3: p[2],
        param4: p[3],
        param5: p[4],
        param6: p[5],
        param7: p[6],
    })
}

fn body_velocity_setpoint(target: VehicleId, v: BodyVelocity) -> MavMessage {
    let type_mask = PositionTargetTypemask::POSITION_TARGET_TYPEMASK_X_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_Y_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_Z_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AX_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AY_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AZ_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_IGNORE;
    MavMessage::SET_POSITION_TARGET_LOCAL_NED(SET_POSITION_TARGET_LOCAL_NED_DATA {
        target_system: target.system_id,
        target_component: target.component_id,
        coordinate_frame: MavFrame::MAV_FRAME_BODY_NED,
        type_mask,
        vx: v.forward_m_s,
        vy: v.right_m_s,
        vz: v.down_m_s,
        yaw_rate: v.yaw_rate_deg_s.to_radians(),
        ..Default::default()
    })
}

fn shell_chunk(target: VehicleId, chunk: &[u8]) -> MavMessage {
    let mut data = [0u8; SERIAL_CONTROL_CHUNK];
    let len = chunk.len().min(SERIAL_CONTROL_CHUNK);
    data[..len].copy_from_slice(&chunk[..len]);
    MavMessage::SERIAL_CONTROL(SERIAL_CONTROL_DATA {
        device: SerialControlDev::SERIAL_CONTROL_DEV_SHELL,
        flags: SerialControlFlag::SERIAL_CONTROL_FLAG_EXCLUSIVE
            | SerialControlFlag::SERIAL_CONTROL_FLAG_RESPOND,
        count: len as u8,
        data,
        ..Default::default()
    })
}

/// Text of a shell reply, if `reply` carries any.
fn shell_reply_text(reply: &SERIAL_CONTROL_DATA) -> Option<String> {
    if reply.device != SerialControlDev::SERIAL_CONTROL_DEV_SHELL {
        return None;
    }
    let len = (reply.count as usize).min(reply.data.len());
    if len == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&reply.data[..len]).into_owned())
}

fn degrees_to_e7(deg: f64) -> i32 {
    (deg * 1e7).round() as i32
}

fn is_armed(hb: &HEARTBEAT_DATA) -> bool {
    hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED)
}

fn is_healthy(hb: &HEARTBEAT_DATA) -> bool {
    !matches!(
        hb.system_status,
        MavState::MAV_STATE_CRITICAL | MavState::MAV_STATE_EMERGENCY
    )
}

fn decode_global_position(p: &GLOBAL_POSITION_INT_DATA) -> (Position, VelocityNed) {
    let position = Position {
        latitude_deg: p.lat as f64 / 1e7,
        longitude_deg: p.lon as f64 / 1e7,
        absolute_altitude_m: p.alt as f32 / 1000.0,
        relative_altitude_m: p.relative_alt as f32 / 1000.0,
    };
    let velocity = VelocityNed {
        north_m_s: p.vx as f32 / 100.0,
        east_m_s: p.vy as f32 / 100.0,
        down_m_s: p.vz as f32 / 100.0,
    };
    (position, velocity)
}

fn decode_imu(i: &HIGHRES_IMU_DATA) -> Imu {
    Imu {
        acceleration: Frd {
            forward: i.xacc,
            right: i.yacc,
            down: i.zacc,
        },
        angular_velocity: Frd {
            forward: i.xgyro,
            right: i.ygyro,
            down: i.zgyro,
        },
        magnetic_field: Frd {
            forward: i.xmag,
            right: i.ymag,
            down: i.zmag,
        },
        temperature_degc: i.temperature,
    }
}

fn decode_attitude(a: &ATTITUDE_DATA) -> Attitude {
    Attitude {
        yaw_deg: a.yaw.to_degrees(),
        pitch_deg: a.pitch.to_degrees(),
        roll_deg: a.roll.to_degrees(),
    }
}

fn decode_landed_state(s: &EXTENDED_SYS_STATE_DATA) -> LandedState {
    match s.landed_state {
        MavLandedState::MAV_LANDED_STATE_ON_GROUND => LandedState::OnGround,
        MavLandedState::MAV_LANDED_STATE_IN_AIR => LandedState::InAir,
        MavLandedState::MAV_LANDED_STATE_TAKEOFF => LandedState::TakingOff,
        MavLandedState::MAV_LANDED_STATE_LANDING => LandedState::Landing,
        _ => LandedState::Unknown,
    }
}
