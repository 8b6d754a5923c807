use super::{HeadingSensor, ModuleIo, ModuleMeasurement, ModuleOutput};
use crate::error::{DrivetrainError, Result};
use anyhow::Error;
use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::{Decoder, Encoder};
use tracing::*;

/// Bus index reserved for the heading sensor feedback.
pub const HEADING_INDEX: u8 = 0xFF;

const PAYLOAD_LEN: usize = 9;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum BusError {
    #[error("failed opening serial port {0}")]
    FailedOpeningSerialPort(String),
    #[error("module bus closed")]
    Closed,
}

#[derive(Deserialize, Debug, Clone)]
pub struct BusConfig {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// How often queued commands are flushed to the bus
    #[serde(default = "default_send_period_ms")]
    pub send_period_ms: u64,
    /// Feedback older than this is treated as missing
    #[serde(default = "default_feedback_timeout_ms")]
    pub feedback_timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    115200
}

fn default_send_period_ms() -> u64 {
    10
}

fn default_feedback_timeout_ms() -> u64 {
    100
}

/// One frame on the module bus.
///
/// Commands carry drive and turn volts, feedback carries wheel speed and
/// encoder angle. Heading feedback uses [`HEADING_INDEX`] with the heading
/// in the first value.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WireFrame {
    pub index: u8,
    pub first: f32,
    pub second: f32,
}

impl WireFrame {
    pub fn new(index: u8, first: f32, second: f32) -> Self {
        Self {
            index,
            first,
            second,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(PAYLOAD_LEN);
        buffer.push(self.index);
        buffer.extend_from_slice(&self.first.to_le_bytes());
        buffer.extend_from_slice(&self.second.to_le_bytes());

        let mut encoded = postcard_cobs::encode_vec(&buffer);
        encoded.push(0);
        encoded
    }

    fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() != PAYLOAD_LEN {
            return None;
        }
        let mut payload = payload;
        Some(Self {
            index: payload.get_u8(),
            first: payload.get_f32_le(),
            second: payload.get_f32_le(),
        })
    }
}

pub struct BusProtocol;

impl Decoder for BusProtocol {
    type Item = WireFrame;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        while let Some(end) = buf.iter().position(|byte| *byte == 0) {
            let frame = buf.split_to(end + 1);
            if end == 0 {
                continue;
            }
            let decoded = postcard_cobs::decode_vec(&frame[..end])
                .ok()
                .and_then(|payload| WireFrame::decode(&payload));
            match decoded {
                Some(frame) => return Ok(Some(frame)),
                None => warn!("Dropping malformed bus frame of {} bytes", end),
            }
        }
        Ok(None)
    }
}

impl Encoder<WireFrame> for BusProtocol {
    type Error = Error;

    fn encode(&mut self, data: WireFrame, buf: &mut BytesMut) -> std::result::Result<(), Error> {
        let encoded_data = data.encode();
        buf.reserve(encoded_data.len());
        buf.put_slice(&encoded_data);
        Ok(())
    }
}

#[derive(Default)]
struct BusShared {
    commands: Mutex<BTreeMap<u8, ModuleOutput>>,
    feedback: Mutex<HashMap<u8, (Instant, WireFrame)>>,
    running: AtomicBool,
}

/// Clears the running flag when the bus task ends or is aborted.
struct RunningGuard(Arc<BusShared>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BusShared {
    fn fresh_feedback(&self, index: u8, timeout: Duration) -> Option<WireFrame> {
        lock(&self.feedback)
            .get(&index)
            .filter(|(received, _)| received.elapsed() <= timeout)
            .map(|(_, frame)| *frame)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Serial link shared by all modules on one bus.
///
/// A background task owns the port: it flushes the latest command of every
/// module each send period and stores feedback frames as they arrive. The
/// adapters handed out by [`SerialBus::module`] only touch shared buffers so
/// they never block the control tick.
pub struct SerialBus {
    shared: Arc<BusShared>,
    feedback_timeout: Duration,
    task: JoinHandle<()>,
}

impl SerialBus {
    /// Open the configured port. Must be called from within a tokio runtime.
    pub fn open(config: &BusConfig) -> anyhow::Result<Self> {
        let serial_port = tokio_serial::new(&config.port, config.baud_rate)
            .open_native_async()
            .map_err(|_| BusError::FailedOpeningSerialPort(config.port.clone()))?;
        info!("Opened module bus on {}", config.port);
        Ok(Self::spawn(serial_port, config))
    }

    /// Run the bus over any byte stream.
    pub fn spawn<T>(io: T, config: &BusConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(BusShared::default());
        shared.running.store(true, Ordering::Release);
        let guard = RunningGuard(Arc::clone(&shared));
        let task = tokio::spawn(run_bus(
            BusProtocol.framed(io),
            guard,
            Duration::from_millis(config.send_period_ms),
        ));
        Self {
            shared,
            feedback_timeout: Duration::from_millis(config.feedback_timeout_ms),
            task,
        }
    }

    pub fn module(&self, index: u8) -> SerialModuleIo {
        SerialModuleIo {
            index,
            shared: Arc::clone(&self.shared),
            feedback_timeout: self.feedback_timeout,
        }
    }

    pub fn heading_sensor(&self) -> SerialHeadingSensor {
        SerialHeadingSensor {
            shared: Arc::clone(&self.shared),
            feedback_timeout: self.feedback_timeout,
            zero: 0.0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }
}

impl Drop for SerialBus {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_bus<T>(
    framed: tokio_util::codec::Framed<T, BusProtocol>,
    guard: RunningGuard,
    send_period: Duration,
) where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let shared = &guard.0;
    let (mut sink, mut stream) = framed.split();
    let mut interval = tokio::time::interval(send_period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let pending: Vec<WireFrame> = lock(&shared.commands)
                    .iter()
                    .map(|(index, output)| {
                        WireFrame::new(
                            *index,
                            output.drive_voltage as f32,
                            output.turn_voltage as f32,
                        )
                    })
                    .collect();
                for frame in pending {
                    if let Err(err) = sink.send(frame).await {
                        error!("Failed sending to module bus {:?}", err);
                        return;
                    }
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(frame)) => {
                    lock(&shared.feedback).insert(frame.index, (Instant::now(), frame));
                }
                Some(Err(err)) => {
                    error!("Failed reading from module bus {:?}", err);
                    return;
                }
                None => {
                    error!("{}", BusError::Closed);
                    return;
                }
            }
        }
    }
}

/// Module adapter for one index on a [`SerialBus`].
pub struct SerialModuleIo {
    index: u8,
    shared: Arc<BusShared>,
    feedback_timeout: Duration,
}

impl ModuleIo for SerialModuleIo {
    fn read(&mut self) -> Result<ModuleMeasurement> {
        self.shared
            .fresh_feedback(self.index, self.feedback_timeout)
            .map(|frame| ModuleMeasurement::new(frame.first as f64, frame.second as f64))
            .ok_or_else(|| {
                DrivetrainError::sensor_fault(format!("no feedback from bus module {}", self.index))
            })
    }

    fn write(&mut self, output: ModuleOutput) -> Result<()> {
        if !self.shared.is_running() {
            return Err(DrivetrainError::sensor_fault(format!(
                "module bus stopped, dropping output for module {}",
                self.index
            )));
        }
        lock(&self.shared.commands).insert(self.index, output);
        Ok(())
    }
}

pub struct SerialHeadingSensor {
    shared: Arc<BusShared>,
    feedback_timeout: Duration,
    zero: f64,
}

impl SerialHeadingSensor {
    fn raw_heading(&self) -> Result<f64> {
        self.shared
            .fresh_feedback(HEADING_INDEX, self.feedback_timeout)
            .map(|frame| frame.first as f64)
            .ok_or_else(|| DrivetrainError::sensor_fault("no heading feedback on bus"))
    }
}

impl HeadingSensor for SerialHeadingSensor {
    fn read_heading(&mut self) -> Result<f64> {
        Ok(self.raw_heading()? - self.zero)
    }

    fn reset(&mut self) {
        match self.raw_heading() {
            Ok(heading) => self.zero = heading,
            Err(err) => warn!("Heading reset ignored {}", err),
        }
    }
}
