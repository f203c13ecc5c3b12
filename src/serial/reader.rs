/// Serial port ownership, reconnect policy and the ingest pipeline
use async_trait::async_trait;
use log::{debug, info, warn};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tokio_util::sync::CancellationToken;

use crate::error::ConfigError;
use crate::queue::DeliveryQueue;
use crate::serial::parser::parse_line;
use crate::translate::{translate, TranslationDefaults};
use crate::utils::{sleep_or_cancel, ExponentialBackoff};

// Common USB serial names on Linux/RPi
const PROBE_PATTERNS: [&str; 3] = ["/dev/ttyACM*", "/dev/ttyUSB*", "/dev/serial/by-id/*"];
// SAMD/32u4 boards reset when the port opens
const SETTLE_TIME: Duration = Duration::from_secs(2);
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
// Longest accepted line; noise without newlines is discarded past this
const MAX_LINE_BYTES: u64 = 4096;

#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub path: String,
    pub baud: u32,
}

/// Resolve the serial device: the explicit path if it exists, otherwise the
/// first sorted match of the common USB serial globs.
pub fn find_serial_port(explicit_path: Option<&str>) -> Result<String, ConfigError> {
    if let Some(path) = explicit_path {
        if Path::new(path).exists() {
            return Ok(path.to_string());
        }
        warn!("Serial port {} does not exist; auto-probing", path);
    }

    for pattern in PROBE_PATTERNS {
        let Ok(paths) = glob::glob(pattern) else {
            continue;
        };
        let mut matches: Vec<String> = paths
            .filter_map(Result::ok)
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        matches.sort();
        if let Some(first) = matches.into_iter().next() {
            return Ok(first);
        }
    }

    Err(ConfigError::NoSerialDevice)
}

/// A device that produces newline-delimited packets and can be reopened
/// after it fails.
#[async_trait]
pub trait LineSource: Send {
    type Reader: AsyncBufRead + Unpin + Send;

    /// Open the device. Returns `Interrupted` when cancelled mid-open.
    async fn open(&mut self, token: &CancellationToken) -> io::Result<Self::Reader>;

    /// Device name for log lines
    fn name(&self) -> &str;
}

pub struct SerialDevice {
    settings: SerialSettings,
}

impl SerialDevice {
    pub fn new(settings: SerialSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl LineSource for SerialDevice {
    type Reader = BufReader<SerialStream>;

    async fn open(&mut self, token: &CancellationToken) -> io::Result<Self::Reader> {
        info!("Opening serial port {} @ {}", self.settings.path, self.settings.baud);
        let port = tokio_serial::new(&self.settings.path, self.settings.baud)
            .open_native_async()
            .map_err(io::Error::from)?;

        if !sleep_or_cancel(SETTLE_TIME, token).await {
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "cancelled while the board settled",
            ));
        }
        port.clear(ClearBuffer::Input).map_err(io::Error::from)?;
        Ok(BufReader::new(port))
    }

    fn name(&self) -> &str {
        &self.settings.path
    }
}

/// Run one line through parser → translator → queue.
///
/// Returns whether the line produced a queued item.
pub fn ingest_line(line: &str, queue: &DeliveryQueue, defaults: &TranslationDefaults) -> bool {
    let Some(packet) = parse_line(line) else {
        debug!("Dropped line: {:?}", line.trim_end());
        return false;
    };

    let item = translate(&packet, defaults);
    let name = item.sensor.name.clone();
    queue.enqueue(item);
    info!("Received datapoint from {}; queue_len={}", name, queue.len());
    true
}

/// Read lines until EOF, an I/O error, or cancellation.
///
/// EOF is reported as `UnexpectedEof` since a serial device never ends on
/// its own. Cancellation returns `Ok`. Lines longer than `MAX_LINE_BYTES`
/// are dropped whole.
pub async fn ingest_lines<R>(
    reader: &mut R,
    queue: &DeliveryQueue,
    defaults: &TranslationDefaults,
    token: &CancellationToken,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    let mut discarding = false;
    loop {
        if token.is_cancelled() {
            return Ok(());
        }

        buf.clear();
        let mut limited = (&mut *reader).take(MAX_LINE_BYTES);
        let read = tokio::select! {
            read = limited.read_until(b'\n', &mut buf) => read?,
            _ = token.cancelled() => return Ok(()),
        };
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "serial device closed",
            ));
        }

        let complete = buf.ends_with(b"\n");
        if discarding {
            discarding = !complete;
            continue;
        }
        if !complete && read as u64 == MAX_LINE_BYTES {
            debug!("Dropped line longer than {} bytes", MAX_LINE_BYTES);
            discarding = true;
            continue;
        }

        let line = String::from_utf8_lossy(&buf);
        ingest_line(&line, queue, defaults);
    }
}

/// Own the serial device for the life of the process, reopening it with
/// exponential backoff after any device-level failure.
///
/// # Arguments
/// * `source` - Device to read packets from
/// * `queue` - Delivery queue receiving translated packets
/// * `defaults` - Fallback coordinates for packets without a position
/// * `token` - Shutdown signal; observed during opens, reads and backoff
pub async fn run_serial_reader<S: LineSource>(
    mut source: S,
    queue: Arc<DeliveryQueue>,
    defaults: TranslationDefaults,
    token: CancellationToken,
) {
    let mut backoff = ExponentialBackoff::new(BACKOFF_INITIAL, BACKOFF_MAX);

    while !token.is_cancelled() {
        let result = match source.open(&token).await {
            Ok(mut reader) => {
                info!("Serial connected. Waiting for JSON lines");
                backoff.reset();
                ingest_lines(&mut reader, &queue, &defaults, &token).await
            }
            Err(e) => Err(e),
        };

        if token.is_cancelled() {
            break;
        }

        let delay = backoff.next_delay();
        if let Err(e) = result {
            warn!(
                "Serial error on {}: {}; retrying in {:.1}s",
                source.name(),
                e,
                delay.as_secs_f64()
            );
        }

        if !sleep_or_cancel(delay, &token).await {
            break;
        }
    }

    info!("Serial reader stopped");
}
