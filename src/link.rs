//! Serial link management and background line reading
//!
//! # Purpose
//! This module owns exactly one physical communication channel per [`SerialLink`]. It opens and
//! closes the channel, runs a continuous background reader which frames the incoming byte stream
//! into text lines, and hands those lines to the caller in strict FIFO order through
//! [`SerialLink::next_line`].
//!
//! The reader and the caller share nothing except a single-producer/single-consumer channel.
//! Neither the decoder nor the sequencer ever touch the port directly.
//!
//! # Degraded Links
//! When the reader hits an I/O error, an EOF, or bytes which do not decode as UTF-8, it logs and
//! terminates without taking the owning process down. The link is then degraded: `next_line`
//! simply stops producing lines and callers observe acquisition timeouts. No distinct error is
//! surfaced for this condition.

use std::{
    fmt,
    time::Duration,
};

use tokio::{
    io::{ AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt },
    sync::mpsc,
    task::JoinHandle,
};
use tokio_serial::{ SerialPortBuilderExt, SerialPortInfo };
use tracing::{ debug, info, warn };

use crate::telemetry::LineSource;

/// How long `disconnect` will wait for the reader task to wind down after being told to stop
const READER_JOIN_WAIT: Duration = Duration::from_secs(2);

/// How long `send_command` waits for the fixture to acknowledge
const ACK_WAIT: Duration = Duration::from_secs(2);

/// Number of data bits per character frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits
{
    Five,
    Six,
    Seven,
    Eight,
}

/// Parity bit mode
///
/// `Mark` and `Space` exist in stored configurations from older fixture generations. They are
/// accepted here so those rows still parse, but the host serial layer cannot open a port with
/// them and `connect` will report `OpenFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity
{
    None,
    Even,
    Odd,
    Mark,
    Space,
}

/// Number of stop bits per character frame
///
/// As with mark/space parity, `OnePointFive` is representable because old configurations contain
/// it, but the host serial layer will refuse to open a port with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits
{
    One,
    OnePointFive,
    Two,
}

/// The stored configuration named a framing value this module does not know
///
/// Contains the offending string and a description of what was expected.
#[derive(Debug, PartialEq, Eq)]
pub struct ParseFramingErr
{
    pub value: String,
    expected: &'static str,
}

impl fmt::Display for ParseFramingErr
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "unrecognized value '{}'. Expected one of {}", self.value, self.expected)
    }
}

impl std::error::Error for ParseFramingErr {}

impl std::str::FromStr for DataBits
{
    type Err = ParseFramingErr;

    fn from_str(value: &str) -> Result<Self, Self::Err>
    {
        match value.trim() {
            "5" => Ok(Self::Five),
            "6" => Ok(Self::Six),
            "7" => Ok(Self::Seven),
            "8" => Ok(Self::Eight),
            _ => Err(ParseFramingErr { value: value.to_owned(), expected: "['5', '6', '7', '8']" }),
        }
    }
}

impl std::str::FromStr for Parity
{
    type Err = ParseFramingErr;

    fn from_str(value: &str) -> Result<Self, Self::Err>
    {
        match value.trim() {
            "None" => Ok(Self::None),
            "Even" => Ok(Self::Even),
            "Odd" => Ok(Self::Odd),
            "Mark" => Ok(Self::Mark),
            "Space" => Ok(Self::Space),
            _ => Err(ParseFramingErr {
                value: value.to_owned(),
                expected: "['None', 'Even', 'Odd', 'Mark', 'Space']",
            }),
        }
    }
}

impl std::str::FromStr for StopBits
{
    type Err = ParseFramingErr;

    fn from_str(value: &str) -> Result<Self, Self::Err>
    {
        match value.trim() {
            "1" => Ok(Self::One),
            "1.5" => Ok(Self::OnePointFive),
            "2" => Ok(Self::Two),
            _ => Err(ParseFramingErr { value: value.to_owned(), expected: "['1', '1.5', '2']" }),
        }
    }
}

impl DataBits
{
    fn to_serial(self) -> tokio_serial::DataBits
    {
        match self {
            Self::Five => tokio_serial::DataBits::Five,
            Self::Six => tokio_serial::DataBits::Six,
            Self::Seven => tokio_serial::DataBits::Seven,
            Self::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

impl Parity
{
    fn to_serial(self) -> Option<tokio_serial::Parity>
    {
        match self {
            Self::None => Some(tokio_serial::Parity::None),
            Self::Even => Some(tokio_serial::Parity::Even),
            Self::Odd => Some(tokio_serial::Parity::Odd),
            Self::Mark | Self::Space => None,
        }
    }
}

impl StopBits
{
    fn to_serial(self) -> Option<tokio_serial::StopBits>
    {
        match self {
            Self::One => Some(tokio_serial::StopBits::One),
            Self::Two => Some(tokio_serial::StopBits::Two),
            Self::OnePointFive => None,
        }
    }
}

/// One complete, canonical description of how to open the fixture channel
///
/// Produced exactly once at the config-store boundary. Older storage generations disagree on key
/// names and represent framing values as free-form strings; those are collapsed into this shape
/// via the `FromStr` impls on [`DataBits`], [`Parity`], and [`StopBits`] so that nothing past
/// this point ever branches on which schema generation a row came from.
#[derive(Debug, Clone)]
pub struct CommunicationConfig
{
    /// OS-level channel name, e.g. `/dev/ttyUSB0` or `COM3`
    pub channel_id: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    /// Low-level read timeout handed to the serial layer
    pub timeout: Duration,
}

/// A communication channel currently visible to the host OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor
{
    pub name: String,
    pub description: String,
}

impl fmt::Display for ChannelDescriptor
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        if self.description.is_empty() {
            f.write_str(&self.name)
        }
        else {
            write!(f, "{} ({})", self.name, self.description)
        }
    }
}

/// Enumerates the serial channels currently visible to the host OS
///
/// Never fails. If the OS refuses to enumerate, the failure is logged and an empty list is
/// returned so callers can treat "cannot enumerate" and "nothing attached" identically.
pub fn list_available_channels() -> Vec<ChannelDescriptor>
{
    match tokio_serial::available_ports() {
        Ok(ports) => ports.into_iter().map(describe_port).collect(),
        Err(err) => {
            warn!("could not enumerate serial channels: {}", err);
            Vec::new()
        }
    }
}

fn describe_port(info: SerialPortInfo) -> ChannelDescriptor
{
    let description = match &info.port_type {
        tokio_serial::SerialPortType::UsbPort(usb) => {
            usb.product.clone().unwrap_or_else(|| String::from("USB serial device"))
        }
        tokio_serial::SerialPortType::PciPort => String::from("PCI serial device"),
        tokio_serial::SerialPortType::BluetoothPort => String::from("Bluetooth serial device"),
        tokio_serial::SerialPortType::Unknown => String::new(),
    };

    ChannelDescriptor {
        name: info.port_name,
        description: description,
    }
}

/// Why a connection attempt failed
///
/// Both variants are fatal to starting acquisition but recoverable by reconfiguration. The error
/// text always includes the channels that *are* available so an operator can self-correct by
/// picking another one.
#[derive(Debug)]
pub enum ConnectError
{
    /// The configured channel is not among those the OS can currently see
    ChannelNotFound
    {
        requested: String,
        available: Vec<ChannelDescriptor>,
    },
    /// The OS refused to open the channel (in use, permission, hardware absent), or the
    /// configuration asked for framing the host serial layer cannot provide
    OpenFailed
    {
        channel: String,
        reason: String,
    },
}

impl ConnectError
{
    fn unsupported(channel: &str, what: &str) -> Self
    {
        Self::OpenFailed {
            channel: channel.to_owned(),
            reason: format!("{} is not supported by the host serial layer", what),
        }
    }
}

impl fmt::Display for ConnectError
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::ChannelNotFound { requested, available } => {
                write!(f, "configured channel '{}' is not available on this system.", requested)?;

                if available.is_empty() {
                    write!(f, " No channels found")
                }
                else {
                    write!(f, " Available channels:")?;
                    for channel in available {
                        write!(f, " {};", channel)?;
                    }
                    // nudge toward the most likely fix, as the operator console did
                    write!(f, " consider using {} instead", available[0].name)
                }
            }
            Self::OpenFailed { channel, reason } => {
                write!(f, "failed to open channel '{}': {}", channel, reason)
            }
        }
    }
}

impl std::error::Error for ConnectError {}

/// The link was asked to transmit while not connected, or the write itself failed
#[derive(Debug)]
pub enum SendError
{
    NotConnected,
    Io(std::io::Error),
}

impl fmt::Display for SendError
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::NotConnected => f.write_str("not connected to a channel"),
            Self::Io(err) => write!(f, "failed to write to channel. {}", err),
        }
    }
}

impl std::error::Error for SendError {}

impl From<std::io::Error> for SendError
{
    fn from(this: std::io::Error) -> Self
    {
        Self::Io(this)
    }
}

/// Returns the index of the first linefeed in `buf` at or after `start_hint`, if any
fn find_line_ending(buf: &[u8], start_hint: usize) -> Option<usize>
{
    for index in start_hint..buf.len() {
        if buf[index] == 0x0A {
            return Some(index);
        }
    }

    None
}

/// Drops the first `n` bytes from `buf`, dropping everything if `n >= buf.len()`
fn drop_first(buf: &mut Vec<u8>, n: usize)
{
    if n >= buf.len() {
        buf.clear();
    }
    else {
        // relocate any bytes after the Nth byte to index 0
        buf.rotate_left(n);
        // chop off the bytes we just consumed
        buf.truncate(buf.len() - n);
        // keep the allocation from growing without bound on chatty links
        buf.shrink_to(128);
    }
}

/// The reader loop: one per connected link, runs until the link dies or is disconnected
///
/// Reads raw bytes, frames them on `LF` (0x0A), strips surrounding whitespace including the `CR`
/// of `CRLF` endings, and forwards non-empty lines over `tx` in arrival order. Terminates
/// without panicking on I/O error, EOF, decode failure, or a dropped receiver.
async fn read_lines<R>(mut io: R, tx: mpsc::UnboundedSender<String>)
    where R: AsyncRead + Unpin
{
    let mut read_buf: Vec<u8> = Vec::with_capacity(128);
    let mut temp_buf = [0u8; 64];

    loop {
        while let Some(end_index) = find_line_ending(&read_buf, 0) {
            let decoded = match std::str::from_utf8(&read_buf[..end_index]) {
                Ok(text) => text.trim().to_owned(),
                Err(err) => {
                    warn!("undecodable bytes on channel, reader stopping: {}", err);
                    return;
                }
            };
            drop_first(&mut read_buf, end_index + 1);

            if decoded.is_empty() {
                continue;
            }

            debug!(line = %decoded, "channel line received");

            if tx.send(decoded).is_err() {
                // consumer went away; nothing left to read for
                return;
            }
        }

        match io.read(&mut temp_buf[..]).await {
            Ok(0) => {
                info!("channel closed by peer, reader stopping");
                return;
            }
            Ok(bytes_read) => {
                read_buf.extend_from_slice(&temp_buf[..bytes_read]);
            }
            Err(err) => {
                warn!("channel read failed, reader stopping: {}", err);
                return;
            }
        }
    }
}

/// A handle to one open communication channel
///
/// Owns the background reader task and the write half of the channel. The link is `Connected`
/// from construction until [`SerialLink::disconnect`] is called or the handle is dropped; there
/// is no externally visible `Reading` sub-state because reading is continuous for the lifetime
/// of the connection.
pub struct SerialLink
{
    channel: String,
    lines: mpsc::UnboundedReceiver<String>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    reader: Option<JoinHandle<()>>,
}

impl SerialLink
{
    /// Opens the channel named by `config` and starts the background reader
    ///
    /// Fails with [`ConnectError::ChannelNotFound`] when the configured channel is not among
    /// those currently enumerable, and with [`ConnectError::OpenFailed`] when the OS refuses to
    /// open it or the configured framing is not supported by the host serial layer.
    pub fn connect(config: &CommunicationConfig) -> Result<Self, ConnectError>
    {
        info!(
            channel = %config.channel_id,
            baud = config.baud_rate,
            "attempting serial connection"
        );

        let available = list_available_channels();

        if !available.iter().any(|channel| channel.name == config.channel_id) {
            warn!(channel = %config.channel_id, "configured channel not present on this system");
            return Err(ConnectError::ChannelNotFound {
                requested: config.channel_id.clone(),
                available: available,
            });
        }

        let parity = config
            .parity
            .to_serial()
            .ok_or_else(|| ConnectError::unsupported(&config.channel_id, "mark/space parity"))?;
        let stop_bits = config
            .stop_bits
            .to_serial()
            .ok_or_else(|| ConnectError::unsupported(&config.channel_id, "1.5 stop bits"))?;

        let stream = tokio_serial::new(&config.channel_id, config.baud_rate)
            .data_bits(config.data_bits.to_serial())
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(config.timeout)
            .open_native_async()
            .map_err(|err| ConnectError::OpenFailed {
                channel: config.channel_id.clone(),
                reason: err.to_string(),
            })?;

        info!(channel = %config.channel_id, "serial channel opened, reader started");

        Ok(Self::over_named(&config.channel_id, stream))
    }

    /// Builds a connected link over an arbitrary async I/O handle
    ///
    /// Opening OS channels is what [`SerialLink::connect`] is for, but the engine itself does not
    /// care what it is talking through. Handing in a TCP stream to a serial bridge, or an
    /// in-memory duplex in tests, yields a link that behaves identically.
    pub fn over<T>(io_handle: T) -> Self
        where T: AsyncRead + AsyncWrite + Send + Unpin + 'static
    {
        Self::over_named("<io handle>", io_handle)
    }

    fn over_named<T>(channel: &str, io_handle: T) -> Self
        where T: AsyncRead + AsyncWrite + Send + Unpin + 'static
    {
        let (read_half, write_half) = tokio::io::split(io_handle);
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_lines(read_half, tx));

        Self {
            channel: channel.to_owned(),
            lines: rx,
            writer: Box::new(write_half),
            reader: Some(reader),
        }
    }

    /// The name of the channel this link was opened on
    pub fn channel(&self) -> &str
    {
        &self.channel
    }

    /// Whether the background reader is still running
    ///
    /// A `false` here means the link is degraded or disconnected and `next_line` will only ever
    /// drain lines that were already queued.
    pub fn is_connected(&self) -> bool
    {
        self.reader.as_ref().map(|task| !task.is_finished()).unwrap_or(false)
    }

    /// Waits up to `deadline` for the next complete line from the channel
    ///
    /// Lines are delivered in strict arrival order. Returns `None` on timeout, and promptly
    /// (never later than `deadline`) when the link has been disconnected or has degraded.
    pub async fn next_line(&mut self, deadline: Duration) -> Option<String>
    {
        match tokio::time::timeout(deadline, self.lines.recv()).await {
            Ok(maybe_line) => maybe_line,
            Err(_elapsed) => None,
        }
    }

    /// Writes one line to the channel, appending the line terminator
    pub async fn write_line(&mut self, data: &str) -> Result<(), SendError>
    {
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }

        self.writer.write_all(data.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        Ok(())
    }

    /// Sends a command to the fixture and waits for a positive acknowledgement
    ///
    /// Returns `Ok(true)` when a line containing `ACK` arrives within the acknowledgement
    /// window, `Ok(false)` when the window elapses or the fixture replies with something else.
    pub async fn send_command(&mut self, command: &str) -> Result<bool, SendError>
    {
        self.write_line(command).await?;

        match self.next_line(ACK_WAIT).await {
            Some(response) => Ok(response.contains("ACK")),
            None => Ok(false),
        }
    }

    /// Stops the background reader and releases the channel
    ///
    /// Idempotent, and safe to call while a `next_line` is in flight on another task holding the
    /// receiver -- that call observes the closed queue and returns `None` within its deadline.
    pub async fn disconnect(&mut self)
    {
        if let Some(task) = self.reader.take() {
            task.abort();
            // the abort lands at the next await point; bound the wait anyway
            let _ = tokio::time::timeout(READER_JOIN_WAIT, task).await;
            info!(channel = %self.channel, "serial channel disconnected");
        }

        self.lines.close();
    }
}

impl Drop for SerialLink
{
    fn drop(&mut self)
    {
        if let Some(task) = self.reader.take() {
            task.abort();
        }
    }
}

#[async_trait::async_trait]
impl LineSource for SerialLink
{
    async fn next_line(&mut self, deadline: Duration) -> Option<String>
    {
        SerialLink::next_line(self, deadline).await
    }
}
