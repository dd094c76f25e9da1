//! Telemetry line parsing and measurement acquisition
//!
//! # Wire Format
//! The fixture emits one reading per ASCII line, comma separated:
//!
//! ```text
//! 235,Voltage,4.4
//! 235,resistance,100.2
//! 235,current,0.5
//! ```
//!
//! The first field is the unit (PCB) identifier, the second a case-insensitive parameter name,
//! the third a decimal value with `.` as the separator. Readings for the three parameters arrive
//! in no particular order and may repeat; the decoder's job is to fold a stream of such lines
//! into one complete [`Measurement`] under a deadline.
//!
//! # Never Stall The Operator
//! A fixture that answers partially is more common than one that answers not at all. When the
//! attempt budget runs out with at least one parameter in hand, the decoder zero-fills the rest
//! and returns a measurement marked `partial` rather than blocking the station. Only a stream
//! with nothing parseable at all is an error.

use std::{
    fmt,
    time::Duration,
};

use tracing::{ debug, info, warn };

/// Anything that can produce framed telemetry lines under a deadline
///
/// Implemented by [`SerialLink`](crate::link::SerialLink) for live hardware and trivially by
/// scripted fakes in tests. The decoder performs no I/O beyond this call, which is the only
/// suspension point in the acquisition path.
#[async_trait::async_trait]
pub trait LineSource: Send
{
    /// Waits up to `deadline` for the next line, returning `None` on timeout or a dead source
    async fn next_line(&mut self, deadline: Duration) -> Option<String>;
}

/// The quantity a telemetry line is reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameter
{
    Voltage,
    Current,
    Resistance,
}

/// A parameter name outside the known set
///
/// Unknown names are not a protocol violation -- newer fixture firmware reports quantities this
/// engine does not validate -- so callers discard the line rather than failing.
#[derive(Debug, PartialEq, Eq)]
pub struct UnknownParameterErr
{
    pub name: String,
}

impl fmt::Display for UnknownParameterErr
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(
            f,
            "unknown parameter '{}'. Expected one of ['voltage', 'current', 'resistance'] (case insensitive)",
            self.name
        )
    }
}

impl std::error::Error for UnknownParameterErr {}

impl std::str::FromStr for Parameter
{
    type Err = UnknownParameterErr;

    fn from_str(name: &str) -> Result<Self, Self::Err>
    {
        match name.trim().to_ascii_lowercase().as_str() {
            "voltage" => Ok(Self::Voltage),
            "current" => Ok(Self::Current),
            "resistance" => Ok(Self::Resistance),
            _ => Err(UnknownParameterErr { name: name.trim().to_owned() }),
        }
    }
}

impl fmt::Display for Parameter
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::Voltage => f.write_str("voltage"),
            Self::Current => f.write_str("current"),
            Self::Resistance => f.write_str("resistance"),
        }
    }
}

/// Why a raw line could not be interpreted as a telemetry reading
#[derive(Debug)]
pub enum ParseLineErr
{
    /// Fewer than three comma-separated fields
    Truncated,
    /// The value field was not a decimal number
    InvalidValue(std::num::ParseFloatError),
    /// The parameter field named a quantity outside the known set
    UnknownParameter(UnknownParameterErr),
}

impl fmt::Display for ParseLineErr
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::Truncated => f.write_str("expected three comma-separated fields"),
            Self::InvalidValue(float_err) => write!(f, "invalid numeric value. Caused by: {}", float_err),
            Self::UnknownParameter(param_err) => write!(f, "{}", param_err),
        }
    }
}

impl std::error::Error for ParseLineErr {}

impl From<std::num::ParseFloatError> for ParseLineErr
{
    fn from(this: std::num::ParseFloatError) -> Self
    {
        Self::InvalidValue(this)
    }
}

impl From<UnknownParameterErr> for ParseLineErr
{
    fn from(this: UnknownParameterErr) -> Self
    {
        Self::UnknownParameter(this)
    }
}

/// One decoded reading from the wire
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryLine
{
    pub unit_id: String,
    pub parameter: Parameter,
    pub value: f64,
}

impl std::str::FromStr for TelemetryLine
{
    type Err = ParseLineErr;

    fn from_str(line: &str) -> Result<Self, Self::Err>
    {
        // fields past the third (checksums, spare columns on newer firmware) are ignored
        let mut fields = line.split(',');
        let unit_id = fields.next().ok_or(ParseLineErr::Truncated)?.trim();
        let parameter = fields.next().ok_or(ParseLineErr::Truncated)?;
        let value = fields.next().ok_or(ParseLineErr::Truncated)?;

        Ok(Self {
            unit_id: unit_id.to_owned(),
            parameter: parameter.parse::<Parameter>()?,
            value: value.trim().parse::<f64>()?,
        })
    }
}

/// One complete electrical measurement of a unit under test
///
/// `partial` is set when the attempt budget ran out before every parameter arrived and the
/// missing ones were zero-filled. Such a measurement almost always fails validation, which is
/// the intent: the operator sees a failed stage instead of a stalled station.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement
{
    pub voltage: f64,
    pub current: f64,
    pub resistance: f64,
    pub partial: bool,
}

impl Measurement
{
    pub fn new(voltage: f64, current: f64, resistance: f64) -> Self
    {
        Self {
            voltage: voltage,
            current: current,
            resistance: resistance,
            partial: false,
        }
    }
}

impl fmt::Display for Measurement
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}V {}A {}Ω", self.voltage, self.current, self.resistance)?;

        if self.partial {
            f.write_str(" (partial)")?;
        }

        Ok(())
    }
}

/// Accumulates parameter readings until all three are present
#[derive(Debug, Default)]
struct Assembly
{
    voltage: Option<f64>,
    current: Option<f64>,
    resistance: Option<f64>,
}

impl Assembly
{
    /// Records a reading, replacing any earlier value for the same parameter
    fn record(&mut self, reading: &TelemetryLine)
    {
        let slot = match reading.parameter {
            Parameter::Voltage => &mut self.voltage,
            Parameter::Current => &mut self.current,
            Parameter::Resistance => &mut self.resistance,
        };

        *slot = Some(reading.value);
    }

    fn is_complete(&self) -> bool
    {
        self.voltage.is_some() && self.current.is_some() && self.resistance.is_some()
    }

    fn is_empty(&self) -> bool
    {
        self.voltage.is_none() && self.current.is_none() && self.resistance.is_none()
    }

    /// Converts to a measurement, zero-filling whatever never arrived
    fn finalize(self) -> Measurement
    {
        let partial = !self.is_complete();

        Measurement {
            voltage: self.voltage.unwrap_or(0.0),
            current: self.current.unwrap_or(0.0),
            resistance: self.resistance.unwrap_or(0.0),
            partial: partial,
        }
    }
}

/// Acquisition gave up without a single parseable reading
#[derive(Debug, PartialEq, Eq)]
pub enum AcquireError
{
    /// Every attempt timed out or produced garbage
    NoDataReceived,
    /// The acquisition path itself is unavailable (no manual value staged, no transport bound)
    SourceUnavailable(String),
}

impl fmt::Display for AcquireError
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::NoDataReceived => {
                f.write_str("no test data received from the unit after exhausting all read attempts")
            }
            Self::SourceUnavailable(what) => write!(f, "measurement source unavailable: {}", what),
        }
    }
}

impl std::error::Error for AcquireError {}

/// Folds a line stream into complete measurements under a time budget
///
/// The decoder knows nothing about stages or validation; it is pure orchestration over a
/// [`LineSource`] and is tuned by two knobs: how long each read may wait and how many reads to
/// spend before settling for a partial record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryDecoder
{
    pub per_line_deadline: Duration,
    pub max_attempts: u32,
}

impl Default for TelemetryDecoder
{
    /// The tunables the station has always shipped with: 10 reads of 2 seconds each
    fn default() -> Self
    {
        Self {
            per_line_deadline: Duration::from_secs(2),
            max_attempts: 10,
        }
    }
}

impl TelemetryDecoder
{
    /// The longest a single [`TelemetryDecoder::acquire`] call can suspend
    pub fn overall_deadline(&self) -> Duration
    {
        self.per_line_deadline * self.max_attempts
    }

    /// Reads lines from `source` until a complete measurement is assembled or the attempt
    /// budget is exhausted
    ///
    /// Each call to the source counts as one attempt regardless of what it yields. Lines which
    /// are malformed or name an unknown parameter are logged and skipped, never fatal. A repeat
    /// reading for a parameter replaces the earlier one. On budget exhaustion with at least one
    /// parameter recorded, the remaining fields are zero-filled and the measurement is returned
    /// with `partial` set; with nothing recorded at all, [`AcquireError::NoDataReceived`].
    pub async fn acquire<S>(&self, source: &mut S) -> Result<Measurement, AcquireError>
        where S: LineSource + ?Sized
    {
        let mut assembly = Assembly::default();

        info!(attempts = self.max_attempts, "reading test data from unit");

        for attempt in 0..self.max_attempts {
            let line = match source.next_line(self.per_line_deadline).await {
                Some(line) => line,
                None => {
                    debug!(attempt = attempt + 1, "read attempt yielded no line");
                    continue;
                }
            };

            let reading = match line.parse::<TelemetryLine>() {
                Ok(reading) => reading,
                Err(err) => {
                    warn!(line = %line, "discarding unusable telemetry line: {}", err);
                    continue;
                }
            };

            debug!(
                unit = %reading.unit_id,
                parameter = %reading.parameter,
                value = reading.value,
                "telemetry reading accepted"
            );
            assembly.record(&reading);

            if assembly.is_complete() {
                let measurement = assembly.finalize();
                info!(%measurement, "all test data received");
                return Ok(measurement);
            }
        }

        if assembly.is_empty() {
            warn!("no parseable test data received from unit");
            return Err(AcquireError::NoDataReceived);
        }

        let measurement = assembly.finalize();
        warn!(%measurement, "incomplete test data, zero-filling missing parameters");

        Ok(measurement)
    }
}
