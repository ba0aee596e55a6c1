//! Device reply parsing
//!
//! Every numeric value exchanged with the instruments is plain decimal text. A reply which cannot
//! be interpreted is reported as a [`FormatError`] carrying the raw text so that the fault can be
//! logged next to the reading it spoiled.

use std::{ fmt, error::Error, num::ParseFloatError, str::FromStr };

/// SCPI instruments report overflow and "not a number" as 9.9E37 / 9.91E37
const SCPI_OVERFLOW: f64 = 9.9e37;

/// A description of the underlying cause of the parsing failure, if any
#[derive(Debug, Clone, PartialEq)]
pub enum FormatErrorCause
{
    /// The reply was empty or ended before the expected token
    Truncated,
    /// Expected a decimal value
    InvalidDecimal(ParseFloatError),
    /// The reply was a number, but not a usable one (NaN, infinite or the SCPI overflow marker)
    NotFinite(f64),
}

impl fmt::Display for FormatErrorCause
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::Truncated => f.write_str("Reply ends before a value could be parsed"),
            Self::InvalidDecimal(float_err) => write!(f, "Caused by: {}", float_err),
            Self::NotFinite(value) => write!(f, "{} is not a finite reading", value),
        }
    }
}

impl From<ParseFloatError> for FormatErrorCause
{
    fn from(this: ParseFloatError) -> Self
    {
        Self::InvalidDecimal(this)
    }
}

/// A parsing error caused by a reply of unexpected or invalid format
#[derive(Debug, Clone, PartialEq)]
pub struct FormatError
{
    /// The string returned by the device, line ending removed
    pub raw_data: String,
    /// A message from the parsing routines about what went wrong
    mesg: &'static str,
    /// Some underlying cause, if any
    maybe_cause: Option<FormatErrorCause>,
}

impl FormatError
{
    fn new(raw_data: &str, mesg: &'static str, cause: FormatErrorCause) -> Self
    {
        Self {
            raw_data: raw_data.to_string(),
            mesg: mesg,
            maybe_cause: Some(cause),
        }
    }

    pub fn cause(&self) -> Option<&FormatErrorCause>
    {
        self.maybe_cause.as_ref()
    }
}

impl fmt::Display for FormatError
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{} (reply {:?})", self.mesg, self.raw_data)?;

        if let Some(cause) = &self.maybe_cause {
            write!(f, ". {}", cause)
        }
        else {
            Ok(())
        }
    }
}

impl Error for FormatError {}

/// Parses a plain decimal reply such as `+1.234000E-03`
pub fn parse_decimal(reply: &str) -> Result<f64, FormatError>
{
    let token = reply.trim();

    if token.is_empty() {
        return Err(FormatError::new(reply, "Expected a decimal value", FormatErrorCause::Truncated));
    }

    let value = token
        .parse::<f64>()
        .map_err(|err| FormatError::new(reply, "Expected a decimal value", err.into()))?;

    if !value.is_finite() || value.abs() >= SCPI_OVERFLOW {
        return Err(FormatError::new(reply, "Expected a measurable value", FormatErrorCause::NotFinite(value)));
    }

    Ok(value)
}

/// Reply to the IEEE 488.2 `*IDN?` query
///
/// Format is `<manufacturer>,<model>,<serial>,<firmware>`. Some instruments omit trailing fields,
/// in which case they are left empty.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity
{
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

impl Identity
{
    /// Case-insensitive search of the manufacturer and model fields
    pub fn mentions(&self, needle: &str) -> bool
    {
        let needle = needle.to_ascii_uppercase();

        self.manufacturer.to_ascii_uppercase().contains(&needle)
            || self.model.to_ascii_uppercase().contains(&needle)
    }
}

impl fmt::Display for Identity
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{} {} (s/n {}, fw {})", self.manufacturer, self.model, self.serial, self.firmware)
    }
}

impl FromStr for Identity
{
    type Err = FormatError;

    fn from_str(reply: &str) -> Result<Self, Self::Err>
    {
        let line = reply.trim();

        if line.is_empty() {
            return Err(FormatError::new(reply, "Expected an identification string", FormatErrorCause::Truncated));
        }

        let mut tokens = line.split(',').map(|token| token.trim().to_string());

        Ok(Self {
            manufacturer: tokens.next().unwrap_or_default(),
            model: tokens.next().unwrap_or_default(),
            serial: tokens.next().unwrap_or_default(),
            firmware: tokens.next().unwrap_or_default(),
        })
    }
}
