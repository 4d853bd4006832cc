use crate::{
    error::{ReabilitaError, Result},
    types::ControlParameters,
};
use bytes::Bytes;
use std::{fmt, str::FromStr};

/// Verb that starts an actuation cycle
pub const START_VERB: &str = "LIGAR";

/// Verb that stops the current cycle
pub const STOP_VERB: &str = "DESLIGAR";

/// Status substrings meaning the peripheral shut itself down
pub const SHUTDOWN_KEYWORDS: [&str; 2] = ["DESLIGAR", "desligado"];

/// Status substring meaning the cycle ran to completion
pub const COMPLETION_KEYWORD: &str = "FIM";

/// Field pattern the peripheral reports once it stops moving
pub const HALTED_PATTERN: &str = "0,0,0";

/// Encode command text to its wire representation
///
/// The characteristic carries plain UTF-8 text, so this is a lossless byte copy.
#[must_use]
pub fn encode_command(text: &str) -> Bytes {
    Bytes::copy_from_slice(text.as_bytes())
}

/// Decode a notification or read payload into text
///
/// # Errors
///
/// Returns [`ReabilitaError::Decode`] if the payload is not valid UTF-8.
pub fn try_decode_payload(payload: &[u8]) -> Result<String> {
    std::str::from_utf8(payload)
        .map(str::to_owned)
        .map_err(|e| ReabilitaError::Decode(e.to_string()))
}

/// Decode a payload, yielding an empty string for malformed input
///
/// An empty result carries no information and must not be read as a command.
#[must_use]
pub fn decode_payload(payload: &[u8]) -> String {
    try_decode_payload(payload).unwrap_or_default()
}

/// Control command understood by the peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start a cycle with the given parameters: `LIGAR,<speed>,<intensity>,<repetitions>`
    Start(ControlParameters),
    /// Stop the cycle: `DESLIGAR,0,0,0`
    Stop,
}

impl Command {
    /// Whether the peripheral runs after accepting this command
    #[must_use]
    pub const fn leaves_running(&self) -> bool {
        matches!(self, Self::Start(_))
    }

    /// Serialize the command for the command characteristic
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        encode_command(&self.to_string())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start(params) => write!(
                f,
                "{START_VERB},{},{},{}",
                params.speed(),
                params.intensity(),
                params.repetitions()
            ),
            Self::Stop => write!(f, "{STOP_VERB},0,0,0"),
        }
    }
}

impl FromStr for Command {
    type Err = ReabilitaError;

    fn from_str(text: &str) -> Result<Self> {
        fn number(field: &str) -> Result<u8> {
            field.trim().parse::<u8>().map_err(|_| {
                ReabilitaError::InvalidParameters(format!("invalid numeric field {field:?}"))
            })
        }

        let fields: Vec<&str> = text.trim().split(',').collect();
        let [verb, speed, intensity, repetitions] = fields.as_slice() else {
            return Err(ReabilitaError::InvalidParameters(format!(
                "expected 4 comma separated fields, got {text:?}"
            )));
        };

        match *verb {
            START_VERB => Ok(Self::Start(ControlParameters::new(
                number(speed)?,
                number(intensity)?,
                number(repetitions)?,
            )?)),
            STOP_VERB => {
                let zeroed = [speed, intensity, repetitions]
                    .iter()
                    .all(|field| number(field).is_ok_and(|value| value == 0));
                if zeroed {
                    Ok(Self::Stop)
                } else {
                    Err(ReabilitaError::InvalidParameters(format!(
                        "stop command must carry 0,0,0, got {text:?}"
                    )))
                }
            }
            other => Err(ReabilitaError::InvalidParameters(format!(
                "unknown command verb {other:?}"
            ))),
        }
    }
}

/// What a status payload says about the actuation cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSignal {
    /// A shutdown keyword was present
    pub shutdown: bool,
    /// The completion keyword was present
    pub completed: bool,
    /// The all-zero halted pattern was present
    pub halted: bool,
}

impl StatusSignal {
    /// Classify decoded status text by substring match
    #[must_use]
    pub fn classify(text: &str) -> Self {
        Self {
            shutdown: SHUTDOWN_KEYWORDS.iter().any(|k| text.contains(k)),
            completed: text.contains(COMPLETION_KEYWORD),
            halted: text.contains(HALTED_PATTERN),
        }
    }

    /// Terminal as seen by the notification channel
    #[must_use]
    pub const fn is_terminal_notification(&self) -> bool {
        self.shutdown || self.completed
    }

    /// Terminal as seen by the polling channel
    #[must_use]
    pub const fn is_halted(&self) -> bool {
        self.halted
    }
}
