use std::{fmt, io};

use crate::descriptor::ParseError;

/// The error type returned by every fallible operation in this library.
///
/// An error carries a coarse [`ErrorKind`] that callers can match on, the underlying cause, and
/// (usually) the [`Action`] the driver was performing when it failed.
pub struct Error {
    action: Option<Action>,
    kind: ErrorKind,
    cause: Cause,
}

impl Error {
    /// Creates an error of the given kind from a message or another error.
    ///
    /// This is mainly meant for [`Transport`][crate::transport::Transport] implementations outside
    /// of this crate.
    pub fn new(kind: ErrorKind, cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self {
            action: None,
            kind,
            cause: Cause::Other(cause.into()),
        }
    }

    pub(crate) fn with_action(cause: impl Into<Error>, action: Action) -> Self {
        let mut error = cause.into();
        if error.action.is_none() {
            error.action = Some(action);
        }
        error
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub(crate) fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(action) = &self.action {
            write!(f, "error while {}: ", action)?;
        }

        match &self.cause {
            Cause::Rusb(e) => write!(f, "{}", e),
            Cause::Io(e) => write!(f, "{}", e),
            Cause::Parse(e) => write!(f, "{}", e),
            Cause::Other(e) => write!(f, "{}", e),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: ", self.kind)?;
        fmt::Display::fmt(self, f)
    }
}

impl std::error::Error for Error {}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An argument was out of range or contradicted another argument.
    InvalidArgument,
    /// The operation is not allowed in the current lifecycle phase.
    InvalidState,
    /// No device, format, frame or alternate setting matches the request.
    NotFound,
    /// A buffer or transfer slot could not be allocated.
    NoMemory,
    /// A transfer did not complete in time.
    Timeout,
    /// The device sent malformed descriptors or an invalid probe/commit response.
    Protocol,
    /// The USB host stack reported a failure that fits no other category.
    Transport,
}

#[derive(Debug)]
enum Cause {
    Rusb(rusb::Error),
    Io(io::Error),
    Parse(ParseError),
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl From<rusb::Error> for Error {
    fn from(e: rusb::Error) -> Self {
        let kind = match e {
            rusb::Error::Timeout => ErrorKind::Timeout,
            rusb::Error::NoDevice | rusb::Error::NotFound => ErrorKind::NotFound,
            rusb::Error::NoMem => ErrorKind::NoMemory,
            rusb::Error::InvalidParam => ErrorKind::InvalidArgument,
            rusb::Error::Busy | rusb::Error::Access => ErrorKind::InvalidState,
            _ => ErrorKind::Transport,
        };
        Self {
            action: None,
            kind,
            cause: Cause::Rusb(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::OutOfMemory => ErrorKind::NoMemory,
            _ => ErrorKind::Transport,
        };
        Self {
            action: None,
            kind,
            cause: Cause::Io(e),
        }
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Self {
            action: None,
            kind: ErrorKind::Protocol,
            cause: Cause::Parse(e),
        }
    }
}

/// A list of actions during which this library might encounter errors.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Action {
    Installing,
    Uninstalling,
    EnumeratingDevices,
    OpeningDevice,
    ReadingDescriptors,
    ParsingDescriptors,
    ResolvingFormat,
    SelectingBandwidth,
    ClaimingInterface,
    StreamNegotiation,
    AllocatingBuffers,
    SubmittingTransfer,
    StartingStream,
    StoppingStream,
    SelectingFormat,
    QueryingStream,
    ReturningFrame,
    ClosingStream,
    PollingEvents,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Installing => "installing the UVC host driver",
            Action::Uninstalling => "uninstalling the UVC host driver",
            Action::EnumeratingDevices => "enumerating USB devices",
            Action::OpeningDevice => "opening UVC device",
            Action::ReadingDescriptors => "reading device descriptors",
            Action::ParsingDescriptors => "parsing configuration descriptor",
            Action::ResolvingFormat => "resolving the requested stream format",
            Action::SelectingBandwidth => "selecting an alternate setting",
            Action::ClaimingInterface => "claiming the streaming interface",
            Action::StreamNegotiation => "negotiating stream parameters",
            Action::AllocatingBuffers => "allocating stream buffers",
            Action::SubmittingTransfer => "submitting a data transfer",
            Action::StartingStream => "starting the video stream",
            Action::StoppingStream => "stopping the video stream",
            Action::SelectingFormat => "changing the stream format",
            Action::QueryingStream => "querying the video stream",
            Action::ReturningFrame => "returning a frame buffer",
            Action::ClosingStream => "closing the video stream",
            Action::PollingEvents => "polling USB host events",
        };
        f.write_str(s)
    }
}

pub(crate) trait ResultExt<T, E> {
    fn during(self, action: Action) -> Result<T, Error>;
}

impl<T, E: Into<Error>> ResultExt<T, E> for Result<T, E> {
    fn during(self, action: Action) -> Result<T, Error> {
        self.map_err(|e| Error::with_action(e, action))
    }
}

pub(crate) fn err<T>(kind: ErrorKind, msg: impl Into<String>, action: Action) -> Result<T, Error> {
    Err(Error::with_action(Error::new(kind, msg.into()), action))
}
