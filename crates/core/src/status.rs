// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

use std::fmt;

/// stable error taxonomy shared by logs, callbacks and language bindings
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum ErrorKind {
    Abort,
    BadConfig,
    BadConnection,
    BadData,
    BadDevice,
    BadGateway,
    BadParam,
    BadReply,
    BadStatus,
    Busy,
    Close,
    Create,
    Duplicate,
    Encode,
    MutexDestroy,
    MutexInit,
    MutexLock,
    MutexUnlock,
    NotAllowed,
    NotFound,
    NotImplemented,
    NoData,
    NoMatch,
    NoMem,
    NoResources,
    NullPtr,
    Open,
    OutOfBounds,
    Partial,
    Read,
    RemoteErr,
    ThreadCreate,
    ThreadJoin,
    Timeout,
    TooLarge,
    TooSmall,
    Unsupported,
    Write,
    WouldBlock,
}

impl ErrorKind {
    /// the stable short identifier for this error
    pub fn decode(&self) -> &'static str {
        match self {
            ErrorKind::Abort => "ERR_ABORT",
            ErrorKind::BadConfig => "ERR_BAD_CONFIG",
            ErrorKind::BadConnection => "ERR_BAD_CONNECTION",
            ErrorKind::BadData => "ERR_BAD_DATA",
            ErrorKind::BadDevice => "ERR_BAD_DEVICE",
            ErrorKind::BadGateway => "ERR_BAD_GATEWAY",
            ErrorKind::BadParam => "ERR_BAD_PARAM",
            ErrorKind::BadReply => "ERR_BAD_REPLY",
            ErrorKind::BadStatus => "ERR_BAD_STATUS",
            ErrorKind::Busy => "ERR_BUSY",
            ErrorKind::Close => "ERR_CLOSE",
            ErrorKind::Create => "ERR_CREATE",
            ErrorKind::Duplicate => "ERR_DUPLICATE",
            ErrorKind::Encode => "ERR_ENCODE",
            ErrorKind::MutexDestroy => "ERR_MUTEX_DESTROY",
            ErrorKind::MutexInit => "ERR_MUTEX_INIT",
            ErrorKind::MutexLock => "ERR_MUTEX_LOCK",
            ErrorKind::MutexUnlock => "ERR_MUTEX_UNLOCK",
            ErrorKind::NotAllowed => "ERR_NOT_ALLOWED",
            ErrorKind::NotFound => "ERR_NOT_FOUND",
            ErrorKind::NotImplemented => "ERR_NOT_IMPLEMENTED",
            ErrorKind::NoData => "ERR_NO_DATA",
            ErrorKind::NoMatch => "ERR_NO_MATCH",
            ErrorKind::NoMem => "ERR_NO_MEM",
            ErrorKind::NoResources => "ERR_NO_RESOURCES",
            ErrorKind::NullPtr => "ERR_NULL_PTR",
            ErrorKind::Open => "ERR_OPEN",
            ErrorKind::OutOfBounds => "ERR_OUT_OF_BOUNDS",
            ErrorKind::Partial => "ERR_PARTIAL",
            ErrorKind::Read => "ERR_READ",
            ErrorKind::RemoteErr => "ERR_REMOTE_ERR",
            ErrorKind::ThreadCreate => "ERR_THREAD_CREATE",
            ErrorKind::ThreadJoin => "ERR_THREAD_JOIN",
            ErrorKind::Timeout => "ERR_TIMEOUT",
            ErrorKind::TooLarge => "ERR_TOO_LARGE",
            ErrorKind::TooSmall => "ERR_TOO_SMALL",
            ErrorKind::Unsupported => "ERR_UNSUPPORTED",
            ErrorKind::Write => "ERR_WRITE",
            ErrorKind::WouldBlock => "ERR_WOULD_BLOCK",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.decode())
    }
}

/// status of a tag or an operation
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum Status {
    /// operation completed successfully
    Ok,
    /// operation submitted, not finished yet
    Pending,
    /// operation failed
    Err(ErrorKind),
}

impl Status {
    /// success or not?
    #[inline(always)]
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// has error?
    #[inline(always)]
    pub fn is_err(&self) -> bool {
        matches!(self, Status::Err(_))
    }

    /// has pending operations?
    #[inline(always)]
    pub fn is_pending(&self) -> bool {
        matches!(self, Status::Pending)
    }

    /// is timeout error?
    #[inline(always)]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Status::Err(ErrorKind::Timeout))
    }

    /// into [`crate::Result`]
    #[inline(always)]
    pub fn into_result(self) -> crate::Result<()> {
        match self {
            Status::Ok => Ok(()),
            other => Err(other),
        }
    }

    /// decode status to its stable short identifier
    ///
    /// # Examples
    /// ```
    /// use tagbus_core::Status;
    ///
    /// let status = Status::Ok;
    /// assert_eq!(status.decode(), "STATUS_OK");
    /// ```
    #[inline]
    pub fn decode(&self) -> &'static str {
        match self {
            Status::Ok => "STATUS_OK",
            Status::Pending => "STATUS_PENDING",
            Status::Err(kind) => kind.decode(),
        }
    }
}

impl From<ErrorKind> for Status {
    #[inline(always)]
    fn from(kind: ErrorKind) -> Status {
        Status::Err(kind)
    }
}

impl fmt::Display for Status {
    #[inline(always)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.decode())
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "STATUS: {}", self.decode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ok() {
        let status = Status::Ok;
        assert_eq!(status.decode(), "STATUS_OK");
        assert!(status.is_ok());
    }

    #[test]
    fn test_status_pending() {
        let status = Status::Pending;
        assert_eq!(status.decode(), "STATUS_PENDING");
        assert!(status.is_pending());
    }

    #[test]
    fn test_error_identifiers_are_stable() {
        assert_eq!(Status::from(ErrorKind::Timeout).decode(), "ERR_TIMEOUT");
        assert_eq!(ErrorKind::BadConnection.decode(), "ERR_BAD_CONNECTION");
        assert_eq!(ErrorKind::OutOfBounds.decode(), "ERR_OUT_OF_BOUNDS");
        assert!(Status::from(ErrorKind::Timeout).is_timeout());
    }

    #[test]
    fn test_into_result() {
        assert!(Status::Ok.into_result().is_ok());
        assert_eq!(
            Status::from(ErrorKind::Abort).into_result(),
            Err(Status::Err(ErrorKind::Abort))
        );
    }
}
