use std::io;

pub type XferResult<T> = Result<T, XferError>;

/// Result alphabet for the whole data path. `Again` is transient back-pressure
/// that is always recovered locally via the retry queues and never surfaced to
/// the user. `Fault` terminates the affected transfer.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum XferError {
    Again,
    Fault(FaultKind),
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum FaultKind {
    UnknownAddr,
    UnknownKey,
    TooLong,
    TooManySegments,
    EmptyFrame,
    BadPktType,
    Truncated,
    ProtocolMismatch,
    VersionMismatch,
    Registration,
    Unsupported,
    PeerFailed,
    NotEnabled,
    Config,
    Transport(i32),
    Io(io::ErrorKind),
}

impl From<io::Error> for XferError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => XferError::Again,
            kind => XferError::Fault(FaultKind::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for XferResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(XferError::Again) => false,
            _ => true,
        }
    }
}

/// Augmented `io::Write` that is aware of the amount of remaining free capacity in the destination.
pub trait SizedWrite: io::Write {
    /// Remaining free capacity in the destination.
    fn free_capacity(&self) -> usize;
}

/// Augmented `io::Read` that is aware of the amount of remaining data in the source.
pub trait SizedRead: io::Read {
    /// Remaining data in the source.
    fn remaining_data(&self) -> usize;
}

impl SizedWrite for io::Cursor<&mut [u8]> {
    #[inline]
    fn free_capacity(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

impl SizedRead for io::Cursor<&[u8]> {
    #[inline]
    fn remaining_data(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_would_block_folds_to_again() {
        let err: XferError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, XferError::Again);
    }

    #[test]
    fn test_other_io_folds_to_fault() {
        let err: XferError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(err, XferError::Fault(FaultKind::Io(io::ErrorKind::BrokenPipe)));
    }

    #[test]
    fn test_has_failed() {
        assert!(!Ok::<(), XferError>(()).has_failed());
        assert!(!Err::<(), _>(XferError::Again).has_failed());
        assert!(Err::<(), _>(XferError::Fault(FaultKind::TooLong)).has_failed());
    }

    #[test]
    fn test_sized_cursor_capacity() {
        let mut buf = [0u8; 16];
        let mut writer = Cursor::new(&mut buf[..]);
        assert_eq!(writer.free_capacity(), 16);
        writer.set_position(10);
        assert_eq!(writer.free_capacity(), 6);

        let data = [0u8; 8];
        let mut reader = Cursor::new(&data[..]);
        assert_eq!(reader.remaining_data(), 8);
        reader.set_position(3);
        assert_eq!(reader.remaining_data(), 5);
    }
}
