//! Fixed-width big-endian marshal/unmarshal of protocol structs into
//! shared byte buffers with explicit offsets (spec §4.1).
//!
//! Each wire struct declares a compile-time `SIZE` and two operations,
//! `append` and `bind`, that advance a caller-supplied offset by exactly
//! `SIZE`. On any single-field failure the operation returns a
//! `marshal(type, field, direction)` error without attempting to roll back
//! partial writes — callers allocate fresh buffers of exact size, the same
//! discipline `hr-dns::packet` uses for fixed 12-byte DNS headers, just
//! made generic over arbitrary wire structs.

use vminit_common::AgentError;

pub mod checksum;

/// A struct with a fixed wire size that can be appended to / read from a
/// byte buffer at an explicit offset.
pub trait Wire: Sized {
    /// Size in bytes this struct always occupies on the wire.
    const SIZE: usize;

    /// Write `self` into `buf` starting at `offset`. Returns the offset
    /// immediately after the written bytes.
    fn append(&self, buf: &mut [u8], offset: usize) -> Result<usize, AgentError>;

    /// Read a value of this type from `buf` starting at `offset`. Returns
    /// the parsed value and the offset immediately after the read bytes.
    fn bind(buf: &[u8], offset: usize) -> Result<(Self, usize), AgentError>;
}

/// Helper used by `Wire` impls to bounds-check before reading/writing a
/// field, producing a consistent `marshal(type, field, direction)` error.
pub fn require_len(
    buf_len: usize,
    offset: usize,
    needed: usize,
    ty: &str,
    field: &str,
    direction: &str,
) -> Result<(), AgentError> {
    if offset + needed > buf_len {
        return Err(AgentError::marshal(ty, field, direction));
    }
    Ok(())
}

#[macro_export]
macro_rules! put_u8 {
    ($buf:expr, $off:expr, $ty:literal, $field:literal, $val:expr) => {{
        $crate::require_len($buf.len(), $off, 1, $ty, $field, "append")?;
        $buf[$off] = $val;
        $off + 1
    }};
}

#[macro_export]
macro_rules! put_u16 {
    ($buf:expr, $off:expr, $ty:literal, $field:literal, $val:expr) => {{
        $crate::require_len($buf.len(), $off, 2, $ty, $field, "append")?;
        $buf[$off..$off + 2].copy_from_slice(&($val as u16).to_be_bytes());
        $off + 2
    }};
}

#[macro_export]
macro_rules! put_u32 {
    ($buf:expr, $off:expr, $ty:literal, $field:literal, $val:expr) => {{
        $crate::require_len($buf.len(), $off, 4, $ty, $field, "append")?;
        $buf[$off..$off + 4].copy_from_slice(&($val as u32).to_be_bytes());
        $off + 4
    }};
}

#[macro_export]
macro_rules! get_u8 {
    ($buf:expr, $off:expr, $ty:literal, $field:literal) => {{
        $crate::require_len($buf.len(), $off, 1, $ty, $field, "bind")?;
        ($buf[$off], $off + 1)
    }};
}

#[macro_export]
macro_rules! get_u16 {
    ($buf:expr, $off:expr, $ty:literal, $field:literal) => {{
        $crate::require_len($buf.len(), $off, 2, $ty, $field, "bind")?;
        (
            u16::from_be_bytes([$buf[$off], $buf[$off + 1]]),
            $off + 2,
        )
    }};
}

#[macro_export]
macro_rules! get_u32 {
    ($buf:expr, $off:expr, $ty:literal, $field:literal) => {{
        $crate::require_len($buf.len(), $off, 4, $ty, $field, "bind")?;
        (
            u32::from_be_bytes([$buf[$off], $buf[$off + 1], $buf[$off + 2], $buf[$off + 3]]),
            $off + 4,
        )
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use vminit_common::ErrorKind;

    struct Probe {
        a: u8,
        b: u16,
    }

    impl Wire for Probe {
        const SIZE: usize = 3;

        fn append(&self, buf: &mut [u8], offset: usize) -> Result<usize, AgentError> {
            let offset = put_u8!(buf, offset, "Probe", "a", self.a);
            let offset = put_u16!(buf, offset, "Probe", "b", self.b);
            Ok(offset)
        }

        fn bind(buf: &[u8], offset: usize) -> Result<(Self, usize), AgentError> {
            let (a, offset) = get_u8!(buf, offset, "Probe", "a");
            let (b, offset) = get_u16!(buf, offset, "Probe", "b");
            Ok((Self { a, b }, offset))
        }
    }

    #[test]
    fn append_then_bind_round_trips() {
        let probe = Probe { a: 7, b: 0x1234 };
        let mut buf = [0u8; Probe::SIZE];
        let end = probe.append(&mut buf, 0).unwrap();
        assert_eq!(end, Probe::SIZE);

        let (back, end) = Probe::bind(&buf, 0).unwrap();
        assert_eq!(end, Probe::SIZE);
        assert_eq!(back.a, 7);
        assert_eq!(back.b, 0x1234);
    }

    #[test]
    fn short_buffer_fails_with_marshal_error() {
        let probe = Probe { a: 1, b: 2 };
        let mut buf = [0u8; 1];
        let err = probe.append(&mut buf, 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert!(err.message.contains("Probe"));
    }
}
