//! Validated TCP port numbers.

use crate::error::{Error, ErrorKind, Result};
use std::fmt;
use std::str::FromStr;

/// A TCP port in `1..=65535`.
///
/// Per-user ports are derived by adding a UID to a configured base; the
/// [`TryFrom<u32>`] constructor is what that arithmetic goes through, so an
/// out-of-range sum fails instead of wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Port(u16);

impl Port {
    /// Creates a port, rejecting zero.
    pub fn new(port: u16) -> Result<Self> {
        if port == 0 {
            return Err(Error::new(ErrorKind::BadPort).with_context("port 0"));
        }
        Ok(Self(port))
    }

    /// Returns the raw port number.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl TryFrom<u32> for Port {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match u16::try_from(value) {
            Ok(p) => Self::new(p),
            Err(_) => Err(Error::new(ErrorKind::BadPort).with_context(format!("port {value}"))),
        }
    }
}

impl FromStr for Port {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let value: u32 = s
            .parse()
            .map_err(|_| Error::new(ErrorKind::BadPort).with_context(format!("port {s:?}")))?;
        Self::try_from(value)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Port> for u16 {
    fn from(port: Port) -> Self {
        port.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_rejected() {
        assert_eq!(Port::new(0).unwrap_err().kind(), ErrorKind::BadPort);
        assert_eq!(Port::try_from(0u32).unwrap_err().kind(), ErrorKind::BadPort);
    }

    #[test]
    fn out_of_range_is_rejected() {
        assert_eq!(
            Port::try_from(65_536u32).unwrap_err().kind(),
            ErrorKind::BadPort
        );
    }

    #[test]
    fn boundaries_are_accepted() {
        assert_eq!(Port::new(1).unwrap().get(), 1);
        assert_eq!(Port::new(65_535).unwrap().get(), 65_535);
    }

    #[test]
    fn parses_from_string() {
        assert_eq!("50000".parse::<Port>().unwrap().get(), 50_000);
        assert!("0".parse::<Port>().is_err());
        assert!("65536".parse::<Port>().is_err());
        assert!("five".parse::<Port>().is_err());
    }

    #[test]
    fn uid_offset_overflow_is_rejected() {
        // base 50000 + uid 100000 exceeds the port range
        let derived = 50_000u32 + 100_000u32;
        assert!(Port::try_from(derived).is_err());
    }
}
