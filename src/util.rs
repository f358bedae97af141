use std::{
    fmt,
    io::{self, Read},
};

use byteorder::{ReadBytesExt, LE};
use uuid::Uuid;

use crate::descriptor::{FrameInterval, ParseError, SourceId, TermId, UnitId};

/// primitive_enum! {}
macro_rules! primitive_enum {
    (
        $v:vis enum $name:ident: $native:ty {
            $(
                $( #[$variant_attrs:meta] )*
                $variant:ident = $value:expr
            ),+
            $(,)?
        }
    ) => {
        #[derive(Clone, Copy, PartialEq, Eq)]
        $v enum $name {
            $(
                $( #[$variant_attrs] )*
                $variant = $value,
            )+
        }

        impl $name {
            pub(crate) fn from_raw(raw: $native) -> Option<Self> {
                match raw {
                    $(
                        $value => Some(Self::$variant),
                    )+
                    _ => None,
                }
            }
        }

        #[allow(unreachable_patterns)]
        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match *self {
                    $(
                        Self::$variant => f.write_str(stringify!($variant)),
                    )+
                }
            }
        }
    };
}

/// Splits a descriptor blob into `(offset, bDescriptorType, descriptor)` records.
///
/// Every record is cut at its own `bLength`. A record claiming more bytes than are left yields
/// [`ParseError::Truncated`] and ends the iteration.
pub(crate) fn split_descriptors(
    raw: &[u8],
) -> impl Iterator<Item = Result<(usize, u8, &[u8]), ParseError>> {
    let mut offset = 0;
    let mut failed = false;
    std::iter::from_fn(move || {
        if failed {
            return None;
        }
        let rest = &raw[offset..];
        let res = match rest {
            [] => return None,
            [length, ..] if *length < 2 => Err(ParseError::Malformed {
                offset,
                reason: format!("bLength {} is too small", length),
            }),
            [length, descriptor_type, ..] => {
                let length = *length as usize;
                if length > rest.len() {
                    Err(ParseError::Truncated {
                        offset,
                        needed: length,
                        available: rest.len(),
                    })
                } else {
                    let record = (offset, *descriptor_type, &rest[..length]);
                    offset += length;
                    Ok(record)
                }
            }
            [_] => Err(ParseError::Truncated {
                offset,
                needed: 2,
                available: 1,
            }),
        };
        failed = res.is_err();
        Some(res)
    })
}

pub(crate) trait BytesExt {
    fn read_length_prefixed_bitmask(&mut self) -> io::Result<u32>;
    fn read_bitmask(&mut self, len: u8) -> io::Result<u32>;
    fn read_nonzero_source_id(&mut self) -> io::Result<SourceId>;
    fn read_nonzero_term_id(&mut self) -> io::Result<TermId>;
    fn read_nonzero_unit_id(&mut self) -> io::Result<UnitId>;
    fn read_guid(&mut self) -> io::Result<Uuid>;
    fn read_interval(&mut self) -> io::Result<FrameInterval>;
}

impl BytesExt for &'_ [u8] {
    fn read_length_prefixed_bitmask(&mut self) -> io::Result<u32> {
        let len = self.read_u8()?;
        self.read_bitmask(len)
    }

    fn read_bitmask(&mut self, len: u8) -> io::Result<u32> {
        let len = usize::from(len);
        if len > self.len() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        if len > 4 {
            log::warn!("bitmask length {}, discarding data past 32 bits", len);
        }

        let (bytes, rest) = self.split_at(len);
        *self = rest;

        let mut buf = [0u8; 4];
        buf.iter_mut()
            .zip(bytes)
            .for_each(|(dest, src)| *dest = *src);
        Ok(u32::from_le_bytes(buf))
    }

    fn read_nonzero_source_id(&mut self) -> io::Result<SourceId> {
        SourceId::new(self.read_u8()?)
            .ok_or_else(|| io_err("bSourceID is 0, only non-zero numbers are allowed"))
    }

    fn read_nonzero_term_id(&mut self) -> io::Result<TermId> {
        TermId::new(self.read_u8()?)
            .ok_or_else(|| io_err("bTerminalID is 0, only non-zero numbers are allowed"))
    }

    fn read_nonzero_unit_id(&mut self) -> io::Result<UnitId> {
        UnitId::new(self.read_u8()?)
            .ok_or_else(|| io_err("bUnitID is 0, only non-zero numbers are allowed"))
    }

    fn read_guid(&mut self) -> io::Result<Uuid> {
        // Weird encoding, apparently the first 3 groups in a UUID are "numbers", the last 2 groups
        // are just "bytes", and USB-IF insists on encoding all numbers in little endian.
        let d1 = self.read_u32::<LE>()?;
        let d2 = self.read_u16::<LE>()?;
        let d3 = self.read_u16::<LE>()?;
        let mut d4 = [0; 8];
        self.read_exact(&mut d4)?;
        Uuid::from_fields(d1, d2, d3, &d4).map_err(io_err)
    }

    fn read_interval(&mut self) -> io::Result<FrameInterval> {
        Ok(FrameInterval::from_raw(self.read_u32::<LE>()?))
    }
}

pub(crate) fn io_err_res<T, M>(msg: M) -> io::Result<T>
where
    M: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    Err(io_err(msg))
}

pub(crate) fn io_err<M>(msg: M) -> io::Error
where
    M: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::Other, msg)
}

/// A binary-coded-decimal version number, such as `bcdUVC`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BcdVersion(pub(crate) u16);

impl BcdVersion {
    pub fn raw(self) -> u16 {
        self.0
    }
}

impl fmt::Display for BcdVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let maj = self.0 >> 8;
        let min = self.0 & 0xff;
        write!(f, "{:x}.{:02x}", maj, min)
    }
}

impl fmt::Debug for BcdVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
