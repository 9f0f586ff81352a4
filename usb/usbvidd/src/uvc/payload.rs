use thiserror::Error;

use super::format::EndpointTy;

bitflags::bitflags! {
    /// The bmHeaderInfo bitmask of a payload header.
    ///
    /// UVC 1.5 Class specification, section 2.4.3.3 Video and Still Image
    /// Payload Headers.
    #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
    pub struct HeaderInfo: u8 {
        /// Frame ID, toggled by the device at each frame boundary.
        const FID = 1 << 0;
        /// End of frame.
        const EOF = 1 << 1;
        /// A dwPresentationTime field follows.
        const PTS = 1 << 2;
        /// A scrSourceClock field follows.
        const SCR = 1 << 3;
        const RES = 1 << 4;
        /// Payload belongs to a still image. Not negotiated by this driver.
        const STI = 1 << 5;
        /// The device flags this payload's data as bad.
        const ERR = 1 << 6;
        /// End of header.
        const EOH = 1 << 7;
    }
}

/// Largest well-formed header: 2 fixed bytes + 4 byte PTS + 6 byte SCR.
pub const MAX_HEADER_LENGTH: usize = 12;

/// The device SOF counter is 11 bits and wraps at 2048.
pub const SOF_MASK: u16 = 0x7FF;

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("transfer of {0} bytes is too short for a payload header")]
    Truncated(usize),
    #[error("header length {len} exceeds transfer length {transfer}")]
    OverrunsTransfer { len: usize, transfer: usize },
    #[error("header length {len} below minimum {required} for flags {info:?}")]
    Inconsistent {
        len: usize,
        required: usize,
        info: HeaderInfo,
    },
}

/// The scrSourceClock field: a 32-bit source time clock sample and the
/// device's 1 kHz SOF counter at the time the clock was sampled.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C, packed)]
struct ScrField {
    stc: u32,
    sof: u16,
}

unsafe impl plain::Plain for ScrField {}

#[derive(Clone, Copy, Debug)]
pub struct SourceClock {
    pub stc: u32,
    /// Masked to 11 bits; the remaining bits of the wire field are reserved.
    pub sof: u16,
}

#[derive(Clone, Copy, Debug)]
pub struct PayloadHeader {
    /// Total header length, including any padding the device added beyond
    /// the flag-implied fields.
    pub len: usize,
    pub info: HeaderInfo,
    pub pts: Option<u32>,
    pub scr: Option<SourceClock>,
}

impl PayloadHeader {
    pub fn parse(data: &[u8]) -> Result<Self, HeaderError> {
        if data.len() < 2 {
            return Err(HeaderError::Truncated(data.len()));
        }
        let len = usize::from(data[0]);
        let info = HeaderInfo::from_bits_retain(data[1]);

        let mut required = 2;
        if info.contains(HeaderInfo::PTS) {
            required += 4;
        }
        if info.contains(HeaderInfo::SCR) {
            required += 6;
        }
        if len < required {
            return Err(HeaderError::Inconsistent {
                len,
                required,
                info,
            });
        }
        if len > data.len() {
            return Err(HeaderError::OverrunsTransfer {
                len,
                transfer: data.len(),
            });
        }

        let mut offset = 2;
        let pts = if info.contains(HeaderInfo::PTS) {
            let pts = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
            offset += 4;
            Some(pts)
        } else {
            None
        };
        let scr = if info.contains(HeaderInfo::SCR) {
            let mut raw = ScrField::default();
            unsafe { plain::as_mut_bytes(&mut raw) }.copy_from_slice(&data[offset..offset + 6]);
            Some(SourceClock {
                stc: raw.stc,
                sof: raw.sof & SOF_MASK,
            })
        } else {
            None
        };

        Ok(Self {
            len,
            info,
            pts,
            scr,
        })
    }

    pub fn fid(&self) -> bool {
        self.info.contains(HeaderInfo::FID)
    }

    pub fn eof(&self) -> bool {
        self.info.contains(HeaderInfo::EOF)
    }

    pub fn err(&self) -> bool {
        self.info.contains(HeaderInfo::ERR)
    }
}

/// One completed transfer, split into header and payload body.
///
/// Isochronous transports put a header in every transfer. Bulk transports
/// put one header at the start of each payload; a payload spanning several
/// transfers continues headerless.
#[derive(Debug)]
pub enum Payload<'a> {
    Isoch {
        header: PayloadHeader,
        body: &'a [u8],
    },
    BulkFirst {
        header: PayloadHeader,
        body: &'a [u8],
    },
    BulkContinuation {
        body: &'a [u8],
    },
}

impl<'a> Payload<'a> {
    /// Splits a completed transfer. `payload_start` is meaningful for bulk
    /// only and tells whether this transfer begins a new payload.
    pub fn parse(
        endpoint_type: EndpointTy,
        payload_start: bool,
        data: &'a [u8],
    ) -> Result<Self, HeaderError> {
        match endpoint_type {
            EndpointTy::Isoch => {
                let header = PayloadHeader::parse(data)?;
                Ok(Self::Isoch {
                    body: &data[header.len..],
                    header,
                })
            }
            EndpointTy::Bulk if payload_start => {
                let header = PayloadHeader::parse(data)?;
                Ok(Self::BulkFirst {
                    body: &data[header.len..],
                    header,
                })
            }
            EndpointTy::Bulk => Ok(Self::BulkContinuation { body: data }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn minimal_header() {
        let data = [2u8, 0x83, 0xAA, 0xBB];
        let header = PayloadHeader::parse(&data).unwrap();
        assert_eq!(header.len, 2);
        assert!(header.fid());
        assert!(header.eof());
        assert!(header.pts.is_none());
        assert!(header.scr.is_none());
    }

    #[test]
    fn full_header_with_timestamps() {
        let mut data = vec![12u8, 0x8E];
        data.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes()); // PTS
        data.extend_from_slice(&0x1234_5678u32.to_le_bytes()); // STC
        data.extend_from_slice(&0x8801u16.to_le_bytes()); // SOF, upper bits reserved
        data.extend_from_slice(&[1, 2, 3]);

        let header = PayloadHeader::parse(&data).unwrap();
        assert_eq!(header.len, 12);
        assert!(header.eof());
        assert!(!header.fid());
        assert_eq!(header.pts, Some(0xDEAD_BEEF));
        let scr = header.scr.unwrap();
        assert_eq!(scr.stc, 0x1234_5678);
        assert_eq!(scr.sof, 0x001);
    }

    #[test]
    fn padded_header_skips_padding() {
        let data = [12u8, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xEE, 0xFF];
        let header = PayloadHeader::parse(&data).unwrap();
        assert_eq!(header.len, 12);

        let payload = Payload::parse(EndpointTy::Isoch, true, &data).unwrap();
        match payload {
            Payload::Isoch { body, .. } => assert_eq!(body, &[0xEE, 0xFF]),
            _ => panic!("expected isochronous payload"),
        }
    }

    #[test]
    fn truncated_transfer_rejected() {
        assert!(matches!(
            PayloadHeader::parse(&[12]),
            Err(HeaderError::Truncated(1))
        ));
        assert!(matches!(
            PayloadHeader::parse(&[]),
            Err(HeaderError::Truncated(0))
        ));
    }

    #[test]
    fn header_length_below_flag_minimum_rejected() {
        // PTS and SCR flags require 12 bytes but the header claims 2.
        let data = [2u8, 0x8C, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            PayloadHeader::parse(&data),
            Err(HeaderError::Inconsistent { required: 12, .. })
        ));
    }

    #[test]
    fn header_length_beyond_transfer_rejected() {
        let data = [8u8, 0x80, 0, 0];
        assert!(matches!(
            PayloadHeader::parse(&data),
            Err(HeaderError::OverrunsTransfer {
                len: 8,
                transfer: 4
            })
        ));
    }

    #[test]
    fn bulk_continuation_is_all_body() {
        let data = [9u8, 8, 7, 6];
        match Payload::parse(EndpointTy::Bulk, false, &data).unwrap() {
            Payload::BulkContinuation { body } => assert_eq!(body, &data),
            _ => panic!("expected continuation"),
        }
    }
}
