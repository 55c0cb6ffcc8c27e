//! CAN / CAN-FD frame model

use std::fmt;

use errors::{invalid_argument, CanResult};
use serde::{Deserialize, Serialize};

use crate::dlc::{dlc_to_length, length_to_dlc, CLASSIC_MAX_LENGTH, FD_MAX_LENGTH, MAX_DLC};

/// Largest 11-bit identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Largest 29-bit identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Seconds since the Unix epoch, microsecond resolution
pub fn wall_clock_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Bus channel label: a hardware index or a backend specific name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Channel {
    Index(u32),
    Name(String),
}

impl Channel {
    /// Numeric form of the channel
    ///
    /// Names resolve through their trailing digits, so `can0` and `vcan12`
    /// map to 0 and 12. Names without digits have no index.
    pub fn to_index(&self) -> Option<u32> {
        match self {
            Self::Index(index) => Some(*index),
            Self::Name(name) => {
                let digits_at = name
                    .char_indices()
                    .rev()
                    .take_while(|(_, c)| c.is_ascii_digit())
                    .last()
                    .map(|(i, _)| i)?;
                name[digits_at..].parse().ok()
            },
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "{}", index),
            Self::Name(name) => f.write_str(name),
        }
    }
}

impl From<u32> for Channel {
    fn from(index: u32) -> Self {
        Self::Index(index)
    }
}

impl From<&str> for Channel {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Channel {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

/// A single CAN or CAN-FD frame
///
/// Frames are immutable once built: the payload always holds exactly
/// `dlc_to_length(dlc)` bytes, zero padded when the caller supplied fewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    arbitration_id: u32,
    is_extended: bool,
    is_remote: bool,
    is_error: bool,
    is_fd: bool,
    bitrate_switch: bool,
    error_state_indicator: bool,
    dlc: u8,
    data: Vec<u8>,
    timestamp: f64,
    channel: Option<Channel>,
}

impl Frame {
    pub fn builder(arbitration_id: u32) -> FrameBuilder {
        FrameBuilder::new(arbitration_id)
    }

    /// Data frame with the identifier format inferred from the id value
    pub fn new(arbitration_id: u32, data: &[u8]) -> CanResult<Self> {
        Self::builder(arbitration_id).data(data).build()
    }

    /// Data frame with a 29-bit identifier
    pub fn extended(arbitration_id: u32, data: &[u8]) -> CanResult<Self> {
        Self::builder(arbitration_id).extended(true).data(data).build()
    }

    /// CAN-FD data frame with bit rate switching enabled
    pub fn fd(arbitration_id: u32, data: &[u8]) -> CanResult<Self> {
        Self::builder(arbitration_id)
            .fd(true)
            .bitrate_switch(true)
            .data(data)
            .build()
    }

    pub fn arbitration_id(&self) -> u32 {
        self.arbitration_id
    }

    pub fn is_extended(&self) -> bool {
        self.is_extended
    }

    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    pub fn is_error(&self) -> bool {
        self.is_error
    }

    pub fn is_fd(&self) -> bool {
        self.is_fd
    }

    pub fn bitrate_switch(&self) -> bool {
        self.bitrate_switch
    }

    pub fn error_state_indicator(&self) -> bool {
        self.error_state_indicator
    }

    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Seconds since the Unix epoch; zero until a driver or scheduler stamps it
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Stamp the frame with the current wall-clock time
    pub fn stamped_now(self) -> Self {
        self.with_timestamp(wall_clock_now())
    }

    pub fn with_channel(mut self, channel: impl Into<Channel>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Same header, new payload
    pub fn with_data(&self, data: &[u8]) -> CanResult<Self> {
        FrameBuilder {
            dlc: None,
            data: data.to_vec(),
            ..FrameBuilder::from(self)
        }
        .build()
    }

    /// True when both frames have the same identity on the wire
    pub fn same_id(&self, other: &Frame) -> bool {
        self.arbitration_id == other.arbitration_id && self.is_extended == other.is_extended
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp: {:>15.6}    ", self.timestamp)?;
        if self.is_extended {
            write!(f, "ID: {:08x}    X ", self.arbitration_id)?;
        } else {
            write!(f, "ID: {:04x}    S ", self.arbitration_id)?;
        }
        let flags = [
            (self.is_error, 'E'),
            (self.is_remote, 'R'),
            (self.is_fd, 'F'),
            (self.bitrate_switch, 'B'),
            (self.error_state_indicator, 'I'),
        ];
        for (set, flag) in flags {
            if set {
                write!(f, "{}", flag)?;
            } else {
                f.write_str(" ")?;
            }
        }
        write!(f, "    DL: {:2}", self.dlc)?;
        if !self.is_remote && !self.data.is_empty() {
            f.write_str("   ")?;
            for byte in &self.data {
                write!(f, " {:02x}", byte)?;
            }
        }
        if let Some(channel) = &self.channel {
            write!(f, "    Channel: {}", channel)?;
        }
        Ok(())
    }
}

/// Validating constructor for [`Frame`]
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    arbitration_id: u32,
    is_extended: Option<bool>,
    is_remote: bool,
    is_error: bool,
    is_fd: bool,
    bitrate_switch: bool,
    error_state_indicator: bool,
    dlc: Option<u8>,
    data: Vec<u8>,
    timestamp: f64,
    channel: Option<Channel>,
}

impl FrameBuilder {
    pub fn new(arbitration_id: u32) -> Self {
        Self {
            arbitration_id,
            is_extended: None,
            is_remote: false,
            is_error: false,
            is_fd: false,
            bitrate_switch: false,
            error_state_indicator: false,
            dlc: None,
            data: Vec::new(),
            timestamp: 0.0,
            channel: None,
        }
    }

    /// Force the identifier format. Unset means "extended when the id needs it".
    pub fn extended(mut self, extended: bool) -> Self {
        self.is_extended = Some(extended);
        self
    }

    pub fn remote(mut self, remote: bool) -> Self {
        self.is_remote = remote;
        self
    }

    pub fn error_frame(mut self, error: bool) -> Self {
        self.is_error = error;
        self
    }

    pub fn fd(mut self, fd: bool) -> Self {
        self.is_fd = fd;
        self
    }

    pub fn bitrate_switch(mut self, brs: bool) -> Self {
        self.bitrate_switch = brs;
        self
    }

    pub fn error_state_indicator(mut self, esi: bool) -> Self {
        self.error_state_indicator = esi;
        self
    }

    /// Explicit DLC; derived from the payload length when omitted
    pub fn dlc(mut self, dlc: u8) -> Self {
        self.dlc = Some(dlc);
        self
    }

    pub fn data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn channel(mut self, channel: impl Into<Channel>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn build(self) -> CanResult<Frame> {
        let is_extended = self
            .is_extended
            .unwrap_or(self.arbitration_id > MAX_STANDARD_ID);
        let id_limit = if is_extended {
            MAX_EXTENDED_ID
        } else {
            MAX_STANDARD_ID
        };
        if self.arbitration_id > id_limit {
            return Err(invalid_argument!(
                "arbitration id 0x{:X} exceeds 0x{:X}",
                self.arbitration_id,
                id_limit
            ));
        }

        if !self.is_fd && (self.bitrate_switch || self.error_state_indicator) {
            return Err(invalid_argument!(
                "bitrate switch and error state indicator require a CAN-FD frame"
            ));
        }
        if self.is_remote {
            if self.is_fd {
                return Err(invalid_argument!("CAN-FD has no remote frames"));
            }
            if !self.data.is_empty() {
                return Err(invalid_argument!("remote frames carry no payload"));
            }
        }

        let max_length = if self.is_fd {
            FD_MAX_LENGTH
        } else {
            CLASSIC_MAX_LENGTH
        };
        if self.data.len() > max_length {
            return Err(invalid_argument!(
                "payload of {} bytes exceeds {} bytes",
                self.data.len(),
                max_length
            ));
        }

        let dlc = match self.dlc {
            Some(dlc) if dlc > MAX_DLC => {
                return Err(invalid_argument!("DLC {} out of range 0..=15", dlc));
            },
            Some(dlc) => dlc,
            None => length_to_dlc(self.data.len()),
        };
        if !self.is_fd && dlc as usize > CLASSIC_MAX_LENGTH {
            return Err(invalid_argument!(
                "DLC {} needs a CAN-FD frame, classic CAN stops at 8",
                dlc
            ));
        }

        let length = dlc_to_length(dlc);
        if self.data.len() > length {
            return Err(invalid_argument!(
                "payload of {} bytes does not fit DLC {} ({} bytes)",
                self.data.len(),
                dlc,
                length
            ));
        }
        let mut data = self.data;
        data.resize(length, 0);

        Ok(Frame {
            arbitration_id: self.arbitration_id,
            is_extended,
            is_remote: self.is_remote,
            is_error: self.is_error,
            is_fd: self.is_fd,
            bitrate_switch: self.bitrate_switch,
            error_state_indicator: self.error_state_indicator,
            dlc,
            data,
            timestamp: self.timestamp,
            channel: self.channel,
        })
    }
}

impl From<&Frame> for FrameBuilder {
    fn from(frame: &Frame) -> Self {
        Self {
            arbitration_id: frame.arbitration_id,
            is_extended: Some(frame.is_extended),
            is_remote: frame.is_remote,
            is_error: frame.is_error,
            is_fd: frame.is_fd,
            bitrate_switch: frame.bitrate_switch,
            error_state_indicator: frame.error_state_indicator,
            dlc: Some(frame.dlc),
            data: frame.data.clone(),
            timestamp: frame.timestamp,
            channel: frame.channel.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use errors::CanError;

    #[test]
    fn test_standard_frame() {
        let frame = Frame::new(0x123, &[0x01, 0x02, 0x03]).unwrap();
        assert_eq!(frame.arbitration_id(), 0x123);
        assert!(!frame.is_extended());
        assert!(!frame.is_fd());
        assert_eq!(frame.dlc(), 3);
        assert_eq!(frame.data(), &[0x01, 0x02, 0x03]);
        assert_eq!(frame.timestamp(), 0.0);
    }

    #[test]
    fn test_extended_inferred_from_id() {
        let frame = Frame::new(0x1234_5678, &[]).unwrap();
        assert!(frame.is_extended());

        let forced = Frame::extended(0x10, &[0xAA]).unwrap();
        assert!(forced.is_extended());
    }

    #[test]
    fn test_id_range_checked() {
        let err = Frame::builder(0x800).extended(false).build().unwrap_err();
        assert!(matches!(err, CanError::InvalidArgument(_)));

        let err = Frame::new(0x2000_0000, &[]).unwrap_err();
        assert!(matches!(err, CanError::InvalidArgument(_)));
    }

    #[test]
    fn test_payload_padded_to_dlc() {
        let frame = Frame::builder(0x10)
            .fd(true)
            .data(vec![1u8; 10])
            .build()
            .unwrap();
        assert_eq!(frame.dlc(), 9);
        assert_eq!(frame.data().len(), 12);
        assert_eq!(&frame.data()[10..], &[0, 0]);

        let frame = Frame::builder(0x10).dlc(4).data(vec![7u8]).build().unwrap();
        assert_eq!(frame.data(), &[7, 0, 0, 0]);
    }

    #[test]
    fn test_classic_frame_limits() {
        let err = Frame::new(0x10, &[0u8; 9]).unwrap_err();
        assert!(matches!(err, CanError::InvalidArgument(_)));

        let err = Frame::builder(0x10).dlc(9).build().unwrap_err();
        assert!(matches!(err, CanError::InvalidArgument(_)));

        let err = Frame::builder(0x10).dlc(16).fd(true).build().unwrap_err();
        assert!(matches!(err, CanError::InvalidArgument(_)));

        let err = Frame::builder(0x10).dlc(2).data(vec![0u8; 3]).build().unwrap_err();
        assert!(matches!(err, CanError::InvalidArgument(_)));
    }

    #[test]
    fn test_fd_flags_need_fd() {
        let err = Frame::builder(0x10).bitrate_switch(true).build().unwrap_err();
        assert!(matches!(err, CanError::InvalidArgument(_)));

        let frame = Frame::fd(0x10, &[0u8; 64]).unwrap();
        assert_eq!(frame.dlc(), 15);
        assert!(frame.bitrate_switch());
    }

    #[test]
    fn test_remote_frame() {
        let frame = Frame::builder(0x7FF).remote(true).dlc(2).build().unwrap();
        assert!(frame.is_remote());
        assert_eq!(frame.dlc(), 2);
        assert_eq!(frame.data().len(), 2);

        assert!(Frame::builder(0x7FF).remote(true).data(vec![1]).build().is_err());
        assert!(Frame::builder(0x7FF).remote(true).fd(true).build().is_err());
    }

    #[test]
    fn test_with_data_keeps_header() {
        let frame = Frame::extended(0x18FF_0001, &[1, 2, 3, 4])
            .unwrap()
            .with_channel("can1");
        let changed = frame.with_data(&[9, 9]).unwrap();
        assert!(changed.same_id(&frame));
        assert_eq!(changed.dlc(), 2);
        assert_eq!(changed.channel(), Some(&Channel::from("can1")));
    }

    #[test]
    fn test_channel_index() {
        assert_eq!(Channel::from(3).to_index(), Some(3));
        assert_eq!(Channel::from("can0").to_index(), Some(0));
        assert_eq!(Channel::from("vcan12").to_index(), Some(12));
        assert_eq!(Channel::from("PCAN_USBBUS1").to_index(), Some(1));
        assert_eq!(Channel::from("virtual").to_index(), None);
    }

    #[test]
    fn test_display() {
        let frame = Frame::new(0x123, &[0xDE, 0xAD]).unwrap().with_channel(0);
        let text = frame.to_string();
        assert!(text.contains("ID: 0123"));
        assert!(text.contains("de ad"));
        assert!(text.contains("Channel: 0"));
    }

    #[test]
    fn test_stamped_now() {
        let frame = Frame::new(0x1, &[]).unwrap().stamped_now();
        assert!(frame.timestamp() > 1_600_000_000.0);
    }
}
