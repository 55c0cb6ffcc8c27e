//! CAN-FD data length code table

/// Payload length for each DLC value 0..=15
pub const CAN_FD_DLC: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

/// Largest DLC a frame can carry
pub const MAX_DLC: u8 = 15;

/// Largest payload of a classic CAN frame
pub const CLASSIC_MAX_LENGTH: usize = 8;

/// Largest payload of a CAN-FD frame
pub const FD_MAX_LENGTH: usize = 64;

/// Payload length encoded by `dlc`. Values above 15 saturate to 64 bytes.
pub const fn dlc_to_length(dlc: u8) -> usize {
    if dlc > MAX_DLC {
        FD_MAX_LENGTH
    } else {
        CAN_FD_DLC[dlc as usize]
    }
}

/// Smallest DLC whose payload holds `length` bytes, clamped to 15
pub fn length_to_dlc(length: usize) -> u8 {
    CAN_FD_DLC
        .iter()
        .position(|&n| n >= length)
        .map_or(MAX_DLC, |dlc| dlc as u8)
}
