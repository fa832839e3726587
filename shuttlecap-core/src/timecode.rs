//! Wrapping 16-bit timecodes
//!
//! Both streams stamp every block with a 16-bit counter that wraps. Two
//! timecodes are ordered by treating the space as a circle cut in half: `b`
//! follows `a` when it is at most 0x7fff steps ahead.

/// Half of the timecode space
pub const HALF_RANGE: u16 = 0x8000;

/// Whether `a` strictly precedes `b` under wraparound
pub fn timecode_precedes(a: u16, b: u16) -> bool {
    let distance = b.wrapping_sub(a);
    distance != 0 && distance < HALF_RANGE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_ordering() {
        assert!(timecode_precedes(1, 2));
        assert!(!timecode_precedes(2, 1));
        assert!(!timecode_precedes(5, 5));
    }

    #[test]
    fn test_wraparound() {
        assert!(timecode_precedes(0xffff, 0x0000));
        assert!(timecode_precedes(0xfff0, 0x0010));
        assert!(!timecode_precedes(0x0010, 0xfff0));
    }

    #[test]
    fn test_half_space_cut() {
        assert!(timecode_precedes(0, 0x7fff));
        assert!(!timecode_precedes(0, 0x8000));
        assert!(!timecode_precedes(0, 0x8001));
    }
}
